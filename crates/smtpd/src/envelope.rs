use crate::peer::Peer;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// One message in flight on a session: the MAIL FROM sender, the
/// accepted RCPT TO addresses in arrival order (duplicates preserved),
/// and the DATA payload.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Envelope {
    /// Empty for bounce messages.
    pub sender: String,
    pub recipients: Vec<String>,
    pub data: Vec<u8>,
}

impl Envelope {
    pub fn new<S: Into<String>>(sender: S) -> Self {
        Self {
            sender: sender.into(),
            recipients: vec![],
            data: vec![],
        }
    }

    /// Prepend the trace header documenting this relay hop.
    pub fn add_received_line(&mut self, peer: &Peer) {
        let line = format!(
            "Received: from {} ({}) by {} with {}; {}\r\n",
            peer.helo_name,
            peer.addr,
            peer.server_name,
            peer.protocol,
            Utc::now().to_rfc2822(),
        );

        let mut data = Vec::with_capacity(line.len() + self.data.len());
        data.extend_from_slice(line.as_bytes());
        data.append(&mut self.data);
        self.data = data;
    }
}

/// Token reported to the client in the final DATA reply.
pub(crate) fn generate_queue_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::peer::Protocol;
    use k9::assert_equal;

    fn peer() -> Peer {
        Peer {
            addr: "192.0.2.7:4225".parse().unwrap(),
            tls: None,
            helo_name: "client.example.com".to_string(),
            username: String::new(),
            password: String::new(),
            protocol: Protocol::Esmtp,
            server_name: "mx.example.com".to_string(),
        }
    }

    #[test]
    fn received_line_is_prepended_once() {
        let mut envelope = Envelope::new("sender@example.com");
        envelope.data = b"Subject: hi\r\n\r\nhello\r\n".to_vec();
        envelope.add_received_line(&peer());

        let text = String::from_utf8(envelope.data.clone()).unwrap();
        assert!(
            text.starts_with(
                "Received: from client.example.com (192.0.2.7:4225) \
                 by mx.example.com with ESMTP; "
            ),
            "{text}"
        );
        assert!(text.ends_with("Subject: hi\r\n\r\nhello\r\n"), "{text}");
        assert_equal!(text.matches("Received:").count(), 1);
    }

    #[test]
    fn queue_ids_are_unique() {
        let a = generate_queue_id();
        let b = generate_queue_id();
        assert_equal!(a.len(), 32);
        assert!(a != b);
    }
}
