use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// The protocol level negotiated by the client's greeting.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
pub enum Protocol {
    Smtp,
    Esmtp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Smtp => "SMTP",
            Self::Esmtp => "ESMTP",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str(self.as_str())
    }
}

/// Negotiated TLS session parameters, recorded into the peer once a
/// STARTTLS handshake completes.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsInformation {
    pub protocol_version: String,
    pub cipher: String,
    pub sni_server_name: Option<String>,
}

/// The remote party of one SMTP session.
///
/// Most fields start out empty and are filled in by the session as the
/// dialogue progresses: HELO/EHLO set `helo_name` and `protocol`, a
/// successful AUTH sets `username`/`password`, a successful STARTTLS
/// sets `tls`. XCLIENT and the PROXY protocol may rewrite `addr` and
/// the identity fields when a trusted front-end sits in between.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Peer {
    /// Network address of the remote party.
    pub addr: SocketAddr,
    /// TLS session details, if the connection has been upgraded.
    pub tls: Option<TlsInformation>,
    /// Name the client claimed in HELO/EHLO.
    pub helo_name: String,
    /// Username from a successful AUTH, otherwise empty.
    pub username: String,
    /// Password from a successful AUTH, otherwise empty.
    pub password: String,
    pub protocol: Protocol,
    /// Copy of the server hostname, for trace headers.
    pub server_name: String,
}
