use crate::envelope::{generate_queue_id, Envelope};
use crate::error::Rejection;
use crate::handlers::SessionContext;
use crate::io::{BoxedAsyncReadAndWrite, ReadError, SmtpStream};
use crate::parser::{parse_proxy_header, Command, EsmtpParameter};
use crate::peer::{Peer, Protocol, TlsInformation};
use crate::server::Server;
use data_encoding::BASE64;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

/// Sentinel telling the dispatch loop to stop. The socket teardown
/// (flush, linger, shutdown) happens once, in `run`.
pub(crate) struct Terminate;

/// One SMTP session: owns the connection and drives the dialogue from
/// greeting to close. Commands within a session are strictly serial;
/// concurrency only exists across sessions.
pub(crate) struct Session {
    server: Arc<Server>,
    cx: SessionContext,
    stream: SmtpStream,
    peer: Peer,
    envelope: Option<Envelope>,
    tls_active: bool,
}

impl Session {
    pub fn new(server: Arc<Server>, socket: BoxedAsyncReadAndWrite, cx: SessionContext) -> Self {
        let peer = Peer {
            addr: cx.remote_addr,
            tls: None,
            helo_name: String::new(),
            username: String::new(),
            password: String::new(),
            protocol: Protocol::Smtp,
            server_name: server.hostname.clone(),
        };
        Self {
            server,
            cx,
            stream: SmtpStream::new(socket),
            peer,
            envelope: None,
            tls_active: false,
        }
    }

    pub async fn run(mut self) {
        let _ = self.run_protocol().await;
        self.stream.close(self.server.timeouts.shutdown_linger).await;
    }

    /// Refuse the connection with 421; used when the concurrency cap
    /// is reached.
    pub async fn reject_busy(mut self) {
        let _ = self.reject(Rejection::busy()).await;
        self.stream.close(self.server.timeouts.shutdown_linger).await;
    }

    async fn run_protocol(&mut self) -> Result<(), Terminate> {
        if self.server.enable_proxy_protocol {
            self.handle_proxy_handshake().await?;
        }

        self.welcome().await?;

        loop {
            let read_timeout = self.server.timeouts.read_timeout;
            let line = match self.stream.read_line(read_timeout).await {
                Ok(line) => line,
                Err(ReadError::LineTooLong) => {
                    self.reject(Rejection::line_too_long()).await?;
                    // Implicit RSET; the client starts the transaction over.
                    self.envelope = None;
                    continue;
                }
                Err(err) => {
                    tracing::debug!("{}: session ended: {err:#}", self.peer.addr);
                    return Err(Terminate);
                }
            };

            let line = String::from_utf8_lossy(&line).into_owned();
            let line = line.trim_end();
            tracing::trace!("recv<-{}: {line}", self.peer.addr);
            self.handle(line).await?;
        }
    }

    /// Run the connection checker and emit the 220 banner. Also re-run
    /// after XCLIENT so policy sees the rewritten peer.
    async fn welcome(&mut self) -> Result<(), Terminate> {
        let checker = self.server.connection_checker.clone();
        if let Some(checker) = checker {
            if let Err(err) = checker.check_connection(&self.cx, &self.peer).await {
                self.report_error(&err).await?;
                return Err(Terminate);
            }
        }

        let banner = match &self.server.welcome_message {
            Some(message) => message.clone(),
            None => format!("{} ESMTP ready.", self.server.hostname),
        };
        self.reply(220, &banner).await
    }

    async fn handle(&mut self, line: &str) -> Result<(), Terminate> {
        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(err) => {
                return self
                    .reject(Rejection::syntax(format!(
                        "Syntax error in command or arguments: {err}"
                    )))
                    .await;
            }
        };

        if self.server.force_tls && !self.tls_active && !command.allowed_before_tls() {
            return self.reject(Rejection::tls_required()).await;
        }

        match command {
            Command::Ehlo(name) => self.handle_helo(name, Protocol::Esmtp).await,
            Command::Helo(name) => self.handle_helo(name, Protocol::Smtp).await,
            Command::MailFrom {
                address,
                parameters,
            } => self.handle_mail(address, parameters).await,
            Command::RcptTo { address, .. } => self.handle_rcpt(address).await,
            Command::Data => self.handle_data().await,
            Command::StartTls => self.handle_starttls().await,
            Command::Auth {
                mechanism,
                initial_response,
            } => self.handle_auth(mechanism, initial_response).await,
            Command::Xclient(attrs) => self.handle_xclient(attrs).await,
            Command::Rset => {
                self.envelope = None;
                self.reply(250, "Go ahead").await
            }
            Command::Noop => self.reply(250, "Go ahead").await,
            Command::Vrfy(_) => {
                self.reply(252, "Cannot VRFY user, but will accept message")
                    .await
            }
            Command::Help => {
                self.reply(
                    214,
                    "Commands: HELO EHLO MAIL RCPT DATA RSET NOOP VRFY STARTTLS AUTH QUIT",
                )
                .await
            }
            Command::Quit => {
                self.reply(221, "OK, bye").await?;
                Err(Terminate)
            }
            Command::Unknown(_) => self.reject(Rejection::unsupported_command()).await,
        }
    }

    async fn handle_helo(&mut self, name: String, protocol: Protocol) -> Result<(), Terminate> {
        let checker = self.server.helo_checker.clone();
        if let Some(checker) = checker {
            if let Err(err) = checker.check_helo(&self.cx, &self.peer, &name).await {
                self.report_error(&err).await?;
                // Greeting rejections are terminal.
                return Err(Terminate);
            }
        }

        self.peer.helo_name = name.clone();
        self.peer.protocol = protocol;
        self.envelope = None;

        match protocol {
            Protocol::Smtp => {
                let message = format!("{} Hello {name}", self.server.hostname);
                self.reply(250, &message).await
            }
            Protocol::Esmtp => {
                let mut message = format!("{} Hello {name}", self.server.hostname);
                for extension in self.extensions() {
                    message.push('\n');
                    message.push_str(&extension);
                }
                self.reply(250, &message).await
            }
        }
    }

    fn extensions(&self) -> Vec<String> {
        let mut extensions = vec![
            format!("SIZE {}", self.server.max_message_size),
            "8BITMIME".to_string(),
            "PIPELINING".to_string(),
        ];

        if self.server.enable_xclient {
            extensions.push("XCLIENT".to_string());
        }

        if self.server.tls_config.is_some() && !self.tls_active {
            extensions.push("STARTTLS".to_string());
        }

        if self.server.authenticator.is_some() && self.tls_active {
            extensions.push("AUTH PLAIN LOGIN".to_string());
        }

        extensions
    }

    async fn handle_mail(
        &mut self,
        address: String,
        parameters: Vec<EsmtpParameter>,
    ) -> Result<(), Terminate> {
        if self.peer.helo_name.is_empty() {
            return self
                .reject(Rejection::bad_sequence("Please introduce yourself first."))
                .await;
        }
        if self.envelope.is_some() {
            return self
                .reject(Rejection::bad_sequence("Duplicate MAIL FROM."))
                .await;
        }

        for parameter in &parameters {
            match parameter.name.as_str() {
                "SIZE" => {
                    let declared = parameter
                        .value
                        .as_deref()
                        .and_then(|value| value.parse::<usize>().ok());
                    match declared {
                        Some(size) if size > self.server.max_message_size => {
                            return self.reject(Rejection::too_big()).await;
                        }
                        Some(_) => {}
                        None => {
                            return self
                                .reject(Rejection::syntax("Malformed SIZE parameter."))
                                .await;
                        }
                    }
                }
                // 7BIT and 8BITMIME payloads are both passed through
                // unmodified, so BODY needs no handling.
                "BODY" => {}
                _ => {}
            }
        }

        let checker = self.server.sender_checker.clone();
        if let Some(checker) = checker {
            if let Err(err) = checker.check_sender(&self.cx, &self.peer, &address).await {
                return self.report_error(&err).await;
            }
        }

        self.envelope = Some(Envelope::new(address));
        self.reply(250, "Go ahead").await
    }

    async fn handle_rcpt(&mut self, address: String) -> Result<(), Terminate> {
        match &self.envelope {
            None => {
                return self
                    .reject(Rejection::bad_sequence("Missing MAIL FROM command."))
                    .await;
            }
            Some(envelope) if envelope.recipients.len() >= self.server.max_recipients => {
                return self.reject(Rejection::too_many_recipients()).await;
            }
            Some(_) => {}
        }

        let checker = self.server.recipient_checker.clone();
        if let Some(checker) = checker {
            if let Err(err) = checker.check_recipient(&self.cx, &self.peer, &address).await {
                return self.report_error(&err).await;
            }
        }

        self.envelope
            .as_mut()
            .expect("checked state above")
            .recipients
            .push(address);
        self.reply(250, "Go ahead").await
    }

    async fn handle_data(&mut self) -> Result<(), Terminate> {
        match &self.envelope {
            None => {
                return self
                    .reject(Rejection::bad_sequence("Missing MAIL FROM command."))
                    .await;
            }
            Some(envelope) if envelope.recipients.is_empty() => {
                return self
                    .reject(Rejection::bad_sequence("Missing RCPT TO command."))
                    .await;
            }
            Some(_) => {}
        }

        self.reply(354, "Go ahead. End your data with <CR><LF>.<CR><LF>")
            .await?;

        let data_timeout = self.server.timeouts.data_timeout;
        let max_message_size = self.server.max_message_size;
        let mut data: Vec<u8> = vec![];
        let mut too_big = false;

        loop {
            let line = match self.stream.read_line(data_timeout).await {
                Ok(line) => line,
                Err(ReadError::LineTooLong) => {
                    // Same recovery as the command loop: report, drop
                    // the transaction, let the client start over.
                    self.envelope = None;
                    return self.reject(Rejection::line_too_long()).await;
                }
                Err(err) => {
                    tracing::debug!("{}: session ended in DATA: {err:#}", self.peer.addr);
                    return Err(Terminate);
                }
            };

            if line == b"." {
                break;
            }
            if too_big {
                continue;
            }

            // RFC 5321 4.5.2: strip the transparency dot the client
            // prefixed to lines starting with one.
            let line = line.strip_prefix(b".").unwrap_or(&line);

            if data.len() + line.len() + 2 > max_message_size {
                // Keep consuming to the terminator so the client reads
                // our refusal instead of desyncing mid-payload.
                too_big = true;
                data.clear();
                continue;
            }
            data.extend_from_slice(line);
            data.extend_from_slice(b"\r\n");
        }

        if too_big {
            self.envelope = None;
            return self.reject(Rejection::too_big()).await;
        }

        let mut envelope = self.envelope.take().expect("checked state above");
        envelope.data = data;
        envelope.add_received_line(&self.peer);

        let handler = self.server.handler.clone();
        let delivery = match handler {
            Some(handler) => handler.handle(&self.cx, &self.peer, envelope).await,
            None => Ok(()),
        };
        match delivery {
            Ok(()) => {
                let queue_id = generate_queue_id();
                self.reply(250, &format!("2.0.0 Ok: queued as {queue_id}"))
                    .await
            }
            Err(err) => self.report_error(&err).await,
        }
    }

    async fn handle_starttls(&mut self) -> Result<(), Terminate> {
        if self.tls_active {
            return self.reply(502, "Already running in TLS").await;
        }
        let Some(tls_config) = self.server.tls_config.clone() else {
            return self.reply(502, "TLS not supported").await;
        };

        self.reply(220, "Go ahead").await?;

        let Some(socket) = self.stream.take_socket() else {
            return Err(Terminate);
        };
        let acceptor = TlsAcceptor::from(tls_config);
        let handshake_timeout = self.server.timeouts.read_timeout;
        let tls_stream = match timeout(handshake_timeout, acceptor.accept(socket)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                tracing::debug!("{}: TLS handshake failed: {err:#}", self.peer.addr);
                return Err(Terminate);
            }
            Err(_) => {
                tracing::debug!(
                    "{}: TLS handshake timed out after {handshake_timeout:?}",
                    self.peer.addr
                );
                return Err(Terminate);
            }
        };

        let (_, conn) = tls_stream.get_ref();
        let tls_info = TlsInformation {
            protocol_version: match conn.protocol_version() {
                Some(version) => version.as_str().unwrap_or("UNKNOWN").to_string(),
                None => String::new(),
            },
            cipher: match conn.negotiated_cipher_suite() {
                Some(suite) => suite.suite().as_str().unwrap_or("UNKNOWN").to_string(),
                None => String::new(),
            },
            sni_server_name: conn.server_name().map(|name| name.to_string()),
        };

        self.stream.replace_socket(Box::new(tls_stream));
        self.tls_active = true;
        self.peer.tls = Some(tls_info);
        // The client negotiates the session from scratch on the
        // encrypted channel.
        self.peer.helo_name.clear();
        self.envelope = None;
        Ok(())
    }

    async fn handle_auth(
        &mut self,
        mechanism: String,
        initial_response: Option<String>,
    ) -> Result<(), Terminate> {
        if self.server.authenticator.is_none() {
            return self.reply(502, "AUTH not supported.").await;
        }
        if !self.tls_active {
            return self
                .reply(502, "Cannot AUTH in plain text mode. Use STARTTLS.")
                .await;
        }
        if self.peer.helo_name.is_empty() {
            return self
                .reject(Rejection::bad_sequence("Please introduce yourself first."))
                .await;
        }

        let credentials = match mechanism.as_str() {
            "PLAIN" => self.auth_plain(initial_response).await?,
            "LOGIN" => self.auth_login(initial_response).await?,
            _ => {
                return self
                    .reply(502, &format!("Unknown authentication mechanism {mechanism}."))
                    .await;
            }
        };
        let Some((username, password)) = credentials else {
            // The sub-dialogue already reported the problem.
            return Ok(());
        };

        let authenticator = self.server.authenticator.clone().expect("checked above");
        match authenticator
            .authenticate(&self.cx, &self.peer, &username, &password)
            .await
        {
            Ok(()) => {
                self.peer.username = username;
                self.peer.password = password;
                // Any transaction from before the identity change is void.
                self.envelope = None;
                self.reply(235, "2.7.0 Authentication successful").await
            }
            Err(err) => match err.downcast_ref::<Rejection>() {
                Some(rejection) => self.reject(rejection.clone()).await,
                None => self.reject(Rejection::auth_failed()).await,
            },
        }
    }

    /// PLAIN: a single base64 blob, either inline on the AUTH command
    /// or in response to an empty 334 prompt (RFC 4616).
    async fn auth_plain(
        &mut self,
        initial_response: Option<String>,
    ) -> Result<Option<(String, String)>, Terminate> {
        let payload = match initial_response {
            Some(payload) => payload,
            None => match self.auth_continuation("").await? {
                Some(line) => line,
                None => return Ok(None),
            },
        };

        let Ok(decoded) = BASE64.decode(payload.as_bytes()) else {
            self.reject(Rejection::syntax("Couldn't decode your credentials."))
                .await?;
            return Ok(None);
        };

        // [authzid] NUL authcid NUL passwd; the authzid is ignored.
        let mut fields = decoded.split(|&b| b == 0);
        let (Some(_authzid), Some(username), Some(password), None) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            self.reject(Rejection::syntax("Couldn't decode your credentials."))
                .await?;
            return Ok(None);
        };

        Ok(Some((
            String::from_utf8_lossy(username).into_owned(),
            String::from_utf8_lossy(password).into_owned(),
        )))
    }

    /// LOGIN: base64 username and password, each behind its own 334
    /// prompt. Some clients put the username on the AUTH line itself.
    async fn auth_login(
        &mut self,
        initial_response: Option<String>,
    ) -> Result<Option<(String, String)>, Terminate> {
        let username_b64 = match initial_response {
            Some(b64) => b64,
            None => match self.auth_continuation("VXNlcm5hbWU6").await? {
                Some(line) => line,
                None => return Ok(None),
            },
        };
        let Some(password_b64) = self.auth_continuation("UGFzc3dvcmQ6").await? else {
            return Ok(None);
        };

        let (Ok(username), Ok(password)) = (
            BASE64.decode(username_b64.as_bytes()),
            BASE64.decode(password_b64.as_bytes()),
        ) else {
            self.reject(Rejection::syntax("Couldn't decode your credentials."))
                .await?;
            return Ok(None);
        };

        Ok(Some((
            String::from_utf8_lossy(&username).into_owned(),
            String::from_utf8_lossy(&password).into_owned(),
        )))
    }

    /// Send a 334 challenge and read the client's response line.
    /// `None` means the exchange ended (cancel or overlong line) and a
    /// reply has already been written.
    async fn auth_continuation(&mut self, prompt: &str) -> Result<Option<String>, Terminate> {
        self.reply(334, prompt).await?;

        let read_timeout = self.server.timeouts.read_timeout;
        let line = match self.stream.read_line(read_timeout).await {
            Ok(line) => String::from_utf8_lossy(&line).into_owned(),
            Err(ReadError::LineTooLong) => {
                self.reject(Rejection::line_too_long()).await?;
                return Ok(None);
            }
            Err(err) => {
                tracing::debug!("{}: session ended in AUTH: {err:#}", self.peer.addr);
                return Err(Terminate);
            }
        };
        let line = line.trim().to_string();
        tracing::trace!("recv<-{}: {line}", self.peer.addr);

        if line == "*" {
            self.reject(Rejection::auth_cancelled()).await?;
            return Ok(None);
        }
        Ok(Some(line))
    }

    async fn handle_xclient(&mut self, attrs: Vec<(String, String)>) -> Result<(), Terminate> {
        if !self.server.enable_xclient {
            return self.reply(550, "XCLIENT not enabled").await;
        }

        let mut new_ip = None;
        let mut new_port = None;
        let mut new_helo = None;
        let mut new_proto = None;
        let mut new_username = None;

        for (name, value) in attrs {
            // The standard placeholders mean "no information"; leave
            // the attribute untouched.
            if value.eq_ignore_ascii_case("[UNAVAILABLE]")
                || value.eq_ignore_ascii_case("[TEMPUNAVAIL]")
            {
                continue;
            }
            match name.as_str() {
                "NAME" => {}
                "ADDR" => {
                    let literal = value.strip_prefix("IPV6:").unwrap_or(&value);
                    match literal.parse::<std::net::IpAddr>() {
                        Ok(ip) => new_ip = Some(ip),
                        Err(_) => {
                            return self
                                .reject(Rejection::syntax(format!("Invalid ADDR: {value}")))
                                .await;
                        }
                    }
                }
                "PORT" => match value.parse::<u16>() {
                    Ok(port) => new_port = Some(port),
                    Err(_) => {
                        return self
                            .reject(Rejection::syntax(format!("Invalid PORT: {value}")))
                            .await;
                    }
                },
                "PROTO" => match value.to_ascii_uppercase().as_str() {
                    "SMTP" => new_proto = Some(Protocol::Smtp),
                    "ESMTP" => new_proto = Some(Protocol::Esmtp),
                    _ => {
                        return self
                            .reject(Rejection::syntax(format!("Invalid PROTO: {value}")))
                            .await;
                    }
                },
                "HELO" => new_helo = Some(value),
                "LOGIN" => new_username = Some(value),
                _ => {
                    return self
                        .reject(Rejection::syntax(format!("Unknown XCLIENT attribute: {name}")))
                        .await;
                }
            }
        }

        // Nothing is applied until the whole attribute list has
        // validated; a rejected XCLIENT leaves the peer untouched.
        if let Some(ip) = new_ip {
            let port = new_port.unwrap_or_else(|| self.peer.addr.port());
            self.peer.addr = SocketAddr::new(ip, port);
        }
        if let Some(protocol) = new_proto {
            self.peer.protocol = protocol;
        }
        if let Some(username) = new_username {
            self.peer.username = username;
        }
        match new_helo {
            Some(helo) => self.peer.helo_name = helo,
            // Without a HELO attribute the client has to re-identify
            // against the rewritten peer.
            None => self.peer.helo_name.clear(),
        }
        self.envelope = None;

        // Greet the rewritten peer from the top, connection checks
        // included.
        self.welcome().await
    }

    /// With the proxy protocol enabled, the very first line of the
    /// connection carries the original client address; nothing is sent
    /// to the client before it has been parsed.
    async fn handle_proxy_handshake(&mut self) -> Result<(), Terminate> {
        let read_timeout = self.server.timeouts.read_timeout;
        let line = match self.stream.read_line(read_timeout).await {
            Ok(line) => String::from_utf8_lossy(&line).into_owned(),
            Err(err) => {
                tracing::debug!("{}: no PROXY header: {err:#}", self.peer.addr);
                return Err(Terminate);
            }
        };
        tracing::trace!("recv<-{}: {line}", self.peer.addr);

        match parse_proxy_header(&line) {
            Ok(source) => {
                self.peer.addr = source;
                Ok(())
            }
            Err(err) => {
                self.reply(500, &format!("Invalid PROXY header: {err}"))
                    .await?;
                Err(Terminate)
            }
        }
    }

    async fn reply(&mut self, code: u16, message: &str) -> Result<(), Terminate> {
        let mut text = String::new();
        if message.is_empty() {
            // Bare continuation prompts still need the space separator.
            text.push_str(&format!("{code} \r\n"));
        } else {
            let mut lines = message.lines().peekable();
            while let Some(line) = lines.next() {
                let sep = if lines.peek().is_none() { ' ' } else { '-' };
                text.push_str(&format!("{code}{sep}{line}\r\n"));
            }
        }

        tracing::trace!("send->{}: {}", self.peer.addr, text.trim_end());

        let write_timeout = self.server.timeouts.write_timeout;
        match self.stream.write_all(write_timeout, text.as_bytes()).await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::debug!("{}: write failed: {err:#}", self.peer.addr);
                Err(Terminate)
            }
        }
    }

    async fn reject(&mut self, rejection: Rejection) -> Result<(), Terminate> {
        self.reply(rejection.code, &rejection.message).await
    }

    /// Translate a checker/handler error to a wire reply: a typed
    /// [`Rejection`] goes out verbatim, anything else widens to 502.
    async fn report_error(&mut self, err: &anyhow::Error) -> Result<(), Terminate> {
        match err.downcast_ref::<Rejection>() {
            Some(rejection) => self.reject(rejection.clone()).await,
            None => self.reply(502, &format!("{err:#}")).await,
        }
    }
}
