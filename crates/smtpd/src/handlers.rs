use crate::envelope::Envelope;
use crate::peer::Peer;
use async_trait::async_trait;
use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;

/// Per-connection context handed to every capability.
///
/// `local_addr` identifies the listener the connection arrived on,
/// which is useful when one handler serves several listeners.
/// `user_data` is whatever the `ConnContext` capability attached before
/// the session started.
#[derive(Clone)]
pub struct SessionContext {
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub user_data: Option<Arc<dyn Any + Send + Sync>>,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("SessionContext")
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

/// Called once per connection before the banner is sent. An error
/// rejects the connection and closes it.
#[async_trait]
pub trait ConnectionChecker: Send + Sync {
    async fn check_connection(&self, cx: &SessionContext, peer: &Peer) -> anyhow::Result<()>;
}

/// Called after HELO/EHLO. An error rejects the greeting and closes
/// the connection.
#[async_trait]
pub trait HeloChecker: Send + Sync {
    async fn check_helo(&self, cx: &SessionContext, peer: &Peer, name: &str)
        -> anyhow::Result<()>;
}

/// Called after MAIL FROM. An error rejects the sender; the session
/// stays open.
#[async_trait]
pub trait SenderChecker: Send + Sync {
    async fn check_sender(
        &self,
        cx: &SessionContext,
        peer: &Peer,
        address: &str,
    ) -> anyhow::Result<()>;
}

/// Called for each RCPT TO. An error rejects that recipient; the
/// session stays open.
#[async_trait]
pub trait RecipientChecker: Send + Sync {
    async fn check_recipient(
        &self,
        cx: &SessionContext,
        peer: &Peer,
        address: &str,
    ) -> anyhow::Result<()>;
}

/// Validates AUTH credentials. Only consulted on TLS sessions.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        cx: &SessionContext,
        peer: &Peer,
        username: &str,
        password: &str,
    ) -> anyhow::Result<()>;
}

/// Receives each completed envelope. Returning `Ok` acknowledges the
/// message with a 250; a [`Rejection`](crate::Rejection) is reported
/// verbatim; any other error becomes a 502.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        cx: &SessionContext,
        peer: &Peer,
        envelope: Envelope,
    ) -> anyhow::Result<()>;
}

/// Runs before the session task spawns; may attach `user_data` to the
/// context every later capability receives.
pub trait ConnContext: Send + Sync {
    fn conn_context(&self, cx: &mut SessionContext, conn: &TcpStream);
}
