//! The accepting side of the engine: configuration, the accept loop,
//! admission control, and graceful shutdown.
use crate::error::ServerError;
use crate::handlers::{
    Authenticator, ConnContext, ConnectionChecker, Handler, HeloChecker, RecipientChecker,
    SenderChecker, SessionContext,
};
use crate::session::Session;
use parking_lot::Mutex;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::mpsc::{Receiver as MPSCReceiver, Sender as MPSCSender};
use tokio::sync::watch::{Receiver as WatchReceiver, Sender as WatchSender};
use tokio::sync::Semaphore;
use tokio_rustls::rustls::ServerConfig;

/// Socket deadlines for one session.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SmtpServerTimeouts {
    /// Applied to each read while waiting for a command line.
    pub read_timeout: Duration,
    /// Applied to each reply, including the flush.
    pub write_timeout: Duration,
    /// Applied to each read inside DATA, which legitimately idles
    /// longer than the command dialogue.
    pub data_timeout: Duration,
    /// Pause between flushing the final reply and closing the socket,
    /// for clients that drop the reply when the FIN arrives with it.
    pub shutdown_linger: Duration,
}

impl Default for SmtpServerTimeouts {
    fn default() -> Self {
        Self {
            read_timeout: Self::default_read_timeout(),
            write_timeout: Self::default_write_timeout(),
            data_timeout: Self::default_data_timeout(),
            shutdown_linger: Self::default_shutdown_linger(),
        }
    }
}

impl SmtpServerTimeouts {
    fn default_read_timeout() -> Duration {
        Duration::from_secs(60)
    }
    fn default_write_timeout() -> Duration {
        Duration::from_secs(60)
    }
    fn default_data_timeout() -> Duration {
        Duration::from_secs(300)
    }
    fn default_shutdown_linger() -> Duration {
        Duration::from_millis(200)
    }

    pub fn short_timeouts() -> Self {
        let short = Duration::from_secs(5);
        Self {
            read_timeout: short,
            write_timeout: short,
            data_timeout: short,
            shutdown_linger: Duration::from_millis(10),
        }
    }
}

/// Held by every session task. `wait` completes once all clones have
/// dropped, i.e. once the last session has returned.
#[derive(Clone)]
struct Activity {
    _tx: MPSCSender<()>,
}

#[derive(Default)]
struct Inner {
    done: Option<WatchSender<bool>>,
    activity: Option<Activity>,
    local_addr: Option<SocketAddr>,
}

#[derive(Default)]
struct ServerState {
    in_shutdown: AtomicBool,
    inner: Mutex<Inner>,
    wait_rx: tokio::sync::Mutex<Option<MPSCReceiver<()>>>,
}

/// An embeddable SMTP server.
///
/// Populate the public fields, wrap the value in an `Arc`, and call
/// [`serve`](Self::serve) or [`listen_and_serve`](Self::listen_and_serve)
/// on your runtime. All configuration is read-only once serving starts.
///
/// ```no_run
/// # async fn demo() -> Result<(), smtpd::ServerError> {
/// let mut server = smtpd::Server::default();
/// server.hostname = "mx.example.com".to_string();
/// let server = std::sync::Arc::new(server);
/// server.listen_and_serve("0.0.0.0:25").await
/// # }
/// ```
pub struct Server {
    /// Advertised in the banner and the EHLO reply.
    pub hostname: String,
    /// Text of the 220 banner; defaults to `"<hostname> ESMTP ready."`.
    pub welcome_message: Option<String>,
    pub timeouts: SmtpServerTimeouts,
    /// Maximum concurrent sessions; 0 disables the cap. Connections
    /// over the cap are refused with a 421.
    pub max_connections: usize,
    /// Maximum DATA payload in bytes.
    pub max_message_size: usize,
    /// Maximum accepted RCPT TO commands per envelope.
    pub max_recipients: usize,
    /// Enables the STARTTLS extension.
    pub tls_config: Option<Arc<ServerConfig>>,
    /// Refuse mail transactions until the session has been upgraded.
    pub force_tls: bool,
    pub enable_xclient: bool,
    pub enable_proxy_protocol: bool,
    pub connection_checker: Option<Arc<dyn ConnectionChecker>>,
    pub helo_checker: Option<Arc<dyn HeloChecker>>,
    pub sender_checker: Option<Arc<dyn SenderChecker>>,
    pub recipient_checker: Option<Arc<dyn RecipientChecker>>,
    /// Enables AUTH PLAIN/LOGIN, offered on TLS sessions only.
    pub authenticator: Option<Arc<dyn Authenticator>>,
    /// Receives completed envelopes. Absent means accept-and-discard.
    pub handler: Option<Arc<dyn Handler>>,
    pub conn_context: Option<Arc<dyn ConnContext>>,
    state: ServerState,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            hostname: "localhost.localdomain".to_string(),
            welcome_message: None,
            timeouts: SmtpServerTimeouts::default(),
            max_connections: 100,
            max_message_size: 10_240_000,
            max_recipients: 100,
            tls_config: None,
            force_tls: false,
            enable_xclient: false,
            enable_proxy_protocol: false,
            connection_checker: None,
            helo_checker: None,
            sender_checker: None,
            recipient_checker: None,
            authenticator: None,
            handler: None,
            conn_context: None,
            state: ServerState::default(),
        }
    }
}

impl Server {
    fn shutting_down(&self) -> bool {
        self.state.in_shutdown.load(Ordering::Relaxed)
    }

    /// The address of the listener most recently handed to `serve`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.inner.lock().local_addr
    }

    /// Bind `addr` and serve until shutdown.
    pub async fn listen_and_serve<A: ToSocketAddrs>(
        self: &Arc<Self>,
        addr: A,
    ) -> Result<(), ServerError> {
        if self.shutting_down() {
            return Err(ServerError::Closed);
        }
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Accept sessions on `listener` until [`shutdown`](Self::shutdown)
    /// is requested, then return [`ServerError::Closed`].
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        if self.shutting_down() {
            return Err(ServerError::Closed);
        }
        if self.force_tls && self.tls_config.is_none() {
            return Err(ServerError::ForceTlsWithoutTlsConfig);
        }

        let (mut done_rx, activity) = self.register_serve(&listener).await?;

        let limiter = if self.max_connections > 0 {
            Some(Arc::new(Semaphore::new(self.max_connections)))
        } else {
            None
        };

        loop {
            let mut retry_done_rx = done_rx.clone();
            let (conn, remote_addr) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(tuple) => tuple,
                    Err(err) => {
                        if self.shutting_down() {
                            return Err(ServerError::Closed);
                        }
                        tracing::error!("accept failed: {err:#}");
                        // Transient resource exhaustion (EMFILE and
                        // friends) tends to clear; back off and retry.
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                            _ = async { retry_done_rx.wait_for(|closed| *closed).await.ok(); } => {
                                return Err(ServerError::Closed);
                            }
                        }
                        continue;
                    }
                },
                _ = async { done_rx.wait_for(|closed| *closed).await.ok(); } => return Err(ServerError::Closed),
            };

            let local_addr = match conn.local_addr() {
                Ok(addr) => addr,
                Err(_) => continue,
            };
            // No need for Nagle with SMTP request/response
            conn.set_nodelay(true).ok();

            let mut cx = SessionContext {
                local_addr,
                remote_addr,
                user_data: None,
            };
            if let Some(conn_context) = &self.conn_context {
                conn_context.conn_context(&mut cx, &conn);
            }

            let session = Session::new(self.clone(), Box::new(conn), cx);
            let activity = activity.clone();

            match &limiter {
                Some(limiter) => match limiter.clone().try_acquire_owned() {
                    Ok(permit) => {
                        tokio::spawn(async move {
                            let _activity = activity;
                            let _permit = permit;
                            session.run().await;
                        });
                    }
                    Err(_) => {
                        tokio::spawn(async move {
                            let _activity = activity;
                            session.reject_busy().await;
                        });
                    }
                },
                None => {
                    tokio::spawn(async move {
                        let _activity = activity;
                        session.run().await;
                    });
                }
            }
        }
    }

    /// Serve until the caller-supplied future resolves, typically a
    /// ctrl-c or cancellation signal, then shut down gracefully and
    /// return [`ServerError::Closed`].
    pub async fn serve_with_shutdown<F>(
        self: &Arc<Self>,
        listener: TcpListener,
        shutdown: F,
    ) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let server = self.clone();
        let watcher = tokio::spawn(async move {
            shutdown.await;
            server.shutdown(true).await.ok();
        });
        let result = self.serve(listener).await;
        watcher.abort();
        result
    }

    /// Lazily create the done signal and the activity tracker, shared
    /// by every `serve` call on this server.
    async fn register_serve(
        &self,
        listener: &TcpListener,
    ) -> Result<(WatchReceiver<bool>, Activity), ServerError> {
        let mut wait_rx = self.state.wait_rx.lock().await;
        let mut inner = self.state.inner.lock();
        // Re-check under the lock: a shutdown that won the race must
        // not have its activity accounting resurrected here.
        if self.shutting_down() {
            return Err(ServerError::Closed);
        }
        inner.local_addr = listener.local_addr().ok();

        let done_rx = match &inner.done {
            Some(done) => done.subscribe(),
            None => {
                let (tx, rx) = tokio::sync::watch::channel(false);
                inner.done = Some(tx);
                rx
            }
        };
        let activity = match &inner.activity {
            Some(activity) => activity.clone(),
            None => {
                let (tx, rx) = tokio::sync::mpsc::channel(1);
                let activity = Activity { _tx: tx };
                inner.activity = Some(activity.clone());
                *wait_rx = Some(rx);
                activity
            }
        };

        Ok((done_rx, activity))
    }

    /// Stop accepting connections. Idempotent; safe to call from any
    /// task. Active sessions are not interrupted: they drain through
    /// their own timeouts or a QUIT. With `wait`, block until they
    /// have.
    pub async fn shutdown(&self, wait: bool) -> Result<(), ServerError> {
        self.state.in_shutdown.store(true, Ordering::SeqCst);
        {
            let mut inner = self.state.inner.lock();
            match &inner.done {
                Some(done) => {
                    done.send_replace(true);
                }
                // A serve racing with this shutdown will subscribe to
                // the already-signalled channel and stop immediately.
                None => {
                    let (tx, _rx) = tokio::sync::watch::channel(true);
                    inner.done = Some(tx);
                }
            }
            // Drop our own liveness handle so wait() observes the last
            // session ending rather than this server value.
            inner.activity.take();
        }
        if wait {
            self.wait().await?;
        }
        Ok(())
    }

    /// Wait for every session task to return. Only meaningful after
    /// [`shutdown`](Self::shutdown).
    pub async fn wait(&self) -> Result<(), ServerError> {
        if !self.shutting_down() {
            return Err(ServerError::NotShutdown);
        }
        let mut wait_rx = self.state.wait_rx.lock().await;
        if let Some(rx) = wait_rx.as_mut() {
            // Yields None once every Activity clone has dropped.
            rx.recv().await;
        }
        Ok(())
    }
}
