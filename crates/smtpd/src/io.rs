use std::fmt::Debug;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::server::TlsStream as TlsServerStream;

/// Maximum length of a single protocol line. RFC 5321 requires support
/// for 1000 octets including the CRLF; we allow a few KiB beyond that.
pub const MAX_LINE_LEN: usize = 4096;

pub trait AsyncReadAndWrite: AsyncRead + AsyncWrite + Debug + Unpin + Send {}

impl AsyncReadAndWrite for TcpStream {}
impl AsyncReadAndWrite for TlsServerStream<TcpStream> {}
impl AsyncReadAndWrite for TlsServerStream<BoxedAsyncReadAndWrite> {}

pub type BoxedAsyncReadAndWrite = Box<dyn AsyncReadAndWrite>;

#[derive(Error, Debug)]
pub(crate) enum ReadError {
    #[error("line too long")]
    LineTooLong,
    #[error("timed out waiting for a line")]
    TimedOut,
    #[error("connection closed by peer")]
    Disconnected,
    #[error("read error: {0}")]
    Io(String),
}

#[derive(Error, Debug)]
pub(crate) enum WriteError {
    #[error("timed out writing reply")]
    TimedOut,
    #[error("write error: {0}")]
    Io(String),
}

/// Buffered line transport for one SMTP session. Owns the boxed
/// connection so that the plain TCP stream can be swapped for a TLS
/// stream mid-session, and applies a deadline to every socket
/// operation. A failed read or write poisons the stream; subsequent
/// operations fail immediately rather than touching a half-dead socket.
#[derive(Debug)]
pub(crate) struct SmtpStream {
    socket: Option<BoxedAsyncReadAndWrite>,
    read_buffer: Vec<u8>,
}

impl SmtpStream {
    pub fn new(socket: BoxedAsyncReadAndWrite) -> Self {
        Self {
            socket: Some(socket),
            read_buffer: Vec::with_capacity(1024),
        }
    }

    /// Take the underlying socket, e.g. to wrap it in TLS. Buffered
    /// bytes are discarded: plaintext received before the upgrade must
    /// not be interpreted after the security boundary.
    pub fn take_socket(&mut self) -> Option<BoxedAsyncReadAndWrite> {
        self.read_buffer.clear();
        self.socket.take()
    }

    pub fn replace_socket(&mut self, socket: BoxedAsyncReadAndWrite) {
        self.read_buffer.clear();
        self.socket.replace(socket);
    }

    /// Read one CRLF-terminated line, without the terminator.
    ///
    /// If a line exceeds MAX_LINE_LEN, input is discarded until the
    /// next CRLF and `ReadError::LineTooLong` is returned once the
    /// terminator has been seen, leaving the stream usable so the
    /// session can report the problem and carry on.
    pub async fn read_line(&mut self, timeout_duration: Duration) -> Result<Vec<u8>, ReadError> {
        let mut too_long = false;
        loop {
            if let Some(i) = memchr::memmem::find(&self.read_buffer, b"\r\n") {
                if too_long {
                    self.read_buffer.drain(0..i + 2);
                    return Err(ReadError::LineTooLong);
                }

                let line = self.read_buffer[0..i].to_vec();
                self.read_buffer.drain(0..i + 2);
                return Ok(line);
            }
            if self.read_buffer.len() > MAX_LINE_LEN {
                self.read_buffer.clear();
                too_long = true;
            }

            // Didn't find a complete line, fill up the rest of the buffer
            let mut data = [0u8; MAX_LINE_LEN];
            let size = match self.socket.as_mut() {
                Some(s) => match timeout(timeout_duration, s.read(&mut data)).await {
                    Ok(Ok(size)) => size,
                    Ok(Err(err)) => {
                        self.socket.take();
                        return Err(ReadError::Io(format!("{err:#}")));
                    }
                    Err(_) => {
                        self.socket.take();
                        return Err(ReadError::TimedOut);
                    }
                },
                None => return Err(ReadError::Disconnected),
            };
            if size == 0 {
                self.socket.take();
                return Err(ReadError::Disconnected);
            }
            self.read_buffer.extend_from_slice(&data[0..size]);
        }
    }

    /// Write and flush under a single deadline.
    pub async fn write_all(
        &mut self,
        timeout_duration: Duration,
        bytes: &[u8],
    ) -> Result<(), WriteError> {
        match self.socket.as_mut() {
            Some(socket) => match timeout(timeout_duration, async {
                socket.write_all(bytes).await?;
                socket.flush().await
            })
            .await
            {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => {
                    self.socket.take();
                    Err(WriteError::Io(format!("{err:#}")))
                }
                Err(_) => {
                    self.socket.take();
                    Err(WriteError::TimedOut)
                }
            },
            None => Err(WriteError::Io(
                "the socket was closed in response to an earlier issue".to_string(),
            )),
        }
    }

    /// Flush, linger briefly, then shut the connection down. The linger
    /// gives clients that drop the final reply when the FIN arrives
    /// immediately after the bytes a chance to see it.
    pub async fn close(&mut self, linger: Duration) {
        if let Some(mut socket) = self.socket.take() {
            socket.flush().await.ok();
            tokio::time::sleep(linger).await;
            socket.shutdown().await.ok();
        }
    }
}
