//! An embeddable SMTP server with support for STARTTLS, authentication
//! (PLAIN/LOGIN), XCLIENT, the HAProxy PROXY protocol, and pluggable
//! checks on the different stages of the SMTP session.
pub mod envelope;
pub mod error;
pub mod handlers;
pub mod io;
pub mod parser;
pub mod peer;
pub mod server;
mod session;
pub mod tls;

pub use envelope::Envelope;
pub use error::{Rejection, ServerError};
pub use handlers::*;
pub use io::{AsyncReadAndWrite, BoxedAsyncReadAndWrite, MAX_LINE_LEN};
pub use parser::{parse_proxy_header, Command, EsmtpParameter};
pub use peer::{Peer, Protocol, TlsInformation};
pub use server::{Server, SmtpServerTimeouts};
pub use tls::make_server_config;
