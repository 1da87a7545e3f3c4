use thiserror::Error;

/// An SMTP reply with an explicit status code.
///
/// Checkers, authenticators and the delivery handler may return one of
/// these (through `anyhow`) to control the exact line written to the
/// client; any other error they return is widened to a generic 502.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code} {message}")]
pub struct Rejection {
    pub code: u16,
    pub message: String,
}

impl Rejection {
    pub fn new<S: Into<String>>(code: u16, message: S) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// 421, sent when the connection cap is exceeded.
    pub fn busy() -> Self {
        Self::new(421, "Too busy. Try again later.")
    }

    pub fn line_too_long() -> Self {
        Self::new(500, "Line too long")
    }

    /// 501, malformed command or arguments.
    pub fn syntax<S: Into<String>>(message: S) -> Self {
        Self::new(501, message)
    }

    pub fn unsupported_command() -> Self {
        Self::new(502, "Unsupported command.")
    }

    /// 503, command issued outside its legal place in the dialogue.
    pub fn bad_sequence<S: Into<String>>(message: S) -> Self {
        Self::new(503, message)
    }

    pub fn tls_required() -> Self {
        Self::new(530, "Must issue a STARTTLS command first.")
    }

    pub fn auth_failed() -> Self {
        Self::new(535, "Authentication credentials invalid")
    }

    pub fn auth_cancelled() -> Self {
        Self::new(501, "Authentication cancelled.")
    }

    pub fn too_big() -> Self {
        Self::new(552, "Message exceeds maximum message size")
    }

    pub fn too_many_recipients() -> Self {
        Self::new(552, "Too many recipients")
    }
}

/// Errors surfaced to the embedder by the server supervisor.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Returned by `serve` and `listen_and_serve` once `shutdown` has
    /// been requested.
    #[error("smtp server closed")]
    Closed,
    #[error("server has not been shutdown")]
    NotShutdown,
    #[error("force_tls requires tls_config to be set")]
    ForceTlsWithoutTlsConfig,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn rejection_renders_as_wire_line() {
        assert_equal!(
            Rejection::new(550, "relay access denied").to_string(),
            "550 relay access denied"
        );
        assert_equal!(Rejection::busy().to_string(), "421 Too busy. Try again later.");
        assert_equal!(
            Rejection::syntax("Malformed SIZE parameter.").to_string(),
            "501 Malformed SIZE parameter."
        );
        assert_equal!(
            Rejection::auth_cancelled().to_string(),
            "501 Authentication cancelled."
        );
    }

    #[test]
    fn rejection_downcasts_through_anyhow() {
        let err: anyhow::Error = Rejection::new(550, "no").into();
        let rejection = err.downcast_ref::<Rejection>().unwrap();
        assert_equal!(rejection.code, 550);
    }
}
