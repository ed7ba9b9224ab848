/// Unified error handling for the portera proxy
///
/// One enum covers the protocol, routing and I/O failure modes a proxy
/// session can run into, so that every layer can propagate with `?` and the
/// session boundary can decide what is worth logging.
use std::io;
use thiserror::Error;

use crate::config::ConfigError;

/// Main error type for portera operations
#[derive(Debug, Error)]
pub enum PorteraError {
    /// The client or the server broke the PostgreSQL wire protocol
    #[error("protocol violation")]
    ProtocolViolation,

    /// A message tag outside the active role's vocabulary
    #[error("unknown message tag {0:#04x}")]
    UnknownMessage(u8),

    /// An AuthenticationRequest subtype we do not speak
    #[error("unsupported authentication request")]
    UnsupportedAuthenticationRequest,

    /// A Startup message with a protocol version other than 3.0
    #[error("unsupported protocol version")]
    UnsupportedProtocol,

    /// The pool has no backend of the requested role
    #[error("no backend available")]
    NoneAvailable,

    /// The backend rejected the credentials (SQLSTATE 28P01)
    #[error("invalid password")]
    InvalidPassword,

    /// Any other authentication-phase rejection from the backend
    #[error("authentication failure")]
    AuthenticationFailure,

    /// The peer closed the connection at a message boundary.
    /// An ordinary termination, never logged.
    #[error("connection closed")]
    Eof,

    #[error(transparent)]
    Io(#[from] io::Error),

    /// Health-probe session errors (connect, query, scan)
    #[error("health probe failed: {0}")]
    Probe(#[from] tokio_postgres::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl PorteraError {
    /// True for terminations that are part of normal connection teardown.
    pub fn is_eof(&self) -> bool {
        matches!(self, PorteraError::Eof)
    }
}

/// Result type alias for portera operations
pub type PorteraResult<T> = Result<T, PorteraError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eof_is_not_a_fault() {
        assert!(PorteraError::Eof.is_eof());
        assert!(!PorteraError::ProtocolViolation.is_eof());
        let io_err = PorteraError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(!io_err.is_eof());
    }

    #[test]
    fn display_names_the_offending_tag() {
        assert_eq!(
            PorteraError::UnknownMessage(b'Q').to_string(),
            "unknown message tag 0x51"
        );
    }
}
