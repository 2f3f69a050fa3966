//! Error taxonomy for the relay.
//!
//! Only `Listener` is fatal to the whole server. Every other variant is
//! contained at the boundary of the session that produced it.

use crate::session::SessionId;
use std::io;
use std::str::Utf8Error;

/// Errors raised while relaying.
#[derive(Debug)]
pub enum RelayError {
    /// I/O failure on one connection.
    Transport(io::Error),
    /// Accumulated bytes are not valid UTF-8.
    Decode(Utf8Error),
    /// A line grew past the configured limit before its terminator arrived.
    LineTooLong { len: usize, max: usize },
    /// Programming error (duplicate registration, use after close).
    Invariant(String),
    /// Bind or accept failure on the listening endpoint.
    Listener(io::Error),
}

impl RelayError {
    pub fn duplicate_id(id: SessionId) -> Self {
        RelayError::Invariant(format!("session {id} registered twice"))
    }

    pub fn closed(id: SessionId) -> Self {
        RelayError::Invariant(format!("session {id} used after close"))
    }
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::Transport(e) => write!(f, "transport error: {e}"),
            RelayError::Decode(e) => write!(f, "invalid UTF-8 in line: {e}"),
            RelayError::LineTooLong { len, max } => {
                write!(f, "line of {len} bytes exceeds limit of {max}")
            }
            RelayError::Invariant(what) => write!(f, "invariant violated: {what}"),
            RelayError::Listener(e) => write!(f, "listener error: {e}"),
        }
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RelayError::Transport(e) | RelayError::Listener(e) => Some(e),
            RelayError::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for RelayError {
    fn from(e: io::Error) -> Self {
        RelayError::Transport(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_are_transport_errors() {
        let err: RelayError = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert!(matches!(err, RelayError::Transport(_)));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_display() {
        let err = RelayError::LineTooLong { len: 10, max: 4 };
        assert_eq!(err.to_string(), "line of 10 bytes exceeds limit of 4");

        let err = RelayError::duplicate_id(SessionId::new(7));
        assert_eq!(err.to_string(), "invariant violated: session 7 registered twice");
    }
}
