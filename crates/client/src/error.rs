use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Every failure the client core reports.
///
/// Construction errors (`InvalidState`, `MissingTarget`, `InvalidUri`, `MalformedInput`) are
/// returned synchronously by builders. Dispatch errors (`ConnectionFailed`, `Timeout`,
/// `Cancelled`, `DecodeFailed`) travel through the same channel a success would have used:
/// the return value of [`Client::send`](crate::Client::send) or the failed state of a
/// [`Promise`](crate::future::Promise). The type is `Clone` because a promise hands its result
/// to every consumer attached to it.
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("invalid state: {reason}")]
    InvalidState { reason: String },

    #[error("request target must be set")]
    MissingTarget,

    #[error("invalid uri: {reason}")]
    InvalidUri { reason: String },

    #[error("malformed input: {reason}")]
    MalformedInput { reason: String },

    #[error("connection failed: {source}")]
    ConnectionFailed {
        #[from]
        source: TransportError,
    },

    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("decode failed: {reason}")]
    DecodeFailed { reason: String },

    #[error("websocket session closed")]
    SessionClosed,
}

impl ClientError {
    pub fn invalid_state<S: ToString>(str: S) -> Self {
        Self::InvalidState { reason: str.to_string() }
    }

    pub fn invalid_uri<S: ToString>(str: S) -> Self {
        Self::InvalidUri { reason: str.to_string() }
    }

    pub fn malformed_input<S: ToString>(str: S) -> Self {
        Self::MalformedInput { reason: str.to_string() }
    }

    pub fn decode_failed<S: ToString>(str: S) -> Self {
        Self::DecodeFailed { reason: str.to_string() }
    }

    /// Returns true for errors raised while building a request or session, before any I/O.
    pub fn is_construction_error(&self) -> bool {
        matches!(self, Self::InvalidState { .. } | Self::MissingTarget | Self::InvalidUri { .. } | Self::MalformedInput { .. })
    }
}

/// Failures reported by a [`Transport`](crate::transport::Transport) implementation.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("connect error: {reason}")]
    Connect { reason: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: Arc<io::Error>,
    },

    #[error("handshake rejected: {reason}")]
    Handshake { reason: String },

    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    #[error("connection closed by peer")]
    Closed,
}

impl TransportError {
    pub fn connect<S: ToString>(str: S) -> Self {
        Self::Connect { reason: str.to_string() }
    }

    pub fn handshake<S: ToString>(str: S) -> Self {
        Self::Handshake { reason: str.to_string() }
    }

    pub fn protocol<S: ToString>(str: S) -> Self {
        Self::Protocol { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: Arc::new(e.into()) }
    }
}

/// Errors raised by [`ClientBuilder::build`](crate::ClientBuilder::build).
#[derive(Error, Debug)]
pub enum ClientBuildError {
    #[error("transport must be set")]
    MissingTransport,

    #[error("restricted default header: {name}")]
    RestrictedHeader { name: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_converts_into_connection_failed() {
        let err: ClientError = TransportError::connect("refused").into();
        assert!(matches!(err, ClientError::ConnectionFailed { source: TransportError::Connect { .. } }));
        assert_eq!(err.to_string(), "connection failed: connect error: refused");
    }

    #[test]
    fn io_errors_are_shared_on_clone() {
        let err = TransportError::io(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
    }

    #[test]
    fn construction_errors_are_classified() {
        assert!(ClientError::MissingTarget.is_construction_error());
        assert!(ClientError::malformed_input("odd").is_construction_error());
        assert!(!ClientError::Timeout.is_construction_error());
        assert!(!ClientError::SessionClosed.is_construction_error());
    }
}
