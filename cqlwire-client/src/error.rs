//! Client error types.

use cqlwire_protocol::{Opcode, ProtocolError, ProtocolVersion, ServerError};
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Client errors.
///
/// `Clone` so that a single connection failure can be delivered to every
/// waiting call.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("server error: {0}")]
    Server(#[from] ServerError),

    #[error("request timed out")]
    Timeout,

    #[error("request cancelled")]
    Cancelled,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("no stream ids available on this connection")]
    NoStreams,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("server requires authentication ({0}) but no authenticator is configured")]
    AuthRequired(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unexpected {0} response")]
    UnexpectedResponse(Opcode),

    #[error("response uses protocol {got}, connection negotiated {expected}")]
    UnexpectedProtocolVersion {
        expected: ProtocolVersion,
        got: ProtocolVersion,
    },

    #[error("too many request timeouts ({0})")]
    TooManyTimeouts(u64),

    #[error("heartbeat failed {0} times in a row")]
    HeartbeatFailed(u32),
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        ClientError::Io(Arc::new(err))
    }
}

impl ClientError {
    /// Returns whether this kind of error tears down the connection.
    ///
    /// An oversized response is drained and reported to its caller only, so
    /// it is not fatal. Other protocol errors are fatal when they break the
    /// framing, but a response body that fails to decode is also returned to
    /// just its caller; [`Connection::is_closed`](crate::Connection::is_closed)
    /// is authoritative for whether the connection is still usable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::Protocol(_)
                | ClientError::ConnectionClosed
                | ClientError::Handshake(_)
                | ClientError::AuthRequired(_)
                | ClientError::Auth(_)
                | ClientError::TlsHandshake(_)
                | ClientError::TooManyTimeouts(_)
                | ClientError::HeartbeatFailed(_)
        ) && !matches!(
            self,
            ClientError::Protocol(ProtocolError::FrameTooLarge { .. })
        )
    }

    /// Returns whether the request may be retried, possibly on another connection.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_) => true,
            ClientError::Timeout => true,
            ClientError::ConnectionClosed => true,
            ClientError::NoStreams => true,
            ClientError::TooManyTimeouts(_) => true,
            ClientError::HeartbeatFailed(_) => true,
            ClientError::Server(err) => err.code.is_retryable(),
            _ => false,
        }
    }

    /// Returns the server error, if this is one.
    pub fn as_server_error(&self) -> Option<&ServerError> {
        match self {
            ClientError::Server(err) => Some(err),
            _ => None,
        }
    }
}
