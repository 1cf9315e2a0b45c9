//! Observer hooks injected into a connection.

use crate::connection::Connection;
use crate::error::ClientError;
use uuid::Uuid;

/// Receives the trace session id of traced requests.
pub trait Tracer: Send + Sync {
    fn trace(&self, tracing_id: Uuid);
}

/// Notified once when a connection is torn down.
///
/// `fatal` is false for an orderly `close()`.
pub trait ConnectionErrorHandler: Send + Sync {
    fn handle_error(&self, conn: &Connection, error: &ClientError, fatal: bool);
}

/// Handler that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrorHandler;

impl ConnectionErrorHandler for LogErrorHandler {
    fn handle_error(&self, conn: &Connection, error: &ClientError, fatal: bool) {
        if fatal {
            tracing::warn!(addr = %conn.address(), %error, "connection failed");
        } else {
            tracing::debug!(addr = %conn.address(), "connection closed");
        }
    }
}
