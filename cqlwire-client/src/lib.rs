//! # cqlwire-client
//!
//! Connection engine for the CQL native binary protocol.
//!
//! This crate provides:
//! - Async TCP connections with optional TLS
//! - The OPTIONS/STARTUP handshake with pluggable authenticators
//! - Stream id multiplexing of concurrent requests over one socket
//! - Write coalescing, heartbeats, timeouts and cancellation
//! - A single-flight prepared statement cache

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod hooks;
pub mod prepare;
pub mod reader;
pub mod stream;
pub mod stream_ids;
pub mod tls;
pub mod writer;

pub(crate) mod handshake;
pub(crate) mod inflight;

#[cfg(test)]
mod testing;

pub use auth::{Authenticator, Challenge, PasswordAuthenticator};
pub use config::{AuthConfig, ClientConfig, ConfigError, ConnectionConfig, TlsClientConfig};
pub use connection::{dial, Connection, ConnectionState, ExecuteOptions};
pub use error::ClientError;
pub use hooks::{ConnectionErrorHandler, LogErrorHandler, Tracer};
pub use prepare::{PreparedCache, PreparedStatement, StatementKey};
pub use stream_ids::StreamIds;
