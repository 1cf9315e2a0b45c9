//! Body compression hook.
//!
//! The codec never picks an algorithm itself. A compressor is injected by the
//! caller, offered to the server by [`Compressor::name`] during STARTUP, and
//! applied to every body except STARTUP and OPTIONS once negotiated.

use crate::error::ProtocolError;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct CompressionError(pub String);

impl From<CompressionError> for ProtocolError {
    fn from(err: CompressionError) -> Self {
        ProtocolError::Compression(err.0)
    }
}

/// A body compression algorithm.
pub trait Compressor: Send + Sync + fmt::Debug {
    /// Algorithm name as advertised in SUPPORTED (e.g. `lz4`, `snappy`).
    fn name(&self) -> &str;

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError>;

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError>;
}
