//! # cqlwire-protocol
//!
//! Frame codec for the CQL native binary protocol (versions 1 through 5).
//!
//! This crate provides:
//! - Frame headers for legacy (8 byte) and v3+ (9 byte) layouts
//! - The primitive binary grammar (`[short]`, `[string]`, `[bytes]`, ...)
//! - Typed requests and their encoding
//! - Typed responses, result metadata and server error decoding
//! - The server error-code table
//!
//! The codec is synchronous and never performs I/O. Row values are not
//! decoded; rows are returned as one optional byte slice per column.

pub mod codec;
pub mod compression;
pub mod error;
pub mod frame;
pub mod request;
pub mod response;
pub mod result;
pub mod types;

pub use codec::{decode_response, Decoder, Encoder, RawFrame};
pub use compression::{CompressionError, Compressor};
pub use error::{ErrorCode, ErrorDetails, ProtocolError, ServerError};
pub use frame::{FrameFlags, FrameHeader, Opcode, ProtocolVersion, StreamId, EVENT_STREAM_ID};
pub use request::{
    Batch, BatchStatement, BatchType, CustomPayload, EventType, Query, QueryParameters,
    QueryValues, Request,
};
pub use response::{Event, ParsedResponse, Response, Supported};
pub use result::{
    ColumnSpec, ColumnType, PreparedMetadata, PreparedResult, QueryResult, ResultMetadata, Rows,
    SchemaChange, SchemaChangeTarget, TableSpec,
};
pub use types::{Consistency, SerialConsistency, Value};

/// Default CQL native transport port.
pub const DEFAULT_PORT: u16 = 9042;

/// Maximum frame body size (256 MiB).
pub const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

/// Largest header size across all protocol versions.
pub const MAX_HEADER_SIZE: usize = 9;
