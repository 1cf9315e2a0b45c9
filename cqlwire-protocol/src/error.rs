//! Protocol error types, the server error-code table and structured server errors.

use crate::types::{Consistency, Reader};
use crate::ProtocolVersion;
use bytes::Bytes;
use std::fmt;
use std::net::IpAddr;
use thiserror::Error;

/// Errors raised while encoding requests or decoding frames.
///
/// Every decode path reports a short buffer as [`ProtocolError::NotEnoughBytes`]
/// instead of reading out of bounds.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("received a request frame from the server (version byte {0:#04x})")]
    UnexpectedDirection(u8),

    #[error("invalid frame flags: {0:#x}")]
    InvalidFlags(u8),

    #[error("unknown opcode: {0:#04x}")]
    UnknownOpcode(u8),

    #[error("opcode {0} is not a response opcode")]
    NotAResponse(crate::Opcode),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("response on reserved stream id {0}")]
    InvalidStream(crate::StreamId),

    #[error("negative frame body length: {0}")]
    NegativeBodyLength(i32),

    #[error("not enough bytes to read {kind}: need {needed}, have {available}")]
    NotEnoughBytes {
        kind: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("negative {kind} count: {count}")]
    NegativeCount { kind: &'static str, count: i32 },

    #[error("{0} rows declared for a result with no columns")]
    RowsWithoutColumns(usize),

    #[error("invalid port: {0}")]
    InvalidPort(i32),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("invalid inet address length: {0}")]
    InvalidInetLength(u8),

    #[error("invalid consistency level: {0:#06x}")]
    InvalidConsistency(u16),

    #[error("unknown result kind: {0}")]
    UnknownResultKind(i32),

    #[error("unknown error code: {0:#06x}")]
    UnknownErrorCode(i32),

    #[error("unknown event type: {0:?}")]
    UnknownEventType(String),

    #[error("unknown schema change target: {0:?}")]
    UnknownSchemaTarget(String),

    #[error("unknown column type id: {0:#06x}")]
    UnknownColumnType(u16),

    #[error("{kind} too long: {len} (max {max})")]
    TooLong {
        kind: &'static str,
        len: usize,
        max: usize,
    },

    #[error("{feature} requires protocol version {required} or later (negotiated {negotiated})")]
    UnsupportedFeature {
        feature: &'static str,
        required: u8,
        negotiated: u8,
    },

    #[error("named values are not supported in batches")]
    NamedValuesInBatch,

    #[error("compressed frame received but no compressor is configured")]
    MissingCompressor,

    #[error("compression error: {0}")]
    Compression(String),
}

impl ProtocolError {
    pub(crate) fn requires(feature: &'static str, required: u8, version: ProtocolVersion) -> Self {
        ProtocolError::UnsupportedFeature {
            feature,
            required,
            negotiated: version.as_u8(),
        }
    }
}

/// Numeric error codes carried by ERROR frames.
///
/// These codes are part of the protocol contract; each one selects the layout of
/// the remainder of the error body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Server-side failures
    Server,
    Protocol,
    BadCredentials,

    // Request execution errors
    Unavailable,
    Overloaded,
    IsBootstrapping,
    Truncate,
    WriteTimeout,
    ReadTimeout,
    ReadFailure,
    FunctionFailure,
    WriteFailure,
    CdcWriteFailure,
    CasWriteUnknown,

    // Query validation errors
    Syntax,
    Unauthorized,
    Invalid,
    Config,
    AlreadyExists,
    Unprepared,
}

impl ErrorCode {
    /// Maps a wire code to an error code.
    pub fn from_code(code: i32) -> Option<Self> {
        let code = match code {
            0x0000 => ErrorCode::Server,
            0x000A => ErrorCode::Protocol,
            0x0100 => ErrorCode::BadCredentials,
            0x1000 => ErrorCode::Unavailable,
            0x1001 => ErrorCode::Overloaded,
            0x1002 => ErrorCode::IsBootstrapping,
            0x1003 => ErrorCode::Truncate,
            0x1100 => ErrorCode::WriteTimeout,
            0x1200 => ErrorCode::ReadTimeout,
            0x1300 => ErrorCode::ReadFailure,
            0x1400 => ErrorCode::FunctionFailure,
            0x1500 => ErrorCode::WriteFailure,
            0x1600 => ErrorCode::CdcWriteFailure,
            0x1700 => ErrorCode::CasWriteUnknown,
            0x2000 => ErrorCode::Syntax,
            0x2100 => ErrorCode::Unauthorized,
            0x2200 => ErrorCode::Invalid,
            0x2300 => ErrorCode::Config,
            0x2400 => ErrorCode::AlreadyExists,
            0x2500 => ErrorCode::Unprepared,
            _ => return None,
        };
        Some(code)
    }

    /// Returns the wire value of this code.
    pub fn code(&self) -> i32 {
        match self {
            ErrorCode::Server => 0x0000,
            ErrorCode::Protocol => 0x000A,
            ErrorCode::BadCredentials => 0x0100,
            ErrorCode::Unavailable => 0x1000,
            ErrorCode::Overloaded => 0x1001,
            ErrorCode::IsBootstrapping => 0x1002,
            ErrorCode::Truncate => 0x1003,
            ErrorCode::WriteTimeout => 0x1100,
            ErrorCode::ReadTimeout => 0x1200,
            ErrorCode::ReadFailure => 0x1300,
            ErrorCode::FunctionFailure => 0x1400,
            ErrorCode::WriteFailure => 0x1500,
            ErrorCode::CdcWriteFailure => 0x1600,
            ErrorCode::CasWriteUnknown => 0x1700,
            ErrorCode::Syntax => 0x2000,
            ErrorCode::Unauthorized => 0x2100,
            ErrorCode::Invalid => 0x2200,
            ErrorCode::Config => 0x2300,
            ErrorCode::AlreadyExists => 0x2400,
            ErrorCode::Unprepared => 0x2500,
        }
    }

    /// Returns whether a retry policy may reasonably retry this error.
    ///
    /// The engine itself never retries on these; this is a hint for callers.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::Unavailable
                | ErrorCode::Overloaded
                | ErrorCode::IsBootstrapping
                | ErrorCode::WriteTimeout
                | ErrorCode::ReadTimeout
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Server => write!(f, "SERVER_ERROR"),
            ErrorCode::Protocol => write!(f, "PROTOCOL_ERROR"),
            ErrorCode::BadCredentials => write!(f, "BAD_CREDENTIALS"),
            ErrorCode::Unavailable => write!(f, "UNAVAILABLE"),
            ErrorCode::Overloaded => write!(f, "OVERLOADED"),
            ErrorCode::IsBootstrapping => write!(f, "IS_BOOTSTRAPPING"),
            ErrorCode::Truncate => write!(f, "TRUNCATE_ERROR"),
            ErrorCode::WriteTimeout => write!(f, "WRITE_TIMEOUT"),
            ErrorCode::ReadTimeout => write!(f, "READ_TIMEOUT"),
            ErrorCode::ReadFailure => write!(f, "READ_FAILURE"),
            ErrorCode::FunctionFailure => write!(f, "FUNCTION_FAILURE"),
            ErrorCode::WriteFailure => write!(f, "WRITE_FAILURE"),
            ErrorCode::CdcWriteFailure => write!(f, "CDC_WRITE_FAILURE"),
            ErrorCode::CasWriteUnknown => write!(f, "CAS_WRITE_UNKNOWN"),
            ErrorCode::Syntax => write!(f, "SYNTAX_ERROR"),
            ErrorCode::Unauthorized => write!(f, "UNAUTHORIZED"),
            ErrorCode::Invalid => write!(f, "INVALID"),
            ErrorCode::Config => write!(f, "CONFIG_ERROR"),
            ErrorCode::AlreadyExists => write!(f, "ALREADY_EXISTS"),
            ErrorCode::Unprepared => write!(f, "UNPREPARED"),
        }
    }
}

/// Code-specific fields that follow the message of an ERROR body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorDetails {
    None,
    Unavailable {
        consistency: Consistency,
        required: i32,
        alive: i32,
    },
    WriteTimeout {
        consistency: Consistency,
        received: i32,
        block_for: i32,
        write_type: String,
    },
    ReadTimeout {
        consistency: Consistency,
        received: i32,
        block_for: i32,
        data_present: bool,
    },
    ReadFailure {
        consistency: Consistency,
        received: i32,
        block_for: i32,
        num_failures: i32,
        /// Per-replica failure reasons (v5 only, empty otherwise).
        reasons: Vec<(IpAddr, u16)>,
        data_present: bool,
    },
    WriteFailure {
        consistency: Consistency,
        received: i32,
        block_for: i32,
        num_failures: i32,
        reasons: Vec<(IpAddr, u16)>,
        write_type: String,
    },
    FunctionFailure {
        keyspace: String,
        function: String,
        arg_types: Vec<String>,
    },
    AlreadyExists {
        keyspace: String,
        table: String,
    },
    Unprepared {
        statement_id: Bytes,
    },
    CasWriteUnknown {
        consistency: Consistency,
        received: i32,
        block_for: i32,
    },
}

/// An application error reported by the server.
///
/// This is an ordinary decode result, not an engine failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct ServerError {
    pub code: ErrorCode,
    pub message: String,
    pub details: ErrorDetails,
}

impl ServerError {
    /// Returns the statement id if this is an UNPREPARED error.
    pub fn unprepared_id(&self) -> Option<&Bytes> {
        match &self.details {
            ErrorDetails::Unprepared { statement_id } => Some(statement_id),
            _ => None,
        }
    }

    pub(crate) fn decode(r: &mut Reader, version: ProtocolVersion) -> Result<Self, ProtocolError> {
        let raw_code = r.read_int()?;
        let message = r.read_string()?;
        let code = ErrorCode::from_code(raw_code).ok_or(ProtocolError::UnknownErrorCode(raw_code))?;

        let details = match code {
            ErrorCode::Unavailable => ErrorDetails::Unavailable {
                consistency: r.read_consistency()?,
                required: r.read_int()?,
                alive: r.read_int()?,
            },
            ErrorCode::WriteTimeout => ErrorDetails::WriteTimeout {
                consistency: r.read_consistency()?,
                received: r.read_int()?,
                block_for: r.read_int()?,
                write_type: r.read_string()?,
            },
            ErrorCode::ReadTimeout => ErrorDetails::ReadTimeout {
                consistency: r.read_consistency()?,
                received: r.read_int()?,
                block_for: r.read_int()?,
                data_present: r.read_byte()? != 0,
            },
            ErrorCode::ReadFailure => {
                let consistency = r.read_consistency()?;
                let received = r.read_int()?;
                let block_for = r.read_int()?;
                let (num_failures, reasons) = read_failures(r, version)?;
                ErrorDetails::ReadFailure {
                    consistency,
                    received,
                    block_for,
                    num_failures,
                    reasons,
                    data_present: r.read_byte()? != 0,
                }
            }
            ErrorCode::WriteFailure => {
                let consistency = r.read_consistency()?;
                let received = r.read_int()?;
                let block_for = r.read_int()?;
                let (num_failures, reasons) = read_failures(r, version)?;
                ErrorDetails::WriteFailure {
                    consistency,
                    received,
                    block_for,
                    num_failures,
                    reasons,
                    write_type: r.read_string()?,
                }
            }
            ErrorCode::FunctionFailure => ErrorDetails::FunctionFailure {
                keyspace: r.read_string()?,
                function: r.read_string()?,
                arg_types: r.read_string_list()?,
            },
            ErrorCode::AlreadyExists => ErrorDetails::AlreadyExists {
                keyspace: r.read_string()?,
                table: r.read_string()?,
            },
            ErrorCode::Unprepared => ErrorDetails::Unprepared {
                statement_id: r.read_short_bytes()?,
            },
            ErrorCode::CasWriteUnknown => ErrorDetails::CasWriteUnknown {
                consistency: r.read_consistency()?,
                received: r.read_int()?,
                block_for: r.read_int()?,
            },
            _ => ErrorDetails::None,
        };

        Ok(Self {
            code,
            message,
            details,
        })
    }
}

/// v5 replaces the failure count with a map of replica address to reason code.
fn read_failures(
    r: &mut Reader,
    version: ProtocolVersion,
) -> Result<(i32, Vec<(IpAddr, u16)>), ProtocolError> {
    if version < ProtocolVersion::V5 {
        return Ok((r.read_int()?, Vec::new()));
    }

    let count = r.read_int()?;
    if count < 0 {
        return Err(ProtocolError::NegativeCount {
            kind: "failure reason",
            count,
        });
    }
    let mut reasons = Vec::with_capacity((count as usize).min(r.remaining()));
    for _ in 0..count {
        let addr = r.read_inet_addr()?;
        reasons.push((addr, r.read_short()?));
    }
    Ok((reasons.len() as i32, reasons))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{write_consistency, write_short_bytes, write_string};
    use bytes::{BufMut, BytesMut};

    fn error_body(code: i32, message: &str, rest: impl FnOnce(&mut BytesMut)) -> Reader {
        let mut buf = BytesMut::new();
        buf.put_i32(code);
        write_string(&mut buf, message).unwrap();
        rest(&mut buf);
        Reader::new(buf.freeze())
    }

    #[test]
    fn test_error_code_table() {
        for raw in [
            0x0000, 0x000A, 0x0100, 0x1000, 0x1001, 0x1002, 0x1003, 0x1100, 0x1200, 0x1300,
            0x1400, 0x1500, 0x1600, 0x1700, 0x2000, 0x2100, 0x2200, 0x2300, 0x2400, 0x2500,
        ] {
            let code = ErrorCode::from_code(raw).unwrap();
            assert_eq!(code.code(), raw);
        }
        assert!(ErrorCode::from_code(0x9999).is_none());
    }

    #[test]
    fn test_error_code_retryable() {
        assert!(ErrorCode::Unavailable.is_retryable());
        assert!(ErrorCode::Overloaded.is_retryable());
        assert!(ErrorCode::ReadTimeout.is_retryable());

        assert!(!ErrorCode::Syntax.is_retryable());
        assert!(!ErrorCode::Unprepared.is_retryable());
        assert!(!ErrorCode::AlreadyExists.is_retryable());
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(ErrorCode::Server.to_string(), "SERVER_ERROR");
        assert_eq!(ErrorCode::WriteTimeout.to_string(), "WRITE_TIMEOUT");
        assert_eq!(ErrorCode::CasWriteUnknown.to_string(), "CAS_WRITE_UNKNOWN");
        assert_eq!(ErrorCode::Unprepared.to_string(), "UNPREPARED");
    }

    #[test]
    fn test_decode_unavailable() {
        let mut r = error_body(0x1000, "not enough replicas", |b| {
            write_consistency(b, Consistency::Quorum);
            b.put_i32(3);
            b.put_i32(1);
        });
        let err = ServerError::decode(&mut r, ProtocolVersion::V4).unwrap();
        assert_eq!(err.code, ErrorCode::Unavailable);
        assert_eq!(err.message, "not enough replicas");
        assert_eq!(
            err.details,
            ErrorDetails::Unavailable {
                consistency: Consistency::Quorum,
                required: 3,
                alive: 1
            }
        );
    }

    #[test]
    fn test_decode_unprepared() {
        let mut r = error_body(0x2500, "unknown id", |b| {
            write_short_bytes(b, &[0xCA, 0xFE]).unwrap();
        });
        let err = ServerError::decode(&mut r, ProtocolVersion::V4).unwrap();
        assert_eq!(err.unprepared_id().unwrap().as_ref(), &[0xCA, 0xFE]);
        assert_eq!(err.to_string(), "UNPREPARED: unknown id");
    }

    #[test]
    fn test_decode_read_failure_v5_reason_map() {
        let mut r = error_body(0x1300, "failed", |b| {
            write_consistency(b, Consistency::One);
            b.put_i32(0);
            b.put_i32(1);
            b.put_i32(1);
            b.put_u8(4);
            b.put_slice(&[10, 0, 0, 7]);
            b.put_u16(0x0001);
            b.put_u8(1);
        });
        let err = ServerError::decode(&mut r, ProtocolVersion::V5).unwrap();
        match err.details {
            ErrorDetails::ReadFailure {
                num_failures,
                reasons,
                data_present,
                ..
            } => {
                assert_eq!(num_failures, 1);
                assert_eq!(reasons[0].0, "10.0.0.7".parse::<IpAddr>().unwrap());
                assert_eq!(reasons[0].1, 1);
                assert!(data_present);
            }
            other => panic!("unexpected details: {other:?}"),
        }
    }

    #[test]
    fn test_decode_write_failure_v4_counts() {
        let mut r = error_body(0x1500, "failed", |b| {
            write_consistency(b, Consistency::All);
            b.put_i32(1);
            b.put_i32(3);
            b.put_i32(2);
            write_string(b, "SIMPLE").unwrap();
        });
        let err = ServerError::decode(&mut r, ProtocolVersion::V4).unwrap();
        assert_eq!(
            err.details,
            ErrorDetails::WriteFailure {
                consistency: Consistency::All,
                received: 1,
                block_for: 3,
                num_failures: 2,
                reasons: vec![],
                write_type: "SIMPLE".to_string(),
            }
        );
    }

    #[test]
    fn test_decode_generic_codes_have_no_details() {
        let mut r = error_body(0x2000, "line 1:0 no viable alternative", |_| {});
        let err = ServerError::decode(&mut r, ProtocolVersion::V4).unwrap();
        assert_eq!(err.code, ErrorCode::Syntax);
        assert_eq!(err.details, ErrorDetails::None);
    }

    #[test]
    fn test_decode_unknown_code() {
        let mut r = error_body(0x7777, "?", |_| {});
        let result = ServerError::decode(&mut r, ProtocolVersion::V4);
        assert_eq!(result, Err(ProtocolError::UnknownErrorCode(0x7777)));
    }

    #[test]
    fn test_decode_truncated_details() {
        let mut r = error_body(0x1100, "timeout", |b| {
            write_consistency(b, Consistency::One);
            b.put_u8(0);
        });
        let result = ServerError::decode(&mut r, ProtocolVersion::V4);
        assert!(matches!(
            result,
            Err(ProtocolError::NotEnoughBytes { kind: "int", .. })
        ));
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::UnsupportedVersion(9);
        assert!(err.to_string().contains('9'));

        let err = ProtocolError::FrameTooLarge { size: 100, max: 50 };
        assert!(err.to_string().contains("100"));

        let err = ProtocolError::NotEnoughBytes {
            kind: "string",
            needed: 10,
            available: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("string") && msg.contains("10") && msg.contains('2'));

        let err = ProtocolError::requires("unset values", 4, ProtocolVersion::V3);
        assert!(err.to_string().contains("version 4"));
    }
}
