//! Frame header layout for the CQL native protocol.
//!
//! Header layout for v3 and later (9 bytes):
//!
//! ```text
//! +---------+-------+-----------+--------+-------------+
//! | version | flags | stream id | opcode | body length |
//! | 1 byte  | 1 byte|  2 bytes  | 1 byte |   4 bytes   |
//! +---------+-------+-----------+--------+-------------+
//! ```
//!
//! Versions 1 and 2 use a single signed byte for the stream id, giving an
//! 8-byte header. The high bit of the version byte is the direction
//! (set on responses).

use crate::error::ProtocolError;
use crate::MAX_FRAME_SIZE;
use bytes::BufMut;
use std::fmt;

/// Multiplexing identifier carried in every header.
pub type StreamId = i16;

/// Stream id the server uses for pushed events.
pub const EVENT_STREAM_ID: StreamId = -1;

/// Direction bit of the version byte; set on server responses.
pub const RESPONSE_DIRECTION: u8 = 0x80;

const VERSION_MASK: u8 = 0x7F;

/// A negotiated protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    V1 = 1,
    V2 = 2,
    V3 = 3,
    V4 = 4,
    V5 = 5,
}

impl ProtocolVersion {
    pub fn from_u8(version: u8) -> Result<Self, ProtocolError> {
        match version {
            1 => Ok(ProtocolVersion::V1),
            2 => Ok(ProtocolVersion::V2),
            3 => Ok(ProtocolVersion::V3),
            4 => Ok(ProtocolVersion::V4),
            5 => Ok(ProtocolVersion::V5),
            other => Err(ProtocolError::UnsupportedVersion(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Size of the frame header at this version.
    pub fn header_len(self) -> usize {
        if self >= ProtocolVersion::V3 {
            9
        } else {
            8
        }
    }

    /// Number of stream ids addressable at this version, including the reserved id 0.
    pub fn max_streams(self) -> usize {
        if self >= ProtocolVersion::V3 {
            32768
        } else {
            128
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.as_u8())
    }
}

/// Frame opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Error = 0x00,
    Startup = 0x01,
    Ready = 0x02,
    Authenticate = 0x03,
    Options = 0x05,
    Supported = 0x06,
    Query = 0x07,
    Result = 0x08,
    Prepare = 0x09,
    Execute = 0x0A,
    Register = 0x0B,
    Event = 0x0C,
    Batch = 0x0D,
    AuthChallenge = 0x0E,
    AuthResponse = 0x0F,
    AuthSuccess = 0x10,
}

impl Opcode {
    pub fn from_u8(byte: u8) -> Result<Self, ProtocolError> {
        let op = match byte {
            0x00 => Opcode::Error,
            0x01 => Opcode::Startup,
            0x02 => Opcode::Ready,
            0x03 => Opcode::Authenticate,
            0x05 => Opcode::Options,
            0x06 => Opcode::Supported,
            0x07 => Opcode::Query,
            0x08 => Opcode::Result,
            0x09 => Opcode::Prepare,
            0x0A => Opcode::Execute,
            0x0B => Opcode::Register,
            0x0C => Opcode::Event,
            0x0D => Opcode::Batch,
            0x0E => Opcode::AuthChallenge,
            0x0F => Opcode::AuthResponse,
            0x10 => Opcode::AuthSuccess,
            other => return Err(ProtocolError::UnknownOpcode(other)),
        };
        Ok(op)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns true for opcodes only the server sends.
    pub fn is_response(self) -> bool {
        matches!(
            self,
            Opcode::Error
                | Opcode::Ready
                | Opcode::Authenticate
                | Opcode::Supported
                | Opcode::Result
                | Opcode::Event
                | Opcode::AuthChallenge
                | Opcode::AuthSuccess
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::Error => "ERROR",
            Opcode::Startup => "STARTUP",
            Opcode::Ready => "READY",
            Opcode::Authenticate => "AUTHENTICATE",
            Opcode::Options => "OPTIONS",
            Opcode::Supported => "SUPPORTED",
            Opcode::Query => "QUERY",
            Opcode::Result => "RESULT",
            Opcode::Prepare => "PREPARE",
            Opcode::Execute => "EXECUTE",
            Opcode::Register => "REGISTER",
            Opcode::Event => "EVENT",
            Opcode::Batch => "BATCH",
            Opcode::AuthChallenge => "AUTH_CHALLENGE",
            Opcode::AuthResponse => "AUTH_RESPONSE",
            Opcode::AuthSuccess => "AUTH_SUCCESS",
        };
        f.write_str(name)
    }
}

/// Frame flags bitfield.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Body is compressed with the negotiated compressor.
    pub const COMPRESSED: u8 = 0x01;
    /// Request tracing; responses carry a trace id.
    pub const TRACING: u8 = 0x02;
    /// Body starts with a custom payload map (v4+).
    pub const CUSTOM_PAYLOAD: u8 = 0x04;
    /// Response body starts with a warning list (v4+).
    pub const WARNING: u8 = 0x08;
    /// Beta protocol version in use.
    pub const BETA: u8 = 0x10;

    const VALID_MASK: u8 = 0x1F;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_compressed(mut self) -> Self {
        self.0 |= Self::COMPRESSED;
        self
    }

    pub fn with_tracing(mut self) -> Self {
        self.0 |= Self::TRACING;
        self
    }

    pub fn with_custom_payload(mut self) -> Self {
        self.0 |= Self::CUSTOM_PAYLOAD;
        self
    }

    pub fn with_warning(mut self) -> Self {
        self.0 |= Self::WARNING;
        self
    }

    pub fn with_beta(mut self) -> Self {
        self.0 |= Self::BETA;
        self
    }

    pub fn is_compressed(&self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    pub fn is_tracing(&self) -> bool {
        self.0 & Self::TRACING != 0
    }

    pub fn has_custom_payload(&self) -> bool {
        self.0 & Self::CUSTOM_PAYLOAD != 0
    }

    pub fn has_warning(&self) -> bool {
        self.0 & Self::WARNING != 0
    }

    pub fn is_beta(&self) -> bool {
        self.0 & Self::BETA != 0
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Result<Self, ProtocolError> {
        if bits & !Self::VALID_MASK != 0 {
            return Err(ProtocolError::InvalidFlags(bits));
        }
        Ok(Self(bits))
    }
}

/// A parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: ProtocolVersion,
    /// True when the direction bit is set (server to client).
    pub is_response: bool,
    pub flags: FrameFlags,
    pub stream: StreamId,
    pub opcode: Opcode,
    pub length: usize,
}

impl FrameHeader {
    /// Returns the full header length implied by the first byte of a frame.
    pub fn len_from_first_byte(byte: u8) -> Result<usize, ProtocolError> {
        Ok(ProtocolVersion::from_u8(byte & VERSION_MASK)?.header_len())
    }

    /// Writes the header. The length is written as-is and is usually patched later.
    pub fn encode(&self, buf: &mut impl BufMut) {
        let mut version = self.version.as_u8();
        if self.is_response {
            version |= RESPONSE_DIRECTION;
        }
        buf.put_u8(version);
        buf.put_u8(self.flags.bits());
        if self.version >= ProtocolVersion::V3 {
            buf.put_i16(self.stream);
        } else {
            buf.put_i8(self.stream as i8);
        }
        buf.put_u8(self.opcode.as_u8());
        buf.put_u32(self.length as u32);
    }

    /// Parses a header from a buffer holding at least the full header.
    ///
    /// Fails with [`ProtocolError::FrameTooLarge`] when the declared body exceeds
    /// `max_frame_size`; callers reading from a transport must still drain
    /// `length` bytes in that case. Use [`FrameHeader::decode_unchecked`] to
    /// obtain the header anyway.
    pub fn decode(buf: &[u8], max_frame_size: usize) -> Result<Self, ProtocolError> {
        let header = Self::decode_unchecked(buf)?;
        let max = max_frame_size.min(MAX_FRAME_SIZE);
        if header.length > max {
            return Err(ProtocolError::FrameTooLarge {
                size: header.length,
                max,
            });
        }
        Ok(header)
    }

    /// Parses a header without enforcing the maximum frame size.
    pub fn decode_unchecked(buf: &[u8]) -> Result<Self, ProtocolError> {
        let first = *buf.first().ok_or(ProtocolError::NotEnoughBytes {
            kind: "frame header",
            needed: 1,
            available: 0,
        })?;
        let version = ProtocolVersion::from_u8(first & VERSION_MASK)?;
        let header_len = version.header_len();
        if buf.len() < header_len {
            return Err(ProtocolError::NotEnoughBytes {
                kind: "frame header",
                needed: header_len,
                available: buf.len(),
            });
        }

        let flags = FrameFlags::from_bits(buf[1])?;
        let (stream, rest) = if version >= ProtocolVersion::V3 {
            (i16::from_be_bytes([buf[2], buf[3]]), &buf[4..])
        } else {
            (buf[2] as i8 as i16, &buf[3..])
        };
        let opcode = Opcode::from_u8(rest[0])?;
        let length = i32::from_be_bytes([rest[1], rest[2], rest[3], rest[4]]);
        if length < 0 {
            return Err(ProtocolError::NegativeBodyLength(length));
        }

        Ok(Self {
            version,
            is_response: first & RESPONSE_DIRECTION != 0,
            flags,
            stream,
            opcode,
            length: length as usize,
        })
    }
}
