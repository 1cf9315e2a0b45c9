//! Frame encoder and decoders.

use crate::compression::Compressor;
use crate::error::ProtocolError;
use crate::frame::{FrameFlags, FrameHeader, Opcode, ProtocolVersion, StreamId};
use crate::request::{write_custom_payload, Request};
use crate::response::ParsedResponse;
use crate::MAX_FRAME_SIZE;
use bytes::{Buf, Bytes, BytesMut};
use std::sync::Arc;

/// A frame as read off the wire: parsed header, body still encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub header: FrameHeader,
    pub body: Bytes,
}

/// Encodes requests into frames for one negotiated version.
#[derive(Debug, Clone)]
pub struct Encoder {
    version: ProtocolVersion,
    compressor: Option<Arc<dyn Compressor>>,
}

impl Encoder {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            version,
            compressor: None,
        }
    }

    /// Compresses every body except STARTUP and OPTIONS.
    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn compressor(&self) -> Option<&Arc<dyn Compressor>> {
        self.compressor.as_ref()
    }

    /// Encodes `request` on `stream` as `[header][custom payload][body]`.
    pub fn encode(
        &self,
        request: &Request,
        stream: StreamId,
        tracing: bool,
    ) -> Result<BytesMut, ProtocolError> {
        let version = self.version;
        let opcode = request.opcode();
        let payload = request.custom_payload();

        let mut flags = FrameFlags::new();
        if version >= ProtocolVersion::V5 {
            flags = flags.with_beta();
        }
        if tracing {
            flags = flags.with_tracing();
        }
        if payload.is_some() {
            if version < ProtocolVersion::V4 {
                return Err(ProtocolError::requires("custom payloads", 4, version));
            }
            flags = flags.with_custom_payload();
        }

        let compressor = self
            .compressor
            .as_ref()
            .filter(|_| !matches!(opcode, Opcode::Startup | Opcode::Options));
        if compressor.is_some() {
            flags = flags.with_compressed();
        }

        let header_len = version.header_len();
        let mut buf = BytesMut::with_capacity(header_len + 64);
        FrameHeader {
            version,
            is_response: false,
            flags,
            stream,
            opcode,
            length: 0,
        }
        .encode(&mut buf);

        if let Some(payload) = payload {
            write_custom_payload(&mut buf, payload)?;
        }
        request.encode_body(&mut buf, version)?;

        if let Some(compressor) = compressor {
            let body = buf.split_off(header_len);
            let compressed = compressor.encode(&body)?;
            buf.extend_from_slice(&compressed);
        }

        let body_len = buf.len() - header_len;
        if body_len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: body_len,
                max: MAX_FRAME_SIZE,
            });
        }
        buf[header_len - 4..header_len].copy_from_slice(&(body_len as u32).to_be_bytes());
        Ok(buf)
    }
}

/// Decompresses (if flagged) and decodes a response frame.
pub fn decode_response(
    frame: RawFrame,
    compressor: Option<&dyn Compressor>,
) -> Result<ParsedResponse, ProtocolError> {
    let RawFrame { header, body } = frame;
    if !header.is_response {
        return Err(ProtocolError::UnexpectedDirection(header.version.as_u8()));
    }

    let body = if header.flags.is_compressed() {
        let compressor = compressor.ok_or(ProtocolError::MissingCompressor)?;
        Bytes::from(compressor.decode(&body)?)
    } else {
        body
    };
    ParsedResponse::decode(header, body)
}

/// Incremental frame splitter over a byte buffer.
pub struct Decoder {
    buffer: BytesMut,
    max_frame_size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max.min(MAX_FRAME_SIZE);
        self
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns the next complete frame, or `None` if more bytes are needed.
    pub fn decode_frame(&mut self) -> Result<Option<RawFrame>, ProtocolError> {
        let Some(&first) = self.buffer.first() else {
            return Ok(None);
        };
        let header_len = FrameHeader::len_from_first_byte(first)?;
        if self.buffer.len() < header_len {
            return Ok(None);
        }

        let header = FrameHeader::decode(&self.buffer[..header_len], self.max_frame_size)?;
        if self.buffer.len() < header_len + header.length {
            return Ok(None);
        }

        self.buffer.advance(header_len);
        let body = self.buffer.split_to(header.length).freeze();
        Ok(Some(RawFrame { header, body }))
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
