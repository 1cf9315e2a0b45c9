//! Reads whole frames off the transport.

use crate::error::ClientError;
use bytes::{Bytes, BytesMut};
use cqlwire_protocol::{FrameHeader, ProtocolError, RawFrame, MAX_HEADER_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt};

/// A frame read from the transport.
#[derive(Debug)]
pub enum Incoming {
    Frame(RawFrame),
    /// The body exceeded the frame size limit and was discarded.
    Oversized {
        header: FrameHeader,
        error: ProtocolError,
    },
}

/// Splits an ordered byte stream into frames.
///
/// No deadline is applied: an idle connection is expected to block here.
pub struct FrameReader<R> {
    inner: R,
    max_frame_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_frame_size: usize) -> Self {
        Self {
            inner,
            max_frame_size,
        }
    }

    /// Reads the next frame.
    ///
    /// A body over the size limit is drained so the following header is
    /// still found at the right offset; any other header error is returned
    /// as the stream can no longer be trusted.
    pub async fn read_frame(&mut self) -> Result<Incoming, ClientError> {
        let mut header_buf = [0u8; MAX_HEADER_SIZE];
        self.inner.read_exact(&mut header_buf[..1]).await?;
        let header_len = FrameHeader::len_from_first_byte(header_buf[0])?;
        self.inner.read_exact(&mut header_buf[1..header_len]).await?;
        let header_buf = &header_buf[..header_len];

        let header = match FrameHeader::decode(header_buf, self.max_frame_size) {
            Ok(header) => header,
            Err(error @ ProtocolError::FrameTooLarge { .. }) => {
                let header = FrameHeader::decode_unchecked(header_buf)?;
                self.discard(header.length).await?;
                return Ok(Incoming::Oversized { header, error });
            }
            Err(e) => return Err(e.into()),
        };

        let body = self.read_body(header.length).await?;
        Ok(Incoming::Frame(RawFrame { header, body }))
    }

    async fn read_body(&mut self, len: usize) -> Result<Bytes, ClientError> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        let mut body = BytesMut::zeroed(len);
        self.inner.read_exact(&mut body).await?;
        Ok(body.freeze())
    }

    /// Skips `len` bytes without buffering them.
    pub async fn discard(&mut self, len: usize) -> Result<(), ClientError> {
        let mut limited = (&mut self.inner).take(len as u64);
        let skipped = tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
        if skipped < len as u64 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        Ok(())
    }
}
