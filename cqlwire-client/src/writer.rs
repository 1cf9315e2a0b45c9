//! Write path: a deadline-aware writer and an optional write coalescer.
//!
//! Every frame goes out whole; the writer mutex keeps two frames' bytes from
//! interleaving. A failed write reports whether any of the frame's bytes hit
//! the transport, because a partially written frame desynchronizes the
//! stream for every other call on the connection.

use crate::error::ClientError;
use bytes::Bytes;
use std::io::{self, IoSlice};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A failed frame write.
#[derive(Debug, Clone)]
pub struct WriteFailure {
    pub error: ClientError,
    /// Some of the frame's bytes were handed to the transport.
    pub started: bool,
}

impl WriteFailure {
    fn not_started(error: ClientError) -> Self {
        Self {
            error,
            started: false,
        }
    }
}

/// Serializes writes to the transport and bounds each one by a deadline.
pub struct DeadlineWriter<W> {
    inner: Mutex<W>,
    timeout: Option<Duration>,
}

impl<W: AsyncWrite + Unpin + Send> DeadlineWriter<W> {
    pub fn new(inner: W, timeout: Option<Duration>) -> Self {
        Self {
            inner: Mutex::new(inner),
            timeout,
        }
    }

    /// Writes one frame.
    pub async fn write_frame(&self, frame: Bytes) -> Result<(), WriteFailure> {
        let frames = [frame];
        let (written, result) = self.write_buffers(&frames).await;
        frame_outcome(&result, 0, frames[0].len(), written, frames[0].len())
    }

    /// Writes `bufs` back to back with vectored writes, then flushes.
    ///
    /// Returns how many bytes the transport accepted alongside the outcome.
    /// A flush failure reports every byte as written.
    pub async fn write_buffers(&self, bufs: &[Bytes]) -> (usize, Result<(), ClientError>) {
        let total: usize = bufs.iter().map(Bytes::len).sum();
        let mut writer = self.inner.lock().await;
        let mut written = 0;

        let write = write_all(&mut *writer, bufs, total, &mut written);
        let result = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, write)
                .await
                .unwrap_or(Err(ClientError::Timeout)),
            None => write.await,
        };
        (written, result)
    }

    /// Shuts the transport down for writing.
    pub async fn shutdown(&self) {
        let _ = self.inner.lock().await.shutdown().await;
    }
}

async fn write_all<W: AsyncWrite + Unpin>(
    writer: &mut W,
    bufs: &[Bytes],
    total: usize,
    written: &mut usize,
) -> Result<(), ClientError> {
    while *written < total {
        let slices = remaining_slices(bufs, *written);
        let n = writer.write_vectored(&slices).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "transport accepted 0 bytes").into());
        }
        *written += n;
    }
    writer.flush().await?;
    Ok(())
}

/// Slices covering everything after the first `skip` bytes of `bufs`.
fn remaining_slices(bufs: &[Bytes], skip: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(bufs.len());
    let mut offset = 0;
    for buf in bufs {
        let end = offset + buf.len();
        if skip < end {
            slices.push(IoSlice::new(&buf[skip.saturating_sub(offset)..]));
        }
        offset = end;
    }
    slices
}

/// Classifies the frame occupying `[start, end)` of a batch of `total` bytes.
fn frame_outcome(
    result: &Result<(), ClientError>,
    start: usize,
    end: usize,
    written: usize,
    total: usize,
) -> Result<(), WriteFailure> {
    let Err(error) = result else {
        return Ok(());
    };
    if written == total {
        // Flush failed after everything was handed over.
        return Err(WriteFailure {
            error: error.clone(),
            started: true,
        });
    }
    if end <= written {
        Ok(())
    } else {
        Err(WriteFailure {
            error: error.clone(),
            started: start < written,
        })
    }
}

struct PendingWrite {
    frame: Bytes,
    done: oneshot::Sender<Result<(), WriteFailure>>,
}

/// Batches frames written within a short window into one vectored flush.
///
/// The flush task sleeps until a write arrives, waits out the window, then
/// writes everything queued so far in a single pass. Writers block until
/// their frame's batch has been flushed.
pub struct WriteCoalescer {
    tx: mpsc::UnboundedSender<PendingWrite>,
    task: JoinHandle<()>,
}

impl WriteCoalescer {
    pub fn spawn<W>(
        writer: Arc<DeadlineWriter<W>>,
        window: Duration,
        shutdown: CancellationToken,
    ) -> Self
    where
        W: AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(flush_loop(writer, window, rx, shutdown));
        Self { tx, task }
    }

    pub async fn write(&self, frame: Bytes) -> Result<(), WriteFailure> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(PendingWrite { frame, done })
            .map_err(|_| WriteFailure::not_started(ClientError::ConnectionClosed))?;
        rx.await
            .unwrap_or(Err(WriteFailure::not_started(ClientError::ConnectionClosed)))
    }
}

impl Drop for WriteCoalescer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn flush_loop<W>(
    writer: Arc<DeadlineWriter<W>>,
    window: Duration,
    mut rx: mpsc::UnboundedReceiver<PendingWrite>,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Unpin + Send + Sync,
{
    loop {
        let first = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            pending = rx.recv() => match pending {
                Some(pending) => pending,
                None => break,
            },
        };

        let mut batch = vec![first];
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                fail_closed(batch);
                break;
            }
            _ = tokio::time::sleep(window) => {}
        }
        while let Ok(pending) = rx.try_recv() {
            batch.push(pending);
        }
        flush_batch(&writer, batch).await;
    }

    rx.close();
    let mut rest = Vec::new();
    while let Ok(pending) = rx.try_recv() {
        rest.push(pending);
    }
    fail_closed(rest);
}

async fn flush_batch<W>(writer: &DeadlineWriter<W>, batch: Vec<PendingWrite>)
where
    W: AsyncWrite + Unpin + Send,
{
    let frames: Vec<Bytes> = batch.iter().map(|p| p.frame.clone()).collect();
    let total: usize = frames.iter().map(Bytes::len).sum();
    tracing::trace!(frames = frames.len(), bytes = total, "flushing coalesced writes");

    let (written, result) = writer.write_buffers(&frames).await;
    let mut start = 0;
    for pending in batch {
        let end = start + pending.frame.len();
        let _ = pending
            .done
            .send(frame_outcome(&result, start, end, written, total));
        start = end;
    }
}

fn fail_closed(batch: Vec<PendingWrite>) {
    for pending in batch {
        let _ = pending
            .done
            .send(Err(WriteFailure::not_started(ClientError::ConnectionClosed)));
    }
}

/// How a connection puts frames on the wire.
pub enum WritePath<W> {
    Direct(Arc<DeadlineWriter<W>>),
    Coalesced {
        writer: Arc<DeadlineWriter<W>>,
        coalescer: WriteCoalescer,
    },
}

impl<W> WritePath<W>
where
    W: AsyncWrite + Unpin + Send + Sync + 'static,
{
    /// Builds the write path; `window` of `None` writes directly.
    pub fn new(
        writer: Arc<DeadlineWriter<W>>,
        window: Option<Duration>,
        shutdown: CancellationToken,
    ) -> Self {
        match window {
            Some(window) => WritePath::Coalesced {
                coalescer: WriteCoalescer::spawn(Arc::clone(&writer), window, shutdown),
                writer,
            },
            None => WritePath::Direct(writer),
        }
    }

    pub fn is_coalesced(&self) -> bool {
        matches!(self, WritePath::Coalesced { .. })
    }

    /// Writes one frame.
    ///
    /// The write proceeds even if the caller stops waiting, so a dropped
    /// request never leaves half a frame on the wire.
    pub async fn write(&self, frame: Bytes) -> Result<(), WriteFailure> {
        match self {
            WritePath::Direct(writer) => {
                let writer = Arc::clone(writer);
                tokio::spawn(async move { writer.write_frame(frame).await })
                    .await
                    .unwrap_or_else(|_| {
                        Err(WriteFailure {
                            error: ClientError::ConnectionClosed,
                            started: true,
                        })
                    })
            }
            WritePath::Coalesced { coalescer, .. } => coalescer.write(frame).await,
        }
    }

    pub async fn shutdown(&self) {
        match self {
            WritePath::Direct(writer) | WritePath::Coalesced { writer, .. } => {
                writer.shutdown().await
            }
        }
    }
}
