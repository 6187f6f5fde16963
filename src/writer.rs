//! Per-connection writer task.
//!
//! Every connection owns one writer task fed through an mpsc channel. All
//! outbound traffic for that socket (command responses, status broadcasts,
//! preview frames) goes through it, so frames are never interleaved
//! mid-write and responses leave in the order they were queued.
//!
//! # Architecture
//!
//! ```text
//! Read loop ────┐
//! Reporter ─────┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► TcpStream
//! Preview ──────┘
//! ```
//!
//! Queued frames are batched into single `write_vectored` calls. Preview
//! frames report their queue-plus-write latency to the congestion detector
//! once written.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::congestion::CongestionDetector;
use crate::error::{CamwireError, Result};
use crate::protocol::{build_frame_parts, Frame, HEADER_SIZE, PROTOCOL_VERSION, TRAILER_SIZE};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 256;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// What an outbound frame carries; only preview frames feed the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Response,
    Report,
    Preview,
}

/// A frame ready to be written, split for scatter/gather I/O.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    /// Magic, version, length and command.
    pub header: [u8; HEADER_SIZE],
    /// Data bytes, shared without copying.
    pub data: Bytes,
    /// Checksum and footer.
    pub trailer: [u8; TRAILER_SIZE],
    pub kind: FrameKind,
    pub queued_at: Instant,
}

impl OutboundFrame {
    /// Build a frame for `command` around `data`.
    ///
    /// Fails with `FrameTooLarge` if the data does not fit the length field.
    pub fn new(command: u8, data: Bytes, kind: FrameKind) -> Result<Self> {
        let (header, trailer) = build_frame_parts(PROTOCOL_VERSION, command, &data)?;
        Ok(Self {
            header,
            data,
            trailer,
            kind,
            queued_at: Instant::now(),
        })
    }

    /// A command response.
    pub fn response(frame: &Frame) -> Result<Self> {
        Self::new(frame.command, frame.data.clone(), FrameKind::Response)
    }

    /// Total size of this frame on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.data.len() + TRAILER_SIZE
    }

    /// Command code of this frame.
    #[inline]
    pub fn command(&self) -> u8 {
        self.header[HEADER_SIZE - 1]
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum pending frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for frame queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for queueing frames to one connection's writer task.
///
/// Cheap to clone. Dropping every clone stops the writer task.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    fn new(
        tx: mpsc::Sender<OutboundFrame>,
        pending: Arc<AtomicUsize>,
        max_pending: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            tx,
            pending,
            max_pending,
            timeout,
        }
    }

    /// Queue a frame, waiting (up to the backpressure timeout) for room.
    ///
    /// Used for command responses, which must not be dropped.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            self.wait_for_backpressure().await?;
        }

        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.send(frame).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            CamwireError::ConnectionClosed
        })
    }

    async fn wait_for_backpressure(&self) -> Result<()> {
        let start = Instant::now();
        let check_interval = Duration::from_micros(500);

        loop {
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }

            if start.elapsed() > self.timeout {
                return Err(CamwireError::BackpressureTimeout);
            }

            tokio::time::sleep(check_interval).await;
        }
    }

    /// Queue a frame without waiting.
    ///
    /// Returns `Err(BackpressureTimeout)` immediately if at capacity. Used
    /// for best-effort traffic: broadcasts and preview frames.
    pub fn try_send(&self, frame: OutboundFrame) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            return Err(CamwireError::BackpressureTimeout);
        }

        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.try_send(frame).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::Release);
            match e {
                mpsc::error::TrySendError::Full(_) => CamwireError::BackpressureTimeout,
                mpsc::error::TrySendError::Closed(_) => CamwireError::ConnectionClosed,
            }
        })
    }

    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    /// Frames queued but not yet written.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Whether the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for queueing frames.
///
/// When `detector` is set, every written preview frame reports its latency.
/// The returned `JoinHandle` completes when all handles are dropped or a
/// write fails.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
    detector: Option<Arc<CongestionDetector>>,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle::new(
        tx,
        pending.clone(),
        config.max_pending_frames,
        config.backpressure_timeout,
    );

    let task = tokio::spawn(writer_loop(rx, writer, pending, detector));

    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
    detector: Option<Arc<CongestionDetector>>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(f) => f,
            None => return Ok(()),
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        let result = write_batch(&mut writer, &batch).await;
        pending.fetch_sub(batch_size, Ordering::Release);
        result?;

        if let Some(detector) = &detector {
            for frame in batch.iter().filter(|f| f.kind == FrameKind::Preview) {
                detector.record_latency(frame.queued_at.elapsed());
            }
        }
    }
}

/// Write a batch of frames using scatter/gather I/O.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total_size: usize = batch.iter().map(|f| f.size()).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        if slices.is_empty() {
            break;
        }

        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(CamwireError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }

        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build the slice list for everything after the first `skip_bytes` bytes.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 3);
    let mut offset = 0;

    for frame in batch {
        for part in [&frame.header[..], &frame.data[..], &frame.trailer[..]] {
            let end = offset + part.len();
            if !part.is_empty() && skip_bytes < end {
                let start = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&part[start..]));
            }
            offset = end;
        }
    }

    slices
}
