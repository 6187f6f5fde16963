//! Congestion-aware live preview pipeline.
//!
//! # Architecture
//!
//! ```text
//! Grab thread (blocking) ──► watch (latest only) ──► encode task ──► previewing writers
//!        ▲                                                │
//!        └── paced by fps                    CongestionDetector directive
//! ```
//!
//! The camera grab loop runs on tokio's blocking pool because the camera
//! call blocks. It publishes each frame into a `watch` channel, which keeps
//! only the newest value: a frame that arrives while the previous one is
//! still being encoded replaces it instead of queuing behind it.
//!
//! For each frame the encode task asks the congestion detector for a
//! directive. A skipped frame costs nothing else: no buffer lease, no
//! encode, no send. Otherwise the frame is converted to RGB, downscaled to
//! the preview target if larger, JPEG-encoded into a leased pool buffer and
//! sent to every connection with the previewing flag. The lease lives only
//! for that one frame and is returned on every exit path.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ExtendedColorType, GrayImage, RgbImage};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::buffer_pool::{BufferPool, PoolStats};
use crate::camera::{Camera, CameraError, CameraHandle, ImageFormat, RawImage};
use crate::congestion::CongestionDetector;
use crate::error::{CamwireError, Result};
use crate::protocol::{
    commands, put_preview_header, ErrorCode, Resolution, DEFAULT_RESOLUTION_INDEX, MAX_DATA_SIZE,
    PREVIEW_HEADER_SIZE, RESOLUTION_TABLE,
};
use crate::session::{Flag, SessionRegistry};
use crate::writer::{FrameKind, OutboundFrame};

/// Lowest preview frame rate a client can request.
pub const MIN_FPS: u8 = 5;

/// Preview tuning.
#[derive(Debug, Clone)]
pub struct PreviewConfig {
    /// Quality used when dynamic quality is off.
    pub jpeg_quality: u8,
    /// Frame rate used when a client asks for 0.
    pub default_fps: u8,
    /// Upper bound for requested frame rates.
    pub max_fps: u8,
    /// Encode buffers kept in the pool.
    pub buffer_pool_size: usize,
    /// Initial capacity of each pooled buffer.
    pub buffer_capacity: usize,
    /// Honour the detector's skip directive.
    pub enable_skip_frame: bool,
    /// Honour the detector's quality directive.
    pub enable_dynamic_quality: bool,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: 80,
            default_fps: 10,
            max_fps: 30,
            buffer_pool_size: crate::buffer_pool::DEFAULT_POOL_SIZE,
            buffer_capacity: crate::buffer_pool::DEFAULT_BUFFER_CAPACITY,
            enable_skip_frame: true,
            enable_dynamic_quality: true,
        }
    }
}

/// Target resolution and pacing of one preview session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviewSettings {
    /// Frames larger than this are downscaled.
    pub resolution: Resolution,
    /// Grab rate.
    pub fps: u8,
}

impl PreviewSettings {
    /// Resolve `PREVIEW_START` arguments against the resolution table.
    ///
    /// An fps of 0 selects the configured default; anything else is clamped
    /// to `[MIN_FPS, max_fps]`.
    pub fn from_request(resolution_index: u8, fps: u8, config: &PreviewConfig) -> Result<Self> {
        let resolution = Resolution::from_index(resolution_index as u16).ok_or_else(|| {
            CameraError::new(
                ErrorCode::UnsupportedResolution,
                format!("no preview resolution at index {}", resolution_index),
            )
        })?;
        let max_fps = config.max_fps.max(MIN_FPS);
        let fps = if fps == 0 { config.default_fps } else { fps };
        Ok(Self {
            resolution,
            fps: fps.clamp(MIN_FPS, max_fps),
        })
    }

    /// Time between grabs.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(1) / self.fps.max(1) as u32
    }
}

/// Counters for the current (or last) preview session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreviewStats {
    /// Frames taken from the camera.
    pub grabbed: u64,
    /// Frames handed to the viewers' send paths.
    pub sent: u64,
    /// Frames dropped by the skip directive.
    pub skipped: u64,
    /// Encode failures and oversize frames.
    pub dropped: u64,
    /// Quality of the last encoded frame.
    pub quality: u8,
    /// Mean time per encoded frame, retries included.
    pub avg_encode_time: Duration,
    /// Encode buffer pool counters.
    pub pool: PoolStats,
}

/// What happened to one grabbed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Encoded and handed to this many connections.
    Sent { receivers: usize, bytes: usize },
    /// Dropped by the skip directive before any work.
    Skipped,
    /// Nobody is previewing.
    NoViewers,
    /// Encode failed or the result did not fit in a frame.
    Dropped,
}

#[derive(Default)]
struct Counters {
    grabbed: AtomicU64,
    sent: AtomicU64,
    skipped: AtomicU64,
    dropped: AtomicU64,
    encoded: AtomicU64,
    encode_micros: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        for c in [
            &self.grabbed,
            &self.sent,
            &self.skipped,
            &self.dropped,
            &self.encoded,
            &self.encode_micros,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}

/// Per-frame processing shared by the encode task and tests.
struct PreviewCore {
    config: PreviewConfig,
    sessions: Arc<SessionRegistry>,
    detector: Arc<CongestionDetector>,
    pool: BufferPool,
    target: Mutex<Resolution>,
    seq: AtomicU32,
    last_quality: AtomicU8,
    active: AtomicBool,
    counters: Counters,
}

impl PreviewCore {
    fn process_frame(&self, img: &RawImage) -> TickOutcome {
        let seq = self.seq.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        self.counters.grabbed.fetch_add(1, Ordering::Relaxed);

        let backlog = self.sessions.max_pending(Flag::Previewing);
        let directive = self.detector.observe(backlog);

        if self.config.enable_skip_frame && directive.should_skip(seq) {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("Skipping preview frame {} ({:?})", seq, directive.level);
            return TickOutcome::Skipped;
        }

        if !self.sessions.any_flag(Flag::Previewing) {
            return TickOutcome::NoViewers;
        }

        let quality = if self.config.enable_dynamic_quality {
            directive.quality
        } else {
            self.config.jpeg_quality
        };
        let target = *self.target.lock().unwrap_or_else(|e| e.into_inner());

        let mut lease = self.pool.acquire();
        let started = Instant::now();
        let used = match self.encode_fitting(img, target, quality, &mut lease) {
            Ok(Some(used)) => used,
            Ok(None) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "Preview frame {} is {} bytes even at quality {}, exceeds frame limit",
                    seq,
                    lease.len(),
                    self.detector.config().min_quality
                );
                return TickOutcome::Dropped;
            }
            Err(e) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Preview frame {} encode failed: {}", seq, e);
                return TickOutcome::Dropped;
            }
        };
        self.counters.encoded.fetch_add(1, Ordering::Relaxed);
        self.counters
            .encode_micros
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        self.last_quality.store(used, Ordering::Relaxed);
        if used < quality {
            self.detector.limit_quality(used);
        }

        let data_len = PREVIEW_HEADER_SIZE + lease.len();
        let mut data = BytesMut::with_capacity(data_len);
        put_preview_header(&mut data, seq, lease.len());
        data.put_slice(&lease);
        drop(lease);

        let frame = match OutboundFrame::new(commands::PREVIEW_FRAME, data.freeze(), FrameKind::Preview) {
            Ok(frame) => frame,
            Err(e) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Preview frame {} not framed: {}", seq, e);
                return TickOutcome::Dropped;
            }
        };
        let bytes = frame.size();
        let receivers = self.sessions.send_to_flagged(Flag::Previewing, &frame);
        self.counters.sent.fetch_add(1, Ordering::Relaxed);

        TickOutcome::Sent { receivers, bytes }
    }

    /// Encode at `quality`, stepping down to the detector's floor until the
    /// frame fits. Returns the quality used, or `None` if nothing fits.
    fn encode_fitting(
        &self,
        img: &RawImage,
        target: Resolution,
        quality: u8,
        out: &mut Vec<u8>,
    ) -> Result<Option<u8>> {
        let limits = self.detector.config();
        let step = limits.quality_step.max(1);
        let mut quality = quality;
        loop {
            out.clear();
            encode_jpeg(img, target, quality, out)?;
            if PREVIEW_HEADER_SIZE + out.len() <= MAX_DATA_SIZE {
                return Ok(Some(quality));
            }
            if quality <= limits.min_quality {
                return Ok(None);
            }
            tracing::debug!(
                "Preview encode is {} bytes at quality {}, retrying lower",
                out.len(),
                quality
            );
            quality = quality.saturating_sub(step).max(limits.min_quality);
        }
    }

    fn reset(&self, target: Resolution) {
        *self.target.lock().unwrap_or_else(|e| e.into_inner()) = target;
        self.seq.store(0, Ordering::Release);
        self.counters.reset();
        self.detector.reset();
        self.last_quality
            .store(self.detector.directive().quality, Ordering::Relaxed);
    }

    fn stats(&self) -> PreviewStats {
        let encoded = self.counters.encoded.load(Ordering::Relaxed);
        let micros = self.counters.encode_micros.load(Ordering::Relaxed);
        PreviewStats {
            grabbed: self.counters.grabbed.load(Ordering::Relaxed),
            sent: self.counters.sent.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            quality: self.last_quality.load(Ordering::Relaxed),
            avg_encode_time: Duration::from_micros(micros.checked_div(encoded).unwrap_or(0)),
            pool: self.pool.stats(),
        }
    }
}

struct Running {
    stop: Arc<AtomicBool>,
    grabber: JoinHandle<()>,
    encoder: JoinHandle<()>,
    settings: PreviewSettings,
}

/// Preview pipeline; at most one preview session runs at a time.
pub struct PreviewPipeline {
    core: Arc<PreviewCore>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl PreviewPipeline {
    pub fn new(
        config: PreviewConfig,
        sessions: Arc<SessionRegistry>,
        detector: Arc<CongestionDetector>,
    ) -> Self {
        let pool = BufferPool::new(config.buffer_pool_size, config.buffer_capacity);
        let quality = detector.directive().quality;
        Self {
            core: Arc::new(PreviewCore {
                config,
                sessions,
                detector,
                pool,
                target: Mutex::new(RESOLUTION_TABLE[DEFAULT_RESOLUTION_INDEX as usize]),
                seq: AtomicU32::new(0),
                last_quality: AtomicU8::new(quality),
                active: AtomicBool::new(false),
                counters: Counters::default(),
            }),
            running: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PreviewConfig {
        &self.core.config
    }

    /// Whether a preview session is running.
    pub fn is_running(&self) -> bool {
        self.core.active.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PreviewStats {
        self.core.stats()
    }

    pub fn pool(&self) -> &BufferPool {
        &self.core.pool
    }

    pub fn detector(&self) -> &Arc<CongestionDetector> {
        &self.core.detector
    }

    /// Run one frame through skip, encode and send. Blocking (CPU bound).
    pub fn process_frame(&self, img: &RawImage) -> TickOutcome {
        self.core.process_frame(img)
    }

    /// Start streaming from `camera`.
    ///
    /// Fails with `PreviewAlreadyStarted` if a session is running, or with
    /// the camera's error if it cannot enter preview mode.
    pub async fn start(&self, camera: &CameraHandle, settings: PreviewSettings) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(CamwireError::StateConflict(ErrorCode::PreviewAlreadyStarted));
        }

        camera.call(|c| c.start_preview()).await?;
        self.core.reset(settings.resolution);

        let (tx, rx) = watch::channel(None);
        let stop = Arc::new(AtomicBool::new(false));

        let grabber = {
            let camera = camera.camera().clone();
            let stop = stop.clone();
            let interval = settings.interval();
            tokio::task::spawn_blocking(move || grab_loop(camera, tx, stop, interval))
        };
        let encoder = tokio::spawn(encode_loop(self.core.clone(), rx));

        self.core.active.store(true, Ordering::Release);
        *running = Some(Running {
            stop,
            grabber,
            encoder,
            settings,
        });

        tracing::info!(
            "Preview started at {}x{}, {} fps",
            settings.resolution.width,
            settings.resolution.height,
            settings.fps
        );
        Ok(())
    }

    /// Stop streaming. Returns the session's stats, or `None` if idle.
    ///
    /// An in-flight camera grab is allowed to finish; its frame is discarded.
    pub async fn stop(&self, camera: &CameraHandle) -> Option<PreviewStats> {
        let running = self.running.lock().await.take()?;
        self.core.active.store(false, Ordering::Release);

        running.stop.store(true, Ordering::Release);
        running.encoder.abort();
        let _ = running.encoder.await;
        let _ = running.grabber.await;

        if let Err(e) = camera.call(|c| c.stop_preview()).await {
            tracing::warn!("Camera stop_preview failed: {}", e);
        }

        let stats = self.stats();
        tracing::info!(
            "Preview stopped ({}x{}): grabbed={} sent={} skipped={} dropped={} quality={} avg_encode={:?} pool_misses={}",
            running.settings.resolution.width,
            running.settings.resolution.height,
            stats.grabbed,
            stats.sent,
            stats.skipped,
            stats.dropped,
            stats.quality,
            stats.avg_encode_time,
            stats.pool.miss_count
        );
        Some(stats)
    }
}

impl std::fmt::Debug for PreviewPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreviewPipeline")
            .field("running", &self.is_running())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Grab frames until stopped, publishing only the newest.
fn grab_loop(
    camera: Arc<dyn Camera>,
    tx: watch::Sender<Option<Arc<RawImage>>>,
    stop: Arc<AtomicBool>,
    interval: Duration,
) {
    let mut failures: u32 = 0;

    while !stop.load(Ordering::Acquire) {
        let started = Instant::now();

        match camera.grab_latest_frame() {
            Ok(Some(img)) => {
                failures = 0;
                if tx.send(Some(Arc::new(img))).is_err() {
                    break;
                }
            }
            Ok(None) => tracing::trace!("No preview frame ready"),
            Err(e) => {
                failures += 1;
                if failures == 1 || failures % 50 == 0 {
                    tracing::warn!("Preview grab failed ({} in a row): {}", failures, e);
                }
            }
        }

        if let Some(rest) = interval.checked_sub(started.elapsed()) {
            std::thread::sleep(rest);
        }
    }

    tracing::debug!("Preview grab loop stopped");
}

async fn encode_loop(core: Arc<PreviewCore>, mut rx: watch::Receiver<Option<Arc<RawImage>>>) {
    while rx.changed().await.is_ok() {
        let Some(img) = rx.borrow_and_update().clone() else {
            continue;
        };

        let worker = core.clone();
        match tokio::task::spawn_blocking(move || worker.process_frame(&img)).await {
            Ok(outcome) => tracing::trace!("Preview tick: {:?}", outcome),
            Err(e) => tracing::error!("Preview encode task failed: {}", e),
        }
    }
}

/// Largest size with the same aspect ratio that fits inside `target`.
fn fit_within(width: u32, height: u32, target: Resolution) -> (u32, u32) {
    let (tw, th) = (target.width as u32, target.height as u32);
    if width <= tw && height <= th {
        return (width, height);
    }
    let scale = (tw as f64 / width as f64).min(th as f64 / height as f64);
    let w = ((width as f64 * scale).round() as u32).clamp(1, tw.max(1));
    let h = ((height as f64 * scale).round() as u32).clamp(1, th.max(1));
    (w, h)
}

/// Encode `img` as JPEG into `out`, downscaling to fit `target`.
///
/// Returns the encoded dimensions.
fn encode_jpeg(
    img: &RawImage,
    target: Resolution,
    quality: u8,
    out: &mut Vec<u8>,
) -> Result<(u32, u32)> {
    let expected = img.expected_len();
    if img.data.len() < expected || expected == 0 {
        return Err(CamwireError::Protocol(format!(
            "image {}x{} has {} bytes, expected {}",
            img.width,
            img.height,
            img.data.len(),
            expected
        )));
    }
    let (width, height) = fit_within(img.width, img.height, target);
    let invalid = || CamwireError::Protocol("image buffer size mismatch".to_string());

    match img.format {
        ImageFormat::Bgr8 => {
            let mut rgb = Vec::with_capacity(expected);
            for px in img.data[..expected].chunks_exact(3) {
                rgb.extend_from_slice(&[px[2], px[1], px[0]]);
            }
            let mut buf = RgbImage::from_raw(img.width, img.height, rgb).ok_or_else(invalid)?;
            if (width, height) != (img.width, img.height) {
                buf = imageops::resize(&buf, width, height, FilterType::Triangle);
            }
            JpegEncoder::new_with_quality(out, quality).encode(
                buf.as_raw(),
                width,
                height,
                ExtendedColorType::Rgb8,
            )?;
        }
        ImageFormat::Mono8 => {
            let mut buf = GrayImage::from_raw(img.width, img.height, img.data[..expected].to_vec())
                .ok_or_else(invalid)?;
            if (width, height) != (img.width, img.height) {
                buf = imageops::resize(&buf, width, height, FilterType::Triangle);
            }
            JpegEncoder::new_with_quality(out, quality).encode(
                buf.as_raw(),
                width,
                height,
                ExtendedColorType::L8,
            )?;
        }
    }

    Ok((width, height))
}
