//! Send-path congestion detector.
//!
//! Fed with per-frame send latencies (by the writer tasks) and the preview
//! backlog (by the preview pipeline), it produces a [`Directive`]: the JPEG
//! quality to encode at and how many frames to skip between sends.
//!
//! # Policy
//!
//! Each evaluation computes a congestion factor in `[0, 1]`:
//!
//! ```text
//! factor = 0.6 * min(1, avg_latency / latency_threshold)
//!        + 0.4 * min(1, queue_size / queue_threshold)
//! ```
//!
//! The link is congested only while `avg_latency` exceeds
//! `latency_threshold`. A congested evaluation is graded by the factor:
//! above 0.8 is [`CongestionLevel::Severe`], anything else
//! [`CongestionLevel::Mild`]. It escalates the level at once and steps
//! quality down. Relaxing is slower: only after
//! `recovery_samples` consecutive clear evaluations does the level drop one
//! step and quality rise one step, never above the cap set by
//! [`CongestionDetector::limit_quality`].
//!
//! All operations take a short internal lock and never wait on I/O.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Factor above which the link counts as severely congested.
const SEVERE_FACTOR: f64 = 0.8;

const LATENCY_WEIGHT: f64 = 0.6;
const QUEUE_WEIGHT: f64 = 0.4;

/// Detector tuning.
#[derive(Debug, Clone)]
pub struct CongestionConfig {
    /// Average latency that counts as full latency pressure.
    pub latency_threshold: Duration,
    /// Backlog that counts as full queue pressure.
    pub queue_threshold: usize,
    /// Latency samples kept for the rolling average.
    pub history_size: usize,
    /// Quality change per adjustment.
    pub quality_step: u8,
    /// Consecutive clear evaluations required before relaxing.
    pub recovery_samples: u32,
    /// Quality floor.
    pub min_quality: u8,
    /// Quality ceiling.
    pub max_quality: u8,
    /// Quality before any congestion is observed.
    pub initial_quality: u8,
}

impl Default for CongestionConfig {
    fn default() -> Self {
        Self {
            latency_threshold: Duration::from_millis(100),
            queue_threshold: 5,
            history_size: 30,
            quality_step: 10,
            recovery_samples: 5,
            min_quality: 30,
            max_quality: 90,
            initial_quality: 80,
        }
    }
}

/// Graded congestion level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum CongestionLevel {
    /// Latency within the threshold.
    #[default]
    Clear,
    /// Latency over the threshold; every other frame is skipped.
    Mild,
    /// Latency over the threshold with a deep backlog; two in three frames
    /// are skipped.
    Severe,
}

impl CongestionLevel {
    /// Grade of a congested evaluation.
    fn from_factor(factor: f64) -> Self {
        if factor > SEVERE_FACTOR {
            CongestionLevel::Severe
        } else {
            CongestionLevel::Mild
        }
    }

    /// Frames skipped after each sent frame.
    pub fn skip_interval(self) -> u32 {
        match self {
            CongestionLevel::Clear => 0,
            CongestionLevel::Mild => 1,
            CongestionLevel::Severe => 2,
        }
    }

    /// Fraction of frames skipped; always in `[0, 1)`.
    pub fn skip_ratio(self) -> f32 {
        let n = self.skip_interval() as f32;
        n / (n + 1.0)
    }

    fn relaxed(self) -> Self {
        match self {
            CongestionLevel::Severe => CongestionLevel::Mild,
            _ => CongestionLevel::Clear,
        }
    }
}

/// What the preview pipeline should do with the next frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Directive {
    /// JPEG quality to encode at.
    pub quality: u8,
    /// Fraction of frames to drop.
    pub skip_ratio: f32,
    /// Level the directive was derived from.
    pub level: CongestionLevel,
}

impl Directive {
    /// Whether the frame with sequence number `seq` should be dropped.
    ///
    /// With skip interval `n`, one frame in every `n + 1` is kept.
    pub fn should_skip(&self, seq: u32) -> bool {
        let n = self.level.skip_interval();
        n > 0 && seq % (n + 1) != 0
    }
}

/// Read-only view of the detector state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CongestionSnapshot {
    /// Current level.
    pub level: CongestionLevel,
    /// Current directive quality.
    pub quality: u8,
    /// Highest quality recovery may reach.
    pub quality_cap: u8,
    /// Current directive skip ratio.
    pub skip_ratio: f32,
    /// Weighted latency/queue factor of the last evaluation.
    pub factor: f64,
    /// Rolling average over the kept samples.
    pub avg_latency: Duration,
    /// Backlog passed to the last [`CongestionDetector::observe`].
    pub queue_size: usize,
    /// Latency samples currently kept.
    pub samples: usize,
    /// When level or quality last changed.
    pub last_adjusted: Instant,
}

#[derive(Debug)]
struct State {
    latencies: VecDeque<Duration>,
    queue_size: usize,
    level: CongestionLevel,
    quality: u8,
    quality_cap: u8,
    factor: f64,
    clear_streak: u32,
    last_adjusted: Instant,
}

/// Closed-loop quality/skip controller shared by writers and the pipeline.
#[derive(Debug)]
pub struct CongestionDetector {
    config: CongestionConfig,
    state: Mutex<State>,
}

impl CongestionDetector {
    pub fn new(config: CongestionConfig) -> Self {
        let quality = config
            .initial_quality
            .clamp(config.min_quality, config.max_quality);
        Self {
            state: Mutex::new(State {
                latencies: VecDeque::with_capacity(config.history_size),
                queue_size: 0,
                level: CongestionLevel::Clear,
                quality,
                quality_cap: config.max_quality,
                factor: 0.0,
                clear_streak: 0,
                last_adjusted: Instant::now(),
            }),
            config,
        }
    }

    pub fn config(&self) -> &CongestionConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record one frame's queue-plus-write latency. Does not re-evaluate.
    pub fn record_latency(&self, latency: Duration) {
        let mut state = self.lock();
        if state.latencies.len() >= self.config.history_size.max(1) {
            state.latencies.pop_front();
        }
        state.latencies.push_back(latency);
    }

    /// Record the current send backlog and re-evaluate the directive.
    pub fn observe(&self, queue_size: usize) -> Directive {
        let mut state = self.lock();
        state.queue_size = queue_size;
        self.evaluate(&mut state);
        Self::directive_of(&state)
    }

    /// Current directive without feeding a sample.
    pub fn directive(&self) -> Directive {
        Self::directive_of(&self.lock())
    }

    /// Cap quality at `quality` until the next [`reset`](Self::reset).
    ///
    /// Used when frames encoded above `quality` do not fit in a wire frame,
    /// so recovery on a clear link does not climb back to an unusable value.
    pub fn limit_quality(&self, quality: u8) {
        let mut state = self.lock();
        let cap = quality.clamp(self.config.min_quality, self.config.max_quality);
        if cap >= state.quality_cap {
            return;
        }
        state.quality_cap = cap;
        if state.quality > cap {
            state.quality = cap;
            state.last_adjusted = Instant::now();
        }
        tracing::debug!("Preview quality capped at {}", cap);
    }

    pub fn snapshot(&self) -> CongestionSnapshot {
        let state = self.lock();
        CongestionSnapshot {
            level: state.level,
            quality: state.quality,
            quality_cap: state.quality_cap,
            skip_ratio: state.level.skip_ratio(),
            factor: state.factor,
            avg_latency: average(&state.latencies),
            queue_size: state.queue_size,
            samples: state.latencies.len(),
            last_adjusted: state.last_adjusted,
        }
    }

    /// Forget all samples and return to the initial directive.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.latencies.clear();
        state.queue_size = 0;
        state.level = CongestionLevel::Clear;
        state.quality = self
            .config
            .initial_quality
            .clamp(self.config.min_quality, self.config.max_quality);
        state.quality_cap = self.config.max_quality;
        state.factor = 0.0;
        state.clear_streak = 0;
        state.last_adjusted = Instant::now();
    }

    fn directive_of(state: &State) -> Directive {
        Directive {
            quality: state.quality,
            skip_ratio: state.level.skip_ratio(),
            level: state.level,
        }
    }

    fn factor(&self, state: &State, avg_latency: Duration) -> f64 {
        let threshold = self.config.latency_threshold.as_secs_f64();
        let latency_factor = if threshold > 0.0 {
            (avg_latency.as_secs_f64() / threshold).min(1.0)
        } else {
            0.0
        };
        let queue_factor = if self.config.queue_threshold > 0 {
            (state.queue_size as f64 / self.config.queue_threshold as f64).min(1.0)
        } else {
            0.0
        };
        latency_factor * LATENCY_WEIGHT + queue_factor * QUEUE_WEIGHT
    }

    fn evaluate(&self, state: &mut State) {
        let (min_q, max_q) = (self.config.min_quality, self.config.max_quality);
        let avg_latency = average(&state.latencies);
        let factor = self.factor(state, avg_latency);
        state.factor = factor;

        let previous = (state.level, state.quality);

        if avg_latency > self.config.latency_threshold {
            state.clear_streak = 0;
            state.level = state.level.max(CongestionLevel::from_factor(factor));

            // Never above what the factor alone would allow.
            let ceiling = (max_q as f64 - factor * (max_q - min_q) as f64).round() as u8;
            state.quality = state
                .quality
                .saturating_sub(self.config.quality_step)
                .min(ceiling)
                .clamp(min_q, max_q);
        } else {
            state.clear_streak += 1;
            if state.clear_streak >= self.config.recovery_samples {
                state.clear_streak = 0;
                state.level = state.level.relaxed();
                state.quality = state
                    .quality
                    .saturating_add(self.config.quality_step)
                    .min(state.quality_cap)
                    .clamp(min_q, max_q);
            }
        }

        if (state.level, state.quality) != previous {
            state.last_adjusted = Instant::now();
            if state.level != previous.0 {
                tracing::info!(
                    "Congestion {:?} -> {:?} (factor {:.2}, quality {})",
                    previous.0,
                    state.level,
                    factor,
                    state.quality
                );
            } else {
                tracing::debug!("Preview quality {} -> {}", previous.1, state.quality);
            }
        }
    }
}

impl Default for CongestionDetector {
    fn default() -> Self {
        Self::new(CongestionConfig::default())
    }
}

fn average(samples: &VecDeque<Duration>) -> Duration {
    if samples.is_empty() {
        return Duration::ZERO;
    }
    samples.iter().sum::<Duration>() / samples.len() as u32
}
