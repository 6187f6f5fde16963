//! Server configuration.
//!
//! Loaded from a TOML file where every section and key is optional:
//!
//! ```toml
//! [tcp]
//! port = 8899
//!
//! [preview]
//! max_fps = 15
//!
//! [congestion]
//! latency_threshold_ms = 150
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::congestion::CongestionConfig;
use crate::error::{CamwireError, Result};
use crate::preview::{PreviewConfig, MIN_FPS};
use crate::writer::WriterConfig;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub tcp: TcpConfig,
    pub writer: WriterSection,
    pub reporter: ReporterConfig,
    pub preview: PreviewSection,
    pub congestion: CongestionSection,
    pub camera: CameraConfig,
    pub logging: LoggingConfig,
}

/// Listener settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TcpConfig {
    pub host: String,
    pub port: u16,
    /// Idle read timeout; 0 disables it.
    pub read_timeout_secs: u64,
    pub nodelay: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8899,
            read_timeout_secs: 30,
            nodelay: true,
        }
    }
}

/// Per-connection send queue.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WriterSection {
    pub max_pending_frames: usize,
    pub channel_capacity: usize,
    pub backpressure_timeout_ms: u64,
}

impl Default for WriterSection {
    fn default() -> Self {
        Self {
            max_pending_frames: 256,
            channel_capacity: 256,
            backpressure_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReporterConfig {
    pub interval_ms: u64,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

/// Preview encoding and pacing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PreviewSection {
    pub jpeg_quality: u8,
    pub min_quality: u8,
    pub max_quality: u8,
    pub default_fps: u8,
    pub max_fps: u8,
    pub buffer_pool_size: usize,
    pub buffer_capacity: usize,
    pub enable_skip_frame: bool,
    pub enable_dynamic_quality: bool,
}

impl Default for PreviewSection {
    fn default() -> Self {
        Self {
            jpeg_quality: 80,
            min_quality: 30,
            max_quality: 90,
            default_fps: 10,
            max_fps: 30,
            buffer_pool_size: crate::buffer_pool::DEFAULT_POOL_SIZE,
            buffer_capacity: crate::buffer_pool::DEFAULT_BUFFER_CAPACITY,
            enable_skip_frame: true,
            enable_dynamic_quality: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CongestionSection {
    pub latency_threshold_ms: u64,
    pub queue_threshold: usize,
    pub history_size: usize,
    pub quality_step: u8,
    pub recovery_samples: u32,
}

impl Default for CongestionSection {
    fn default() -> Self {
        Self {
            latency_threshold_ms: 100,
            queue_threshold: 5,
            history_size: 30,
            quality_step: 10,
            recovery_samples: 5,
        }
    }
}

/// Built-in simulated camera.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CameraConfig {
    pub simulated_width: u32,
    pub simulated_height: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            simulated_width: 1280,
            simulated_height: 720,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load and validate a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: ServerConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        let p = &self.preview;
        if p.min_quality == 0 || p.min_quality > p.max_quality || p.max_quality > 100 {
            return Err(CamwireError::Config(format!(
                "preview quality range {}..={} must lie within 1..=100",
                p.min_quality, p.max_quality
            )));
        }
        if !(p.min_quality..=p.max_quality).contains(&p.jpeg_quality) {
            return Err(CamwireError::Config(format!(
                "preview.jpeg_quality {} outside {}..={}",
                p.jpeg_quality, p.min_quality, p.max_quality
            )));
        }
        if p.max_fps < MIN_FPS {
            return Err(CamwireError::Config(format!(
                "preview.max_fps must be at least {}",
                MIN_FPS
            )));
        }
        if p.default_fps < MIN_FPS || p.default_fps > p.max_fps {
            return Err(CamwireError::Config(format!(
                "preview.default_fps {} outside {}..={}",
                p.default_fps, MIN_FPS, p.max_fps
            )));
        }
        if p.buffer_pool_size == 0 {
            return Err(CamwireError::Config(
                "preview.buffer_pool_size must be positive".to_string(),
            ));
        }

        let w = &self.writer;
        if w.channel_capacity == 0 || w.max_pending_frames == 0 {
            return Err(CamwireError::Config(
                "writer queue sizes must be positive".to_string(),
            ));
        }

        let c = &self.congestion;
        if c.latency_threshold_ms == 0 || c.queue_threshold == 0 || c.history_size == 0 {
            return Err(CamwireError::Config(
                "congestion thresholds and history_size must be positive".to_string(),
            ));
        }
        if c.recovery_samples == 0 {
            return Err(CamwireError::Config(
                "congestion.recovery_samples must be positive".to_string(),
            ));
        }

        if self.reporter.interval_ms == 0 {
            return Err(CamwireError::Config(
                "reporter.interval_ms must be positive".to_string(),
            ));
        }
        if self.camera.simulated_width == 0 || self.camera.simulated_height == 0 {
            return Err(CamwireError::Config(
                "simulated camera size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// `host:port` for the listener.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.tcp.host, self.tcp.port)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        (self.tcp.read_timeout_secs > 0).then(|| Duration::from_secs(self.tcp.read_timeout_secs))
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.reporter.interval_ms)
    }

    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            max_pending_frames: self.writer.max_pending_frames,
            channel_capacity: self.writer.channel_capacity,
            backpressure_timeout: Duration::from_millis(self.writer.backpressure_timeout_ms),
        }
    }

    pub fn preview_config(&self) -> PreviewConfig {
        let p = &self.preview;
        PreviewConfig {
            jpeg_quality: p.jpeg_quality,
            default_fps: p.default_fps,
            max_fps: p.max_fps,
            buffer_pool_size: p.buffer_pool_size,
            buffer_capacity: p.buffer_capacity,
            enable_skip_frame: p.enable_skip_frame,
            enable_dynamic_quality: p.enable_dynamic_quality,
        }
    }

    pub fn congestion_config(&self) -> CongestionConfig {
        let c = &self.congestion;
        CongestionConfig {
            latency_threshold: Duration::from_millis(c.latency_threshold_ms),
            queue_threshold: c.queue_threshold,
            history_size: c.history_size,
            quality_step: c.quality_step,
            recovery_samples: c.recovery_samples,
            min_quality: self.preview.min_quality,
            max_quality: self.preview.max_quality,
            initial_quality: self.preview.jpeg_quality,
        }
    }
}
