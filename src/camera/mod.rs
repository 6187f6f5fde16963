//! Camera collaborator interface.
//!
//! The protocol engine talks to hardware only through the [`Camera`] trait.
//! Every method is a plain blocking call (vendor SDKs block), so async code
//! goes through [`CameraHandle`], which moves each call onto tokio's
//! blocking thread pool.

mod simulated;

pub use simulated::SimulatedCamera;

use std::sync::Arc;

use thiserror::Error;

use crate::error::Result;
use crate::protocol::{ErrorCode, ParameterBlock, ResolutionList};

/// Failure reported by a camera call.
///
/// Carries the wire code the requesting command should be answered with.
#[derive(Debug, Clone, Error)]
#[error("Camera error 0x{hex:04X}: {message}", hex = .code.code())]
pub struct CameraError {
    code: ErrorCode,
    message: String,
}

impl CameraError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Shorthand for the common "not connected" failure.
    pub fn not_connected() -> Self {
        Self::new(ErrorCode::CameraNotConnected, "camera not connected")
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Result of a camera call.
pub type CameraResult<T> = std::result::Result<T, CameraError>;

/// Sensor pixel format selectable with `SET_PIXEL_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    BayerRg8,
    BayerRg12,
    #[default]
    Bgr8,
    Rgb8,
    Mono8,
}

impl PixelFormat {
    /// Map the wire index (0..=4) to a format.
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(PixelFormat::BayerRg8),
            1 => Some(PixelFormat::BayerRg12),
            2 => Some(PixelFormat::Bgr8),
            3 => Some(PixelFormat::Rgb8),
            4 => Some(PixelFormat::Mono8),
            _ => None,
        }
    }

    pub fn index(self) -> u8 {
        match self {
            PixelFormat::BayerRg8 => 0,
            PixelFormat::BayerRg12 => 1,
            PixelFormat::Bgr8 => 2,
            PixelFormat::Rgb8 => 3,
            PixelFormat::Mono8 => 4,
        }
    }
}

/// Full camera configuration: the wire parameter block plus the settings
/// that have their own commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CameraSettings {
    pub block: ParameterBlock,
    pub gain_auto: bool,
    /// Acquisition frame rate limit in hundredths of fps; `None` = free running.
    pub frame_rate_centi: Option<u32>,
    pub pixel_format: PixelFormat,
}

/// Channel layout of a grabbed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// 3 bytes per pixel, blue first.
    Bgr8,
    /// 1 byte per pixel.
    Mono8,
}

impl ImageFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            ImageFormat::Bgr8 => 3,
            ImageFormat::Mono8 => 1,
        }
    }
}

/// One grabbed frame, tightly packed rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub data: Vec<u8>,
}

impl RawImage {
    /// Expected `data` length for the dimensions and format.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }
}

/// Camera hardware abstraction.
///
/// Methods take `&self`; implementations synchronize internally. All calls
/// may block except [`Camera::is_connected`], which must be cheap.
pub trait Camera: Send + Sync + 'static {
    fn open(&self) -> CameraResult<()>;

    fn close(&self) -> CameraResult<()>;

    fn is_connected(&self) -> bool;

    fn start_capture(&self) -> CameraResult<()>;

    fn stop_capture(&self) -> CameraResult<()>;

    fn start_preview(&self) -> CameraResult<()>;

    fn stop_preview(&self) -> CameraResult<()>;

    /// Newest available frame, discarding any older buffered ones.
    ///
    /// `Ok(None)` means no frame was ready within the camera's own timeout.
    fn grab_latest_frame(&self) -> CameraResult<Option<RawImage>>;

    fn get_parameters(&self) -> CameraResult<CameraSettings>;

    fn set_parameters(&self, settings: CameraSettings) -> CameraResult<()>;

    fn list_supported_resolutions(&self) -> CameraResult<ResolutionList>;
}

/// Shared handle that runs camera calls off the async executor.
#[derive(Clone)]
pub struct CameraHandle {
    inner: Arc<dyn Camera>,
}

impl CameraHandle {
    pub fn new<C: Camera>(camera: C) -> Self {
        Self {
            inner: Arc::new(camera),
        }
    }

    pub fn from_arc(camera: Arc<dyn Camera>) -> Self {
        Self { inner: camera }
    }

    /// Cheap connection check, callable from async code directly.
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Direct access for code that already runs on a blocking thread.
    pub fn camera(&self) -> &Arc<dyn Camera> {
        &self.inner
    }

    /// Run a blocking camera call on the blocking pool.
    ///
    /// A panicking call surfaces as an `Unknown` camera error instead of
    /// tearing down the caller.
    pub async fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn Camera) -> CameraResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let camera = self.inner.clone();
        let outcome = tokio::task::spawn_blocking(move || f(camera.as_ref()))
            .await
            .map_err(|e| CameraError::new(ErrorCode::Unknown, format!("camera task failed: {}", e)))?;
        Ok(outcome?)
    }
}

impl std::fmt::Debug for CameraHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraHandle")
            .field("connected", &self.inner.is_connected())
            .finish()
    }
}
