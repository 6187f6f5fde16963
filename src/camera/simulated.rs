//! Hardware-free camera producing moving gradient frames.

use std::sync::Mutex;

use super::{Camera, CameraError, CameraResult, CameraSettings, ImageFormat, PixelFormat, RawImage};
use crate::protocol::{ErrorCode, Mode, Resolution, ResolutionList, RESOLUTION_TABLE};

const EXPOSURE_RANGE_US: std::ops::RangeInclusive<u32> = 10..=1_000_000;
const GAIN_RANGE_CENTI: std::ops::RangeInclusive<u32> = 0..=2400;
const WHITE_BALANCE_RANGE_CENTI: std::ops::RangeInclusive<u16> = 1..=800;

#[derive(Debug)]
struct SimState {
    link_up: bool,
    opened: bool,
    capturing: bool,
    previewing: bool,
    settings: CameraSettings,
    frame_counter: u32,
    fail_next: Option<ErrorCode>,
}

/// In-process camera for development and tests.
///
/// Frames are `width x height` BGR8 (or Mono8 when that pixel format is
/// selected) gradients that shift by a few pixels on every grab.
#[derive(Debug)]
pub struct SimulatedCamera {
    width: u32,
    height: u32,
    state: Mutex<SimState>,
}

impl SimulatedCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            state: Mutex::new(SimState {
                link_up: true,
                opened: false,
                capturing: false,
                previewing: false,
                settings: CameraSettings::default(),
                frame_counter: 0,
                fail_next: None,
            }),
        }
    }

    /// Simulate unplugging (`false`) or replugging (`true`) the camera.
    pub fn set_connected(&self, connected: bool) {
        let mut state = self.lock();
        state.link_up = connected;
        if !connected {
            state.capturing = false;
            state.previewing = false;
        }
    }

    /// Make the next fallible call fail with `code`.
    pub fn fail_next(&self, code: ErrorCode) {
        self.lock().fail_next = Some(code);
    }

    /// Number of frames grabbed so far.
    pub fn frames_grabbed(&self) -> u32 {
        self.lock().frame_counter
    }

    pub fn is_capturing(&self) -> bool {
        self.lock().capturing
    }

    pub fn is_previewing(&self) -> bool {
        self.lock().previewing
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Lock, consume an injected fault, and require an open camera.
    fn ready(&self) -> CameraResult<std::sync::MutexGuard<'_, SimState>> {
        let mut state = self.lock();
        if let Some(code) = state.fail_next.take() {
            return Err(CameraError::new(code, "injected fault"));
        }
        if !state.link_up {
            if state.opened {
                return Err(CameraError::new(
                    ErrorCode::CameraDisconnected,
                    "camera disconnected",
                ));
            }
            return Err(CameraError::not_connected());
        }
        if !state.opened {
            return Err(CameraError::not_connected());
        }
        Ok(state)
    }

    fn render(&self, counter: u32, format: PixelFormat) -> RawImage {
        let (w, h) = (self.width as usize, self.height as usize);
        let shift = (counter as usize * 4) % 256;

        if format == PixelFormat::Mono8 {
            let mut data = Vec::with_capacity(w * h);
            for y in 0..h {
                for x in 0..w {
                    data.push(((x + y + shift) % 256) as u8);
                }
            }
            return RawImage {
                width: self.width,
                height: self.height,
                format: ImageFormat::Mono8,
                data,
            };
        }

        let mut data = Vec::with_capacity(w * h * 3);
        for y in 0..h {
            let g = (y * 255 / h.max(1)) as u8;
            for x in 0..w {
                let r = ((x * 255 / w.max(1) + shift) % 256) as u8;
                let b = 255u8.wrapping_sub(r);
                data.extend_from_slice(&[b, g, r]);
            }
        }
        RawImage {
            width: self.width,
            height: self.height,
            format: ImageFormat::Bgr8,
            data,
        }
    }
}

fn validate(settings: &CameraSettings) -> CameraResult<()> {
    let block = &settings.block;
    if block.exposure_mode == Mode::Manual && !EXPOSURE_RANGE_US.contains(&block.exposure_us) {
        return Err(CameraError::new(
            ErrorCode::ParamFailed,
            format!("exposure {} us out of range", block.exposure_us),
        ));
    }
    if !GAIN_RANGE_CENTI.contains(&block.gain_centi) {
        return Err(CameraError::new(
            ErrorCode::ParamFailed,
            format!("gain {} out of range", block.gain_centi),
        ));
    }
    for channel in [block.red_centi, block.green_centi, block.blue_centi] {
        if !WHITE_BALANCE_RANGE_CENTI.contains(&channel) {
            return Err(CameraError::new(
                ErrorCode::ParamFailed,
                format!("white balance gain {} out of range", channel),
            ));
        }
    }
    if Resolution::from_index(block.resolution_index).is_none() {
        return Err(CameraError::new(
            ErrorCode::UnsupportedResolution,
            format!("resolution index {}", block.resolution_index),
        ));
    }
    Ok(())
}

impl Camera for SimulatedCamera {
    fn open(&self) -> CameraResult<()> {
        let mut state = self.lock();
        if let Some(code) = state.fail_next.take() {
            return Err(CameraError::new(code, "injected fault"));
        }
        if !state.link_up {
            return Err(CameraError::new(ErrorCode::CameraInitFailed, "no camera found"));
        }
        state.opened = true;
        tracing::info!("Simulated camera opened ({}x{})", self.width, self.height);
        Ok(())
    }

    fn close(&self) -> CameraResult<()> {
        let mut state = self.lock();
        state.opened = false;
        state.capturing = false;
        state.previewing = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        let state = self.lock();
        state.opened && state.link_up
    }

    fn start_capture(&self) -> CameraResult<()> {
        self.ready()?.capturing = true;
        Ok(())
    }

    fn stop_capture(&self) -> CameraResult<()> {
        self.lock().capturing = false;
        Ok(())
    }

    fn start_preview(&self) -> CameraResult<()> {
        self.ready()?.previewing = true;
        Ok(())
    }

    fn stop_preview(&self) -> CameraResult<()> {
        self.lock().previewing = false;
        Ok(())
    }

    fn grab_latest_frame(&self) -> CameraResult<Option<RawImage>> {
        let (counter, format) = {
            let mut state = self.ready()?;
            state.frame_counter = state.frame_counter.wrapping_add(1);
            (state.frame_counter, state.settings.pixel_format)
        };
        Ok(Some(self.render(counter, format)))
    }

    fn get_parameters(&self) -> CameraResult<CameraSettings> {
        Ok(self.ready()?.settings)
    }

    fn set_parameters(&self, settings: CameraSettings) -> CameraResult<()> {
        let mut state = self.ready()?;
        validate(&settings)?;
        state.settings = settings;
        Ok(())
    }

    fn list_supported_resolutions(&self) -> CameraResult<ResolutionList> {
        let _state = self.ready()?;
        Ok(ResolutionList(RESOLUTION_TABLE.to_vec()))
    }
}
