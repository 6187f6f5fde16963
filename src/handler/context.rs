//! Command context and response type.
//!
//! A [`CommandContext`] is handed to every handler call. It identifies the
//! sending connection and gives access to the session registry and the
//! shared [`Device`] state. Handlers return a [`Response`]: the frames to
//! send back to the sender, in order.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::camera::{CameraHandle, CameraSettings};
use crate::error::Result;
use crate::preview::PreviewPipeline;
use crate::protocol::{
    commands, success_data, Frame, ParameterBlock, ResolutionList, StatusSnapshot,
};
use crate::session::{ConnectionId, SessionRegistry};

/// Process-wide device state shared by handlers, the reporter and teardown.
pub struct Device {
    camera: CameraHandle,
    preview: PreviewPipeline,
    recording_since: Mutex<Option<Instant>>,
    capture_seq: AtomicU32,
}

impl Device {
    pub fn new(camera: CameraHandle, preview: PreviewPipeline) -> Self {
        Self {
            camera,
            preview,
            recording_since: Mutex::new(None),
            capture_seq: AtomicU32::new(0),
        }
    }

    pub fn camera(&self) -> &CameraHandle {
        &self.camera
    }

    pub fn preview(&self) -> &PreviewPipeline {
        &self.preview
    }

    /// Status byte: camera link plus the flags of all connections.
    pub fn status(&self, sessions: &SessionRegistry) -> StatusSnapshot {
        let flags = sessions.combined_flags();
        StatusSnapshot {
            camera_connected: self.camera.is_connected(),
            capturing: flags.capturing,
            recording: flags.recording,
            previewing: flags.previewing,
        }
    }

    /// Current settings, or defaults when the camera cannot be asked.
    pub async fn settings_or_default(&self) -> CameraSettings {
        if !self.camera.is_connected() {
            return CameraSettings::default();
        }
        match self.camera.call(|c| c.get_parameters()).await {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!("Reading camera parameters failed: {}", e);
                CameraSettings::default()
            }
        }
    }

    pub async fn parameters(&self) -> ParameterBlock {
        self.settings_or_default().await.block
    }

    /// Supported resolutions, or the fallback list.
    pub async fn resolutions(&self) -> ResolutionList {
        if !self.camera.is_connected() {
            return ResolutionList::fallback();
        }
        match self.camera.call(|c| c.list_supported_resolutions()).await {
            Ok(list) if !list.0.is_empty() => list,
            Ok(_) => ResolutionList::fallback(),
            Err(e) => {
                tracing::warn!("Listing camera resolutions failed: {}", e);
                ResolutionList::fallback()
            }
        }
    }

    /// Read-modify-write the camera settings on the blocking pool.
    pub async fn update_settings<F>(&self, update: F) -> Result<()>
    where
        F: FnOnce(&mut CameraSettings) + Send + 'static,
    {
        self.camera
            .call(move |c| {
                let mut settings = c.get_parameters()?;
                update(&mut settings);
                c.set_parameters(settings)
            })
            .await
    }

    /// Next capture sequence number, starting at 1.
    pub fn next_capture_seq(&self) -> u32 {
        self.capture_seq.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    pub fn mark_recording_started(&self) {
        *self.lock_recording() = Some(Instant::now());
    }

    /// Clear the recording start and return how long it ran.
    pub fn take_recording_duration(&self) -> Option<Duration> {
        self.lock_recording().take().map(|t| t.elapsed())
    }

    fn lock_recording(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.recording_since
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("camera", &self.camera)
            .field("preview", &self.preview)
            .finish()
    }
}

/// Context passed to command handlers.
#[derive(Clone)]
pub struct CommandContext {
    conn_id: ConnectionId,
    sessions: Arc<SessionRegistry>,
    device: Arc<Device>,
}

impl CommandContext {
    pub fn new(conn_id: ConnectionId, sessions: Arc<SessionRegistry>, device: Arc<Device>) -> Self {
        Self {
            conn_id,
            sessions,
            device,
        }
    }

    /// The connection that sent the command.
    #[inline]
    pub fn conn_id(&self) -> ConnectionId {
        self.conn_id
    }

    #[inline]
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    #[inline]
    pub fn camera(&self) -> &CameraHandle {
        self.device.camera()
    }
}

impl std::fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandContext")
            .field("conn_id", &self.conn_id)
            .finish()
    }
}

/// Frames a handler sends back to the requesting connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Response {
    frames: Vec<Frame>,
}

impl Response {
    /// `RESPONSE_SUCCESS` echoing `command`.
    pub fn ack(command: u8) -> Self {
        Self::reply(commands::RESPONSE_SUCCESS, success_data(command))
    }

    /// A single frame with the given code and data.
    pub fn reply(command: u8, data: impl Into<Bytes>) -> Self {
        Self {
            frames: vec![Frame::new(command, data)],
        }
    }

    /// Append a follow-up frame.
    pub fn then(mut self, command: u8, data: impl Into<Bytes>) -> Self {
        self.frames.push(Frame::new(command, data));
        self
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn into_frames(self) -> Vec<Frame> {
        self.frames
    }
}
