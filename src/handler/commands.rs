//! Built-in command handlers.

use bytes::Bytes;

use super::{Access, CommandContext, CommandRegistry, Response};
use crate::camera::{CameraError, PixelFormat};
use crate::error::{CamwireError, Result};
use crate::preview::PreviewSettings;
use crate::protocol::{
    capture_complete_data, commands, record_complete_data, ErrorCode, Mode, Resolution,
};
use crate::session::Flag;

/// Register every built-in command.
pub fn register_builtin(registry: &mut CommandRegistry) {
    registry.register(commands::CAPTURE_SINGLE, capture_single);
    registry.register(commands::RECORD_START, record_start);
    registry.register(commands::RECORD_STOP, record_stop);
    registry.register(commands::PREVIEW_START, preview_start);
    registry.register(commands::PREVIEW_STOP, preview_stop);
    registry.register_with_access(commands::RELEASE_CONTROL, Access::HolderOnly, release_control);

    registry.register(commands::SET_EXPOSURE, set_exposure);
    registry.register(commands::SET_WHITE_BALANCE, set_white_balance);
    registry.register(commands::SET_GAIN, set_gain);
    registry.register(commands::SET_RESOLUTION, set_resolution);
    registry.register(commands::SET_GAIN_AUTO, set_gain_auto);
    registry.register(commands::SET_FRAME_RATE, set_frame_rate);
    registry.register(commands::SET_PIXEL_FORMAT, set_pixel_format);

    registry.register(commands::QUERY_STATUS, query_status);
    registry.register(commands::QUERY_PARAMS, query_params);
    registry.register(commands::QUERY_RESOLUTIONS, query_resolutions);
    registry.register(commands::QUERY_GAIN_AUTO, query_gain_auto);

    registry.register(commands::HEARTBEAT, heartbeat);
}

/// Fail with `DataLengthError` unless `data` has at least `expected` bytes.
fn require(command: u8, data: &[u8], expected: usize) -> Result<()> {
    if data.len() < expected {
        return Err(CamwireError::DataLength {
            command,
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

fn u16_at(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

fn u32_at(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn require_camera(ctx: &CommandContext) -> Result<()> {
    if ctx.camera().is_connected() {
        Ok(())
    } else {
        Err(CameraError::not_connected().into())
    }
}

fn reject_while_recording(ctx: &CommandContext) -> Result<()> {
    if ctx.sessions().any_flag(Flag::Recording) {
        Err(CamwireError::StateConflict(ErrorCode::StateRecording))
    } else {
        Ok(())
    }
}

async fn capture_single(ctx: CommandContext, _data: Bytes) -> Result<Response> {
    require_camera(&ctx)?;
    reject_while_recording(&ctx)?;

    ctx.sessions().set_flag(ctx.conn_id(), Flag::Capturing, true);
    let grabbed = ctx.camera().call(|c| c.grab_latest_frame()).await;
    ctx.sessions().set_flag(ctx.conn_id(), Flag::Capturing, false);

    let image = grabbed?
        .ok_or_else(|| CameraError::new(ErrorCode::GrabTimeout, "no frame available"))?;
    let seq = ctx.device().next_capture_seq();
    let resolution = Resolution::new(
        image.width.min(u16::MAX as u32) as u16,
        image.height.min(u16::MAX as u32) as u16,
    );
    tracing::info!(
        "{}: captured frame {} ({}x{})",
        ctx.conn_id(),
        seq,
        image.width,
        image.height
    );

    Ok(Response::reply(
        commands::CAPTURE_COMPLETE,
        capture_complete_data(seq, resolution),
    ))
}

async fn record_start(ctx: CommandContext, _data: Bytes) -> Result<Response> {
    require_camera(&ctx)?;
    reject_while_recording(&ctx)?;

    ctx.camera().call(|c| c.start_capture()).await?;
    ctx.sessions().set_flag(ctx.conn_id(), Flag::Recording, true);
    ctx.device().mark_recording_started();
    tracing::info!("{}: recording started", ctx.conn_id());

    Ok(Response::ack(commands::RECORD_START))
}

async fn record_stop(ctx: CommandContext, _data: Bytes) -> Result<Response> {
    if !ctx.sessions().any_flag(Flag::Recording) {
        return Ok(Response::ack(commands::RECORD_STOP));
    }

    ctx.camera().call(|c| c.stop_capture()).await?;
    ctx.sessions().clear_flag(Flag::Recording);

    let duration = ctx.device().take_recording_duration().unwrap_or_default();
    let millis = duration.as_millis().min(u32::MAX as u128) as u32;
    tracing::info!("{}: recording stopped after {} ms", ctx.conn_id(), millis);

    Ok(Response::ack(commands::RECORD_STOP)
        .then(commands::RECORD_COMPLETE, record_complete_data(millis)))
}

async fn preview_start(ctx: CommandContext, data: Bytes) -> Result<Response> {
    require(commands::PREVIEW_START, &data, 2)?;
    let preview = ctx.device().preview();
    let settings = PreviewSettings::from_request(data[0], data[1], preview.config())?;

    require_camera(&ctx)?;
    if preview.is_running() {
        return Err(CamwireError::StateConflict(ErrorCode::PreviewAlreadyStarted));
    }
    reject_while_recording(&ctx)?;

    ctx.sessions().set_flag(ctx.conn_id(), Flag::Previewing, true);
    if let Err(e) = preview.start(ctx.camera(), settings).await {
        ctx.sessions().set_flag(ctx.conn_id(), Flag::Previewing, false);
        return Err(e);
    }

    Ok(Response::ack(commands::PREVIEW_START))
}

async fn preview_stop(ctx: CommandContext, _data: Bytes) -> Result<Response> {
    ctx.sessions().clear_flag(Flag::Previewing);
    ctx.device().preview().stop(ctx.camera()).await;
    Ok(Response::ack(commands::PREVIEW_STOP))
}

async fn release_control(ctx: CommandContext, _data: Bytes) -> Result<Response> {
    if !ctx.sessions().release_controller(ctx.conn_id()) {
        return Err(CamwireError::NotController);
    }
    Ok(Response::ack(commands::RELEASE_CONTROL))
}

async fn set_exposure(ctx: CommandContext, data: Bytes) -> Result<Response> {
    require(commands::SET_EXPOSURE, &data, 5)?;
    let mode = Mode::from_byte(data[0]);
    let exposure_us = u32_at(&data, 1);

    ctx.device()
        .update_settings(move |s| {
            s.block.exposure_mode = mode;
            if mode == Mode::Manual {
                s.block.exposure_us = exposure_us;
            }
        })
        .await?;
    tracing::debug!("Exposure set: {:?} {} us", mode, exposure_us);
    Ok(Response::ack(commands::SET_EXPOSURE))
}

async fn set_white_balance(ctx: CommandContext, data: Bytes) -> Result<Response> {
    require(commands::SET_WHITE_BALANCE, &data, 7)?;
    let mode = Mode::from_byte(data[0]);
    let (r, g, b) = (u16_at(&data, 1), u16_at(&data, 3), u16_at(&data, 5));

    ctx.device()
        .update_settings(move |s| {
            s.block.white_balance_mode = mode;
            if mode == Mode::Manual {
                s.block.red_centi = r;
                s.block.green_centi = g;
                s.block.blue_centi = b;
            }
        })
        .await?;
    Ok(Response::ack(commands::SET_WHITE_BALANCE))
}

async fn set_gain(ctx: CommandContext, data: Bytes) -> Result<Response> {
    require(commands::SET_GAIN, &data, 2)?;
    let gain = u16_at(&data, 0) as u32;

    ctx.device()
        .update_settings(move |s| s.block.gain_centi = gain)
        .await?;
    Ok(Response::ack(commands::SET_GAIN))
}

async fn set_resolution(ctx: CommandContext, data: Bytes) -> Result<Response> {
    require(commands::SET_RESOLUTION, &data, 4)?;
    let resolution = Resolution::new(u16_at(&data, 0), u16_at(&data, 2));

    require_camera(&ctx)?;
    let supported = ctx.device().resolutions().await;
    let index = resolution
        .index()
        .filter(|_| supported.contains(resolution))
        .ok_or_else(|| {
            CameraError::new(
                ErrorCode::UnsupportedResolution,
                format!("{}x{} not supported", resolution.width, resolution.height),
            )
        })?;

    ctx.device()
        .update_settings(move |s| s.block.resolution_index = index)
        .await?;
    Ok(Response::ack(commands::SET_RESOLUTION))
}

async fn set_gain_auto(ctx: CommandContext, data: Bytes) -> Result<Response> {
    require(commands::SET_GAIN_AUTO, &data, 1)?;
    let enabled = data[0] != 0;

    ctx.device()
        .update_settings(move |s| s.gain_auto = enabled)
        .await?;
    Ok(Response::ack(commands::SET_GAIN_AUTO))
}

async fn set_frame_rate(ctx: CommandContext, data: Bytes) -> Result<Response> {
    require(commands::SET_FRAME_RATE, &data, 5)?;
    let rate = (data[0] != 0).then(|| u32_at(&data, 1));
    if rate == Some(0) {
        return Err(CameraError::new(ErrorCode::ParamFailed, "frame rate must be positive").into());
    }

    ctx.device()
        .update_settings(move |s| s.frame_rate_centi = rate)
        .await?;
    Ok(Response::ack(commands::SET_FRAME_RATE))
}

async fn set_pixel_format(ctx: CommandContext, data: Bytes) -> Result<Response> {
    require(commands::SET_PIXEL_FORMAT, &data, 1)?;
    let format = PixelFormat::from_index(data[0]).ok_or_else(|| {
        CameraError::new(
            ErrorCode::ParamFailed,
            format!("unknown pixel format {}", data[0]),
        )
    })?;

    ctx.device()
        .update_settings(move |s| s.pixel_format = format)
        .await?;
    Ok(Response::ack(commands::SET_PIXEL_FORMAT))
}

async fn query_status(ctx: CommandContext, _data: Bytes) -> Result<Response> {
    let status = ctx.device().status(ctx.sessions());
    Ok(Response::reply(
        commands::response_for(commands::QUERY_STATUS),
        vec![status.to_byte()],
    ))
}

async fn query_params(ctx: CommandContext, _data: Bytes) -> Result<Response> {
    let block = ctx.device().parameters().await;
    Ok(Response::reply(
        commands::response_for(commands::QUERY_PARAMS),
        block.encode().to_vec(),
    ))
}

async fn query_resolutions(ctx: CommandContext, _data: Bytes) -> Result<Response> {
    let list = ctx.device().resolutions().await;
    Ok(Response::reply(
        commands::response_for(commands::QUERY_RESOLUTIONS),
        list.encode(),
    ))
}

async fn query_gain_auto(ctx: CommandContext, _data: Bytes) -> Result<Response> {
    let settings = ctx.device().settings_or_default().await;
    Ok(Response::reply(
        commands::response_for(commands::QUERY_GAIN_AUTO),
        vec![settings.gain_auto as u8],
    ))
}

async fn heartbeat(_ctx: CommandContext, _data: Bytes) -> Result<Response> {
    Ok(Response::ack(commands::HEARTBEAT))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraHandle, SimulatedCamera};
    use crate::congestion::CongestionDetector;
    use crate::handler::Device;
    use crate::preview::{PreviewConfig, PreviewPipeline};
    use crate::protocol::{
        parse_preview_data, Frame, ParameterBlock, ResolutionList, StatusSnapshot,
        PARAMETER_BLOCK_SIZE,
    };
    use crate::session::{ConnectionId, SessionRegistry};
    use crate::writer::{spawn_writer_task, WriterConfig};
    use std::sync::Arc;
    use tokio::io::DuplexStream;

    struct Harness {
        sessions: Arc<SessionRegistry>,
        device: Arc<Device>,
        camera: Arc<SimulatedCamera>,
        registry: CommandRegistry,
        streams: Vec<DuplexStream>,
    }

    impl Harness {
        async fn new(open: bool) -> Self {
            let camera = Arc::new(SimulatedCamera::new(64, 48));
            let handle = CameraHandle::from_arc(camera.clone());
            if open {
                handle.call(|c| c.open()).await.unwrap();
            }
            let sessions = Arc::new(SessionRegistry::new());
            let preview = PreviewPipeline::new(
                PreviewConfig::default(),
                sessions.clone(),
                Arc::new(CongestionDetector::default()),
            );
            Self {
                device: Arc::new(Device::new(handle, preview)),
                sessions,
                camera,
                registry: CommandRegistry::with_builtin_commands(),
                streams: Vec::new(),
            }
        }

        fn connect(&mut self, id: u64) -> CommandContext {
            let (client, server) = tokio::io::duplex(1 << 20);
            let (writer, _task) = spawn_writer_task(client, WriterConfig::default(), None);
            self.sessions.register(ConnectionId(id), writer);
            self.streams.push(server);
            CommandContext::new(ConnectionId(id), self.sessions.clone(), self.device.clone())
        }

        async fn send(&self, ctx: &CommandContext, command: u8, data: &[u8]) -> Vec<Frame> {
            self.registry
                .dispatch(ctx.clone(), Frame::new(command, data.to_vec()))
                .await
        }
    }

    fn ack(command: u8) -> Vec<Frame> {
        vec![Frame::new(commands::RESPONSE_SUCCESS, vec![command])]
    }

    fn failed(command: u8, code: ErrorCode) -> Vec<Frame> {
        let [hi, lo] = code.to_be_bytes();
        vec![Frame::new(commands::RESPONSE_FAILED, vec![command, hi, lo])]
    }

    #[tokio::test]
    async fn test_builtin_table() {
        let registry = CommandRegistry::with_builtin_commands();
        assert_eq!(registry.len(), 18);
        assert_eq!(registry.access(commands::HEARTBEAT), Some(Access::Open));
        assert_eq!(registry.access(commands::RELEASE_CONTROL), Some(Access::HolderOnly));
        assert_eq!(registry.access(commands::SET_GAIN), Some(Access::Controller));
    }

    #[tokio::test]
    async fn test_heartbeat() {
        let mut h = Harness::new(false).await;
        let ctx = h.connect(1);
        assert_eq!(h.send(&ctx, commands::HEARTBEAT, &[]).await, ack(0xFF));
    }

    #[tokio::test]
    async fn test_query_status_reflects_flags() {
        let mut h = Harness::new(true).await;
        let ctx = h.connect(1);

        let frames = h.send(&ctx, commands::QUERY_STATUS, &[]).await;
        assert_eq!(frames, vec![Frame::new(0xA0, vec![0x01])]);

        h.sessions.set_flag(ConnectionId(1), Flag::Recording, true);
        let frames = h.send(&ctx, commands::QUERY_STATUS, &[]).await;
        let status = StatusSnapshot::from_byte(frames[0].data[0]);
        assert!(status.camera_connected && status.recording);
    }

    #[tokio::test]
    async fn test_queries_fall_back_without_camera() {
        let mut h = Harness::new(false).await;
        let ctx = h.connect(1);

        let frames = h.send(&ctx, commands::QUERY_PARAMS, &[]).await;
        assert_eq!(frames[0].command, 0xA1);
        assert_eq!(frames[0].data.len(), PARAMETER_BLOCK_SIZE);
        assert_eq!(ParameterBlock::decode(&frames[0].data).unwrap(), ParameterBlock::default());

        let frames = h.send(&ctx, commands::QUERY_RESOLUTIONS, &[]).await;
        assert_eq!(frames[0].command, 0xA2);
        assert_eq!(ResolutionList::decode(&frames[0].data).unwrap(), ResolutionList::fallback());

        let frames = h.send(&ctx, commands::QUERY_GAIN_AUTO, &[]).await;
        assert_eq!(frames, vec![Frame::new(0xA3, vec![0])]);

        // Queries never take control.
        assert_eq!(h.sessions.controller(), None);
    }

    #[tokio::test]
    async fn test_set_gain_then_query() {
        let mut h = Harness::new(true).await;
        let ctx = h.connect(1);

        assert_eq!(h.send(&ctx, commands::SET_GAIN, &[0x01, 0x2C]).await, ack(0x22));
        let frames = h.send(&ctx, commands::QUERY_PARAMS, &[]).await;
        let block = ParameterBlock::decode(&frames[0].data).unwrap();
        assert_eq!(block.gain_centi, 300);
        assert_eq!(h.sessions.controller(), Some(ConnectionId(1)));
    }

    #[tokio::test]
    async fn test_set_exposure_and_white_balance() {
        let mut h = Harness::new(true).await;
        let ctx = h.connect(1);

        let exposure = [1, 0x00, 0x00, 0x4E, 0x20];
        assert_eq!(h.send(&ctx, commands::SET_EXPOSURE, &exposure).await, ack(0x20));

        let wb = [1, 0x00, 0x96, 0x00, 0x64, 0x00, 0x78];
        assert_eq!(h.send(&ctx, commands::SET_WHITE_BALANCE, &wb).await, ack(0x21));

        let block = h.device.parameters().await;
        assert_eq!(block.exposure_us, 20_000);
        assert_eq!(block.white_balance_mode, Mode::Manual);
        assert_eq!((block.red_centi, block.green_centi, block.blue_centi), (150, 100, 120));
    }

    #[tokio::test]
    async fn test_set_out_of_range_reports_param_failed() {
        let mut h = Harness::new(true).await;
        let ctx = h.connect(1);

        let frames = h.send(&ctx, commands::SET_GAIN, &[0xFF, 0xFF]).await;
        assert_eq!(frames, failed(0x22, ErrorCode::ParamFailed));
        assert_eq!(h.device.parameters().await.gain_centi, 100);
    }

    #[tokio::test]
    async fn test_short_data_is_length_error() {
        let mut h = Harness::new(true).await;
        let ctx = h.connect(1);

        let frames = h.send(&ctx, commands::SET_EXPOSURE, &[1, 0, 0]).await;
        assert_eq!(frames, failed(0x20, ErrorCode::DataLengthError));

        // Trailing bytes are ignored.
        let frames = h.send(&ctx, commands::SET_GAIN_AUTO, &[1, 0xAA, 0xBB]).await;
        assert_eq!(frames, ack(0x24));
        let frames = h.send(&ctx, commands::QUERY_GAIN_AUTO, &[]).await;
        assert_eq!(frames, vec![Frame::new(0xA3, vec![1])]);
    }

    #[tokio::test]
    async fn test_set_resolution() {
        let mut h = Harness::new(true).await;
        let ctx = h.connect(1);

        let frames = h.send(&ctx, commands::SET_RESOLUTION, &[0x05, 0x00, 0x02, 0xD0]).await;
        assert_eq!(frames, ack(0x23));
        assert_eq!(h.device.parameters().await.resolution_index, 5);

        let frames = h.send(&ctx, commands::SET_RESOLUTION, &[0x00, 0x10, 0x00, 0x10]).await;
        assert_eq!(frames, failed(0x23, ErrorCode::UnsupportedResolution));
    }

    #[tokio::test]
    async fn test_frame_rate_and_pixel_format() {
        let mut h = Harness::new(true).await;
        let ctx = h.connect(1);

        let frames = h.send(&ctx, commands::SET_FRAME_RATE, &[1, 0, 0, 0x0B, 0xB8]).await;
        assert_eq!(frames, ack(0x25));
        let settings = h.device.settings_or_default().await;
        assert_eq!(settings.frame_rate_centi, Some(3000));

        let frames = h.send(&ctx, commands::SET_FRAME_RATE, &[1, 0, 0, 0, 0]).await;
        assert_eq!(frames, failed(0x25, ErrorCode::ParamFailed));

        assert_eq!(h.send(&ctx, commands::SET_PIXEL_FORMAT, &[4]).await, ack(0x26));
        let frames = h.send(&ctx, commands::SET_PIXEL_FORMAT, &[9]).await;
        assert_eq!(frames, failed(0x26, ErrorCode::ParamFailed));
    }

    #[tokio::test]
    async fn test_capture_single() {
        let mut h = Harness::new(true).await;
        let ctx = h.connect(1);

        let frames = h.send(&ctx, commands::CAPTURE_SINGLE, &[]).await;
        assert_eq!(frames, vec![Frame::new(0xB0, vec![0, 0, 0, 1, 0, 64, 0, 48])]);
        assert!(!h.sessions.any_flag(Flag::Capturing));
    }

    #[tokio::test]
    async fn test_capture_without_camera() {
        let mut h = Harness::new(false).await;
        let ctx = h.connect(1);

        let frames = h.send(&ctx, commands::CAPTURE_SINGLE, &[]).await;
        assert_eq!(frames, failed(0x10, ErrorCode::CameraNotConnected));
    }

    #[tokio::test]
    async fn test_capture_grab_failure() {
        let mut h = Harness::new(true).await;
        let ctx = h.connect(1);
        h.camera.fail_next(ErrorCode::GrabTimeout);

        let frames = h.send(&ctx, commands::CAPTURE_SINGLE, &[]).await;
        assert_eq!(frames, failed(0x10, ErrorCode::GrabTimeout));
        assert!(!h.sessions.any_flag(Flag::Capturing));
    }

    #[tokio::test]
    async fn test_record_lifecycle() {
        let mut h = Harness::new(true).await;
        let ctx = h.connect(1);

        assert_eq!(h.send(&ctx, commands::RECORD_START, &[]).await, ack(0x11));
        assert!(h.camera.is_capturing());

        let frames = h.send(&ctx, commands::RECORD_START, &[]).await;
        assert_eq!(frames, failed(0x11, ErrorCode::StateRecording));

        let frames = h.send(&ctx, commands::CAPTURE_SINGLE, &[]).await;
        assert_eq!(frames, failed(0x10, ErrorCode::StateRecording));

        let frames = h.send(&ctx, commands::PREVIEW_START, &[6, 10]).await;
        assert_eq!(frames, failed(0x13, ErrorCode::StateRecording));

        let frames = h.send(&ctx, commands::RECORD_STOP, &[]).await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], ack(0x12)[0]);
        assert_eq!(frames[1].command, 0xB1);
        assert_eq!(frames[1].data.len(), 4);
        assert!(!h.camera.is_capturing());

        // Stopping again is a plain success.
        assert_eq!(h.send(&ctx, commands::RECORD_STOP, &[]).await, ack(0x12));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_preview_start_stop() {
        let mut h = Harness::new(true).await;
        let ctx = h.connect(1);

        assert_eq!(h.send(&ctx, commands::PREVIEW_START, &[6, 10]).await, ack(0x13));
        assert!(h.device.preview().is_running());
        assert!(h.sessions.any_flag(Flag::Previewing));

        let frames = h.send(&ctx, commands::PREVIEW_START, &[6, 10]).await;
        assert_eq!(frames, failed(0x13, ErrorCode::PreviewAlreadyStarted));

        let frames = h.send(&ctx, commands::RECORD_START, &[]).await;
        assert_eq!(frames, ack(0x11));
        h.send(&ctx, commands::RECORD_STOP, &[]).await;

        // Preview frames reach the previewing connection.
        use tokio::io::AsyncReadExt;
        let mut decoder = crate::protocol::FrameBuffer::new();
        let mut buf = vec![0u8; 1 << 16];
        let preview = loop {
            let n = h.streams[0].read(&mut buf).await.unwrap();
            let found = decoder
                .push(&buf[..n])
                .into_iter()
                .filter_map(|d| d.into_frame())
                .find(|f| f.command == commands::PREVIEW_FRAME);
            if let Some(frame) = found {
                break frame;
            }
        };
        let (seq, jpeg) = parse_preview_data(&preview.data).unwrap();
        assert!(seq >= 1);
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        assert_eq!(h.send(&ctx, commands::PREVIEW_STOP, &[]).await, ack(0x14));
        assert!(!h.device.preview().is_running());
        assert!(!h.sessions.any_flag(Flag::Previewing));
        assert_eq!(h.send(&ctx, commands::PREVIEW_STOP, &[]).await, ack(0x14));
    }

    #[tokio::test]
    async fn test_preview_start_bad_index() {
        let mut h = Harness::new(true).await;
        let ctx = h.connect(1);

        let frames = h.send(&ctx, commands::PREVIEW_START, &[42, 10]).await;
        assert_eq!(frames, failed(0x13, ErrorCode::UnsupportedResolution));
        let frames = h.send(&ctx, commands::PREVIEW_START, &[1]).await;
        assert_eq!(frames, failed(0x13, ErrorCode::DataLengthError));
        assert!(!h.sessions.any_flag(Flag::Previewing));
    }

    #[tokio::test]
    async fn test_observer_rejected_while_controller_held() {
        let mut h = Harness::new(true).await;
        let a = h.connect(1);
        let b = h.connect(2);

        assert_eq!(h.send(&a, commands::SET_GAIN_AUTO, &[1]).await, ack(0x24));

        let frames = h.send(&b, commands::SET_GAIN_AUTO, &[0]).await;
        assert_eq!(frames, failed(0x24, ErrorCode::NotController));
        // No state mutated by the rejected command.
        assert!(h.device.settings_or_default().await.gain_auto);

        // Queries still work for observers.
        let frames = h.send(&b, commands::QUERY_GAIN_AUTO, &[]).await;
        assert_eq!(frames, vec![Frame::new(0xA3, vec![1])]);
    }

    #[tokio::test]
    async fn test_release_control() {
        let mut h = Harness::new(true).await;
        let a = h.connect(1);
        let b = h.connect(2);

        let frames = h.send(&b, commands::RELEASE_CONTROL, &[]).await;
        assert_eq!(frames, failed(0x1F, ErrorCode::NotController));

        h.send(&a, commands::SET_GAIN_AUTO, &[1]).await;
        assert_eq!(h.send(&a, commands::RELEASE_CONTROL, &[]).await, ack(0x1F));
        assert_eq!(h.sessions.controller(), None);

        assert_eq!(h.send(&b, commands::SET_GAIN_AUTO, &[0]).await, ack(0x24));
        assert_eq!(h.sessions.controller(), Some(ConnectionId(2)));
    }

    #[tokio::test]
    async fn test_disconnected_camera_error() {
        let mut h = Harness::new(true).await;
        let ctx = h.connect(1);
        h.camera.set_connected(false);

        let frames = h.send(&ctx, commands::RECORD_START, &[]).await;
        assert_eq!(frames, failed(0x11, ErrorCode::CameraNotConnected));

        let frames = h.send(&ctx, commands::QUERY_STATUS, &[]).await;
        assert_eq!(frames, vec![Frame::new(0xA0, vec![0x00])]);
    }
}
