//! Periodic status broadcast.
//!
//! Every interval the reporter builds a `STATUS_REPORT` frame from the
//! session registry and camera link, and queues it on every connection
//! without waiting. It runs as its own task so command traffic cannot
//! starve it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::handler::Device;
use crate::protocol::commands;
use crate::session::SessionRegistry;
use crate::writer::{FrameKind, OutboundFrame};

/// Default status broadcast period.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Build one status report and queue it on every connection.
///
/// Returns the number of connections that accepted it.
pub fn broadcast_status(sessions: &SessionRegistry, device: &Device) -> usize {
    let status = device.status(sessions);
    match OutboundFrame::new(
        commands::STATUS_REPORT,
        vec![status.to_byte()].into(),
        FrameKind::Report,
    ) {
        Ok(frame) => sessions.broadcast(&frame),
        Err(e) => {
            tracing::error!("Building status report failed: {}", e);
            0
        }
    }
}

/// Spawn the reporter. It stops when `shutdown` becomes `true` or its
/// sender is dropped.
pub fn spawn_reporter(
    sessions: Arc<SessionRegistry>,
    device: Arc<Device>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let delivered = broadcast_status(&sessions, &device);
                    tracing::trace!("Status report queued on {} connection(s)", delivered);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Status reporter stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraHandle, SimulatedCamera};
    use crate::congestion::CongestionDetector;
    use crate::preview::{PreviewConfig, PreviewPipeline};
    use crate::protocol::FrameBuffer;
    use crate::session::{ConnectionId, Flag};
    use crate::writer::{spawn_writer_task, WriterConfig};
    use tokio::io::AsyncReadExt;

    async fn setup() -> (Arc<SessionRegistry>, Arc<Device>) {
        let handle = CameraHandle::new(SimulatedCamera::new(32, 24));
        handle.call(|c| c.open()).await.unwrap();
        let sessions = Arc::new(SessionRegistry::new());
        let preview = PreviewPipeline::new(
            PreviewConfig::default(),
            sessions.clone(),
            Arc::new(CongestionDetector::default()),
        );
        (sessions.clone(), Arc::new(Device::new(handle, preview)))
    }

    async fn read_frame(stream: &mut tokio::io::DuplexStream) -> crate::protocol::Frame {
        let mut decoder = FrameBuffer::new();
        let mut buf = [0u8; 256];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "stream closed");
            if let Some(frame) = decoder
                .push(&buf[..n])
                .into_iter()
                .find_map(|d| d.into_frame())
            {
                return frame;
            }
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_connection() {
        let (sessions, device) = setup().await;
        let mut streams = Vec::new();
        for id in 1..=3 {
            let (client, server) = tokio::io::duplex(4096);
            let (writer, _task) = spawn_writer_task(client, WriterConfig::default(), None);
            sessions.register(ConnectionId(id), writer);
            streams.push(server);
        }
        sessions.set_flag(ConnectionId(2), Flag::Recording, true);

        assert_eq!(broadcast_status(&sessions, &device), 3);
        for stream in &mut streams {
            let frame = read_frame(stream).await;
            assert_eq!(frame.command, 0xA0);
            assert_eq!(&frame.data[..], &[0b0000_0101]);
        }
    }

    #[tokio::test]
    async fn test_broadcast_without_connections() {
        let (sessions, device) = setup().await;
        assert_eq!(broadcast_status(&sessions, &device), 0);
    }

    #[tokio::test]
    async fn test_reporter_ticks_and_stops() {
        let (sessions, device) = setup().await;
        let (client, mut server) = tokio::io::duplex(4096);
        let (writer, _task) = spawn_writer_task(client, WriterConfig::default(), None);
        sessions.register(ConnectionId(1), writer);

        let (tx, rx) = watch::channel(false);
        let reporter = spawn_reporter(sessions, device, Duration::from_millis(20), rx);

        let frame = tokio::time::timeout(Duration::from_secs(2), read_frame(&mut server))
            .await
            .unwrap();
        assert_eq!(frame.command, commands::STATUS_REPORT);
        assert_eq!(&frame.data[..], &[0x01]);

        tx.send(true).unwrap();
        reporter.await.unwrap();
    }
}
