//! TCP server: accept loop, per-connection read loop and teardown.
//!
//! The [`ServerBuilder`] wires the shared state together and binds the
//! listener. The [`Server`] then manages the lifecycle:
//! 1. Accept connections, assign each a [`ConnectionId`]
//! 2. Spawn a writer task per connection and register it
//! 3. Read frames and dispatch them in arrival order
//! 4. On disconnect, unregister and stop what only that connection used
//!
//! # Example
//!
//! ```ignore
//! use camwire::{ServerBuilder, SimulatedCamera};
//!
//! #[tokio::main]
//! async fn main() -> camwire::Result<()> {
//!     let server = ServerBuilder::new()
//!         .camera(SimulatedCamera::new(1280, 720))
//!         .bind()
//!         .await?;
//!     server.run_until(async { let _ = tokio::signal::ctrl_c().await; }).await
//! }
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::camera::{Camera, CameraHandle, SimulatedCamera};
use crate::config::ServerConfig;
use crate::congestion::CongestionDetector;
use crate::error::Result;
use crate::handler::{CommandContext, CommandRegistry, Device};
use crate::preview::PreviewPipeline;
use crate::protocol::{commands, failure_data, Decoded, ErrorCode, Frame, FrameBuffer};
use crate::reporter::spawn_reporter;
use crate::session::{ConnectionId, Flag, SessionRegistry};
use crate::writer::{spawn_writer_task, OutboundFrame, WriterConfig, WriterHandle};

/// Socket read buffer size.
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Builder for configuring and binding a server.
pub struct ServerBuilder {
    config: ServerConfig,
    camera: Option<CameraHandle>,
    registry: Option<CommandRegistry>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            camera: None,
            registry: None,
        }
    }

    /// Use a full configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the listen address.
    pub fn bind_to(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.tcp.host = host.into();
        self.config.tcp.port = port;
        self
    }

    /// Serve this camera instead of the configured simulated one.
    pub fn camera<C: Camera>(mut self, camera: C) -> Self {
        self.camera = Some(CameraHandle::new(camera));
        self
    }

    pub fn camera_handle(mut self, camera: CameraHandle) -> Self {
        self.camera = Some(camera);
        self
    }

    /// Replace the built-in command table.
    pub fn registry(mut self, registry: CommandRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Validate the config, open the camera and bind the listener.
    ///
    /// A camera that fails to open is logged; the server still starts and
    /// reports the camera as disconnected.
    pub async fn bind(self) -> Result<Server> {
        self.config.validate()?;
        let config = self.config;

        let camera = self.camera.unwrap_or_else(|| {
            CameraHandle::new(SimulatedCamera::new(
                config.camera.simulated_width,
                config.camera.simulated_height,
            ))
        });
        if !camera.is_connected() {
            if let Err(e) = camera.call(|c| c.open()).await {
                tracing::error!("Opening camera failed: {}", e);
            }
        }

        let sessions = Arc::new(SessionRegistry::new());
        let detector = Arc::new(CongestionDetector::new(config.congestion_config()));
        let preview =
            PreviewPipeline::new(config.preview_config(), sessions.clone(), detector.clone());
        let device = Arc::new(Device::new(camera, preview));
        let registry = Arc::new(
            self.registry
                .unwrap_or_else(CommandRegistry::with_builtin_commands),
        );

        let listener = TcpListener::bind(config.bind_address()).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Listening on {}", local_addr);

        Ok(Server {
            listener,
            local_addr,
            shared: Arc::new(Shared {
                sessions,
                device,
                registry,
                detector,
                writer_config: config.writer_config(),
                read_timeout: config.read_timeout(),
                nodelay: config.tcp.nodelay,
            }),
            report_interval: config.report_interval(),
        })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// State every connection task shares.
struct Shared {
    sessions: Arc<SessionRegistry>,
    device: Arc<Device>,
    registry: Arc<CommandRegistry>,
    detector: Arc<CongestionDetector>,
    writer_config: WriterConfig,
    read_timeout: Option<Duration>,
    nodelay: bool,
}

/// Why a connection's read loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    Eof,
    IdleTimeout,
    Shutdown,
}

/// A bound server.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    report_interval: Duration,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.shared.sessions
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.shared.device
    }

    pub fn detector(&self) -> &Arc<CongestionDetector> {
        &self.shared.detector
    }

    /// Serve until the process is killed.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `signal` completes, then shut down.
    ///
    /// Shutdown closes every connection, stops the reporter and the
    /// preview pipeline, and closes the camera.
    pub async fn run_until<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reporter = spawn_reporter(
            self.shared.sessions.clone(),
            self.shared.device.clone(),
            self.report_interval,
            shutdown_rx.clone(),
        );

        let mut connections = JoinSet::new();
        let mut next_id: u64 = 1;
        tokio::pin!(signal);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let id = ConnectionId(next_id);
                        next_id += 1;
                        connections.spawn(handle_connection(
                            self.shared.clone(),
                            stream,
                            id,
                            peer,
                            shutdown_rx.clone(),
                        ));
                    }
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                    }
                },
                // Reap finished connection tasks.
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = &mut signal => break,
            }
        }

        tracing::info!("Shutting down");
        let _ = shutdown_tx.send(true);
        while connections.join_next().await.is_some() {}
        let _ = reporter.await;

        let device = &self.shared.device;
        device.preview().stop(device.camera()).await;
        if let Err(e) = device.camera().call(|c| c.close()).await {
            tracing::warn!("Closing camera failed: {}", e);
        }
        tracing::info!("Server stopped");
        Ok(())
    }
}

async fn handle_connection(
    shared: Arc<Shared>,
    stream: TcpStream,
    id: ConnectionId,
    peer: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    if shared.nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("{}: set_nodelay failed: {}", id, e);
        }
    }

    let (reader, write_half) = stream.into_split();
    let (writer, writer_task) = spawn_writer_task(
        write_half,
        shared.writer_config.clone(),
        Some(shared.detector.clone()),
    );
    shared.sessions.register(id, writer.clone());
    tracing::info!("{} accepted from {}", id, peer);

    match read_loop(&shared, id, reader, &writer, &mut shutdown).await {
        Ok(reason) => tracing::info!("{} closed ({:?})", id, reason),
        Err(e) => tracing::info!("{} closed: {}", id, e),
    }

    teardown(&shared, id).await;
    drop(writer);
    // Frames still queued for a departed peer are discarded.
    writer_task.abort();
}

/// Read frames and dispatch them one at a time, so responses leave in
/// the order their commands arrived.
async fn read_loop<R>(
    shared: &Shared,
    id: ConnectionId,
    mut reader: R,
    writer: &WriterHandle,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<CloseReason>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let ctx = CommandContext::new(id, shared.sessions.clone(), shared.device.clone());
    let mut frame_buffer = FrameBuffer::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let read = tokio::select! {
            read = read_some(&mut reader, &mut buf, shared.read_timeout) => read,
            _ = shutdown.changed() => return Ok(CloseReason::Shutdown),
        };
        let n = match read? {
            Some(0) => return Ok(CloseReason::Eof),
            Some(n) => n,
            None => return Ok(CloseReason::IdleTimeout),
        };

        for decoded in frame_buffer.push(&buf[..n]) {
            let replies = match decoded {
                Decoded::Frame(frame) => shared.registry.dispatch(ctx.clone(), frame).await,
                Decoded::ChecksumMismatch {
                    command,
                    expected,
                    received,
                } => {
                    tracing::warn!(
                        "{}: checksum mismatch for command 0x{:02X} (expected 0x{:02X}, got 0x{:02X})",
                        id,
                        command,
                        expected,
                        received
                    );
                    vec![Frame::new(
                        commands::RESPONSE_FAILED,
                        failure_data(command, ErrorCode::ChecksumFailed),
                    )]
                }
            };

            for reply in replies {
                writer.send(OutboundFrame::response(&reply)?).await?;
            }
        }
    }
}

/// One socket read. `None` means the idle timeout elapsed.
async fn read_some<R>(
    reader: &mut R,
    buf: &mut [u8],
    timeout: Option<Duration>,
) -> Result<Option<usize>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, reader.read(buf)).await {
            Ok(read) => Ok(Some(read?)),
            Err(_) => Ok(None),
        },
        None => Ok(Some(reader.read(buf).await?)),
    }
}

/// Unregister `id` and stop device activity nobody else uses.
async fn teardown(shared: &Shared, id: ConnectionId) {
    let Some(departed) = shared.sessions.unregister(id) else {
        return;
    };
    let device = &shared.device;

    if departed.flags.recording && !shared.sessions.any_flag(Flag::Recording) {
        if let Err(e) = device.camera().call(|c| c.stop_capture()).await {
            tracing::warn!("{}: stopping capture on disconnect failed: {}", id, e);
        }
        if let Some(duration) = device.take_recording_duration() {
            tracing::info!("{}: recording stopped on disconnect after {:?}", id, duration);
        }
    }

    if departed.flags.previewing && !shared.sessions.any_flag(Flag::Previewing) {
        device.preview().stop(device.camera()).await;
    }
}
