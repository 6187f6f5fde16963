//! Command registry and dispatcher.
//!
//! Maps command codes to handlers and applies the checks every command
//! goes through before its handler runs: outbound-only codes, protocol
//! version, unknown codes and controller authorization. Handler errors become
//! `RESPONSE_FAILED` frames carrying the error's wire code.
//!
//! # Example
//!
//! ```ignore
//! use camwire::handler::{CommandRegistry, Response};
//!
//! let mut registry = CommandRegistry::new();
//! registry.register(0xFF, |_ctx, _data| async { Ok(Response::ack(0xFF)) });
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

use bytes::Bytes;

use super::{CommandContext, Response};
use crate::error::{CamwireError, Result};
use crate::protocol::{commands, failure_data, is_version_supported, CommandClass, Frame};
use crate::session::ControlGrant;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A command handler.
pub trait CommandHandler: Send + Sync + 'static {
    /// Handle one command's data bytes.
    fn call(&self, ctx: CommandContext, data: Bytes) -> BoxFuture<'static, Result<Response>>;
}

/// Adapter turning an async closure into a [`CommandHandler`].
pub struct FnHandler<F, Fut>
where
    F: Fn(CommandContext, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHandler<F, Fut>
where
    F: Fn(CommandContext, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut> CommandHandler for FnHandler<F, Fut>
where
    F: Fn(CommandContext, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    fn call(&self, ctx: CommandContext, data: Bytes) -> BoxFuture<'static, Result<Response>> {
        Box::pin((self.handler)(ctx, data))
    }
}

/// Who may run a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Any connection.
    Open,
    /// The controller; a free controller role is granted to the sender first.
    Controller,
    /// Only the current controller; never grants.
    HolderOnly,
}

impl Access {
    /// Default access for a command code.
    pub fn for_command(command: u8) -> Self {
        match CommandClass::of(command) {
            CommandClass::Control => Access::Controller,
            _ => Access::Open,
        }
    }
}

struct Entry {
    handler: Box<dyn CommandHandler>,
    access: Access,
}

/// Dispatch table from command code to handler.
pub struct CommandRegistry {
    entries: HashMap<u8, Entry>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Registry with every built-in command.
    pub fn with_builtin_commands() -> Self {
        let mut registry = Self::new();
        super::commands::register_builtin(&mut registry);
        registry
    }

    /// Register a handler with the access its code range implies.
    pub fn register<F, Fut>(&mut self, command: u8, handler: F)
    where
        F: Fn(CommandContext, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response>> + Send + 'static,
    {
        self.register_with_access(command, Access::for_command(command), handler);
    }

    pub fn register_with_access<F, Fut>(&mut self, command: u8, access: Access, handler: F)
    where
        F: Fn(CommandContext, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response>> + Send + 'static,
    {
        self.entries.insert(
            command,
            Entry {
                handler: Box::new(FnHandler::new(handler)),
                access,
            },
        );
    }

    pub fn contains(&self, command: u8) -> bool {
        self.entries.contains_key(&command)
    }

    pub fn access(&self, command: u8) -> Option<Access> {
        self.entries.get(&command).map(|e| e.access)
    }

    /// Number of registered commands.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run one received frame and return the frames to send back.
    ///
    /// Returns no frames for outbound-only codes.
    pub async fn dispatch(&self, ctx: CommandContext, frame: Frame) -> Vec<Frame> {
        let command = frame.command;

        if CommandClass::of(command) == CommandClass::Outbound {
            tracing::warn!(
                "{}: ignoring outbound-only code 0x{:02X}",
                ctx.conn_id(),
                command
            );
            return Vec::new();
        }

        if !is_version_supported(frame.version) {
            tracing::warn!(
                "{}: unsupported protocol version 0x{:02X} for command 0x{:02X}",
                ctx.conn_id(),
                frame.version,
                command
            );
            return failure(command, &CamwireError::VersionMismatch(frame.version));
        }

        let Some(entry) = self.entries.get(&command) else {
            tracing::warn!("{}: unknown command 0x{:02X}", ctx.conn_id(), command);
            return failure(command, &CamwireError::UnknownCommand(command));
        };

        if let Err(e) = authorize(&ctx, entry.access) {
            tracing::debug!(
                "{}: command 0x{:02X} rejected: {}",
                ctx.conn_id(),
                command,
                e
            );
            return failure(command, &e);
        }

        let conn_id = ctx.conn_id();
        match entry.handler.call(ctx, frame.data).await {
            Ok(response) => response.into_frames(),
            Err(e) => {
                match &e {
                    CamwireError::Camera(inner) => {
                        tracing::error!("{}: command 0x{:02X} failed: {}", conn_id, command, inner)
                    }
                    other => {
                        tracing::debug!("{}: command 0x{:02X} failed: {}", conn_id, command, other)
                    }
                }
                failure(command, &e)
            }
        }
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn authorize(ctx: &CommandContext, access: Access) -> Result<()> {
    match access {
        Access::Open => Ok(()),
        Access::Controller => match ctx.sessions().acquire_control(ctx.conn_id()) {
            ControlGrant::Granted | ControlGrant::AlreadyHeld => Ok(()),
            ControlGrant::Denied => Err(CamwireError::NotController),
        },
        Access::HolderOnly => {
            if ctx.sessions().controller() == Some(ctx.conn_id()) {
                Ok(())
            } else {
                Err(CamwireError::NotController)
            }
        }
    }
}

fn failure(command: u8, error: &CamwireError) -> Vec<Frame> {
    vec![Frame::new(
        commands::RESPONSE_FAILED,
        failure_data(command, error.error_code()),
    )]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraHandle, SimulatedCamera};
    use crate::congestion::CongestionDetector;
    use crate::handler::Device;
    use crate::preview::{PreviewConfig, PreviewPipeline};
    use crate::protocol::PROTOCOL_VERSION;
    use crate::session::{ConnectionId, SessionRegistry};
    use crate::writer::{spawn_writer_task, WriterConfig};
    use std::sync::Arc;

    fn setup() -> (Arc<SessionRegistry>, Arc<Device>) {
        let sessions = Arc::new(SessionRegistry::new());
        let preview = PreviewPipeline::new(
            PreviewConfig::default(),
            sessions.clone(),
            Arc::new(CongestionDetector::default()),
        );
        let device = Arc::new(Device::new(
            CameraHandle::new(SimulatedCamera::new(32, 32)),
            preview,
        ));
        (sessions, device)
    }

    fn connect(sessions: &Arc<SessionRegistry>, device: &Arc<Device>, id: u64) -> CommandContext {
        let (client, _server) = tokio::io::duplex(1024);
        let (writer, _task) = spawn_writer_task(client, WriterConfig::default(), None);
        sessions.register(ConnectionId(id), writer);
        CommandContext::new(ConnectionId(id), sessions.clone(), device.clone())
    }

    fn test_registry() -> CommandRegistry {
        let mut registry = CommandRegistry::new();
        registry.register(0x20, |_ctx, _data| async { Ok(Response::ack(0x20)) });
        registry.register(0x30, |_ctx, _data| async {
            Ok(Response::reply(0xA0, vec![0x01]))
        });
        registry.register(0x21, |_ctx, _data| async {
            Err(CamwireError::DataLength {
                command: 0x21,
                expected: 7,
                actual: 0,
            })
        });
        registry
    }

    #[test]
    fn test_register_and_access() {
        let registry = test_registry();
        assert_eq!(registry.len(), 3);
        assert!(registry.contains(0x20));
        assert_eq!(registry.access(0x20), Some(Access::Controller));
        assert_eq!(registry.access(0x30), Some(Access::Open));
        assert_eq!(registry.access(0x99), None);
    }

    #[tokio::test]
    async fn test_dispatch_query() {
        let (sessions, device) = setup();
        let ctx = connect(&sessions, &device, 1);

        let frames = test_registry().dispatch(ctx, Frame::new(0x30, Bytes::new())).await;
        assert_eq!(frames, vec![Frame::new(0xA0, vec![0x01])]);
        assert_eq!(sessions.controller(), None);
    }

    #[tokio::test]
    async fn test_dispatch_grants_control() {
        let (sessions, device) = setup();
        let a = connect(&sessions, &device, 1);
        let b = connect(&sessions, &device, 2);
        let registry = test_registry();

        let frames = registry.dispatch(a, Frame::new(0x20, Bytes::new())).await;
        assert_eq!(frames, vec![Frame::new(0x90, vec![0x20])]);
        assert_eq!(sessions.controller(), Some(ConnectionId(1)));

        let frames = registry.dispatch(b, Frame::new(0x20, Bytes::new())).await;
        assert_eq!(frames, vec![Frame::new(0x91, vec![0x20, 0x03, 0x05])]);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_command() {
        let (sessions, device) = setup();
        let ctx = connect(&sessions, &device, 1);

        let frames = test_registry().dispatch(ctx, Frame::new(0x77, Bytes::new())).await;
        assert_eq!(frames, vec![Frame::new(0x91, vec![0x77, 0x04, 0x03])]);
    }

    #[tokio::test]
    async fn test_dispatch_drops_outbound_codes() {
        let (sessions, device) = setup();
        let ctx = connect(&sessions, &device, 1);

        let frames = test_registry()
            .dispatch(ctx.clone(), Frame::new(0xA0, vec![0x01]))
            .await;
        assert!(frames.is_empty());

        // Dropped even when the version is also wrong.
        let frame = Frame::with_version(0x10, 0x91, Bytes::new());
        let frames = test_registry().dispatch(ctx, frame).await;
        assert!(frames.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_version_mismatch() {
        let (sessions, device) = setup();
        let ctx = connect(&sessions, &device, 1);

        let frame = Frame::with_version(0x10, 0x30, Bytes::new());
        let frames = test_registry().dispatch(ctx.clone(), frame).await;
        assert_eq!(frames, vec![Frame::new(0x91, vec![0x30, 0x04, 0x05])]);

        // Minor version differences are accepted.
        let frame = Frame::with_version(PROTOCOL_VERSION + 1, 0x30, Bytes::new());
        let frames = test_registry().dispatch(ctx, frame).await;
        assert_eq!(frames[0].command, 0xA0);
    }

    #[tokio::test]
    async fn test_dispatch_maps_handler_error() {
        let (sessions, device) = setup();
        let ctx = connect(&sessions, &device, 1);

        let frames = test_registry().dispatch(ctx, Frame::new(0x21, Bytes::new())).await;
        assert_eq!(frames, vec![Frame::new(0x91, vec![0x21, 0x04, 0x04])]);
    }

    #[tokio::test]
    async fn test_holder_only_never_grants() {
        let (sessions, device) = setup();
        let ctx = connect(&sessions, &device, 1);
        let mut registry = CommandRegistry::new();
        registry.register_with_access(0x1F, Access::HolderOnly, |_ctx, _data| async {
            Ok(Response::ack(0x1F))
        });

        let frames = registry.dispatch(ctx, Frame::new(0x1F, Bytes::new())).await;
        assert_eq!(frames, vec![Frame::new(0x91, vec![0x1F, 0x03, 0x05])]);
        assert_eq!(sessions.controller(), None);
    }
}
