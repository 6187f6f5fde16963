//! Handler module - command handling and dispatch.
//!
//! Provides:
//! - [`CommandRegistry`] - maps command codes to handlers and authorizes them
//! - [`CommandContext`] - identifies the sender and exposes shared state
//! - [`Device`] - camera, preview pipeline and recording state
//! - [`Response`] - frames returned to the sender
//!
//! The built-in command set is installed by
//! [`CommandRegistry::with_builtin_commands`].

mod commands;
mod context;
mod registry;

pub use context::{CommandContext, Device, Response};
pub use registry::{Access, BoxFuture, CommandHandler, CommandRegistry, FnHandler};
