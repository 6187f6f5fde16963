//! # camwire
//!
//! Control and live-preview streaming server for machine-vision cameras.
//!
//! Clients connect over TCP and exchange `FE FE`/`EF EF` delimited binary
//! frames. Any connection may query status, parameters and resolutions;
//! the first connection to send a mutating command becomes the controller
//! and keeps that role until it releases it or disconnects.
//!
//! ## Architecture
//!
//! - **Protocol**: frame codec and payload layouts ([`protocol`])
//! - **Sessions**: connection registry and controller arbitration ([`session`])
//! - **Dispatch**: command table with per-command authorization ([`handler`])
//! - **Preview**: latest-only camera grabs, JPEG encoding into pooled
//!   buffers, congestion-driven quality and frame skipping ([`preview`],
//!   [`buffer_pool`], [`congestion`])
//! - **Reporter**: periodic status broadcast ([`reporter`])
//!
//! ## Example
//!
//! ```ignore
//! use camwire::{ServerBuilder, SimulatedCamera};
//!
//! #[tokio::main]
//! async fn main() -> camwire::Result<()> {
//!     ServerBuilder::new()
//!         .bind_to("0.0.0.0", 8899)
//!         .camera(SimulatedCamera::new(1280, 720))
//!         .bind()
//!         .await?
//!         .run()
//!         .await
//! }
//! ```

pub mod buffer_pool;
pub mod camera;
pub mod config;
pub mod congestion;
pub mod error;
pub mod handler;
pub mod preview;
pub mod protocol;
pub mod reporter;
pub mod server;
pub mod session;
pub mod writer;

pub use camera::{Camera, CameraError, CameraHandle, SimulatedCamera};
pub use config::ServerConfig;
pub use error::{CamwireError, Result};
pub use handler::{CommandContext, CommandRegistry, Response};
pub use server::{Server, ServerBuilder};
