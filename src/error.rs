//! Error types for camwire.

use thiserror::Error;

use crate::camera::CameraError;
use crate::protocol::ErrorCode;

/// Main error type for all camwire operations.
#[derive(Debug, Error)]
pub enum CamwireError {
    /// I/O error on a socket or config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration value.
    #[error("Config error: {0}")]
    Config(String),

    /// Config file could not be parsed.
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Data does not fit in the 16-bit length field.
    #[error("Frame too large: {0} data bytes (max {max})", max = crate::protocol::MAX_DATA_SIZE)]
    FrameTooLarge(usize),

    /// Protocol error (malformed payload, bad field value).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No handler registered for the command code.
    #[error("Unknown command: 0x{0:02X}")]
    UnknownCommand(u8),

    /// Command data shorter than the command requires.
    #[error("Command 0x{command:02X} needs {expected} data bytes, got {actual}")]
    DataLength {
        command: u8,
        expected: usize,
        actual: usize,
    },

    /// Frame major version is not supported.
    #[error("Unsupported protocol version: 0x{0:02X}")]
    VersionMismatch(u8),

    /// Mutating command from a connection that does not hold control.
    #[error("Connection is not the controller")]
    NotController,

    /// Command conflicts with the current device state.
    #[error("State conflict: {0:?}")]
    StateConflict(ErrorCode),

    /// Camera collaborator failure.
    #[error(transparent)]
    Camera(#[from] CameraError),

    /// Preview image encoding failed.
    #[error("Image encode error: {0}")]
    Encode(#[from] image::ImageError),

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Backpressure timeout - send queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,
}

impl CamwireError {
    /// Wire error code reported to the client for this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            CamwireError::FrameTooLarge(_) | CamwireError::Protocol(_) => {
                ErrorCode::FrameFormatError
            }
            CamwireError::UnknownCommand(_) => ErrorCode::UnknownCommand,
            CamwireError::DataLength { .. } => ErrorCode::DataLengthError,
            CamwireError::VersionMismatch(_) => ErrorCode::VersionMismatch,
            CamwireError::NotController => ErrorCode::NotController,
            CamwireError::StateConflict(code) => *code,
            CamwireError::Camera(e) => e.code(),
            CamwireError::Encode(_) => ErrorCode::JpegEncodeFailed,
            CamwireError::Io(_)
            | CamwireError::Config(_)
            | CamwireError::ConfigParse(_)
            | CamwireError::ConnectionClosed
            | CamwireError::BackpressureTimeout => ErrorCode::Unknown,
        }
    }
}

/// Result type alias using CamwireError.
pub type Result<T> = std::result::Result<T, CamwireError>;
