//! Frame struct and encoding.
//!
//! Represents one protocol message: version, command code and data.
//! Uses `bytes::Bytes` for zero-copy data sharing.
//!
//! # Example
//!
//! ```
//! use camwire::protocol::{encode, Frame};
//!
//! let bytes = encode(0x30, &[]).unwrap();
//! assert_eq!(bytes, [0xFE, 0xFE, 0x20, 0x00, 0x01, 0x30, 0x11, 0xEF, 0xEF]);
//!
//! let frame = Frame::new(0x90, vec![0x30]);
//! assert_eq!(frame.command(), 0x90);
//! assert_eq!(frame.data(), &[0x30]);
//! ```

use bytes::Bytes;

use super::wire_format::{
    FrameHeader, FRAME_OVERHEAD, HEADER_SIZE, MAX_DATA_SIZE, PROTOCOL_VERSION, TRAILER_SIZE,
};
use crate::error::{CamwireError, Result};

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Version byte as received (or [`PROTOCOL_VERSION`] for outbound frames).
    pub version: u8,
    /// Command code.
    pub command: u8,
    /// Data section (zero-copy via `bytes::Bytes`).
    pub data: Bytes,
}

impl Frame {
    /// Create an outbound frame with the current protocol version.
    pub fn new(command: u8, data: impl Into<Bytes>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            command,
            data: data.into(),
        }
    }

    /// Create a frame with an explicit version byte.
    pub fn with_version(version: u8, command: u8, data: impl Into<Bytes>) -> Self {
        Self {
            version,
            command,
            data: data.into(),
        }
    }

    /// Get the command code.
    #[inline]
    pub fn command(&self) -> u8 {
        self.command
    }

    /// Get a reference to the data bytes.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Get the data length.
    #[inline]
    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    /// Fixed header fields for this frame.
    ///
    /// Fails with `FrameTooLarge` if the data does not fit the length field.
    pub fn header(&self) -> Result<FrameHeader> {
        if self.data.len() > MAX_DATA_SIZE {
            return Err(CamwireError::FrameTooLarge(self.data.len()));
        }
        Ok(FrameHeader::new(self.version, self.command, self.data.len()))
    }

    /// Encode the full wire frame into one contiguous buffer.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let header = self.header()?;
        let mut buf = Vec::with_capacity(FRAME_OVERHEAD + self.data.len());
        buf.extend_from_slice(&header.encode());
        buf.extend_from_slice(&self.data);
        buf.extend_from_slice(&header.trailer(&self.data));
        Ok(buf)
    }
}

/// Encode `(command, data)` as a complete wire frame.
///
/// Fails with `FrameTooLarge` if `data.len() + 1` exceeds the 16-bit
/// length field.
pub fn encode(command: u8, data: &[u8]) -> Result<Vec<u8>> {
    let (header, trailer) = build_frame_parts(PROTOCOL_VERSION, command, data)?;
    let mut buf = Vec::with_capacity(FRAME_OVERHEAD + data.len());
    buf.extend_from_slice(&header);
    buf.extend_from_slice(data);
    buf.extend_from_slice(&trailer);
    Ok(buf)
}

/// Build the header and trailer around `data` for scatter/gather I/O.
///
/// The data itself is not copied.
pub fn build_frame_parts(
    version: u8,
    command: u8,
    data: &[u8],
) -> Result<([u8; HEADER_SIZE], [u8; TRAILER_SIZE])> {
    if data.len() > MAX_DATA_SIZE {
        return Err(CamwireError::FrameTooLarge(data.len()));
    }
    let header = FrameHeader::new(version, command, data.len());
    Ok((header.encode(), header.trailer(data)))
}
