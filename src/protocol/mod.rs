//! Protocol module - wire format, framing, and payload codecs.
//!
//! This module implements the binary camera-control protocol:
//! - `FE FE` / `EF EF` delimited frames with an XOR checksum
//! - Incremental decoder for fragmented and coalesced TCP reads
//! - 16-bit error codes
//! - Status, parameter, resolution and preview payloads

mod error_code;
mod frame;
mod frame_buffer;
mod payload;
mod wire_format;

pub use error_code::ErrorCode;
pub use frame::{build_frame_parts, encode, Frame};
pub use frame_buffer::{decode, Decoded, FrameBuffer};
pub use payload::{
    capture_complete_data, failure_data, parse_preview_data, put_preview_header,
    record_complete_data, success_data, Mode, ParameterBlock, Resolution, ResolutionList,
    StatusSnapshot, DEFAULT_RESOLUTION_INDEX, PARAMETER_BLOCK_SIZE, PREVIEW_HEADER_SIZE,
    RESOLUTION_TABLE,
};
pub use wire_format::{
    checksum, commands, is_version_supported, CommandClass, FrameHeader, FOOTER, FRAME_OVERHEAD,
    HEADER_SIZE, MAGIC, MAX_DATA_SIZE, MAX_FRAME_SIZE, PROTOCOL_VERSION, TRAILER_SIZE,
};
