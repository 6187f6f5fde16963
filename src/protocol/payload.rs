//! Fixed-width payload codecs for status, parameters and notifications.
//!
//! Plain value structs with explicit big-endian field encoding.

use bytes::{BufMut, Bytes, BytesMut};

use super::ErrorCode;
use crate::error::{CamwireError, Result};

/// Size of the parameter block on the wire.
pub const PARAMETER_BLOCK_SIZE: usize = 18;

/// Size of one resolution entry in a resolution list.
pub const RESOLUTION_ENTRY_SIZE: usize = 4;

/// Bytes ahead of the JPEG in a preview frame (seq + length).
pub const PREVIEW_HEADER_SIZE: usize = 8;

/// Resolutions addressable by index (parameter block, `PREVIEW_START`).
pub const RESOLUTION_TABLE: [Resolution; 7] = [
    Resolution::new(5472, 3648),
    Resolution::new(4096, 2160),
    Resolution::new(3840, 2160),
    Resolution::new(2736, 1824),
    Resolution::new(1920, 1080),
    Resolution::new(1280, 720),
    Resolution::new(640, 480),
];

/// Index of 1920x1080 in [`RESOLUTION_TABLE`].
pub const DEFAULT_RESOLUTION_INDEX: u16 = 4;

/// One byte of device status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub camera_connected: bool,
    pub capturing: bool,
    pub recording: bool,
    pub previewing: bool,
}

impl StatusSnapshot {
    const CAMERA_CONNECTED: u8 = 0b0000_0001;
    const CAPTURING: u8 = 0b0000_0010;
    const RECORDING: u8 = 0b0000_0100;
    const PREVIEWING: u8 = 0b0000_1000;

    /// Encode as the status byte. Bits 4-7 are always zero.
    pub fn to_byte(self) -> u8 {
        let mut status = 0;
        if self.camera_connected {
            status |= Self::CAMERA_CONNECTED;
        }
        if self.capturing {
            status |= Self::CAPTURING;
        }
        if self.recording {
            status |= Self::RECORDING;
        }
        if self.previewing {
            status |= Self::PREVIEWING;
        }
        status
    }

    /// Decode a status byte, ignoring reserved bits.
    pub fn from_byte(status: u8) -> Self {
        Self {
            camera_connected: status & Self::CAMERA_CONNECTED != 0,
            capturing: status & Self::CAPTURING != 0,
            recording: status & Self::RECORDING != 0,
            previewing: status & Self::PREVIEWING != 0,
        }
    }
}

/// Exposure and white-balance mode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Auto = 0,
    Manual = 1,
}

impl Mode {
    /// Parse a mode byte. Any non-zero value is manual.
    pub fn from_byte(byte: u8) -> Self {
        if byte == 0 {
            Mode::Auto
        } else {
            Mode::Manual
        }
    }
}

/// The 18-byte camera parameter block.
///
/// | Offset | Field | Encoding |
/// |---|---|---|
/// | 0 | exposure mode | u8, 0 auto / 1 manual |
/// | 1 | exposure | u32 microseconds |
/// | 5 | gain | u32 hundredths (1.0 = 100) |
/// | 9 | white balance mode | u8, 0 auto / 1 manual |
/// | 10 | red, green, blue | 3 x u16 hundredths |
/// | 16 | resolution index | u16 into [`RESOLUTION_TABLE`] |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterBlock {
    pub exposure_mode: Mode,
    pub exposure_us: u32,
    pub gain_centi: u32,
    pub white_balance_mode: Mode,
    pub red_centi: u16,
    pub green_centi: u16,
    pub blue_centi: u16,
    pub resolution_index: u16,
}

impl Default for ParameterBlock {
    fn default() -> Self {
        Self {
            exposure_mode: Mode::Manual,
            exposure_us: 10_000,
            gain_centi: 100,
            white_balance_mode: Mode::Auto,
            red_centi: 100,
            green_centi: 100,
            blue_centi: 100,
            resolution_index: DEFAULT_RESOLUTION_INDEX,
        }
    }
}

impl ParameterBlock {
    /// Encode to the fixed 18-byte layout.
    pub fn encode(&self) -> [u8; PARAMETER_BLOCK_SIZE] {
        let mut buf = [0u8; PARAMETER_BLOCK_SIZE];
        buf[0] = self.exposure_mode as u8;
        buf[1..5].copy_from_slice(&self.exposure_us.to_be_bytes());
        buf[5..9].copy_from_slice(&self.gain_centi.to_be_bytes());
        buf[9] = self.white_balance_mode as u8;
        buf[10..12].copy_from_slice(&self.red_centi.to_be_bytes());
        buf[12..14].copy_from_slice(&self.green_centi.to_be_bytes());
        buf[14..16].copy_from_slice(&self.blue_centi.to_be_bytes());
        buf[16..18].copy_from_slice(&self.resolution_index.to_be_bytes());
        buf
    }

    /// Decode from at least 18 bytes.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < PARAMETER_BLOCK_SIZE {
            return Err(CamwireError::Protocol(format!(
                "Parameter block needs {} bytes, got {}",
                PARAMETER_BLOCK_SIZE,
                buf.len()
            )));
        }
        Ok(Self {
            exposure_mode: Mode::from_byte(buf[0]),
            exposure_us: u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]),
            gain_centi: u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]),
            white_balance_mode: Mode::from_byte(buf[9]),
            red_centi: u16::from_be_bytes([buf[10], buf[11]]),
            green_centi: u16::from_be_bytes([buf[12], buf[13]]),
            blue_centi: u16::from_be_bytes([buf[14], buf[15]]),
            resolution_index: u16::from_be_bytes([buf[16], buf[17]]),
        })
    }
}

/// Image width and height in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u16,
    pub height: u16,
}

impl Resolution {
    pub const fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }

    /// Look up a table entry by index.
    pub fn from_index(index: u16) -> Option<Self> {
        RESOLUTION_TABLE.get(index as usize).copied()
    }

    /// Table index of this resolution, if it has one.
    pub fn index(&self) -> Option<u16> {
        RESOLUTION_TABLE
            .iter()
            .position(|r| r == self)
            .map(|i| i as u16)
    }
}

/// `count(1)` followed by `count` entries of `width(2), height(2)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionList(pub Vec<Resolution>);

impl ResolutionList {
    /// List reported when the camera cannot be asked.
    pub fn fallback() -> Self {
        Self(vec![
            Resolution::new(1920, 1080),
            Resolution::new(1280, 720),
            Resolution::new(640, 480),
        ])
    }

    pub fn contains(&self, resolution: Resolution) -> bool {
        self.0.contains(&resolution)
    }

    /// Encode; lists longer than 255 entries are truncated.
    pub fn encode(&self) -> Bytes {
        let entries = &self.0[..self.0.len().min(u8::MAX as usize)];
        let mut buf = BytesMut::with_capacity(1 + entries.len() * RESOLUTION_ENTRY_SIZE);
        buf.put_u8(entries.len() as u8);
        for r in entries {
            buf.put_u16(r.width);
            buf.put_u16(r.height);
        }
        buf.freeze()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let (&count, rest) = buf
            .split_first()
            .ok_or_else(|| CamwireError::Protocol("Empty resolution list".to_string()))?;
        let needed = count as usize * RESOLUTION_ENTRY_SIZE;
        if rest.len() < needed {
            return Err(CamwireError::Protocol(format!(
                "Resolution list declares {} entries but has {} bytes",
                count,
                rest.len()
            )));
        }
        let entries = rest[..needed]
            .chunks_exact(RESOLUTION_ENTRY_SIZE)
            .map(|c| Resolution::new(u16::from_be_bytes([c[0], c[1]]), u16::from_be_bytes([c[2], c[3]])))
            .collect();
        Ok(Self(entries))
    }
}

/// Data of a `RESPONSE_SUCCESS` frame.
pub fn success_data(command: u8) -> Bytes {
    Bytes::copy_from_slice(&[command])
}

/// Data of a `RESPONSE_FAILED` frame: command + u16 error code.
pub fn failure_data(command: u8, code: ErrorCode) -> Bytes {
    let [hi, lo] = code.to_be_bytes();
    Bytes::copy_from_slice(&[command, hi, lo])
}

/// Write the preview frame header ahead of a JPEG of `jpeg_len` bytes.
pub fn put_preview_header(buf: &mut impl BufMut, seq: u32, jpeg_len: usize) {
    buf.put_u32(seq);
    buf.put_u32(jpeg_len as u32);
}

/// Split preview frame data into sequence number and JPEG bytes.
pub fn parse_preview_data(data: &[u8]) -> Result<(u32, &[u8])> {
    if data.len() < PREVIEW_HEADER_SIZE {
        return Err(CamwireError::Protocol("Preview frame too short".to_string()));
    }
    let seq = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let len = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
    let jpeg = data
        .get(PREVIEW_HEADER_SIZE..PREVIEW_HEADER_SIZE + len)
        .ok_or_else(|| CamwireError::Protocol("Preview JPEG truncated".to_string()))?;
    Ok((seq, jpeg))
}

/// Data of a `CAPTURE_COMPLETE` notification.
pub fn capture_complete_data(seq: u32, resolution: Resolution) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u32(seq);
    buf.put_u16(resolution.width);
    buf.put_u16(resolution.height);
    buf.freeze()
}

/// Data of a `RECORD_COMPLETE` notification.
pub fn record_complete_data(duration_ms: u32) -> Bytes {
    Bytes::copy_from_slice(&duration_ms.to_be_bytes())
}
