//! Wire format constants, header encoding, and checksum.
//!
//! Frame layout:
//! ```text
//! ┌────────┬─────────┬──────────┬─────────┬────────────┬──────────┬────────┐
//! │ Magic  │ Version │ Length   │ Command │ Data       │ Checksum │ Footer │
//! │ FE FE  │ 1 byte  │ u16 BE   │ 1 byte  │ Length - 1 │ 1 byte   │ EF EF  │
//! └────────┴─────────┴──────────┴─────────┴────────────┴──────────┴────────┘
//! ```
//!
//! `Length` counts the command byte plus the data bytes, so it is never 0.
//! The checksum is the XOR of the version, both length bytes, the command
//! and every data byte.

/// Frame start marker.
pub const MAGIC: [u8; 2] = [0xFE, 0xFE];

/// Frame end marker.
pub const FOOTER: [u8; 2] = [0xEF, 0xEF];

/// Version byte written on every outbound frame (major 2, minor 0).
pub const PROTOCOL_VERSION: u8 = 0x20;

/// Major version accepted on inbound frames (high nibble of the version byte).
pub const SUPPORTED_MAJOR_VERSION: u8 = 2;

/// Magic + version + length + command.
pub const HEADER_SIZE: usize = 6;

/// Checksum + footer.
pub const TRAILER_SIZE: usize = 3;

/// Bytes a frame adds around its data.
pub const FRAME_OVERHEAD: usize = HEADER_SIZE + TRAILER_SIZE;

/// Largest data section that fits the 16-bit length field.
pub const MAX_DATA_SIZE: usize = u16::MAX as usize - 1;

/// Largest possible frame on the wire.
pub const MAX_FRAME_SIZE: usize = MAX_DATA_SIZE + FRAME_OVERHEAD;

/// Command codes.
pub mod commands {
    pub const CAPTURE_SINGLE: u8 = 0x10;
    pub const RECORD_START: u8 = 0x11;
    pub const RECORD_STOP: u8 = 0x12;
    pub const PREVIEW_START: u8 = 0x13;
    pub const PREVIEW_STOP: u8 = 0x14;
    /// The sender gives up the controller role.
    pub const RELEASE_CONTROL: u8 = 0x1F;

    pub const SET_EXPOSURE: u8 = 0x20;
    pub const SET_WHITE_BALANCE: u8 = 0x21;
    pub const SET_GAIN: u8 = 0x22;
    pub const SET_RESOLUTION: u8 = 0x23;
    pub const SET_GAIN_AUTO: u8 = 0x24;
    pub const SET_FRAME_RATE: u8 = 0x25;
    pub const SET_PIXEL_FORMAT: u8 = 0x26;

    pub const QUERY_STATUS: u8 = 0x30;
    pub const QUERY_PARAMS: u8 = 0x31;
    pub const QUERY_RESOLUTIONS: u8 = 0x32;
    pub const QUERY_GAIN_AUTO: u8 = 0x33;

    pub const HEARTBEAT: u8 = 0xFF;

    // Outbound only

    pub const RESPONSE_SUCCESS: u8 = 0x90;
    pub const RESPONSE_FAILED: u8 = 0x91;
    pub const STATUS_REPORT: u8 = 0xA0;
    pub const PARAMS_REPORT: u8 = 0xA1;
    pub const RESOLUTIONS_REPORT: u8 = 0xA2;
    pub const GAIN_AUTO_REPORT: u8 = 0xA3;
    pub const CAPTURE_COMPLETE: u8 = 0xB0;
    pub const RECORD_COMPLETE: u8 = 0xB1;
    pub const PREVIEW_FRAME: u8 = 0xC0;

    /// Response code paired with a query: request code + 0x80.
    #[inline]
    pub const fn response_for(query: u8) -> u8 {
        query.wrapping_add(0x80)
    }
}

/// Authorization class of a received command code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    /// 0x10-0x2F: mutating, controller only.
    Control,
    /// 0x30-0x3F: read-only, any connection.
    Query,
    /// Heartbeat: any connection.
    Open,
    /// 0x90-0xCF: server-to-client codes, never dispatched.
    Outbound,
    /// Anything else.
    Unassigned,
}

impl CommandClass {
    /// Classify a command code.
    pub fn of(command: u8) -> Self {
        match command {
            0x10..=0x2F => CommandClass::Control,
            0x30..=0x3F => CommandClass::Query,
            commands::HEARTBEAT => CommandClass::Open,
            0x90..=0xCF => CommandClass::Outbound,
            _ => CommandClass::Unassigned,
        }
    }
}

/// Check the major version nibble of a version byte.
#[inline]
pub fn is_version_supported(version: u8) -> bool {
    version >> 4 == SUPPORTED_MAJOR_VERSION
}

/// XOR checksum over version, length bytes, command and data.
pub fn checksum(version: u8, length: u16, command: u8, data: &[u8]) -> u8 {
    let [len_hi, len_lo] = length.to_be_bytes();
    data.iter()
        .fold(version ^ len_hi ^ len_lo ^ command, |acc, &b| acc ^ b)
}

/// Fixed fields that follow the magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol version byte.
    pub version: u8,
    /// Command byte + data length.
    pub length: u16,
    /// Command code.
    pub command: u8,
}

impl FrameHeader {
    /// Create a header for `data_len` data bytes. Caller checks the bound.
    #[inline]
    pub fn new(version: u8, command: u8, data_len: usize) -> Self {
        Self {
            version,
            length: (data_len + 1) as u16,
            command,
        }
    }

    /// Number of data bytes that follow the command.
    #[inline]
    pub fn data_len(&self) -> usize {
        self.length.saturating_sub(1) as usize
    }

    /// Total frame size on the wire.
    #[inline]
    pub fn frame_len(&self) -> usize {
        FRAME_OVERHEAD + self.data_len()
    }

    /// Encode magic + fixed fields.
    #[inline]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode into an existing buffer (zero-allocation).
    #[inline]
    pub fn encode_into(&self, buf: &mut [u8; HEADER_SIZE]) {
        buf[0..2].copy_from_slice(&MAGIC);
        buf[2] = self.version;
        buf[3..5].copy_from_slice(&self.length.to_be_bytes());
        buf[5] = self.command;
    }

    /// Decode from bytes starting at the magic.
    ///
    /// Returns `None` if fewer than [`HEADER_SIZE`] bytes are given or the
    /// magic does not match.
    #[inline]
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE || buf[0..2] != MAGIC {
            return None;
        }
        Some(Self {
            version: buf[2],
            length: u16::from_be_bytes([buf[3], buf[4]]),
            command: buf[5],
        })
    }

    /// Build the checksum + footer trailer for the given data.
    #[inline]
    pub fn trailer(&self, data: &[u8]) -> [u8; TRAILER_SIZE] {
        let sum = checksum(self.version, self.length, self.command, data);
        [sum, FOOTER[0], FOOTER[1]]
    }
}
