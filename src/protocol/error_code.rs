//! 16-bit error codes carried by `RESPONSE_FAILED` frames.

/// Error code reported to clients.
///
/// The high byte groups codes by category: 0x01 camera, 0x02 storage,
/// 0x03 state, 0x04 protocol, 0x05 encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    CameraNotConnected = 0x0101,
    CameraInitFailed = 0x0102,
    GrabTimeout = 0x0103,
    ParamFailed = 0x0104,
    CameraDisconnected = 0x0105,
    UnsupportedResolution = 0x0106,

    DiskSpaceLow = 0x0201,
    WritePermissionDenied = 0x0202,
    FileCreateFailed = 0x0203,

    StateRecording = 0x0301,
    StateCapturing = 0x0302,
    PreviewNotStarted = 0x0303,
    PreviewAlreadyStarted = 0x0304,
    NotController = 0x0305,

    ChecksumFailed = 0x0401,
    FrameFormatError = 0x0402,
    UnknownCommand = 0x0403,
    DataLengthError = 0x0404,
    VersionMismatch = 0x0405,

    JpegEncodeFailed = 0x0501,
    VideoEncodeFailed = 0x0502,
    EncoderInitFailed = 0x0503,

    Unknown = 0xFFFF,
}

impl ErrorCode {
    /// Numeric wire value.
    #[inline]
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Big-endian wire bytes.
    #[inline]
    pub fn to_be_bytes(self) -> [u8; 2] {
        self.code().to_be_bytes()
    }

    /// Map a wire value back to a known code.
    pub fn from_code(code: u16) -> Option<Self> {
        use ErrorCode::*;
        let known = match code {
            0x0101 => CameraNotConnected,
            0x0102 => CameraInitFailed,
            0x0103 => GrabTimeout,
            0x0104 => ParamFailed,
            0x0105 => CameraDisconnected,
            0x0106 => UnsupportedResolution,
            0x0201 => DiskSpaceLow,
            0x0202 => WritePermissionDenied,
            0x0203 => FileCreateFailed,
            0x0301 => StateRecording,
            0x0302 => StateCapturing,
            0x0303 => PreviewNotStarted,
            0x0304 => PreviewAlreadyStarted,
            0x0305 => NotController,
            0x0401 => ChecksumFailed,
            0x0402 => FrameFormatError,
            0x0403 => UnknownCommand,
            0x0404 => DataLengthError,
            0x0405 => VersionMismatch,
            0x0501 => JpegEncodeFailed,
            0x0502 => VideoEncodeFailed,
            0x0503 => EncoderInitFailed,
            0xFFFF => Unknown,
            _ => return None,
        };
        Some(known)
    }

    /// Whether the code reports a camera or device failure.
    #[inline]
    pub fn is_device_error(self) -> bool {
        self.code() >> 8 == 0x01
    }
}
