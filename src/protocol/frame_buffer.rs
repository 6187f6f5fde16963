//! Incremental frame decoder over a rolling byte accumulator.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented and coalesced frames:
//! - `SeekingHeader`: scanning for the `FE FE` magic, dropping bytes ahead of it
//! - `ReadingFixedFields`: magic found, need version + length + command
//! - `AccumulatingPayload`: header parsed, need `length - 1` data bytes
//! - `ExpectingFooter`: need checksum + `EF EF`
//!
//! Bytes of a frame stay in the buffer until the frame is complete, so a
//! footer mismatch can resync by rescanning from the byte after the failed
//! magic without losing a real frame that was buffered behind it.
//!
//! # Example
//!
//! ```
//! use camwire::protocol::{encode, Decoded, FrameBuffer};
//!
//! let mut buffer = FrameBuffer::new();
//! let bytes = encode(0x30, &[]).unwrap();
//!
//! // Data arrives in chunks from the socket
//! assert!(buffer.push(&bytes[..4]).is_empty());
//! let decoded = buffer.push(&bytes[4..]);
//!
//! assert!(matches!(&decoded[0], Decoded::Frame(f) if f.command == 0x30));
//! ```

use bytes::{Buf, BytesMut};

use super::wire_format::{checksum, FrameHeader, FOOTER, HEADER_SIZE, MAGIC, MAX_FRAME_SIZE};
use super::Frame;

/// Result of extracting one structurally complete frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// Valid frame.
    Frame(Frame),
    /// Frame was complete but its checksum did not match. Its bytes were consumed.
    ChecksumMismatch {
        /// Command code of the rejected frame.
        command: u8,
        /// Checksum computed over the received fields.
        expected: u8,
        /// Checksum byte found on the wire.
        received: u8,
    },
}

impl Decoded {
    /// The frame, if it was valid.
    pub fn into_frame(self) -> Option<Frame> {
        match self {
            Decoded::Frame(frame) => Some(frame),
            Decoded::ChecksumMismatch { .. } => None,
        }
    }
}

/// State machine for frame parsing.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Looking for the magic.
    SeekingHeader,
    /// Magic at buffer start, waiting for the fixed fields.
    ReadingFixedFields,
    /// Fixed fields parsed, waiting for data bytes.
    AccumulatingPayload { header: FrameHeader },
    /// Data complete, waiting for checksum and footer.
    ExpectingFooter { header: FrameHeader },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
///
/// Never blocks and never owns I/O: callers push whatever the transport
/// delivered and collect the frames that became complete.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Bytes dropped while resynchronizing.
    discarded: u64,
}

impl FrameBuffer {
    /// Create a new frame buffer.
    ///
    /// Default capacity: 64KB.
    pub fn new() -> Self {
        Self::with_capacity(64 * 1024)
    }

    /// Create a new frame buffer with custom initial capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            state: State::SeekingHeader,
            discarded: 0,
        }
    }

    /// Push data into the buffer and extract everything that became complete.
    ///
    /// Returns valid frames and checksum failures in arrival order. If data is
    /// fragmented, partial data is buffered internally for the next push.
    pub fn push(&mut self, data: &[u8]) -> Vec<Decoded> {
        self.buffer.extend_from_slice(data);

        let mut decoded = Vec::new();
        while let Some(item) = self.decode_next() {
            decoded.push(item);
        }
        decoded
    }

    /// Try to extract a single frame from the buffer.
    ///
    /// Returns `None` when more bytes are needed.
    pub fn decode_next(&mut self) -> Option<Decoded> {
        loop {
            match self.state {
                State::SeekingHeader => match find_magic(&self.buffer) {
                    Some(pos) => {
                        if pos > 0 {
                            tracing::trace!("Dropping {} bytes ahead of frame magic", pos);
                            self.discard(pos);
                        }
                        self.state = State::ReadingFixedFields;
                    }
                    None => {
                        // Keep a trailing FE: it may be the first half of the magic.
                        let keep = usize::from(self.buffer.last() == Some(&MAGIC[0]));
                        let drop = self.buffer.len() - keep;
                        if drop > 0 {
                            self.discard(drop);
                        }
                        return None;
                    }
                },

                State::ReadingFixedFields => {
                    // FE FE FE: 0xFE is never a valid version, the magic starts one byte later.
                    if self.buffer.len() > 2 && self.buffer[2] == MAGIC[0] {
                        self.resync();
                        continue;
                    }

                    if self.buffer.len() < HEADER_SIZE {
                        return None;
                    }

                    match FrameHeader::decode(&self.buffer[..HEADER_SIZE]) {
                        Some(header) if header.length >= 1 => {
                            self.state = State::AccumulatingPayload { header };
                        }
                        _ => {
                            tracing::debug!("Zero length field after magic, resyncing");
                            self.resync();
                        }
                    }
                }

                State::AccumulatingPayload { header } => {
                    if self.buffer.len() < HEADER_SIZE + header.data_len() {
                        return None;
                    }
                    self.state = State::ExpectingFooter { header };
                }

                State::ExpectingFooter { header } => {
                    let total = header.frame_len();
                    if self.buffer.len() < total {
                        return None;
                    }

                    if self.buffer[total - 2..total] != FOOTER {
                        tracing::debug!(
                            "Footer mismatch for command 0x{:02X}, resyncing",
                            header.command
                        );
                        self.resync();
                        continue;
                    }

                    let data_end = HEADER_SIZE + header.data_len();
                    let received = self.buffer[data_end];
                    let expected = checksum(
                        header.version,
                        header.length,
                        header.command,
                        &self.buffer[HEADER_SIZE..data_end],
                    );

                    let frame_bytes = self.buffer.split_to(total).freeze();
                    self.state = State::SeekingHeader;

                    if expected != received {
                        return Some(Decoded::ChecksumMismatch {
                            command: header.command,
                            expected,
                            received,
                        });
                    }

                    let data = frame_bytes.slice(HEADER_SIZE..data_end);
                    return Some(Decoded::Frame(Frame::with_version(
                        header.version,
                        header.command,
                        data,
                    )));
                }
            }
        }
    }

    /// Drop the first magic byte and scan again from the next one.
    fn resync(&mut self) {
        self.discard(1);
        self.state = State::SeekingHeader;
    }

    fn discard(&mut self, count: usize) {
        self.buffer.advance(count);
        self.discarded += count as u64;
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Total bytes dropped while seeking or resyncing.
    pub fn discarded_bytes(&self) -> u64 {
        self.discarded
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::SeekingHeader;
    }

    /// Get the current state for debugging.
    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::SeekingHeader => "SeekingHeader",
            State::ReadingFixedFields => "ReadingFixedFields",
            State::AccumulatingPayload { .. } => "AccumulatingPayload",
            State::ExpectingFooter { .. } => "ExpectingFooter",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode at most one frame from the start of `buf`.
///
/// Returns the decoded item (or `None` if incomplete) and how many leading
/// bytes of `buf` were consumed, including any dropped ahead of the magic.
/// Callers keep the unconsumed tail and call again once more bytes arrive.
pub fn decode(buf: &[u8]) -> (Option<Decoded>, usize) {
    let mut decoder = FrameBuffer::with_capacity(buf.len().min(MAX_FRAME_SIZE));
    decoder.buffer.extend_from_slice(buf);
    let item = decoder.decode_next();
    (item, buf.len() - decoder.len())
}

fn find_magic(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == MAGIC)
}
