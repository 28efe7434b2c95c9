//! Ping protocol framing
//!
//! Every message on the wire travels in the same frame shape:
//!
//! ```text
//! 'B' 'R' [len: u16] [id: u16] [src: u8] [dst: u8] [payload; len] [checksum: u16]
//! ```
//!
//! - `'B' 'R'`: start marker
//! - `len`: payload length in bytes
//! - `id`: message id (see [`crate::MessageId`])
//! - `src` / `dst`: source and destination device ids
//! - `checksum`: wrapping 16-bit sum of every preceding byte of the frame
//!
//! All multi-byte fields are little endian.

use tracing::{debug, trace};

use crate::error::ParseError;

/// Frame start marker
pub const START: [u8; 2] = *b"BR";
/// Size of the fixed frame header (start marker, length, id, src, dst)
pub const HEADER_LEN: usize = 8;
/// Size of the checksum trailer
pub const CHECKSUM_LEN: usize = 2;
/// Largest payload the parser accepts before treating a header as corrupt
pub const MAX_PAYLOAD_LEN: usize = 8192;

/// Upper bound for buffered bytes that have not yet formed a frame
const MAX_BUFFER_LEN: usize = (HEADER_LEN + MAX_PAYLOAD_LEN + CHECKSUM_LEN) * 4;

/// One complete protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Frame {
    /// Message id
    pub message_id: u16,
    /// Device id of the sender
    pub src_device_id: u8,
    /// Device id of the intended receiver
    pub dst_device_id: u8,
    /// Raw payload bytes
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame addressed from/to device 0
    pub fn new(message_id: u16, payload: Vec<u8>) -> Self {
        Self {
            message_id,
            src_device_id: 0,
            dst_device_id: 0,
            payload,
        }
    }

    /// Set the source and destination device ids
    pub fn with_ids(mut self, src_device_id: u8, dst_device_id: u8) -> Self {
        self.src_device_id = src_device_id;
        self.dst_device_id = dst_device_id;
        self
    }

    /// Number of bytes this frame occupies on the wire
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len() + CHECKSUM_LEN
    }

    /// Serialize into wire bytes with the checksum appended
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&START);
        out.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.message_id.to_le_bytes());
        out.push(self.src_device_id);
        out.push(self.dst_device_id);
        out.extend_from_slice(&self.payload);
        let sum = checksum(&out);
        out.extend_from_slice(&sum.to_le_bytes());
        out
    }
}

/// Wrapping 16-bit byte sum used as the frame trailer
pub fn checksum(bytes: &[u8]) -> u16 {
    bytes
        .iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)))
}

/// Streaming frame parser
///
/// Bytes are pushed in whatever chunks the transport delivers; complete
/// frames are pulled out with [`PingCodec::next_frame`]. A corrupt frame is
/// reported once as an error, its start marker is dropped, and parsing resumes
/// at the next `"BR"` in the buffer.
#[derive(Debug, Default)]
pub struct PingCodec {
    buffer: Vec<u8>,
    parsed: u64,
    errors: u64,
}

impl PingCodec {
    /// Create an empty parser
    pub fn new() -> Self {
        Self::default()
    }

    /// Push raw bytes into the parser's buffer
    pub fn push_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);

        if self.buffer.len() > MAX_BUFFER_LEN {
            let start = self.buffer.len() - MAX_BUFFER_LEN / 2;
            debug!("Parser buffer overflow, dropping {} bytes", start);
            self.buffer.drain(..start);
        }
    }

    /// Try to extract the next frame from the buffer
    ///
    /// Returns `None` when more bytes are needed.
    pub fn next_frame(&mut self) -> Option<Result<Frame, ParseError>> {
        self.next_frame_with_bytes()
            .map(|result| result.map(|(frame, _)| frame))
    }

    /// Like [`PingCodec::next_frame`] but also returns the raw frame bytes
    pub fn next_frame_with_bytes(&mut self) -> Option<Result<(Frame, Vec<u8>), ParseError>> {
        self.sync_to_start()?;

        if self.buffer.len() < HEADER_LEN {
            return None;
        }

        let payload_len = usize::from(u16::from_le_bytes([self.buffer[2], self.buffer[3]]));
        if payload_len > MAX_PAYLOAD_LEN {
            self.reject();
            return Some(Err(ParseError::InvalidLength {
                declared: payload_len,
                max: MAX_PAYLOAD_LEN,
            }));
        }

        let total = HEADER_LEN + payload_len + CHECKSUM_LEN;
        if self.buffer.len() < total {
            return None;
        }

        let expected = checksum(&self.buffer[..total - CHECKSUM_LEN]);
        let actual = u16::from_le_bytes([self.buffer[total - 2], self.buffer[total - 1]]);
        if expected != actual {
            self.reject();
            return Some(Err(ParseError::ChecksumMismatch { expected, actual }));
        }

        let raw: Vec<u8> = self.buffer.drain(..total).collect();
        let frame = Frame {
            message_id: u16::from_le_bytes([raw[4], raw[5]]),
            src_device_id: raw[6],
            dst_device_id: raw[7],
            payload: raw[HEADER_LEN..total - CHECKSUM_LEN].to_vec(),
        };
        self.parsed += 1;
        trace!(
            "Parsed frame id={} src={} dst={} len={}",
            frame.message_id,
            frame.src_device_id,
            frame.dst_device_id,
            payload_len
        );
        Some(Ok((frame, raw)))
    }

    /// Number of frames decoded successfully
    pub fn parsed(&self) -> u64 {
        self.parsed
    }

    /// Number of corrupt frames discarded
    pub fn errors(&self) -> u64 {
        self.errors
    }

    /// Bytes currently buffered
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clear the internal buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Drop leading bytes until the buffer starts with a start marker
    ///
    /// Returns `None` if no complete marker is buffered yet. A trailing `'B'`
    /// is kept since it may be the first half of a marker.
    fn sync_to_start(&mut self) -> Option<()> {
        match self.buffer.windows(2).position(|w| w == START) {
            Some(0) => Some(()),
            Some(pos) => {
                trace!("Skipping {} bytes before start marker", pos);
                self.buffer.drain(..pos);
                Some(())
            }
            None => {
                let keep = usize::from(self.buffer.last() == Some(&START[0]));
                let drop = self.buffer.len() - keep;
                if drop > 0 {
                    trace!("Skipping {} bytes without start marker", drop);
                    self.buffer.drain(..drop);
                }
                None
            }
        }
    }

    /// Discard the start marker of a corrupt frame so the next sync moves past it
    fn reject(&mut self) {
        self.errors += 1;
        self.buffer.drain(..1);
    }
}
