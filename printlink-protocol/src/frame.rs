//! Marker framing for the printer protocol.
//!
//! Every message on the wire is wrapped in fixed two-byte markers:
//!
//! ```text
//! +--------+--------------------------------+--------+
//! | start  | body                           | end    |
//! | "@#"   | tag;arg;arg... (ASCII text)    | "#@"   |
//! +--------+--------------------------------+--------+
//! ```
//!
//! There is no length prefix, so frames are found by scanning. A frame may
//! arrive split across any number of socket reads, and one read may carry
//! several frames.

use crate::MAX_FRAME_SIZE;
use bytes::{Buf, Bytes, BytesMut};

/// Start-of-frame marker.
pub const FRAME_START: [u8; 2] = *b"@#";

/// End-of-frame marker.
pub const FRAME_END: [u8; 2] = *b"#@";

/// Accumulates received bytes and extracts complete frame bodies.
pub struct FrameScanner {
    buffer: BytesMut,
    max_frame_size: usize,
}

impl FrameScanner {
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Creates a scanner that abandons frames whose body grows past `max` bytes.
    pub fn with_max_frame_size(max: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            max_frame_size: max,
        }
    }

    /// Appends received bytes to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns the body of the next complete frame, if one is buffered.
    ///
    /// Everything up to and including the frame's end marker is consumed.
    /// Bytes that could still become part of a frame are kept for the next
    /// call.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        loop {
            let Some(start) = find_marker(&self.buffer, &FRAME_START) else {
                // Keep a trailing '@': it may be the first half of a start marker.
                let keep = usize::from(self.buffer.last() == Some(&FRAME_START[0]));
                let discard = self.buffer.len() - keep;
                self.buffer.advance(discard);
                return None;
            };

            let body_start = start + FRAME_START.len();
            match find_marker(&self.buffer[body_start..], &FRAME_END) {
                Some(body_len) => {
                    self.buffer.advance(body_start);
                    let body = self.buffer.split_to(body_len).freeze();
                    self.buffer.advance(FRAME_END.len());
                    return Some(body);
                }
                None if self.buffer.len() - body_start > self.max_frame_size => {
                    // Oversized: resynchronise on the next start marker.
                    self.buffer.advance(body_start);
                }
                None => {
                    self.buffer.advance(start);
                    return None;
                }
            }
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for FrameScanner {
    fn default() -> Self {
        Self::new()
    }
}

fn find_marker(haystack: &[u8], marker: &[u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == marker)
}

/// Wraps a body in frame markers.
pub fn wrap(body: &[u8], out: &mut BytesMut) {
    out.reserve(body.len() + FRAME_START.len() + FRAME_END.len());
    out.extend_from_slice(&FRAME_START);
    out.extend_from_slice(body);
    out.extend_from_slice(&FRAME_END);
}
