//! Newline-delimited JSON framing.
//!
//! A frame is one serialized JSON value followed by `\n`. The decoder keeps a per-connection
//! buffer so frames split across reads are reassembled and several frames in one read are
//! split apart.

use serde_json::Value;

use crate::protocol::Message;

pub const DELIMITER: u8 = b'\n';
/// Largest partial frame kept in the buffer before it is dropped.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Invalid JSON format: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

/// Serializes a message as a single delimited line.
///
/// serde_json escapes control characters inside strings, so the output never contains a bare
/// delimiter before the final one.
pub fn encode(msg: &Message) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(msg)?;
    line.push(DELIMITER);
    Ok(line)
}

#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
    // Set after an oversized partial frame; the rest of it is skipped up to the next delimiter.
    discarding: bool,
    // Prefix of `buf` already known to hold no delimiter.
    scanned: usize,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one read chunk and returns every frame it completed, in arrival order.
    ///
    /// A segment that fails to parse yields one `Err` and is dropped; segments around it are
    /// unaffected. Blank segments are skipped silently.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Value, FrameError>> {
        let mut frames = Vec::new();
        self.buf.extend_from_slice(chunk);

        let mut start = 0;
        let mut from = self.scanned;
        while let Some(offset) = self.buf[from..].iter().position(|b| *b == DELIMITER) {
            let end = from + offset;
            if self.discarding {
                self.discarding = false;
            } else if let Some(frame) = decode_segment(&self.buf[start..end]) {
                frames.push(frame);
            }
            start = end + 1;
            from = start;
        }
        self.buf.drain(..start);
        self.scanned = self.buf.len();

        if self.buf.len() > MAX_FRAME_BYTES {
            self.buf.clear();
            self.scanned = 0;
            if !self.discarding {
                self.discarding = true;
                frames.push(Err(FrameError::TooLarge {
                    limit: MAX_FRAME_BYTES,
                }));
            }
        }

        frames
    }

    /// Bytes of an incomplete frame currently held.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

fn decode_segment(segment: &[u8]) -> Option<Result<Value, FrameError>> {
    let trimmed = segment.trim_ascii();
    if trimmed.is_empty() {
        return None;
    }
    Some(serde_json::from_slice(trimmed).map_err(FrameError::from))
}
