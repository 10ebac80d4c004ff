//! Line-delimited frame decoder for the telemetry stream.
//!
//! Frames are separated by `\n`. Server-sent-event framing is tolerated:
//! `data:` prefixes are stripped, `event:`/`id:`/`retry:` fields, comment lines
//! (`:`) and blank keep-alive lines are ignored.

use crate::error::DecodeError;
use crate::sample::Sample;

/// Upper bound for a single unterminated frame.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug)]
pub struct FrameDecoder {
    pending: Vec<u8>,
    max_frame_bytes: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_frame_bytes(MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_frame_bytes,
        }
    }

    /// Feed a chunk of bytes and return every complete frame it finished.
    ///
    /// A frame that fails to decode is reported as an error and the
    /// unterminated remainder is discarded, so the next frame starts clean.
    /// When the following frame was already split across chunks, its first
    /// half goes with the remainder and that frame is lost too: one malformed
    /// frame can cost at most one valid neighbour.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Sample, DecodeError>> {
        self.pending.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut failed = false;
        while let Some(end) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            if let Some(result) = decode_line(&line) {
                failed |= result.is_err();
                frames.push(result);
            }
        }

        if failed {
            self.pending.clear();
        } else if self.pending.len() > self.max_frame_bytes {
            self.pending.clear();
            frames.push(Err(DecodeError::Oversized {
                limit: self.max_frame_bytes,
            }));
        }

        frames
    }

    /// Bytes buffered for a frame that has not been terminated yet.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drop any partial frame, e.g. when the connection ends.
    pub fn reset(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }
}

fn decode_line(line: &[u8]) -> Option<Result<Sample, DecodeError>> {
    let text = match std::str::from_utf8(line) {
        Ok(text) => text.trim(),
        Err(err) => return Some(Err(err.into())),
    };

    if text.is_empty() || text.starts_with(':') {
        return None;
    }

    let payload = match text.strip_prefix("data:") {
        Some(payload) => payload.trim_start(),
        None if is_sse_field(text) => return None,
        None => text,
    };

    Some(Sample::decode(payload))
}

fn is_sse_field(text: &str) -> bool {
    ["event:", "id:", "retry:"]
        .iter()
        .any(|field| text.starts_with(field))
}
