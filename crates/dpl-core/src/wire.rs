use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::StatusEvent;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

/// One line of a newline-delimited status feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum FeedFrame {
    Connectivity { connected: bool },
    Event(StatusEvent),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("buffer exceeds max size without delimiter: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Default)]
pub struct DecodeReport {
    pub frames: Vec<FeedFrame>,
    pub errors: Vec<FrameError>,
}

impl DecodeReport {
    fn merge(&mut self, other: DecodeReport) {
        self.frames.extend(other.frames);
        self.errors.extend(other.errors);
    }
}

pub fn encode_frame(frame: &FeedFrame, max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    let mut encoded =
        serde_json::to_vec(frame).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    encoded.push(b'\n');
    Ok(encoded)
}

/// Incremental line decoder. A bad line is reported and skipped; decoding
/// continues with the next line.
pub struct FeedDecoder {
    max_frame_bytes: usize,
    pending: Vec<u8>,
}

impl Default for FeedDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FeedDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            pending: Vec::new(),
        }
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport {
        let mut report = DecodeReport::default();
        self.pending.extend_from_slice(chunk);

        while let Some(newline_idx) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line = self.pending.drain(..=newline_idx).collect::<Vec<u8>>();
            report.merge(self.decode_line(&line));
        }

        if self.pending.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedBuffer {
                size: self.pending.len(),
                max: self.max_frame_bytes,
            });
            self.pending.clear();
        }

        report
    }

    /// Decodes whatever is left after the final chunk (a last line without
    /// a trailing newline).
    pub fn finish(&mut self) -> DecodeReport {
        let rest = std::mem::take(&mut self.pending);
        self.decode_line(&rest)
    }

    fn decode_line(&self, line: &[u8]) -> DecodeReport {
        let mut report = DecodeReport::default();
        let trimmed = trim_line(line);
        if trimmed.is_empty() {
            return report;
        }
        if trimmed.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedFrame {
                size: trimmed.len(),
                max: self.max_frame_bytes,
            });
            return report;
        }
        match serde_json::from_slice(trimmed) {
            Ok(frame) => report.frames.push(frame),
            Err(err) => report.errors.push(FrameError::Decode(err.to_string())),
        }
        report
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut raw = line;
    while let Some((last, rest)) = raw.split_last() {
        if *last == b'\n' || *last == b'\r' || *last == b' ' {
            raw = rest;
        } else {
            break;
        }
    }
    raw
}
