use dpl_core::wire::{FeedDecoder, FeedFrame, DEFAULT_MAX_FRAME_BYTES};
use std::collections::VecDeque;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::warn;

/// Pulls [`FeedFrame`]s off an NDJSON byte stream. Lines that fail to decode
/// are logged and skipped.
pub struct FeedReader<R> {
    reader: R,
    decoder: FeedDecoder,
    ready: VecDeque<FeedFrame>,
    read_buf: Vec<u8>,
    decode_errors: usize,
    eof: bool,
}

impl<R: AsyncRead + Unpin> FeedReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_frame_bytes(reader, DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            decoder: FeedDecoder::new(max_frame_bytes),
            ready: VecDeque::new(),
            read_buf: vec![0u8; 8192],
            decode_errors: 0,
            eof: false,
        }
    }

    /// `Ok(None)` at end of stream.
    pub async fn next_frame(&mut self) -> std::io::Result<Option<FeedFrame>> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Ok(Some(frame));
            }
            if self.eof {
                return Ok(None);
            }
            let read = self.reader.read(&mut self.read_buf).await?;
            let report = if read == 0 {
                self.eof = true;
                self.decoder.finish()
            } else {
                self.decoder.push_chunk(&self.read_buf[..read])
            };
            for err in report.errors {
                self.decode_errors += 1;
                warn!(event = "feed_decode_error", error = %err);
            }
            self.ready.extend(report.frames);
        }
    }

    pub fn decode_errors(&self) -> usize {
        self.decode_errors
    }
}
