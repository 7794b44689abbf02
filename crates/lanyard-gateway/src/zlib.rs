//! Streaming inflate for the zlib-stream gateway transport.
//!
//! One inflate context lives for the whole connection; binary frames feed
//! it and complete messages come out at the `00 00 FF FF` flush markers.
//! Frame boundaries and message boundaries are unrelated: a message may
//! span frames and a frame may carry several messages.

use bytes::BytesMut;
use flate2::{Decompress, FlushDecompress};

use crate::error::InflateError;

/// Trailing bytes of every sync-flushed message.
pub const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Scratch buffer for inflate output.
const INFLATE_CHUNK: usize = 128 * 1024;

/// Consecutive inflate failures before the context is declared corrupt.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

pub struct ZlibStream {
    inflate: Decompress,
    /// Compressed bytes received but not yet terminated by a flush marker.
    pending: BytesMut,
    scratch: Box<[u8]>,
    decompressed_total: u64,
    consecutive_failures: u32,
}

impl Default for ZlibStream {
    fn default() -> Self {
        Self::new()
    }
}

impl ZlibStream {
    pub fn new() -> Self {
        Self {
            inflate: Decompress::new(true),
            pending: BytesMut::new(),
            scratch: vec![0u8; INFLATE_CHUNK].into_boxed_slice(),
            decompressed_total: 0,
            consecutive_failures: 0,
        }
    }

    /// Cumulative decompressed bytes over the life of the shard,
    /// surviving context resets.
    pub fn decompressed_total(&self) -> u64 {
        self.decompressed_total
    }

    /// Drop the inflate context and any buffered input. Used after a
    /// corrupt stream or when a new connection starts.
    pub fn reset(&mut self) {
        self.inflate = Decompress::new(true);
        self.pending.clear();
        self.consecutive_failures = 0;
    }

    /// Feed one binary frame and collect every message it completes.
    ///
    /// `Err(InflateError::Corrupt)` means the context has failed
    /// repeatedly and the caller must reset and reconnect; other errors
    /// affect only the offending message.
    pub fn feed(&mut self, frame: &[u8]) -> Result<Vec<String>, InflateError> {
        self.pending.extend_from_slice(frame);

        let mut messages = Vec::new();
        while let Some(boundary) = find_suffix(self.pending.as_ref()) {
            let chunk_len = boundary + ZLIB_SUFFIX.len();
            let chunk = self.pending.split_to(chunk_len);

            match self.inflate_chunk(chunk.as_ref()) {
                Ok(raw) => {
                    self.consecutive_failures = 0;
                    self.decompressed_total += raw.len() as u64;
                    let text = String::from_utf8(raw).map_err(|_| InflateError::NotUtf8)?;
                    messages.push(text);
                }
                Err(err) => {
                    self.consecutive_failures += 1;
                    if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        return Err(InflateError::Corrupt(self.consecutive_failures));
                    }
                    return Err(err);
                }
            }
        }
        Ok(messages)
    }

    fn inflate_chunk(&mut self, mut input: &[u8]) -> Result<Vec<u8>, InflateError> {
        let mut out = Vec::new();
        while !input.is_empty() {
            let before_in = self.inflate.total_in();
            let before_out = self.inflate.total_out();

            self.inflate
                .decompress(input, &mut self.scratch, FlushDecompress::Sync)
                .map_err(|e| InflateError::Stream(e.to_string()))?;

            let consumed = (self.inflate.total_in() - before_in) as usize;
            let produced = (self.inflate.total_out() - before_out) as usize;
            out.extend_from_slice(&self.scratch[..produced]);

            if consumed == 0 && produced == 0 {
                return Err(InflateError::Stream("inflate made no progress".into()));
            }
            input = &input[consumed..];
        }
        Ok(out)
    }
}

fn find_suffix(buf: &[u8]) -> Option<usize> {
    buf.windows(ZLIB_SUFFIX.len()).position(|w| w == ZLIB_SUFFIX)
}
