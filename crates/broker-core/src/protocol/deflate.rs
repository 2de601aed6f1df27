//! permessage-deflate compression contexts (RFC 7692).
//!
//! Each direction of a connection owns one context for its whole lifetime
//! ("context takeover"), so later messages can back-reference earlier ones.
//! A compressed message is a raw DEFLATE stream flushed with `Z_SYNC_FLUSH`
//! whose trailing `00 00 FF FF` marker is stripped before sending and
//! re-appended before inflating.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};
use thiserror::Error;

const SYNC_TAIL: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Errors raised by the compression contexts.
#[derive(Debug, Error)]
pub enum DeflateError {
    #[error("deflate failed: {0}")]
    Compress(#[from] flate2::CompressError),

    #[error("inflate failed: {0}")]
    Decompress(#[from] flate2::DecompressError),

    /// The inflated message would exceed the configured size limit.
    #[error("inflated message exceeds {max} bytes")]
    TooLarge { max: usize },

    /// The inflater stopped making progress on a truncated stream.
    #[error("inflate stalled on truncated input")]
    Stalled,
}

/// Outbound (server → client) compression context.
pub struct MessageDeflater {
    inner: Compress,
}

impl MessageDeflater {
    pub fn new() -> Self {
        Self {
            // `false` = raw deflate, no zlib header; window bits default to 15.
            inner: Compress::new(Compression::fast(), false),
        }
    }

    /// Compresses one whole message.
    ///
    /// # Errors
    ///
    /// Returns [`DeflateError::Compress`] if zlib reports a stream error.
    pub fn compress(&mut self, input: &[u8]) -> Result<Vec<u8>, DeflateError> {
        let mut out = Vec::with_capacity(input.len() / 2 + 64);
        let start_in = self.inner.total_in();

        loop {
            if out.capacity() - out.len() < 64 {
                out.reserve(out.capacity().max(64));
            }
            let consumed = (self.inner.total_in() - start_in) as usize;
            self.inner
                .compress_vec(&input[consumed..], &mut out, FlushCompress::Sync)?;
            let consumed = (self.inner.total_in() - start_in) as usize;
            // A sync flush is complete once zlib stops filling the buffer.
            if consumed == input.len() && out.len() < out.capacity() {
                break;
            }
        }

        if out.ends_with(&SYNC_TAIL) {
            out.truncate(out.len() - SYNC_TAIL.len());
        }
        Ok(out)
    }
}

impl Default for MessageDeflater {
    fn default() -> Self {
        Self::new()
    }
}

/// Inbound (client → server) decompression context.
pub struct MessageInflater {
    inner: Decompress,
    max_message: usize,
}

impl MessageInflater {
    /// Creates an inflater that refuses messages larger than `max_message`
    /// bytes once inflated.
    pub fn new(max_message: usize) -> Self {
        Self {
            inner: Decompress::new(false),
            max_message,
        }
    }

    /// Inflates one whole message (all fragments concatenated).
    ///
    /// # Errors
    ///
    /// - [`DeflateError::Decompress`] – corrupt stream.
    /// - [`DeflateError::TooLarge`] – the message exceeds the size limit.
    /// - [`DeflateError::Stalled`] – the stream ended mid-block.
    pub fn decompress(&mut self, input: &[u8]) -> Result<Vec<u8>, DeflateError> {
        let mut data = Vec::with_capacity(input.len() + SYNC_TAIL.len());
        data.extend_from_slice(input);
        data.extend_from_slice(&SYNC_TAIL);

        let mut out = Vec::with_capacity(input.len() * 2 + 64);
        let start_in = self.inner.total_in();

        loop {
            if out.len() == out.capacity() {
                out.reserve(out.capacity());
            }
            let consumed_before = (self.inner.total_in() - start_in) as usize;
            let produced_before = out.len();
            self.inner
                .decompress_vec(&data[consumed_before..], &mut out, FlushDecompress::Sync)?;
            let consumed = (self.inner.total_in() - start_in) as usize;

            if out.len() > self.max_message {
                return Err(DeflateError::TooLarge {
                    max: self.max_message,
                });
            }
            if consumed == data.len() && out.len() < out.capacity() {
                break;
            }
            if consumed == consumed_before
                && out.len() == produced_before
                && out.len() < out.capacity()
            {
                return Err(DeflateError::Stalled);
            }
        }
        Ok(out)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compressed_output_has_sync_tail_stripped() {
        let mut deflater = MessageDeflater::new();
        let out = deflater.compress(b"hello hello hello hello").unwrap();
        assert!(!out.ends_with(&SYNC_TAIL));
    }

    #[test]
    fn test_inflate_restores_original_message() {
        let mut deflater = MessageDeflater::new();
        let mut inflater = MessageInflater::new(1 << 20);
        let message = b"{\"type\":\"call\",\"id\":1}".repeat(20);
        let compressed = deflater.compress(&message).unwrap();
        assert!(compressed.len() < message.len());
        assert_eq!(inflater.decompress(&compressed).unwrap(), message);
    }

    #[test]
    fn test_context_takeover_shrinks_repeated_messages() {
        // The second identical message can back-reference the first one, so
        // it must compress to fewer bytes than the first.
        let mut deflater = MessageDeflater::new();
        let message = b"the quick brown fox jumps over the lazy dog".to_vec();
        let first = deflater.compress(&message).unwrap();
        let second = deflater.compress(&message).unwrap();
        assert!(second.len() < first.len());

        let mut inflater = MessageInflater::new(1 << 20);
        assert_eq!(inflater.decompress(&first).unwrap(), message);
        assert_eq!(inflater.decompress(&second).unwrap(), message);
    }

    #[test]
    fn test_inflate_rejects_messages_over_limit() {
        let mut deflater = MessageDeflater::new();
        let compressed = deflater.compress(&vec![b'a'; 10_000]).unwrap();
        let mut inflater = MessageInflater::new(1_000);
        assert!(matches!(
            inflater.decompress(&compressed),
            Err(DeflateError::TooLarge { max: 1_000 })
        ));
    }

    #[test]
    fn test_empty_message_round_trips() {
        let mut deflater = MessageDeflater::new();
        let mut inflater = MessageInflater::new(1024);
        let compressed = deflater.compress(b"").unwrap();
        assert!(inflater.decompress(&compressed).unwrap().is_empty());
    }
}
