//! Self-describing compression codec.
//!
//! Compressed buffers always begin with [`COMPRESSION_MAGIC`]; the absence of
//! that byte marks a raw payload. The codec never enforces the inverse:
//! callers must guarantee that a raw payload handed to the wire cannot begin
//! with the magic value. A payload that collides goes through
//! [`CompressionCodec::compress_force`], which wraps it in a real deflate
//! stream so the receive side expands it back verbatim.
//!
//! All entry points serialize on one lock because the scratch buffers are
//! reused across calls. The lock is never held across any I/O.

use std::io::{Read, Write};
use std::sync::{Mutex, PoisonError};

use bytes::Bytes;
use flate2::{read::DeflateDecoder, write::DeflateEncoder, Compression};
use thiserror::Error;

/// First byte of every compressed buffer.
pub const COMPRESSION_MAGIC: u8 = 0x4E;

/// Payloads below this size skip compression; the overhead isn't worth it.
const COMPRESSION_THRESHOLD: usize = 64;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("deflate failed: {0}")]
    Deflate(std::io::Error),
    #[error("compressed payload truncated or corrupt: {0}")]
    Corrupt(std::io::Error),
}

/// Result of a decompression attempt. Corruption is an `Err`, never a
/// partial buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum DecompressOutcome {
    /// Input carried no magic byte and is passed through unchanged.
    Raw,
    /// Input was compressed and expanded successfully.
    Expanded(Bytes),
}

/// Thread-safe deflate codec with reusable scratch buffers.
#[derive(Debug, Default)]
pub struct CompressionCodec {
    scratch: Mutex<Vec<u8>>,
}

impl CompressionCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compresses `buffer`, prefixing the magic byte.
    ///
    /// Idempotent-safe: input that already begins with the magic byte is
    /// returned unchanged, so independent call sites sharing one pipeline
    /// never double-compress. Input that does not shrink is also returned
    /// unchanged (raw), which the decompress side passes through.
    pub fn compress(&self, buffer: &[u8]) -> Result<Bytes, CodecError> {
        if buffer.first() == Some(&COMPRESSION_MAGIC) {
            return Ok(Bytes::copy_from_slice(buffer));
        }
        if buffer.len() < COMPRESSION_THRESHOLD {
            return Ok(Bytes::copy_from_slice(buffer));
        }

        let compressed = self.deflate(buffer)?;
        if compressed.len() < buffer.len() {
            Ok(compressed)
        } else {
            Ok(Bytes::copy_from_slice(buffer))
        }
    }

    /// Compresses `buffer` unconditionally, bypassing the idempotence and
    /// size short-circuits.
    ///
    /// For raw payloads whose first byte happens to equal the magic value:
    /// sent as-is, the receive side would misread them as compressed and
    /// reject them. Deflating them restores the framing guarantee, trading
    /// a few bytes of growth on small inputs.
    pub fn compress_force(&self, buffer: &[u8]) -> Result<Bytes, CodecError> {
        self.deflate(buffer)
    }

    fn deflate(&self, buffer: &[u8]) -> Result<Bytes, CodecError> {
        let mut scratch = self.lock_scratch();
        scratch.clear();
        scratch.push(COMPRESSION_MAGIC);

        let mut encoder = DeflateEncoder::new(&mut *scratch, Compression::fast());
        encoder.write_all(buffer).map_err(CodecError::Deflate)?;
        encoder.finish().map_err(CodecError::Deflate)?;

        Ok(Bytes::copy_from_slice(&scratch))
    }

    /// Expands `buffer` if it self-describes as compressed.
    ///
    /// Three outcomes: raw passthrough, expanded data, or an error for a
    /// buffer that carries the magic byte but fails structural inflation.
    /// The input is never modified and no partial data is returned.
    pub fn decompress(&self, buffer: &[u8]) -> Result<DecompressOutcome, CodecError> {
        if buffer.first() != Some(&COMPRESSION_MAGIC) {
            return Ok(DecompressOutcome::Raw);
        }

        let mut scratch = self.lock_scratch();
        scratch.clear();

        let mut decoder = DeflateDecoder::new(&buffer[1..]);
        decoder
            .read_to_end(&mut scratch)
            .map_err(CodecError::Corrupt)?;

        Ok(DecompressOutcome::Expanded(Bytes::copy_from_slice(&scratch)))
    }

    fn lock_scratch(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        // Scratch carries no state between calls; every path clears it first.
        self.scratch.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compressible_payload() -> Vec<u8> {
        // Repetitive enough to shrink under deflate.
        b"orbitlink orbitlink orbitlink orbitlink orbitlink orbitlink orbitlink"
            .repeat(8)
    }

    #[test]
    fn roundtrip_restores_input() {
        let codec = CompressionCodec::new();
        let payload = compressible_payload();
        let compressed = codec.compress(&payload).unwrap();
        assert_eq!(compressed.first(), Some(&COMPRESSION_MAGIC));
        assert!(compressed.len() < payload.len());

        match codec.decompress(&compressed).unwrap() {
            DecompressOutcome::Expanded(expanded) => assert_eq!(expanded.as_ref(), &payload[..]),
            other => panic!("expected expansion, got {other:?}"),
        }
    }

    #[test]
    fn compress_is_idempotent() {
        let codec = CompressionCodec::new();
        let payload = compressible_payload();
        let once = codec.compress(&payload).unwrap();
        let twice = codec.compress(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn small_payload_stays_raw_and_passes_through() {
        let codec = CompressionCodec::new();
        let payload = b"tiny";
        let out = codec.compress(payload).unwrap();
        assert_eq!(out.as_ref(), payload);
        assert_eq!(codec.decompress(&out).unwrap(), DecompressOutcome::Raw);
    }

    #[test]
    fn forced_compression_roundtrips_a_magic_prefixed_payload() {
        let codec = CompressionCodec::new();
        // First byte collides with the magic value ('N' is 0x4E).
        let payload = b"Never trust a raw byte that looks compressed";
        assert_eq!(payload[0], COMPRESSION_MAGIC);

        // The idempotence short-circuit would pass this through unchanged
        // and the receive side would reject it as corrupt.
        let passthrough = codec.compress(payload).unwrap();
        assert_eq!(passthrough.as_ref(), payload);
        assert!(codec.decompress(&passthrough).is_err());

        let forced = codec.compress_force(payload).unwrap();
        match codec.decompress(&forced).unwrap() {
            DecompressOutcome::Expanded(expanded) => assert_eq!(expanded.as_ref(), payload),
            other => panic!("expected expansion, got {other:?}"),
        }
    }

    #[test]
    fn truncated_compressed_buffer_reports_corruption() {
        let codec = CompressionCodec::new();
        let payload = compressible_payload();
        let compressed = codec.compress(&payload).unwrap();

        let truncated = &compressed[..compressed.len() / 2];
        let original_copy = truncated.to_vec();
        assert!(matches!(
            codec.decompress(truncated),
            Err(CodecError::Corrupt(_))
        ));
        // Input untouched after a failed attempt.
        assert_eq!(truncated, &original_copy[..]);
    }

    #[test]
    fn magic_byte_garbage_reports_corruption() {
        let codec = CompressionCodec::new();
        let bogus = [COMPRESSION_MAGIC, 0x00, 0x01, 0x02];
        assert!(matches!(
            codec.decompress(&bogus),
            Err(CodecError::Corrupt(_))
        ));
    }
}
