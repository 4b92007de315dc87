//! Adaptive compression of stored values.
//!
//! Values below a size threshold are never compressed. Larger values are
//! compressed and kept only when the result shrinks enough; otherwise the
//! caller stores the raw bytes. The framed format is a 4-byte big-endian
//! original length followed by the codec stream.
//!
//! The configured codec only picks how new values are written. Reads detect
//! the codec from the stream's magic bytes, so items written under a
//! different `compression.codec` stay readable.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use thiserror::Error;
use tracing::debug;

use crate::config::{CompressionCodec, CompressionConfig};

/// Length of the original-size prefix.
const LENGTH_PREFIX_LEN: usize = 4;

/// Cap on the buffer reserved from an untrusted length prefix.
const MAX_PREALLOCATION: usize = 16 * 1024 * 1024;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("Compressed value of {0} bytes has no length prefix")]
    TruncatedPrefix(usize),

    #[error("Decompressed length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Compressed stream is neither gzip nor zstd")]
    UnknownFormat,

    #[error("Codec error: {0}")]
    Codec(#[from] std::io::Error),
}

/// Compression capability used by the value writer and reader.
///
/// Implementations must be stateless: they are shared by every concurrent
/// cache operation.
pub trait Compress: Send + Sync {
    /// Framed compressed form of `value`, or `None` to store it raw.
    fn compress(&self, value: &[u8]) -> Option<Vec<u8>>;

    /// Reverse [`Compress::compress`]. Never returns bytes of the wrong length.
    fn decompress(&self, framed: &[u8]) -> Result<Vec<u8>, CompressionError>;
}

/// gzip/zstd compressor with size and ratio gating.
#[derive(Debug, Clone)]
pub struct Compressor {
    codec: CompressionCodec,
    min_size: usize,
    rate: usize,
    zstd_level: i32,
}

impl Compressor {
    pub fn new(config: &CompressionConfig) -> Self {
        Self {
            codec: config.codec,
            min_size: config.min_size,
            rate: config.rate.max(1) as usize,
            zstd_level: config.zstd_level,
        }
    }

    pub fn codec(&self) -> CompressionCodec {
        self.codec
    }

    fn encode(&self, value: &[u8]) -> std::io::Result<Vec<u8>> {
        let length = u32::try_from(value.len())
            .map_err(|_| std::io::Error::other("value too large for length prefix"))?;
        let mut out = Vec::with_capacity(value.len() / 2 + LENGTH_PREFIX_LEN);
        out.extend_from_slice(&length.to_be_bytes());

        match self.codec {
            CompressionCodec::Gzip => {
                let mut encoder = GzEncoder::new(out, flate2::Compression::fast());
                encoder.write_all(value)?;
                encoder.finish()
            }
            CompressionCodec::Zstd => {
                let mut encoder = zstd::Encoder::new(out, self.zstd_level)?;
                encoder.write_all(value)?;
                encoder.finish()
            }
        }
    }
}

/// Codec that produced `stream`, judged by its leading magic bytes.
fn detect_codec(stream: &[u8]) -> Option<CompressionCodec> {
    if stream.starts_with(&GZIP_MAGIC) {
        Some(CompressionCodec::Gzip)
    } else if stream.starts_with(&ZSTD_MAGIC) {
        Some(CompressionCodec::Zstd)
    } else {
        None
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new(&CompressionConfig::default())
    }
}

impl Compress for Compressor {
    fn compress(&self, value: &[u8]) -> Option<Vec<u8>> {
        if value.len() < self.min_size {
            return None;
        }

        let framed = match self.encode(value) {
            Ok(framed) => framed,
            Err(e) => {
                debug!(error = %e, size = value.len(), "Compression failed, storing raw");
                return None;
            }
        };

        if framed.len() * 100 / self.rate > value.len() {
            debug!(
                original = value.len(),
                compressed = framed.len(),
                "Compression ratio too low, storing raw"
            );
            return None;
        }
        Some(framed)
    }

    fn decompress(&self, framed: &[u8]) -> Result<Vec<u8>, CompressionError> {
        if framed.len() < LENGTH_PREFIX_LEN {
            return Err(CompressionError::TruncatedPrefix(framed.len()));
        }
        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        prefix.copy_from_slice(&framed[..LENGTH_PREFIX_LEN]);
        let expected = u32::from_be_bytes(prefix) as usize;
        let body = &framed[LENGTH_PREFIX_LEN..];
        let codec = detect_codec(body).ok_or(CompressionError::UnknownFormat)?;

        // One byte past the expected length is enough to detect an overrun.
        let limit = expected as u64 + 1;
        let mut out = Vec::with_capacity(expected.min(MAX_PREALLOCATION));
        match codec {
            CompressionCodec::Gzip => {
                GzDecoder::new(body).take(limit).read_to_end(&mut out)?;
            }
            CompressionCodec::Zstd => {
                zstd::Decoder::new(body)?.take(limit).read_to_end(&mut out)?;
            }
        }

        if out.len() != expected {
            return Err(CompressionError::LengthMismatch {
                expected,
                actual: out.len(),
            });
        }
        Ok(out)
    }
}
