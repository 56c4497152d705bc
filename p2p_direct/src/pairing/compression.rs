use std::io;
use std::sync::Arc;

/// Byte-level compressor used for large pairing payloads.
pub trait CompressionPrimitive: Send + Sync {
    /// Tag written in front of compressed tokens
    fn tag(&self) -> &'static [u8];

    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>>;

    /// Fails once the output would exceed `limit` bytes.
    fn decompress(&self, data: &[u8], limit: usize) -> io::Result<Vec<u8>>;
}

pub const GZIP_TAG: &[u8] = b"GZIP";

#[cfg(feature = "gzip")]
pub use gzip::GzipCompression;

#[cfg(feature = "gzip")]
mod gzip {
    use super::{CompressionPrimitive, GZIP_TAG};
    use flate2::Compression;
    use flate2::read::GzDecoder;
    use flate2::write::GzEncoder;
    use std::io::{self, Read, Write};

    #[derive(Debug, Clone, Copy, Default)]
    pub struct GzipCompression;

    impl CompressionPrimitive for GzipCompression {
        fn tag(&self) -> &'static [u8] {
            GZIP_TAG
        }

        fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
            encoder.write_all(data)?;
            encoder.finish()
        }

        fn decompress(&self, data: &[u8], limit: usize) -> io::Result<Vec<u8>> {
            let mut out = Vec::new();
            GzDecoder::new(data)
                .take(limit as u64 + 1)
                .read_to_end(&mut out)?;
            if out.len() > limit {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("decompressed payload exceeds {} bytes", limit),
                ));
            }
            Ok(out)
        }
    }
}

/// Compressor available in this build, if any
pub fn default_compression() -> Option<Arc<dyn CompressionPrimitive>> {
    #[cfg(feature = "gzip")]
    {
        Some(Arc::new(GzipCompression))
    }
    #[cfg(not(feature = "gzip"))]
    {
        None
    }
}
