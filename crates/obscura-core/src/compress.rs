//! The compression capability used for SYNC_BLOB state transfer.

use std::io::{Read as _, Write as _};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::CoreError;

pub trait Compress: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CoreError>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CoreError>;
}

/// Gzip, the wire format peers expect inside SYNC_BLOB.
#[derive(Default)]
pub struct GzipCompress;

impl GzipCompress {
    pub fn new() -> Self {
        Self
    }
}

impl Compress for GzipCompress {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CoreError> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(data)
            .map_err(|e| CoreError::StorageIO(format!("gzip compress: {e}")))?;
        encoder
            .finish()
            .map_err(|e| CoreError::StorageIO(format!("gzip compress: {e}")))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CoreError> {
        let mut decoder = GzDecoder::new(data);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| CoreError::StorageIO(format!("gzip decompress: {e}")))?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let gz = GzipCompress::new();
        let data = b"the same bytes, many times over, the same bytes".repeat(64);
        let packed = gz.compress(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(gz.decompress(&packed).unwrap(), data);
    }

    #[test]
    fn garbage_fails() {
        let gz = GzipCompress::new();
        assert!(gz.decompress(b"definitely not gzip").is_err());
    }
}
