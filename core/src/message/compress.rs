// zlib compression of message bodies

use super::PipelineError;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Upper bound on an inflated body. Fragment count is capped by the 16-bit
/// sequence number, so anything beyond this is a decompression bomb.
pub const MAX_INFLATED_SIZE: usize = 16 * 1024 * 1024;

/// Compress `data` at `level` (0-9).
pub fn compress(data: &[u8], level: u32) -> Result<Vec<u8>, PipelineError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level.min(9)));
    encoder
        .write_all(data)
        .map_err(|e| PipelineError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| PipelineError::Compression(e.to_string()))
}

/// Decompress data produced by [`compress`].
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, PipelineError> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .take(MAX_INFLATED_SIZE as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| PipelineError::Decompression(e.to_string()))?;
    if out.len() > MAX_INFLATED_SIZE {
        return Err(PipelineError::Decompression(format!(
            "inflated body exceeds {} bytes",
            MAX_INFLATED_SIZE
        )));
    }
    Ok(out)
}
