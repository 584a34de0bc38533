use crate::error::{Result, SnapshotError};
use crate::format::Compression;

fn max_lz4_compressed_len(uncompressed_len: usize) -> usize {
    // LZ4 worst-case size: uncompressed + (uncompressed / 255) + 16
    uncompressed_len
        .saturating_add(uncompressed_len / 255)
        .saturating_add(16)
}

pub(crate) fn compress(kind: Compression, input: &[u8]) -> Vec<u8> {
    match kind {
        Compression::None => input.to_vec(),
        Compression::Lz4 => lz4_flex::block::compress(input),
    }
}

pub(crate) fn decompress(kind: Compression, compressed: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    match kind {
        Compression::None => {
            if compressed.len() != expected_len {
                return Err(SnapshotError::Corrupt("uncompressed blob length mismatch"));
            }
            Ok(compressed.to_vec())
        }
        Compression::Lz4 => {
            if compressed.len() > max_lz4_compressed_len(expected_len) {
                return Err(SnapshotError::Corrupt("lz4 blob too large"));
            }
            Ok(lz4_flex::block::decompress(compressed, expected_len)?)
        }
    }
}
