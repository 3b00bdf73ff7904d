// File: shelf-sync/src/compression.rs
// Purpose: Gzip handling for binary push frames

use anyhow::Context;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Compress data using gzip
pub fn compress(data: &[u8], level: u32) -> anyhow::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level.min(9)));
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Decompress gzip data
pub fn decompress(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    Ok(decompressed)
}

/// Text carried by a binary frame: gzip-compressed UTF-8 JSON
pub fn binary_frame_text(data: &[u8]) -> anyhow::Result<String> {
    let bytes = decompress(data).context("Failed to decompress push frame")?;
    String::from_utf8(bytes).context("Decompressed push frame is not UTF-8")
}
