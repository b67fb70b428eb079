//! L2 entry encoding
//!
//! Entries are bincode-serialized. Payloads larger than the compression
//! threshold are zlib-compressed. The first byte says which form follows.

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use std::io::{Read, Write};

use super::CacheEntry;
use crate::store::StoreError;

const RAW: u8 = 0;
const ZLIB: u8 = 1;

/// Encode an entry for the distributed store
pub fn encode(entry: &CacheEntry, compression_threshold: usize) -> Result<Vec<u8>, StoreError> {
    let data = bincode::serialize(entry)
        .map_err(|e| StoreError::Codec(format!("Failed to serialize cache entry: {}", e)))?;

    if data.len() <= compression_threshold {
        let mut out = Vec::with_capacity(data.len() + 1);
        out.push(RAW);
        out.extend_from_slice(&data);
        return Ok(out);
    }

    let mut encoder = ZlibEncoder::new(vec![ZLIB], Compression::fast());
    encoder
        .write_all(&data)
        .and_then(|_| encoder.finish())
        .map_err(|e| StoreError::Codec(format!("Failed to compress cache entry: {}", e)))
}

/// Decode an entry read from the distributed store
pub fn decode(bytes: &[u8]) -> Result<CacheEntry, StoreError> {
    let (header, body) = bytes
        .split_first()
        .ok_or_else(|| StoreError::Codec("empty cache entry".to_string()))?;

    let entry = match *header {
        RAW => bincode::deserialize(body),
        ZLIB => {
            let mut data = Vec::new();
            ZlibDecoder::new(body)
                .read_to_end(&mut data)
                .map_err(|e| StoreError::Codec(format!("Failed to decompress cache entry: {}", e)))?;
            bincode::deserialize(&data)
        }
        other => {
            return Err(StoreError::Codec(format!(
                "unknown cache entry header {:#04x}",
                other
            )));
        }
    };

    entry.map_err(|e| StoreError::Codec(format!("Failed to deserialize cache entry: {}", e)))
}

/// Whether an encoded entry was compressed
pub fn is_compressed(bytes: &[u8]) -> bool {
    bytes.first() == Some(&ZLIB)
}
