//! Content hashing for items and destination files.
//!
//! The pipeline identifies file contents by an xxh3 hex digest. The
//! `--date-modified-hash` mode substitutes the mtime as a surrogate, which
//! is faster but misses same-second edits and checkout-time churn.

use std::path::Path;
use std::time::UNIX_EPOCH;

use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashMode {
    #[default]
    Content,
    DateModified,
}

#[inline]
pub fn xxh3_hex(bytes: &[u8]) -> String {
    format!("{:016x}", xxhash_rust::xxh3::xxh3_64(bytes))
}

/// Hash the file at `path`, or return the empty string when it cannot be
/// read. An empty hash is how the pipeline marks a missing item.
pub fn hash_file(path: &Path, mode: HashMode) -> String {
    match mode {
        HashMode::Content => match std::fs::read(path) {
            Ok(bytes) => xxh3_hex(&bytes),
            Err(_) => String::new(),
        },
        HashMode::DateModified => match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(mtime) => {
                let secs = mtime
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                format!("{secs}")
            }
            Err(_) => String::new(),
        },
    }
}

/// Short-prefix key for the manifest lookup index: the first 16 hex
/// characters of a hex digest, parsed as a u64. Hashes too short to supply
/// a full prefix key to 0 and are reported, since they defeat the negative
/// lookup.
pub fn sub_hash(hex: &str) -> u64 {
    if hex.len() >= 16 {
        if let Ok(v) = u64::from_str_radix(&hex[..16], 16) {
            return v;
        }
    }
    warn!("hash \"{hex}\" is too short or not hex, prefix index entry degraded to 0");
    0
}

/// 16-bit additive checksum over raw bytes, used to pair a mesh source file
/// with its binary cache.
pub fn checksum16(bytes: &[u8]) -> u16 {
    let mut sum: u16 = 0;
    for &b in bytes {
        sum = sum.wrapping_add(b as u16);
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_hash_parses_first_sixteen_hex_chars() {
        assert_eq!(sub_hash("00000000000000ff"), 0xff);
        assert_eq!(sub_hash("00000000000000ffdeadbeef"), 0xff);
        assert_eq!(sub_hash(""), 0);
        assert_eq!(sub_hash("zzzzzzzzzzzzzzzz"), 0);
    }

    #[test]
    fn missing_file_hashes_to_empty() {
        let p = Path::new("/nonexistent/definitely/missing.bin");
        assert_eq!(hash_file(p, HashMode::Content), "");
        assert_eq!(hash_file(p, HashMode::DateModified), "");
    }

    #[test]
    fn checksum16_wraps() {
        assert_eq!(checksum16(&[]), 0);
        assert_eq!(checksum16(&[1, 2, 3]), 6);
        let big = vec![0xffu8; 1000];
        // 1000 * 255 mod 65536
        assert_eq!(checksum16(&big), ((1000u32 * 255) % 65536) as u16);
    }
}
