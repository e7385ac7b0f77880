//! Stable hashing and ordered key encoding.
//!
//! Both functions here feed storage-layer keys and consumer-group
//! partitioning, so their output must never change between releases: the
//! hash is persisted implicitly through partition assignments, and the
//! position encoding is persisted literally in every KV index key.

use xxhash_rust::xxh64::xxh64;

/// Digits in an encoded position key.
pub const POSITION_DIGITS: usize = 20;

/// Deterministic 64-bit hash of a UTF-8 string.
///
/// Stable across processes and platforms; consumer-group membership is
/// derived from it, so all members of a group must agree on it regardless of
/// where they run.
pub fn hash64(s: &str) -> u64 {
    xxh64(s.as_bytes(), 0)
}

/// Encodes an unsigned position as a fixed-width zero-padded decimal string.
///
/// Lexicographic order of encoded keys equals numeric order, which is what
/// lets the KV backend answer ordered range scans with a plain prefix scan.
/// 20 digits covers the full `u64` range.
pub fn encode_position(position: u64) -> String {
    format!("{position:0width$}", width = POSITION_DIGITS)
}

/// Inverse of [`encode_position`]. Returns `None` for anything that is not a
/// 20-digit decimal string.
pub fn decode_position(s: &str) -> Option<u64> {
    if s.len() != POSITION_DIGITS || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}
