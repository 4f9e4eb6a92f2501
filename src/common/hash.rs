//! Shard resolution for meshsearch
//!
//! A document key maps to a shard through the 32-bit polynomial string hash
//! (`h = 31 * h + unit` over UTF-16 code units, wrapping). Every node and
//! every client port must agree on it, so it is fixed forever.

/// 32-bit polynomial hash over the UTF-16 code units of `key`.
pub fn string_hash(key: &str) -> i32 {
    key.encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(unit as i32))
}

/// Compute the shard a key belongs to, in `[0, number_of_shards)`.
///
/// # Panics
///
/// Panics when `number_of_shards` is zero.
pub fn shard_for_key(key: &str, number_of_shards: u32) -> u32 {
    assert!(number_of_shards > 0, "number of shards must be positive");
    string_hash(key).unsigned_abs() % number_of_shards
}
