//! Helpers for widening the engine's configurable 1-8 byte keys into a
//! uniform `u64` representation, and the default numeric comparators.
//!
//! All numeric decoding of keys funnels through [`widen_key`] so that the
//! rest of the engine can reason about keys as plain `u64`s regardless of
//! the configured `key_size`.

/// Reads `key_size` (1-8) little-endian bytes from the front of `bytes` and
/// widens them into a `u64`.
#[inline]
pub fn widen_key(bytes: &[u8], key_size: usize) -> u64 {
    debug_assert!((1..=8).contains(&key_size));
    let mut buf = [0u8; 8];
    buf[..key_size].copy_from_slice(&bytes[..key_size]);
    u64::from_le_bytes(buf)
}

/// Writes the low `key_size` little-endian bytes of `key` into `bytes`.
#[inline]
pub fn narrow_key(key: u64, key_size: usize, bytes: &mut [u8]) {
    debug_assert!((1..=8).contains(&key_size));
    let buf = key.to_le_bytes();
    bytes[..key_size].copy_from_slice(&buf[..key_size]);
}

/// Default byte-wise comparator for opaque `data` payloads: compares the
/// common numeric interpretation (widened little-endian) of the first
/// `size` bytes. Suitable when `data` stores a plain integer, which is the
/// common case for this crate's own tests and for simple embedders.
#[inline]
pub fn compare_numeric(a: &[u8], b: &[u8], size: usize) -> std::cmp::Ordering {
    widen_key(a, size.min(8)).cmp(&widen_key(b, size.min(8)))
}
