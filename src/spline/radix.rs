//! Fixed-bit prefix → spline-segment lookup accelerator.
//!
//! The radix table references the spline only by knot index, never by
//! pointer, so both structures stay freely movable. With `radix_bits == 0`
//! the table is a no-op and every lookup falls back to an unconstrained
//! spline search (the "radix bits = 0, spline-only path" boundary case).

pub struct RadixTable {
    radix_bits: u32,
    min_key: u64,
    table: Vec<u32>,
    last_prefix_filled: i64,
}

impl RadixTable {
    pub fn new(radix_bits: u32, min_key: u64) -> RadixTable {
        let size = if radix_bits == 0 { 0 } else { 1usize << radix_bits };
        RadixTable {
            radix_bits,
            min_key,
            table: vec![0u32; size],
            last_prefix_filled: -1,
        }
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.radix_bits > 0
    }

    fn prefix_of(&self, key: u64) -> usize {
        let shifted = key.wrapping_sub(self.min_key);
        let shift = 64 - self.radix_bits;
        let prefix = if shift >= 64 { 0 } else { shifted >> shift };
        (prefix as usize).min(self.table.len().saturating_sub(1))
    }

    /// Records that `knot_index` is the first spline knot with a key at or
    /// above the knot just added, filling every radix bucket between the
    /// previously filled prefix and this key's prefix.
    pub fn add_point(&mut self, key: u64, knot_index: u32) {
        if !self.is_enabled() {
            return;
        }
        let prefix = self.prefix_of(key) as i64;
        let start = (self.last_prefix_filled + 1).max(0);
        for p in start..=prefix {
            self.table[p as usize] = knot_index;
        }
        self.last_prefix_filled = self.last_prefix_filled.max(prefix);
    }

    /// Returns the `[low, high]` knot-index range the spline search should
    /// be restricted to for `key`. When disabled, returns `None` and the
    /// caller should search the whole spline.
    pub fn find(&self, key: u64, spline_len: usize) -> Option<(usize, usize)> {
        if !self.is_enabled() || spline_len == 0 {
            return None;
        }
        let prefix = self.prefix_of(key);
        let low = if prefix == 0 {
            0
        } else {
            self.table[prefix - 1] as usize
        };
        let high = (self.table[prefix] as usize).min(spline_len - 1);
        Some((low.min(high), high))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spline::Spline;

    #[test]
    fn disabled_table_never_narrows() {
        let table = RadixTable::new(0, 0);
        assert!(!table.is_enabled());
        assert!(table.find(12345, 10).is_none());
    }

    #[test]
    fn narrows_search_range_for_monotone_keys() {
        let mut spline = Spline::new(1, 1024);
        let mut radix = RadixTable::new(4, 0);

        for page_id in 0..200u32 {
            let key = page_id as u64 * 1000;
            spline.add(key, page_id).unwrap();
            radix.add_point(key, (spline.knot_count().saturating_sub(1)) as u32);
        }

        let (low, high) = radix.find(150_000, spline.knot_count()).unwrap();
        assert!(low <= high);
        assert!(high < spline.knot_count());

        let pred = spline.find_in_range(150_000, low, high).unwrap();
        assert!((pred.predicted - 150).unsigned_abs() <= 1);
    }
}
