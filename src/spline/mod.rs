//! Piecewise-linear monotone spline index: maps a key to an approximate
//! logical page id, with a bounded absolute error in the y-dimension.
//!
//! Construction uses the standard greedy corridor-narrowing algorithm: a
//! knot is only committed once an incoming point can no longer be covered,
//! within `±max_error`, by a single line through the last knot. Between two
//! committed knots, `find` interpolates linearly.

pub mod radix;

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Knot {
    key: u64,
    page_id: u32,
}

/// Result of a spline lookup: a predicted page id and the `[low, high]`
/// window (inclusive) within which the true page id is guaranteed to fall,
/// unless the spline has overflowed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Prediction {
    pub predicted: i64,
    pub low: i64,
    pub high: i64,
}

pub struct Spline {
    max_error: u32,
    capacity: usize,
    knots: Vec<Knot>,

    has_corridor: bool,
    upper_slope: f64,
    lower_slope: f64,
    last_point: Option<Knot>,

    last_find_index: usize,
}

impl Spline {
    pub fn new(max_error: u32, capacity: usize) -> Spline {
        Spline {
            max_error,
            capacity,
            knots: Vec::with_capacity(capacity.min(1024)),
            has_corridor: false,
            upper_slope: 0.0,
            lower_slope: 0.0,
            last_point: None,
            last_find_index: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.knots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.knots.is_empty()
    }

    fn push_knot(&mut self, key: u64, page_id: u32) -> Result<()> {
        if self.knots.len() >= self.capacity {
            return Err(Error::SplineOverflow);
        }
        self.knots.push(Knot { key, page_id });
        Ok(())
    }

    /// Adds a `(key, page_id)` knot candidate. `key` must be non-decreasing
    /// across calls; the engine enforces this before any spline mutation
    /// happens, so this is a debug assertion here rather than an `Error`.
    pub fn add(&mut self, key: u64, page_id: u32) -> Result<()> {
        if let Some(last) = self.last_point {
            debug_assert!(key >= last.key, "spline keys must be non-decreasing");
        }

        if self.knots.is_empty() {
            self.push_knot(key, page_id)?;
            self.last_point = Some(Knot { key, page_id });
            return Ok(());
        }

        if !self.has_corridor {
            let head = *self.knots.last().unwrap();
            if key != head.key {
                let dx = (key - head.key) as f64;
                let dy = page_id as f64 - head.page_id as f64;
                self.upper_slope = (dy + self.max_error as f64) / dx;
                self.lower_slope = (dy - self.max_error as f64) / dx;
                self.has_corridor = true;
            }
            self.last_point = Some(Knot { key, page_id });
            return Ok(());
        }

        let head = *self.knots.last().unwrap();
        let dx = (key - head.key) as f64;
        if dx > 0.0 {
            let dy = page_id as f64 - head.page_id as f64;
            let point_upper = (dy + self.max_error as f64) / dx;
            let point_lower = (dy - self.max_error as f64) / dx;

            if point_lower > self.upper_slope || point_upper < self.lower_slope {
                let pending = self.last_point.expect("corridor implies a pending point");
                self.push_knot(pending.key, pending.page_id)?;
                self.has_corridor = false;
                self.last_point = None;
                return self.add(key, page_id);
            }

            self.upper_slope = self.upper_slope.min(point_upper);
            self.lower_slope = self.lower_slope.max(point_lower);
        }

        self.last_point = Some(Knot { key, page_id });
        Ok(())
    }

    fn interpolate_between(a: Knot, b: Knot, key: u64) -> i64 {
        if b.key == a.key {
            return a.page_id as i64;
        }
        let frac = (key - a.key) as f64 / (b.key - a.key) as f64;
        (a.page_id as f64 + frac * (b.page_id as f64 - a.page_id as f64)).round() as i64
    }

    fn interpolate(&self, key: u64, segment: usize) -> i64 {
        let a = self.knots[segment];
        if segment + 1 >= self.knots.len() {
            return a.page_id as i64;
        }
        Self::interpolate_between(a, self.knots[segment + 1], key)
    }

    /// Locates the knot segment containing `key` via a bounded linear
    /// search starting from the last hit, narrowed to `[range_lo,
    /// range_hi]` when a radix table is in play (pass `0..=len-1` to search
    /// unconstrained).
    fn find_segment(&mut self, key: u64, range_lo: usize, range_hi: usize) -> usize {
        let range_hi = range_hi.min(self.knots.len().saturating_sub(1));
        let range_lo = range_lo.min(range_hi);

        if key <= self.knots[range_lo].key {
            return range_lo;
        }
        if key >= self.knots[range_hi].key {
            return range_hi;
        }

        let mut i = self.last_find_index.clamp(range_lo, range_hi);

        if self.knots[i].key <= key {
            while i + 1 <= range_hi && self.knots[i + 1].key <= key {
                i += 1;
            }
        } else {
            while i > range_lo && self.knots[i].key > key {
                i -= 1;
            }
        }

        i
    }

    /// Predicts the page id for `key`, searching the full knot range.
    pub fn find(&mut self, key: u64) -> Option<Prediction> {
        self.find_in_range(key, 0, self.knots.len().saturating_sub(1))
    }

    /// Predicts the page id for `key`, restricting the spline search to
    /// knot indices `[range_lo, range_hi]` (used by the radix accelerator).
    pub fn find_in_range(&mut self, key: u64, range_lo: usize, range_hi: usize) -> Option<Prediction> {
        if self.knots.is_empty() {
            return None;
        }

        // Keys at or beyond the last committed knot but still inside the
        // open corridor have no second committed knot to interpolate
        // against. The corridor invariant guarantees the exact secant from
        // the last committed knot to the still-pending point lies within
        // the maintained slope bounds, so it predicts every point in that
        // open span (including the pending point itself) within
        // `max_error`, the same guarantee a second committed knot would
        // give.
        let last_knot = *self.knots.last().unwrap();
        if key > last_knot.key {
            if let Some(pending) = self.last_point {
                if pending.key > last_knot.key {
                    let predicted = Self::interpolate_between(last_knot, pending, key);
                    return Some(Prediction {
                        predicted,
                        low: predicted - self.max_error as i64,
                        high: predicted + self.max_error as i64,
                    });
                }
            }
            let predicted = last_knot.page_id as i64;
            return Some(Prediction {
                predicted,
                low: predicted - self.max_error as i64,
                high: predicted + self.max_error as i64,
            });
        }

        let segment = self.find_segment(key, range_lo, range_hi);
        self.last_find_index = segment;
        let predicted = self.interpolate(key, segment);
        Some(Prediction {
            predicted,
            low: predicted - self.max_error as i64,
            high: predicted + self.max_error as i64,
        })
    }

    #[cfg(test)]
    fn knot_count(&self) -> usize {
        self.knots.len()
    }
}
