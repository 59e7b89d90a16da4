//! The storage engine itself: ties region management, the page codec, the
//! spline/radix lookup path, the buffer pool, and the variable-data log
//! together behind `put`/`get`/`put_var`/`get_var`/`range_next`/`flush`.
//!
//! `Engine<S>` holds everything by value and is deliberately not `Sync` -
//! unlike `measureme::Profiler`, which is built for concurrent event
//! recording, this engine assumes a single owner driving it to completion,
//! matching the single-writer contract of the storage it wraps.

use crate::buffer_pool::{BufferPool, BufferRole};
use crate::codec::widen_key;
use crate::config::{Callbacks, EngineConfig, Parameters};
use crate::error::{Error, Result};
use crate::iterator::{IterState, RangeCursor};
use crate::page::{DataPage, IndexPage};
use crate::recovery;
use crate::region::Region;
use crate::spline::radix::RadixTable;
use crate::spline::Spline;
use crate::storage::Storage;
use crate::vardata::{VarLog, NO_VAR_DATA};
use log::{debug, info};
use std::cmp::Ordering;

/// Outcome of a variable-data lookup: present with its bytes, structurally
/// absent (the record never had a blob), or evicted by region wrap.
pub enum VarData {
    Present(Vec<u8>),
    Absent,
    Evicted,
}

pub struct Engine<S: Storage> {
    cfg: EngineConfig,
    callbacks: Callbacks,

    data: Region<S>,
    index: Option<Region<S>>,
    var: Option<VarLog<S>>,

    pool: BufferPool,
    spline: Spline,
    radix: RadixTable,

    current_data_count: u16,
    current_index_count: u16,
    index_page_first_data_id: u32,

    max_key: Option<u64>,
}

impl<S: Storage> Engine<S> {
    /// Creates a brand-new engine over freshly zeroed storage backends.
    pub fn create(
        data_storage: S,
        index_storage: Option<S>,
        var_storage: Option<S>,
        cfg: EngineConfig,
        callbacks: Callbacks,
    ) -> Result<Engine<S>> {
        cfg.validate()?;
        let pool = BufferPool::new(&cfg);
        let data = Region::new(data_storage, cfg.page_size, cfg.num_data_pages, cfg.erase_size_in_pages);

        let index = if cfg.parameters.contains(Parameters::USE_INDEX) {
            let storage = index_storage
                .ok_or_else(|| Error::InvalidConfig("USE_INDEX set but no index storage supplied".into()))?;
            Some(Region::new(storage, cfg.page_size, cfg.num_index_pages, cfg.erase_size_in_pages))
        } else {
            None
        };

        let var = if cfg.parameters.contains(Parameters::USE_VDATA) {
            let storage = var_storage
                .ok_or_else(|| Error::InvalidConfig("USE_VDATA set but no var storage supplied".into()))?;
            let region = Region::new(storage, cfg.page_size, cfg.num_var_pages, cfg.erase_size_in_pages);
            Some(VarLog::new(region, cfg.page_size, cfg.key_size))
        } else {
            None
        };

        let spline_capacity = cfg.num_data_pages as usize + 1;
        info!("spline_store: creating engine, {} data pages, max_error {}", cfg.num_data_pages, cfg.index_max_error);

        Ok(Engine {
            cfg,
            callbacks,
            data,
            index,
            var,
            pool,
            spline: Spline::new(cfg.index_max_error, spline_capacity),
            radix: RadixTable::new(cfg.radix_bits, 0),
            current_data_count: 0,
            current_index_count: 0,
            index_page_first_data_id: 0,
            max_key: None,
        })
    }

    /// Reopens an existing storage backend, reconstructing the region
    /// frontiers and replaying the spline from each live data page's min
    /// key. Only fully-flushed pages survive a reopen: there is no
    /// write-ahead log backing the in-progress write buffer, matching the
    /// durability guarantee of an append-only flash log with no separate
    /// journal.
    pub fn open(
        mut data_storage: S,
        mut index_storage: Option<S>,
        var_storage: Option<S>,
        cfg: EngineConfig,
        callbacks: Callbacks,
    ) -> Result<Engine<S>> {
        cfg.validate()?;
        let pool = BufferPool::new(&cfg);

        let data_frontier = recovery::scan_region(
            &mut data_storage,
            cfg.page_size,
            cfg.num_data_pages,
            cfg.erase_size_in_pages,
            DataPage::get_logical_id,
            |buf| DataPage::get_count(buf) > 0,
        )?;
        let mut data = Region::from_recovered_state(
            data_storage,
            cfg.page_size,
            cfg.num_data_pages,
            cfg.erase_size_in_pages,
            data_frontier.next_write_id,
            data_frontier.next_write_phys,
            data_frontier.first_live_phys,
            data_frontier.first_live_logical,
            data_frontier.erased_end_page,
            data_frontier.wrapped,
        );

        let spline_capacity = cfg.num_data_pages as usize + 1;
        let mut spline = Spline::new(cfg.index_max_error, spline_capacity);
        let mut radix = RadixTable::new(cfg.radix_bits, 0);
        let mut max_key = None;
        for logical_id in data_frontier.first_live_logical..data_frontier.next_write_id {
            let mut buf = vec![0u8; cfg.page_size];
            data.read_logical(logical_id, &mut buf)?;
            let min_key = if cfg.parameters.contains(Parameters::USE_MAX_MIN) {
                widen_key(DataPage::get_min_key(&cfg, &buf), cfg.key_size)
            } else {
                widen_key(DataPage::record_key(&cfg, &buf, 0), cfg.key_size)
            };
            spline.add(min_key, logical_id)?;
            radix.add_point(min_key, (spline_knot_index(&spline)) as u32);
            let count = DataPage::get_count(&buf) as usize;
            let max_key_on_page = widen_key(DataPage::record_key(&cfg, &buf, count - 1), cfg.key_size);
            max_key = Some(max_key_on_page);
        }

        let index = if cfg.parameters.contains(Parameters::USE_INDEX) {
            let mut storage = index_storage
                .take()
                .ok_or_else(|| Error::InvalidConfig("USE_INDEX set but no index storage supplied".into()))?;
            let frontier = recovery::scan_region(
                &mut storage,
                cfg.page_size,
                cfg.num_index_pages,
                cfg.erase_size_in_pages,
                IndexPage::get_logical_id,
                |buf| IndexPage::get_count(buf) > 0,
            )?;
            Some(Region::from_recovered_state(
                storage,
                cfg.page_size,
                cfg.num_index_pages,
                cfg.erase_size_in_pages,
                frontier.next_write_id,
                frontier.next_write_phys,
                frontier.first_live_phys,
                frontier.first_live_logical,
                frontier.erased_end_page,
                frontier.wrapped,
            ))
        } else {
            None
        };

        let var = if cfg.parameters.contains(Parameters::USE_VDATA) {
            let mut storage = var_storage
                .ok_or_else(|| Error::InvalidConfig("USE_VDATA set but no var storage supplied".into()))?;
            // Each var page's header carries a genuine monotonic page id
            // (stamped at flush time right after the re-stamped max-key
            // field, see `VarLog::flush_current_page`), so the same
            // frontier-scan routine used for data/index pages applies here
            // unchanged - unlike payload bytes, this field always identifies
            // the page it lives on.
            let frontier = recovery::scan_region(
                &mut storage,
                cfg.page_size,
                cfg.num_var_pages,
                cfg.erase_size_in_pages,
                |buf| u32::from_le_bytes(buf[cfg.key_size..cfg.key_size + 4].try_into().unwrap()),
                |buf| buf.iter().any(|&b| b != 0),
            )?;
            let region = Region::from_recovered_state(
                storage,
                cfg.page_size,
                cfg.num_var_pages,
                cfg.erase_size_in_pages,
                frontier.next_write_id,
                frontier.next_write_phys,
                frontier.first_live_phys,
                frontier.first_live_logical,
                frontier.erased_end_page,
                frontier.wrapped,
            );
            Some(VarLog::new(region, cfg.page_size, cfg.key_size))
        } else {
            None
        };

        debug!(
            "spline_store: recovered engine, next_write_id={}, first_live={}, wrapped={}",
            data.next_write_id(),
            data.first_live_logical_id(),
            data.wrapped()
        );
        let index_page_first_data_id = data.next_write_id();

        Ok(Engine {
            cfg,
            callbacks,
            data,
            index,
            var,
            pool,
            spline,
            radix,
            current_data_count: 0,
            current_index_count: 0,
            index_page_first_data_id,
            max_key,
        })
    }

    fn widen(&self, key: &[u8]) -> u64 {
        widen_key(key, self.cfg.key_size)
    }

    /// Inserts a record. `key` must not be smaller than every previously
    /// inserted key. `var_blob`, if given, requires `Parameters::USE_VDATA`.
    pub fn put(&mut self, key: &[u8], data: &[u8], var_blob: Option<&[u8]>) -> Result<()> {
        let k = self.widen(key);
        if let Some(max) = self.max_key {
            if k < max {
                return Err(Error::OrderViolation {
                    previous_max: max,
                    attempted: k,
                });
            }
        }

        let var_offset = match (var_blob, &mut self.var) {
            (Some(blob), Some(var)) => var.append(k, blob)?,
            (Some(_), None) => {
                return Err(Error::InvalidConfig("put with var_blob requires USE_VDATA".into()))
            }
            (None, _) => NO_VAR_DATA,
        };

        if self.current_data_count == 0 {
            DataPage::init_page(&self.cfg, self.pool.get_mut(BufferRole::DataWrite));
        }

        let slot = self.current_data_count as usize;
        {
            let buf = self.pool.get_mut(BufferRole::DataWrite);
            DataPage::write_record(&self.cfg, buf, slot, key, data);
            if self.cfg.parameters.contains(Parameters::USE_VDATA) {
                DataPage::set_record_var_offset(&self.cfg, buf, slot, var_offset);
            }
        }
        self.update_page_summary(key, data, slot == 0);
        self.current_data_count = DataPage::inc_count(self.pool.get_mut(BufferRole::DataWrite));
        // The still-open write-buffer page just changed; any cached read
        // snapshot of it (logical id == data.next_write_id()) is now stale.
        self.pool.invalidate(BufferRole::DataRead);

        self.max_key = Some(k);

        if self.current_data_count as usize == self.cfg.max_records_per_page() {
            self.flush_data_page()?;
        }

        Ok(())
    }

    fn update_page_summary(&mut self, key: &[u8], data: &[u8], is_first: bool) {
        if !self.cfg.parameters.contains(Parameters::USE_MAX_MIN) {
            return;
        }
        let cfg = self.cfg;
        let buf = self.pool.get_mut(BufferRole::DataWrite);
        if is_first {
            DataPage::set_min_key(&cfg, buf, key);
            DataPage::set_min_data(&cfg, buf, data);
        }
        DataPage::set_max_key(&cfg, buf, key);
        if (self.callbacks.compare_data)(data, DataPage::get_max_data(&cfg, buf)) == Ordering::Greater {
            DataPage::set_max_data(&cfg, buf, data);
        }
        if !is_first && (self.callbacks.compare_data)(data, DataPage::get_min_data(&cfg, buf)) == Ordering::Less {
            DataPage::set_min_data(&cfg, buf, data);
        }
    }

    fn flush_data_page(&mut self) -> Result<()> {
        let cfg = self.cfg;
        let logical_id = self.data.next_write_id();
        let min_key = if cfg.parameters.contains(Parameters::USE_MAX_MIN) {
            self.widen(DataPage::get_min_key(&cfg, self.pool.get(BufferRole::DataWrite)))
        } else {
            self.widen(DataPage::record_key(&cfg, self.pool.get(BufferRole::DataWrite), 0))
        };

        DataPage::set_logical_id(self.pool.get_mut(BufferRole::DataWrite), logical_id);
        let buf = self.pool.get(BufferRole::DataWrite).to_vec();
        self.data.write(&buf)?;

        self.spline.add(min_key, logical_id)?;
        let knot_index = spline_knot_index(&self.spline) as u32;
        self.radix.add_point(min_key, knot_index);

        if cfg.parameters.contains(Parameters::USE_INDEX) {
            self.append_index_bitmap(&buf, logical_id)?;
        }

        self.current_data_count = 0;
        self.pool.invalidate(BufferRole::DataRead);
        Ok(())
    }

    fn append_index_bitmap(&mut self, data_page: &[u8], data_logical_id: u32) -> Result<()> {
        let cfg = self.cfg;
        let mut bitmap = vec![0u8; cfg.bitmap_size.max(1)];
        if let Some(build) = &self.callbacks.build_bitmap_from_range {
            let min_data = DataPage::get_min_data(&cfg, data_page);
            let max_data = DataPage::get_max_data(&cfg, data_page);
            build(min_data, max_data, &mut bitmap);
        }

        if self.current_index_count == 0 {
            self.index_page_first_data_id = data_logical_id;
            let min_id = self.index_page_first_data_id;
            IndexPage::init_page(self.pool.get_mut(BufferRole::IndexWrite), min_id);
        }

        let slot = self.current_index_count as usize;
        IndexPage::set_bitmap_slot(cfg.bitmap_size.max(1), self.pool.get_mut(BufferRole::IndexWrite), slot, &bitmap);
        self.current_index_count += 1;
        IndexPage::set_count(self.pool.get_mut(BufferRole::IndexWrite), self.current_index_count);
        // The still-open write-buffer page just gained a bitmap slot; any
        // cached read snapshot of it (logical id == index.next_write_id())
        // is now stale, same as the data-page case in `put()`.
        self.pool.invalidate(BufferRole::IndexRead);

        if self.current_index_count as usize == cfg.max_bitmaps_per_index_page() {
            let index = self.index.as_mut().expect("USE_INDEX implies an index region");
            let index_logical_id = index.next_write_id();
            IndexPage::set_logical_id(self.pool.get_mut(BufferRole::IndexWrite), index_logical_id);
            let buf = self.pool.get(BufferRole::IndexWrite).to_vec();
            index.write(&buf)?;
            self.current_index_count = 0;
            self.pool.invalidate(BufferRole::IndexRead);
        }
        Ok(())
    }

    fn read_data_page_cached(&mut self, logical_id: u32) -> Result<()> {
        if self.pool.is_cached(BufferRole::DataRead, logical_id) {
            return Ok(());
        }
        if logical_id == self.data.next_write_id() && self.current_data_count > 0 {
            let buf = self.pool.get(BufferRole::DataWrite).to_vec();
            self.pool.get_mut(BufferRole::DataRead).copy_from_slice(&buf);
        } else {
            self.data.read_logical(logical_id, self.pool.get_mut(BufferRole::DataRead))?;
        }
        self.pool.mark_resident(BufferRole::DataRead, logical_id);
        Ok(())
    }

    fn read_index_page_cached(&mut self, logical_id: u32) -> Result<()> {
        if self.pool.is_cached(BufferRole::IndexRead, logical_id) {
            return Ok(());
        }
        let index = self.index.as_mut().expect("index-driven read requires USE_INDEX");
        if logical_id == index.next_write_id() && self.current_index_count > 0 {
            let buf = self.pool.get(BufferRole::IndexWrite).to_vec();
            self.pool.get_mut(BufferRole::IndexRead).copy_from_slice(&buf);
        } else {
            index.read_logical(logical_id, self.pool.get_mut(BufferRole::IndexRead))?;
        }
        self.pool.mark_resident(BufferRole::IndexRead, logical_id);
        Ok(())
    }

    fn interpolate_guess(&self, buf: &[u8], count: u16, key: &[u8]) -> Option<usize> {
        if !self.cfg.parameters.contains(Parameters::USE_MAX_MIN) || count < 2 {
            return None;
        }
        let min_k = self.widen(DataPage::get_min_key(&self.cfg, buf));
        let max_k = self.widen(DataPage::get_max_key(&self.cfg, buf));
        if max_k <= min_k {
            return None;
        }
        let k = self.widen(key);
        if k < min_k || k > max_k {
            return None;
        }
        let frac = (k - min_k) as f64 / (max_k - min_k) as f64;
        Some(((frac * (count - 1) as f64).round() as usize).min(count as usize - 1))
    }

    fn bisect_page(&self, buf: &[u8], count: u16, key: &[u8]) -> Option<usize> {
        if count == 0 {
            return None;
        }
        let (mut lo, mut hi) = (0i64, count as i64 - 1);
        while lo <= hi {
            let mid = lo + (hi - lo) / 2;
            let rk = DataPage::record_key(&self.cfg, buf, mid as usize);
            match (self.callbacks.compare_key)(rk, key) {
                Ordering::Equal => return Some(mid as usize),
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid - 1,
            }
        }
        None
    }

    /// In-page search: a bounded linear probe around an interpolated guess,
    /// falling back to plain bisection when the guess misses (the `-1`
    /// sentinel case, here represented structurally rather than literally).
    fn search_page(&self, buf: &[u8], count: u16, key: &[u8]) -> Option<usize> {
        if let Some(guess) = self.interpolate_guess(buf, count, key) {
            const PROBE: usize = 4;
            let lo = guess.saturating_sub(PROBE);
            let hi = (guess + PROBE).min(count as usize - 1);
            for i in lo..=hi {
                if (self.callbacks.compare_key)(DataPage::record_key(&self.cfg, buf, i), key) == Ordering::Equal {
                    return Some(i);
                }
            }
        }
        self.bisect_page(buf, count, key)
    }

    fn locate(&mut self, key: &[u8]) -> Result<(u32, usize)> {
        if self.data.next_write_id() == 0 && self.current_data_count == 0 {
            return Err(Error::NotFound);
        }
        let k = self.widen(key);

        let last_page = if self.current_data_count > 0 {
            self.data.next_write_id()
        } else {
            self.data.next_write_id().saturating_sub(1)
        };
        let first_page = self.data.first_live_logical_id();

        let prediction = if self.radix.is_enabled() {
            self.radix
                .find(k, spline_len(&self.spline))
                .and_then(|(lo, hi)| self.spline.find_in_range(k, lo, hi))
        } else {
            self.spline.find(k)
        };

        if let Some(pred) = prediction {
            let lo = pred.low.max(first_page as i64).max(0) as u32;
            let hi = (pred.high.max(0) as u32).min(last_page);
            let lo = lo.min(last_page);
            for page_id in lo..=hi {
                if let Some(slot) = self.probe_page(page_id, key)? {
                    return Ok((page_id, slot));
                }
            }
        }

        // Predicted window missed (or the spline is empty, e.g. the first
        // unflushed page): fall back to the unflushed page directly.
        if self.current_data_count > 0 {
            if let Some(slot) = self.probe_page(self.data.next_write_id(), key)? {
                return Ok((self.data.next_write_id(), slot));
            }
        }

        Err(Error::NotFound)
    }

    fn probe_page(&mut self, page_id: u32, key: &[u8]) -> Result<Option<usize>> {
        let live = self.data.is_live(page_id)
            || (self.current_data_count > 0 && page_id == self.data.next_write_id());
        if !live {
            return Ok(None);
        }
        self.read_data_page_cached(page_id)?;
        let buf = self.pool.get(BufferRole::DataRead).to_vec();
        let count = DataPage::get_count(&buf);
        Ok(self.search_page(&buf, count, key))
    }

    /// Looks up the fixed-size data for `key`.
    pub fn get(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        let (page_id, slot) = self.locate(key)?;
        self.read_data_page_cached(page_id)?;
        let buf = self.pool.get(BufferRole::DataRead);
        Ok(DataPage::record_data(&self.cfg, buf, slot).to_vec())
    }

    /// Looks up the variable-data blob (if any) associated with `key`.
    pub fn get_var(&mut self, key: &[u8]) -> Result<VarData> {
        if !self.cfg.parameters.contains(Parameters::USE_VDATA) {
            return Ok(VarData::Absent);
        }
        let (page_id, slot) = self.locate(key)?;
        self.read_data_page_cached(page_id)?;
        let buf = self.pool.get(BufferRole::DataRead);
        let var_offset = DataPage::record_var_offset(&self.cfg, buf, slot);
        if var_offset == NO_VAR_DATA {
            return Ok(VarData::Absent);
        }

        let k = self.widen(key);
        let var = self.var.as_mut().expect("USE_VDATA implies a var log");
        if k < var.min_var_record_id() {
            return Ok(VarData::Evicted);
        }
        match var.read_all(var_offset) {
            Ok(bytes) => Ok(VarData::Present(bytes)),
            Err(Error::VarDataEvicted) => Ok(VarData::Evicted),
            Err(e) => Err(e),
        }
    }

    /// Flushes the in-progress data (and, if started, index) page to
    /// storage without waiting for it to fill. Idempotent when nothing is
    /// pending.
    pub fn flush(&mut self) -> Result<()> {
        if self.current_data_count > 0 {
            self.flush_data_page()?;
        }
        if self.current_index_count > 0 && self.cfg.parameters.contains(Parameters::USE_INDEX) {
            let index = self.index.as_mut().expect("USE_INDEX implies an index region");
            let index_logical_id = index.next_write_id();
            IndexPage::set_logical_id(self.pool.get_mut(BufferRole::IndexWrite), index_logical_id);
            let buf = self.pool.get(BufferRole::IndexWrite).to_vec();
            index.write(&buf)?;
            self.current_index_count = 0;
            self.pool.invalidate(BufferRole::IndexRead);
        }
        Ok(())
    }

    /// Flushes pending writes. There is nothing else to release: storage
    /// backends are dropped along with the engine.
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }

    /// The logical id the data region would assign to its next full-page
    /// write. Exposed for callers comparing frontier state across a
    /// close/reopen cycle.
    pub fn next_data_page_id(&self) -> u32 {
        self.data.next_write_id()
    }

    /// The logical id of the oldest data page still live, i.e. not yet
    /// evicted by erase-ahead reclamation.
    pub fn first_live_data_page(&self) -> u32 {
        self.data.first_live_logical_id()
    }

    /// The logical id the var-data region would assign to its next full-page
    /// write, or `None` if `USE_VDATA` isn't set.
    pub fn next_var_page_id(&self) -> Option<u32> {
        self.var.as_ref().map(|v| v.next_page_id())
    }

    /// The logical id of the oldest var page still live, or `None` if
    /// `USE_VDATA` isn't set.
    pub fn first_live_var_page(&self) -> Option<u32> {
        self.var.as_ref().map(|v| v.first_live_page())
    }

    /// Flushes pending writes and unwraps the engine back into its backing
    /// storage handles, e.g. to reopen the same backend as a fresh `Engine`.
    pub fn into_storages(mut self) -> Result<(S, Option<S>, Option<S>)> {
        self.flush()?;
        let index_storage = self.index.map(|r| r.into_storage());
        let var_storage = self.var.map(|v| v.into_region().into_storage());
        Ok((self.data.into_storage(), index_storage, var_storage))
    }

    /// Starts a range query over keys `[lo, hi]` (inclusive), optionally also
    /// restricted to records whose data falls in `[data_lo, data_hi]`, to be
    /// driven by repeated calls to [`Engine::range_next`]. Page-level
    /// min/max-key summaries (when `USE_MAX_MIN` is set) let whole pages be
    /// skipped by key. When a data bound is given and the engine has
    /// `USE_INDEX` plus both bitmap callbacks, the scan instead walks the
    /// index region's per-page bitmaps, visiting only data pages whose
    /// bitmap overlaps a query bitmap built from the data bound; without
    /// that, a data bound alone cannot skip a page (data values aren't
    /// sorted) and only filters record-by-record.
    pub fn range(&self, lo: &[u8], hi: &[u8], data_lo: Option<&[u8]>, data_hi: Option<&[u8]>) -> RangeCursor {
        let cursor = RangeCursor::new(self.data.first_live_logical_id(), lo, hi, data_lo, data_hi);

        let wants_bitmap_scan = (data_lo.is_some() || data_hi.is_some())
            && self.cfg.parameters.contains(Parameters::USE_INDEX);
        if let (true, Some(index), Some(build)) = (wants_bitmap_scan, &self.index, &self.callbacks.build_bitmap_from_range) {
            if self.callbacks.in_bitmap.is_some() {
                let lo_bound = data_lo.map(|d| d.to_vec()).unwrap_or_else(|| vec![0u8; self.cfg.data_size]);
                let hi_bound = data_hi.map(|d| d.to_vec()).unwrap_or_else(|| vec![0xFFu8; self.cfg.data_size]);
                let mut bitmap = vec![0u8; self.cfg.bitmap_size.max(1)];
                build(&lo_bound, &hi_bound, &mut bitmap);
                return cursor.with_index(index.first_live_logical_id(), bitmap);
            }
        }
        cursor
    }

    /// Advances a range query, returning the next `(key, data)` pair in
    /// ascending key order, or `None` once the range is exhausted.
    pub fn range_next(&mut self, cursor: &mut RangeCursor) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            match cursor.state {
                IterState::Done => return Ok(None),
                IterState::NeedIndexPage => {
                    let index = self.index.as_ref().expect("index-driven cursor requires USE_INDEX");
                    let has_unflushed = self.current_index_count > 0;
                    let last_index_page = if has_unflushed {
                        index.next_write_id()
                    } else {
                        index.next_write_id().saturating_sub(1)
                    };
                    let nothing_live = index.live_pages() == 0 && !has_unflushed;

                    if nothing_live || cursor.index_page_id > last_index_page {
                        cursor.state = IterState::Done;
                        continue;
                    }

                    let live = index.is_live(cursor.index_page_id)
                        || (has_unflushed && cursor.index_page_id == index.next_write_id());
                    if !live {
                        cursor.index_page_id += 1;
                        cursor.index_slot = 0;
                        continue;
                    }

                    self.read_index_page_cached(cursor.index_page_id)?;
                    let buf = self.pool.get(BufferRole::IndexRead).to_vec();
                    let count = IndexPage::get_count(&buf) as usize;
                    let min_data_page_id = IndexPage::get_min_data_page_id(&buf);

                    if count == 0 || cursor.index_slot >= count {
                        cursor.index_page_id += 1;
                        cursor.index_slot = 0;
                        continue;
                    }

                    let query_bitmap = cursor
                        .query_bitmap
                        .clone()
                        .expect("NeedIndexPage implies a query bitmap");
                    let in_bitmap = self
                        .callbacks
                        .in_bitmap
                        .as_ref()
                        .expect("NeedIndexPage implies an in_bitmap callback");

                    let mut candidate = None;
                    for slot in cursor.index_slot..count {
                        let page_bitmap = IndexPage::bitmap_slot(self.cfg.bitmap_size.max(1), &buf, slot);
                        if in_bitmap(&query_bitmap, page_bitmap) {
                            candidate = Some((slot, min_data_page_id + slot as u32));
                            break;
                        }
                    }

                    match candidate {
                        Some((slot, data_page_id)) => {
                            cursor.index_slot = slot + 1;
                            cursor.page_id = data_page_id;
                            cursor.state = IterState::NeedDataPage;
                        }
                        None => {
                            cursor.index_page_id += 1;
                            cursor.index_slot = 0;
                        }
                    }
                }
                IterState::NeedDataPage => {
                    let has_unflushed = self.current_data_count > 0;
                    let last_page_id = if has_unflushed {
                        self.data.next_write_id()
                    } else {
                        self.data.next_write_id().saturating_sub(1)
                    };
                    let nothing_live = self.data.live_pages() == 0 && !has_unflushed;
                    let index_driven = cursor.query_bitmap.is_some();

                    if nothing_live || cursor.page_id > last_page_id {
                        cursor.state = IterState::Done;
                        continue;
                    }

                    let live = self.data.is_live(cursor.page_id)
                        || (has_unflushed && cursor.page_id == self.data.next_write_id());
                    if !live {
                        advance_past_page(cursor, index_driven);
                        continue;
                    }

                    self.read_data_page_cached(cursor.page_id)?;
                    let buf = self.pool.get(BufferRole::DataRead).to_vec();
                    let count = DataPage::get_count(&buf);
                    if count == 0 {
                        advance_past_page(cursor, index_driven);
                        continue;
                    }

                    if self.cfg.parameters.contains(Parameters::USE_MAX_MIN) {
                        let min_key = DataPage::get_min_key(&self.cfg, &buf).to_vec();
                        let max_key = DataPage::get_max_key(&self.cfg, &buf).to_vec();
                        if (self.callbacks.compare_key)(&min_key, &cursor.hi) == Ordering::Greater {
                            cursor.state = IterState::Done;
                            continue;
                        }
                        if (self.callbacks.compare_key)(&max_key, &cursor.lo) == Ordering::Less {
                            advance_past_page(cursor, index_driven);
                            continue;
                        }

                        let min_data = DataPage::get_min_data(&self.cfg, &buf).to_vec();
                        let max_data = DataPage::get_max_data(&self.cfg, &buf).to_vec();
                        if let Some(data_hi) = &cursor.data_hi {
                            if (self.callbacks.compare_data)(&min_data, data_hi) == Ordering::Greater {
                                advance_past_page(cursor, index_driven);
                                continue;
                            }
                        }
                        if let Some(data_lo) = &cursor.data_lo {
                            if (self.callbacks.compare_data)(&max_data, data_lo) == Ordering::Less {
                                advance_past_page(cursor, index_driven);
                                continue;
                            }
                        }
                    }

                    cursor.slot = 0;
                    cursor.count_in_page = count;
                    cursor.state = IterState::InPage;
                }
                IterState::InPage => {
                    if cursor.slot >= cursor.count_in_page as usize {
                        if cursor.query_bitmap.is_some() {
                            cursor.state = IterState::NeedIndexPage;
                        } else {
                            cursor.page_id += 1;
                            cursor.state = IterState::NeedDataPage;
                        }
                        continue;
                    }
                    let buf = self.pool.get(BufferRole::DataRead).to_vec();
                    let key = DataPage::record_key(&self.cfg, &buf, cursor.slot).to_vec();
                    let record_data = DataPage::record_data(&self.cfg, &buf, cursor.slot).to_vec();
                    cursor.slot += 1;

                    if (self.callbacks.compare_key)(&key, &cursor.hi) == Ordering::Greater {
                        cursor.state = IterState::Done;
                        return Ok(None);
                    }
                    if (self.callbacks.compare_key)(&key, &cursor.lo) == Ordering::Less {
                        continue;
                    }
                    if let Some(data_hi) = &cursor.data_hi {
                        if (self.callbacks.compare_data)(&record_data, data_hi) == Ordering::Greater {
                            continue;
                        }
                    }
                    if let Some(data_lo) = &cursor.data_lo {
                        if (self.callbacks.compare_data)(&record_data, data_lo) == Ordering::Less {
                            continue;
                        }
                    }
                    return Ok(Some((key, record_data)));
                }
            }
        }
    }
}

/// Skips the current data page during a `NeedDataPage` scan: sequentially,
/// when not index-driven, or back to the index region to try the next
/// overlapping bitmap, when it is.
fn advance_past_page(cursor: &mut RangeCursor, index_driven: bool) {
    if index_driven {
        cursor.state = IterState::NeedIndexPage;
    } else {
        cursor.page_id += 1;
    }
}

fn spline_len(spline: &Spline) -> usize {
    spline.len()
}

fn spline_knot_index(spline: &Spline) -> usize {
    spline.len().saturating_sub(1)
}
