//! Page codec: encode/decode the header, record slots, bitmap, and min/max
//! summary fields of a single page. Every page type is handled as a plain
//! `&mut [u8]` of `page_size` bytes plus the active [`EngineConfig`]; there is
//! no owning page struct, mirroring the free-function codec style used
//! throughout the storage examples this crate is grounded on.

use crate::config::{EngineConfig, Parameters};

/// Sentinel stored in `maxError` meaning "fall back to plain bisection"
/// rather than a slope-seeded search. Distinct from a legitimately-zero
/// error bound.
pub const NO_SLOPE_ESTIMATE: i32 = -1;

const LOGICAL_ID_OFFSET: usize = 0;
const COUNT_OFFSET: usize = 4;
const VAR_OFFSET_SIZE: usize = 4;

/// Utility struct for reading/writing the fixed-layout data page header and
/// record slots.
pub struct DataPage;

impl DataPage {
    fn bitmap_offset(_cfg: &EngineConfig) -> usize {
        COUNT_OFFSET + 2
    }

    fn min_key_offset(cfg: &EngineConfig) -> usize {
        let mut off = Self::bitmap_offset(cfg);
        if cfg.parameters.contains(Parameters::USE_BMAP) {
            off += cfg.bitmap_size;
        }
        off
    }

    fn max_key_offset(cfg: &EngineConfig) -> usize {
        Self::min_key_offset(cfg) + cfg.key_size
    }

    fn min_data_offset(cfg: &EngineConfig) -> usize {
        Self::max_key_offset(cfg) + cfg.key_size
    }

    fn max_data_offset(cfg: &EngineConfig) -> usize {
        Self::min_data_offset(cfg) + cfg.data_size
    }

    /// Zeroes the record body and sets min-key/min-data to all-ones so that
    /// the first insert's min comparison always wins.
    pub fn init_page(cfg: &EngineConfig, buf: &mut [u8]) {
        for b in buf.iter_mut() {
            *b = 0;
        }
        if cfg.parameters.contains(Parameters::USE_MAX_MIN) {
            let min_key_off = Self::min_key_offset(cfg);
            let min_data_off = Self::min_data_offset(cfg);
            buf[min_key_off..min_key_off + cfg.key_size].fill(0xFF);
            buf[min_data_off..min_data_off + cfg.data_size].fill(0xFF);
        }
    }

    pub fn get_logical_id(buf: &[u8]) -> u32 {
        u32::from_le_bytes(buf[LOGICAL_ID_OFFSET..LOGICAL_ID_OFFSET + 4].try_into().unwrap())
    }

    pub fn set_logical_id(buf: &mut [u8], id: u32) {
        buf[LOGICAL_ID_OFFSET..LOGICAL_ID_OFFSET + 4].copy_from_slice(&id.to_le_bytes());
    }

    pub fn get_count(buf: &[u8]) -> u16 {
        u16::from_le_bytes(buf[COUNT_OFFSET..COUNT_OFFSET + 2].try_into().unwrap())
    }

    pub fn set_count(buf: &mut [u8], count: u16) {
        buf[COUNT_OFFSET..COUNT_OFFSET + 2].copy_from_slice(&count.to_le_bytes());
    }

    pub fn inc_count(buf: &mut [u8]) -> u16 {
        let new_count = Self::get_count(buf) + 1;
        Self::set_count(buf, new_count);
        new_count
    }

    pub fn get_bitmap<'a>(cfg: &EngineConfig, buf: &'a [u8]) -> &'a [u8] {
        let off = Self::bitmap_offset(cfg);
        &buf[off..off + cfg.bitmap_size]
    }

    pub fn get_bitmap_mut<'a>(cfg: &EngineConfig, buf: &'a mut [u8]) -> &'a mut [u8] {
        let off = Self::bitmap_offset(cfg);
        &mut buf[off..off + cfg.bitmap_size]
    }

    pub fn get_min_key<'a>(cfg: &EngineConfig, buf: &'a [u8]) -> &'a [u8] {
        let off = Self::min_key_offset(cfg);
        &buf[off..off + cfg.key_size]
    }

    pub fn set_min_key(cfg: &EngineConfig, buf: &mut [u8], key: &[u8]) {
        let off = Self::min_key_offset(cfg);
        buf[off..off + cfg.key_size].copy_from_slice(key);
    }

    pub fn get_max_key<'a>(cfg: &EngineConfig, buf: &'a [u8]) -> &'a [u8] {
        let off = Self::max_key_offset(cfg);
        &buf[off..off + cfg.key_size]
    }

    pub fn set_max_key(cfg: &EngineConfig, buf: &mut [u8], key: &[u8]) {
        let off = Self::max_key_offset(cfg);
        buf[off..off + cfg.key_size].copy_from_slice(key);
    }

    pub fn get_min_data<'a>(cfg: &EngineConfig, buf: &'a [u8]) -> &'a [u8] {
        let off = Self::min_data_offset(cfg);
        &buf[off..off + cfg.data_size]
    }

    pub fn set_min_data(cfg: &EngineConfig, buf: &mut [u8], data: &[u8]) {
        let off = Self::min_data_offset(cfg);
        buf[off..off + cfg.data_size].copy_from_slice(data);
    }

    pub fn get_max_data<'a>(cfg: &EngineConfig, buf: &'a [u8]) -> &'a [u8] {
        let off = Self::max_data_offset(cfg);
        &buf[off..off + cfg.data_size]
    }

    pub fn set_max_data(cfg: &EngineConfig, buf: &mut [u8], data: &[u8]) {
        let off = Self::max_data_offset(cfg);
        buf[off..off + cfg.data_size].copy_from_slice(data);
    }

    /// Byte offset of record slot `i` relative to the start of the page.
    pub fn slot_offset(cfg: &EngineConfig, i: usize) -> usize {
        cfg.header_size() + i * cfg.record_size()
    }

    pub fn record_key<'a>(cfg: &EngineConfig, buf: &'a [u8], i: usize) -> &'a [u8] {
        let off = Self::slot_offset(cfg, i);
        &buf[off..off + cfg.key_size]
    }

    pub fn record_data<'a>(cfg: &EngineConfig, buf: &'a [u8], i: usize) -> &'a [u8] {
        let off = Self::slot_offset(cfg, i) + cfg.key_size;
        &buf[off..off + cfg.data_size]
    }

    pub fn record_var_offset(cfg: &EngineConfig, buf: &[u8], i: usize) -> u32 {
        let off = Self::slot_offset(cfg, i) + cfg.key_size + cfg.data_size;
        u32::from_le_bytes(buf[off..off + VAR_OFFSET_SIZE].try_into().unwrap())
    }

    pub fn set_record_var_offset(cfg: &EngineConfig, buf: &mut [u8], i: usize, var_offset: u32) {
        let off = Self::slot_offset(cfg, i) + cfg.key_size + cfg.data_size;
        buf[off..off + VAR_OFFSET_SIZE].copy_from_slice(&var_offset.to_le_bytes());
    }

    pub fn write_record(cfg: &EngineConfig, buf: &mut [u8], i: usize, key: &[u8], data: &[u8]) {
        let off = Self::slot_offset(cfg, i);
        buf[off..off + cfg.key_size].copy_from_slice(key);
        buf[off + cfg.key_size..off + cfg.key_size + cfg.data_size].copy_from_slice(data);
    }
}

/// Utility struct for reading/writing index page headers and the
/// per-data-page bitmap entries that follow.
pub struct IndexPage;

impl IndexPage {
    pub const HEADER_SIZE: usize = 16;

    pub fn get_logical_id(buf: &[u8]) -> u32 {
        u32::from_le_bytes(buf[0..4].try_into().unwrap())
    }

    pub fn set_logical_id(buf: &mut [u8], id: u32) {
        buf[0..4].copy_from_slice(&id.to_le_bytes());
    }

    pub fn get_count(buf: &[u8]) -> u16 {
        u16::from_le_bytes(buf[4..6].try_into().unwrap())
    }

    pub fn set_count(buf: &mut [u8], count: u16) {
        buf[4..6].copy_from_slice(&count.to_le_bytes());
    }

    pub fn get_min_data_page_id(buf: &[u8]) -> u32 {
        u32::from_le_bytes(buf[8..12].try_into().unwrap())
    }

    pub fn set_min_data_page_id(buf: &mut [u8], id: u32) {
        buf[8..12].copy_from_slice(&id.to_le_bytes());
    }

    pub fn init_page(buf: &mut [u8], min_data_page_id: u32) {
        for b in buf.iter_mut() {
            *b = 0;
        }
        Self::set_min_data_page_id(buf, min_data_page_id);
    }

    pub fn bitmap_slot(bitmap_size: usize, buf: &[u8], i: usize) -> &[u8] {
        let off = Self::HEADER_SIZE + i * bitmap_size;
        &buf[off..off + bitmap_size]
    }

    pub fn set_bitmap_slot(bitmap_size: usize, buf: &mut [u8], i: usize, bitmap: &[u8]) {
        let off = Self::HEADER_SIZE + i * bitmap_size;
        buf[off..off + bitmap_size].copy_from_slice(bitmap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Parameters;

    fn cfg() -> EngineConfig {
        EngineConfig {
            key_size: 4,
            data_size: 12,
            page_size: 512,
            buffer_size_in_blocks: 2,
            bitmap_size: 2,
            parameters: Parameters::USE_MAX_MIN | Parameters::USE_BMAP,
            num_data_pages: 100,
            num_index_pages: 10,
            num_var_pages: 0,
            erase_size_in_pages: 10,
            index_max_error: 8,
            radix_bits: 0,
        }
    }

    #[test]
    fn init_page_sets_min_sentinels() {
        let cfg = cfg();
        let mut buf = vec![0u8; cfg.page_size];
        DataPage::init_page(&cfg, &mut buf);
        assert_eq!(DataPage::get_min_key(&cfg, &buf), &[0xFF; 4]);
        assert_eq!(DataPage::get_min_data(&cfg, &buf), &[0xFF; 12]);
    }

    #[test]
    fn record_roundtrip() {
        let cfg = cfg();
        let mut buf = vec![0u8; cfg.page_size];
        DataPage::init_page(&cfg, &mut buf);
        DataPage::write_record(&cfg, &mut buf, 0, &[1, 0, 0, 0], &[9; 12]);
        DataPage::write_record(&cfg, &mut buf, 1, &[2, 0, 0, 0], &[8; 12]);

        assert_eq!(DataPage::record_key(&cfg, &buf, 0), &[1, 0, 0, 0]);
        assert_eq!(DataPage::record_data(&cfg, &buf, 1), &[8; 12]);
    }

    #[test]
    fn count_increments() {
        let cfg = cfg();
        let mut buf = vec![0u8; cfg.page_size];
        DataPage::init_page(&cfg, &mut buf);
        assert_eq!(DataPage::get_count(&buf), 0);
        assert_eq!(DataPage::inc_count(&mut buf), 1);
        assert_eq!(DataPage::inc_count(&mut buf), 2);
    }

    #[test]
    fn index_page_bitmap_slots() {
        let mut buf = vec![0u8; 512];
        IndexPage::init_page(&mut buf, 42);
        IndexPage::set_count(&mut buf, 2);
        IndexPage::set_bitmap_slot(2, &mut buf, 0, &[1, 2]);
        IndexPage::set_bitmap_slot(2, &mut buf, 1, &[3, 4]);

        assert_eq!(IndexPage::get_min_data_page_id(&buf), 42);
        assert_eq!(IndexPage::bitmap_slot(2, &buf, 0), &[1, 2]);
        assert_eq!(IndexPage::bitmap_slot(2, &buf, 1), &[3, 4]);
    }
}
