//! Region-frontier recovery: reopening a previously-populated storage
//! backend without `RESET_DATA` requires rediscovering where the write
//! frontier, erase frontier, and live window were when the engine last
//! closed, purely from page content.
//!
//! Because every region writes strictly round-robin (logical id `L` always
//! lands on physical page `L mod num_pages`), and the erase-ahead schedule
//! is a deterministic function of how many pages have been written so far,
//! the whole frontier can be derived from a single number: the highest
//! logical id found on any written page. No page content beyond the header
//! needs to be reasoned about to restore the frontier itself (rebuilding
//! the spline is a separate pass, see [`crate::engine::Engine::open`]).

use crate::error::Result;
use crate::storage::Storage;

/// Recovered region frontier state, fed into [`crate::region::Region::from_recovered_state`].
pub struct RecoveredFrontier {
    pub next_write_id: u32,
    pub next_write_phys: u32,
    pub first_live_phys: u32,
    pub first_live_logical: u32,
    pub erased_end_page: u32,
    pub wrapped: bool,
}

/// Scans every physical page of a region and reconstructs its frontier.
///
/// `is_written` distinguishes a page that has genuinely been flushed from
/// one that has never been touched (for data/index pages, "record count >
/// 0" is unambiguous; the variable-data log has no count field and uses a
/// weaker "any non-zero header byte" heuristic, noted as an approximation).
pub fn scan_region<S: Storage>(
    storage: &mut S,
    page_size: usize,
    num_pages: u32,
    erase_size_in_pages: u32,
    get_logical_id: impl Fn(&[u8]) -> u32,
    is_written: impl Fn(&[u8]) -> bool,
) -> Result<RecoveredFrontier> {
    let mut buf = vec![0u8; page_size];
    let mut max_logical: Option<u32> = None;

    for phys in 0..num_pages {
        storage.read_page(phys as u64 * page_size as u64, &mut buf)?;
        if is_written(&buf) {
            let logical = get_logical_id(&buf);
            max_logical = Some(max_logical.map_or(logical, |m| m.max(logical)));
        }
    }

    let next_write_id = match max_logical {
        Some(m) => m + 1,
        None => {
            return Ok(RecoveredFrontier {
                next_write_id: 0,
                next_write_phys: 0,
                first_live_phys: 0,
                first_live_logical: 0,
                erased_end_page: 0,
                wrapped: false,
            });
        }
    };

    let blocks_per_region = num_pages / erase_size_in_pages;
    let triggers = next_write_id.div_ceil(erase_size_in_pages);
    let first_live_logical = erase_size_in_pages * triggers.saturating_sub(blocks_per_region);
    let first_live_phys = first_live_logical % num_pages;
    let next_write_phys = next_write_id % num_pages;
    let erased_end_page = (triggers * erase_size_in_pages) % num_pages;
    let wrapped = next_write_id >= num_pages;

    Ok(RecoveredFrontier {
        next_write_id,
        next_write_phys,
        first_live_phys,
        first_live_logical,
        erased_end_page,
        wrapped,
    })
}
