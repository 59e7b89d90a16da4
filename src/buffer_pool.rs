//! Fixed buffer pool: a contiguous set of page-sized slots with named roles,
//! allocated once at `open`/`create` time from `buffer_size_in_blocks`. Slot
//! indices shift depending on which optional regions are enabled, the same
//! way the buffer pool's block count requirement in [`crate::config`] grows
//! with `USE_INDEX` / `USE_VDATA`.

use crate::config::{EngineConfig, Parameters};

/// Identifies one of the pool's fixed roles. Not every role is backed by a
/// real slot unless its region is enabled; see [`BufferPool::slot_for`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferRole {
    DataWrite,
    DataRead,
    IndexWrite,
    IndexRead,
    VarWrite,
    VarRead,
}

/// A pool of `page_size`-sized buffers, one per enabled role, plus a record
/// of which physical page currently sits in each read slot (a lookup that
/// matches the cached page counts as a buffer hit and skips the storage
/// read).
pub struct BufferPool {
    page_size: usize,
    slots: Vec<Vec<u8>>,
    data_read_resident: Option<u32>,
    index_read_resident: Option<u32>,
    var_read_resident: Option<u32>,
    has_index: bool,
    has_var: bool,
}

impl BufferPool {
    pub fn new(cfg: &EngineConfig) -> BufferPool {
        let has_index = cfg.parameters.contains(Parameters::USE_INDEX);
        let has_var = cfg.parameters.contains(Parameters::USE_VDATA);

        let mut role_count = 2; // data-write, data-read
        if has_index {
            role_count += 2;
        }
        if has_var {
            role_count += 2;
        }

        BufferPool {
            page_size: cfg.page_size,
            slots: (0..role_count).map(|_| vec![0u8; cfg.page_size]).collect(),
            data_read_resident: None,
            index_read_resident: None,
            var_read_resident: None,
            has_index,
            has_var,
        }
    }

    fn slot_for(&self, role: BufferRole) -> usize {
        match role {
            BufferRole::DataWrite => 0,
            BufferRole::DataRead => 1,
            BufferRole::IndexWrite => {
                assert!(self.has_index, "index region not enabled");
                2
            }
            BufferRole::IndexRead => {
                assert!(self.has_index, "index region not enabled");
                3
            }
            BufferRole::VarWrite => {
                assert!(self.has_var, "variable-data region not enabled");
                if self.has_index {
                    4
                } else {
                    2
                }
            }
            BufferRole::VarRead => {
                assert!(self.has_var, "variable-data region not enabled");
                if self.has_index {
                    5
                } else {
                    3
                }
            }
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn get(&self, role: BufferRole) -> &[u8] {
        &self.slots[self.slot_for(role)]
    }

    pub fn get_mut(&mut self, role: BufferRole) -> &mut [u8] {
        let idx = self.slot_for(role);
        &mut self.slots[idx]
    }

    fn resident_mut(&mut self, role: BufferRole) -> &mut Option<u32> {
        match role {
            BufferRole::DataRead => &mut self.data_read_resident,
            BufferRole::IndexRead => &mut self.index_read_resident,
            BufferRole::VarRead => &mut self.var_read_resident,
            _ => panic!("role {:?} has no read cache", role),
        }
    }

    /// Returns `true` if `logical_id` is already resident in the read slot
    /// for `role`, meaning the caller can skip the storage read entirely.
    pub fn is_cached(&self, role: BufferRole, logical_id: u32) -> bool {
        let resident = match role {
            BufferRole::DataRead => self.data_read_resident,
            BufferRole::IndexRead => self.index_read_resident,
            BufferRole::VarRead => self.var_read_resident,
            _ => return false,
        };
        resident == Some(logical_id)
    }

    /// Records that `logical_id` now occupies the read slot for `role`,
    /// after the caller has filled it via [`BufferPool::get_mut`].
    pub fn mark_resident(&mut self, role: BufferRole, logical_id: u32) {
        *self.resident_mut(role) = Some(logical_id);
    }

    /// Invalidates the read cache for `role`, forcing the next lookup to hit
    /// storage. Used whenever a write could have displaced the cached page
    /// (region wrap, reclaim).
    pub fn invalidate(&mut self, role: BufferRole) {
        *self.resident_mut(role) = None;
    }
}
