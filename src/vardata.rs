//! Variable-length blob log: an append-only stream of length-prefixed
//! records layered on top of a circular [`Region`], used for payloads too
//! large or too irregular to fit a fixed-width record slot.
//!
//! Each var page's header holds two fields: the largest key whose blob has
//! bytes on that page (`key_size` bytes, re-stamped every time the page is
//! touched), followed by a 4-byte monotonic logical id stamped once, when
//! the page is flushed. The id field is what lets recovery rediscover the
//! write frontier the same way it does for data/index pages (see
//! [`crate::recovery::scan_region`]) instead of having to rely on payload
//! bytes, which carry no page-identifying information of their own.
//!
//! When the region is about to reclaim a page out from under still-referenced
//! data, the key header is read one last time to bump `min_var_record_id`, so
//! callers holding older addresses get a clean [`crate::error::Error::VarDataEvicted`]
//! instead of silently reading garbage.

use crate::codec::{narrow_key, widen_key};
use crate::error::{Error, Result};
use crate::region::Region;
use crate::storage::Storage;

/// Marks a fixed record as having no associated variable-data blob.
pub const NO_VAR_DATA: u32 = 0xFFFF_FFFF;

/// Width of the monotonic page-id header field, stamped after the re-stamped
/// max-key field in every var page's header.
const ID_FIELD_SIZE: usize = 4;

pub struct VarLog<S: Storage> {
    region: Region<S>,
    page_size: usize,
    key_size: usize,
    write_buf: Vec<u8>,
    write_pos: usize,
    min_var_record_id: u64,
}

impl<S: Storage> VarLog<S> {
    pub fn new(region: Region<S>, page_size: usize, key_size: usize) -> VarLog<S> {
        let mut write_buf = vec![0u8; page_size];
        narrow_key(0, key_size, &mut write_buf[..key_size]);
        let header_size = key_size + ID_FIELD_SIZE;
        VarLog {
            region,
            page_size,
            key_size,
            write_buf,
            write_pos: header_size,
            min_var_record_id: 0,
        }
    }

    /// Unwraps the log back into its backing region, discarding the
    /// in-progress write buffer (matching the documented no-WAL durability
    /// contract: only fully-flushed pages survive).
    pub fn into_region(self) -> Region<S> {
        self.region
    }

    /// The logical id the log would assign to its next full-page write.
    pub fn next_page_id(&self) -> u32 {
        self.region.next_write_id()
    }

    /// The logical id of the oldest var page still live.
    pub fn first_live_page(&self) -> u32 {
        self.region.first_live_logical_id()
    }

    /// The smallest key whose variable-data blob is still guaranteed live.
    /// Records with a strictly smaller key must treat their blob as evicted.
    pub fn min_var_record_id(&self) -> u64 {
        self.min_var_record_id
    }

    fn flush_current_page(&mut self, next_key: u64) -> Result<()> {
        if let Some(phys) = self.region.pending_erase() {
            let mut header = vec![0u8; self.page_size];
            self.region.read_physical(phys, &mut header)?;
            let evicted_key = widen_key(&header[..self.key_size], self.key_size);
            self.min_var_record_id = self.min_var_record_id.max(evicted_key + 1);
        }
        let logical_id = self.region.next_write_id();
        let id_off = self.key_size;
        self.write_buf[id_off..id_off + ID_FIELD_SIZE].copy_from_slice(&logical_id.to_le_bytes());
        self.region.write(&self.write_buf)?;
        self.write_buf = vec![0u8; self.page_size];
        narrow_key(next_key, self.key_size, &mut self.write_buf[..self.key_size]);
        self.write_pos = self.header_size();
        Ok(())
    }

    fn write_bytes(&mut self, key: u64, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            narrow_key(key, self.key_size, &mut self.write_buf[..self.key_size]);
            let capacity = self.page_size - self.write_pos;
            let take = capacity.min(data.len());
            let pos = self.write_pos;
            self.write_buf[pos..pos + take].copy_from_slice(&data[..take]);
            self.write_pos += take;
            data = &data[take..];

            if self.write_pos >= self.page_size {
                self.flush_current_page(key)?;
            }
        }
        Ok(())
    }

    /// Every page's first `key_size + 4` bytes are a header (re-stamped max
    /// key, then a monotonic page id), never part of the blob stream; this is
    /// the number of data-carrying bytes in each page.
    fn header_size(&self) -> usize {
        self.key_size + ID_FIELD_SIZE
    }

    fn usable_per_page(&self) -> usize {
        self.page_size - self.header_size()
    }

    /// Appends a length-prefixed blob tagged with `key` (the owning record's
    /// key, used to re-stamp page headers) and returns the absolute byte
    /// address at which it starts. Addresses count only data bytes, so page
    /// headers never appear inside an address range.
    pub fn append(&mut self, key: u64, data: &[u8]) -> Result<u32> {
        let usable = self.usable_per_page() as u64;
        let start_addr = self.region.next_write_id() as u64 * usable
            + (self.write_pos - self.header_size()) as u64;
        self.write_bytes(key, &(data.len() as u32).to_le_bytes())?;
        self.write_bytes(key, data)?;
        Ok(start_addr as u32)
    }

    fn read_bytes(&mut self, addr: &mut u64, buf: &mut [u8]) -> Result<()> {
        let usable = self.usable_per_page() as u64;
        let header_size = self.header_size();
        let mut read = 0;
        while read < buf.len() {
            let logical_page = (*addr / usable) as u32;
            let offset_in_page = header_size + (*addr % usable) as usize;

            let page: Vec<u8> = if logical_page == self.region.next_write_id() {
                self.write_buf.clone()
            } else if self.region.is_live(logical_page) {
                let mut tmp = vec![0u8; self.page_size];
                self.region.read_logical(logical_page, &mut tmp)?;
                tmp
            } else {
                return Err(Error::VarDataEvicted);
            };

            let take = (self.page_size - offset_in_page).min(buf.len() - read);
            buf[read..read + take].copy_from_slice(&page[offset_in_page..offset_in_page + take]);
            read += take;
            *addr += take as u64;
        }
        Ok(())
    }

    /// Begins a streaming read of the blob at `addr`, eagerly decoding its
    /// length prefix.
    pub fn open_stream(&mut self, addr: u32) -> Result<VarDataStream> {
        let mut cursor = addr as u64;
        let mut len_buf = [0u8; 4];
        self.read_bytes(&mut cursor, &mut len_buf)?;
        let total_len = u32::from_le_bytes(len_buf) as usize;
        Ok(VarDataStream {
            cursor,
            total_len,
            bytes_read: 0,
        })
    }

    /// Reads the next chunk of an open stream into `out`, returning the
    /// number of bytes actually filled (0 once the blob is exhausted).
    pub fn read_chunk(&mut self, stream: &mut VarDataStream, out: &mut [u8]) -> Result<usize> {
        let remaining = stream.total_len - stream.bytes_read;
        let take = remaining.min(out.len());
        if take == 0 {
            return Ok(0);
        }
        self.read_bytes(&mut stream.cursor, &mut out[..take])?;
        stream.bytes_read += take;
        Ok(take)
    }

    /// Reads an entire blob into a freshly allocated buffer. A convenience
    /// wrapper over [`VarLog::open_stream`] / [`VarLog::read_chunk`] for
    /// callers that do not need incremental reads.
    pub fn read_all(&mut self, addr: u32) -> Result<Vec<u8>> {
        let mut stream = self.open_stream(addr)?;
        let mut out = vec![0u8; stream.total_len];
        let mut filled = 0;
        while filled < out.len() {
            let n = self.read_chunk(&mut stream, &mut out[filled..])?;
            debug_assert!(n > 0);
            filled += n;
        }
        Ok(out)
    }
}

/// Cursor over an in-progress variable-data read. Holds no reference to the
/// engine or its buffers; every read goes back through [`VarLog::read_chunk`]
/// so the stream can outlive any single borrow of the var-read buffer.
pub struct VarDataStream {
    cursor: u64,
    total_len: usize,
    bytes_read: usize,
}

impl VarDataStream {
    pub fn total_len(&self) -> usize {
        self.total_len
    }

    pub fn bytes_remaining(&self) -> usize {
        self.total_len - self.bytes_read
    }
}
