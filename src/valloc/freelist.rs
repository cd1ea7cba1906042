//! First-fit heap over the virtual address space.
//!
//! Block headers live inside the pool and travel through the page cache
//! like any other data; the only header kept in RAM is the free-list
//! sentinel at virtual address [`BASE_ADDR`]. All sizes are counted in
//! 8-byte header units.

use std::ptr;

use log::trace;

use super::Inner;
use crate::backend::Backend;
use crate::error::{Result, VmError};
use crate::{VirtAddr, VirtSize};

/// Size of one allocation header; also the heap's unit of account.
pub(crate) const HEADER_BYTES: VirtSize = 8;
/// Pool bytes below this are never handed out, so address 0 stays null.
pub(crate) const START_OFFSET: VirtAddr = HEADER_BYTES;
/// Virtual address of the RAM-resident free-list sentinel.
pub(crate) const BASE_ADDR: VirtAddr = 1;
/// Fresh blocks carved off the raw pool are at least this many units, to
/// keep tiny allocations from shredding the pool.
pub(crate) const MIN_ALLOC_UNITS: VirtSize = 16;

/// Allocation header: successor in the circular free list and block size in
/// header units. Stored byte-for-byte at the block's first 8 bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct MemHeader {
    pub next: VirtAddr,
    pub size: VirtSize,
}

impl MemHeader {
    pub fn to_bytes(self) -> [u8; HEADER_BYTES as usize] {
        let mut b = [0u8; HEADER_BYTES as usize];
        b[..4].copy_from_slice(&self.next.to_ne_bytes());
        b[4..].copy_from_slice(&self.size.to_ne_bytes());
        b
    }

    pub fn from_bytes(b: [u8; HEADER_BYTES as usize]) -> Self {
        Self {
            next: VirtAddr::from_ne_bytes(b[..4].try_into().unwrap()),
            size: VirtSize::from_ne_bytes(b[4..].try_into().unwrap()),
        }
    }
}

impl<B: Backend> Inner<B> {
    /// Reads the header at `p`; the sentinel comes from RAM.
    pub(crate) fn header(&mut self, p: VirtAddr) -> Result<MemHeader> {
        if p == BASE_ADDR {
            return Ok(self.base_free_list);
        }
        let src = self.read_raw(p, HEADER_BYTES)?;
        let mut b = [0u8; HEADER_BYTES as usize];
        unsafe { ptr::copy_nonoverlapping(src, b.as_mut_ptr(), b.len()) };
        Ok(MemHeader::from_bytes(b))
    }

    pub(crate) fn set_header(&mut self, p: VirtAddr, h: MemHeader) -> Result<()> {
        if p == BASE_ADDR {
            self.base_free_list = h;
            return Ok(());
        }
        let b = h.to_bytes();
        unsafe { self.write_raw(p, b.as_ptr(), HEADER_BYTES) }
    }

    /// Carves a fresh block of at least `units` header units off the raw
    /// pool and feeds it to the free path so the ongoing first-fit scan
    /// discovers it. Returns the new scan start, or `None` when the pool is
    /// exhausted.
    fn get_mem(&mut self, units: VirtSize) -> Result<Option<VirtAddr>> {
        let units = units.max(MIN_ALLOC_UNITS);
        let total = units * HEADER_BYTES;
        if self.pool_free_pos as u64 + total as u64 > self.pool_size as u64 {
            return Ok(None);
        }
        let hdr_pos = self.pool_free_pos;
        self.set_header(
            hdr_pos,
            MemHeader {
                next: 0,
                size: units,
            },
        )?;
        #[cfg(feature = "stats")]
        {
            // balanced by the subtraction in do_free
            self.stats.mem_used += total;
        }
        self.pool_free_pos += total;
        trace!("heap grows: {} units at {}", units, hdr_pos);
        self.do_free(hdr_pos + HEADER_BYTES)?;
        Ok(Some(self.free_pointer))
    }

    pub(crate) fn alloc_raw(&mut self, size: VirtSize) -> Result<VirtAddr> {
        self.ensure_started()?;
        if size == 0 {
            return Err(VmError::InvalidArgument("zero-sized allocation".into()));
        }
        // one extra unit for the header itself
        let quantity = (size + HEADER_BYTES - 1) / HEADER_BYTES + 1;

        let mut prevp = self.free_pointer;
        if prevp == 0 {
            // first call: degenerate zero-sized sentinel pointing at itself
            self.base_free_list = MemHeader {
                next: BASE_ADDR,
                size: 0,
            };
            self.free_pointer = BASE_ADDR;
            prevp = BASE_ADDR;
        }

        let mut p = self.header(prevp)?.next;
        loop {
            let h = self.header(p)?;
            if h.size >= quantity {
                #[cfg(feature = "stats")]
                {
                    self.stats.mem_used += quantity * HEADER_BYTES;
                    self.stats.max_mem_used = self.stats.max_mem_used.max(self.stats.mem_used);
                }
                if h.size == quantity {
                    // exact fit: unlink the whole block
                    let next = h.next;
                    let mut prevh = self.header(prevp)?;
                    prevh.next = next;
                    self.set_header(prevp, prevh)?;
                } else {
                    // split off the tail
                    let mut shrunk = h;
                    shrunk.size -= quantity;
                    self.set_header(p, shrunk)?;
                    p += shrunk.size * HEADER_BYTES;
                    let mut tail = self.header(p)?;
                    tail.size = quantity;
                    self.set_header(p, tail)?;
                }
                self.free_pointer = prevp;
                trace!("alloc {} bytes -> {}", size, p + HEADER_BYTES);
                return Ok(p + HEADER_BYTES);
            } else if p == self.free_pointer {
                // wrapped around: grow the heap, then keep scanning
                match self.get_mem(quantity)? {
                    Some(np) => p = np,
                    None => return Err(VmError::PoolExhausted),
                }
            }
            prevp = p;
            p = self.header(p)?.next;
            if p == 0 {
                return Err(VmError::InvalidState("free list corrupted".into()));
            }
        }
    }

    pub(crate) fn free_raw(&mut self, ptr: VirtAddr) -> Result<()> {
        self.ensure_started()?;
        if ptr == 0 {
            return Ok(());
        }
        if ptr < START_OFFSET + HEADER_BYTES || ptr >= self.pool_free_pos {
            return Err(VmError::InvalidAddress(ptr));
        }
        self.do_free(ptr)
    }

    /// Inserts the block at its sorted position in the circular free list
    /// and merges it with contiguous neighbors.
    fn do_free(&mut self, ptr: VirtAddr) -> Result<()> {
        let hdrptr = ptr - HEADER_BYTES;
        let mut blockh = self.header(hdrptr)?;
        #[cfg(feature = "stats")]
        {
            self.stats.mem_used = self
                .stats
                .mem_used
                .saturating_sub(blockh.size * HEADER_BYTES);
        }

        // find the insertion point (list is sorted by ascending address)
        let mut p = self.free_pointer;
        let mut curh = self.header(p)?;
        while !(hdrptr > p && hdrptr < curh.next) {
            // at the wrap-around link a higher address points to a lower
            // one; the block belongs between them if it is beyond either end
            if p >= curh.next && (hdrptr > p || hdrptr < curh.next) {
                break;
            }
            p = curh.next;
            curh = self.header(p)?;
        }

        let mut prevh = curh;

        // merge with the higher neighbor
        if hdrptr + blockh.size * HEADER_BYTES == prevh.next {
            let nexth = self.header(prevh.next)?;
            blockh.size += nexth.size;
            blockh.next = nexth.next;
        } else {
            blockh.next = prevh.next;
        }
        self.set_header(hdrptr, blockh)?;

        // merge with the lower neighbor
        if p + prevh.size * HEADER_BYTES == hdrptr {
            prevh.size += blockh.size;
            prevh.next = blockh.next;
        } else {
            prevh.next = hdrptr;
        }
        self.set_header(p, prevh)?;

        self.free_pointer = p;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::small_alloc;
    use super::*;

    #[test]
    fn header_bytes_roundtrip() {
        let h = MemHeader {
            next: 0xDEAD_BEEF,
            size: 42,
        };
        assert_eq!(MemHeader::from_bytes(h.to_bytes()), h);
    }

    #[test]
    fn first_block_splits_off_the_tail_of_the_floor_block() {
        let alloc = small_alloc(32 * 1024);
        let p = alloc.alloc_raw(4).unwrap();
        // the heap carves a MIN_ALLOC_UNITS block at the pool start and the
        // 2-unit allocation comes off its tail
        let floor_start = START_OFFSET + HEADER_BYTES;
        assert_eq!(
            p,
            floor_start + (MIN_ALLOC_UNITS - 2) * HEADER_BYTES + HEADER_BYTES
        );
        assert_eq!(alloc.pool_used(), floor_start + MIN_ALLOC_UNITS * HEADER_BYTES);
    }

    #[test]
    fn free_then_alloc_reuses_block() {
        let alloc = small_alloc(32 * 1024);
        let p = alloc.alloc_raw(100).unwrap();
        alloc.free_raw(p).unwrap();
        let p2 = alloc.alloc_raw(100).unwrap();
        assert_eq!(p2, p);
    }

    #[test]
    fn neighbors_coalesce() {
        let alloc = small_alloc(32 * 1024);
        let a = alloc.alloc_raw(128).unwrap();
        let b = alloc.alloc_raw(128).unwrap();
        let c = alloc.alloc_raw(128).unwrap();
        let _keep = alloc.alloc_raw(128).unwrap();

        alloc.free_raw(a).unwrap();
        alloc.free_raw(c).unwrap();
        assert_eq!(alloc.debug_free_list().unwrap().len(), 2);
        alloc.free_raw(b).unwrap();
        // a, b and c are contiguous: one merged block remains
        let free = alloc.debug_free_list().unwrap();
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].0, a - HEADER_BYTES);
        assert_eq!(free[0].1, 3 * (128 + HEADER_BYTES as u32));
    }

    #[test]
    fn pool_watermark_is_stable_under_churn() {
        let alloc = small_alloc(32 * 1024);
        let p = alloc.alloc_raw(60).unwrap();
        alloc.free_raw(p).unwrap();
        let mark = alloc.pool_used();
        for _ in 0..100 {
            let p = alloc.alloc_raw(60).unwrap();
            alloc.free_raw(p).unwrap();
        }
        assert_eq!(alloc.pool_used(), mark);
    }

    #[test]
    fn exhaustion_is_reported() {
        let alloc = small_alloc(2048);
        let mut last = Ok(0);
        for _ in 0..64 {
            last = alloc.alloc_raw(128);
            if last.is_err() {
                break;
            }
        }
        assert!(matches!(last, Err(VmError::PoolExhausted)));
    }

    #[test]
    fn freeing_null_is_a_noop_and_bad_addresses_error() {
        let alloc = small_alloc(32 * 1024);
        alloc.free_raw(0).unwrap();
        assert!(matches!(
            alloc.free_raw(3),
            Err(VmError::InvalidAddress(3))
        ));
        assert!(alloc.free_raw(31 * 1024).is_err()); // beyond the watermark
    }

    #[cfg(feature = "stats")]
    #[test]
    fn mem_used_balances_out() {
        let alloc = small_alloc(32 * 1024);
        let p = alloc.alloc_raw(500).unwrap();
        let used = alloc.stats().mem_used;
        assert!(used >= 500);
        alloc.free_raw(p).unwrap();
        assert_eq!(alloc.stats().mem_used, 0);
        assert_eq!(alloc.stats().max_mem_used, used);
    }
}
