//! Demand paging over the big tier.
//!
//! Only big pages carry pass-through reads and writes; small and medium
//! pages exist solely for locks. The raw-pointer plumbing in this module
//! relies on two facts: every page buffer is a distinct heap region owned by
//! the allocator, and no routine here ever writes a buffer it is reading
//! from (locked pages are never on the free ring that these loops walk).

use std::ptr;

use log::trace;

use super::{Inner, BIG};
use crate::backend::Backend;
use crate::error::{Result, VmError};
use crate::{VirtAddr, VirtSize};

/// After this many rejections in favor of clean pages, a dirty page is
/// evicted anyway.
pub(crate) const PAGE_MAX_CLEAN_SKIPS: u8 = 5;

/// Ranked outcome of the big-page scan in [`Inner::pull_raw`]; earlier
/// variants are strictly better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum PullState {
    GotFull,
    GotPartial,
    GotEmpty,
    GotClean,
    GotDirty,
    GotNone,
}

impl<B: Backend> Inner<B> {
    /// Writes a big page back to the backend if dirty.
    pub(crate) fn sync_big_page(&mut self, index: usize) -> Result<()> {
        let (start, dirty) = {
            let s = &self.tiers[BIG].slots[index];
            (s.start, s.dirty)
        };
        debug_assert_ne!(start, 0);
        if !dirty {
            return Ok(());
        }
        let wrsize = (self.pool_size - start).min(self.tiers[BIG].page_size as VirtSize) as usize;
        {
            let Inner {
                ref mut backend,
                ref tiers,
                ..
            } = *self;
            backend.write(start, &tiers[BIG].slot_bytes(index)[..wrsize])?;
        }
        let slot = &mut self.tiers[BIG].slots[index];
        slot.dirty = false;
        slot.clean_skips = 0;
        #[cfg(feature = "stats")]
        {
            self.stats.page_writes += 1;
            self.stats.bytes_written += wrsize as u64;
        }
        trace!("big page {} synced: {} bytes at {}", index, wrsize, start);
        Ok(())
    }

    /// Reads `[p, p + size)` into `dest`, sourcing resident big pages first
    /// and the backend for whatever remains.
    ///
    /// # Safety
    ///
    /// `dest` must be valid for `size` writes and must not alias any big
    /// page currently on the free ring.
    pub(crate) unsafe fn copy_raw_data(
        &mut self,
        dest: *mut u8,
        p: VirtAddr,
        size: VirtSize,
    ) -> Result<()> {
        let mut dest = dest;
        let mut p = p;
        let mut size = size;
        let page_size = self.tiers[BIG].page_size as VirtSize;

        // A big page is never smaller than any request passed here, so at
        // most two pages overlap the range.
        let mut i = self.tiers[BIG].free_head;
        while i != -1 && size != 0 {
            let iu = i as usize;
            let (start, len, next) = {
                let s = &self.tiers[BIG].slots[iu];
                (s.start, s.len as VirtSize, s.next)
            };
            if start != 0 {
                let pageend = start + page_size;
                if p >= start && p < pageend {
                    let offset = p - start;
                    let copysize = size.min(len - offset);
                    ptr::copy_nonoverlapping(
                        self.tiers[BIG].slot_ptr(iu).add(offset as usize),
                        dest,
                        copysize as usize,
                    );
                    dest = dest.add(copysize as usize);
                    p += copysize;
                    size -= copysize;
                } else if p < start && p + size > start {
                    let offset = start - p;
                    let copysize = (size - offset).min(len);
                    ptr::copy_nonoverlapping(
                        self.tiers[BIG].slot_ptr(iu),
                        dest.add(offset as usize),
                        copysize as usize,
                    );
                    size = offset;
                }
            }
            i = next;
        }

        if size > 0 {
            let slice = std::slice::from_raw_parts_mut(dest, size as usize);
            self.backend.read(p, slice)?;
            #[cfg(feature = "stats")]
            {
                self.stats.bytes_read += size as u64;
            }
        }
        Ok(())
    }

    /// Reverse of [`copy_raw_data`](Self::copy_raw_data): pushes `[p,
    /// p + size)` from `src` out, updating overlapping resident big pages
    /// in place (marking them dirty only when the bytes actually change)
    /// and writing the remainder straight to the backend.
    ///
    /// # Safety
    ///
    /// `src` must be valid for `size` reads and must not alias any big page
    /// currently on the free ring.
    pub(crate) unsafe fn save_raw_data(
        &mut self,
        src: *const u8,
        p: VirtAddr,
        size: VirtSize,
    ) -> Result<()> {
        let mut src = src;
        let mut p = p;
        let mut size = size;
        let page_size = self.tiers[BIG].page_size as VirtSize;

        let mut i = self.tiers[BIG].free_head;
        while i != -1 && size != 0 {
            let iu = i as usize;
            let (start, len, dirty, next) = {
                let s = &self.tiers[BIG].slots[iu];
                (s.start, s.len as VirtSize, s.dirty, s.next)
            };
            if start != 0 {
                let pageend = start + page_size;
                if p >= start && p < pageend {
                    let offset = p - start;
                    let copysize = size.min(len - offset);
                    let chunk = std::slice::from_raw_parts(src, copysize as usize);
                    let region = &mut self.tiers[BIG].slot_bytes_mut(iu)
                        [offset as usize..(offset + copysize) as usize];
                    if dirty || region != chunk {
                        region.copy_from_slice(chunk);
                        self.tiers[BIG].slots[iu].dirty = true;
                    }
                    src = src.add(copysize as usize);
                    p += copysize;
                    size -= copysize;
                } else if p < start && p + size > start {
                    let offset = start - p;
                    let copysize = (size - offset).min(len);
                    let chunk =
                        std::slice::from_raw_parts(src.add(offset as usize), copysize as usize);
                    let region = &mut self.tiers[BIG].slot_bytes_mut(iu)[..copysize as usize];
                    if dirty || region != chunk {
                        region.copy_from_slice(chunk);
                        self.tiers[BIG].slots[iu].dirty = true;
                    }
                    size = offset;
                }
            }
            i = next;
        }

        if size > 0 {
            let slice = std::slice::from_raw_parts(src, size as usize);
            self.backend.write(p, slice)?;
            #[cfg(feature = "stats")]
            {
                self.stats.bytes_written += size as u64;
            }
        }
        Ok(())
    }

    /// Makes `[p, p + size)` resident in a big page and returns its slot
    /// index. Selection preference, scanning the free ring in order:
    /// a page already containing the range, then a partially overlapping
    /// page (flushed and invalidated), then an empty one, then a clean one
    /// (dirty pages bump their skip counter and win once it saturates),
    /// then the dirty page under the round-robin hand.
    pub(crate) fn pull_raw(
        &mut self,
        p: VirtAddr,
        size: VirtSize,
        read_only: bool,
        force_start: bool,
    ) -> Result<usize> {
        if p == 0 || p >= self.pool_size {
            return Err(VmError::InvalidAddress(p));
        }

        let page_size = self.tiers[BIG].page_size as VirtSize;
        let mut pageindex = self.tiers[BIG].find_free_page(p, size, force_start);
        let mut state = if pageindex != -1 {
            PullState::GotFull
        } else {
            PullState::GotNone
        };

        if state != PullState::GotFull {
            let newpageend = p + page_size;
            let mut i = self.tiers[BIG].free_head;
            while i != -1 {
                let iu = i as usize;
                let start = self.tiers[BIG].slots[iu].start;
                if start != 0 {
                    let pageend = start + page_size;
                    if (p >= start && p < pageend)
                        || (newpageend >= start && newpageend <= pageend)
                    {
                        pageindex = i;
                        self.sync_big_page(iu)?;
                        self.tiers[BIG].slots[iu].start = 0; // invalidate
                        state = PullState::GotPartial;
                    }
                } else if state != PullState::GotPartial {
                    pageindex = i;
                    state = PullState::GotEmpty;
                }

                if state > PullState::GotClean {
                    let slot = &mut self.tiers[BIG].slots[iu];
                    let take_as_clean = if !slot.dirty {
                        true
                    } else {
                        slot.clean_skips += 1;
                        slot.clean_skips >= PAGE_MAX_CLEAN_SKIPS
                    };
                    if take_as_clean {
                        pageindex = i;
                        state = PullState::GotClean;
                    } else if state != PullState::GotDirty && i == self.next_page_to_swap {
                        pageindex = i;
                        state = PullState::GotDirty;
                    }
                }

                i = self.tiers[BIG].slots[iu].next;
            }
        }

        if pageindex == -1 {
            // all big pages pinned by locks; unreachable through the public
            // paths, which never lock every big page at once
            return Err(VmError::InvalidState("no big page available".into()));
        }
        let idx = pageindex as usize;

        if state != PullState::GotFull {
            if self.tiers[BIG].slots[idx].start != 0 {
                self.sync_big_page(idx)?;
            }

            if state == PullState::GotDirty {
                self.next_page_to_swap = self.tiers[BIG].slots[idx].next;
                if self.next_page_to_swap == -1 {
                    self.next_page_to_swap = self.tiers[BIG].free_head;
                }
            } else {
                self.next_page_to_swap = self.tiers[BIG].free_head;
            }

            self.tiers[BIG].slots[idx].start = p;
            let rdsize = (self.pool_size - p).min(page_size) as usize;
            {
                let Inner {
                    ref mut backend,
                    ref mut tiers,
                    ..
                } = *self;
                backend.read(p, &mut tiers[BIG].slot_bytes_mut(idx)[..rdsize])?;
            }
            #[cfg(feature = "stats")]
            {
                self.stats.page_reads += 1;
                self.stats.bytes_read += rdsize as u64;
            }
            trace!("big page {} loaded: {:?} at {}", idx, state, p);
        }

        if !read_only {
            self.tiers[BIG].slots[idx].dirty = true;
        }

        debug_assert!(p >= self.tiers[BIG].slots[idx].start);
        Ok(idx)
    }

    /// Pointer to `addr` inside a resident big page slot.
    pub(crate) fn big_slot_ptr(&mut self, index: usize, addr: VirtAddr) -> *mut u8 {
        let start = self.tiers[BIG].slots[index].start;
        debug_assert!(addr >= start);
        unsafe { self.tiers[BIG].slot_ptr_mut(index).add((addr - start) as usize) }
    }

    /// Pulls the range writable and copies `size` bytes from `d` into it.
    ///
    /// # Safety
    ///
    /// `d` must be valid for `size` reads and must not point into a big
    /// page on the free ring.
    pub(crate) unsafe fn push_raw(
        &mut self,
        p: VirtAddr,
        d: *const u8,
        size: VirtSize,
    ) -> Result<()> {
        let idx = self.pull_raw(p, size, false, false)?;
        let dst = self.big_slot_ptr(idx, p);
        ptr::copy_nonoverlapping(d, dst, size as usize);
        Ok(())
    }

    /// Serves a read of at most one big page, preferring locked pages: a
    /// locked page fully containing the range answers directly; partial
    /// overlaps are first mirrored out so a contiguous big page can serve
    /// the request.
    pub(crate) fn read_raw(&mut self, p: VirtAddr, size: VirtSize) -> Result<*const u8> {
        if p == 0 || p >= self.pool_size {
            return Err(VmError::InvalidAddress(p));
        }
        let pend = p + size;

        for tier in 0..3 {
            let mut i = self.tiers[tier].locked_head;
            while i != -1 {
                let iu = i as usize;
                let (start, len, next) = {
                    let s = &self.tiers[tier].slots[iu];
                    (s.start, s.len as VirtSize, s.next)
                };
                let begin_overlaps = p >= start && p < start + len;
                let end_overlaps = p < start && pend > start;

                if begin_overlaps {
                    let offset = p - start;
                    if offset + size <= len {
                        return Ok(unsafe {
                            self.tiers[tier].slot_ptr(iu).add(offset as usize)
                        });
                    }
                }

                if begin_overlaps || end_overlaps {
                    // only a partial fit: mirror the locked bytes into
                    // paged memory so one big page can return the range
                    let src = self.tiers[tier].slot_ptr(iu);
                    unsafe { self.push_raw(start, src, len)? };
                }

                i = next;
            }
        }

        let idx = self.pull_raw(p, size, true, false)?;
        Ok(self.big_slot_ptr(idx, p) as *const u8)
    }

    /// Serves a write of at most one big page. Overlapping locked pages
    /// take the bytes directly (and become dirty); anything not fully
    /// covered also goes through the big-page path.
    ///
    /// # Safety
    ///
    /// `d` must be valid for `size` reads and must not point into any page
    /// buffer of this allocator.
    pub(crate) unsafe fn write_raw(
        &mut self,
        p: VirtAddr,
        d: *const u8,
        size: VirtSize,
    ) -> Result<()> {
        if p == 0 || p >= self.pool_size {
            return Err(VmError::InvalidAddress(p));
        }
        let pend = p + size;

        for tier in 0..3 {
            let mut i = self.tiers[tier].locked_head;
            while i != -1 {
                let iu = i as usize;
                let (start, len, next) = {
                    let s = &self.tiers[tier].slots[iu];
                    (s.start, s.len as VirtSize, s.next)
                };
                let begin_overlaps = p >= start && p < start + len;
                let end_overlaps = p < start && pend > start;

                if (begin_overlaps || end_overlaps) && !self.tiers[tier].slots[iu].dirty {
                    self.tiers[tier].slots[iu].dirty = true;
                }

                if begin_overlaps {
                    let offset = p - start;
                    if offset + size <= len {
                        ptr::copy_nonoverlapping(
                            d,
                            self.tiers[tier].slot_ptr_mut(iu).add(offset as usize),
                            size as usize,
                        );
                        return Ok(());
                    }
                    // data runs past the page: copy the part that fits
                    ptr::copy_nonoverlapping(
                        d,
                        self.tiers[tier].slot_ptr_mut(iu).add(offset as usize),
                        (len - offset) as usize,
                    );
                } else if end_overlaps {
                    // data starts before the page: copy the tail that fits
                    let offset = start - p;
                    ptr::copy_nonoverlapping(
                        d.add(offset as usize),
                        self.tiers[tier].slot_ptr_mut(iu),
                        (size - offset) as usize,
                    );
                }

                i = next;
            }
        }

        // not, or only partially, covered by locks
        self.push_raw(p, d, size)
    }

    /// Writes back every dirty unlocked big page, leaving them resident.
    pub(crate) fn flush_pages(&mut self) -> Result<()> {
        let mut i = self.tiers[BIG].free_head;
        while i != -1 {
            let iu = i as usize;
            if self.tiers[BIG].slots[iu].start != 0 {
                self.sync_big_page(iu)?;
            }
            i = self.tiers[BIG].slots[iu].next;
        }
        Ok(())
    }

    /// Flush plus invalidation: every unlocked big page forgets its span so
    /// the next access reloads from the backend.
    pub(crate) fn clear_all_pages(&mut self) -> Result<()> {
        let mut i = self.tiers[BIG].free_head;
        while i != -1 {
            let iu = i as usize;
            if self.tiers[BIG].slots[iu].start != 0 {
                self.sync_big_page(iu)?;
                self.tiers[BIG].slots[iu].start = 0;
            }
            i = self.tiers[BIG].slots[iu].next;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::small_alloc;
    use super::*;

    // the test allocator has 4 big pages of 1024 bytes

    #[test]
    fn resident_page_serves_repeat_reads() {
        let alloc = small_alloc(32 * 1024);
        let mut b = [0u8; 4];
        alloc.read(16, &mut b).unwrap();
        #[cfg(feature = "stats")]
        let before = alloc.stats().page_reads;
        alloc.read(500, &mut b).unwrap(); // same page
        #[cfg(feature = "stats")]
        assert_eq!(alloc.stats().page_reads, before);
    }

    #[cfg(feature = "stats")]
    #[test]
    fn distinct_pages_fault_individually() {
        let alloc = small_alloc(32 * 1024);
        let mut b = [0u8; 1];
        for k in 0..4u32 {
            alloc.read(16 + k * 1024, &mut b).unwrap();
        }
        assert_eq!(alloc.stats().page_reads, 4);
    }

    #[cfg(feature = "stats")]
    #[test]
    fn read_at_pool_tail_costs_one_backend_read() {
        let alloc = small_alloc(32 * 1024);
        let mut b = vec![0u8; 1024];
        alloc.read(32 * 1024 - 1024, &mut b).unwrap();
        assert_eq!(alloc.stats().page_reads, 1);
        assert_eq!(alloc.stats().bytes_read, 1024);
    }

    #[test]
    fn write_read_without_flush() {
        let alloc = small_alloc(32 * 1024);
        alloc.write(2000, b"abcd").unwrap();
        let mut out = [0u8; 4];
        alloc.read(2000, &mut out).unwrap();
        assert_eq!(&out, b"abcd");
        // nothing reached the backend yet
        alloc.with_backend(|b| assert_eq!(&b.as_bytes()[2000..2004], &[0; 4]));
    }

    #[test]
    fn clear_pages_forces_reload_of_synced_data() {
        let alloc = small_alloc(32 * 1024);
        alloc.write(3000, &[7; 100]).unwrap();
        alloc.clear_pages().unwrap();
        assert_eq!(alloc.free_big_pages(), 4);
        let mut out = [0u8; 100];
        alloc.read(3000, &mut out).unwrap();
        assert_eq!(out, [7; 100]);
    }

    #[cfg(feature = "stats")]
    #[test]
    fn read_only_traffic_never_writes_back() {
        let alloc = small_alloc(32 * 1024);
        let mut b = [0u8; 1];
        for k in 0..32u32 {
            alloc.read(16 + k * 1000, &mut b).unwrap();
        }
        assert_eq!(alloc.stats().page_writes, 0);
    }

    #[cfg(feature = "stats")]
    #[test]
    fn all_dirty_working_set_forces_one_write_back_per_fault() {
        let alloc = small_alloc(32 * 1024);
        // every access dirties its page, so from the fifth on each fault
        // must evict exactly one dirty page
        for k in 0..16u32 {
            alloc.write(16 + k * 1024, &[k as u8]).unwrap();
        }
        assert_eq!(alloc.stats().page_writes, 12);
        // written-back strides read back intact
        for k in 0..16u32 {
            let mut b = [0u8; 1];
            alloc.read(16 + k * 1024, &mut b).unwrap();
            assert_eq!(b[0], k as u8);
        }
    }
}
