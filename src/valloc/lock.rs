//! Lock management: pinning virtual spans into page buffers.
//!
//! A data lock resizes or reclaims whatever overlaps the request so the
//! returned buffer covers it exactly; a fitting lock instead shrinks the
//! request around existing locks. At most one locked page anywhere covers
//! any given byte, and a page with outstanding references is never moved,
//! evicted or shrunk by anyone but its own locker.

use std::ptr;

use log::trace;

use super::{Inner, BIG, MEDIUM, NO_PAGE, SMALL};
use crate::backend::Backend;
use crate::error::{Result, VmError};
use crate::{PageSize, VirtAddr, VirtSize};

/// Where a fitting lock landed: tier, slot and the offset of the requested
/// address inside the slot buffer (nonzero when an existing lock was
/// reused).
#[derive(Debug, Clone, Copy)]
pub(crate) struct LockHandle {
    pub tier: usize,
    pub slot: usize,
    pub offset: u16,
    pub len: PageSize,
}

impl<B: Backend> Inner<B> {
    /// Writes a locked page's bytes out through the save path if dirty.
    /// The dirty flag is left as-is; callers reset it where the page is
    /// reused.
    fn sync_locked_page(&mut self, tier: usize, index: usize) -> Result<()> {
        let (start, len, dirty) = {
            let s = &self.tiers[tier].slots[index];
            (s.start, s.len as VirtSize, s.dirty)
        };
        debug_assert_ne!(start, 0);
        if dirty {
            let src = self.tiers[tier].slot_ptr(index);
            unsafe { self.save_raw_data(src, start, len)? };
        }
        Ok(())
    }

    /// Moves a free-ring page of `tier` onto the locked ring. Big-tier
    /// locks go through the pull path first so the data is resident, and a
    /// shrinking lock syncs the full page since the bytes outside the lock
    /// range become unreachable through it.
    fn lock_page(&mut self, tier: usize, ptr: VirtAddr, size: PageSize) -> Result<i8> {
        let index;
        if tier == BIG {
            // read-only here: the caller applies the eventual ro flag
            self.pull_raw(ptr, size as VirtSize, true, true)?;
            index = self.tiers[BIG].find_free_page(ptr, size as VirtSize, true);
            debug_assert_ne!(index, NO_PAGE);
            if size < self.tiers[BIG].page_size {
                self.sync_big_page(index as usize)?;
            }
        } else {
            index = self.tiers[tier].free_head;
            debug_assert_ne!(index, NO_PAGE);
        }

        self.tiers[tier].unlink_free(index);
        if tier == BIG && self.next_page_to_swap == index {
            // locked pages can no longer be swap victims
            self.next_page_to_swap = self.tiers[BIG].free_head;
        }
        self.tiers[tier].push_locked(index);
        Ok(index)
    }

    /// Returns a locked page to the free ring and drops its references.
    /// Small and medium pages write their bytes back through the big tier;
    /// a big page only needs that when it was shrunk, since a full one can
    /// keep serving regular IO. Returns the successor the page had on the
    /// locked ring so ring walks can continue.
    fn free_locked_page(&mut self, tier: usize, index: i8) -> Result<i8> {
        let iu = index as usize;
        if tier != BIG {
            self.sync_locked_page(tier, iu)?;
        } else if self.tiers[BIG].slots[iu].len < self.tiers[BIG].page_size {
            self.sync_locked_page(tier, iu)?;
            // restore as a regular empty page
            self.tiers[BIG].slots[iu].start = 0;
            self.tiers[BIG].slots[iu].len = self.tiers[BIG].page_size;
        }

        let ret = self.tiers[tier].slots[iu].next;
        self.tiers[tier].unlink_locked(index);
        self.tiers[tier].push_free(index);
        if tier == BIG && self.next_page_to_swap == NO_PAGE {
            self.next_page_to_swap = self.tiers[BIG].free_head;
        }
        self.tiers[tier].slots[iu].locks = 0;
        Ok(ret)
    }

    /// Pins `[ptr, ptr + size)` so the whole request is covered by one
    /// page, resolving overlaps with existing locks. Returns tier and slot.
    pub(crate) fn make_data_lock(
        &mut self,
        ptr: VirtAddr,
        mut size: PageSize,
        read_only: bool,
    ) -> Result<(usize, i8)> {
        if ptr == 0 {
            return Err(VmError::InvalidAddress(0));
        }
        if size > self.tiers[BIG].page_size {
            return Err(VmError::InvalidArgument(
                "data lock larger than a big page".into(),
            ));
        }

        // smallest tier whose pages hold the request
        let mut chosen = if size <= self.tiers[SMALL].page_size {
            SMALL
        } else if size <= self.tiers[MEDIUM].page_size {
            MEDIUM
        } else {
            BIG
        };

        let mut sec_tier: Option<usize> = None;
        let mut page_index: i8 = NO_PAGE;
        let mut old_lock: i8 = NO_PAGE;
        let mut sec_old: i8 = NO_PAGE;
        let mut fix_begin_overlap = false;
        let mut shrunk = false;
        let mut done = false;

        for tier in 0..3 {
            if done {
                break;
            }
            let mut i = self.tiers[tier].locked_head;
            while i != NO_PAGE {
                let iu = i as usize;
                let slot = self.tiers[tier].slots[iu];

                if slot.start == ptr {
                    if chosen != tier {
                        if slot.locks == 0 {
                            // previous lock of a different size class; drop it
                            i = self.free_locked_page(tier, i)?;
                            continue;
                        }
                        // still referenced from another tier: adopt it. The
                        // request is clamped when that tier's pages are
                        // smaller (a resized lock may sit in a smaller page).
                        if self.tiers[tier].page_size < self.tiers[chosen].page_size {
                            size = size.min(self.tiers[tier].page_size);
                        }
                        chosen = tier;
                    } else if slot.len > size {
                        debug_assert_eq!(slot.locks, 0);
                        // shrink: write the excess tail out first
                        let src = unsafe { self.tiers[tier].slot_ptr(iu).add(size as usize) };
                        unsafe {
                            self.save_raw_data(
                                src,
                                ptr + size as VirtAddr,
                                (slot.len - size) as VirtSize,
                            )?;
                        }
                        self.tiers[tier].slots[iu].len = size;
                    }

                    page_index = i;
                    if self.tiers[chosen].slots[iu].len == size {
                        done = true;
                        break; // no overlap possible once sizes agree
                    }
                } else {
                    let end_overlaps =
                        ptr < slot.start && ptr + size as VirtAddr > slot.start;
                    let begin_overlaps =
                        ptr > slot.start && ptr < slot.start + slot.len as VirtAddr;

                    if slot.locks > 0 {
                        if end_overlaps {
                            // shrink the request to stop at the other lock
                            size = (slot.start - ptr) as PageSize;
                            shrunk = true;
                        } else if begin_overlaps {
                            fix_begin_overlap = true;
                        }
                    } else {
                        if end_overlaps || begin_overlaps {
                            // unreferenced and in the way; it may never be
                            // used again, so reclaim it now
                            i = self.free_locked_page(tier, i)?;
                            continue;
                        }
                        if old_lock == NO_PAGE {
                            if chosen == tier {
                                old_lock = i;
                            } else if sec_old == NO_PAGE
                                && self.tiers[chosen].page_size < self.tiers[tier].page_size
                            {
                                // fallback from a bigger tier in case the
                                // preferred one has nothing available
                                sec_old = i;
                                sec_tier = Some(tier);
                            }
                        }
                    }
                }

                i = self.tiers[tier].slots[i as usize].next;
            }
        }

        debug_assert!(
            page_index == NO_PAGE
                || size >= self.tiers[chosen].slots[page_index as usize].len
        );
        debug_assert!(page_index == NO_PAGE || !fix_begin_overlap);

        // A shrunk request may now fit a smaller page. Only bother for big
        // pages: they are precious as the only tier carrying regular IO.
        if shrunk
            && size <= self.tiers[MEDIUM].page_size
            && chosen == BIG
            && (page_index == NO_PAGE
                || self.tiers[BIG].slots[page_index as usize].locks == 0)
        {
            let old_chosen = chosen;

            if size <= self.tiers[SMALL].page_size {
                if self.tiers[SMALL].free_head != NO_PAGE {
                    chosen = SMALL;
                } else {
                    let idx = self.tiers[SMALL].find_unused_locked();
                    if idx != NO_PAGE {
                        chosen = SMALL;
                        old_lock = idx;
                    }
                }
            }

            if chosen == old_chosen {
                if self.tiers[MEDIUM].free_head != NO_PAGE {
                    chosen = MEDIUM;
                } else {
                    let idx = self.tiers[MEDIUM].find_unused_locked();
                    if idx != NO_PAGE {
                        chosen = MEDIUM;
                        old_lock = idx;
                    }
                }
            }

            if chosen != old_chosen && page_index != NO_PAGE {
                self.free_locked_page(old_chosen, page_index)?;
                page_index = NO_PAGE;
            }
        }

        if page_index == NO_PAGE {
            // nothing reusable found in the preferred tier? try larger ones
            if self.tiers[chosen].free_head == NO_PAGE && old_lock == NO_PAGE {
                if self.tiers[chosen].page_size < self.tiers[MEDIUM].page_size
                    && self.tiers[MEDIUM].free_head != NO_PAGE
                {
                    chosen = MEDIUM;
                } else if self.tiers[chosen].page_size < self.tiers[BIG].page_size
                    && self.tiers[BIG].free_head != NO_PAGE
                {
                    chosen = BIG;
                }
            }

            let mut copy_offset: PageSize = 0;

            if self.tiers[chosen].free_head != NO_PAGE {
                if chosen == BIG {
                    // already copied by the pull inside lock_page
                    copy_offset = size;
                }
                page_index = self.lock_page(chosen, ptr, size)?;
            } else {
                if old_lock == NO_PAGE && sec_old != NO_PAGE {
                    if let Some(t) = sec_tier {
                        chosen = t;
                        old_lock = sec_old;
                    }
                }
                if old_lock != NO_PAGE {
                    self.sync_locked_page(chosen, old_lock as usize)?;
                    self.tiers[chosen].slots[old_lock as usize].dirty = false;
                    page_index = old_lock;
                } else {
                    return Err(VmError::InvalidState(
                        "no page available for data lock".into(),
                    ));
                }
            }

            if fix_begin_overlap {
                // Older locks running into our start get their overlap copied
                // here (their copy is the freshest) and are then cut short so
                // this lock owns the tail.
                let mut fixed = false;
                for tier in 0..3 {
                    let mut i = self.tiers[tier].locked_head;
                    while i != NO_PAGE {
                        let iu = i as usize;
                        let slot = self.tiers[tier].slots[iu];
                        if (i != page_index || tier != chosen)
                            && ptr > slot.start
                            && ptr < slot.start + slot.len as VirtAddr
                        {
                            debug_assert!(!fixed);
                            let offset_old = (ptr - slot.start) as usize;
                            let copysize =
                                ((slot.len as usize - offset_old) as PageSize).min(size);
                            unsafe {
                                ptr::copy_nonoverlapping(
                                    self.tiers[tier].slot_ptr(iu).add(offset_old),
                                    self.tiers[chosen].slot_ptr_mut(page_index as usize),
                                    copysize as usize,
                                );
                            }
                            // take the max: copy_offset may already be set
                            copy_offset = copy_offset.max(copysize);
                            self.tiers[tier].slots[iu].len = offset_old as PageSize;
                            fixed = true;
                        }
                        i = self.tiers[tier].slots[iu].next;
                    }
                }
            }

            if copy_offset < size {
                let dst = unsafe {
                    self.tiers[chosen]
                        .slot_ptr_mut(page_index as usize)
                        .add(copy_offset as usize)
                };
                unsafe {
                    self.copy_raw_data(
                        dst,
                        ptr + copy_offset as VirtAddr,
                        (size - copy_offset) as VirtSize,
                    )?;
                }
            }

            self.tiers[chosen].slots[page_index as usize].start = ptr;
        } else {
            // the request grew: either this page held a smaller type before
            // or an overlapping lock has since gone away
            let cur = self.tiers[chosen].slots[page_index as usize].len;
            if size > cur {
                let dst = unsafe {
                    self.tiers[chosen]
                        .slot_ptr_mut(page_index as usize)
                        .add(cur as usize)
                };
                unsafe {
                    self.copy_raw_data(
                        dst,
                        ptr + cur as VirtAddr,
                        (size - cur) as VirtSize,
                    )?;
                }
            }
        }

        let slot = &mut self.tiers[chosen].slots[page_index as usize];
        if !slot.dirty {
            slot.dirty = !read_only;
        }
        slot.locks += 1;
        slot.len = size;
        debug_assert!(size <= self.tiers[chosen].page_size);
        trace!(
            "data lock at {}: tier {} slot {} size {}",
            ptr,
            chosen,
            page_index,
            size
        );
        Ok((chosen, page_index))
    }

    /// Pins as much of `[ptr, ptr + size)` as fits without disturbing any
    /// referenced lock. An address inside an existing lock reuses it at an
    /// interior offset; otherwise the request shrinks to stop short of the
    /// next lock.
    pub(crate) fn make_fitting_lock(
        &mut self,
        ptr: VirtAddr,
        mut size: PageSize,
        read_only: bool,
    ) -> Result<LockHandle> {
        if ptr == 0 {
            return Err(VmError::InvalidAddress(0));
        }
        size = size.min(self.tiers[BIG].page_size);

        let mut unused: [i8; 3] = [NO_PAGE; 3];
        let mut found_tier: Option<usize> = None;
        let mut page_index: i8 = NO_PAGE;

        'scan: for tier in 0..3 {
            let mut i = self.tiers[tier].locked_head;
            while i != NO_PAGE {
                let iu = i as usize;
                let slot = self.tiers[tier].slots[iu];

                if ptr >= slot.start && ptr < slot.start + slot.len as VirtAddr {
                    found_tier = Some(tier);
                    page_index = i;
                    break 'scan;
                }

                if ptr < slot.start && ptr + size as VirtAddr > slot.start {
                    if slot.locks == 0 {
                        // in the way and unreferenced; reclaim
                        i = self.free_locked_page(tier, i)?;
                        continue;
                    }
                    // shrink to avoid the overlap
                    size = (slot.start - ptr) as PageSize;
                }

                if slot.locks == 0 && unused[tier] == NO_PAGE {
                    unused[tier] = i;
                }

                i = self.tiers[tier].slots[iu].next;
            }
        }

        let mut offset: VirtAddr = 0;
        let tier;

        match found_tier {
            None => {
                // no lock covers the address; take the roomiest tier with a
                // page to spare, falling back to a smaller-than-requested one
                let mut fitting: Option<usize> = None;
                let mut smaller: Option<usize> = None;
                for t in 0..3 {
                    if self.tiers[t].free_head != NO_PAGE || unused[t] != NO_PAGE {
                        if size <= self.tiers[t].page_size {
                            fitting = Some(t);
                        } else {
                            smaller = Some(t);
                        }
                    }
                }
                let t = match (fitting, smaller) {
                    (Some(t), _) => t,
                    (None, Some(t)) => {
                        size = self.tiers[t].page_size;
                        t
                    }
                    (None, None) => {
                        return Err(VmError::InvalidState(
                            "no page available for fitting lock".into(),
                        ))
                    }
                };

                let mut sync_pool = true;
                if self.tiers[t].free_head != NO_PAGE {
                    page_index = self.lock_page(t, ptr, size)?;
                    // big pages already hold the data after lock_page
                    sync_pool = t != BIG;
                } else {
                    page_index = unused[t];
                    self.sync_locked_page(t, page_index as usize)?;
                    self.tiers[t].slots[page_index as usize].dirty = false;
                }

                if sync_pool {
                    let dst = self.tiers[t].slot_ptr_mut(page_index as usize);
                    unsafe { self.copy_raw_data(dst, ptr, size as VirtSize)? };
                }

                self.tiers[t].slots[page_index as usize].start = ptr;
                self.tiers[t].slots[page_index as usize].len = size;
                tier = t;
            }
            Some(t) => {
                // reuse: the lock may start before the requested address
                let slot = &self.tiers[t].slots[page_index as usize];
                offset = ptr - slot.start;
                size = size.min((slot.len as VirtAddr - offset) as PageSize);
                tier = t;
            }
        }

        let slot = &mut self.tiers[tier].slots[page_index as usize];
        slot.locks += 1;
        if !slot.dirty {
            slot.dirty = !read_only;
        }
        trace!(
            "fitting lock at {}: tier {} slot {} offset {} size {}",
            ptr,
            tier,
            page_index,
            offset,
            size
        );
        Ok(LockHandle {
            tier,
            slot: page_index as usize,
            offset: offset as u16,
            len: size,
        })
    }

    /// Drops one reference from the lock covering `ptr`. A big page whose
    /// last reference goes away returns to the free ring so it can serve
    /// regular IO again.
    pub(crate) fn release_lock(&mut self, ptr: VirtAddr) -> Result<()> {
        let mut found: Option<(usize, i8)> = None;
        for tier in 0..3 {
            let i = self.tiers[tier].find_locked(ptr);
            if i != NO_PAGE {
                found = Some((tier, i));
                break;
            }
        }
        let (tier, index) = found.ok_or(VmError::LockMismatch(ptr))?;
        let slot = &mut self.tiers[tier].slots[index as usize];
        if slot.locks == 0 {
            return Err(VmError::LockMismatch(ptr));
        }
        slot.locks -= 1;
        if slot.locks == 0 && tier == BIG {
            self.free_locked_page(BIG, index)?;
        }
        trace!("lock released at {}", ptr);
        Ok(())
    }
}
