//! The paging allocator: a three-tier page cache over a block backend, a
//! first-fit heap living inside the virtual address space, and the lock
//! protocol that pins virtual spans into page buffers.

mod cache;
mod freelist;
mod lock;
mod tier;

pub(crate) use freelist::{MemHeader, BASE_ADDR, HEADER_BYTES, MIN_ALLOC_UNITS, START_OFFSET};
pub(crate) use lock::LockHandle;
pub(crate) use tier::{PageTier, BUF_ALIGN, NO_PAGE};

use std::cell::{Ref, RefCell, RefMut};
use std::ptr;

use log::{info, warn};

use crate::backend::Backend;
use crate::config::AllocConfig;
use crate::error::{Result, VmError};
use crate::vptr::{Pod, VPtr};
use crate::{PageSize, VirtAddr, VirtSize};

pub(crate) const SMALL: usize = 0;
pub(crate) const MEDIUM: usize = 1;
pub(crate) const BIG: usize = 2;

/// Selects one of the three page tiers in introspection calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierKind {
    Small,
    Medium,
    Big,
}

impl TierKind {
    fn index(self) -> usize {
        match self {
            TierKind::Small => SMALL,
            TierKind::Medium => MEDIUM,
            TierKind::Big => BIG,
        }
    }
}

/// Swap and usage counters, available with the `stats` feature.
#[cfg(feature = "stats")]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocStats {
    /// Bytes currently held by heap allocations (headers included).
    pub mem_used: VirtSize,
    /// High-water mark of `mem_used`.
    pub max_mem_used: VirtSize,
    /// Big pages loaded from the backend.
    pub page_reads: u64,
    /// Big pages written back to the backend.
    pub page_writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

pub(crate) struct Inner<B: Backend> {
    pub(crate) backend: B,
    pub(crate) pool_size: VirtSize,
    pub(crate) tiers: [PageTier; 3],
    pub(crate) base_free_list: MemHeader,
    pub(crate) free_pointer: VirtAddr,
    pub(crate) pool_free_pos: VirtAddr,
    pub(crate) next_page_to_swap: i8,
    pub(crate) started: bool,
    #[cfg(feature = "stats")]
    pub(crate) stats: AllocStats,
}

impl<B: Backend> Inner<B> {
    pub(crate) fn ensure_started(&self) -> Result<()> {
        if self.started {
            Ok(())
        } else {
            Err(VmError::InvalidState("allocator not started".into()))
        }
    }

    fn check_span(&self, addr: VirtAddr, len: usize) -> Result<()> {
        if addr == 0 {
            return Err(VmError::InvalidAddress(0));
        }
        let end = (addr as u64) + len as u64;
        if end > self.pool_size as u64 {
            return Err(VmError::InvalidAddress(addr));
        }
        Ok(())
    }
}

/// A virtual memory allocator over a block backend.
///
/// All state sits behind a `RefCell`: the allocator is strictly
/// single-threaded and hands out lock guards that need to re-enter it, so
/// methods take `&self` and the exclusive-access rule is enforced at
/// runtime per call.
pub struct VAlloc<B: Backend> {
    inner: RefCell<Inner<B>>,
}

impl<B: Backend> VAlloc<B> {
    /// Builds an inert allocator; nothing touches the backend until
    /// [`start`](Self::start).
    pub fn new(backend: B, config: AllocConfig) -> Result<Self> {
        config.validate()?;
        let tiers = [
            PageTier::new(config.small_page_count, config.small_page_size),
            PageTier::new(config.medium_page_count, config.medium_page_size),
            PageTier::new(config.big_page_count, config.big_page_size),
        ];
        Ok(Self {
            inner: RefCell::new(Inner {
                backend,
                pool_size: config.pool_size,
                tiers,
                base_free_list: MemHeader::default(),
                free_pointer: 0,
                pool_free_pos: 0,
                next_page_to_swap: 0,
                started: false,
                #[cfg(feature = "stats")]
                stats: AllocStats::default(),
            }),
        })
    }

    /// Convenience constructor with the default page layout.
    pub fn with_pool_size(backend: B, pool_size: VirtSize) -> Result<Self> {
        Self::new(backend, AllocConfig::with_pool_size(pool_size))
    }

    /// Starts the backend and initializes the free list and page rings. The
    /// backend may enlarge the pool; the effective size is kept.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.started {
            return Err(VmError::InvalidState("allocator already started".into()));
        }
        inner.free_pointer = 0;
        inner.next_page_to_swap = 0;
        inner.base_free_list = MemHeader::default();
        inner.pool_free_pos = START_OFFSET + HEADER_BYTES;
        #[cfg(feature = "stats")]
        {
            inner.stats = AllocStats::default();
        }
        for t in 0..3 {
            inner.tiers[t].reset(t == BIG);
        }
        let requested = inner.pool_size;
        let actual = inner.backend.start(requested)?;
        inner.pool_size = actual.max(requested);
        inner.started = true;
        info!(
            "allocator started: pool {} bytes, pages {}x{}/{}x{}/{}x{}",
            inner.pool_size,
            inner.tiers[SMALL].count(),
            inner.tiers[SMALL].page_size,
            inner.tiers[MEDIUM].count(),
            inner.tiers[MEDIUM].page_size,
            inner.tiers[BIG].count(),
            inner.tiers[BIG].page_size,
        );
        Ok(())
    }

    /// Writes back every dirty big page, then quiesces the backend. A
    /// stopped allocator can be started again.
    pub fn stop(&self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if !inner.started {
            return Ok(());
        }
        inner.flush_pages()?;
        inner.backend.stop()?;
        inner.started = false;
        info!("allocator stopped");
        Ok(())
    }

    pub fn pool_size(&self) -> VirtSize {
        self.inner.borrow().pool_size
    }

    /// High-water mark of raw pool consumption by the heap.
    pub fn pool_used(&self) -> VirtSize {
        self.inner.borrow().pool_free_pos
    }

    pub fn page_count(&self, tier: TierKind) -> u8 {
        self.inner.borrow().tiers[tier.index()].count()
    }

    pub fn page_size(&self, tier: TierKind) -> PageSize {
        self.inner.borrow().tiers[tier.index()].page_size
    }

    /// Pages of `tier` currently not pinned by any lock.
    pub fn unlocked_pages(&self, tier: TierKind) -> u8 {
        self.inner.borrow().tiers[tier.index()].unlocked_count()
    }

    /// Big pages holding no pool span at all.
    pub fn free_big_pages(&self) -> u8 {
        self.inner.borrow().tiers[BIG].empty_free_count()
    }

    /// Allocates `size` bytes from the virtual heap.
    pub fn alloc_raw(&self, size: VirtSize) -> Result<VirtAddr> {
        self.inner.borrow_mut().alloc_raw(size)
    }

    /// Returns a heap block to the free list, coalescing with its
    /// neighbors. Freeing the null address is a no-op.
    pub fn free_raw(&self, addr: VirtAddr) -> Result<()> {
        self.inner.borrow_mut().free_raw(addr)
    }

    /// Copies `dst.len()` bytes out of virtual memory, honoring any locked
    /// pages that cover parts of the range.
    pub fn read(&self, addr: VirtAddr, dst: &mut [u8]) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.ensure_started()?;
        inner.check_span(addr, dst.len())?;
        let chunk_max = inner.tiers[BIG].page_size as usize;
        let mut off = 0;
        while off < dst.len() {
            let n = chunk_max.min(dst.len() - off);
            let src = inner.read_raw(addr + off as VirtAddr, n as VirtSize)?;
            unsafe { ptr::copy_nonoverlapping(src, dst[off..].as_mut_ptr(), n) };
            off += n;
        }
        Ok(())
    }

    /// Copies `src` into virtual memory, updating any locked pages that
    /// cover parts of the range.
    pub fn write(&self, addr: VirtAddr, src: &[u8]) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.ensure_started()?;
        inner.check_span(addr, src.len())?;
        let chunk_max = inner.tiers[BIG].page_size as usize;
        let mut off = 0;
        while off < src.len() {
            let n = chunk_max.min(src.len() - off);
            unsafe {
                inner.write_raw(addr + off as VirtAddr, src[off..].as_ptr(), n as VirtSize)?;
            }
            off += n;
        }
        Ok(())
    }

    /// Writes back every dirty big page, leaving them resident.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.ensure_started()?;
        inner.flush_pages()
    }

    /// Flushes and additionally invalidates all unlocked big pages so
    /// subsequent accesses reload from the backend. Locked pages are left
    /// alone, unflushed.
    pub fn clear_pages(&self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.ensure_started()?;
        inner.clear_all_pages()
    }

    /// Pins `[addr, addr + size)` into a page buffer, resizing or reusing
    /// overlapping locks so the whole request is covered. The returned
    /// pointer stays valid until [`release_lock`](Self::release_lock); it
    /// must not be dereferenced across other allocator calls that write the
    /// same range.
    pub fn make_data_lock(
        &self,
        addr: VirtAddr,
        size: PageSize,
        read_only: bool,
    ) -> Result<*mut u8> {
        let mut inner = self.inner.borrow_mut();
        inner.ensure_started()?;
        let (tier, slot) = inner.make_data_lock(addr, size, read_only)?;
        Ok(inner.tiers[tier].slot_ptr_mut(slot as usize))
    }

    /// Pins as much of `[addr, addr + size)` as fits without disturbing
    /// existing locks; returns the pointer and the actual locked length,
    /// which may be smaller than requested.
    pub fn make_fitting_lock(
        &self,
        addr: VirtAddr,
        size: PageSize,
        read_only: bool,
    ) -> Result<(*mut u8, PageSize)> {
        let mut inner = self.inner.borrow_mut();
        inner.ensure_started()?;
        let h = inner.make_fitting_lock(addr, size, read_only)?;
        let ptr = unsafe { inner.tiers[h.tier].slot_ptr_mut(h.slot).add(h.offset as usize) };
        Ok((ptr, h.len))
    }

    /// Releases one lock covering `addr`.
    pub fn release_lock(&self, addr: VirtAddr) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.ensure_started()?;
        inner.release_lock(addr)
    }

    /// Walks the free list; returns `(address, size in bytes)` pairs,
    /// sentinel excluded.
    pub fn debug_free_list(&self) -> Result<Vec<(VirtAddr, VirtSize)>> {
        let mut inner = self.inner.borrow_mut();
        inner.ensure_started()?;
        let mut out = Vec::new();
        if inner.free_pointer == 0 {
            return Ok(out);
        }
        let first = inner.free_pointer;
        let mut p = first;
        loop {
            let h = inner.header(p)?;
            if p != BASE_ADDR {
                out.push((p, h.size * HEADER_BYTES));
            }
            p = h.next;
            if p == first {
                break;
            }
        }
        Ok(out)
    }

    #[cfg(feature = "stats")]
    pub fn stats(&self) -> AllocStats {
        self.inner.borrow().stats
    }

    #[cfg(feature = "stats")]
    pub fn reset_stats(&self) {
        self.inner.borrow_mut().stats = AllocStats::default();
    }

    /// Direct access to the backend, e.g. for serial input passthrough.
    pub fn with_backend<R>(&self, f: impl FnOnce(&mut B) -> R) -> R {
        f(&mut self.inner.borrow_mut().backend)
    }

    // ---- typed helpers -------------------------------------------------

    /// Allocates storage for one `T`.
    pub fn alloc<T: Pod>(&self) -> Result<VPtr<T>> {
        let addr = self.alloc_raw(std::mem::size_of::<T>() as VirtSize)?;
        Ok(VPtr::from_addr(addr))
    }

    /// Allocates an untyped byte buffer.
    pub fn alloc_bytes(&self, size: VirtSize) -> Result<VPtr<u8>> {
        Ok(VPtr::from_addr(self.alloc_raw(size)?))
    }

    /// Allocates and initializes one `T`.
    pub fn alloc_val<T: Pod>(&self, val: T) -> Result<VPtr<T>> {
        let p = self.alloc::<T>()?;
        p.set(self, val)?;
        Ok(p)
    }

    /// Allocates an array of `elems` values, keeping the element count just
    /// before the returned pointer for [`free_array`](Self::free_array).
    pub fn alloc_array<T: Pod>(&self, elems: VirtSize) -> Result<VPtr<T>> {
        let elem_size = std::mem::size_of::<T>() as VirtSize;
        let bytes = elems
            .checked_mul(elem_size)
            .and_then(|n| n.checked_add(std::mem::size_of::<VirtSize>() as VirtSize))
            .ok_or_else(|| VmError::InvalidArgument("array size overflows".into()))?;
        let base = self.alloc_raw(bytes)?;
        self.write(base, &elems.to_ne_bytes())?;
        Ok(VPtr::from_addr(base + std::mem::size_of::<VirtSize>() as VirtAddr))
    }

    /// Frees a block obtained from [`alloc`](Self::alloc) /
    /// [`alloc_val`](Self::alloc_val) and nulls the pointer.
    pub fn free<T>(&self, p: &mut VPtr<T>) -> Result<()> {
        if p.is_null() {
            return Ok(());
        }
        if p.is_wrapped() {
            return Err(VmError::InvalidArgument(
                "cannot free a wrapped pointer".into(),
            ));
        }
        self.free_raw(p.addr())?;
        *p = VPtr::null();
        Ok(())
    }

    /// Frees an array allocated with [`alloc_array`](Self::alloc_array).
    pub fn free_array<T: Pod>(&self, p: &mut VPtr<T>) -> Result<()> {
        if p.is_null() {
            return Ok(());
        }
        if p.is_wrapped() {
            return Err(VmError::InvalidArgument(
                "cannot free a wrapped pointer".into(),
            ));
        }
        let base = p.addr() - std::mem::size_of::<VirtSize>() as VirtAddr;
        self.free_raw(base)?;
        *p = VPtr::null();
        Ok(())
    }

    /// Element count of an array allocated with
    /// [`alloc_array`](Self::alloc_array).
    pub fn array_len<T: Pod>(&self, p: VPtr<T>) -> Result<VirtSize> {
        let mut b = [0u8; std::mem::size_of::<VirtSize>()];
        self.read(p.addr() - std::mem::size_of::<VirtSize>() as VirtAddr, &mut b)?;
        Ok(VirtSize::from_ne_bytes(b))
    }

    // ---- crate-internal entry points ----------------------------------

    pub(crate) fn read_val<T: Pod>(&self, addr: VirtAddr) -> Result<T> {
        let size = std::mem::size_of::<T>();
        let mut inner = self.inner.borrow_mut();
        inner.ensure_started()?;
        inner.check_span(addr, size)?;
        if size > inner.tiers[BIG].page_size as usize {
            return Err(VmError::InvalidArgument(
                "value larger than a big page".into(),
            ));
        }
        let src = inner.read_raw(addr, size as VirtSize)?;
        Ok(unsafe { (src as *const T).read_unaligned() })
    }

    pub(crate) fn write_val<T: Pod>(&self, addr: VirtAddr, val: T) -> Result<()> {
        let size = std::mem::size_of::<T>();
        let mut inner = self.inner.borrow_mut();
        inner.ensure_started()?;
        inner.check_span(addr, size)?;
        if size > inner.tiers[BIG].page_size as usize {
            return Err(VmError::InvalidArgument(
                "value larger than a big page".into(),
            ));
        }
        unsafe { inner.write_raw(addr, &val as *const T as *const u8, size as VirtSize) }
    }

    /// Takes a data lock for the duration of `f`. The allocator stays
    /// borrowed while `f` runs, so `f` cannot re-enter it and nothing can
    /// move the page underneath the pointer.
    pub(crate) fn with_data_lock<R>(
        &self,
        addr: VirtAddr,
        size: PageSize,
        read_only: bool,
        f: impl FnOnce(*mut u8) -> R,
    ) -> Result<R> {
        let mut inner = self.inner.borrow_mut();
        inner.ensure_started()?;
        let (tier, slot) = inner.make_data_lock(addr, size, read_only)?;
        let ptr = inner.tiers[tier].slot_ptr_mut(slot as usize);
        let out = f(ptr);
        inner.release_lock(addr)?;
        Ok(out)
    }

    pub(crate) fn fitting_lock_handle(
        &self,
        addr: VirtAddr,
        size: PageSize,
        read_only: bool,
    ) -> Result<LockHandle> {
        let mut inner = self.inner.borrow_mut();
        inner.ensure_started()?;
        inner.make_fitting_lock(addr, size, read_only)
    }

    pub(crate) fn inner(&self) -> Ref<'_, Inner<B>> {
        self.inner.borrow()
    }

    pub(crate) fn inner_mut(&self) -> RefMut<'_, Inner<B>> {
        self.inner.borrow_mut()
    }
}

impl<B: Backend> Drop for VAlloc<B> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.started {
            if let Err(e) = inner.flush_pages().and_then(|_| inner.backend.stop()) {
                warn!("allocator dropped while running; shutdown failed: {}", e);
            }
            inner.started = false;
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::backend::MemBackend;

    pub(crate) fn small_alloc(pool_size: VirtSize) -> VAlloc<MemBackend> {
        let cfg = AllocConfig {
            pool_size,
            small_page_count: 4,
            small_page_size: 64,
            medium_page_count: 4,
            medium_page_size: 256,
            big_page_count: 4,
            big_page_size: 1024,
        };
        let alloc = VAlloc::new(MemBackend::new(), cfg).unwrap();
        alloc.start().unwrap();
        alloc
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::small_alloc;
    use super::*;
    use crate::backend::MemBackend;

    #[test]
    fn start_is_single_shot() {
        let alloc = small_alloc(32 * 1024);
        assert!(matches!(
            alloc.start(),
            Err(VmError::InvalidState(_))
        ));
        alloc.stop().unwrap();
        alloc.start().unwrap(); // restart after stop is fine
    }

    #[test]
    fn ops_require_start() {
        let alloc = VAlloc::with_pool_size(MemBackend::new(), 1024 * 1024).unwrap();
        let mut buf = [0u8; 4];
        assert!(alloc.read(16, &mut buf).is_err());
        assert!(alloc.alloc_raw(4).is_err());
    }

    #[test]
    fn read_write_reject_bad_spans() {
        let alloc = small_alloc(32 * 1024);
        let mut buf = [0u8; 8];
        assert!(matches!(
            alloc.read(0, &mut buf),
            Err(VmError::InvalidAddress(0))
        ));
        assert!(alloc.write(32 * 1024 - 4, &buf).is_err());
    }

    #[test]
    fn chunked_write_spans_multiple_big_pages() {
        let alloc = small_alloc(32 * 1024);
        let data: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        alloc.write(16, &data).unwrap();
        let mut out = vec![0u8; data.len()];
        alloc.read(16, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn flush_pushes_bytes_to_backend() {
        let alloc = small_alloc(32 * 1024);
        alloc.write(100, b"paged").unwrap();
        alloc.flush().unwrap();
        alloc.with_backend(|b| {
            assert_eq!(&b.as_bytes()[100..105], b"paged");
        });
    }

    #[test]
    fn array_roundtrip_with_count_prefix() {
        let alloc = small_alloc(32 * 1024);
        let mut arr = alloc.alloc_array::<u32>(10).unwrap();
        assert_eq!(alloc.array_len(arr).unwrap(), 10);
        for i in 0..10 {
            arr.at(i as i32).set(&alloc, i * 7).unwrap();
        }
        for i in 0..10 {
            assert_eq!(arr.at(i as i32).get(&alloc).unwrap(), i * 7);
        }
        alloc.free_array(&mut arr).unwrap();
        assert!(arr.is_null());
    }

    #[cfg(feature = "stats")]
    #[test]
    fn stats_reset() {
        let alloc = small_alloc(32 * 1024);
        alloc.write(100, &[1, 2, 3]).unwrap();
        assert!(alloc.stats().page_reads > 0);
        alloc.reset_stats();
        assert_eq!(alloc.stats(), AllocStats::default());
    }
}
