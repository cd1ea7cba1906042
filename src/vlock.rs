//! Scoped locks over virtual spans.

use std::marker::PhantomData;

use log::warn;

use crate::backend::Backend;
use crate::error::{Result, VmError};
use crate::valloc::{LockHandle, VAlloc};
use crate::vptr::{Pod, VPtr};
use crate::{PageSize, VirtSize};

enum LockKind {
    /// Wrapped host pointer: nothing is pinned, access is direct.
    Wrapped { ptr: *mut u8, len: VirtSize },
    /// A fitting lock pinning part of a page buffer.
    Pinned { handle: LockHandle },
}

/// A scoped lock: takes a fitting lock on construction and releases it on
/// drop, keeping `[addr, addr + len)` resident in one page buffer.
///
/// The locked length may be smaller than requested (page-size limits,
/// other locks in the way), so always consult [`len`](Self::len).
/// Byte access goes through closures that keep the allocator borrowed, so
/// nothing can swap or alias the buffer mid-access.
pub struct VLock<'a, T: Pod, B: Backend> {
    alloc: &'a VAlloc<B>,
    vptr: VPtr<T>,
    kind: LockKind,
    _marker: PhantomData<T>,
}

impl<'a, T: Pod, B: Backend> VLock<'a, T, B> {
    /// Locks up to `elems` elements starting at `p`.
    pub fn new(alloc: &'a VAlloc<B>, p: VPtr<T>, elems: VirtSize, read_only: bool) -> Result<Self> {
        if p.is_null() {
            return Err(VmError::InvalidAddress(0));
        }
        let elem_size = std::mem::size_of::<T>() as u64;
        let want_bytes = u64::from(elems) * elem_size;
        let kind = if p.is_wrapped() {
            LockKind::Wrapped {
                ptr: p.unwrap_raw() as *mut u8,
                len: want_bytes.min(u64::from(VirtSize::MAX)) as VirtSize,
            }
        } else {
            let request = want_bytes.min(u64::from(PageSize::MAX)) as PageSize;
            let handle = alloc.fitting_lock_handle(p.addr(), request, read_only)?;
            LockKind::Pinned { handle }
        };
        Ok(Self {
            alloc,
            vptr: p,
            kind,
            _marker: PhantomData,
        })
    }

    /// Locked length in whole elements.
    pub fn len(&self) -> VirtSize {
        self.byte_len() / std::mem::size_of::<T>() as VirtSize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Locked length in bytes.
    pub fn byte_len(&self) -> VirtSize {
        match &self.kind {
            LockKind::Wrapped { len, .. } => *len,
            LockKind::Pinned { handle } => handle.len as VirtSize,
        }
    }

    /// The pointer the lock guards. Valid until the lock is released; must
    /// not be dereferenced across allocator calls that touch this range.
    pub fn as_ptr(&self) -> *const T {
        match &self.kind {
            LockKind::Wrapped { ptr, .. } => *ptr as *const T,
            LockKind::Pinned { handle } => {
                let inner = self.alloc.inner();
                unsafe {
                    inner.tiers[handle.tier]
                        .slot_ptr(handle.slot)
                        .add(handle.offset as usize) as *const T
                }
            }
        }
    }

    /// Reads element `i`.
    ///
    /// # Panics
    ///
    /// If `i` is outside the locked length.
    pub fn read_elem(&self, i: VirtSize) -> T {
        assert!(i < self.len(), "lock index {} out of {}", i, self.len());
        let off = i as usize * std::mem::size_of::<T>();
        match &self.kind {
            LockKind::Wrapped { ptr, .. } => unsafe {
                (ptr.add(off) as *const T).read_unaligned()
            },
            LockKind::Pinned { handle } => {
                let inner = self.alloc.inner();
                unsafe {
                    (inner.tiers[handle.tier]
                        .slot_ptr(handle.slot)
                        .add(handle.offset as usize + off) as *const T)
                        .read_unaligned()
                }
            }
        }
    }

    /// Writes element `i`.
    ///
    /// # Panics
    ///
    /// If `i` is outside the locked length.
    pub fn write_elem(&mut self, i: VirtSize, val: T) {
        assert!(i < self.len(), "lock index {} out of {}", i, self.len());
        let off = i as usize * std::mem::size_of::<T>();
        match &self.kind {
            LockKind::Wrapped { ptr, .. } => unsafe {
                (ptr.add(off) as *mut T).write_unaligned(val)
            },
            LockKind::Pinned { handle } => {
                let mut inner = self.alloc.inner_mut();
                inner.tiers[handle.tier].slots[handle.slot].dirty = true;
                unsafe {
                    (inner.tiers[handle.tier]
                        .slot_ptr_mut(handle.slot)
                        .add(handle.offset as usize + off) as *mut T)
                        .write_unaligned(val)
                }
            }
        }
    }

    /// Runs `f` over the locked bytes. The allocator stays borrowed for
    /// the duration, so `f` cannot re-enter it.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        match &self.kind {
            LockKind::Wrapped { ptr, len } => {
                f(unsafe { std::slice::from_raw_parts(*ptr, *len as usize) })
            }
            LockKind::Pinned { handle } => {
                let inner = self.alloc.inner();
                let bytes = unsafe {
                    std::slice::from_raw_parts(
                        inner.tiers[handle.tier]
                            .slot_ptr(handle.slot)
                            .add(handle.offset as usize),
                        handle.len as usize,
                    )
                };
                f(bytes)
            }
        }
    }

    /// Mutable variant of [`with_bytes`](Self::with_bytes); marks the page
    /// dirty.
    pub fn with_bytes_mut<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        match &self.kind {
            LockKind::Wrapped { ptr, len } => {
                f(unsafe { std::slice::from_raw_parts_mut(*ptr, *len as usize) })
            }
            LockKind::Pinned { handle } => {
                let mut inner = self.alloc.inner_mut();
                inner.tiers[handle.tier].slots[handle.slot].dirty = true;
                let offset = handle.offset as usize;
                let len = handle.len as usize;
                let bytes = unsafe {
                    std::slice::from_raw_parts_mut(
                        inner.tiers[handle.tier].slot_ptr_mut(handle.slot).add(offset),
                        len,
                    )
                };
                f(bytes)
            }
        }
    }

    pub fn copy_to_slice(&self, dst: &mut [u8]) {
        self.with_bytes(|b| dst.copy_from_slice(&b[..dst.len()]));
    }

    pub fn copy_from_slice(&mut self, src: &[u8]) {
        self.with_bytes_mut(|b| b[..src.len()].copy_from_slice(src));
    }

    /// Takes an additional lock on the same span, so both guards release
    /// independently.
    pub fn duplicate(&self) -> Result<Self> {
        match &self.kind {
            LockKind::Wrapped { ptr, len } => Ok(Self {
                alloc: self.alloc,
                vptr: self.vptr,
                kind: LockKind::Wrapped {
                    ptr: *ptr,
                    len: *len,
                },
                _marker: PhantomData,
            }),
            LockKind::Pinned { handle } => {
                // the span is already pinned, so this reuses the same page
                // and bumps its reference count
                let dup =
                    self.alloc
                        .fitting_lock_handle(self.vptr.addr(), handle.len, true)?;
                debug_assert_eq!((dup.tier, dup.slot), (handle.tier, handle.slot));
                Ok(Self {
                    alloc: self.alloc,
                    vptr: self.vptr,
                    kind: LockKind::Pinned { handle: dup },
                    _marker: PhantomData,
                })
            }
        }
    }
}

impl<T: Pod, B: Backend> Drop for VLock<'_, T, B> {
    fn drop(&mut self) {
        if let LockKind::Pinned { .. } = self.kind {
            if let Err(e) = self.alloc.release_lock(self.vptr.addr()) {
                warn!("failed to release lock at {}: {}", self.vptr.addr(), e);
            }
        }
    }
}
