//! C-string and memory routines over virtual pointers.
//!
//! Every function takes `VPtr<u8>` operands; a raw host pointer
//! participates by being wrapped first (see [`VPtr::wrap`]), which is what
//! collapses the virtual/raw argument matrix into single functions. When
//! both sides are wrapped the work happens directly on host memory.
//!
//! Virtual spans are walked in chunks. Each chunk takes a fitting lock per
//! virtual side; the chunk size is the smaller of the two locked lengths,
//! capped by the big page size and, when both sides are virtual, by the
//! distance between the two addresses so the two locks can never alias one
//! buffer.

use crate::backend::Backend;
use crate::error::Result;
use crate::valloc::{Inner, VAlloc, BIG};
use crate::vptr::VPtr;
use crate::{PageSize, VirtSize};

/// Per-chunk copy primitive; returns `false` to stop early (terminator
/// found).
type Copier = unsafe fn(*mut u8, *const u8, usize) -> bool;

/// Per-chunk compare primitive; sets `done` to stop early with the current
/// result.
type Comparator = unsafe fn(*const u8, *const u8, usize, &mut bool) -> i32;

enum SideLock {
    Host(*mut u8),
    Page { tier: usize, slot: usize, offset: usize, len: VirtSize },
}

fn lock_side<B: Backend>(
    inner: &mut Inner<B>,
    p: VPtr<u8>,
    want: VirtSize,
    read_only: bool,
) -> Result<(SideLock, VirtSize)> {
    if p.is_wrapped() {
        return Ok((SideLock::Host(p.unwrap_raw()), VirtSize::MAX));
    }
    let request = want.min(PageSize::MAX as VirtSize) as PageSize;
    let h = inner.make_fitting_lock(p.addr(), request, read_only)?;
    Ok((
        SideLock::Page {
            tier: h.tier,
            slot: h.slot,
            offset: h.offset as usize,
            len: h.len as VirtSize,
        },
        h.len as VirtSize,
    ))
}

fn resolve<B: Backend>(inner: &mut Inner<B>, side: &SideLock) -> *mut u8 {
    match side {
        SideLock::Host(p) => *p,
        SideLock::Page { tier, slot, offset, .. } => unsafe {
            inner.tiers[*tier].slot_ptr_mut(*slot).add(*offset)
        },
    }
}

fn release_side<B: Backend>(inner: &mut Inner<B>, side: SideLock, p: VPtr<u8>) -> Result<()> {
    if let SideLock::Page { .. } = side {
        inner.release_lock(p.addr())?;
    }
    Ok(())
}

/// Chunk cap for a pair of operands.
fn max_lock_size<B: Backend>(inner: &Inner<B>, a: VPtr<u8>, b: VPtr<u8>) -> VirtSize {
    let mut cap = inner.tiers[BIG].page_size as VirtSize;
    if !a.is_wrapped() && !b.is_wrapped() {
        let diff = (i64::from(a.addr()) - i64::from(b.addr())).unsigned_abs() as VirtSize;
        cap = cap.min(diff);
    }
    cap
}

fn raw_copy<B: Backend>(
    alloc: &VAlloc<B>,
    dest: VPtr<u8>,
    src: VPtr<u8>,
    n: VirtSize,
    copier: Copier,
) -> Result<()> {
    if n == 0 || dest == src {
        return Ok(());
    }
    if dest.is_wrapped() && src.is_wrapped() {
        unsafe { copier(dest.unwrap_raw(), src.unwrap_raw(), n as usize) };
        return Ok(());
    }

    let mut inner = alloc.inner_mut();
    inner.ensure_started()?;
    let cap = max_lock_size(&inner, dest, src);

    let mut d = dest;
    let mut s = src;
    let mut left = n;
    while left > 0 {
        let mut chunk = cap.min(left);
        let (dlock, dlen) = lock_side(&mut inner, d, chunk, false)?;
        chunk = chunk.min(dlen);
        let (slock, slen) = lock_side(&mut inner, s, chunk, true)?;
        chunk = chunk.min(slen);

        let dptr = resolve(&mut inner, &dlock);
        let sptr = resolve(&mut inner, &slock);
        let keep_going = unsafe { copier(dptr, sptr as *const u8, chunk as usize) };

        release_side(&mut inner, dlock, d)?;
        release_side(&mut inner, slock, s)?;

        if !keep_going {
            break;
        }
        d += chunk as i32;
        s += chunk as i32;
        left -= chunk;
    }
    Ok(())
}

fn raw_compare<B: Backend>(
    alloc: &VAlloc<B>,
    p1: VPtr<u8>,
    p2: VPtr<u8>,
    n: VirtSize,
    comparator: Comparator,
) -> Result<i32> {
    if n == 0 || p1 == p2 {
        return Ok(0);
    }
    let mut done = false;
    if p1.is_wrapped() && p2.is_wrapped() {
        return Ok(unsafe {
            comparator(p1.unwrap_raw(), p2.unwrap_raw(), n as usize, &mut done)
        });
    }

    let mut inner = alloc.inner_mut();
    inner.ensure_started()?;
    let cap = max_lock_size(&inner, p1, p2);

    let mut a = p1;
    let mut b = p2;
    let mut left = n;
    while left > 0 {
        let mut chunk = cap.min(left);
        let (alock, alen) = lock_side(&mut inner, a, chunk, true)?;
        chunk = chunk.min(alen);
        let (block, blen) = lock_side(&mut inner, b, chunk, true)?;
        chunk = chunk.min(blen);

        let aptr = resolve(&mut inner, &alock) as *const u8;
        let bptr = resolve(&mut inner, &block) as *const u8;
        let cmp = unsafe { comparator(aptr, bptr, chunk as usize, &mut done) };

        release_side(&mut inner, alock, a)?;
        release_side(&mut inner, block, b)?;

        if cmp != 0 || done {
            return Ok(cmp);
        }
        a += chunk as i32;
        b += chunk as i32;
        left -= chunk;
    }
    Ok(0)
}

unsafe fn mem_copier(dest: *mut u8, src: *const u8, n: usize) -> bool {
    std::ptr::copy_nonoverlapping(src, dest, n);
    true
}

/// `strncpy` chunk: copy until the terminator, zero-pad the rest.
unsafe fn strn_copier(dest: *mut u8, src: *const u8, n: usize) -> bool {
    let mut hit_nul = false;
    for i in 0..n {
        let b = if hit_nul { 0 } else { *src.add(i) };
        if b == 0 {
            hit_nul = true;
        }
        *dest.add(i) = b;
    }
    !hit_nul
}

/// `strcpy` chunk: copy through the terminator, then stop.
unsafe fn str_copier(dest: *mut u8, src: *const u8, n: usize) -> bool {
    for i in 0..n {
        let b = *src.add(i);
        *dest.add(i) = b;
        if b == 0 {
            return false;
        }
    }
    true
}

unsafe fn mem_comparator(a: *const u8, b: *const u8, n: usize, _done: &mut bool) -> i32 {
    for i in 0..n {
        let (x, y) = (*a.add(i), *b.add(i));
        if x != y {
            return i32::from(x) - i32::from(y);
        }
    }
    0
}

unsafe fn strn_comparator(a: *const u8, b: *const u8, n: usize, _done: &mut bool) -> i32 {
    for i in 0..n {
        let (x, y) = (*a.add(i), *b.add(i));
        if x != y {
            return i32::from(x) - i32::from(y);
        }
        if x == 0 {
            return 0;
        }
    }
    0
}

unsafe fn str_comparator(a: *const u8, b: *const u8, n: usize, done: &mut bool) -> i32 {
    let ret = strn_comparator(a, b, n, done);
    if ret == 0 {
        // equal so far; finished if a terminator sits inside this chunk
        for i in 0..n {
            if *a.add(i) == 0 {
                *done = true;
                break;
            }
        }
    }
    ret
}

/// Copies `n` bytes from `src` to `dest`. The ranges must not overlap.
pub fn memcpy<B: Backend>(
    alloc: &VAlloc<B>,
    dest: VPtr<u8>,
    src: VPtr<u8>,
    n: VirtSize,
) -> Result<VPtr<u8>> {
    raw_copy(alloc, dest, src, n, mem_copier)?;
    Ok(dest)
}

/// Copies a host slice into virtual memory.
pub fn memcpy_from_slice<B: Backend>(
    alloc: &VAlloc<B>,
    dest: VPtr<u8>,
    src: &[u8],
) -> Result<VPtr<u8>> {
    memcpy(alloc, dest, VPtr::wrap_raw(src.as_ptr()), src.len() as VirtSize)
}

/// Copies virtual memory into a host slice.
pub fn memcpy_to_slice<B: Backend>(
    alloc: &VAlloc<B>,
    dest: &mut [u8],
    src: VPtr<u8>,
) -> Result<()> {
    let n = dest.len() as VirtSize;
    raw_copy(alloc, VPtr::wrap_raw(dest.as_mut_ptr()), src, n, mem_copier)
}

/// Fills `n` bytes at `dest` with `c`.
pub fn memset<B: Backend>(
    alloc: &VAlloc<B>,
    dest: VPtr<u8>,
    c: u8,
    n: VirtSize,
) -> Result<VPtr<u8>> {
    if n == 0 {
        return Ok(dest);
    }
    if dest.is_wrapped() {
        unsafe { std::ptr::write_bytes(dest.unwrap_raw(), c, n as usize) };
        return Ok(dest);
    }

    let mut inner = alloc.inner_mut();
    inner.ensure_started()?;
    let cap = inner.tiers[BIG].page_size as VirtSize;
    let mut p = dest;
    let mut left = n;
    while left > 0 {
        let want = cap.min(left);
        let (lock, len) = lock_side(&mut inner, p, want, false)?;
        let chunk = want.min(len);
        let ptr = resolve(&mut inner, &lock);
        unsafe { std::ptr::write_bytes(ptr, c, chunk as usize) };
        release_side(&mut inner, lock, p)?;
        p += chunk as i32;
        left -= chunk;
    }
    Ok(dest)
}

/// Compares `n` bytes; returns the sign-bearing difference of the first
/// mismatching pair, zero when equal.
pub fn memcmp<B: Backend>(
    alloc: &VAlloc<B>,
    s1: VPtr<u8>,
    s2: VPtr<u8>,
    n: VirtSize,
) -> Result<i32> {
    raw_compare(alloc, s1, s2, n, mem_comparator)
}

/// Length of the nul-terminated string at `s`.
pub fn strlen<B: Backend>(alloc: &VAlloc<B>, s: VPtr<u8>) -> Result<VirtSize> {
    if s.is_wrapped() {
        let mut p = s.unwrap_raw() as *const u8;
        let mut n = 0;
        unsafe {
            while *p != 0 {
                p = p.add(1);
                n += 1;
            }
        }
        return Ok(n);
    }
    let mut n = 0;
    let mut p = s;
    while p.get(alloc)? != 0 {
        p.inc();
        n += 1;
    }
    Ok(n)
}

/// Copies the nul-terminated string at `src` (terminator included).
pub fn strcpy<B: Backend>(
    alloc: &VAlloc<B>,
    dest: VPtr<u8>,
    src: VPtr<u8>,
) -> Result<VPtr<u8>> {
    raw_copy(alloc, dest, src, VirtSize::MAX, str_copier)?;
    Ok(dest)
}

/// Copies at most `n` bytes of the string at `src`, zero-padding like
/// `strncpy`.
pub fn strncpy<B: Backend>(
    alloc: &VAlloc<B>,
    dest: VPtr<u8>,
    src: VPtr<u8>,
    n: VirtSize,
) -> Result<VPtr<u8>> {
    raw_copy(alloc, dest, src, n, strn_copier)?;
    Ok(dest)
}

/// Compares two nul-terminated strings.
pub fn strcmp<B: Backend>(alloc: &VAlloc<B>, s1: VPtr<u8>, s2: VPtr<u8>) -> Result<i32> {
    raw_compare(alloc, s1, s2, VirtSize::MAX, str_comparator)
}

/// Compares at most `n` bytes of two nul-terminated strings.
pub fn strncmp<B: Backend>(
    alloc: &VAlloc<B>,
    s1: VPtr<u8>,
    s2: VPtr<u8>,
    n: VirtSize,
) -> Result<i32> {
    raw_compare(alloc, s1, s2, n, strn_comparator)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strn_copier_pads_after_terminator() {
        let src = *b"ab\0zzz";
        let mut dst = [0xFFu8; 6];
        let more = unsafe { strn_copier(dst.as_mut_ptr(), src.as_ptr(), 6) };
        assert!(!more);
        assert_eq!(&dst, b"ab\0\0\0\0");
    }

    #[test]
    fn str_copier_stops_at_terminator() {
        let src = *b"hi\0xx";
        let mut dst = [0xFFu8; 5];
        let more = unsafe { str_copier(dst.as_mut_ptr(), src.as_ptr(), 5) };
        assert!(!more);
        assert_eq!(&dst[..3], b"hi\0");
        assert_eq!(dst[3], 0xFF);
    }

    #[test]
    fn comparator_signs() {
        let a = *b"abc";
        let b = *b"abd";
        let mut done = false;
        let r = unsafe { mem_comparator(a.as_ptr(), b.as_ptr(), 3, &mut done) };
        assert!(r < 0);
        let r = unsafe { strn_comparator(b.as_ptr(), a.as_ptr(), 3, &mut done) };
        assert!(r > 0);
    }

    #[test]
    fn str_comparator_reports_done_at_terminator() {
        let a = *b"hi\0garbage1";
        let b = *b"hi\0garbage2";
        let mut done = false;
        let r = unsafe { str_comparator(a.as_ptr(), b.as_ptr(), 3, &mut done) };
        assert_eq!(r, 0);
        assert!(done);
    }
}
