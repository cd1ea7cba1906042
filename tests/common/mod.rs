#![allow(dead_code)]

use pagedmem::{AllocConfig, MemBackend, VAlloc, VirtSize};

/// Test rig: 4x64 / 4x256 / 4x1024 pages, so four big pages of 1 KiB front
/// the pool.
pub fn test_config(pool_size: VirtSize) -> AllocConfig {
    AllocConfig {
        pool_size,
        small_page_count: 4,
        small_page_size: 64,
        medium_page_count: 4,
        medium_page_size: 256,
        big_page_count: 4,
        big_page_size: 1024,
    }
}

pub fn mem_alloc(pool_size: VirtSize) -> VAlloc<MemBackend> {
    let alloc = VAlloc::new(MemBackend::new(), test_config(pool_size)).unwrap();
    alloc.start().unwrap();
    alloc
}

/// Deterministic pseudo-random-ish byte pattern.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
