//! Sequential-fill benchmark over a file-backed pool.
//!
//! Allocates a 128 KiB buffer in a pool barely larger than that, then fills
//! it byte by byte, 50 times over. With only four big pages in front of the
//! pool this hammers the swap path and gives a feel for the paging
//! overhead on a given medium.

use std::time::Instant;

use pagedmem::{AllocConfig, FileBackend, Result, VAlloc};

const POOL_SIZE: u32 = 1024 * 128 + 128;
const BUF_SIZE: u32 = 1024 * 128;
const REPEATS: u32 = 50;

fn main() -> Result<()> {
    let path = std::env::temp_dir().join(format!("pagedmem-bench-{}.pool", std::process::id()));
    let cfg = AllocConfig {
        pool_size: POOL_SIZE,
        big_page_size: 1024,
        ..AllocConfig::default()
    };
    let alloc = VAlloc::new(FileBackend::new(&path), cfg)?;
    alloc.start()?;

    let buf = alloc.alloc_bytes(BUF_SIZE)?;

    let begin = Instant::now();
    for _ in 0..REPEATS {
        for j in 0..BUF_SIZE {
            buf.at(j as i32).set(&alloc, j as u8)?;
        }
    }
    let millis = begin.elapsed().as_millis().max(1) as u64;

    println!("Finished in {} ms", millis);
    println!(
        "Speed: {} kB/s",
        u64::from(REPEATS) * u64::from(BUF_SIZE) / millis * 1000 / 1024
    );

    alloc.stop()?;
    let _ = std::fs::remove_file(&path);
    Ok(())
}
