//! Block backends: the byte pools that page buffers swap against.
//!
//! A backend is a blocking block device addressed by byte offset. It has no
//! alignment or granularity requirements; the allocator may ask for any
//! `[offset, offset + len)` range inside the pool.

pub mod file;
pub mod mem;
pub mod serial;

pub use file::FileBackend;
pub use mem::MemBackend;
pub use serial::{SerialBackend, SerialConfig};

use crate::error::Result;
use crate::{VirtAddr, VirtSize};

/// A synchronous pool of bytes backing a virtual memory allocator.
///
/// `start` prepares the pool (open a file, handshake a remote host, ...) and
/// returns the effective pool size, which may be larger than requested. A
/// freshly created pool must read as zeros.
pub trait Backend {
    fn start(&mut self, pool_size: VirtSize) -> Result<VirtSize>;

    fn stop(&mut self) -> Result<()>;

    /// Copies `dst.len()` bytes from pool offset `offset` into `dst`.
    fn read(&mut self, offset: VirtAddr, dst: &mut [u8]) -> Result<()>;

    /// Copies `src` into the pool at offset `offset`.
    fn write(&mut self, offset: VirtAddr, src: &[u8]) -> Result<()>;
}
