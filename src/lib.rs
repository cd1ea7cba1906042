//! Software virtual memory for memory-constrained targets.
//!
//! `pagedmem` lets code address a large, slow byte pool (a file, a remote
//! host over a serial link, a RAM chip) as if it were ordinary memory. A
//! small set of fixed in-RAM page buffers, split into three size tiers,
//! pages data in and out on demand; a first-fit heap hands out stable
//! virtual addresses inside the pool; virtual pointers and scoped locks
//! give the whole thing a pointer-like surface.
//!
//! ```no_run
//! use pagedmem::{AllocConfig, MemBackend, VAlloc};
//!
//! # fn main() -> pagedmem::Result<()> {
//! let alloc = VAlloc::new(MemBackend::new(), AllocConfig::with_pool_size(256 * 1024))?;
//! alloc.start()?;
//!
//! let v = alloc.alloc_val(42u32)?;
//! assert_eq!(v.get(&alloc)?, 42);
//!
//! alloc.stop()?;
//! # Ok(())
//! # }
//! ```
//!
//! The allocator is strictly single-threaded: one thread of control, no
//! internal locking, cooperative blocking on backend transfers.

pub mod backend;
pub mod config;
pub mod error;
pub mod memops;
pub mod valloc;
pub mod vlock;
pub mod vptr;

pub use backend::{Backend, FileBackend, MemBackend, SerialBackend};
pub use config::{AllocConfig, DEFAULT_POOL_SIZE};
pub use error::{Result, VmError};
#[cfg(feature = "stats")]
pub use valloc::AllocStats;
pub use valloc::{TierKind, VAlloc};
pub use vlock::VLock;
pub use vptr::{Pod, VPtr};

/// A byte position inside the pool. Address 0 is the null pointer.
pub type VirtAddr = u32;
/// A byte count inside the pool.
pub type VirtSize = u32;
/// Size of an in-RAM page buffer.
pub type PageSize = u16;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
