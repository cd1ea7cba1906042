use log::debug;

use super::Backend;
use crate::error::{Result, VmError};
use crate::{VirtAddr, VirtSize};

/// Pool held in host RAM.
///
/// Useful as a stand-in for a memory-mapped RAM chip and as the fastest
/// backend for tests. The pool is (re)allocated zero-filled on `start`.
#[derive(Debug, Default)]
pub struct MemBackend {
    pool: Vec<u8>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw view of the pool bytes, e.g. to assert what actually hit the
    /// backing store.
    pub fn as_bytes(&self) -> &[u8] {
        &self.pool
    }

    fn check_range(&self, offset: VirtAddr, len: usize) -> Result<usize> {
        let offset = offset as usize;
        let end = offset
            .checked_add(len)
            .ok_or_else(|| VmError::Backend("range overflow".into()))?;
        if end > self.pool.len() {
            return Err(VmError::Backend(format!(
                "range {}..{} outside pool of {} bytes",
                offset,
                end,
                self.pool.len()
            )));
        }
        Ok(offset)
    }
}

impl Backend for MemBackend {
    fn start(&mut self, pool_size: VirtSize) -> Result<VirtSize> {
        debug!("mem backend: allocating {} byte pool", pool_size);
        self.pool = vec![0; pool_size as usize];
        Ok(pool_size)
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn read(&mut self, offset: VirtAddr, dst: &mut [u8]) -> Result<()> {
        let offset = self.check_range(offset, dst.len())?;
        dst.copy_from_slice(&self.pool[offset..offset + dst.len()]);
        Ok(())
    }

    fn write(&mut self, offset: VirtAddr, src: &[u8]) -> Result<()> {
        let offset = self.check_range(offset, src.len())?;
        self.pool[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }
}
