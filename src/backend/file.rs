use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use log::{debug, info};

use super::Backend;
use crate::error::{Result, VmError};
use crate::{VirtAddr, VirtSize};

/// Pool stored in a regular file.
///
/// The file is created on `start` if missing and zero-extended to the pool
/// size; an existing larger file keeps its content, so a pool survives a
/// stop/start cycle on the same path.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    file: Option<File>,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn file_mut(&mut self) -> Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| VmError::InvalidState("file backend not started".into()))
    }
}

impl Backend for FileBackend {
    fn start(&mut self, pool_size: VirtSize) -> Result<VirtSize> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        let len = file.metadata()?.len();
        if len < u64::from(pool_size) {
            // set_len zero-fills the extension, which is exactly the fresh
            // pool contract.
            file.set_len(u64::from(pool_size))?;
        }
        info!(
            "file backend: pool at {} ({} bytes)",
            self.path.display(),
            pool_size
        );
        self.file = Some(file);
        Ok(pool_size)
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            debug!("file backend: closing {}", self.path.display());
            file.sync_all()?;
        }
        Ok(())
    }

    fn read(&mut self, offset: VirtAddr, dst: &mut [u8]) -> Result<()> {
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(u64::from(offset)))?;
        file.read_exact(dst)?;
        Ok(())
    }

    fn write(&mut self, offset: VirtAddr, src: &[u8]) -> Result<()> {
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(u64::from(offset)))?;
        file.write_all(src)?;
        Ok(())
    }
}
