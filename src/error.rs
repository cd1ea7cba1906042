use thiserror::Error;

use crate::VirtAddr;

#[derive(Error, Debug)]
pub enum VmError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("virtual memory pool exhausted")]
    PoolExhausted,

    #[error("backend error: {0}")]
    Backend(String),

    #[error("invalid virtual address: {0}")]
    InvalidAddress(VirtAddr),

    #[error("no lock held at virtual address {0}")]
    LockMismatch(VirtAddr),

    #[error("handshake with remote pool host timed out")]
    HandshakeTimeout,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, VmError>;
