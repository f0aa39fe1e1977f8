//! Storage layer error types.

use crate::storage::page::PageId;
use crate::storage::FileId;
use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Buffer pool is full: every frame is pinned")]
    BufferPoolFull,

    #[error("Page not found: {0:?}")]
    PageNotFound(PageId),

    #[error("File {0:?} is not registered with the buffer pool")]
    FileNotRegistered(FileId),

    #[error("File {0:?} still has pinned pages")]
    FileInUse(FileId),

    #[error("No free page available (limit: {limit} pages)")]
    PageAllocationExhausted { limit: u32 },

    #[error("Invalid page size {0}: must be a power of two between 128 and 32768")]
    InvalidPageSize(usize),
}
