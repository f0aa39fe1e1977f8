//! Failure reasons reported by index operations.

use crate::storage::error::StorageError;
use crate::storage::page::PageId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Duplicate key")]
    DuplicateKey,

    #[error("Key does not exist")]
    NonexistentKey,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Tuple of {size} bytes exceeds the per-page limit of {max} bytes")]
    TupleTooLarge { size: usize, max: usize },

    #[error("Bulk load input is not in ascending key order")]
    UnsortedInput,

    #[error("Page allocation exhausted")]
    PageAllocationExhausted,

    #[error("Operation restarted {restarts} times without completing")]
    RestartsExhausted { restarts: u32 },

    #[error("Page {page_id:?} is corrupted: {reason}")]
    Corrupted { page_id: PageId, reason: String },

    #[error("Storage error: {0}")]
    Storage(anyhow::Error),
}

impl IndexError {
    /// Contention or resource failures that a caller may retry. Everything
    /// else is a problem with the input or with the index itself.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IndexError::RestartsExhausted { .. } | IndexError::PageAllocationExhausted
        ) || matches!(
            self,
            IndexError::Storage(err)
                if matches!(err.downcast_ref::<StorageError>(), Some(StorageError::BufferPoolFull))
        )
    }

    pub fn is_bad_input(&self) -> bool {
        matches!(
            self,
            IndexError::DuplicateKey
                | IndexError::NonexistentKey
                | IndexError::InvalidOperation(_)
                | IndexError::TupleTooLarge { .. }
                | IndexError::UnsortedInput
        )
    }
}

impl From<anyhow::Error> for IndexError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<StorageError>() {
            Some(StorageError::PageAllocationExhausted { .. }) => IndexError::PageAllocationExhausted,
            _ => IndexError::Storage(err),
        }
    }
}

pub type IndexResult<T> = Result<T, IndexError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_failure_is_typed() {
        let err: IndexError =
            anyhow::Error::from(StorageError::PageAllocationExhausted { limit: 8 }).into();
        assert!(matches!(err, IndexError::PageAllocationExhausted));
        assert!(err.is_transient());
        assert!(!err.is_bad_input());
    }

    #[test]
    fn test_other_storage_errors_are_wrapped() {
        let err: IndexError = anyhow::anyhow!("disk on fire").into();
        assert!(matches!(err, IndexError::Storage(_)));
        assert!(!err.is_transient());

        let err: IndexError = anyhow::Error::from(StorageError::BufferPoolFull).into();
        assert!(err.is_transient());
    }

    #[test]
    fn test_input_errors() {
        assert!(IndexError::DuplicateKey.is_bad_input());
        assert!(IndexError::NonexistentKey.is_bad_input());
        assert!(!IndexError::RestartsExhausted { restarts: 3 }.is_bad_input());
        assert!(IndexError::RestartsExhausted { restarts: 3 }.is_transient());
    }
}
