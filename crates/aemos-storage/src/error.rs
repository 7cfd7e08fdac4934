//! Error types for the storage crate.

/// Storage-level failures.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

impl From<StorageError> for aemos_core::Error {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(s) => aemos_core::Error::Storage(format!("not found: {s}")),
            StorageError::Conflict(s) => aemos_core::Error::Storage(format!("conflict: {s}")),
            StorageError::Backend(s) => aemos_core::Error::Storage(s),
        }
    }
}
