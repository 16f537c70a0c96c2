//! Journaled store error types.

use thiserror::Error;

/// Result type for journaled store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Journaled store error variants.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store is closed")]
    Closed,

    #[error("value index {index} out of range (store holds {value_count} values per entry)")]
    InvalidIndex { index: usize, value_count: usize },

    #[error("edit for {0} is missing values and cannot be committed")]
    IncompleteEdit(String),

    #[error("journal error: {0}")]
    Journal(String),
}
