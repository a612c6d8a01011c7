//! Storage-layer errors

use thiserror::Error;

/// Errors raised by the change tracker or the host storage boundary
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StorageError {
    /// Key not present in host storage
    #[error("storage key not found: {contract}/{key}")]
    NotFound { contract: String, key: String },

    /// A value too deeply nested to persist
    #[error("storage value for '{key}' exceeds the nesting depth limit")]
    TooDeep { key: String },

    /// A value kind that cannot be persisted
    #[error("storage value for '{key}' has unsupported type {type_name}")]
    UnsupportedValue { key: String, type_name: String },

    /// The host rejected a commit; nothing was applied
    #[error("storage commit rejected by host: {details}")]
    CommitRejected { details: String },

    /// Commit attempted on a session whose change set was already resolved
    #[error("change set already {state}; commit is a no-op")]
    AlreadyResolved { state: String },

    /// Encoding failure between engine values and storage bytes
    #[error("storage serialization error: {details}")]
    Serialization { details: String },
}

/// Result alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
