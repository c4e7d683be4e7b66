//! Error types for AtlasTable
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using AtlasError
pub type Result<T> = std::result::Result<T, AtlasError>;

/// Unified error type for AtlasTable operations
#[derive(Debug, Error)]
pub enum AtlasError {
    // -------------------------------------------------------------------------
    // Contract Errors
    // -------------------------------------------------------------------------
    /// A call was made in a state that does not allow it (apply after flush,
    /// fast-forwarding a flush reader, fast-forwarding backward, ...)
    #[error("Precondition violated: {0}")]
    PreconditionViolated(String),

    /// Data cannot be reconciled without losing meaning (incompatible column
    /// type reuse, unknown column, wrong column kind)
    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    // -------------------------------------------------------------------------
    // Memory Errors
    // -------------------------------------------------------------------------
    #[error("Dirty memory over hard limit: {virtual_dirty} bytes (limit {limit})")]
    Backpressure { virtual_dirty: usize, limit: usize },

    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Storage Errors
    // -------------------------------------------------------------------------
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Segment corruption detected: {0}")]
    Corruption(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AtlasError {
    /// Shorthand for building a [`AtlasError::PreconditionViolated`]
    pub(crate) fn precondition(msg: impl Into<String>) -> Self {
        AtlasError::PreconditionViolated(msg.into())
    }

    /// Shorthand for building a [`AtlasError::DataIntegrity`]
    pub(crate) fn integrity(msg: impl Into<String>) -> Self {
        AtlasError::DataIntegrity(msg.into())
    }
}

impl From<bincode::Error> for AtlasError {
    fn from(e: bincode::Error) -> Self {
        AtlasError::Serialization(e.to_string())
    }
}
