//! Error types for the virtual file system provider.
//!
//! Two layers of errors exist:
//!
//! - [`MountError`] is what an [`ArchiveReader`](crate::reader::ArchiveReader)
//!   reports when it fails to mount itself. The provider folds these into
//!   "not mounted this time" and never surfaces them to callers.
//! - [`VfsError`] covers failures of the provider's own API surface: parsing
//!   keys, loading configuration, building the blocking runtime.

use std::io;

use thiserror::Error;

/// Result type for provider operations.
pub type VfsResult<T> = Result<T, VfsError>;

/// Outcome of a failed mount attempt, reported by a container reader.
#[derive(Debug, Error)]
pub enum MountError {
    /// The supplied key does not decrypt this container.
    ///
    /// Expected and recoverable: another key may still fit.
    #[error("Invalid AES key")]
    InvalidKey,

    /// The container could not be parsed.
    #[error("Parse failure: {0}")]
    Parse(String),

    /// I/O error while reading the container.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The reader does not support the requested operation.
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl MountError {
    /// Check if this failure means the key did not fit.
    pub fn is_invalid_key(&self) -> bool {
        matches!(self, MountError::InvalidKey)
    }
}

/// Errors surfaced by the provider API.
#[derive(Debug, Error)]
pub enum VfsError {
    /// A key identifier could not be parsed.
    #[error("Invalid key id '{input}': {reason}")]
    InvalidKeyId { input: String, reason: String },

    /// An AES key could not be parsed.
    #[error("Invalid AES key: {0}")]
    InvalidAesKey(String),

    /// Configuration could not be loaded or is malformed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failed to create the Tokio runtime backing the blocking API.
    #[error("Failed to create Tokio runtime: {0}")]
    RuntimeCreation(String),

    /// A blocking method was called from inside an async runtime.
    #[error("Blocking provider call made from an async context; use the _async variant")]
    AsyncContext,

    /// Global data could not be built from the global container.
    #[error("Failed to build global data from '{reader}': {source}")]
    GlobalData {
        reader: String,
        #[source]
        source: MountError,
    },

    /// The tracing subscriber could not be installed.
    #[error("Logging setup failed: {0}")]
    Logging(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
