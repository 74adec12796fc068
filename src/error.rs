//! Error taxonomy for the filter engine and the command protocol in front of it.
//!
//! Mirrors the taxonomy bloomd's Python implementation enforces by convention
//! (`ClientError`, `NotFound`, `AlreadyExists`, format/IO failures, internal
//! exceptions) as a closed, matchable enum instead of ad hoc exception
//! classes.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, BloomdError>;

#[derive(Error, Debug)]
pub enum BloomdError {
    /// Malformed request: bad name, bad arguments, unknown command.
    #[error("Client Error: {0}")]
    ClientError(String),

    /// Operation named a filter absent from the registry.
    #[error("Filter does not exist")]
    NotFound,

    /// `create` on a name that is already registered.
    #[error("Exists")]
    AlreadyExists,

    /// On-disk data incompatible with the configured/expected size or magic.
    #[error("format mismatch at {path}: {reason}")]
    FormatMismatch { path: PathBuf, reason: String },

    /// Disk or mmap failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Config (de)serialization failure.
    #[error("config error: {0}")]
    Config(#[from] serde_yaml::Error),

    /// Any unexpected internal failure, logged with full detail and
    /// surfaced to TCP clients as a bare `Internal Error`.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BloomdError {
    /// True for the subset of errors that should never be retried
    /// automatically (client mistakes, not transient failures).
    pub fn is_client_fault(&self) -> bool {
        matches!(self, BloomdError::ClientError(_))
    }
}
