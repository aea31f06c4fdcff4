//! Error taxonomy for the object-store boundary.
//!
//! Everything else in the crate uses `anyhow`; the store keeps a typed
//! error so [`BucketObject`](crate::store::BucketObject) can tell a missing
//! remote object apart from a missing local file or a credentials problem
//! before turning the result into a logged boolean.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// The remote object (or its bucket) does not exist.
    #[error("object not found: {key}")]
    NotFound { key: String },

    /// A file that was supposed to be uploaded is not on disk.
    #[error("local file not found: {}", .0.display())]
    LocalFileMissing(PathBuf),

    /// Credentials are missing or were rejected by the service.
    #[error("credentials error: {0}")]
    Credentials(String),

    /// Any other non-success response.
    #[error("storage request failed (HTTP {status}): {message}")]
    Http { status: u16, message: String },

    #[error("storage transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}
