//! Store error types

use std::path::{Path, PathBuf};

/// Errors raised by the durable stores
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem failure
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        /// File or directory involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Record could not be encoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Record exists but cannot be decoded
    #[error("corrupt record at {}: {reason}", path.display())]
    Corrupt {
        /// Offending file
        path: PathBuf,
        /// Decoder message
        reason: String,
    },

    /// Identifier not usable as a file name
    #[error("invalid identifier: {0:?}")]
    InvalidId(String),
}

impl StoreError {
    /// Wrap an I/O error with the path it concerns
    pub(crate) fn io(path: impl AsRef<Path>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.as_ref().to_path_buf();
        move |source| Self::Io { path, source }
    }

    /// True for records that exist but could not be decoded
    #[inline]
    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }
}

/// Result alias for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Reject ids that would escape their directory or are empty
pub(crate) fn check_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id.len() <= 200
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidId(id.to_string()))
    }
}
