//! Store error type.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the file-backed stores.
///
/// Callers that treat persistence as best-effort (queue snapshots, audit
/// flushes) log these and carry on; callers that need the record (service
/// lookups) propagate them.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested record does not exist on disk.
    #[error("record not found: {0}")]
    NotFound(String),

    /// An I/O failure while reading or writing a record.
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A record on disk could not be parsed.
    #[error("corrupt record at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A record could not be serialized for writing.
    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Corrupt {
            path: path.into(),
            source,
        }
    }
}
