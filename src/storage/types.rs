//! Storage error taxonomy and statistics.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Anything that can go wrong between the store and the file system.
///
/// Never leaves the storage layer: corruption wipes the store, write failures
/// keep the last committed state, and both are logged where they happen.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("corrupt history file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("history I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("history codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl StoreError {
    pub fn corrupt(path: &Path, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    /// True when the committed data can no longer be trusted.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupt { .. } | Self::Codec(_))
    }

    /// Reclassify a failure to read committed data as corruption.
    pub fn into_corruption(self, path: &Path) -> Self {
        match self {
            Self::Io(e) => Self::corrupt(path, e.to_string()),
            Self::Codec(e) => Self::corrupt(path, e.to_string()),
            corrupt => corrupt,
        }
    }
}

/// Statistics about the committed depth files.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Number of depth files present
    pub depth_files: usize,
    /// Deepest depth with a file, if any
    pub deepest: Option<usize>,
    /// Stored snapshot entries across all depths
    pub snapshots: usize,
    /// Bytes on disk across all depth files
    pub bytes: u64,
}
