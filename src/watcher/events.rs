// File-change events consumed by the incremental indexer

use std::path::PathBuf;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Created,
    Modified,
    Deleted,
    Moved,
}

#[derive(Debug, Clone)]
pub struct FileEvent {
    pub path: PathBuf,
    pub change_type: ChangeType,
    /// Previous path for `Moved` events
    pub old_path: Option<PathBuf>,
    pub timestamp: SystemTime,
}

impl FileEvent {
    pub fn new(path: impl Into<PathBuf>, change_type: ChangeType) -> Self {
        Self {
            path: path.into(),
            change_type,
            old_path: None,
            timestamp: SystemTime::now(),
        }
    }

    pub fn moved(old_path: impl Into<PathBuf>, new_path: impl Into<PathBuf>) -> Self {
        Self {
            path: new_path.into(),
            change_type: ChangeType::Moved,
            old_path: Some(old_path.into()),
            timestamp: SystemTime::now(),
        }
    }
}

/// Aggregate outcome of one event batch.
#[derive(Debug, Default, Clone)]
pub struct IndexResult {
    pub files_indexed: usize,
    pub files_removed: usize,
    pub symbols_added: usize,
    pub errors: Vec<String>,
}
