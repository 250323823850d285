// Error types shared across the crate

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodexLensError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Storage error: {message}")]
    Storage { message: String, transient: bool },

    #[error("Parse error in {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Search error: {0}")]
    Search(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error(
        "Model lock conflict: index is locked to {locked_backend}/{locked_model} (dim {locked_dimension}), requested {requested_backend}/{requested_model}"
    )]
    ModelLockConflict {
        locked_backend: String,
        locked_model: String,
        locked_dimension: usize,
        requested_backend: String,
        requested_model: String,
    },
}

impl CodexLensError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            transient: false,
        }
    }

    /// True for "database busy/locked" kinds that are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage { transient: true, .. })
    }
}

impl From<rusqlite::Error> for CodexLensError {
    fn from(err: rusqlite::Error) -> Self {
        let transient = matches!(
            err.sqlite_error_code(),
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
        );
        Self::Storage {
            message: err.to_string(),
            transient,
        }
    }
}

impl From<std::io::Error> for CodexLensError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            Self::Permission(err.to_string())
        } else {
            Self::Storage {
                message: err.to_string(),
                transient: false,
            }
        }
    }
}

impl From<serde_json::Error> for CodexLensError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage {
            message: format!("serialization: {err}"),
            transient: false,
        }
    }
}

pub type Result<T> = std::result::Result<T, CodexLensError>;

/// Retry a single-row write up to three times on transient storage errors,
/// sleeping 100ms, 200ms, 400ms between attempts.
pub fn retry_transient<T>(mut op: impl FnMut() -> Result<T>) -> Result<T> {
    const MAX_ATTEMPTS: u32 = 3;
    let mut attempt = 0;
    loop {
        match op() {
            Err(err) if err.is_transient() && attempt + 1 < MAX_ATTEMPTS => {
                let wait = std::time::Duration::from_millis(100 * (1 << attempt));
                tracing::debug!(
                    "Transient storage error (attempt {}/{}), retrying in {:?}: {}",
                    attempt + 1,
                    MAX_ATTEMPTS,
                    wait,
                    err
                );
                std::thread::sleep(wait);
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn retry_gives_up_after_three_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_transient(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CodexLensError::Storage {
                message: "database is locked".into(),
                transient: true,
            })
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn retry_does_not_repeat_fatal_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_transient(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CodexLensError::storage("disk I/O error"))
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
