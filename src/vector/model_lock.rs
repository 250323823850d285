// Embedding model lock
//
// Every project index root is locked to one (backend, model, dimension)
// triple. Embedding under a different lock requires an explicit force
// flag; otherwise mixed-dimension vectors would silently corrupt the ANN
// index. The persisted row lives in `_vectors_meta.db`; a process-wide
// registry keeps the active locks out of the hot path.

use crate::errors::{CodexLensError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelLock {
    pub backend: String,
    pub model: String,
    pub dimension: usize,
    pub locked_at: i64,
}

impl ModelLock {
    pub fn new(backend: &str, model: &str, dimension: usize) -> Self {
        Self {
            backend: backend.to_string(),
            model: model.to_string(),
            dimension,
            locked_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn matches(&self, backend: &str, model: &str, dimension: usize) -> bool {
        self.backend == backend && self.model == model && self.dimension == dimension
    }

    pub fn conflict_with(&self, backend: &str, model: &str) -> CodexLensError {
        CodexLensError::ModelLockConflict {
            locked_backend: self.backend.clone(),
            locked_model: self.model.clone(),
            locked_dimension: self.dimension,
            requested_backend: backend.to_string(),
            requested_model: model.to_string(),
        }
    }
}

fn registry() -> &'static Mutex<HashMap<PathBuf, ModelLock>> {
    static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, ModelLock>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Validate (and acquire, when absent) the active lock for an index root.
///
/// `persisted` is the lock read from disk, if any. With `force` set a
/// mismatched lock is replaced; without it the mismatch is a
/// `ModelLockConflict`.
pub fn ensure_lock(
    index_root: &Path,
    persisted: Option<ModelLock>,
    backend: &str,
    model: &str,
    dimension: usize,
    force: bool,
) -> Result<ModelLock> {
    let mut locks = registry().lock().unwrap();
    let key = index_root.to_path_buf();

    let active = locks.get(&key).cloned().or(persisted);

    match active {
        Some(lock) if lock.matches(backend, model, dimension) => {
            locks.insert(key, lock.clone());
            Ok(lock)
        }
        Some(lock) if !force => Err(lock.conflict_with(backend, model)),
        _ => {
            let lock = ModelLock::new(backend, model, dimension);
            locks.insert(key, lock.clone());
            Ok(lock)
        }
    }
}

/// Drop the in-process lock for an index root (used by `clean`).
pub fn release_lock(index_root: &Path) {
    registry().lock().unwrap().remove(index_root);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatched_lock_requires_force() {
        let root = PathBuf::from("/idx/model-lock-test-a");
        release_lock(&root);

        let lock = ensure_lock(&root, None, "builtin", "hash-384", 384, false).unwrap();
        assert_eq!(lock.dimension, 384);

        let err = ensure_lock(&root, None, "builtin", "hash-768", 768, false).unwrap_err();
        assert!(matches!(err, CodexLensError::ModelLockConflict { .. }));

        let replaced = ensure_lock(&root, None, "builtin", "hash-768", 768, true).unwrap();
        assert_eq!(replaced.dimension, 768);
        release_lock(&root);
    }

    #[test]
    fn persisted_lock_is_honored_on_first_touch() {
        let root = PathBuf::from("/idx/model-lock-test-b");
        release_lock(&root);

        let persisted = ModelLock::new("builtin", "hash-256", 256);
        let err =
            ensure_lock(&root, Some(persisted.clone()), "builtin", "hash-384", 384, false)
                .unwrap_err();
        assert!(matches!(err, CodexLensError::ModelLockConflict { .. }));

        let ok = ensure_lock(&root, Some(persisted), "builtin", "hash-256", 256, false).unwrap();
        assert_eq!(ok.model, "hash-256");
        release_lock(&root);
    }
}
