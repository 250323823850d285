// Source <-> index path mapping
//
// Pure and stateless: an index directory is a function of the source
// directory only. The source's absolute path is mirrored under a fixed
// index root, so lookups never need the registry.

use crate::storage::registry::RegistryStore;
use std::path::{Component, Path, PathBuf};

pub const INDEX_DB_NAME: &str = "_index.db";

#[derive(Debug, Clone)]
pub struct PathMapper {
    index_root: PathBuf,
}

impl PathMapper {
    pub fn new(index_root: impl Into<PathBuf>) -> Self {
        Self {
            index_root: index_root.into(),
        }
    }

    pub fn index_root(&self) -> &Path {
        &self.index_root
    }

    /// Resolve symlinks and `..` once at entry. Paths that do not exist
    /// yet are normalized lexically against the current directory.
    pub fn normalize(path: &Path) -> PathBuf {
        if let Ok(canonical) = std::fs::canonicalize(path) {
            return canonical;
        }

        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf())
        };

        let mut normalized = PathBuf::new();
        for component in absolute.components() {
            match component {
                Component::ParentDir => {
                    normalized.pop();
                }
                Component::CurDir => {}
                other => normalized.push(other.as_os_str()),
            }
        }
        normalized
    }

    /// Mirror a source directory under the index root.
    ///
    /// Unix `/a/b` maps to `<index_root>/a/b`; Windows `C:\a` maps to
    /// `<index_root>/c/a` (drive letter lowercased, colon dropped).
    pub fn source_to_index_dir(&self, source: &Path) -> PathBuf {
        let source = Self::normalize(source);
        let mut index_dir = self.index_root.clone();

        for component in source.components() {
            match component {
                Component::Prefix(prefix) => {
                    let raw = prefix.as_os_str().to_string_lossy();
                    let drive: String = raw
                        .chars()
                        .filter(|c| c.is_ascii_alphanumeric())
                        .collect::<String>()
                        .to_ascii_lowercase();
                    if !drive.is_empty() {
                        index_dir.push(drive);
                    }
                }
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir => {
                    index_dir.pop();
                }
                Component::Normal(name) => index_dir.push(name),
            }
        }

        index_dir
    }

    /// Index database path for a source directory.
    pub fn source_to_index_db(&self, source: &Path) -> PathBuf {
        self.source_to_index_dir(source).join(INDEX_DB_NAME)
    }

    /// Inverse of `source_to_index_dir`. Returns `None` for paths outside
    /// the index root instead of raising.
    pub fn index_to_source(&self, index_dir: &Path) -> Option<PathBuf> {
        let relative = index_dir.strip_prefix(&self.index_root).ok()?;

        #[cfg(windows)]
        {
            let mut components = relative.components();
            let drive = components.next()?;
            let drive = drive.as_os_str().to_string_lossy().to_ascii_uppercase();
            let mut source = PathBuf::from(format!("{drive}:\\"));
            for component in components {
                source.push(component.as_os_str());
            }
            Some(source)
        }

        #[cfg(not(windows))]
        {
            let mut source = PathBuf::from("/");
            source.push(relative);
            Some(source)
        }
    }

    /// Nearest registered project root containing `path`, or `None`.
    pub fn get_project_root(&self, path: &Path, registry: &RegistryStore) -> Option<PathBuf> {
        let path = Self::normalize(path);
        let mut current = Some(path.as_path());
        while let Some(candidate) = current {
            if let Ok(Some(_)) = registry.get_project(candidate) {
                return Some(candidate.to_path_buf());
            }
            current = candidate.parent();
        }
        None
    }

    /// Depth of `path` relative to `root` in components; `None` when
    /// `path` is not under `root`.
    pub fn get_relative_depth(&self, path: &Path, root: &Path) -> Option<usize> {
        let path = Self::normalize(path);
        let root = Self::normalize(root);
        let relative = path.strip_prefix(&root).ok()?;
        Some(relative.components().count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_round_trips_through_index_dir() {
        let mapper = PathMapper::new("/tmp/codexlens-index");
        let source = PathBuf::from("/home/user/project/src");
        let index_dir = mapper.source_to_index_dir(&source);

        assert!(index_dir.starts_with("/tmp/codexlens-index"));
        assert_eq!(mapper.index_to_source(&index_dir), Some(source));
    }

    #[test]
    fn index_db_is_under_index_dir() {
        let mapper = PathMapper::new("/tmp/codexlens-index");
        let db = mapper.source_to_index_db(Path::new("/home/user/project"));
        assert_eq!(db.file_name().unwrap(), INDEX_DB_NAME);
        assert!(db.parent().unwrap().ends_with("home/user/project"));
    }

    #[test]
    fn index_to_source_rejects_foreign_paths() {
        let mapper = PathMapper::new("/tmp/codexlens-index");
        assert_eq!(mapper.index_to_source(Path::new("/somewhere/else")), None);
    }

    #[test]
    fn normalize_collapses_dot_segments() {
        let normalized = PathMapper::normalize(Path::new("/a/b/../c/./d"));
        assert_eq!(normalized, PathBuf::from("/a/c/d"));
    }

    #[test]
    fn relative_depth_counts_components() {
        let mapper = PathMapper::new("/tmp/idx");
        assert_eq!(
            mapper.get_relative_depth(Path::new("/a/b/c"), Path::new("/a")),
            Some(2)
        );
        assert_eq!(
            mapper.get_relative_depth(Path::new("/a"), Path::new("/a")),
            Some(0)
        );
        assert_eq!(
            mapper.get_relative_depth(Path::new("/x"), Path::new("/a")),
            None
        );
    }
}
