// Shared fixtures for integration tests

use crate::config::Config;
use crate::index::IndexTreeBuilder;
use crate::paths::PathMapper;
use crate::search::ChainSearchEngine;
use crate::storage::registry::RegistryStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// One scratch project: a source tree plus an isolated data dir holding
/// its registry and index mirror.
pub struct TestProject {
    pub source_dir: TempDir,
    pub data_dir: TempDir,
    pub config: Config,
    pub registry: Arc<RegistryStore>,
}

impl TestProject {
    pub fn new() -> Self {
        let source_dir = TempDir::new().unwrap();
        let data_dir = TempDir::new().unwrap();

        let mut config = Config::default();
        config.data_dir = data_dir.path().to_path_buf();
        config.embedding_dimension = 64;

        let registry = Arc::new(RegistryStore::open(&config.registry_path()).unwrap());

        Self {
            source_dir,
            data_dir,
            config,
            registry,
        }
    }

    /// Canonicalized source root (tempdirs may sit behind symlinks).
    pub fn root(&self) -> PathBuf {
        self.source_dir.path().canonicalize().unwrap()
    }

    pub fn mapper(&self) -> PathMapper {
        PathMapper::new(self.config.index_root())
    }

    pub fn write_file(&self, relative: &str, content: &str) -> PathBuf {
        let path = self.root().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    pub fn builder(&self) -> IndexTreeBuilder {
        IndexTreeBuilder::new(self.registry.clone(), self.mapper(), self.config.clone())
    }

    pub fn build(&self) -> crate::index::BuildResult {
        self.builder().build(&self.root(), None, Some(2), false).unwrap()
    }

    pub fn engine(&self) -> ChainSearchEngine {
        ChainSearchEngine::new(self.registry.clone(), self.mapper(), self.config.clone())
    }

    /// Project index root mirroring the source root.
    pub fn index_root(&self) -> PathBuf {
        self.mapper().source_to_index_dir(&self.root())
    }

    pub fn index_db_for(&self, relative_dir: &str) -> PathBuf {
        let dir = if relative_dir.is_empty() {
            self.root()
        } else {
            self.root().join(relative_dir)
        };
        self.mapper().source_to_index_db(&dir)
    }
}

/// The three-file animal project from which most scenarios start:
/// `a.py` defines `Dog(Animal)`, `b.py` defines `Animal`, `c.py` imports
/// both.
pub fn animal_project() -> TestProject {
    let project = TestProject::new();
    project.write_file("a.py", "class Dog(Animal):\n    def bark(self):\n        return 1\n");
    project.write_file("b.py", "class Animal:\n    pass\n");
    project.write_file(
        "c.py",
        "from animals import Dog, Animal\n\ndef adopt():\n    return Dog()\n",
    );
    project
}

pub fn file_names(paths: &[String]) -> Vec<String> {
    let mut names: Vec<String> = paths
        .iter()
        .map(|p| {
            Path::new(p)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default()
        })
        .collect();
    names.sort();
    names
}
