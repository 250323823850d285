// Incremental indexer
//
// Applies batches of file-change events to the per-directory stores and
// the global symbol index. Errors are per-event; a bad file lands in the
// batch result instead of aborting the batch. Per-directory stores and
// the global index are cached for the indexer's lifetime.

use crate::config::Config;
use crate::errors::Result;
use crate::parsers::ParserFactory;
use crate::paths::PathMapper;
use crate::storage::dir_index::DirIndexStore;
use crate::storage::global_index::GlobalSymbolIndex;
use crate::storage::registry::RegistryStore;
use crate::watcher::events::{ChangeType, FileEvent, IndexResult};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

pub struct IncrementalIndexer {
    registry: Arc<RegistryStore>,
    mapper: PathMapper,
    config: Config,
    parser_factory: ParserFactory,
    dir_stores: Mutex<HashMap<PathBuf, Arc<DirIndexStore>>>,
    global_index: Mutex<Option<Arc<GlobalSymbolIndex>>>,
}

struct FileIndexOutcome {
    symbols_count: usize,
}

impl IncrementalIndexer {
    pub fn new(registry: Arc<RegistryStore>, mapper: PathMapper, config: Config) -> Self {
        let parser_factory = ParserFactory::new(&config);
        Self {
            registry,
            mapper,
            config,
            parser_factory,
            dir_stores: Mutex::new(HashMap::new()),
            global_index: Mutex::new(None),
        }
    }

    /// Process a batch of file events.
    pub fn process_changes(&self, events: &[FileEvent]) -> IndexResult {
        let mut result = IndexResult::default();

        for event in events {
            match event.change_type {
                ChangeType::Created | ChangeType::Modified => {
                    self.apply_upsert(&event.path, &mut result);
                }
                ChangeType::Deleted => {
                    self.apply_delete(&event.path, &mut result);
                }
                ChangeType::Moved => {
                    if let Some(old_path) = &event.old_path {
                        self.apply_delete(old_path, &mut result);
                    }
                    self.apply_upsert(&event.path, &mut result);
                }
            }
        }

        result
    }

    fn apply_upsert(&self, path: &Path, result: &mut IndexResult) {
        match self.index_file(path) {
            Ok(Some(outcome)) => {
                result.files_indexed += 1;
                result.symbols_added += outcome.symbols_count;
            }
            Ok(None) => {}
            Err(e) => result.errors.push(format!("{}: {e}", path.display())),
        }
    }

    fn apply_delete(&self, path: &Path, result: &mut IndexResult) {
        match self.remove_file(path) {
            Ok(true) => result.files_removed += 1,
            Ok(false) => {}
            Err(e) => result.errors.push(format!("{}: {e}", path.display())),
        }
    }

    /// Index one file in place. `Ok(None)` means the file is not ours to
    /// index (unsupported language or unindexed directory).
    fn index_file(&self, path: &Path) -> Result<Option<FileIndexOutcome>> {
        let path = PathMapper::normalize(path);
        if !path.is_file() {
            return Ok(None);
        }
        let Some(language) = self.config.language_for_path(&path) else {
            return Ok(None);
        };
        let dir_path = path.parent().unwrap_or(Path::new("/")).to_path_buf();
        let Some(store) = self.get_dir_store(&dir_path)? else {
            debug!("Directory not indexed, skipping {}", path.display());
            return Ok(None);
        };

        let content = std::fs::read_to_string(&path).unwrap_or_default();
        let parsed = self.parser_factory.parse(&content, &path, &language);
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        // `add_file` already retries transient lock errors internally.
        store.add_file(
            &file_name,
            &path,
            &content,
            &language,
            &parsed.symbols,
            &parsed.relationships,
        )?;
        store.compute_graph_neighbors(2)?;
        store.update_merkle_root()?;

        if let Some(global_index) = self.get_global_index(&dir_path)? {
            if let Err(e) =
                global_index.update_file_symbols(&path, store.db_path(), &parsed.symbols)
            {
                warn!("Global symbol update failed for {}: {e}", path.display());
            }
            if self.config.static_graph_enabled {
                let filtered: Vec<_> = parsed
                    .relationships
                    .iter()
                    .filter(|r| {
                        self.config
                            .static_graph_relationship_types
                            .iter()
                            .any(|t| t == r.kind.as_str())
                    })
                    .cloned()
                    .collect();
                if let Err(e) = global_index.update_file_relationships(&path, &filtered) {
                    warn!(
                        "Global relationship update failed for {}: {e}",
                        path.display()
                    );
                }
            }
        }

        debug!("Indexed {} ({} symbols)", path.display(), parsed.symbols.len());
        Ok(Some(FileIndexOutcome {
            symbols_count: parsed.symbols.len(),
        }))
    }

    fn remove_file(&self, path: &Path) -> Result<bool> {
        let path = PathMapper::normalize(path);
        let dir_path = path.parent().unwrap_or(Path::new("/")).to_path_buf();
        let Some(store) = self.get_dir_store(&dir_path)? else {
            debug!("Cannot remove, directory not indexed: {}", dir_path.display());
            return Ok(false);
        };

        let removed = store.remove_file(&path)?;
        if removed {
            store.compute_graph_neighbors(2)?;
        }
        store.update_merkle_root()?;

        if let Some(global_index) = self.get_global_index(&dir_path)? {
            if let Err(e) = global_index.remove_file_symbols(&path) {
                warn!("Global symbol removal failed for {}: {e}", path.display());
            }
            if let Err(e) = global_index.delete_file_relationships(&path) {
                warn!(
                    "Global relationship removal failed for {}: {e}",
                    path.display()
                );
            }
        }

        if removed {
            debug!("Removed {} from index", path.display());
        }
        Ok(removed)
    }

    fn get_dir_store(&self, dir_path: &Path) -> Result<Option<Arc<DirIndexStore>>> {
        let mut stores = self.dir_stores.lock().unwrap();
        if let Some(store) = stores.get(dir_path) {
            return Ok(Some(store.clone()));
        }

        let index_db = self.mapper.source_to_index_db(dir_path);
        if !index_db.is_file() {
            return Ok(None);
        }

        let store = Arc::new(DirIndexStore::open_with_options(
            &index_db,
            self.config.content_hash_enabled,
        )?);
        stores.insert(dir_path.to_path_buf(), store.clone());
        Ok(Some(store))
    }

    fn get_global_index(&self, dir_path: &Path) -> Result<Option<Arc<GlobalSymbolIndex>>> {
        if !self.config.global_symbol_index_enabled {
            return Ok(None);
        }

        let mut cached = self.global_index.lock().unwrap();
        if let Some(index) = cached.as_ref() {
            return Ok(Some(index.clone()));
        }

        let source_root = self
            .mapper
            .get_project_root(dir_path, &self.registry)
            .unwrap_or_else(|| dir_path.to_path_buf());
        let index_root = self.mapper.source_to_index_dir(&source_root);
        let global_db = GlobalSymbolIndex::default_path(&index_root);
        if !global_db.is_file() {
            return Ok(None);
        }

        let project_id = self
            .registry
            .get_project(&source_root)?
            .map(|p| p.id)
            .unwrap_or(0);
        let index = Arc::new(GlobalSymbolIndex::open(&global_db, project_id)?);
        *cached = Some(index.clone());
        Ok(Some(index.clone()))
    }

    /// Drop all cached store handles.
    pub fn close(&self) {
        self.dir_stores.lock().unwrap().clear();
        *self.global_index.lock().unwrap() = None;
    }
}
