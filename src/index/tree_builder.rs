// Hierarchical index tree builder
//
// Builds directory indexes bottom-up so subdirectory links always point at
// finished child indexes. Directories at the same depth are independent
// and build concurrently on a worker pool sized `min(cpus, 16)`; each
// worker opens its own database connections, so no SQLite handle ever
// crosses a thread.

use crate::config::Config;
use crate::errors::{CodexLensError, Result};
use crate::parsers::ParserFactory;
use crate::paths::PathMapper;
use crate::storage::dir_index::DirIndexStore;
use crate::storage::global_index::GlobalSymbolIndex;
use crate::storage::registry::RegistryStore;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Directories never worth indexing.
pub const IGNORE_DIRS: &[&str] = &[
    ".git",
    ".venv",
    "venv",
    "node_modules",
    "__pycache__",
    ".codexlens",
    ".idea",
    ".vscode",
];

/// Marker written at every project index root; bumped when the on-disk
/// layout changes incompatibly.
pub const INDEX_VERSION: &str = "2.0";
const INDEX_VERSION_FILE: &str = "_index_version.txt";

fn is_ignored_dir(name: &str) -> bool {
    IGNORE_DIRS.contains(&name) || name.starts_with('.')
}

/// Complete build operation result.
#[derive(Debug)]
pub struct BuildResult {
    pub project_id: i64,
    pub source_root: PathBuf,
    pub index_root: PathBuf,
    pub total_files: u64,
    pub total_dirs: u64,
    /// Files removed by incremental cleanup
    pub files_removed: u64,
    pub errors: Vec<String>,
}

/// Single directory build result.
#[derive(Debug, Clone)]
pub struct DirBuildResult {
    pub source_path: PathBuf,
    pub index_path: PathBuf,
    pub files_count: u64,
    pub symbols_count: u64,
    pub subdirs: Vec<String>,
    pub error: Option<String>,
}

pub struct IndexTreeBuilder {
    registry: Arc<RegistryStore>,
    mapper: PathMapper,
    config: Config,
    incremental: bool,
}

impl IndexTreeBuilder {
    pub fn new(registry: Arc<RegistryStore>, mapper: PathMapper, config: Config) -> Self {
        let incremental = config.incremental;
        Self {
            registry,
            mapper,
            config,
            incremental,
        }
    }

    /// Build the complete index tree for a project.
    pub fn build(
        &self,
        source_root: &Path,
        languages: Option<&[String]>,
        workers: Option<usize>,
        force_full: bool,
    ) -> Result<BuildResult> {
        let source_root = PathMapper::normalize(source_root);
        if !source_root.is_dir() {
            return Err(CodexLensError::Config(format!(
                "source root does not exist: {}",
                source_root.display()
            )));
        }

        let workers = workers.unwrap_or_else(|| num_cpus::get().min(16)).max(1);
        let use_incremental = self.incremental && !force_full;
        info!(
            "Building index tree for {} (incremental={use_incremental}, workers={workers})",
            source_root.display()
        );

        let index_root = self.mapper.source_to_index_dir(&source_root);
        let project = self.registry.register_project(&source_root, &index_root)?;
        std::fs::create_dir_all(&index_root)?;
        std::fs::write(index_root.join(INDEX_VERSION_FILE), INDEX_VERSION)?;
        let global_db_path = GlobalSymbolIndex::default_path(&index_root);
        if self.config.global_symbol_index_enabled {
            // Create the database up front so workers only ever open it.
            GlobalSymbolIndex::open(&global_db_path, project.id)?;
        }

        let dirs_by_depth = self.collect_dirs_by_depth(&source_root, languages);
        if dirs_by_depth.is_empty() {
            warn!("No indexable directories found in {}", source_root.display());
            return Ok(BuildResult {
                project_id: project.id,
                source_root,
                index_root,
                total_files: 0,
                total_dirs: 0,
                files_removed: 0,
                errors: vec!["No indexable directories found".into()],
            });
        }

        let mut total_files = 0;
        let mut total_dirs = 0;
        let mut all_errors = Vec::new();
        let mut all_results: Vec<DirBuildResult> = Vec::new();

        // Bottom-up: deepest level first.
        for (depth, dirs) in dirs_by_depth.iter().rev() {
            debug!("Building {} directories at depth {depth}", dirs.len());
            let results = self.build_level_parallel(
                dirs,
                languages,
                workers,
                project.id,
                &global_db_path,
                use_incremental,
            );

            for result in &results {
                if let Some(error) = &result.error {
                    all_errors.push(format!("{}: {error}", result.source_path.display()));
                    continue;
                }

                total_files += result.files_count;
                total_dirs += 1;

                let dir_depth = self
                    .mapper
                    .get_relative_depth(&result.source_path, &source_root)
                    .unwrap_or(0) as u32;
                self.registry.register_dir(
                    project.id,
                    &result.source_path,
                    &result.index_path,
                    dir_depth,
                    result.files_count,
                )?;
            }

            all_results.extend(results);
        }

        // Second pass: link every child index into its parent.
        for result in &all_results {
            if result.error.is_none() {
                self.link_children_to_parent(&result.source_path, &all_results);
            }
        }

        let mut files_removed = 0_u64;
        if use_incremental {
            debug!("Cleaning up deleted files");
            for result in &all_results {
                if result.error.is_some() {
                    continue;
                }
                match DirIndexStore::open_with_options(
                    &result.index_path,
                    self.config.content_hash_enabled,
                ) {
                    Ok(store) => {
                        match store.cleanup_deleted_files(&result.source_path) {
                            Ok(deleted) if deleted > 0 => {
                                files_removed += deleted as u64;
                                if let Err(e) = store.compute_graph_neighbors(2) {
                                    warn!(
                                        "Graph neighbor recompute failed for {}: {e}",
                                        result.source_path.display()
                                    );
                                }
                            }
                            Ok(_) => {}
                            Err(e) => warn!(
                                "Cleanup failed for {}: {e}",
                                result.source_path.display()
                            ),
                        }
                        if let Err(e) = store.update_merkle_root() {
                            warn!(
                                "Merkle update failed for {}: {e}",
                                result.source_path.display()
                            );
                        }
                    }
                    Err(e) => warn!(
                        "Cleanup could not open {}: {e}",
                        result.index_path.display()
                    ),
                }
            }
        }

        self.registry
            .update_project_stats(&source_root, total_files, total_dirs)?;

        info!(
            "Index build complete: {total_files} files, {total_dirs} directories, {} errors",
            all_errors.len()
        );

        Ok(BuildResult {
            project_id: project.id,
            source_root,
            index_root,
            total_files,
            total_dirs,
            files_removed,
            errors: all_errors,
        })
    }

    /// Rebuild the subtree rooted at `source_path` (must already be part of
    /// a registered project).
    pub fn update_subtree(
        &self,
        source_path: &Path,
        languages: Option<&[String]>,
        workers: Option<usize>,
    ) -> Result<BuildResult> {
        let source_path = PathMapper::normalize(source_path);
        let project_root = self
            .mapper
            .get_project_root(&source_path, &self.registry)
            .ok_or_else(|| {
                CodexLensError::Config(format!("directory not indexed: {}", source_path.display()))
            })?;
        debug!(
            "Updating subtree {} of project {}",
            source_path.display(),
            project_root.display()
        );
        self.build(&source_path, languages, workers, false)
    }

    /// Rebuild a single directory without touching its children.
    pub fn rebuild_dir(&self, source_path: &Path) -> Result<DirBuildResult> {
        let source_path = PathMapper::normalize(source_path);
        let project_root = self
            .mapper
            .get_project_root(&source_path, &self.registry)
            .ok_or_else(|| {
                CodexLensError::Config(format!("directory not indexed: {}", source_path.display()))
            })?;
        let project = self
            .registry
            .get_project(&project_root)?
            .ok_or_else(|| CodexLensError::Config("project not registered".into()))?;

        let global_db_path = GlobalSymbolIndex::default_path(&project.index_root);
        Ok(self.build_single_dir(&source_path, None, project.id, &global_db_path, self.incremental))
    }

    // === Internal ===

    /// All indexable directories grouped by depth relative to the root.
    /// The root itself always participates at depth 0 so chain search has
    /// an entry point.
    fn collect_dirs_by_depth(
        &self,
        source_root: &Path,
        languages: Option<&[String]>,
    ) -> BTreeMap<usize, Vec<PathBuf>> {
        let mut dirs_by_depth: BTreeMap<usize, Vec<PathBuf>> = BTreeMap::new();
        dirs_by_depth.insert(0, vec![source_root.to_path_buf()]);

        for entry in walkdir::WalkDir::new(source_root)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| {
                !e.file_type().is_dir()
                    || !is_ignored_dir(&e.file_name().to_string_lossy())
            })
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_dir() {
                continue;
            }
            let dir_path = entry.path();
            if !self.has_indexable_files_recursive(dir_path, languages) {
                continue;
            }
            dirs_by_depth
                .entry(entry.depth())
                .or_default()
                .push(dir_path.to_path_buf());
        }

        dirs_by_depth
    }

    fn has_indexable_files_recursive(&self, dir: &Path, languages: Option<&[String]>) -> bool {
        if !self.source_files_in(dir, languages).is_empty() {
            return true;
        }

        let Ok(entries) = std::fs::read_dir(dir) else {
            return false;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if is_ignored_dir(&entry.file_name().to_string_lossy()) {
                continue;
            }
            if self.has_indexable_files_recursive(&path, languages) {
                return true;
            }
        }
        false
    }

    /// Supported source files directly inside `dir` (non-recursive).
    fn source_files_in(&self, dir: &Path, languages: Option<&[String]>) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return Vec::new();
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|path| {
                if !path.is_file() {
                    return false;
                }
                if path
                    .file_name()
                    .map(|n| n.to_string_lossy().starts_with('.'))
                    .unwrap_or(true)
                {
                    return false;
                }
                match self.config.language_for_path(path) {
                    Some(language) => languages
                        .map(|allowed| allowed.iter().any(|l| l == &language))
                        .unwrap_or(true),
                    None => false,
                }
            })
            .collect();
        files.sort();
        files
    }

    fn build_level_parallel(
        &self,
        dirs: &[PathBuf],
        languages: Option<&[String]>,
        workers: usize,
        project_id: i64,
        global_db_path: &Path,
        use_incremental: bool,
    ) -> Vec<DirBuildResult> {
        if dirs.is_empty() {
            return Vec::new();
        }
        if dirs.len() == 1 {
            return vec![self.build_single_dir(
                &dirs[0],
                languages,
                project_id,
                global_db_path,
                use_incremental,
            )];
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.min(dirs.len()))
            .build();

        match pool {
            Ok(pool) => pool.install(|| {
                use rayon::prelude::*;
                dirs.par_iter()
                    .map(|dir| {
                        self.build_single_dir(
                            dir,
                            languages,
                            project_id,
                            global_db_path,
                            use_incremental,
                        )
                    })
                    .collect()
            }),
            Err(e) => {
                warn!("Worker pool unavailable ({e}), building sequentially");
                dirs.iter()
                    .map(|dir| {
                        self.build_single_dir(
                            dir,
                            languages,
                            project_id,
                            global_db_path,
                            use_incremental,
                        )
                    })
                    .collect()
            }
        }
    }

    /// Build one directory index. Never panics outward: any failure comes
    /// back as `DirBuildResult.error` so a broken directory cannot abort
    /// the level.
    fn build_single_dir(
        &self,
        dir_path: &Path,
        languages: Option<&[String]>,
        project_id: i64,
        global_db_path: &Path,
        use_incremental: bool,
    ) -> DirBuildResult {
        let index_db_path = self.mapper.source_to_index_db(dir_path);

        match self.build_single_dir_inner(
            dir_path,
            &index_db_path,
            languages,
            project_id,
            global_db_path,
            use_incremental,
        ) {
            Ok((files_count, symbols_count, subdirs)) => DirBuildResult {
                source_path: dir_path.to_path_buf(),
                index_path: index_db_path,
                files_count,
                symbols_count,
                subdirs,
                error: None,
            },
            Err(e) => DirBuildResult {
                source_path: dir_path.to_path_buf(),
                index_path: index_db_path,
                files_count: 0,
                symbols_count: 0,
                subdirs: Vec::new(),
                error: Some(e.to_string()),
            },
        }
    }

    fn build_single_dir_inner(
        &self,
        dir_path: &Path,
        index_db_path: &Path,
        languages: Option<&[String]>,
        project_id: i64,
        global_db_path: &Path,
        use_incremental: bool,
    ) -> Result<(u64, u64, Vec<String>)> {
        let store =
            DirIndexStore::open_with_options(index_db_path, self.config.content_hash_enabled)?;
        let global_index = if self.config.global_symbol_index_enabled {
            Some(GlobalSymbolIndex::open(global_db_path, project_id)?)
        } else {
            None
        };
        let parser_factory = ParserFactory::new(&self.config);

        let mut files_count = 0_u64;
        let mut symbols_count = 0_u64;
        let mut skipped = 0_u64;

        for file_path in self.source_files_in(dir_path, languages) {
            if use_incremental && !store.needs_reindex(&file_path)? {
                skipped += 1;
                continue;
            }

            let Ok(text) = std::fs::read_to_string(&file_path) else {
                debug!("Skipping unreadable file {}", file_path.display());
                continue;
            };
            let Some(language) = self.config.language_for_path(&file_path) else {
                continue;
            };

            let parsed = parser_factory.parse(&text, &file_path, &language);
            let file_name = file_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();

            match store.add_file(
                &file_name,
                &file_path,
                &text,
                &language,
                &parsed.symbols,
                &parsed.relationships,
            ) {
                Ok(_) => {
                    files_count += 1;
                    symbols_count += parsed.symbols.len() as u64;
                }
                Err(e) => {
                    debug!("Failed to index {}: {e}", file_path.display());
                    continue;
                }
            }

            if let Some(global_index) = &global_index {
                if let Err(e) =
                    global_index.update_file_symbols(&file_path, index_db_path, &parsed.symbols)
                {
                    warn!("Global symbol update failed for {}: {e}", file_path.display());
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
                    if !filtered.is_empty() {
                        if let Err(e) = global_index.update_file_relationships(&file_path, &filtered)
                        {
                            warn!(
                                "Global relationship update failed for {}: {e}",
                                file_path.display()
                            );
                        }
                    }
                }
            }
        }

        if files_count > 0 {
            store.compute_graph_neighbors(2)?;
        }

        let mut subdirs: Vec<String> = std::fs::read_dir(dir_path)?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| !is_ignored_dir(name))
            .collect();
        subdirs.sort();

        store.update_merkle_root()?;

        if skipped > 0 {
            debug!(
                "Built {}: {files_count} indexed, {skipped} unchanged, {symbols_count} symbols",
                dir_path.display()
            );
        }

        Ok((files_count, symbols_count, subdirs))
    }

    fn link_children_to_parent(&self, parent_path: &Path, all_results: &[DirBuildResult]) {
        let parent_index_db = self.mapper.source_to_index_db(parent_path);

        let store = match DirIndexStore::open_with_options(
            &parent_index_db,
            self.config.content_hash_enabled,
        ) {
            Ok(store) => store,
            Err(e) => {
                warn!("Failed to open parent index {}: {e}", parent_index_db.display());
                return;
            }
        };

        for result in all_results {
            if result.error.is_some() || result.source_path.parent() != Some(parent_path) {
                continue;
            }
            let name = result
                .source_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if let Err(e) = store.register_subdir(
                &name,
                &result.index_path,
                result.files_count,
                result.files_count,
            ) {
                warn!("Failed to link {} into {}: {e}", name, parent_path.display());
            }
        }

        if let Err(e) = store.update_merkle_root() {
            warn!("Merkle update failed for {}: {e}", parent_path.display());
        }
    }
}
