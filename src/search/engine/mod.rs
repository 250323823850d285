// Parallel chain search engine
//
// Searches across the hierarchy of directory indexes reachable from a
// starting path: exact index first, nearest registered ancestor second,
// then `subdirs` links downward under a depth bound. Per-index searches
// run on a shared lazy thread pool; vector and hybrid operations run on a
// single-threaded lane so the embedding backend is never entered
// concurrently.

mod cascade;
mod staged;

pub use cascade::write_legacy_sidecar;

use crate::config::Config;
use crate::errors::Result;
use crate::paths::PathMapper;
use crate::search::graph_expander::GraphExpander;
use crate::search::hybrid::{HybridSearchEngine, HybridWeights};
use crate::search::lsp::{KeepaliveKey, LspBridge, LspBridgeFactory};
use crate::search::ranking::group_similar_results;
use crate::search::reranker::{LexicalReranker, Reranker};
use crate::search::results::{ChainSearchResult, ReferenceResult, SearchOptions, SearchStats};
use crate::storage::dir_index::DirIndexStore;
use crate::storage::global_index::GlobalSymbolIndex;
use crate::storage::registry::RegistryStore;
use crate::types::{SearchResult, Symbol};
use crate::vector::{EmbeddingProvider, HashEmbedder, VectorStore};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;
use tracing::{debug, warn};

pub struct ChainSearchEngine {
    registry: Arc<RegistryStore>,
    mapper: PathMapper,
    config: Config,
    embedder: Arc<dyn EmbeddingProvider>,
    reranker: Arc<dyn Reranker>,
    lsp_factory: Option<Arc<dyn LspBridgeFactory>>,
    pool: OnceLock<rayon::ThreadPool>,
    keepalive: Mutex<Option<(KeepaliveKey, Arc<dyn LspBridge>)>>,
    /// (workspace_root, config_file) pairs already warmed up
    warmed: Mutex<HashSet<(PathBuf, Option<PathBuf>)>>,
    vector_stores: Mutex<HashMap<PathBuf, Arc<VectorStore>>>,
}

impl ChainSearchEngine {
    pub fn new(registry: Arc<RegistryStore>, mapper: PathMapper, config: Config) -> Self {
        let embedder: Arc<dyn EmbeddingProvider> =
            Arc::new(HashEmbedder::new(config.embedding_dimension));
        Self {
            registry,
            mapper,
            config,
            embedder,
            reranker: Arc::new(LexicalReranker),
            lsp_factory: None,
            pool: OnceLock::new(),
            keepalive: Mutex::new(None),
            warmed: Mutex::new(HashSet::new()),
            vector_stores: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = reranker;
        self
    }

    pub fn with_lsp_factory(mut self, factory: Arc<dyn LspBridgeFactory>) -> Self {
        self.lsp_factory = Some(factory);
        self
    }

    /// Stop the keep-alive bridge and drop cached stores.
    pub fn close(&self) {
        if let Some((_, bridge)) = self.keepalive.lock().unwrap().take() {
            bridge.stop();
        }
        self.vector_stores.lock().unwrap().clear();
    }

    /// Standard chain search: parallel per-index FTS (or hybrid/vector),
    /// aggregated, deduplicated by path, ranked, paginated.
    pub fn search(
        &self,
        query: &str,
        source_path: &Path,
        options: &SearchOptions,
    ) -> ChainSearchResult {
        if options.enable_cascade {
            return self.cascade_search(
                self.config.cascade_strategy,
                query,
                source_path,
                options.total_limit,
                self.config.cascade_coarse_k,
                options,
            );
        }

        let start_time = Instant::now();
        let mut stats = SearchStats::default();

        let Some(start_index) = self.find_start_index(source_path) else {
            warn!("No index found for {}", source_path.display());
            stats.time_ms = start_time.elapsed().as_secs_f64() * 1000.0;
            return ChainSearchResult {
                query: query.to_string(),
                stats,
                ..Default::default()
            };
        };

        let index_paths = self.collect_index_paths(&start_index, options.depth);
        stats.dirs_searched = index_paths.len();
        if index_paths.is_empty() {
            stats.time_ms = start_time.elapsed().as_secs_f64() * 1000.0;
            return ChainSearchResult {
                query: query.to_string(),
                stats,
                ..Default::default()
            };
        }

        let mut results = self.search_parallel(&index_paths, query, options, &mut stats);

        if options.code_only || options.exclude_extensions.is_some() {
            results = filter_by_extension(
                results,
                options.code_only,
                options.exclude_extensions.as_deref(),
            );
        }

        let mut final_results = merge_and_rank(results, options.total_limit, options.offset);

        if options.group_results {
            final_results = group_similar_results(final_results, options.grouping_threshold);
        }

        stats.files_matched = final_results.len();

        let symbols = if options.include_symbols {
            self.search_symbols_parallel(&index_paths, query, None, options.total_limit)
        } else {
            Vec::new()
        };

        let related_results = if self.config.enable_graph_expansion {
            let expander = GraphExpander::new(&self.mapper);
            expander
                .expand(&final_results, 10, 50)
                .unwrap_or_else(|e| {
                    debug!("Graph expansion failed: {e}");
                    Vec::new()
                })
        } else {
            Vec::new()
        };

        stats.time_ms = start_time.elapsed().as_secs_f64() * 1000.0;

        ChainSearchResult {
            query: query.to_string(),
            results: final_results,
            related_results,
            symbols,
            stats,
        }
    }

    /// Paths only; faster when excerpts are not needed.
    pub fn search_files_only(
        &self,
        query: &str,
        source_path: &Path,
        options: &SearchOptions,
    ) -> Vec<String> {
        let mut options = options.clone();
        options.files_only = true;
        self.search(query, source_path, &options)
            .results
            .into_iter()
            .map(|r| r.path)
            .collect()
    }

    /// Chain symbol search. Prefers the project-wide global index (with a
    /// depth filter relative to the start directory); falls back to the
    /// per-directory stores.
    pub fn search_symbols(
        &self,
        name: &str,
        source_path: &Path,
        kind: Option<&str>,
        options: &SearchOptions,
    ) -> Vec<Symbol> {
        let Some(start_index) = self.find_start_index(source_path) else {
            warn!("No index found for {}", source_path.display());
            return Vec::new();
        };

        if self.config.global_symbol_index_enabled {
            if let Some(symbols) =
                self.global_symbol_fast_path(name, source_path, kind, options)
            {
                return symbols;
            }
        }

        let index_paths = self.collect_index_paths(&start_index, options.depth);
        self.search_symbols_parallel(&index_paths, name, kind, options.total_limit)
    }

    fn global_symbol_fast_path(
        &self,
        name: &str,
        source_path: &Path,
        kind: Option<&str>,
        options: &SearchOptions,
    ) -> Option<Vec<Symbol>> {
        let mut search_root = PathMapper::normalize(source_path);
        if !self.mapper.source_to_index_db(&search_root).is_file() {
            let nearest = self.registry.find_nearest_index(&search_root).ok()??;
            search_root = nearest.source_path;
        }

        let project_root = self.mapper.get_project_root(&search_root, &self.registry)?;
        let project = self.registry.get_project(&project_root).ok()??;
        let global_db = GlobalSymbolIndex::default_path(&project.index_root);
        if !global_db.is_file() {
            return None;
        }

        let global_index = GlobalSymbolIndex::open(&global_db, project.id).ok()?;
        let query_limit = options.total_limit.saturating_mul(10).max(options.total_limit);
        let candidates = global_index.search(name, kind, false, query_limit).ok()?;

        let mut filtered = Vec::new();
        for symbol in candidates {
            let Some(file) = &symbol.file else { continue };
            let file_dir = Path::new(file).parent().unwrap_or(Path::new(""));
            let Some(depth) = self.mapper.get_relative_depth(file_dir, &search_root) else {
                continue;
            };
            if options.depth >= 0 && depth as i32 > options.depth {
                continue;
            }
            filtered.push(symbol);
        }

        if filtered.is_empty() {
            return None;
        }

        let mut seen = HashSet::new();
        let mut unique: Vec<Symbol> = Vec::new();
        for symbol in filtered {
            let key = (symbol.name.clone(), symbol.kind, symbol.range);
            if seen.insert(key) {
                unique.push(symbol);
            }
        }
        unique.sort_by(|a, b| a.name.cmp(&b.name));
        unique.truncate(options.total_limit);
        Some(unique)
    }

    /// References to a symbol across the hierarchy, from the per-index
    /// `code_relationships` tables, deduplicated by `(path, line)`.
    pub fn search_references(
        &self,
        symbol_name: &str,
        source_path: &Path,
        depth: i32,
        limit: usize,
    ) -> Vec<ReferenceResult> {
        let Some(start_index) = self.find_start_index(source_path) else {
            warn!("No index found for {}", source_path.display());
            return Vec::new();
        };
        let index_paths = self.collect_index_paths(&start_index, depth);
        if index_paths.is_empty() {
            return Vec::new();
        }

        let per_index = |index_path: &PathBuf| -> Vec<ReferenceResult> {
            match DirIndexStore::open(index_path) {
                Ok(store) => match store.search_references(symbol_name, limit) {
                    Ok(rows) => rows
                        .into_iter()
                        .map(|(file_path, line, relationship_type, content)| ReferenceResult {
                            context: extract_context(&content, line, 3),
                            file_path,
                            line,
                            column: 0,
                            relationship_type,
                        })
                        .collect(),
                    Err(e) => {
                        debug!("Reference search failed in {}: {e}", index_path.display());
                        Vec::new()
                    }
                },
                Err(e) => {
                    debug!("Reference search cannot open {}: {e}", index_path.display());
                    Vec::new()
                }
            }
        };

        let all_results: Vec<ReferenceResult> = self.pool().install(|| {
            use rayon::prelude::*;
            index_paths.par_iter().flat_map_iter(per_index).collect()
        });

        let mut seen = HashSet::new();
        let mut unique: Vec<ReferenceResult> = all_results
            .into_iter()
            .filter(|r| seen.insert((r.file_path.clone(), r.line)))
            .collect();
        unique.sort_by(|a, b| a.file_path.cmp(&b.file_path).then(a.line.cmp(&b.line)));
        unique.truncate(limit);
        unique
    }

    // === Internal ===

    pub(crate) fn pool(&self) -> &rayon::ThreadPool {
        self.pool.get_or_init(|| {
            rayon::ThreadPoolBuilder::new()
                .num_threads(self.config.search_max_workers.max(1))
                .build()
                .expect("search thread pool")
        })
    }

    pub(crate) fn find_start_index(&self, source_path: &Path) -> Option<PathBuf> {
        let source_path = PathMapper::normalize(source_path);

        let exact = self.mapper.source_to_index_db(&source_path);
        if exact.is_file() {
            debug!("Found exact index {}", exact.display());
            return Some(exact);
        }

        match self.registry.find_nearest_index(&source_path) {
            Ok(Some(mapping)) => {
                debug!("Found nearest index {}", mapping.index_path.display());
                Some(mapping.index_path)
            }
            _ => None,
        }
    }

    /// Walk `subdirs` links downward from the starting index, bounded by
    /// `depth` (-1 = unlimited, 0 = the start index only).
    pub(crate) fn collect_index_paths(&self, start_index: &Path, depth: i32) -> Vec<PathBuf> {
        let mut collected = Vec::new();
        let mut visited = HashSet::new();
        let mut frontier = vec![(start_index.to_path_buf(), 0_i32)];

        while let Some((index_path, current_depth)) = frontier.pop() {
            if !visited.insert(index_path.clone()) {
                continue;
            }
            if !index_path.is_file() {
                debug!("Index does not exist: {}", index_path.display());
                continue;
            }
            collected.push(index_path.clone());

            if depth >= 0 && current_depth >= depth {
                continue;
            }

            match DirIndexStore::open(&index_path) {
                Ok(store) => match store.get_subdirs() {
                    Ok(subdirs) => {
                        for subdir in subdirs {
                            frontier.push((subdir.index_path, current_depth + 1));
                        }
                    }
                    Err(e) => {
                        warn!("Failed to read subdirs from {}: {e}", index_path.display())
                    }
                },
                Err(e) => warn!("Failed to open {}: {e}", index_path.display()),
            }
        }

        debug!("Collected {} indexes (depth={depth})", collected.len());
        collected
    }

    fn search_parallel(
        &self,
        index_paths: &[PathBuf],
        query: &str,
        options: &SearchOptions,
        stats: &mut SearchStats,
    ) -> Vec<SearchResult> {
        // Vector and hybrid searches serialize on one lane so the
        // embedding backend never runs concurrently.
        let single_threaded = options.enable_vector || options.hybrid_mode || options.pure_vector;

        let run = |index_path: &PathBuf| -> std::result::Result<Vec<SearchResult>, String> {
            self.search_single_index(index_path, query, options)
                .map_err(|e| format!("Search failed for {}: {e}", index_path.display()))
        };

        let outcomes: Vec<std::result::Result<Vec<SearchResult>, String>> = if single_threaded {
            index_paths.iter().map(run).collect()
        } else {
            self.pool().install(|| {
                use rayon::prelude::*;
                index_paths.par_iter().map(run).collect()
            })
        };

        let mut results = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(mut batch) => results.append(&mut batch),
                Err(message) => {
                    warn!("{message}");
                    stats.errors.push(message);
                }
            }
        }
        results
    }

    fn search_single_index(
        &self,
        index_path: &Path,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<SearchResult>> {
        let store = DirIndexStore::open(index_path)?;

        let mut results = if options.hybrid_mode || options.pure_vector {
            let weights = HybridWeights::from_map(options.hybrid_weights.as_ref());
            let hybrid = HybridSearchEngine::new(weights);
            let vector_store = if options.enable_vector || options.pure_vector {
                self.vector_store_for(index_path)
            } else {
                None
            };
            let vector_pair = vector_store
                .as_ref()
                .map(|store| (store.as_ref(), self.embedder_for(store.dimension())));
            match &vector_pair {
                Some((vstore, embedder)) => hybrid.search(
                    &store,
                    query,
                    options.limit_per_dir,
                    options.enable_fuzzy,
                    Some((*vstore, embedder.as_ref())),
                    options.pure_vector,
                )?,
                None => hybrid.search(
                    &store,
                    query,
                    options.limit_per_dir,
                    options.enable_fuzzy,
                    None,
                    options.pure_vector,
                )?,
            }
        } else if options.files_only {
            store
                .search_files_only(query, options.limit_per_dir)?
                .into_iter()
                .map(|path| SearchResult::new(path, 0.0, ""))
                .collect()
        } else if options.enable_fuzzy {
            store.search_fts_fuzzy(query, options.limit_per_dir, true)?
        } else {
            store.search_fts_exact(query, options.limit_per_dir, true)?
        };

        if options.include_semantic {
            match store.search_semantic_keywords(query, true) {
                Ok(matches) => {
                    for (entry, keywords) in matches {
                        let excerpt = format!(
                            "Keywords: {}",
                            keywords
                                .iter()
                                .take(5)
                                .cloned()
                                .collect::<Vec<_>>()
                                .join(", ")
                        );
                        results.push(SearchResult::new(
                            entry.full_path.to_string_lossy(),
                            10.0 * 0.8,
                            excerpt,
                        ));
                    }
                }
                Err(e) => debug!("Semantic keyword search failed in {}: {e}", index_path.display()),
            }
        }

        Ok(results)
    }

    fn search_symbols_parallel(
        &self,
        index_paths: &[PathBuf],
        name: &str,
        kind: Option<&str>,
        limit: usize,
    ) -> Vec<Symbol> {
        let per_index = |index_path: &PathBuf| -> Vec<Symbol> {
            match DirIndexStore::open(index_path) {
                Ok(store) => store
                    .search_symbols(name, kind, false, limit)
                    .unwrap_or_default(),
                Err(e) => {
                    debug!("Symbol search cannot open {}: {e}", index_path.display());
                    Vec::new()
                }
            }
        };

        let all_symbols: Vec<Symbol> = self.pool().install(|| {
            use rayon::prelude::*;
            index_paths.par_iter().flat_map_iter(per_index).collect()
        });

        let mut seen = HashSet::new();
        let mut unique: Vec<Symbol> = all_symbols
            .into_iter()
            .filter(|s| seen.insert((s.name.clone(), s.kind, s.range)))
            .collect();
        unique.sort_by(|a, b| a.name.cmp(&b.name));
        unique.truncate(limit);
        unique
    }

    /// Centralized vector store for the project owning `index_path`,
    /// walking ancestor directories for `_vectors_meta.db`.
    pub(crate) fn vector_store_for(&self, index_path: &Path) -> Option<Arc<VectorStore>> {
        let start = index_path.parent()?;
        let root = find_nearest_vector_root(start)?;
        self.vector_store_at(&root)
    }

    /// Centralized vector store rooted exactly at `root`.
    pub(crate) fn vector_store_at(&self, root: &Path) -> Option<Arc<VectorStore>> {
        let root = root.to_path_buf();
        let mut stores = self.vector_stores.lock().unwrap();
        if let Some(store) = stores.get(&root) {
            return Some(store.clone());
        }

        match VectorStore::open_existing(&root) {
            Ok(Some(store)) => {
                if store.count_chunks().unwrap_or(0) > 0 && !store.ann_available() {
                    if let Err(e) = store.rebuild_ann_index() {
                        debug!("ANN rebuild failed for {}: {e}", root.display());
                    }
                }
                let store = Arc::new(store);
                stores.insert(root, store.clone());
                Some(store)
            }
            Ok(None) => None,
            Err(e) => {
                debug!("Vector store unavailable at {}: {e}", root.display());
                None
            }
        }
    }

    /// Embedder matching the store's locked dimension.
    pub(crate) fn embedder_for(&self, dimension: usize) -> Arc<dyn EmbeddingProvider> {
        if self.embedder.dimension() == dimension {
            self.embedder.clone()
        } else {
            Arc::new(HashEmbedder::new(dimension))
        }
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn mapper(&self) -> &PathMapper {
        &self.mapper
    }

    pub(crate) fn registry(&self) -> &RegistryStore {
        &self.registry
    }

    pub(crate) fn reranker(&self) -> &dyn Reranker {
        self.reranker.as_ref()
    }

    pub(crate) fn lsp_factory(&self) -> Option<Arc<dyn LspBridgeFactory>> {
        self.lsp_factory.clone()
    }

    pub(crate) fn keepalive_slot(
        &self,
    ) -> &Mutex<Option<(KeepaliveKey, Arc<dyn LspBridge>)>> {
        &self.keepalive
    }

    pub(crate) fn warmed_set(&self) -> &Mutex<HashSet<(PathBuf, Option<PathBuf>)>> {
        &self.warmed
    }

    pub(crate) fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }
}

impl Drop for ChainSearchEngine {
    fn drop(&mut self) {
        self.close();
    }
}

/// Nearest ancestor (up to 10 levels) holding centralized vector
/// artifacts; the start directory itself when none do.
pub(crate) fn find_nearest_vector_root(start: &Path) -> Option<PathBuf> {
    let mut current = Some(start);
    for _ in 0..10 {
        let dir = current?;
        if dir.join(crate::vector::VECTORS_META_DB_NAME).is_file() {
            return Some(dir.to_path_buf());
        }
        current = dir.parent();
    }
    None
}

/// Dedupe by path keeping the best score, sort descending (stable, so
/// ties keep first-seen order), then paginate.
pub(crate) fn merge_and_rank(
    results: Vec<SearchResult>,
    limit: usize,
    offset: usize,
) -> Vec<SearchResult> {
    let mut order: Vec<String> = Vec::new();
    let mut best: HashMap<String, SearchResult> = HashMap::new();

    for result in results {
        match best.get(&result.path) {
            Some(existing) if existing.score >= result.score => {}
            Some(_) => {
                best.insert(result.path.clone(), result);
            }
            None => {
                order.push(result.path.clone());
                best.insert(result.path.clone(), result);
            }
        }
    }

    let mut unique: Vec<SearchResult> = order
        .into_iter()
        .filter_map(|path| best.remove(&path))
        .collect();
    unique.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    unique.into_iter().skip(offset).take(limit).collect()
}

const NON_CODE_EXTENSIONS: &[&str] = &[
    "md", "txt", "json", "yaml", "yml", "xml", "csv", "log", "ini", "cfg", "conf", "toml", "env",
    "properties", "html", "htm", "svg", "png", "jpg", "jpeg", "gif", "ico", "webp", "pdf", "doc",
    "docx", "xls", "xlsx", "ppt", "pptx", "lock", "sum", "mod",
];

pub(crate) fn filter_by_extension(
    results: Vec<SearchResult>,
    code_only: bool,
    exclude_extensions: Option<&[String]>,
) -> Vec<SearchResult> {
    let mut excluded: HashSet<String> = HashSet::new();
    if let Some(extensions) = exclude_extensions {
        excluded.extend(
            extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase()),
        );
    }
    if code_only {
        excluded.extend(NON_CODE_EXTENSIONS.iter().map(|e| e.to_string()));
    }
    if excluded.is_empty() {
        return results;
    }

    results
        .into_iter()
        .filter(|result| {
            match result.path.rsplit_once('.') {
                Some((_, ext)) => !excluded.contains(&ext.to_ascii_lowercase()),
                None => true,
            }
        })
        .collect()
}

/// Lines around `line` (1-based), `context_lines` either side.
pub(crate) fn extract_context(content: &str, line: u32, context_lines: usize) -> String {
    if content.is_empty() || line == 0 {
        return String::new();
    }
    let lines: Vec<&str> = content.lines().collect();
    let line = line as usize;
    if line > lines.len() {
        return String::new();
    }

    let start = line.saturating_sub(1 + context_lines);
    let end = (line + context_lines).min(lines.len());
    lines[start..end].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(path: &str, score: f32) -> SearchResult {
        SearchResult::new(path, score, "")
    }

    #[test]
    fn merge_keeps_best_score_per_path_and_paginates() {
        let merged = merge_and_rank(
            vec![hit("/a", 1.0), hit("/a", 3.0), hit("/b", 2.0), hit("/c", 0.5)],
            2,
            0,
        );
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].path, "/a");
        assert!((merged[0].score - 3.0).abs() < f32::EPSILON);
        assert_eq!(merged[1].path, "/b");

        let offset_page = merge_and_rank(
            vec![hit("/a", 3.0), hit("/b", 2.0), hit("/c", 0.5)],
            2,
            1,
        );
        assert_eq!(offset_page[0].path, "/b");
    }

    #[test]
    fn ties_keep_first_seen_order() {
        let merged = merge_and_rank(vec![hit("/z", 1.0), hit("/a", 1.0)], 10, 0);
        assert_eq!(merged[0].path, "/z");
        assert_eq!(merged[1].path, "/a");
    }

    #[test]
    fn code_only_drops_non_code_extensions() {
        let filtered = filter_by_extension(
            vec![hit("/a.py", 1.0), hit("/b.md", 1.0), hit("/c.json", 1.0)],
            true,
            None,
        );
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].path, "/a.py");
    }

    #[test]
    fn explicit_extension_exclusion() {
        let filtered = filter_by_extension(
            vec![hit("/a.py", 1.0), hit("/b.rs", 1.0)],
            false,
            Some(&["py".to_string()]),
        );
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].path, "/b.rs");
    }

    #[test]
    fn context_extraction_brackets_the_target_line() {
        let content = "l1\nl2\nl3\nl4\nl5";
        assert_eq!(extract_context(content, 3, 1), "l2\nl3\nl4");
        assert_eq!(extract_context(content, 1, 2), "l1\nl2\nl3");
        assert_eq!(extract_context(content, 99, 1), "");
    }
}
