// Cascade retrieval pipelines
//
// Stage 1 is always a cheap coarse pass; what follows depends on the
// variant: nothing (binary), a cross-encoder (binary_rerank), or a dense
// coarse pass plus cross-encoder (dense_rerank). The staged pipeline in
// `staged.rs` reuses the same stage-1 ladder.
//
// Stage-1 source ladder, best first: centralized binary mmap at the
// project index root, legacy per-directory sidecar indexes, dense HNSW,
// and finally FTS seeding (staged pipeline only). The source actually
// used is recorded in the stats.

use super::{ChainSearchEngine, find_nearest_vector_root, merge_and_rank};
use crate::config::CascadeStrategy;
use crate::errors::Result;
use crate::search::ranking::cross_encoder_rerank;
use crate::search::results::{ChainSearchResult, SearchOptions, SearchStats};
use crate::storage::dir_index::DirIndexStore;
use crate::types::SearchResult;
use crate::vector::{SKETCH_BYTES, hamming, pack_sketch};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, warn};

/// Where stage-1 candidates came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage1Source {
    Centralized,
    Legacy,
    Dense,
    Fts,
}

impl Stage1Source {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Centralized => "centralized",
            Self::Legacy => "legacy",
            Self::Dense => "dense",
            Self::Fts => "fts",
        }
    }
}

/// One coarse candidate before chunk resolution.
pub(crate) struct CoarseCandidate {
    pub chunk_id: i64,
    /// Hamming distance (binary sources) or `1 - score` (dense)
    pub distance: f32,
    /// Index root (centralized) or `_index.db` path (legacy)
    pub origin: PathBuf,
}

impl ChainSearchEngine {
    /// Unified entry: dispatch on the configured strategy.
    pub fn cascade_search(
        &self,
        strategy: CascadeStrategy,
        query: &str,
        source_path: &Path,
        k: usize,
        coarse_k: usize,
        options: &SearchOptions,
    ) -> ChainSearchResult {
        match strategy {
            CascadeStrategy::Binary => self.binary_cascade_search(query, source_path, k, coarse_k, options),
            CascadeStrategy::BinaryRerank => {
                self.binary_rerank_cascade_search(query, source_path, k, coarse_k, options)
            }
            CascadeStrategy::DenseRerank => {
                self.dense_rerank_cascade_search(query, source_path, k, coarse_k, options)
            }
            CascadeStrategy::Staged => self.staged_cascade_search(query, source_path, k, coarse_k, options),
        }
    }

    /// Binary-only cascade: Hamming coarse search, then top-k by score.
    pub fn binary_cascade_search(
        &self,
        query: &str,
        source_path: &Path,
        k: usize,
        coarse_k: usize,
        options: &SearchOptions,
    ) -> ChainSearchResult {
        let start_time = Instant::now();
        let mut stats = SearchStats::default();

        let Some(index_paths) = self.cascade_preamble(source_path, options, &mut stats) else {
            stats.time_ms = start_time.elapsed().as_secs_f64() * 1000.0;
            return ChainSearchResult {
                query: query.to_string(),
                stats,
                ..Default::default()
            };
        };

        let (results, _) = self.stage1_coarse_search(query, &index_paths, coarse_k, &mut stats, false);
        let final_results = merge_and_rank(results, k, 0);

        stats.files_matched = final_results.len();
        stats.time_ms = start_time.elapsed().as_secs_f64() * 1000.0;
        ChainSearchResult {
            query: query.to_string(),
            results: final_results,
            stats,
            ..Default::default()
        }
    }

    /// Binary coarse search followed by cross-encoder reranking.
    pub fn binary_rerank_cascade_search(
        &self,
        query: &str,
        source_path: &Path,
        k: usize,
        coarse_k: usize,
        options: &SearchOptions,
    ) -> ChainSearchResult {
        let start_time = Instant::now();
        let mut stats = SearchStats::default();

        let Some(index_paths) = self.cascade_preamble(source_path, options, &mut stats) else {
            stats.time_ms = start_time.elapsed().as_secs_f64() * 1000.0;
            return ChainSearchResult {
                query: query.to_string(),
                stats,
                ..Default::default()
            };
        };

        let (candidates, _) = self.stage1_coarse_search(query, &index_paths, coarse_k, &mut stats, false);
        let final_results = self.rerank_to_k(query, candidates, k, &mut stats);

        stats.files_matched = final_results.len();
        stats.time_ms = start_time.elapsed().as_secs_f64() * 1000.0;
        ChainSearchResult {
            query: query.to_string(),
            results: final_results,
            stats,
            ..Default::default()
        }
    }

    /// Dense HNSW coarse search followed by cross-encoder reranking.
    pub fn dense_rerank_cascade_search(
        &self,
        query: &str,
        source_path: &Path,
        k: usize,
        coarse_k: usize,
        options: &SearchOptions,
    ) -> ChainSearchResult {
        let start_time = Instant::now();
        let mut stats = SearchStats::default();

        let Some(index_paths) = self.cascade_preamble(source_path, options, &mut stats) else {
            stats.time_ms = start_time.elapsed().as_secs_f64() * 1000.0;
            return ChainSearchResult {
                query: query.to_string(),
                stats,
                ..Default::default()
            };
        };

        let candidates = match self.dense_coarse_search(query, &index_paths, coarse_k) {
            Some(results) => {
                stats.stage1_source = Some(Stage1Source::Dense.as_str().to_string());
                results
            }
            None => {
                debug!("Dense coarse search unavailable, falling back to binary ladder");
                let (results, _) =
                    self.stage1_coarse_search(query, &index_paths, coarse_k, &mut stats, false);
                results
            }
        };

        let final_results = self.rerank_to_k(query, candidates, k, &mut stats);

        stats.files_matched = final_results.len();
        stats.time_ms = start_time.elapsed().as_secs_f64() * 1000.0;
        ChainSearchResult {
            query: query.to_string(),
            results: final_results,
            stats,
            ..Default::default()
        }
    }

    fn rerank_to_k(
        &self,
        query: &str,
        candidates: Vec<SearchResult>,
        k: usize,
        stats: &mut SearchStats,
    ) -> Vec<SearchResult> {
        if candidates.is_empty() {
            return Vec::new();
        }
        match cross_encoder_rerank(
            query,
            &candidates,
            self.reranker(),
            k,
            self.config().reranker_chunk_type_weights.as_ref(),
            self.config().reranker_test_file_penalty,
        ) {
            Ok(reranked) => reranked,
            Err(e) => {
                stats.errors.push(format!("rerank failed: {e}"));
                merge_and_rank(candidates, k, 0)
            }
        }
    }

    /// Shared preamble: resolve the start index and collect the hierarchy.
    pub(crate) fn cascade_preamble(
        &self,
        source_path: &Path,
        options: &SearchOptions,
        stats: &mut SearchStats,
    ) -> Option<Vec<PathBuf>> {
        let start_index = self.find_start_index(source_path)?;
        let index_paths = self.collect_index_paths(&start_index, options.depth);
        stats.dirs_searched = index_paths.len();
        if index_paths.is_empty() {
            None
        } else {
            Some(index_paths)
        }
    }

    /// Stage 1: coarse candidate retrieval down the source ladder.
    /// Returns results plus the index root used by centralized search (for
    /// stage-2 graph lookups). With `allow_fts_seed`, an empty ladder is
    /// re-seeded from a plain FTS search.
    pub(crate) fn stage1_coarse_search(
        &self,
        query: &str,
        index_paths: &[PathBuf],
        coarse_k: usize,
        stats: &mut SearchStats,
        allow_fts_seed: bool,
    ) -> (Vec<SearchResult>, Option<PathBuf>) {
        let index_root = index_paths
            .first()
            .and_then(|p| p.parent())
            .and_then(find_nearest_vector_root);

        // Centralized first (see DESIGN.md for the order decision).
        if let Some(root) = &index_root {
            if let Some(results) = self.centralized_binary_search(query, root, coarse_k) {
                if !results.is_empty() {
                    stats.stage1_source = Some(Stage1Source::Centralized.as_str().to_string());
                    return (results, index_root);
                }
            }
        }

        if let Some(results) = self.legacy_binary_search(query, index_paths, coarse_k) {
            if !results.is_empty() {
                stats.stage1_source = Some(Stage1Source::Legacy.as_str().to_string());
                return (results, index_root);
            }
        }

        if let Some(results) = self.dense_coarse_search(query, index_paths, coarse_k) {
            if !results.is_empty() {
                stats.stage1_source = Some(Stage1Source::Dense.as_str().to_string());
                return (results, index_root);
            }
        }

        if allow_fts_seed {
            debug!("No stage-1 vector candidates; seeding from FTS");
            let seed_limit = coarse_k.max(10);
            let mut seeded = Vec::new();
            for index_path in index_paths {
                if let Ok(store) = DirIndexStore::open(index_path) {
                    if let Ok(mut hits) = store.search_fts_fuzzy(query, seed_limit, true) {
                        seeded.append(&mut hits);
                    }
                    if let Ok(symbols) = store.search_symbols(query, None, false, 10) {
                        for symbol in symbols {
                            if let Some(file) = symbol.file {
                                let mut result = SearchResult::new(file, 1.0, symbol.name.clone());
                                result.symbol_name = Some(symbol.name);
                                result.symbol_kind = Some(symbol.kind.to_string());
                                result.start_line = Some(symbol.range.0);
                                result.end_line = Some(symbol.range.1);
                                seeded.push(result);
                            }
                        }
                    }
                }
            }
            let seeded = merge_and_rank(seeded, coarse_k, 0);
            if !seeded.is_empty() {
                stats.stage1_source = Some(Stage1Source::Fts.as_str().to_string());
                return (seeded, index_root);
            }
        }

        (Vec::new(), index_root)
    }

    fn centralized_binary_search(
        &self,
        query: &str,
        index_root: &Path,
        coarse_k: usize,
    ) -> Option<Vec<SearchResult>> {
        let store = self.vector_store_at(index_root)?;
        let searcher = match store.binary_searcher() {
            Ok(Some(searcher)) => searcher,
            Ok(None) => return None,
            Err(e) => {
                debug!("Centralized binary search failed: {e}");
                return None;
            }
        };
        if searcher.count() == 0 {
            return None;
        }

        let embedder = self.embedder_for(store.dimension());
        let query_dense = embedder.embed_one(query).ok()?;

        let hits = searcher.search(&query_dense, coarse_k);
        let candidates: Vec<CoarseCandidate> = hits
            .into_iter()
            .map(|(chunk_id, distance)| CoarseCandidate {
                chunk_id: chunk_id as i64,
                distance: distance as f32,
                origin: index_root.to_path_buf(),
            })
            .collect();

        debug!("Stage 1 centralized binary search: {} candidates", candidates.len());
        Some(self.resolve_candidates(candidates, Stage1Source::Centralized, coarse_k))
    }

    fn legacy_binary_search(
        &self,
        query: &str,
        index_paths: &[PathBuf],
        coarse_k: usize,
    ) -> Option<Vec<SearchResult>> {
        let has_legacy = index_paths
            .iter()
            .any(|p| legacy_sidecar_path(p).is_file());
        if !has_legacy {
            return None;
        }

        let query_dense = self.embedder().embed_one(query).ok()?;
        let query_sketch = pack_sketch(&query_dense);

        let mut candidates = Vec::new();
        for index_path in index_paths {
            let sidecar = legacy_sidecar_path(index_path);
            if !sidecar.is_file() {
                continue;
            }
            match read_legacy_sidecar(&sidecar) {
                Ok(records) => {
                    let mut scored: Vec<(i64, u32)> = records
                        .iter()
                        .map(|(chunk_id, sketch)| (*chunk_id, hamming(&query_sketch, sketch)))
                        .collect();
                    scored.sort_by_key(|&(chunk_id, distance)| (distance, chunk_id));
                    scored.truncate(coarse_k);
                    candidates.extend(scored.into_iter().map(|(chunk_id, distance)| {
                        CoarseCandidate {
                            chunk_id,
                            distance: distance as f32,
                            origin: index_path.clone(),
                        }
                    }));
                }
                Err(e) => debug!("Legacy binary index unreadable {}: {e}", sidecar.display()),
            }
        }

        if candidates.is_empty() {
            return None;
        }
        Some(self.resolve_candidates(candidates, Stage1Source::Legacy, coarse_k))
    }

    fn dense_coarse_search(
        &self,
        query: &str,
        index_paths: &[PathBuf],
        coarse_k: usize,
    ) -> Option<Vec<SearchResult>> {
        let store = index_paths
            .first()
            .and_then(|p| self.vector_store_for(p))?;
        if !store.ann_available() {
            return None;
        }

        let embedder = self.embedder_for(store.dimension());
        let query_dense = embedder.embed_one(query).ok()?;

        match store.search_similar(&query_dense, coarse_k, 0.0, None) {
            Ok(hits) => {
                let results = hits
                    .into_iter()
                    .map(|(chunk, score)| chunk_to_result(&chunk, score.clamp(0.0, 1.0)))
                    .collect();
                Some(results)
            }
            Err(e) => {
                debug!("Dense coarse search failed: {e}");
                None
            }
        }
    }

    /// Resolve coarse candidate ids to chunk rows and score them:
    /// `1 - hamming/256` for binary sources, clamped to `[0, 1]`.
    fn resolve_candidates(
        &self,
        mut candidates: Vec<CoarseCandidate>,
        source: Stage1Source,
        coarse_k: usize,
    ) -> Vec<SearchResult> {
        candidates.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(coarse_k);

        let mut by_origin: HashMap<PathBuf, Vec<(i64, f32)>> = HashMap::new();
        for candidate in candidates {
            by_origin
                .entry(candidate.origin)
                .or_default()
                .push((candidate.chunk_id, candidate.distance));
        }

        let mut results = Vec::new();
        for (origin, chunk_pairs) in by_origin {
            let chunk_ids: Vec<i64> = chunk_pairs.iter().map(|(id, _)| *id).collect();
            let distances: HashMap<i64, f32> = chunk_pairs.into_iter().collect();

            match source {
                Stage1Source::Centralized => {
                    let Some(store) = self.vector_store_at(&origin) else {
                        continue;
                    };
                    match store.get_chunks_by_ids(&chunk_ids) {
                        Ok(chunks) => {
                            for chunk in chunks {
                                let distance =
                                    distances.get(&chunk.chunk_id).copied().unwrap_or(256.0);
                                let score = (1.0 - distance / 256.0).clamp(0.0, 1.0);
                                results.push(chunk_to_result_meta(
                                    chunk.chunk_id,
                                    &chunk.file_path,
                                    &chunk.content,
                                    chunk.start_line,
                                    chunk.end_line,
                                    chunk.metadata.as_deref(),
                                    score,
                                ));
                            }
                        }
                        Err(e) => warn!("Chunk resolution failed at {}: {e}", origin.display()),
                    }
                }
                Stage1Source::Legacy => {
                    let Ok(store) = DirIndexStore::open(&origin) else {
                        continue;
                    };
                    match store.get_chunks_by_ids(&chunk_ids) {
                        Ok(chunks) => {
                            for chunk in chunks {
                                let distance = distances.get(&chunk.id).copied().unwrap_or(256.0);
                                let score = (1.0 - distance / 256.0).clamp(0.0, 1.0);
                                results.push(chunk_to_result_meta(
                                    chunk.id,
                                    &chunk.file_path,
                                    &chunk.content,
                                    None,
                                    None,
                                    chunk.metadata.as_deref(),
                                    score,
                                ));
                            }
                        }
                        Err(e) => warn!("Legacy chunk resolution failed at {}: {e}", origin.display()),
                    }
                }
                Stage1Source::Dense | Stage1Source::Fts => {}
            }
        }

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.path.cmp(&b.path))
        });
        results
    }
}

fn chunk_to_result(chunk: &crate::vector::ChunkMetadata, score: f32) -> SearchResult {
    chunk_to_result_meta(
        chunk.chunk_id,
        &chunk.file_path,
        &chunk.content,
        chunk.start_line,
        chunk.end_line,
        chunk.metadata.as_deref(),
        score,
    )
}

fn chunk_to_result_meta(
    chunk_id: i64,
    file_path: &str,
    content: &str,
    start_line: Option<u32>,
    end_line: Option<u32>,
    metadata: Option<&str>,
    score: f32,
) -> SearchResult {
    let excerpt: String = content.chars().take(500).collect();
    let mut result = SearchResult::new(file_path, score, excerpt);
    result.content = Some(content.to_string());
    result.start_line = start_line;
    result.end_line = end_line;
    result
        .metadata
        .insert("chunk_id".into(), serde_json::Value::from(chunk_id));

    if let Some(metadata) = metadata {
        if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(metadata) {
            if let Some(symbol_name) = parsed.get("symbol_name").and_then(|v| v.as_str()) {
                result.symbol_name = Some(symbol_name.to_string());
            }
            if let Some(symbol_kind) = parsed.get("symbol_kind").and_then(|v| v.as_str()) {
                result.symbol_kind = Some(symbol_kind.to_string());
            }
            if let Some(line) = parsed.get("start_line").and_then(|v| v.as_u64()) {
                result.start_line = Some(line as u32);
            }
            if let Some(line) = parsed.get("end_line").and_then(|v| v.as_u64()) {
                result.end_line = Some(line as u32);
            }
        }
    }

    result
}

/// Legacy sidecar location: `<stem>_binary_vectors.bin` next to the index.
pub(crate) fn legacy_sidecar_path(index_db_path: &Path) -> PathBuf {
    let stem = index_db_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    index_db_path.with_file_name(format!("{stem}_binary_vectors.bin"))
}

/// Sidecar format: repeated `(chunk_id: u64 LE, sketch: 32 bytes)` records.
pub(crate) fn read_legacy_sidecar(path: &Path) -> Result<Vec<(i64, [u8; SKETCH_BYTES])>> {
    let mut file = std::fs::File::open(path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;

    let record_size = 8 + SKETCH_BYTES;
    let mut records = Vec::with_capacity(bytes.len() / record_size);
    for record in bytes.chunks_exact(record_size) {
        let chunk_id = u64::from_le_bytes(record[0..8].try_into().unwrap()) as i64;
        let sketch: [u8; SKETCH_BYTES] = record[8..].try_into().unwrap();
        records.push((chunk_id, sketch));
    }
    Ok(records)
}

/// Writer for the legacy sidecar format (migration tooling and tests).
pub fn write_legacy_sidecar(
    index_db_path: &Path,
    records: &[(i64, [u8; SKETCH_BYTES])],
) -> Result<()> {
    let mut bytes = Vec::with_capacity(records.len() * (8 + SKETCH_BYTES));
    for (chunk_id, sketch) in records {
        bytes.extend_from_slice(&(*chunk_id as u64).to_le_bytes());
        bytes.extend_from_slice(sketch);
    }
    std::fs::write(legacy_sidecar_path(index_db_path), bytes)?;
    Ok(())
}
