// Hybrid search with reciprocal-rank fusion
//
// Fuses the exact-FTS, fuzzy-FTS, and vector channels of one directory
// index. Channels degrade independently: a missing vector store simply
// contributes nothing.

use crate::errors::Result;
use crate::storage::dir_index::DirIndexStore;
use crate::types::SearchResult;
use crate::vector::{ChunkCategory, EmbeddingProvider, VectorStore};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

const RRF_K: f32 = 60.0;

/// Per-channel RRF weights; defaults mirror the config surface
/// `hybrid_weights{exact, fuzzy, vector}`.
#[derive(Debug, Clone)]
pub struct HybridWeights {
    pub exact: f32,
    pub fuzzy: f32,
    pub vector: f32,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            exact: 1.0,
            fuzzy: 0.8,
            vector: 1.0,
        }
    }
}

impl HybridWeights {
    pub fn from_map(map: Option<&HashMap<String, f32>>) -> Self {
        let mut weights = Self::default();
        if let Some(map) = map {
            if let Some(w) = map.get("exact") {
                weights.exact = *w;
            }
            if let Some(w) = map.get("fuzzy") {
                weights.fuzzy = *w;
            }
            if let Some(w) = map.get("vector") {
                weights.vector = *w;
            }
        }
        weights
    }
}

pub struct HybridSearchEngine {
    weights: HybridWeights,
}

impl HybridSearchEngine {
    pub fn new(weights: HybridWeights) -> Self {
        Self { weights }
    }

    /// Fused search over one directory index.
    ///
    /// `vector_store` is the project's centralized store; vector hits are
    /// restricted to files under the index's own directory so each index
    /// contributes only its own files.
    pub fn search(
        &self,
        store: &DirIndexStore,
        query: &str,
        limit: usize,
        enable_fuzzy: bool,
        vector: Option<(&VectorStore, &dyn EmbeddingProvider)>,
        pure_vector: bool,
    ) -> Result<Vec<SearchResult>> {
        let index_dir = store.index_dir().to_path_buf();

        let vector_results = match vector {
            Some((vector_store, embedder)) => {
                match self.vector_channel(vector_store, embedder, query, limit, &index_dir) {
                    Ok(results) => results,
                    Err(e) => {
                        debug!("Vector channel failed, degrading: {e}");
                        Vec::new()
                    }
                }
            }
            None => Vec::new(),
        };

        if pure_vector {
            let mut results = vector_results;
            results.truncate(limit);
            return Ok(results);
        }

        let exact_results = store.search_fts_exact(query, limit, false)?;
        let fuzzy_results = if enable_fuzzy {
            store.search_fts_fuzzy(query, limit, false)?
        } else {
            Vec::new()
        };

        Ok(self.fuse(&[
            (self.weights.exact, exact_results),
            (self.weights.fuzzy, fuzzy_results),
            (self.weights.vector, vector_results),
        ], limit))
    }

    fn vector_channel(
        &self,
        vector_store: &VectorStore,
        embedder: &dyn EmbeddingProvider,
        query: &str,
        limit: usize,
        index_dir: &Path,
    ) -> Result<Vec<SearchResult>> {
        if !vector_store.ann_available() {
            return Ok(Vec::new());
        }

        let query_vec = embedder.embed_one(query)?;
        // Over-fetch: hits from other directories are filtered away.
        let hits = vector_store.search_similar(&query_vec, limit * 4, 0.0, Some(ChunkCategory::Code))?;

        let mut results = Vec::new();
        for (chunk, score) in hits {
            let chunk_dir = Path::new(&chunk.file_path).parent().unwrap_or(Path::new(""));
            let source_dir = crate::paths::PathMapper::normalize(chunk_dir);
            // The index dir mirrors the source dir's suffix; match on it.
            if !index_dir.ends_with(
                source_dir
                    .strip_prefix("/")
                    .unwrap_or(source_dir.as_path()),
            ) {
                continue;
            }
            let mut result = SearchResult::new(chunk.file_path.clone(), score, chunk.content.clone());
            result.start_line = chunk.start_line;
            result.end_line = chunk.end_line;
            results.push(result);
            if results.len() >= limit {
                break;
            }
        }
        Ok(results)
    }

    /// Reciprocal-rank fusion: `score(d) = Σ_channel w_c / (k + rank_c(d))`.
    fn fuse(&self, channels: &[(f32, Vec<SearchResult>)], limit: usize) -> Vec<SearchResult> {
        let mut fused: HashMap<String, (f32, SearchResult)> = HashMap::new();

        for (weight, results) in channels {
            if *weight <= 0.0 {
                continue;
            }
            for (rank, result) in results.iter().enumerate() {
                let contribution = weight / (RRF_K + rank as f32 + 1.0);
                match fused.get_mut(&result.path) {
                    Some((score, existing)) => {
                        *score += contribution;
                        if existing.excerpt.is_empty() {
                            existing.excerpt = result.excerpt.clone();
                        }
                    }
                    None => {
                        fused.insert(result.path.clone(), (contribution, result.clone()));
                    }
                }
            }
        }

        let mut results: Vec<SearchResult> = fused
            .into_values()
            .map(|(score, mut result)| {
                result.score = score;
                result
            })
            .collect();
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.path.cmp(&b.path))
        });
        results.truncate(limit);
        results
    }
}
