// Graph expansion over precomputed neighbor tables
//
// Stage-2 "precomputed" mode walks `graph_neighbors` in the dir index that
// owns each seed result; "static_global_graph" mode walks
// `global_relationships` instead. Expanded results carry a fixed 0.5
// score and are appended after the seeds by the caller.

use crate::errors::Result;
use crate::paths::PathMapper;
use crate::storage::dir_index::DirIndexStore;
use crate::storage::global_index::GlobalSymbolIndex;
use crate::types::SearchResult;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::debug;

const EXPANDED_SCORE: f32 = 0.5;

pub struct GraphExpander<'a> {
    mapper: &'a PathMapper,
}

impl<'a> GraphExpander<'a> {
    pub fn new(mapper: &'a PathMapper) -> Self {
        Self { mapper }
    }

    /// Neighbors of the top `max_expand` seeds, at most `max_related`
    /// total. Seeds without a resolved symbol are skipped.
    pub fn expand(
        &self,
        seeds: &[SearchResult],
        max_expand: usize,
        max_related: usize,
    ) -> Result<Vec<SearchResult>> {
        let mut related = Vec::new();
        let mut seen: HashSet<(String, String, u32)> = HashSet::new();
        let mut stores: HashMap<PathBuf, DirIndexStore> = HashMap::new();

        for seed in seeds.iter().take(max_expand) {
            let Some(symbol_name) = seed.symbol_name.as_deref() else {
                continue;
            };
            let seed_dir = match Path::new(&seed.path).parent() {
                Some(dir) => dir.to_path_buf(),
                None => continue,
            };
            let index_db = self.mapper.source_to_index_db(&seed_dir);
            if !index_db.is_file() {
                continue;
            }

            let store = match stores.entry(index_db.clone()) {
                std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
                std::collections::hash_map::Entry::Vacant(entry) => {
                    match DirIndexStore::open(&index_db) {
                        Ok(store) => entry.insert(store),
                        Err(e) => {
                            debug!("Graph expansion skipping {}: {e}", index_db.display());
                            continue;
                        }
                    }
                }
            };

            let Some(symbol_id) = store.find_symbol_id(&seed.path, symbol_name)? else {
                continue;
            };

            for neighbor in store.get_neighbors(symbol_id)? {
                let key = (
                    neighbor.file_path.clone(),
                    neighbor.name.clone(),
                    neighbor.start_line,
                );
                if !seen.insert(key) {
                    continue;
                }

                let mut result = SearchResult::new(
                    neighbor.file_path.clone(),
                    EXPANDED_SCORE,
                    format!("{} {} (graph depth {})", neighbor.kind, neighbor.name, neighbor.depth),
                );
                result.symbol_name = Some(neighbor.name);
                result.symbol_kind = Some(neighbor.kind);
                result.start_line = Some(neighbor.start_line);
                result.end_line = Some(neighbor.end_line);
                related.push(result);

                if related.len() >= max_related {
                    return Ok(related);
                }
            }
        }

        Ok(related)
    }
}

pub struct GlobalGraphExpander<'a> {
    global_index: &'a GlobalSymbolIndex,
}

impl<'a> GlobalGraphExpander<'a> {
    pub fn new(global_index: &'a GlobalSymbolIndex) -> Self {
        Self { global_index }
    }

    /// Edges touching the top `top_n` seeds' symbols, at most
    /// `max_related` total.
    pub fn expand(
        &self,
        seeds: &[SearchResult],
        top_n: usize,
        max_related: usize,
    ) -> Result<Vec<SearchResult>> {
        let mut related = Vec::new();
        let mut seen: HashSet<(String, String, u32)> = HashSet::new();

        for seed in seeds.iter().take(top_n) {
            let Some(symbol_name) = seed.symbol_name.as_deref() else {
                continue;
            };

            for edge in self.global_index.edges_for_symbol(symbol_name, max_related)? {
                let counterpart = if edge.source_symbol == symbol_name {
                    edge.target_qualified_name.clone()
                } else {
                    edge.source_symbol.clone()
                };
                let key = (edge.source_file.clone(), counterpart.clone(), edge.source_line);
                if !seen.insert(key) {
                    continue;
                }

                let mut result = SearchResult::new(
                    edge.source_file.clone(),
                    EXPANDED_SCORE,
                    format!("{} -> {} ({})",
                        edge.source_symbol, edge.target_qualified_name, edge.relationship_type),
                );
                result.symbol_name = Some(counterpart);
                result.start_line = Some(edge.source_line);
                related.push(result);

                if related.len() >= max_related {
                    return Ok(related);
                }
            }
        }

        Ok(related)
    }
}
