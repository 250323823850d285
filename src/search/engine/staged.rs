// Staged cascade pipeline
//
// Four stages: binary coarse search, graph expansion, clustering with
// representative selection, and optional cross-encoder reranking.
// Per-stage timings and counts are appended to `stats.errors` as a
// structured `STAGE_STATS:<json>` tag.

use super::{ChainSearchEngine, merge_and_rank};
use crate::config::Stage2Mode;
use crate::search::clustering::{ClusteringConfig, get_strategy};
use crate::search::graph_expander::{GlobalGraphExpander, GraphExpander};
use crate::search::lsp::{
    KeepaliveKey, LspGraphBuilder, LspLocation, find_config_file, find_workspace_root,
};
use crate::search::ranking::group_similar_results;
use crate::search::results::{ChainSearchResult, SearchOptions, SearchStats};
use crate::storage::global_index::GlobalSymbolIndex;
use crate::types::SearchResult;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

impl ChainSearchEngine {
    /// 4-stage cascade: binary coarse -> graph expansion -> clustering ->
    /// optional rerank.
    pub fn staged_cascade_search(
        &self,
        query: &str,
        source_path: &Path,
        k: usize,
        coarse_k: usize,
        options: &SearchOptions,
    ) -> ChainSearchResult {
        let start_time = Instant::now();
        let mut stats = SearchStats::default();
        let mut stage_times: HashMap<&'static str, f64> = HashMap::new();
        let mut stage_counts: HashMap<&'static str, serde_json::Value> = HashMap::new();

        let coarse_k = if coarse_k == 0 {
            self.config().cascade_coarse_k
        } else {
            coarse_k
        };
        let k = if k == 0 { self.config().cascade_fine_k } else { k };

        let Some(index_paths) = self.cascade_preamble(source_path, options, &mut stats) else {
            stats.time_ms = start_time.elapsed().as_secs_f64() * 1000.0;
            return ChainSearchResult {
                query: query.to_string(),
                stats,
                ..Default::default()
            };
        };

        // ===== Stage 1: binary coarse search (with FTS seeding) =====
        let stage1_start = Instant::now();
        let (coarse_results, index_root) =
            self.stage1_coarse_search(query, &index_paths, coarse_k, &mut stats, true);
        stage_times.insert("stage1_binary_ms", stage1_start.elapsed().as_secs_f64() * 1000.0);
        stage_counts.insert("stage1_candidates", coarse_results.len().into());
        if let Some(source) = &stats.stage1_source {
            stage_counts.insert("stage1_source", source.clone().into());
        }

        debug!(
            "Staged stage 1: {} candidates in {:.2}ms",
            coarse_results.len(),
            stage_times["stage1_binary_ms"]
        );

        if coarse_results.is_empty() {
            stats.time_ms = start_time.elapsed().as_secs_f64() * 1000.0;
            push_stage_stats(&mut stats, &stage_times, &stage_counts);
            return ChainSearchResult {
                query: query.to_string(),
                stats,
                ..Default::default()
            };
        }

        // ===== Stage 2: graph expansion =====
        let stage2_start = Instant::now();
        let mode = options.stage2_mode.unwrap_or(self.config().staged_stage2_mode);
        let expanded_results = self.stage2_expand(&coarse_results, index_root.as_deref(), query, mode);
        stage_times.insert("stage2_expand_ms", stage2_start.elapsed().as_secs_f64() * 1000.0);
        stage_counts.insert("stage2_expanded", expanded_results.len().into());
        let unique_paths: HashSet<String> = expanded_results
            .iter()
            .map(|r| r.path.to_ascii_lowercase())
            .collect();
        stage_counts.insert("stage2_unique_paths", unique_paths.len().into());
        stage_counts.insert(
            "stage2_duplicate_paths",
            expanded_results.len().saturating_sub(unique_paths.len()).into(),
        );

        debug!(
            "Staged stage 2: {} -> {} results in {:.2}ms",
            coarse_results.len(),
            expanded_results.len(),
            stage_times["stage2_expand_ms"]
        );

        // ===== Stage 3: clustering and representative selection =====
        let stage3_start = Instant::now();
        let clustered_results = self.stage3_cluster_prune(&expanded_results, k * 2);
        stage_times.insert("stage3_cluster_ms", stage3_start.elapsed().as_secs_f64() * 1000.0);
        stage_counts.insert("stage3_clustered", clustered_results.len().into());
        stage_counts.insert(
            "stage3_strategy",
            self.config().staged_clustering_strategy.clone().into(),
        );

        // ===== Stage 4: optional cross-encoder rerank =====
        let stage4_start = Instant::now();
        let final_results = if self.config().enable_staged_rerank {
            match crate::search::ranking::cross_encoder_rerank(
                query,
                &clustered_results,
                self.reranker(),
                k,
                self.config().reranker_chunk_type_weights.as_ref(),
                self.config().reranker_test_file_penalty,
            ) {
                Ok(reranked) => reranked,
                Err(e) => {
                    warn!("Stage 4 rerank failed: {e}");
                    stats.errors.push(format!("stage4 rerank failed: {e}"));
                    top_k_by_score(&clustered_results, k)
                }
            }
        } else {
            top_k_by_score(&clustered_results, k)
        };
        stage_times.insert("stage4_rerank_ms", stage4_start.elapsed().as_secs_f64() * 1000.0);
        stage_counts.insert("stage4_reranked", final_results.len().into());

        // Final dedupe by path keeping the best score.
        let mut final_results = merge_and_rank(final_results, k, 0);

        if options.group_results {
            final_results = group_similar_results(final_results, options.grouping_threshold);
        }

        stats.files_matched = final_results.len();
        stats.time_ms = start_time.elapsed().as_secs_f64() * 1000.0;
        push_stage_stats(&mut stats, &stage_times, &stage_counts);

        debug!(
            "Staged cascade complete: {} results in {:.2}ms",
            final_results.len(),
            stats.time_ms
        );

        ChainSearchResult {
            query: query.to_string(),
            results: final_results,
            stats,
            ..Default::default()
        }
    }

    /// Stage 2 dispatch. Failures never propagate; the coarse results pass
    /// through unchanged.
    fn stage2_expand(
        &self,
        coarse_results: &[SearchResult],
        index_root: Option<&Path>,
        query: &str,
        mode: Stage2Mode,
    ) -> Vec<SearchResult> {
        let related = match mode {
            Stage2Mode::Realtime => self.stage2_realtime_expand(coarse_results, query),
            Stage2Mode::StaticGlobalGraph => {
                self.stage2_static_global_expand(coarse_results, index_root)
            }
            Stage2Mode::Precomputed => self.stage2_precomputed_expand(coarse_results),
        };

        combine_stage2_results(coarse_results, &related)
    }

    fn stage2_precomputed_expand(&self, coarse_results: &[SearchResult]) -> Vec<SearchResult> {
        let expander = GraphExpander::new(self.mapper());
        let max_expand = coarse_results.len().min(10);
        match expander.expand(coarse_results, max_expand, 50) {
            Ok(related) => {
                if !related.is_empty() {
                    debug!(
                        "Stage 2 (precomputed) expanded {} seeds to {} related symbols",
                        coarse_results.len(),
                        related.len()
                    );
                }
                related
            }
            Err(e) => {
                debug!("Stage 2 precomputed expansion failed: {e}");
                Vec::new()
            }
        }
    }

    fn stage2_static_global_expand(
        &self,
        coarse_results: &[SearchResult],
        index_root: Option<&Path>,
    ) -> Vec<SearchResult> {
        let Some(index_root) = index_root else {
            return Vec::new();
        };
        let global_db = GlobalSymbolIndex::default_path(index_root);
        if !global_db.is_file() {
            debug!("Global symbol DB missing at {}, skipping static expansion", global_db.display());
            return Vec::new();
        }

        let project_id = self
            .registry()
            .list_projects()
            .ok()
            .and_then(|projects| {
                projects
                    .into_iter()
                    .find(|p| p.index_root == index_root)
                    .map(|p| p.id)
            })
            .unwrap_or(1);

        match GlobalSymbolIndex::open(&global_db, project_id) {
            Ok(global_index) => {
                let expander = GlobalGraphExpander::new(&global_index);
                let top_n = coarse_results.len().min(10);
                expander.expand(coarse_results, top_n, 50).unwrap_or_else(|e| {
                    debug!("Stage 2 static expansion failed: {e}");
                    Vec::new()
                })
            }
            Err(e) => {
                debug!("Stage 2 cannot open global index: {e}");
                Vec::new()
            }
        }
    }

    /// Realtime mode: open the seed symbols in live language servers and
    /// walk a bounded reference/call graph. Requires a registered bridge
    /// factory; without one this degrades to precomputed expansion.
    fn stage2_realtime_expand(
        &self,
        coarse_results: &[SearchResult],
        query: &str,
    ) -> Vec<SearchResult> {
        let Some(factory) = self.lsp_factory() else {
            debug!("No LSP bridge factory registered, degrading to precomputed expansion");
            return self.stage2_precomputed_expand(coarse_results);
        };

        let rt = self.config().realtime_lsp.clone();
        let source_dir = coarse_results
            .first()
            .and_then(|r| Path::new(&r.path).parent())
            .unwrap_or(Path::new("/"));
        let workspace_root = find_workspace_root(source_dir);
        let config_file = find_config_file(source_dir);

        let key = KeepaliveKey {
            workspace_root: workspace_root.clone(),
            config_file: config_file.clone(),
            timeout_ms: (rt.timeout_s * 1000.0) as u64,
        };

        let bridge = {
            let mut slot = self.keepalive_slot().lock().unwrap();
            let reusable = matches!(slot.as_ref(), Some((active_key, _)) if *active_key == key);
            if reusable {
                slot.as_ref().map(|(_, bridge)| bridge.clone()).unwrap()
            } else {
                // Replacing the key stops the previous bridge first.
                if let Some((_, previous)) = slot.take() {
                    previous.stop();
                }
                match factory.create(&workspace_root, config_file.as_deref()) {
                    Ok(bridge) => {
                        *slot = Some((key, bridge.clone()));
                        bridge
                    }
                    Err(e) => {
                        debug!("LSP bridge creation failed: {e}");
                        return self.stage2_precomputed_expand(coarse_results);
                    }
                }
            }
        };

        // Best-effort warmup, once per (workspace_root, config_file).
        let warm_key = (workspace_root.clone(), config_file.clone());
        let first_contact = self.warmed_set().lock().unwrap().insert(warm_key);
        if first_contact && rt.warmup_s > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(rt.warmup_s));
        }

        // Seed selection: prefer results whose symbol matches a query term.
        let terms: HashSet<String> = query
            .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .filter(|t| !t.is_empty())
            .map(|t| t.to_ascii_lowercase())
            .collect();

        let mut prioritized: Vec<&SearchResult> = coarse_results.iter().collect();
        prioritized.sort_by(|a, b| {
            seed_priority(b, &terms)
                .partial_cmp(&seed_priority(a, &terms))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let seeds: Vec<LspLocation> = prioritized
            .iter()
            .take(rt.max_seeds.max(1))
            .map(|result| LspLocation {
                path: result.path.clone(),
                line: result.start_line.unwrap_or(1),
                symbol_name: result.symbol_name.clone(),
            })
            .collect();

        let builder = LspGraphBuilder {
            max_depth: rt.depth,
            max_nodes: rt.max_nodes,
            max_concurrent: rt.max_concurrent,
            timeout: Duration::from_secs_f64(rt.timeout_s),
        };
        let graph = builder.expand(bridge.as_ref(), &seeds);

        graph
            .into_iter()
            .map(|location| {
                let mut result = SearchResult::new(
                    location.path.clone(),
                    0.5,
                    location
                        .symbol_name
                        .clone()
                        .unwrap_or_else(|| "reference".to_string()),
                );
                result.symbol_name = location.symbol_name;
                result.start_line = Some(location.line);
                result
            })
            .collect()
    }

    /// Stage 3: cluster the expanded set and keep one representative per
    /// cluster, topping up with best-scored leftovers when clustering
    /// returns fewer than `target_count`.
    fn stage3_cluster_prune(
        &self,
        expanded_results: &[SearchResult],
        target_count: usize,
    ) -> Vec<SearchResult> {
        if expanded_results.is_empty() {
            return Vec::new();
        }
        if expanded_results.len() <= target_count {
            return expanded_results.to_vec();
        }

        let strategy_name = self.config().staged_clustering_strategy.clone();
        let clustering_config = ClusteringConfig {
            min_cluster_size: self
                .config()
                .staged_clustering_min_size
                .min((expanded_results.len() / 5).max(2)),
            min_samples: 2,
        };

        let Some(strategy) = get_strategy(&strategy_name, clustering_config, true) else {
            return top_k_by_score(expanded_results, target_count);
        };

        // Density strategies need embeddings; compute them on demand.
        let embeddings: Vec<Vec<f32>> = if matches!(strategy.name(), "dbscan" | "hdbscan" | "auto")
        {
            let texts: Vec<String> = expanded_results
                .iter()
                .map(|r| {
                    let text = r
                        .content
                        .as_deref()
                        .filter(|c| !c.is_empty())
                        .unwrap_or(r.excerpt.as_str());
                    let text = if text.is_empty() { r.path.as_str() } else { text };
                    text.chars().take(2000).collect()
                })
                .collect();
            let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
            self.embedder().embed(&refs).unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut representatives = strategy.fit_predict(&embeddings, expanded_results);
        debug!(
            "Stage 3 clustered {} results into {} representatives using {}",
            expanded_results.len(),
            representatives.len(),
            strategy.name()
        );

        if representatives.len() < target_count {
            let rep_paths: HashSet<String> =
                representatives.iter().map(|r| r.path.clone()).collect();
            let mut remaining: Vec<SearchResult> = expanded_results
                .iter()
                .filter(|r| !rep_paths.contains(&r.path))
                .cloned()
                .collect();
            remaining.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            representatives.extend(remaining.into_iter().take(target_count - representatives.len()));
        }

        representatives.truncate(target_count);
        representatives
    }
}

fn seed_priority(result: &SearchResult, terms: &HashSet<String>) -> f32 {
    let mut priority = 0.0;
    if let Some(symbol) = &result.symbol_name {
        let symbol = symbol.trim().to_ascii_lowercase();
        if !symbol.is_empty() {
            priority += 2.0;
            if terms.contains(&symbol) {
                priority += 5.0;
            }
        }
    }
    if let Some(stem) = Path::new(&result.path).file_stem().and_then(|s| s.to_str()) {
        if terms.contains(&stem.to_ascii_lowercase()) {
            priority += 1.0;
        }
    }
    priority
}

/// Append stage-2 results to stage-1, deduplicated by
/// `(path, symbol_name, start_line)`, preserving stage-1 order.
fn combine_stage2_results(
    coarse_results: &[SearchResult],
    related_results: &[SearchResult],
) -> Vec<SearchResult> {
    let mut combined: Vec<SearchResult> = coarse_results.to_vec();
    let mut seen: HashSet<(String, Option<String>, Option<u32>)> = coarse_results
        .iter()
        .map(|r| (r.path.clone(), r.symbol_name.clone(), r.start_line))
        .collect();

    for related in related_results {
        let key = (related.path.clone(), related.symbol_name.clone(), related.start_line);
        if seen.insert(key) {
            combined.push(related.clone());
        }
    }

    combined
}

fn top_k_by_score(results: &[SearchResult], k: usize) -> Vec<SearchResult> {
    let mut sorted = results.to_vec();
    sorted.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    sorted.truncate(k);
    sorted
}

fn push_stage_stats(
    stats: &mut SearchStats,
    stage_times: &HashMap<&'static str, f64>,
    stage_counts: &HashMap<&'static str, serde_json::Value>,
) {
    // All four timings are always present, zero when a stage was skipped.
    let mut times = serde_json::Map::new();
    for key in [
        "stage1_binary_ms",
        "stage2_expand_ms",
        "stage3_cluster_ms",
        "stage4_rerank_ms",
    ] {
        let value = stage_times.get(key).copied().unwrap_or(0.0);
        times.insert(
            key.to_string(),
            serde_json::Number::from_f64(value)
                .map(serde_json::Value::Number)
                .unwrap_or_else(|| serde_json::Value::from(0)),
        );
    }

    let counts: serde_json::Map<String, serde_json::Value> = stage_counts
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();

    let payload = serde_json::json!({
        "stage_times": serde_json::Value::Object(times),
        "stage_counts": serde_json::Value::Object(counts),
    });
    stats.errors.push(format!("STAGE_STATS:{payload}"));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(path: &str, symbol: Option<&str>, line: Option<u32>, score: f32) -> SearchResult {
        let mut r = SearchResult::new(path, score, "");
        r.symbol_name = symbol.map(String::from);
        r.start_line = line;
        r
    }

    #[test]
    fn stage2_combination_preserves_stage1_order_and_dedupes() {
        let coarse = vec![
            result("/a.py", Some("f"), Some(1), 0.9),
            result("/b.py", Some("g"), Some(2), 0.8),
        ];
        let related = vec![
            // Duplicate of an existing seed.
            result("/a.py", Some("f"), Some(1), 0.5),
            result("/c.py", Some("h"), Some(3), 0.5),
        ];

        let combined = combine_stage2_results(&coarse, &related);
        let paths: Vec<&str> = combined.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["/a.py", "/b.py", "/c.py"]);
    }

    #[test]
    fn seed_priority_prefers_query_matching_symbols() {
        let terms: HashSet<String> = ["handler".to_string()].into_iter().collect();
        let matching = result("/x/handler.py", Some("handler"), Some(1), 0.2);
        let plain = result("/x/util.py", Some("misc"), Some(1), 0.9);
        assert!(seed_priority(&matching, &terms) > seed_priority(&plain, &terms));
    }

    #[test]
    fn stage_stats_always_carry_four_timings() {
        let mut stats = SearchStats::default();
        let mut times = HashMap::new();
        times.insert("stage1_binary_ms", 1.5);
        push_stage_stats(&mut stats, &times, &HashMap::new());

        let tag = stats
            .errors
            .iter()
            .find(|e| e.starts_with("STAGE_STATS:"))
            .expect("stage stats tag");
        let payload: serde_json::Value =
            serde_json::from_str(tag.trim_start_matches("STAGE_STATS:")).unwrap();
        let stage_times = payload.get("stage_times").unwrap().as_object().unwrap();
        assert_eq!(stage_times.len(), 4);
        for value in stage_times.values() {
            assert!(value.is_number());
        }
    }
}
