// Clustering strategies for cascade stage 3
//
// Each strategy reduces an expanded candidate set to at most one
// representative per cluster. All strategies are deterministic for
// identical inputs; the density-based ones work on embeddings computed on
// demand by the caller.

use crate::types::SearchResult;
use crate::vector::cosine_similarity;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ClusteringConfig {
    pub min_cluster_size: usize,
    pub min_samples: usize,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            min_cluster_size: 3,
            min_samples: 2,
        }
    }
}

pub trait ClusterStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Reduce `results` to representatives. `embeddings` is parallel to
    /// `results` and may be empty for strategies that do not need it.
    fn fit_predict(&self, embeddings: &[Vec<f32>], results: &[SearchResult]) -> Vec<SearchResult>;
}

/// Resolve a strategy by name. Unknown names resolve to `auto` when
/// `fallback` is set; otherwise `None`.
pub fn get_strategy(
    name: &str,
    config: ClusteringConfig,
    fallback: bool,
) -> Option<Box<dyn ClusterStrategy>> {
    let strategy: Box<dyn ClusterStrategy> = match name.trim().to_ascii_lowercase().as_str() {
        "noop" | "none" | "off" | "score" | "top" | "rank" => Box::new(ScoreStrategy),
        "path" | "file" => Box::new(PathStrategy),
        "dir_rr" | "rr_dir" | "round_robin_dir" => Box::new(DirRoundRobinStrategy),
        "frequency" => Box::new(FrequencyStrategy),
        "dbscan" => Box::new(DbscanStrategy {
            config,
            adaptive_eps: false,
        }),
        "hdbscan" => Box::new(DbscanStrategy {
            config,
            adaptive_eps: true,
        }),
        "auto" => Box::new(AutoStrategy { config }),
        other => {
            if fallback {
                debug!("Unknown clustering strategy '{other}', resolving to auto");
                Box::new(AutoStrategy { config })
            } else {
                return None;
            }
        }
    };
    Some(strategy)
}

fn sorted_by_score(results: &[SearchResult]) -> Vec<SearchResult> {
    let mut sorted = results.to_vec();
    sorted.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.path.cmp(&b.path))
    });
    sorted
}

/// Top-N by score; the noop baseline.
pub struct ScoreStrategy;

impl ClusterStrategy for ScoreStrategy {
    fn name(&self) -> &'static str {
        "score"
    }

    fn fit_predict(&self, _embeddings: &[Vec<f32>], results: &[SearchResult]) -> Vec<SearchResult> {
        sorted_by_score(results)
    }
}

/// Best hit per file path.
pub struct PathStrategy;

impl ClusterStrategy for PathStrategy {
    fn name(&self) -> &'static str {
        "path"
    }

    fn fit_predict(&self, _embeddings: &[Vec<f32>], results: &[SearchResult]) -> Vec<SearchResult> {
        let mut best_by_path: HashMap<String, SearchResult> = HashMap::new();
        for result in results {
            let key = result.path.to_ascii_lowercase();
            match best_by_path.get(&key) {
                Some(existing) if existing.score >= result.score => {}
                _ => {
                    best_by_path.insert(key, result.clone());
                }
            }
        }
        sorted_by_score(&best_by_path.into_values().collect::<Vec<_>>())
    }
}

/// Round-robin over directories, best-first within each.
pub struct DirRoundRobinStrategy;

impl ClusterStrategy for DirRoundRobinStrategy {
    fn name(&self) -> &'static str {
        "dir_rr"
    }

    fn fit_predict(&self, _embeddings: &[Vec<f32>], results: &[SearchResult]) -> Vec<SearchResult> {
        let sorted = sorted_by_score(results);

        let mut buckets: HashMap<String, Vec<SearchResult>> = HashMap::new();
        let mut dir_order: Vec<String> = Vec::new();
        for result in sorted {
            let dir = Path::new(&result.path)
                .parent()
                .map(|p| p.to_string_lossy().to_ascii_lowercase())
                .unwrap_or_default();
            if !buckets.contains_key(&dir) {
                dir_order.push(dir.clone());
            }
            buckets.entry(dir).or_default().push(result);
        }

        let mut out = Vec::new();
        loop {
            let mut progressed = false;
            for dir in &dir_order {
                if let Some(bucket) = buckets.get_mut(dir) {
                    if !bucket.is_empty() {
                        out.push(bucket.remove(0));
                        progressed = true;
                    }
                }
            }
            if !progressed {
                break;
            }
        }
        out
    }
}

/// Groups by symbol name (path stem when absent); most frequent groups
/// first, best score as representative.
pub struct FrequencyStrategy;

impl ClusterStrategy for FrequencyStrategy {
    fn name(&self) -> &'static str {
        "frequency"
    }

    fn fit_predict(&self, _embeddings: &[Vec<f32>], results: &[SearchResult]) -> Vec<SearchResult> {
        let mut groups: HashMap<String, Vec<&SearchResult>> = HashMap::new();
        for result in results {
            let key = result
                .symbol_name
                .clone()
                .unwrap_or_else(|| {
                    Path::new(&result.path)
                        .file_stem()
                        .map(|s| s.to_string_lossy().to_string())
                        .unwrap_or_default()
                })
                .to_ascii_lowercase();
            groups.entry(key).or_default().push(result);
        }

        let mut ordered: Vec<(String, Vec<&SearchResult>)> = groups.into_iter().collect();
        ordered.sort_by(|(key_a, group_a), (key_b, group_b)| {
            group_b
                .len()
                .cmp(&group_a.len())
                .then_with(|| key_a.cmp(key_b))
        });

        ordered
            .into_iter()
            .filter_map(|(_, group)| {
                group
                    .into_iter()
                    .max_by(|a, b| {
                        a.score
                            .partial_cmp(&b.score)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then_with(|| b.path.cmp(&a.path))
                    })
                    .cloned()
            })
            .collect()
    }
}

/// Density-based clustering over result embeddings with cosine distance.
/// `adaptive_eps` derives the radius from the observed pairwise distances
/// (the hdbscan-flavored variant); otherwise a fixed radius is used.
pub struct DbscanStrategy {
    pub config: ClusteringConfig,
    pub adaptive_eps: bool,
}

impl DbscanStrategy {
    const FIXED_EPS: f32 = 0.35;
    const NOISE: i32 = -1;
    const UNVISITED: i32 = -2;

    fn distances(embeddings: &[Vec<f32>]) -> Vec<Vec<f32>> {
        let n = embeddings.len();
        let mut matrix = vec![vec![0.0_f32; n]; n];
        for i in 0..n {
            for j in (i + 1)..n {
                let distance = 1.0 - cosine_similarity(&embeddings[i], &embeddings[j]);
                matrix[i][j] = distance;
                matrix[j][i] = distance;
            }
        }
        matrix
    }

    fn pick_eps(&self, distances: &[Vec<f32>]) -> f32 {
        if !self.adaptive_eps {
            return Self::FIXED_EPS;
        }
        // Median of each point's nearest-neighbor distance.
        let mut nearest: Vec<f32> = distances
            .iter()
            .enumerate()
            .filter_map(|(i, row)| {
                row.iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, d)| *d)
                    .fold(None, |min: Option<f32>, d| {
                        Some(min.map_or(d, |m| m.min(d)))
                    })
            })
            .collect();
        if nearest.is_empty() {
            return Self::FIXED_EPS;
        }
        nearest.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let median = nearest[nearest.len() / 2];
        (median * 1.5).clamp(0.05, 0.6)
    }
}

impl ClusterStrategy for DbscanStrategy {
    fn name(&self) -> &'static str {
        if self.adaptive_eps { "hdbscan" } else { "dbscan" }
    }

    fn fit_predict(&self, embeddings: &[Vec<f32>], results: &[SearchResult]) -> Vec<SearchResult> {
        if embeddings.len() != results.len() || embeddings.is_empty() {
            return ScoreStrategy.fit_predict(embeddings, results);
        }

        let n = results.len();
        let distances = Self::distances(embeddings);
        let eps = self.pick_eps(&distances);
        let min_points = self.config.min_samples.max(2);

        let mut labels = vec![Self::UNVISITED; n];
        let mut cluster = 0_i32;

        for point in 0..n {
            if labels[point] != Self::UNVISITED {
                continue;
            }
            let neighbors: Vec<usize> = (0..n)
                .filter(|&other| other != point && distances[point][other] <= eps)
                .collect();
            if neighbors.len() + 1 < min_points {
                labels[point] = Self::NOISE;
                continue;
            }

            labels[point] = cluster;
            let mut queue = neighbors;
            while let Some(next) = queue.pop() {
                if labels[next] == Self::NOISE {
                    labels[next] = cluster;
                }
                if labels[next] != Self::UNVISITED {
                    continue;
                }
                labels[next] = cluster;
                let expansion: Vec<usize> = (0..n)
                    .filter(|&other| other != next && distances[next][other] <= eps)
                    .collect();
                if expansion.len() + 1 >= min_points {
                    queue.extend(expansion);
                }
            }
            cluster += 1;
        }

        // One representative per cluster; noise points stand alone.
        let mut best_per_cluster: HashMap<i32, usize> = HashMap::new();
        let mut representatives: Vec<usize> = Vec::new();
        for (idx, label) in labels.iter().enumerate() {
            if *label == Self::NOISE {
                representatives.push(idx);
                continue;
            }
            match best_per_cluster.get(label) {
                Some(&current) if results[current].score >= results[idx].score => {}
                _ => {
                    best_per_cluster.insert(*label, idx);
                }
            }
        }
        representatives.extend(best_per_cluster.values().copied());

        let picked: Vec<SearchResult> = representatives
            .into_iter()
            .map(|idx| results[idx].clone())
            .collect();
        sorted_by_score(&picked)
    }
}

/// `hdbscan` when there is enough data to cluster meaningfully, top-N by
/// score otherwise.
pub struct AutoStrategy {
    pub config: ClusteringConfig,
}

impl ClusterStrategy for AutoStrategy {
    fn name(&self) -> &'static str {
        "auto"
    }

    fn fit_predict(&self, embeddings: &[Vec<f32>], results: &[SearchResult]) -> Vec<SearchResult> {
        let enough_data = embeddings.len() == results.len()
            && results.len() >= self.config.min_cluster_size * 3;
        if enough_data {
            DbscanStrategy {
                config: self.config.clone(),
                adaptive_eps: true,
            }
            .fit_predict(embeddings, results)
        } else {
            ScoreStrategy.fit_predict(embeddings, results)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::{EmbeddingProvider, HashEmbedder};

    fn result(path: &str, score: f32, symbol: Option<&str>) -> SearchResult {
        let mut r = SearchResult::new(path, score, "");
        r.symbol_name = symbol.map(String::from);
        r
    }

    #[test]
    fn path_strategy_keeps_best_score_per_file() {
        let results = vec![
            result("/a/x.py", 0.9, None),
            result("/a/x.py", 0.5, None),
            result("/a/y.py", 0.7, None),
        ];
        let picked = PathStrategy.fit_predict(&[], &results);
        assert_eq!(picked.len(), 2);
        assert_eq!(picked[0].path, "/a/x.py");
        assert!((picked[0].score - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn dir_round_robin_interleaves_directories() {
        let results = vec![
            result("/a/1.py", 0.9, None),
            result("/a/2.py", 0.8, None),
            result("/b/1.py", 0.7, None),
        ];
        let picked = DirRoundRobinStrategy.fit_predict(&[], &results);
        assert_eq!(picked[0].path, "/a/1.py");
        assert_eq!(picked[1].path, "/b/1.py");
        assert_eq!(picked[2].path, "/a/2.py");
    }

    #[test]
    fn dbscan_collapses_tight_groups() {
        let embedder = HashEmbedder::new(64);
        let texts = [
            "authenticate user credentials token",
            "authenticate user credentials token session",
            "authenticate user token credentials",
            "matrix rotation geometry transform",
        ];
        let embeddings: Vec<Vec<f32>> = texts
            .iter()
            .map(|t| embedder.embed_one(t).unwrap())
            .collect();
        let results: Vec<SearchResult> = (0..texts.len())
            .map(|i| result(&format!("/f{i}.py"), 1.0 - i as f32 * 0.1, None))
            .collect();

        let strategy = DbscanStrategy {
            config: ClusteringConfig {
                min_cluster_size: 2,
                min_samples: 2,
            },
            adaptive_eps: false,
        };
        let picked = strategy.fit_predict(&embeddings, &results);

        // The three auth chunks collapse to one representative; the
        // geometry outlier survives as noise.
        assert!(picked.len() < results.len());
        assert!(picked.iter().any(|r| r.path == "/f0.py"));
        assert!(picked.iter().any(|r| r.path == "/f3.py"));
    }

    #[test]
    fn strategies_are_deterministic() {
        let results = vec![
            result("/a.py", 0.5, Some("x")),
            result("/b.py", 0.5, Some("y")),
            result("/c.py", 0.5, Some("x")),
        ];
        let first = FrequencyStrategy.fit_predict(&[], &results);
        let second = FrequencyStrategy.fit_predict(&[], &results);
        let paths = |v: &[SearchResult]| v.iter().map(|r| r.path.clone()).collect::<Vec<_>>();
        assert_eq!(paths(&first), paths(&second));
    }

    #[test]
    fn unknown_names_fall_back_to_auto_only_when_asked() {
        assert!(get_strategy("made_up", ClusteringConfig::default(), false).is_none());
        let strategy = get_strategy("made_up", ClusteringConfig::default(), true).unwrap();
        assert_eq!(strategy.name(), "auto");
    }
}
