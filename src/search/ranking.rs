// Result reordering: cross-encoder application and result grouping

use crate::errors::Result;
use crate::search::reranker::Reranker;
use crate::types::SearchResult;
use std::collections::HashMap;
use tracing::debug;

const RERANK_BATCH_SIZE: usize = 32;

/// Rerank candidates with a cross-encoder style scorer.
///
/// Documents are scored in batches; each returned result carries
/// `metadata.cross_encoder_reranked = true` and its raw reranker score.
/// Chunk-type weights multiply the score by `metadata.chunk_type`; the
/// test-file penalty scales down results whose path looks like a test.
pub fn cross_encoder_rerank(
    query: &str,
    results: &[SearchResult],
    reranker: &dyn Reranker,
    top_k: usize,
    chunk_type_weights: Option<&HashMap<String, f32>>,
    test_file_penalty: f32,
) -> Result<Vec<SearchResult>> {
    if results.is_empty() {
        return Ok(Vec::new());
    }

    let documents: Vec<&str> = results
        .iter()
        .map(|r| {
            r.content
                .as_deref()
                .filter(|c| !c.is_empty())
                .unwrap_or(r.excerpt.as_str())
        })
        .collect();

    let mut scores = Vec::with_capacity(documents.len());
    for batch in documents.chunks(RERANK_BATCH_SIZE) {
        scores.extend(reranker.score_pairs(query, batch)?);
    }

    let mut reranked: Vec<SearchResult> = results
        .iter()
        .zip(scores)
        .map(|(result, raw_score)| {
            let mut score = raw_score;

            if let Some(weights) = chunk_type_weights {
                let chunk_type = result
                    .metadata
                    .get("chunk_type")
                    .and_then(|v| v.as_str())
                    .unwrap_or("code");
                if let Some(weight) = weights.get(chunk_type) {
                    score *= weight;
                }
            }

            if test_file_penalty > 0.0 && looks_like_test_file(&result.path) {
                score *= 1.0 - test_file_penalty.clamp(0.0, 1.0);
            }

            let mut result = result.clone();
            result
                .metadata
                .insert("cross_encoder_reranked".into(), serde_json::Value::Bool(true));
            result.metadata.insert(
                "rerank_score".into(),
                serde_json::Number::from_f64(score as f64)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null),
            );
            result.score = score;
            result
        })
        .collect();

    reranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.path.cmp(&b.path))
    });
    reranked.truncate(top_k);

    debug!(
        "Cross-encoder ({}) reranked {} candidates to {}",
        reranker.name(),
        results.len(),
        reranked.len()
    );
    Ok(reranked)
}

fn looks_like_test_file(path: &str) -> bool {
    let lowered = path.to_ascii_lowercase();
    let name = lowered.rsplit(['/', '\\']).next().unwrap_or(&lowered);
    name.starts_with("test_")
        || name.ends_with("_test.py")
        || name.ends_with(".test.ts")
        || name.ends_with(".test.js")
        || name.ends_with(".spec.ts")
        || name.ends_with(".spec.js")
        || lowered.contains("/tests/")
        || lowered.contains("/__tests__/")
}

/// Fold results whose scores sit within `threshold` of a group leader into
/// that leader. The leader keeps its rank; grouped paths are recorded in
/// its metadata.
pub fn group_similar_results(results: Vec<SearchResult>, threshold: f32) -> Vec<SearchResult> {
    if results.len() < 2 || threshold <= 0.0 {
        return results;
    }

    let mut grouped: Vec<SearchResult> = Vec::new();
    for result in results {
        match grouped.last_mut() {
            Some(leader) if (leader.score - result.score).abs() <= threshold => {
                let entry = leader
                    .metadata
                    .entry("grouped_paths".into())
                    .or_insert_with(|| serde_json::Value::Array(Vec::new()));
                if let serde_json::Value::Array(paths) = entry {
                    paths.push(serde_json::Value::String(result.path));
                }
            }
            _ => grouped.push(result),
        }
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::reranker::LexicalReranker;

    fn candidate(path: &str, excerpt: &str) -> SearchResult {
        SearchResult::new(path, 0.5, excerpt)
    }

    #[test]
    fn reranked_results_are_marked_and_sorted() {
        let results = vec![
            candidate("/src/math.py", "rotate matrix transpose"),
            candidate("/src/auth.py", "authenticate user token check"),
        ];

        let reranked =
            cross_encoder_rerank("authenticate user", &results, &LexicalReranker, 10, None, 0.0)
                .unwrap();

        assert_eq!(reranked[0].path, "/src/auth.py");
        for result in &reranked {
            assert_eq!(
                result.metadata.get("cross_encoder_reranked"),
                Some(&serde_json::Value::Bool(true))
            );
        }
    }

    #[test]
    fn fifty_candidates_rerank_quickly() {
        let results: Vec<SearchResult> = (0..50)
            .map(|i| candidate(&format!("/src/f{i}.py"), "authenticate session token user"))
            .collect();

        let started = std::time::Instant::now();
        let reranked =
            cross_encoder_rerank("authenticate token", &results, &LexicalReranker, 10, None, 0.0)
                .unwrap();
        assert_eq!(reranked.len(), 10);
        assert!(started.elapsed().as_millis() < 200);
    }

    #[test]
    fn test_files_are_penalized() {
        let results = vec![
            candidate("/src/tests/test_auth.py", "authenticate user token"),
            candidate("/src/auth.py", "authenticate user token"),
        ];

        let reranked =
            cross_encoder_rerank("authenticate user", &results, &LexicalReranker, 10, None, 0.5)
                .unwrap();
        assert_eq!(reranked[0].path, "/src/auth.py");
    }

    #[test]
    fn near_equal_scores_group_under_the_leader() {
        let mut a = candidate("/a.py", "");
        a.score = 0.90;
        let mut b = candidate("/b.py", "");
        b.score = 0.895;
        let mut c = candidate("/c.py", "");
        c.score = 0.10;

        let grouped = group_similar_results(vec![a, b, c], 0.01);
        assert_eq!(grouped.len(), 2);
        assert!(grouped[0].metadata.contains_key("grouped_paths"));
    }
}
