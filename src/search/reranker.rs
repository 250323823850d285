// Reranker seam
//
// Cross-encoder model backends (local ONNX, remote APIs) are external
// collaborators; the crate fixes the scoring interface and ships one
// deterministic lexical implementation used by default and in tests.

use crate::errors::Result;
use std::collections::HashSet;

pub trait Reranker: Send + Sync {
    fn name(&self) -> &str;

    /// Score each `(query, document)` pair jointly; higher is better.
    /// Callers batch the documents.
    fn score_pairs(&self, query: &str, documents: &[&str]) -> Result<Vec<f32>>;
}

/// Deterministic token-overlap scorer: coverage of query tokens in the
/// document plus a small density bonus. No model, no I/O, stable output.
pub struct LexicalReranker;

fn tokens(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            current.push(c.to_ascii_lowercase());
        } else if !current.is_empty() {
            out.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

impl Reranker for LexicalReranker {
    fn name(&self) -> &str {
        "lexical"
    }

    fn score_pairs(&self, query: &str, documents: &[&str]) -> Result<Vec<f32>> {
        let query_tokens: HashSet<String> = tokens(query).into_iter().collect();

        let scores = documents
            .iter()
            .map(|document| {
                if query_tokens.is_empty() {
                    return 0.0;
                }
                let doc_tokens = tokens(document);
                if doc_tokens.is_empty() {
                    return 0.0;
                }

                let doc_set: HashSet<&str> = doc_tokens.iter().map(String::as_str).collect();
                let covered = query_tokens
                    .iter()
                    .filter(|t| doc_set.contains(t.as_str()))
                    .count();
                let coverage = covered as f32 / query_tokens.len() as f32;

                let hits = doc_tokens
                    .iter()
                    .filter(|t| query_tokens.contains(*t))
                    .count();
                let density = hits as f32 / doc_tokens.len() as f32;

                coverage * 0.8 + density * 0.2
            })
            .collect();

        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_documents_outscore_unrelated_ones() {
        let reranker = LexicalReranker;
        let scores = reranker
            .score_pairs(
                "authenticate user",
                &[
                    "def authenticate(user): return user.token",
                    "fn rotate_matrix(m: &mut Matrix)",
                ],
            )
            .unwrap();
        assert!(scores[0] > scores[1]);
    }

    #[test]
    fn scoring_is_deterministic() {
        let reranker = LexicalReranker;
        let docs = ["some document text", "another candidate here"];
        let a = reranker.score_pairs("candidate text", &docs).unwrap();
        let b = reranker.score_pairs("candidate text", &docs).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_inputs_score_zero() {
        let reranker = LexicalReranker;
        let scores = reranker.score_pairs("", &["anything"]).unwrap();
        assert_eq!(scores, vec![0.0]);
    }
}
