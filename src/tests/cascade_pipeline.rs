// Staged cascade and stage-1 fallback ladder scenarios

use super::helpers::TestProject;
use crate::search::{SearchOptions, write_legacy_sidecar};
use crate::storage::dir_index::DirIndexStore;
use crate::vector::{ChunkCategory, EmbeddingProvider, HashEmbedder, VectorStore, pack_sketch};
use std::collections::BTreeSet;

const DIM: usize = 64;

/// Index the animal-shelter project and populate the centralized vector
/// store with one chunk per function.
fn project_with_vectors() -> (TestProject, Vec<(i64, String)>) {
    let project = TestProject::new();
    project.write_file(
        "auth.py",
        "def authenticate(user, token):\n    return verify_token(token)\n",
    );
    project.write_file(
        "tokens.py",
        "def verify_token(token):\n    return token.valid\n",
    );
    project.write_file(
        "geometry.py",
        "def rotate(matrix):\n    return transpose(matrix)\n",
    );
    project.build();

    let embedder = HashEmbedder::new(DIM);
    let store = VectorStore::open(&project.index_root(), "builtin", "hash-64", DIM, false).unwrap();

    let chunks = [
        ("auth.py", "def authenticate(user, token): return verify_token(token)", "authenticate"),
        ("tokens.py", "def verify_token(token): return token.valid", "verify_token"),
        ("geometry.py", "def rotate(matrix): return transpose(matrix)", "rotate"),
    ];

    let mut inserted = Vec::new();
    for (name, content, symbol) in chunks {
        let file_path = project.root().join(name);
        let embedding = embedder.embed_one(content).unwrap();
        let metadata = format!("{{\"symbol_name\": \"{symbol}\", \"start_line\": 1}}");
        let chunk_id = store
            .add_chunk(
                &file_path.to_string_lossy(),
                content,
                Some(1),
                Some(2),
                None,
                ChunkCategory::Code,
                Some(&metadata),
                &embedding,
            )
            .unwrap();
        inserted.push((chunk_id, content.to_string()));
    }
    store.rebuild_ann_index().unwrap();
    store.save_ann_index().unwrap();
    crate::vector::model_lock::release_lock(&project.index_root());

    (project, inserted)
}

#[test]
fn staged_cascade_runs_all_four_stages() {
    let (project, _) = project_with_vectors();

    let engine = project.engine();
    let result = engine.staged_cascade_search(
        "authenticate token",
        &project.root(),
        5,
        50,
        &SearchOptions::default(),
    );

    assert!(!result.results.is_empty());
    assert!(result.results.len() <= 5);
    assert_eq!(result.stats.stage1_source.as_deref(), Some("centralized"));

    // The auth chunk must survive the full pipeline for an auth query.
    assert!(result.results.iter().any(|r| r.path.ends_with("auth.py")));

    let tag = result
        .stats
        .errors
        .iter()
        .find(|e| e.starts_with("STAGE_STATS:"))
        .expect("stage stats tag present");
    let payload: serde_json::Value =
        serde_json::from_str(tag.trim_start_matches("STAGE_STATS:")).unwrap();
    let times = payload["stage_times"].as_object().unwrap();
    assert_eq!(times.len(), 4);
    assert!(times.values().all(|v| v.is_number()));
    assert!(payload["stage_counts"]["stage1_candidates"].as_u64().unwrap() <= 50);
}

#[test]
fn staged_rerank_marks_results_when_enabled() {
    let (mut project, _inserted) = project_with_vectors();
    project.config.enable_staged_rerank = true;

    let engine = project.engine();
    let result = engine.staged_cascade_search(
        "verify token",
        &project.root(),
        3,
        50,
        &SearchOptions::default(),
    );

    assert!(!result.results.is_empty());
    for hit in &result.results {
        assert_eq!(
            hit.metadata.get("cross_encoder_reranked"),
            Some(&serde_json::Value::Bool(true))
        );
    }
}

#[test]
fn stage1_falls_back_to_fts_seeding_without_vector_artifacts() {
    let project = TestProject::new();
    project.write_file("handlers.py", "def seeded_handler():\n    return 1\n");
    project.build();

    let engine = project.engine();
    let result = engine.staged_cascade_search(
        "seeded_handler",
        &project.root(),
        5,
        50,
        &SearchOptions::default(),
    );

    assert_eq!(result.stats.stage1_source.as_deref(), Some("fts"));
    assert!(result.results.iter().any(|r| r.path.ends_with("handlers.py")));
}

#[test]
fn legacy_and_centralized_stage1_agree_on_chunk_ids() {
    let (project, inserted) = project_with_vectors();
    let embedder = HashEmbedder::new(DIM);

    // Mirror the centralized chunks into a legacy per-dir sidecar.
    let index_db = project.index_db_for("");
    {
        let store = DirIndexStore::open(&index_db).unwrap();
        let mut records = Vec::new();
        for (chunk_id, content) in &inserted {
            store
                .put_chunk(*chunk_id, &format!("/legacy/{chunk_id}.py"), content, None, "code")
                .unwrap();
            let embedding = embedder.embed_one(content).unwrap();
            records.push((*chunk_id, pack_sketch(&embedding)));
        }
        write_legacy_sidecar(&index_db, &records).unwrap();
    }

    let query = "authenticate token";
    let chunk_ids = |result: &crate::search::ChainSearchResult| -> BTreeSet<i64> {
        result
            .results
            .iter()
            .filter_map(|r| r.metadata.get("chunk_id").and_then(|v| v.as_i64()))
            .collect()
    };

    let centralized = {
        let engine = project.engine();
        engine.binary_cascade_search(query, &project.root(), 10, 10, &SearchOptions::default())
    };
    assert_eq!(centralized.stats.stage1_source.as_deref(), Some("centralized"));

    // Remove the centralized artifacts; the ladder drops to legacy.
    std::fs::remove_file(project.index_root().join("_binary_vectors.mmap")).unwrap();
    std::fs::remove_file(project.index_root().join("_binary_vectors.mmap.meta.json")).unwrap();

    let legacy = {
        let engine = project.engine();
        engine.binary_cascade_search(query, &project.root(), 10, 10, &SearchOptions::default())
    };
    assert_eq!(legacy.stats.stage1_source.as_deref(), Some("legacy"));

    assert_eq!(chunk_ids(&centralized), chunk_ids(&legacy));
}

#[test]
fn cascade_on_an_unindexed_path_returns_empty() {
    let project = TestProject::new();
    let engine = project.engine();
    let result = engine.binary_cascade_search(
        "anything",
        std::path::Path::new("/definitely/not/indexed"),
        5,
        50,
        &SearchOptions::default(),
    );
    assert!(result.results.is_empty());
}

#[test]
fn repeat_staged_searches_are_stable() {
    let (project, _) = project_with_vectors();
    let engine = project.engine();

    let first = engine.staged_cascade_search(
        "authenticate token",
        &project.root(),
        5,
        50,
        &SearchOptions::default(),
    );
    let second = engine.staged_cascade_search(
        "authenticate token",
        &project.root(),
        5,
        50,
        &SearchOptions::default(),
    );

    let order = |r: &crate::search::ChainSearchResult| -> Vec<String> {
        r.results.iter().map(|h| h.path.clone()).collect()
    };
    assert_eq!(order(&first), order(&second));
    for (a, b) in first.results.iter().zip(&second.results) {
        assert!((a.score - b.score).abs() < 1e-6);
    }
}
