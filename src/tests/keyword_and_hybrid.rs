// Keyword, FTS, and hybrid ranking interplay

use super::helpers::{TestProject, file_names};
use crate::search::SearchOptions;
use crate::storage::dir_index::DirIndexStore;
use crate::types::SemanticMetadata;
use std::collections::BTreeSet;

/// Two files carry the LLM keyword "auth"; a third only mentions auth in
/// its content.
fn keyword_project() -> TestProject {
    let project = TestProject::new();
    project.write_file("login.py", "def login(user):\n    return session_for(user)\n");
    project.write_file("tokens.py", "def issue(user):\n    return sign(user)\n");
    project.write_file("notes.py", "helper = 'auth code lives elsewhere'\n");
    project.build();

    let store = DirIndexStore::open(&project.index_db_for("")).unwrap();
    for name in ["login.py", "tokens.py"] {
        let metadata = SemanticMetadata {
            summary: "authentication".into(),
            purpose: "auth".into(),
            keywords: vec!["auth".into(), "session".into()],
            llm_tool: "test-tool".into(),
            generated_at: chrono::Utc::now(),
        };
        store
            .update_semantic_metadata(&project.root().join(name), &metadata)
            .unwrap();
    }

    project
}

#[test]
fn normalized_keyword_search_returns_only_annotated_files() {
    let project = keyword_project();
    let store = DirIndexStore::open(&project.index_db_for("")).unwrap();

    let matches = store.search_semantic_keywords("auth", true).unwrap();
    let names: BTreeSet<String> = matches
        .iter()
        .map(|(entry, _)| entry.name.clone())
        .collect();

    assert_eq!(
        names,
        BTreeSet::from(["login.py".to_string(), "tokens.py".to_string()])
    );
}

#[test]
fn exact_fts_also_sees_the_content_only_mention() {
    let project = keyword_project();
    let store = DirIndexStore::open(&project.index_db_for("")).unwrap();

    let hits = store.search_fts_exact("auth", 10, false).unwrap();
    let paths: Vec<String> = hits.iter().map(|h| h.path.clone()).collect();
    assert_eq!(file_names(&paths), vec!["notes.py".to_string()]);
}

#[test]
fn semantic_results_rank_annotated_files_above_content_mentions() {
    let project = keyword_project();
    let engine = project.engine();

    let options = SearchOptions {
        include_semantic: true,
        enable_fuzzy: false,
        ..SearchOptions::default()
    };
    let result = engine.search("auth", &project.root(), &options);

    let paths: Vec<String> = result.results.iter().map(|r| r.path.clone()).collect();
    let names = file_names(&paths);
    for expected in ["login.py", "notes.py", "tokens.py"] {
        assert!(names.contains(&expected.to_string()), "missing {expected}");
    }

    // Keyword-annotated files carry the boosted semantic score.
    let top_two: BTreeSet<String> = result
        .results
        .iter()
        .take(2)
        .map(|r| {
            std::path::Path::new(&r.path)
                .file_name()
                .unwrap()
                .to_string_lossy()
                .to_string()
        })
        .collect();
    assert_eq!(
        top_two,
        BTreeSet::from(["login.py".to_string(), "tokens.py".to_string()])
    );
}

#[test]
fn hybrid_search_fuses_exact_and_fuzzy_channels() {
    let project = TestProject::new();
    project.write_file(
        "config.py",
        "def load_configuration(path):\n    return parse(path)\n",
    );
    project.write_file("misc.py", "def unrelated():\n    return 0\n");
    project.build();

    let engine = project.engine();
    let options = SearchOptions {
        hybrid_mode: true,
        ..SearchOptions::default()
    };
    let result = engine.search("configuration", &project.root(), &options);

    assert!(!result.results.is_empty());
    assert!(result.results[0].path.ends_with("config.py"));
}

#[test]
fn custom_hybrid_weights_can_silence_a_channel() {
    let project = TestProject::new();
    // Only a trigram fragment matches: the fuzzy channel is the sole
    // source, so zeroing its weight empties the result set.
    project.write_file("vector.py", "def vectorization():\n    return 1\n");
    project.build();

    let engine = project.engine();
    let mut weights = std::collections::HashMap::new();
    weights.insert("fuzzy".to_string(), 0.0_f32);

    let options = SearchOptions {
        hybrid_mode: true,
        hybrid_weights: Some(weights),
        ..SearchOptions::default()
    };
    let result = engine.search("vectoriz", &project.root(), &options);
    assert!(result.results.is_empty());

    let default_options = SearchOptions {
        hybrid_mode: true,
        ..SearchOptions::default()
    };
    let with_fuzzy = engine.search("vectoriz", &project.root(), &default_options);
    assert!(!with_fuzzy.results.is_empty());
}
