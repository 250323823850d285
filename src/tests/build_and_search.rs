// End-to-end build and search scenarios

use super::helpers::{TestProject, animal_project, file_names};
use crate::search::SearchOptions;
use crate::storage::dir_index::DirIndexStore;
use crate::types::SymbolKind;

#[test]
fn build_indexes_every_directory_and_links_children() {
    let project = TestProject::new();
    project.write_file("main.py", "def main():\n    run()\n");
    project.write_file("src/app.py", "def run():\n    pass\n");
    project.write_file("src/api/routes.py", "def route():\n    pass\n");

    let result = project.build();
    assert_eq!(result.total_files, 3);
    assert_eq!(result.total_dirs, 3);
    assert!(result.errors.is_empty());

    // Parent indexes link their children by name.
    let root_store = DirIndexStore::open(&project.index_db_for("")).unwrap();
    let subdirs = root_store.get_subdirs().unwrap();
    assert_eq!(subdirs.len(), 1);
    assert_eq!(subdirs[0].name, "src");

    let src_store = DirIndexStore::open(&project.index_db_for("src")).unwrap();
    let src_subdirs = src_store.get_subdirs().unwrap();
    assert_eq!(src_subdirs.len(), 1);
    assert_eq!(src_subdirs[0].name, "api");
}

#[test]
fn symbol_search_finds_exactly_one_dog_class() {
    let project = animal_project();
    project.build();

    let engine = project.engine();
    let symbols = engine.search_symbols("Dog", &project.root(), None, &SearchOptions::default());

    assert_eq!(symbols.len(), 1);
    assert_eq!(symbols[0].name, "Dog");
    assert_eq!(symbols[0].kind, SymbolKind::Class);
}

#[test]
fn graph_neighbors_connect_dog_and_animal() {
    let project = animal_project();
    project.build();

    let store = DirIndexStore::open(&project.index_db_for("")).unwrap();
    let a_path = project.root().join("a.py");
    let dog_id = store
        .find_symbol_id(&a_path.to_string_lossy(), "Dog")
        .unwrap()
        .expect("Dog symbol indexed");

    let neighbors = store.get_neighbors(dog_id).unwrap();
    assert!(
        neighbors.iter().any(|n| n.name == "Animal" && n.depth == 1),
        "expected an undirected depth-1 edge between Dog and Animal"
    );
}

#[test]
fn references_to_animal_point_at_the_inheriting_line() {
    let project = animal_project();
    project.build();

    let engine = project.engine();
    let references = engine.search_references("Animal", &project.root(), -1, 100);

    assert!(!references.is_empty());
    let a_ref = references
        .iter()
        .find(|r| r.file_path.ends_with("a.py"))
        .expect("reference from a.py");
    assert_eq!(a_ref.line, 1);
    assert_eq!(a_ref.relationship_type, "inherits");
    assert!(a_ref.context.contains("class Dog(Animal)"));
}

#[test]
fn fts_search_returns_matching_files() {
    let project = animal_project();
    project.build();

    let engine = project.engine();
    let result = engine.search("Animal", &project.root(), &SearchOptions::default());

    let paths: Vec<String> = result.results.iter().map(|r| r.path.clone()).collect();
    let names = file_names(&paths);
    assert!(names.contains(&"a.py".to_string()));
    assert!(names.contains(&"b.py".to_string()));
    assert!(result.stats.dirs_searched >= 1);
}

#[test]
fn depth_zero_limits_search_to_the_start_directory() {
    let project = TestProject::new();
    project.write_file("top.py", "def shared_token_alpha():\n    pass\n");
    project.write_file("deep/inner.py", "def shared_token_alpha():\n    pass\n");
    project.build();

    let engine = project.engine();
    let options = SearchOptions {
        depth: 0,
        ..SearchOptions::default()
    };
    let result = engine.search("shared_token_alpha", &project.root(), &options);

    let paths: Vec<String> = result.results.iter().map(|r| r.path.clone()).collect();
    assert_eq!(file_names(&paths), vec!["top.py".to_string()]);
}

#[test]
fn incremental_rebuild_of_unchanged_tree_is_stable() {
    let project = animal_project();
    project.build();

    let store = DirIndexStore::open(&project.index_db_for("")).unwrap();
    let first_root = store.merkle_root().unwrap().expect("merkle root after build");
    drop(store);

    let second = project.build();
    assert_eq!(second.errors.len(), 0);

    let store = DirIndexStore::open(&project.index_db_for("")).unwrap();
    let second_root = store.merkle_root().unwrap().unwrap();
    assert_eq!(first_root, second_root);
}

#[test]
fn deleted_files_disappear_on_incremental_rebuild() {
    let project = TestProject::new();
    project.write_file("src/a/keep.py", "def keep():\n    pass\n");
    let doomed = project.write_file("src/a/b.py", "def doomed_marker_fn():\n    pass\n");
    project.write_file("src/other.py", "def other():\n    pass\n");
    project.build();

    std::fs::remove_file(&doomed).unwrap();
    let rebuild = project.build();
    assert_eq!(rebuild.files_removed, 1);

    // The sibling survived, the deleted file is unfindable.
    let store = DirIndexStore::open(&project.index_db_for("src/a")).unwrap();
    assert_eq!(store.file_count().unwrap(), 1);

    let engine = project.engine();
    let result = engine.search("doomed_marker_fn", &project.root(), &SearchOptions::default());
    assert!(result.results.is_empty());
}

#[test]
fn unparseable_files_still_index_without_aborting() {
    let project = TestProject::new();
    project.write_file("ok.py", "def ok():\n    pass\n");
    // A file that defeats every parser still indexes (empty symbol list).
    project.write_file("weird.py", "\u{0}\u{0}not python at all\u{0}");

    let result = project.build();
    assert_eq!(result.total_files, 2);
}
