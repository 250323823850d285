// Index construction
//
// `tree_builder` walks a source tree bottom-up and builds one directory
// index per level in parallel; `incremental` applies single-file change
// events to the same stores.

pub mod incremental;
pub mod tree_builder;

pub use incremental::IncrementalIndexer;
pub use tree_builder::{BuildResult, DirBuildResult, IndexTreeBuilder};
