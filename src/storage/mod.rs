// Persistent storage layers
//
// `registry` tracks projects and directory mappings globally,
// `dir_index` owns one SQLite database per indexed directory, and
// `global_index` holds the project-wide symbol and relationship tables.

pub mod dir_index;
pub mod global_index;
pub mod registry;

pub use dir_index::DirIndexStore;
pub use global_index::GlobalSymbolIndex;
pub use registry::{DirMapping, ProjectInfo, RegistryStore};
