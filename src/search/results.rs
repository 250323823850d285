// Chain search option and result types

use crate::config::Stage2Mode;
use crate::types::{SearchResult, Symbol};
use std::collections::HashMap;

/// Configuration options for one chain search call.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Maximum traversal depth (-1 = unlimited, 0 = current dir only)
    pub depth: i32,
    pub max_workers: usize,
    pub limit_per_dir: usize,
    pub total_limit: usize,
    /// Pagination offset applied after ranking
    pub offset: usize,
    pub include_symbols: bool,
    pub files_only: bool,
    pub include_semantic: bool,
    /// Drop non-code files (md, json, yaml, lockfiles, images)
    pub code_only: bool,
    pub exclude_extensions: Option<Vec<String>>,
    pub hybrid_mode: bool,
    pub enable_fuzzy: bool,
    pub enable_vector: bool,
    pub pure_vector: bool,
    pub enable_cascade: bool,
    pub hybrid_weights: Option<HashMap<String, f32>>,
    pub group_results: bool,
    pub grouping_threshold: f32,
    /// Stage-2 override for staged cascade calls
    pub stage2_mode: Option<Stage2Mode>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            depth: -1,
            max_workers: 8,
            limit_per_dir: 10,
            total_limit: 100,
            offset: 0,
            include_symbols: false,
            files_only: false,
            include_semantic: false,
            code_only: false,
            exclude_extensions: None,
            hybrid_mode: false,
            enable_fuzzy: true,
            enable_vector: false,
            pure_vector: false,
            enable_cascade: false,
            hybrid_weights: None,
            group_results: false,
            grouping_threshold: 0.01,
            stage2_mode: None,
        }
    }
}

/// Statistics collected during search execution.
#[derive(Debug, Default, Clone)]
pub struct SearchStats {
    pub dirs_searched: usize,
    pub files_matched: usize,
    pub time_ms: f64,
    pub errors: Vec<String>,
    /// Which stage-1 source the cascade actually used
    /// (`centralized`, `legacy`, `dense`, `fts`)
    pub stage1_source: Option<String>,
}

/// Comprehensive search result with metadata.
#[derive(Debug, Default, Clone)]
pub struct ChainSearchResult {
    pub query: String,
    pub results: Vec<SearchResult>,
    /// Expanded results from graph neighbors
    pub related_results: Vec<SearchResult>,
    pub symbols: Vec<Symbol>,
    pub stats: SearchStats,
}

/// One reference hit from the `code_relationships` tables.
#[derive(Debug, Clone)]
pub struct ReferenceResult {
    pub file_path: String,
    /// 1-based line of the reference
    pub line: u32,
    pub column: u32,
    /// Surrounding code snippet
    pub context: String,
    pub relationship_type: String,
}
