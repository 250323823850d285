// Process-wide configuration
//
// Settings are loaded from a JSON file (workspace `.codexlens/settings.json`
// first, then the global data dir) and merged with `.env`-style overrides.
// Unknown keys are warned and ignored rather than rejected.

pub mod env_file;

use crate::errors::{CodexLensError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub use env_file::{load_env_file, load_workspace_env};

/// Stage-2 expansion mode for the staged cascade pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage2Mode {
    Precomputed,
    Realtime,
    StaticGlobalGraph,
}

impl Stage2Mode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "precomputed" => Some(Self::Precomputed),
            "realtime" | "live" => Some(Self::Realtime),
            "static_global_graph" => Some(Self::StaticGlobalGraph),
            _ => None,
        }
    }
}

/// Cascade strategy selector for `cascade_search`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadeStrategy {
    Binary,
    BinaryRerank,
    DenseRerank,
    Staged,
}

impl CascadeStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binary" => Some(Self::Binary),
            "binary_rerank" | "hybrid" => Some(Self::BinaryRerank),
            "dense_rerank" => Some(Self::DenseRerank),
            "staged" => Some(Self::Staged),
            _ => None,
        }
    }
}

/// Realtime LSP expansion knobs (stage 2 `realtime` mode).
#[derive(Debug, Clone)]
pub struct RealtimeLspConfig {
    pub depth: usize,
    pub timeout_s: f64,
    pub max_nodes: usize,
    pub max_seeds: usize,
    pub max_concurrent: usize,
    pub warmup_s: f64,
}

impl Default for RealtimeLspConfig {
    fn default() -> Self {
        Self {
            depth: 1,
            timeout_s: 30.0,
            max_nodes: 50,
            max_seeds: 1,
            max_concurrent: 2,
            warmup_s: 3.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Root of all persisted index data (`<data_dir>/index` mirrors source trees)
    pub data_dir: PathBuf,
    /// Extension (no dot, lowercase) -> language id
    pub supported_languages: HashMap<String, String>,
    pub incremental: bool,
    /// Verify file contents by hash in `needs_reindex`, not just (mtime, size)
    pub content_hash_enabled: bool,

    pub global_symbol_index_enabled: bool,
    pub static_graph_enabled: bool,
    pub static_graph_relationship_types: Vec<String>,

    /// Prefer the declarative pattern extractor for relationships
    pub use_pattern_extractor: bool,

    pub embedding_backend: String,
    pub embedding_model: String,
    pub embedding_dimension: usize,

    pub enable_cascade_search: bool,
    pub cascade_strategy: CascadeStrategy,
    pub cascade_coarse_k: usize,
    pub cascade_fine_k: usize,

    pub staged_stage2_mode: Stage2Mode,
    pub staged_clustering_strategy: String,
    pub staged_clustering_min_size: usize,
    pub staged_graph_depth: usize,
    pub enable_staged_rerank: bool,
    pub realtime_lsp: RealtimeLspConfig,

    pub reranker_chunk_type_weights: Option<HashMap<String, f32>>,
    pub reranker_test_file_penalty: f32,

    pub enable_graph_expansion: bool,
    pub search_max_workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        let mut supported_languages = HashMap::new();
        for (ext, lang) in [
            ("py", "python"),
            ("pyi", "python"),
            ("js", "javascript"),
            ("mjs", "javascript"),
            ("cjs", "javascript"),
            ("jsx", "javascript"),
            ("ts", "typescript"),
            ("tsx", "typescript"),
            ("rs", "rust"),
            ("go", "go"),
        ] {
            supported_languages.insert(ext.to_string(), lang.to_string());
        }

        let data_dir = default_data_dir();

        Self {
            data_dir,
            supported_languages,
            incremental: true,
            content_hash_enabled: true,
            global_symbol_index_enabled: true,
            static_graph_enabled: true,
            static_graph_relationship_types: vec!["imports".into(), "inherits".into()],
            use_pattern_extractor: false,
            embedding_backend: "builtin".into(),
            embedding_model: "hash-384".into(),
            embedding_dimension: 384,
            enable_cascade_search: false,
            cascade_strategy: CascadeStrategy::Binary,
            cascade_coarse_k: 100,
            cascade_fine_k: 10,
            staged_stage2_mode: Stage2Mode::Precomputed,
            staged_clustering_strategy: "auto".into(),
            staged_clustering_min_size: 3,
            staged_graph_depth: 2,
            enable_staged_rerank: false,
            realtime_lsp: RealtimeLspConfig::default(),
            reranker_chunk_type_weights: None,
            reranker_test_file_penalty: 0.0,
            enable_graph_expansion: false,
            search_max_workers: 8,
        }
    }
}

fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CODEXLENS_DATA_DIR") {
        let expanded = shellexpand::tilde(&dir).to_string();
        return PathBuf::from(expanded);
    }
    let home = shellexpand::tilde("~").to_string();
    PathBuf::from(home).join(".codexlens")
}

impl Config {
    /// Load settings for a workspace: defaults, then the settings JSON,
    /// then `.env` overrides.
    pub fn load(workspace_root: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        let mut settings_path = config.data_dir.join("settings.json");
        if let Some(root) = workspace_root {
            let local = root.join(".codexlens").join("settings.json");
            if local.is_file() {
                settings_path = local;
            }
        }

        if settings_path.is_file() {
            let text = std::fs::read_to_string(&settings_path).map_err(|e| {
                CodexLensError::Config(format!("unreadable settings {}: {e}", settings_path.display()))
            })?;
            let value: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
                CodexLensError::Config(format!("invalid settings {}: {e}", settings_path.display()))
            })?;
            config.apply_settings(&value)?;
            debug!("Loaded settings from {}", settings_path.display());
        }

        if let Some(root) = workspace_root {
            let env = env_file::load_workspace_env(root);
            config.apply_env(&env)?;
        }

        Ok(config)
    }

    /// Index root under which source trees are mirrored.
    pub fn index_root(&self) -> PathBuf {
        self.data_dir.join("index")
    }

    /// Registry database location.
    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join("registry.db")
    }

    /// Map a path to its language id by extension, `None` when unsupported.
    pub fn language_for_path(&self, path: &Path) -> Option<String> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        self.supported_languages.get(&ext).cloned()
    }

    fn apply_settings(&mut self, value: &serde_json::Value) -> Result<()> {
        let Some(root) = value.as_object() else {
            return Err(CodexLensError::Config("settings root must be an object".into()));
        };

        for (key, section) in root {
            match key.as_str() {
                "data_dir" => {
                    if let Some(s) = section.as_str() {
                        self.data_dir = PathBuf::from(shellexpand::tilde(s).to_string());
                    }
                }
                "languages" => {
                    if let Some(map) = section.as_object() {
                        for (ext, lang) in map {
                            if let Some(lang) = lang.as_str() {
                                self.supported_languages
                                    .insert(ext.to_ascii_lowercase(), lang.to_string());
                            }
                        }
                    }
                }
                "indexing" => self.apply_indexing_section(section),
                "parsing" => {
                    if let Some(v) = section.get("use_pattern_extractor").and_then(|v| v.as_bool()) {
                        self.use_pattern_extractor = v;
                    }
                }
                "embedding" => self.apply_embedding_section(section),
                "cascade" => self.apply_cascade_section(section)?,
                "reranker" => self.apply_reranker_section(section),
                "search" => {
                    if let Some(v) = section.get("max_workers").and_then(|v| v.as_u64()) {
                        self.search_max_workers = v.max(1) as usize;
                    }
                    if let Some(v) = section.get("enable_graph_expansion").and_then(|v| v.as_bool()) {
                        self.enable_graph_expansion = v;
                    }
                }
                other => warn!("Ignoring unknown settings key: {other}"),
            }
        }

        Ok(())
    }

    fn apply_indexing_section(&mut self, section: &serde_json::Value) {
        if let Some(v) = section.get("incremental").and_then(|v| v.as_bool()) {
            self.incremental = v;
        }
        if let Some(v) = section.get("content_hash_enabled").and_then(|v| v.as_bool()) {
            self.content_hash_enabled = v;
        }
        if let Some(v) = section.get("global_symbol_index_enabled").and_then(|v| v.as_bool()) {
            self.global_symbol_index_enabled = v;
        }
        if let Some(v) = section.get("static_graph_enabled").and_then(|v| v.as_bool()) {
            self.static_graph_enabled = v;
        }
        if let Some(list) = section
            .get("static_graph_relationship_types")
            .and_then(|v| v.as_array())
        {
            let cleaned: Vec<String> = list
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !cleaned.is_empty() {
                self.static_graph_relationship_types = cleaned;
            }
        }
    }

    fn apply_embedding_section(&mut self, section: &serde_json::Value) {
        if let Some(v) = section.get("backend").and_then(|v| v.as_str()) {
            self.embedding_backend = v.to_string();
        }
        if let Some(v) = section.get("model").and_then(|v| v.as_str()) {
            self.embedding_model = v.to_string();
        }
        if let Some(v) = section.get("dimension").and_then(|v| v.as_u64()) {
            self.embedding_dimension = v.max(1) as usize;
        }
    }

    fn apply_cascade_section(&mut self, section: &serde_json::Value) -> Result<()> {
        if let Some(v) = section.get("enabled").and_then(|v| v.as_bool()) {
            self.enable_cascade_search = v;
        }
        if let Some(s) = section.get("strategy").and_then(|v| v.as_str()) {
            self.cascade_strategy = CascadeStrategy::parse(s)
                .ok_or_else(|| CodexLensError::Config(format!("unknown cascade strategy: {s}")))?;
        }
        if let Some(v) = section.get("coarse_k").and_then(|v| v.as_u64()) {
            self.cascade_coarse_k = v.max(1) as usize;
        }
        if let Some(v) = section.get("fine_k").and_then(|v| v.as_u64()) {
            self.cascade_fine_k = v.max(1) as usize;
        }

        if let Some(staged) = section.get("staged") {
            if let Some(s) = staged.get("stage2_mode").and_then(|v| v.as_str()) {
                self.staged_stage2_mode = Stage2Mode::parse(s)
                    .ok_or_else(|| CodexLensError::Config(format!("unknown stage2 mode: {s}")))?;
            }
            if let Some(s) = staged.get("clustering_strategy").and_then(|v| v.as_str()) {
                self.staged_clustering_strategy = s.trim().to_ascii_lowercase();
            }
            if let Some(v) = staged.get("clustering_min_size").and_then(|v| v.as_u64()) {
                self.staged_clustering_min_size = v.max(2) as usize;
            }
            if let Some(v) = staged.get("graph_depth").and_then(|v| v.as_u64()) {
                self.staged_graph_depth = (v as usize).clamp(1, 2);
            }
            if let Some(v) = staged.get("enable_rerank").and_then(|v| v.as_bool()) {
                self.enable_staged_rerank = v;
            }
            if let Some(rt) = staged.get("realtime_lsp") {
                if let Some(v) = rt.get("depth").and_then(|v| v.as_u64()) {
                    self.realtime_lsp.depth = v.max(1) as usize;
                }
                if let Some(v) = rt.get("timeout_s").and_then(|v| v.as_f64()) {
                    self.realtime_lsp.timeout_s = v;
                }
                if let Some(v) = rt.get("max_nodes").and_then(|v| v.as_u64()) {
                    self.realtime_lsp.max_nodes = v.max(1) as usize;
                }
                if let Some(v) = rt.get("max_seeds").and_then(|v| v.as_u64()) {
                    self.realtime_lsp.max_seeds = v.max(1) as usize;
                }
                if let Some(v) = rt.get("max_concurrent").and_then(|v| v.as_u64()) {
                    self.realtime_lsp.max_concurrent = v.max(1) as usize;
                }
                if let Some(v) = rt.get("warmup_s").and_then(|v| v.as_f64()) {
                    self.realtime_lsp.warmup_s = v.max(0.0);
                }
            }
        }

        Ok(())
    }

    fn apply_reranker_section(&mut self, section: &serde_json::Value) {
        if let Some(v) = section.get("enabled").and_then(|v| v.as_bool()) {
            self.enable_staged_rerank = v;
        }
        if let Some(v) = section.get("test_file_penalty").and_then(|v| v.as_f64()) {
            self.reranker_test_file_penalty = v.clamp(0.0, 1.0) as f32;
        }
        if let Some(map) = section.get("chunk_type_weights").and_then(|v| v.as_object()) {
            let weights: HashMap<String, f32> = map
                .iter()
                .filter_map(|(k, v)| v.as_f64().map(|w| (k.clone(), w as f32)))
                .collect();
            if !weights.is_empty() {
                self.reranker_chunk_type_weights = Some(weights);
            }
        }
    }

    /// Apply `.env` overrides on top of settings. Unknown keys warn.
    fn apply_env(&mut self, env: &HashMap<String, String>) -> Result<()> {
        for (key, value) in env {
            match key.as_str() {
                "CODEXLENS_DATA_DIR" => {
                    self.data_dir = PathBuf::from(shellexpand::tilde(value).to_string());
                }
                "CODEXLENS_DEBUG" => {}
                "ENABLE_CASCADE_SEARCH" => self.enable_cascade_search = parse_bool(value),
                "CASCADE_STRATEGY" => {
                    self.cascade_strategy = CascadeStrategy::parse(value).ok_or_else(|| {
                        CodexLensError::Config(format!("unknown CASCADE_STRATEGY: {value}"))
                    })?;
                }
                "CASCADE_COARSE_K" => {
                    if let Ok(v) = value.parse::<usize>() {
                        self.cascade_coarse_k = v.max(1);
                    }
                }
                "CASCADE_FINE_K" => {
                    if let Ok(v) = value.parse::<usize>() {
                        self.cascade_fine_k = v.max(1);
                    }
                }
                "STAGED_STAGE2_MODE" => {
                    self.staged_stage2_mode = Stage2Mode::parse(value).ok_or_else(|| {
                        CodexLensError::Config(format!("unknown STAGED_STAGE2_MODE: {value}"))
                    })?;
                }
                "STAGED_CLUSTERING_STRATEGY" => {
                    self.staged_clustering_strategy = value.trim().to_ascii_lowercase();
                }
                "STAGED_CLUSTERING_MIN_SIZE" => {
                    if let Ok(v) = value.parse::<usize>() {
                        self.staged_clustering_min_size = v.max(2);
                    }
                }
                "ENABLE_STAGED_RERANK" => self.enable_staged_rerank = parse_bool(value),
                "STAGED_REALTIME_LSP_TIMEOUT_S" => {
                    if let Ok(v) = value.parse::<f64>() {
                        self.realtime_lsp.timeout_s = v;
                    }
                }
                "STAGED_REALTIME_LSP_DEPTH" => {
                    if let Ok(v) = value.parse::<usize>() {
                        self.realtime_lsp.depth = v.max(1);
                    }
                }
                "STAGED_REALTIME_LSP_MAX_NODES" => {
                    if let Ok(v) = value.parse::<usize>() {
                        self.realtime_lsp.max_nodes = v.max(1);
                    }
                }
                "STAGED_REALTIME_LSP_MAX_SEEDS" => {
                    if let Ok(v) = value.parse::<usize>() {
                        self.realtime_lsp.max_seeds = v.max(1);
                    }
                }
                "STAGED_REALTIME_LSP_MAX_CONCURRENT" => {
                    if let Ok(v) = value.parse::<usize>() {
                        self.realtime_lsp.max_concurrent = v.max(1);
                    }
                }
                "STAGED_REALTIME_LSP_WARMUP_S" => {
                    if let Ok(v) = value.parse::<f64>() {
                        self.realtime_lsp.warmup_s = v.max(0.0);
                    }
                }
                "EMBEDDING_BACKEND" => self.embedding_backend = value.clone(),
                "EMBEDDING_MODEL" => self.embedding_model = value.clone(),
                "RERANKER_ENABLED" => self.enable_staged_rerank = parse_bool(value),
                "RERANKER_TEST_FILE_PENALTY" => {
                    if let Ok(v) = value.parse::<f32>() {
                        self.reranker_test_file_penalty = v.clamp(0.0, 1.0);
                    }
                }
                other => warn!("Ignoring unknown environment override: {other}"),
            }
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(config.incremental);
        assert_eq!(config.cascade_coarse_k, 100);
        assert_eq!(config.staged_stage2_mode, Stage2Mode::Precomputed);
        assert_eq!(
            config.language_for_path(Path::new("a/b/c.py")).as_deref(),
            Some("python")
        );
        assert_eq!(config.language_for_path(Path::new("a/b/c.zig")), None);
    }

    #[test]
    fn settings_json_overrides_defaults_and_warns_on_unknown() {
        let mut config = Config::default();
        let value: serde_json::Value = serde_json::from_str(
            r#"{
                "cascade": {"strategy": "staged", "coarse_k": 50, "staged": {"stage2_mode": "static_global_graph"}},
                "indexing": {"incremental": false},
                "totally_unknown": {"x": 1}
            }"#,
        )
        .unwrap();
        config.apply_settings(&value).unwrap();

        assert_eq!(config.cascade_strategy, CascadeStrategy::Staged);
        assert_eq!(config.cascade_coarse_k, 50);
        assert_eq!(config.staged_stage2_mode, Stage2Mode::StaticGlobalGraph);
        assert!(!config.incremental);
    }

    #[test]
    fn unknown_enum_value_is_a_config_error() {
        let mut config = Config::default();
        let value: serde_json::Value =
            serde_json::from_str(r#"{"cascade": {"strategy": "quantum"}}"#).unwrap();
        let err = config.apply_settings(&value).unwrap_err();
        assert!(matches!(err, CodexLensError::Config(_)));
    }

    #[test]
    fn env_overrides_take_precedence() {
        let mut config = Config::default();
        let mut env = HashMap::new();
        env.insert("CASCADE_STRATEGY".to_string(), "dense_rerank".to_string());
        env.insert("STAGED_REALTIME_LSP_MAX_NODES".to_string(), "7".to_string());
        config.apply_env(&env).unwrap();

        assert_eq!(config.cascade_strategy, CascadeStrategy::DenseRerank);
        assert_eq!(config.realtime_lsp.max_nodes, 7);
    }
}
