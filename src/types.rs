// Core entity types shared by parsers, stores, and the search engine

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// A code symbol (class, function, method, variable) extracted from source.
///
/// Symbols are multi-valued: the same name may appear in many files, and
/// nothing here is globally unique.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    /// 1-based inclusive (start_line, end_line)
    pub range: (u32, u32),
    /// Absolute path of the defining file, when known
    pub file: Option<String>,
}

impl Symbol {
    pub fn new(name: impl Into<String>, kind: SymbolKind, range: (u32, u32)) -> Self {
        Self {
            name: name.into(),
            kind,
            range,
            file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Class,
    Function,
    Method,
    Variable,
    Constant,
    Module,
    Interface,
    Struct,
}

impl SymbolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Class => "class",
            Self::Function => "function",
            Self::Method => "method",
            Self::Variable => "variable",
            Self::Constant => "constant",
            Self::Module => "module",
            Self::Interface => "interface",
            Self::Struct => "struct",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "class" => Some(Self::Class),
            "function" => Some(Self::Function),
            "method" => Some(Self::Method),
            "variable" => Some(Self::Variable),
            "constant" => Some(Self::Constant),
            "module" => Some(Self::Module),
            "interface" => Some(Self::Interface),
            "struct" => Some(Self::Struct),
            _ => None,
        }
    }
}

impl std::fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relationship between a source symbol and a (possibly external) target.
///
/// The target is a free-form qualified name: a local symbol, a dotted
/// module path, or an aliased import target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CodeRelationship {
    /// Qualified name of the enclosing scope (`<module>` at file level)
    pub source_symbol: String,
    pub target_symbol: String,
    pub kind: RelationshipKind,
    pub source_file: String,
    pub target_file: Option<String>,
    /// 1-based line of the reference
    pub source_line: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    Imports,
    Inherits,
    Call,
    Uses,
    References,
}

impl RelationshipKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Imports => "imports",
            Self::Inherits => "inherits",
            Self::Call => "call",
            Self::Uses => "uses",
            Self::References => "references",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "imports" => Some(Self::Imports),
            "inherits" => Some(Self::Inherits),
            "call" => Some(Self::Call),
            "uses" => Some(Self::Uses),
            "references" => Some(Self::References),
            _ => None,
        }
    }
}

impl std::fmt::Display for RelationshipKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of one parser run over one file.
#[derive(Debug, Clone, Default)]
pub struct ParsedFile {
    pub path: PathBuf,
    pub language: String,
    pub symbols: Vec<Symbol>,
    pub relationships: Vec<CodeRelationship>,
}

/// A file row as stored in a directory index.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub id: i64,
    pub name: String,
    pub full_path: PathBuf,
    pub language: Option<String>,
    /// Modification time in whole milliseconds since the Unix epoch
    pub mtime_ms: i64,
    pub size: u64,
    pub line_count: u32,
    pub content_hash: Option<String>,
}

/// A subdirectory link row in a parent directory index.
#[derive(Debug, Clone)]
pub struct SubdirLink {
    pub name: String,
    pub index_path: PathBuf,
    pub files_count: u64,
    pub direct_files: u64,
}

/// One ranked hit from any search channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub path: String,
    pub score: f32,
    pub excerpt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_line: Option<u32>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl SearchResult {
    pub fn new(path: impl Into<String>, score: f32, excerpt: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            score,
            excerpt: excerpt.into(),
            content: None,
            symbol_name: None,
            symbol_kind: None,
            start_line: None,
            end_line: None,
            metadata: HashMap::new(),
        }
    }
}

/// Per-file LLM-derived annotations stored in `semantic_metadata`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticMetadata {
    pub summary: String,
    pub purpose: String,
    pub keywords: Vec<String>,
    pub llm_tool: String,
    pub generated_at: chrono::DateTime<chrono::Utc>,
}
