// Schema creation and versioned migrations for directory indexes

use super::DirIndexStore;
use crate::errors::{CodexLensError, Result};
use rusqlite::{Connection, params};
use tracing::{debug, info};

/// Current schema version - increment when adding migrations.
pub const LATEST_SCHEMA_VERSION: i32 = 5;

impl DirIndexStore {
    pub(super) fn run_migrations(&self) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL,
                description TEXT NOT NULL
            )",
            [],
        )?;

        let current: i32 =
            conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
                row.get(0)
            })?;

        if current >= LATEST_SCHEMA_VERSION {
            debug!("Index schema up-to-date at version {current}");
            return Ok(());
        }

        info!(
            "Migrating {} from schema version {} to {}",
            self.db_path.display(),
            current,
            LATEST_SCHEMA_VERSION
        );

        for version in (current + 1)..=LATEST_SCHEMA_VERSION {
            let tx = conn.transaction()?;
            let description = apply_migration(&tx, version)?;
            tx.execute(
                "INSERT OR REPLACE INTO schema_version (version, applied_at, description)
                 VALUES (?1, ?2, ?3)",
                params![version, chrono::Utc::now().timestamp(), description],
            )?;
            tx.pragma_update(None, "user_version", version)?;
            tx.commit()?;
        }

        Ok(())
    }
}

fn apply_migration(conn: &Connection, version: i32) -> Result<&'static str> {
    match version {
        1 => {
            conn.execute_batch(
                "CREATE TABLE files (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    full_path TEXT NOT NULL UNIQUE,
                    language TEXT,
                    content TEXT NOT NULL,
                    mtime_ms INTEGER NOT NULL DEFAULT 0,
                    size INTEGER NOT NULL DEFAULT 0,
                    line_count INTEGER NOT NULL DEFAULT 0,
                    content_hash TEXT
                );
                CREATE TABLE symbols (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    start_line INTEGER NOT NULL,
                    end_line INTEGER NOT NULL
                );
                CREATE INDEX idx_symbols_name ON symbols(name);
                CREATE INDEX idx_symbols_file ON symbols(file_id);
                CREATE TABLE code_relationships (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
                    source_symbol_id INTEGER REFERENCES symbols(id) ON DELETE CASCADE,
                    source_symbol TEXT NOT NULL,
                    target_qualified_name TEXT NOT NULL,
                    relationship_type TEXT NOT NULL,
                    source_line INTEGER NOT NULL,
                    target_file TEXT
                );
                CREATE INDEX idx_relationships_file ON code_relationships(file_id);
                CREATE INDEX idx_relationships_target ON code_relationships(target_qualified_name);
                CREATE TABLE subdirs (
                    name TEXT PRIMARY KEY,
                    index_path TEXT NOT NULL,
                    files_count INTEGER NOT NULL DEFAULT 0,
                    direct_files INTEGER NOT NULL DEFAULT 0
                );
                CREATE TABLE meta (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );",
            )?;
            Ok("Initial schema: files, symbols, relationships, subdirs")
        }
        2 => {
            // Dual FTS tables over the same content: word-boundary tokens
            // for exact identifier matching, character trigrams for
            // typo-tolerant matching. Rowids track files.id.
            conn.execute_batch(
                "CREATE VIRTUAL TABLE files_fts_exact USING fts5(
                    path UNINDEXED,
                    name,
                    content,
                    tokenize = \"unicode61 tokenchars '_'\"
                );
                CREATE VIRTUAL TABLE files_fts_fuzzy USING fts5(
                    path UNINDEXED,
                    name,
                    content,
                    tokenize = 'trigram'
                );",
            )?;
            Ok("Add exact and fuzzy FTS tables")
        }
        3 => {
            conn.execute_batch(
                "CREATE TABLE semantic_metadata (
                    file_id INTEGER PRIMARY KEY REFERENCES files(id) ON DELETE CASCADE,
                    summary TEXT NOT NULL DEFAULT '',
                    purpose TEXT NOT NULL DEFAULT '',
                    keywords TEXT NOT NULL DEFAULT '[]',
                    llm_tool TEXT NOT NULL DEFAULT '',
                    generated_at TEXT NOT NULL DEFAULT ''
                );
                CREATE TABLE keywords (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    keyword TEXT NOT NULL UNIQUE
                );
                CREATE TABLE file_keywords (
                    file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
                    keyword_id INTEGER NOT NULL REFERENCES keywords(id) ON DELETE CASCADE,
                    PRIMARY KEY (file_id, keyword_id)
                );",
            )?;
            Ok("Add semantic metadata and normalized keywords")
        }
        4 => {
            conn.execute_batch(
                "CREATE TABLE graph_neighbors (
                    source_symbol_id INTEGER NOT NULL,
                    neighbor_symbol_id INTEGER NOT NULL,
                    relationship_depth INTEGER NOT NULL CHECK (relationship_depth IN (1, 2))
                );
                CREATE INDEX idx_graph_neighbors_source
                    ON graph_neighbors(source_symbol_id);",
            )?;
            Ok("Add precomputed graph neighbors")
        }
        5 => {
            // Legacy per-directory semantic chunks; the centralized vector
            // store supersedes these, but cascade stage 1 still reads them
            // as a fallback.
            conn.execute_batch(
                "CREATE TABLE semantic_chunks (
                    id INTEGER PRIMARY KEY,
                    file_path TEXT NOT NULL,
                    content TEXT NOT NULL,
                    metadata TEXT,
                    category TEXT NOT NULL DEFAULT 'code'
                );",
            )?;
            Ok("Add legacy semantic chunk table")
        }
        other => Err(CodexLensError::storage(format!(
            "unknown index schema version: {other}"
        ))),
    }
}
