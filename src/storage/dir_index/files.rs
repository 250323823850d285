// File row lifecycle: add, remove, freshness checks, cleanup

use super::DirIndexStore;
use crate::errors::{Result, retry_transient};
use crate::types::{CodeRelationship, FileEntry, Symbol};
use rusqlite::{OptionalExtension, params};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

pub fn content_hash(content: &str) -> String {
    blake3::hash(content.as_bytes()).to_hex().to_string()
}

impl DirIndexStore {
    /// Upsert a file row: replaces its symbols and relationships, refreshes
    /// both FTS tables, and records `(mtime, size, content_hash)` for
    /// incremental freshness checks.
    ///
    /// Transient "database busy/locked" errors retry up to three times with
    /// exponential backoff; other errors are fatal to this file only.
    pub fn add_file(
        &self,
        name: &str,
        full_path: &Path,
        content: &str,
        language: &str,
        symbols: &[Symbol],
        relationships: &[CodeRelationship],
    ) -> Result<i64> {
        retry_transient(|| self.add_file_once(name, full_path, content, language, symbols, relationships))
    }

    fn add_file_once(
        &self,
        name: &str,
        full_path: &Path,
        content: &str,
        language: &str,
        symbols: &[Symbol],
        relationships: &[CodeRelationship],
    ) -> Result<i64> {
        let (mtime_ms, size) = match std::fs::metadata(full_path) {
            Ok(metadata) => {
                let mtime = metadata
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as i64)
                    .unwrap_or(0);
                (mtime, metadata.len())
            }
            // Content handed to us directly (e.g. tests) may not exist on disk.
            Err(_) => (0, content.len() as u64),
        };
        let line_count = content.lines().count() as u32;
        let hash = content_hash(content);
        let path_str = full_path.to_string_lossy();

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO files (name, full_path, language, content, mtime_ms, size, line_count, content_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(full_path) DO UPDATE SET
                 name = excluded.name,
                 language = excluded.language,
                 content = excluded.content,
                 mtime_ms = excluded.mtime_ms,
                 size = excluded.size,
                 line_count = excluded.line_count,
                 content_hash = excluded.content_hash",
            params![
                name,
                path_str,
                language,
                content,
                mtime_ms,
                size as i64,
                line_count,
                hash
            ],
        )?;

        let file_id: i64 = tx.query_row(
            "SELECT id FROM files WHERE full_path = ?1",
            params![path_str],
            |row| row.get(0),
        )?;

        // Replace symbols; cascades clear stale relationships rows too.
        tx.execute("DELETE FROM symbols WHERE file_id = ?1", params![file_id])?;
        tx.execute(
            "DELETE FROM code_relationships WHERE file_id = ?1",
            params![file_id],
        )?;

        let mut symbol_ids: HashMap<&str, i64> = HashMap::new();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO symbols (file_id, name, kind, start_line, end_line)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for symbol in symbols {
                stmt.execute(params![
                    file_id,
                    symbol.name,
                    symbol.kind.as_str(),
                    symbol.range.0,
                    symbol.range.1
                ])?;
                symbol_ids
                    .entry(symbol.name.as_str())
                    .or_insert(tx.last_insert_rowid());
            }
        }

        {
            let mut stmt = tx.prepare(
                "INSERT INTO code_relationships
                     (file_id, source_symbol_id, source_symbol, target_qualified_name,
                      relationship_type, source_line, target_file)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for rel in relationships {
                let source_id = symbol_ids.get(rel.source_symbol.as_str()).copied();
                stmt.execute(params![
                    file_id,
                    source_id,
                    rel.source_symbol,
                    rel.target_symbol,
                    rel.kind.as_str(),
                    rel.source_line,
                    rel.target_file
                ])?;
            }
        }

        // Refresh both FTS tables, keyed by file rowid.
        tx.execute("DELETE FROM files_fts_exact WHERE rowid = ?1", params![file_id])?;
        tx.execute("DELETE FROM files_fts_fuzzy WHERE rowid = ?1", params![file_id])?;
        tx.execute(
            "INSERT INTO files_fts_exact (rowid, path, name, content) VALUES (?1, ?2, ?3, ?4)",
            params![file_id, path_str, name, content],
        )?;
        tx.execute(
            "INSERT INTO files_fts_fuzzy (rowid, path, name, content) VALUES (?1, ?2, ?3, ?4)",
            params![file_id, path_str, name, content],
        )?;

        tx.commit()?;
        debug!("Indexed {} ({} symbols)", path_str, symbols.len());
        Ok(file_id)
    }

    /// Delete a file row; symbols, relationships, keywords, and FTS rows go
    /// with it.
    pub fn remove_file(&self, full_path: &Path) -> Result<bool> {
        retry_transient(|| {
            let mut conn = self.conn.lock().unwrap();
            let tx = conn.transaction()?;

            let file_id: Option<i64> = tx
                .query_row(
                    "SELECT id FROM files WHERE full_path = ?1",
                    params![full_path.to_string_lossy()],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(file_id) = file_id else {
                tx.commit()?;
                return Ok(false);
            };

            tx.execute("DELETE FROM files WHERE id = ?1", params![file_id])?;
            tx.execute("DELETE FROM files_fts_exact WHERE rowid = ?1", params![file_id])?;
            tx.execute("DELETE FROM files_fts_fuzzy WHERE rowid = ?1", params![file_id])?;
            tx.execute(
                "DELETE FROM graph_neighbors WHERE source_symbol_id NOT IN (SELECT id FROM symbols)
                     OR neighbor_symbol_id NOT IN (SELECT id FROM symbols)",
                [],
            )?;

            tx.commit()?;
            Ok(true)
        })
    }

    /// `false` iff the stored `(mtime, size)` match the file on disk and,
    /// when hashing is enabled, its content hash matches too.
    pub fn needs_reindex(&self, full_path: &Path) -> Result<bool> {
        let row = {
            let conn = self.conn.lock().unwrap();
            conn.query_row(
                "SELECT mtime_ms, size, content_hash FROM files WHERE full_path = ?1",
                params![full_path.to_string_lossy()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)? as u64,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?
        };

        let Some((stored_mtime, stored_size, stored_hash)) = row else {
            return Ok(true);
        };

        let Ok(metadata) = std::fs::metadata(full_path) else {
            return Ok(true);
        };

        let disk_mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        if disk_mtime != stored_mtime || metadata.len() != stored_size {
            return Ok(true);
        }

        if self.content_hash_enabled {
            if let Some(stored_hash) = stored_hash {
                let content = std::fs::read_to_string(full_path).unwrap_or_default();
                if content_hash(&content) != stored_hash {
                    return Ok(true);
                }
            }
        }

        Ok(false)
    }

    /// Drop every file row whose path no longer exists on disk under
    /// `source_path`. Returns the number of files removed.
    pub fn cleanup_deleted_files(&self, source_path: &Path) -> Result<usize> {
        let paths: Vec<String> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare("SELECT full_path FROM files")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut removed = 0;
        for path in paths {
            let candidate = PathBuf::from(&path);
            if candidate.starts_with(source_path) && !candidate.exists() {
                if self.remove_file(&candidate)? {
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            debug!("Removed {removed} deleted files from {}", self.db_path.display());
        }
        Ok(removed)
    }

    pub fn get_file(&self, full_path: &Path) -> Result<Option<FileEntry>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, name, full_path, language, mtime_ms, size, line_count, content_hash
                 FROM files WHERE full_path = ?1",
                params![full_path.to_string_lossy()],
                file_entry_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_file_content(&self, full_path: &Path) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let content = conn
            .query_row(
                "SELECT content FROM files WHERE full_path = ?1",
                params![full_path.to_string_lossy()],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(content)
    }

    pub fn file_count(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn list_files(&self) -> Result<Vec<FileEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, full_path, language, mtime_ms, size, line_count, content_hash
             FROM files ORDER BY full_path",
        )?;
        let rows = stmt.query_map([], file_entry_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

fn file_entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileEntry> {
    Ok(FileEntry {
        id: row.get(0)?,
        name: row.get(1)?,
        full_path: PathBuf::from(row.get::<_, String>(2)?),
        language: row.get(3)?,
        mtime_ms: row.get(4)?,
        size: row.get::<_, i64>(5)? as u64,
        line_count: row.get(6)?,
        content_hash: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RelationshipKind, SymbolKind};
    use tempfile::TempDir;

    fn store_with_file(content: &str) -> (TempDir, DirIndexStore, PathBuf) {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("demo.py");
        std::fs::write(&source, content).unwrap();

        let store = DirIndexStore::open(&dir.path().join("_index.db")).unwrap();
        let symbols = vec![Symbol::new("demo", SymbolKind::Function, (1, 2))];
        let relationships = vec![CodeRelationship {
            source_symbol: "demo".into(),
            target_symbol: "os.path.join".into(),
            kind: RelationshipKind::Call,
            source_file: source.to_string_lossy().into(),
            target_file: None,
            source_line: 2,
        }];
        store
            .add_file("demo.py", &source, content, "python", &symbols, &relationships)
            .unwrap();
        (dir, store, source)
    }

    #[test]
    fn add_then_remove_leaves_no_rows() {
        let (_dir, store, source) = store_with_file("def demo():\n    return os.path.join('a')\n");

        assert!(store.remove_file(&source).unwrap());

        let conn = store.conn.lock().unwrap();
        for table in [
            "files",
            "symbols",
            "code_relationships",
            "files_fts_exact",
            "files_fts_fuzzy",
            "file_keywords",
        ] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .unwrap();
            assert_eq!(count, 0, "expected no rows left in {table}");
        }
    }

    #[test]
    fn needs_reindex_tracks_disk_state() {
        let (_dir, store, source) = store_with_file("def demo():\n    pass\n");

        assert!(!store.needs_reindex(&source).unwrap());

        // Rewriting with different content must flip the answer even if
        // mtime granularity hides the change.
        std::fs::write(&source, "def demo():\n    return 1\n").unwrap();
        assert!(store.needs_reindex(&source).unwrap());

        // Unknown files always need indexing.
        assert!(store.needs_reindex(Path::new("/nowhere/missing.py")).unwrap());
    }

    #[test]
    fn add_file_is_an_upsert_by_path() {
        let (_dir, store, source) = store_with_file("a = 1\n");
        store
            .add_file("demo.py", &source, "a = 2\n", "python", &[], &[])
            .unwrap();

        assert_eq!(store.file_count().unwrap(), 1);
        let entry = store.get_file(&source).unwrap().unwrap();
        assert_eq!(entry.line_count, 1);
        assert_eq!(
            store.get_file_content(&source).unwrap().as_deref(),
            Some("a = 2\n")
        );
    }

    #[test]
    fn cleanup_removes_only_missing_files() {
        let (dir, store, source) = store_with_file("x = 1\n");
        let survivor = dir.path().join("keep.py");
        std::fs::write(&survivor, "y = 2\n").unwrap();
        store
            .add_file("keep.py", &survivor, "y = 2\n", "python", &[], &[])
            .unwrap();

        std::fs::remove_file(&source).unwrap();
        let removed = store.cleanup_deleted_files(dir.path()).unwrap();

        assert_eq!(removed, 1);
        assert!(store.get_file(&survivor).unwrap().is_some());
        assert!(store.get_file(&source).unwrap().is_none());
    }
}
