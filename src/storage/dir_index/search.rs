// FTS and symbol queries over a single directory index

use super::DirIndexStore;
use crate::errors::Result;
use crate::types::{SearchResult, Symbol, SymbolKind};
use rusqlite::params;
use tracing::debug;

/// Quote each whitespace token so identifiers with FTS5 operator
/// characters stay literal. Tokens are AND-joined (FTS5 default).
fn fts_match_expression(query: &str) -> String {
    query
        .split_whitespace()
        .map(|token| format!("\"{}\"", token.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

impl DirIndexStore {
    /// Exact-identifier FTS over file content. Scores are engine-defined
    /// (negated bm25 rank) and monotonic in quality within one call.
    pub fn search_fts_exact(
        &self,
        query: &str,
        limit: usize,
        return_full_content: bool,
    ) -> Result<Vec<SearchResult>> {
        self.search_fts_table("files_fts_exact", query, limit, return_full_content)
    }

    /// Trigram FTS over the same content, tolerant of partial identifiers
    /// and typos. Queries shorter than three characters cannot match.
    pub fn search_fts_fuzzy(
        &self,
        query: &str,
        limit: usize,
        return_full_content: bool,
    ) -> Result<Vec<SearchResult>> {
        if query.chars().count() < 3 {
            return Ok(Vec::new());
        }
        self.search_fts_table("files_fts_fuzzy", query, limit, return_full_content)
    }

    fn search_fts_table(
        &self,
        table: &str,
        query: &str,
        limit: usize,
        return_full_content: bool,
    ) -> Result<Vec<SearchResult>> {
        let match_expr = fts_match_expression(query);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT path, snippet({table}, 2, '', '', ' … ', 12), rank, rowid
             FROM {table}
             WHERE {table} MATCH ?1
             ORDER BY rank
             LIMIT ?2"
        );

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![match_expr, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut results = Vec::new();
        for row in rows {
            let (path, excerpt, rank, rowid) = row?;
            // bm25 rank is negative: better matches are more negative.
            let mut result = SearchResult::new(path, -rank as f32, excerpt);
            if return_full_content {
                result.content = conn
                    .query_row(
                        "SELECT content FROM files WHERE id = ?1",
                        params![rowid],
                        |r| r.get::<_, String>(0),
                    )
                    .ok();
            }
            results.push(result);
        }

        debug!("{table} '{query}' -> {} hits", results.len());
        Ok(results)
    }

    /// Fast path used by `files_only` searches: paths without snippets.
    pub fn search_files_only(&self, query: &str, limit: usize) -> Result<Vec<String>> {
        let match_expr = fts_match_expression(query);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT path FROM files_fts_exact
             WHERE files_fts_exact MATCH ?1
             ORDER BY rank LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![match_expr, limit as i64], |row| {
            row.get::<_, String>(0)
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Symbol lookup by name. In prefix mode the pattern is `name%` (can
    /// use the name index); otherwise `%name%`.
    pub fn search_symbols(
        &self,
        name: &str,
        kind: Option<&str>,
        prefix_mode: bool,
        limit: usize,
    ) -> Result<Vec<Symbol>> {
        let pattern = if prefix_mode {
            format!("{name}%")
        } else {
            format!("%{name}%")
        };

        let conn = self.conn.lock().unwrap();
        let mut sql = String::from(
            "SELECT s.name, s.kind, s.start_line, s.end_line, f.full_path
             FROM symbols s JOIN files f ON f.id = s.file_id
             WHERE s.name LIKE ?1",
        );
        if kind.is_some() {
            sql.push_str(" AND s.kind = ?3");
        }
        sql.push_str(" ORDER BY s.name LIMIT ?2");

        let mut stmt = conn.prepare(&sql)?;
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<Symbol> {
            let kind_str: String = row.get(1)?;
            Ok(Symbol {
                name: row.get(0)?,
                kind: SymbolKind::parse(&kind_str).unwrap_or(SymbolKind::Variable),
                range: (row.get(2)?, row.get(3)?),
                file: Some(row.get(4)?),
            })
        };

        let rows = match kind {
            Some(kind) => stmt.query_map(params![pattern, limit as i64, kind], map_row)?,
            None => stmt.query_map(params![pattern, limit as i64], map_row)?,
        };
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// References to `symbol_name` recorded in `code_relationships`:
    /// rows whose target matches exactly or as the leaf of a qualified
    /// name. Returns `(source_file, line, relationship_type, content)`.
    pub fn search_references(
        &self,
        symbol_name: &str,
        limit: usize,
    ) -> Result<Vec<(String, u32, String, String)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT f.full_path, cr.source_line, cr.relationship_type, f.content
             FROM code_relationships cr
             JOIN files f ON f.id = cr.file_id
             WHERE cr.target_qualified_name = ?1
                OR cr.target_qualified_name LIKE ?2
             ORDER BY f.full_path, cr.source_line
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![symbol_name, format!("%.{symbol_name}"), limit as i64],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Legacy chunk retrieval for cascade stage-1 fallbacks.
    pub fn get_chunks_by_ids(&self, chunk_ids: &[i64]) -> Result<Vec<LegacyChunk>> {
        if chunk_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; chunk_ids.len()].join(",");
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT id, file_path, content, metadata, category
             FROM semantic_chunks WHERE id IN ({placeholders})"
        ))?;

        let rows = stmt.query_map(rusqlite::params_from_iter(chunk_ids.iter()), |row| {
            Ok(LegacyChunk {
                id: row.get(0)?,
                file_path: row.get(1)?,
                content: row.get(2)?,
                metadata: row.get(3)?,
                category: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Insert a legacy chunk row (test and migration tooling).
    pub fn put_chunk(
        &self,
        id: i64,
        file_path: &str,
        content: &str,
        metadata: Option<&str>,
        category: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO semantic_chunks (id, file_path, content, metadata, category)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, file_path, content, metadata, category],
        )?;
        Ok(())
    }
}

/// Row shape of the legacy `semantic_chunks` table.
#[derive(Debug, Clone)]
pub struct LegacyChunk {
    pub id: i64,
    pub file_path: String,
    pub content: String,
    pub metadata: Option<String>,
    pub category: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn indexed_store() -> (TempDir, DirIndexStore) {
        let dir = TempDir::new().unwrap();
        let store = DirIndexStore::open(&dir.path().join("_index.db")).unwrap();

        store
            .add_file(
                "auth.py",
                Path::new("/src/auth.py"),
                "def authenticate(user):\n    return check_token(user)\n",
                "python",
                &[
                    Symbol::new("authenticate", SymbolKind::Function, (1, 2)),
                    Symbol::new("auth_helper", SymbolKind::Function, (4, 5)),
                ],
                &[],
            )
            .unwrap();
        store
            .add_file(
                "db.py",
                Path::new("/src/db.py"),
                "def connect():\n    return engine\n",
                "python",
                &[Symbol::new("connect", SymbolKind::Function, (1, 2))],
                &[],
            )
            .unwrap();

        (dir, store)
    }

    #[test]
    fn exact_fts_matches_whole_identifiers() {
        let (_dir, store) = indexed_store();

        let hits = store.search_fts_exact("authenticate", 10, false).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].path.ends_with("auth.py"));

        // Word-boundary tokenizer: a fragment of an identifier is no match.
        let hits = store.search_fts_exact("authentic", 10, false).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn fuzzy_fts_matches_identifier_fragments() {
        let (_dir, store) = indexed_store();

        let hits = store.search_fts_fuzzy("authentic", 10, false).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].path.ends_with("auth.py"));

        // Below the trigram threshold nothing can match.
        assert!(store.search_fts_fuzzy("au", 10, false).unwrap().is_empty());
    }

    #[test]
    fn full_content_is_returned_on_request() {
        let (_dir, store) = indexed_store();
        let hits = store.search_fts_exact("connect", 10, true).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.as_deref().unwrap().contains("engine"));
    }

    #[test]
    fn prefix_symbol_search_is_a_subset_of_substring_search() {
        let (_dir, store) = indexed_store();

        let prefix = store.search_symbols("auth", None, true, 50).unwrap();
        let substring = store.search_symbols("auth", None, false, 50).unwrap();

        assert!(!prefix.is_empty());
        for sym in &prefix {
            assert!(sym.name.starts_with("auth"));
            assert!(substring.iter().any(|s| s.name == sym.name));
        }
        // "authenticate" and "auth_helper" both match either way here, but
        // substring search can only ever widen the set.
        assert!(substring.len() >= prefix.len());
    }

    #[test]
    fn symbol_kind_filter_applies() {
        let (_dir, store) = indexed_store();
        let hits = store
            .search_symbols("auth", Some("class"), false, 50)
            .unwrap();
        assert!(hits.is_empty());
    }
}
