// Project-wide symbol and relationship index
//
// One `_global.db` per project index root. Answers symbol queries without
// traversing every per-directory store, and backs the static-graph mode of
// cascade stage 2. Relationships here are keyed by source file and are NOT
// cascaded by per-directory file deletion; the incremental indexer keeps
// them in sync explicitly.

use crate::errors::Result;
use crate::types::{CodeRelationship, Symbol, SymbolKind};
use rusqlite::{Connection, params};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

pub const GLOBAL_DB_NAME: &str = "_global.db";

pub struct GlobalSymbolIndex {
    conn: Mutex<Connection>,
    project_id: i64,
}

impl GlobalSymbolIndex {
    pub fn open(db_path: &Path, project_id: i64) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_millis(250))?;

        let index = Self {
            conn: Mutex::new(conn),
            project_id,
        };
        index.initialize_schema()?;
        Ok(index)
    }

    pub fn default_path(index_root: &Path) -> PathBuf {
        index_root.join(GLOBAL_DB_NAME)
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS symbols (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL,
                file_path TEXT NOT NULL,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                start_line INTEGER NOT NULL,
                end_line INTEGER NOT NULL,
                index_path TEXT NOT NULL DEFAULT ''
            );
            CREATE INDEX IF NOT EXISTS idx_global_symbols_name ON symbols(name);
            CREATE INDEX IF NOT EXISTS idx_global_symbols_file ON symbols(file_path);
            CREATE TABLE IF NOT EXISTS global_relationships (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL,
                source_symbol TEXT NOT NULL,
                target_qualified_name TEXT NOT NULL,
                relationship_type TEXT NOT NULL,
                source_file TEXT NOT NULL,
                target_file TEXT,
                source_line INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_global_rel_source_file
                ON global_relationships(source_file);
            CREATE INDEX IF NOT EXISTS idx_global_rel_target
                ON global_relationships(target_qualified_name);",
        )?;
        Ok(())
    }

    /// Replace all symbols recorded for one source file.
    pub fn update_file_symbols(
        &self,
        file_path: &Path,
        index_path: &Path,
        symbols: &[Symbol],
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute(
            "DELETE FROM symbols WHERE project_id = ?1 AND file_path = ?2",
            params![self.project_id, file_path.to_string_lossy()],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO symbols
                     (project_id, file_path, name, kind, start_line, end_line, index_path)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for symbol in symbols {
                stmt.execute(params![
                    self.project_id,
                    file_path.to_string_lossy(),
                    symbol.name,
                    symbol.kind.as_str(),
                    symbol.range.0,
                    symbol.range.1,
                    index_path.to_string_lossy(),
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    pub fn remove_file_symbols(&self, file_path: &Path) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM symbols WHERE project_id = ?1 AND file_path = ?2",
            params![self.project_id, file_path.to_string_lossy()],
        )?;
        Ok(())
    }

    /// Atomically replace all relationship edges for one source file.
    pub fn update_file_relationships(
        &self,
        file_path: &Path,
        relationships: &[CodeRelationship],
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute(
            "DELETE FROM global_relationships WHERE project_id = ?1 AND source_file = ?2",
            params![self.project_id, file_path.to_string_lossy()],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO global_relationships
                     (project_id, source_symbol, target_qualified_name, relationship_type,
                      source_file, target_file, source_line)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for rel in relationships {
                stmt.execute(params![
                    self.project_id,
                    rel.source_symbol,
                    rel.target_symbol,
                    rel.kind.as_str(),
                    file_path.to_string_lossy(),
                    rel.target_file,
                    rel.source_line,
                ])?;
            }
        }

        tx.commit()?;
        debug!(
            "Replaced {} global relationships for {}",
            relationships.len(),
            file_path.display()
        );
        Ok(())
    }

    pub fn delete_file_relationships(&self, file_path: &Path) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM global_relationships WHERE project_id = ?1 AND source_file = ?2",
            params![self.project_id, file_path.to_string_lossy()],
        )?;
        Ok(())
    }

    /// Project-wide symbol query. `prefix_mode` uses `name%` and the name
    /// index; otherwise the pattern is `%name%`.
    pub fn search(
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
            "SELECT name, kind, start_line, end_line, file_path
             FROM symbols WHERE project_id = ?1 AND name LIKE ?2",
        );
        if kind.is_some() {
            sql.push_str(" AND kind = ?4");
        }
        sql.push_str(" ORDER BY name LIMIT ?3");

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
            Some(kind) => {
                stmt.query_map(params![self.project_id, pattern, limit as i64, kind], map_row)?
            }
            None => stmt.query_map(params![self.project_id, pattern, limit as i64], map_row)?,
        };
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Relationship edges touching a symbol name, used by static-graph
    /// stage-2 expansion. Matches either endpoint.
    pub fn edges_for_symbol(&self, name: &str, limit: usize) -> Result<Vec<GlobalEdge>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT source_symbol, target_qualified_name, relationship_type,
                    source_file, source_line
             FROM global_relationships
             WHERE project_id = ?1
               AND (source_symbol = ?2
                    OR target_qualified_name = ?2
                    OR target_qualified_name LIKE ?3)
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![self.project_id, name, format!("%.{name}"), limit as i64],
            |row| {
                Ok(GlobalEdge {
                    source_symbol: row.get(0)?,
                    target_qualified_name: row.get(1)?,
                    relationship_type: row.get(2)?,
                    source_file: row.get(3)?,
                    source_line: row.get(4)?,
                })
            },
        )?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

/// One edge row from `global_relationships`.
#[derive(Debug, Clone)]
pub struct GlobalEdge {
    pub source_symbol: String,
    pub target_qualified_name: String,
    pub relationship_type: String,
    pub source_file: String,
    pub source_line: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RelationshipKind;
    use tempfile::TempDir;

    fn index_with_symbols() -> (TempDir, GlobalSymbolIndex) {
        let dir = TempDir::new().unwrap();
        let index = GlobalSymbolIndex::open(&dir.path().join(GLOBAL_DB_NAME), 1).unwrap();

        let symbols = vec![
            Symbol::new("Dog", SymbolKind::Class, (1, 10)),
            Symbol::new("DogHouse", SymbolKind::Class, (12, 20)),
        ];
        index
            .update_file_symbols(
                Path::new("/proj/a.py"),
                Path::new("/idx/proj/_index.db"),
                &symbols,
            )
            .unwrap();
        (dir, index)
    }

    #[test]
    fn prefix_search_is_narrower_than_substring() {
        let (_dir, index) = index_with_symbols();

        let prefix = index.search("Dog", None, true, 10).unwrap();
        let substring = index.search("og", None, false, 10).unwrap();

        assert_eq!(prefix.len(), 2);
        assert_eq!(substring.len(), 2);
        assert!(index.search("og", None, true, 10).unwrap().is_empty());
    }

    #[test]
    fn relationship_replacement_is_atomic_per_file() {
        let (_dir, index) = index_with_symbols();
        let file = Path::new("/proj/a.py");

        let edge = CodeRelationship {
            source_symbol: "Dog".into(),
            target_symbol: "Animal".into(),
            kind: RelationshipKind::Inherits,
            source_file: file.to_string_lossy().into(),
            target_file: None,
            source_line: 1,
        };
        index.update_file_relationships(file, &[edge.clone()]).unwrap();
        index.update_file_relationships(file, &[edge]).unwrap();

        let edges = index.edges_for_symbol("Animal", 10).unwrap();
        assert_eq!(edges.len(), 1);

        index.delete_file_relationships(file).unwrap();
        assert!(index.edges_for_symbol("Animal", 10).unwrap().is_empty());
    }
}
