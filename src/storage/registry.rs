// Global project and directory registry
//
// One shared SQLite database keyed by absolute source paths. Readers and
// writers may interleave; all statements run on a single connection
// serialized behind a mutex.

use crate::errors::Result;
use crate::paths::PathMapper;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

const SCHEMA_VERSION: i32 = 1;

/// A registered project.
#[derive(Debug, Clone)]
pub struct ProjectInfo {
    pub id: i64,
    pub source_root: PathBuf,
    pub index_root: PathBuf,
    pub total_files: u64,
    pub total_dirs: u64,
    pub status: String,
    pub created_at: i64,
    pub last_indexed: Option<i64>,
}

/// A registered directory inside a project.
#[derive(Debug, Clone)]
pub struct DirMapping {
    pub project_id: i64,
    pub source_path: PathBuf,
    pub index_path: PathBuf,
    pub depth: u32,
    pub files_count: u64,
}

pub struct RegistryStore {
    conn: Mutex<Connection>,
}

impl RegistryStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    /// In-memory registry, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS projects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_root TEXT NOT NULL UNIQUE,
                index_root TEXT NOT NULL,
                total_files INTEGER NOT NULL DEFAULT 0,
                total_dirs INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'created',
                created_at INTEGER NOT NULL,
                last_indexed INTEGER
            );
            CREATE TABLE IF NOT EXISTS dir_mappings (
                project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                source_path TEXT NOT NULL UNIQUE,
                index_path TEXT NOT NULL,
                depth INTEGER NOT NULL,
                files_count INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_dir_mappings_project
                ON dir_mappings(project_id);",
        )?;

        let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version < SCHEMA_VERSION {
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }

        Ok(())
    }

    /// Upsert a project, assigning a stable integer id on first sight.
    pub fn register_project(&self, source_root: &Path, index_root: &Path) -> Result<ProjectInfo> {
        let source_root = PathMapper::normalize(source_root);
        let now = chrono::Utc::now().timestamp();

        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO projects (source_root, index_root, created_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(source_root) DO UPDATE SET index_root = excluded.index_root",
                params![
                    source_root.to_string_lossy(),
                    index_root.to_string_lossy(),
                    now
                ],
            )?;
        }

        let project = self
            .get_project(&source_root)?
            .expect("project row just upserted");
        debug!(
            "Registered project {} -> {}",
            project.source_root.display(),
            project.index_root.display()
        );
        Ok(project)
    }

    pub fn get_project(&self, source_root: &Path) -> Result<Option<ProjectInfo>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, source_root, index_root, total_files, total_dirs,
                        status, created_at, last_indexed
                 FROM projects WHERE source_root = ?1",
                params![source_root.to_string_lossy()],
                Self::project_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_projects(&self) -> Result<Vec<ProjectInfo>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, source_root, index_root, total_files, total_dirs,
                    status, created_at, last_indexed
             FROM projects ORDER BY source_root",
        )?;
        let rows = stmt.query_map([], Self::project_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    fn project_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProjectInfo> {
        Ok(ProjectInfo {
            id: row.get(0)?,
            source_root: PathBuf::from(row.get::<_, String>(1)?),
            index_root: PathBuf::from(row.get::<_, String>(2)?),
            total_files: row.get::<_, i64>(3)? as u64,
            total_dirs: row.get::<_, i64>(4)? as u64,
            status: row.get(5)?,
            created_at: row.get(6)?,
            last_indexed: row.get(7)?,
        })
    }

    /// Idempotent directory registration.
    pub fn register_dir(
        &self,
        project_id: i64,
        source_path: &Path,
        index_path: &Path,
        depth: u32,
        files_count: u64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO dir_mappings (project_id, source_path, index_path, depth, files_count)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(source_path) DO UPDATE SET
                 index_path = excluded.index_path,
                 depth = excluded.depth,
                 files_count = excluded.files_count",
            params![
                project_id,
                source_path.to_string_lossy(),
                index_path.to_string_lossy(),
                depth,
                files_count as i64,
            ],
        )?;
        Ok(())
    }

    /// Deepest registered mapping whose source path is an ancestor of (or
    /// equal to) `path`. Walks the ancestor chain with one keyed lookup
    /// per level, so cost is O(depth), not O(mappings).
    pub fn find_nearest_index(&self, path: &Path) -> Result<Option<DirMapping>> {
        let path = PathMapper::normalize(path);
        let conn = self.conn.lock().unwrap();

        let mut current = Some(path.as_path());
        while let Some(candidate) = current {
            let row = conn
                .query_row(
                    "SELECT project_id, source_path, index_path, depth, files_count
                     FROM dir_mappings WHERE source_path = ?1",
                    params![candidate.to_string_lossy()],
                    Self::mapping_from_row,
                )
                .optional()?;
            if let Some(mapping) = row {
                return Ok(Some(mapping));
            }
            current = candidate.parent();
        }

        Ok(None)
    }

    pub fn list_mappings(&self, project_id: i64) -> Result<Vec<DirMapping>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT project_id, source_path, index_path, depth, files_count
             FROM dir_mappings WHERE project_id = ?1 ORDER BY depth, source_path",
        )?;
        let rows = stmt.query_map(params![project_id], Self::mapping_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    fn mapping_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DirMapping> {
        Ok(DirMapping {
            project_id: row.get(0)?,
            source_path: PathBuf::from(row.get::<_, String>(1)?),
            index_path: PathBuf::from(row.get::<_, String>(2)?),
            depth: row.get(3)?,
            files_count: row.get::<_, i64>(4)? as u64,
        })
    }

    pub fn update_project_stats(
        &self,
        source_root: &Path,
        total_files: u64,
        total_dirs: u64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE projects
             SET total_files = ?2, total_dirs = ?3, status = 'indexed', last_indexed = ?4
             WHERE source_root = ?1",
            params![
                source_root.to_string_lossy(),
                total_files as i64,
                total_dirs as i64,
                chrono::Utc::now().timestamp(),
            ],
        )?;
        Ok(())
    }

    /// Remove a project and all of its directory mappings.
    pub fn unregister_project(&self, source_root: &Path) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM projects WHERE source_root = ?1",
            params![source_root.to_string_lossy()],
        )?;
        Ok(removed > 0)
    }

    /// Rewrite index paths after an index-root migration.
    pub fn update_index_paths(&self, old_prefix: &Path, new_prefix: &Path) -> Result<usize> {
        let old_prefix = old_prefix.to_string_lossy().to_string();
        let new_prefix = new_prefix.to_string_lossy().to_string();

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE projects
             SET index_root = ?2 || substr(index_root, length(?1) + 1)
             WHERE index_root LIKE ?1 || '%'",
            params![old_prefix, new_prefix],
        )?;
        let updated = conn.execute(
            "UPDATE dir_mappings
             SET index_path = ?2 || substr(index_path, length(?1) + 1)
             WHERE index_path LIKE ?1 || '%'",
            params![old_prefix, new_prefix],
        )?;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_project() -> (RegistryStore, ProjectInfo) {
        let registry = RegistryStore::open_in_memory().unwrap();
        let project = registry
            .register_project(Path::new("/proj"), Path::new("/idx/proj"))
            .unwrap();
        (registry, project)
    }

    #[test]
    fn register_project_is_an_upsert_with_stable_id() {
        let (registry, project) = registry_with_project();
        let again = registry
            .register_project(Path::new("/proj"), Path::new("/idx2/proj"))
            .unwrap();
        assert_eq!(project.id, again.id);
        assert_eq!(again.index_root, PathBuf::from("/idx2/proj"));
    }

    #[test]
    fn find_nearest_index_prefers_the_deepest_ancestor() {
        let (registry, project) = registry_with_project();
        registry
            .register_dir(project.id, Path::new("/proj"), Path::new("/idx/proj/_index.db"), 0, 1)
            .unwrap();
        registry
            .register_dir(
                project.id,
                Path::new("/proj/src"),
                Path::new("/idx/proj/src/_index.db"),
                1,
                3,
            )
            .unwrap();

        let nearest = registry
            .find_nearest_index(Path::new("/proj/src/deep/nested"))
            .unwrap()
            .unwrap();
        assert_eq!(nearest.source_path, PathBuf::from("/proj/src"));

        let root = registry
            .find_nearest_index(Path::new("/proj/other"))
            .unwrap()
            .unwrap();
        assert_eq!(root.source_path, PathBuf::from("/proj"));

        assert!(registry.find_nearest_index(Path::new("/elsewhere")).unwrap().is_none());
    }

    #[test]
    fn unregister_cascades_mappings() {
        let (registry, project) = registry_with_project();
        registry
            .register_dir(project.id, Path::new("/proj"), Path::new("/idx/proj/_index.db"), 0, 1)
            .unwrap();

        assert!(registry.unregister_project(Path::new("/proj")).unwrap());
        assert!(registry.find_nearest_index(Path::new("/proj/sub")).unwrap().is_none());
    }

    #[test]
    fn update_index_paths_rewrites_prefixes() {
        let (registry, project) = registry_with_project();
        registry
            .register_dir(project.id, Path::new("/proj"), Path::new("/idx/proj/_index.db"), 0, 1)
            .unwrap();

        let updated = registry
            .update_index_paths(Path::new("/idx"), Path::new("/moved"))
            .unwrap();
        assert_eq!(updated, 1);

        let mapping = registry.find_nearest_index(Path::new("/proj")).unwrap().unwrap();
        assert!(mapping.index_path.starts_with("/moved"));
    }
}
