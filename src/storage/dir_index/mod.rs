// Per-directory index store
//
// Each indexed directory owns exactly one `_index.db` holding its files,
// symbols, relationships, dual FTS tables, normalized keywords, subdir
// links, and precomputed graph neighbors. One SQLite connection per store,
// serialized behind a mutex; concurrent writers queue on the lock.

mod files;
mod graph;
mod keywords;
mod schema;
mod search;

use crate::errors::Result;
use crate::types::SubdirLink;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub use graph::NeighborSymbol;
pub use search::LegacyChunk;

pub struct DirIndexStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    content_hash_enabled: bool,
}

impl DirIndexStore {
    /// Open (or create) the index database for one directory and bring its
    /// schema up to date.
    pub fn open(db_path: &Path) -> Result<Self> {
        Self::open_with_options(db_path, true)
    }

    pub fn open_with_options(db_path: &Path, content_hash_enabled: bool) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_millis(250))?;

        let store = Self {
            conn: Mutex::new(conn),
            db_path: db_path.to_path_buf(),
            content_hash_enabled,
        };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Directory this index lives in.
    pub fn index_dir(&self) -> &Path {
        self.db_path.parent().unwrap_or(Path::new(""))
    }

    // === Subdirectory links ===

    /// Link a child directory index into this store. Idempotent by name.
    pub fn register_subdir(
        &self,
        name: &str,
        index_path: &Path,
        files_count: u64,
        direct_files: u64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO subdirs (name, index_path, files_count, direct_files)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET
                 index_path = excluded.index_path,
                 files_count = excluded.files_count,
                 direct_files = excluded.direct_files",
            params![
                name,
                index_path.to_string_lossy(),
                files_count as i64,
                direct_files as i64
            ],
        )?;
        Ok(())
    }

    pub fn get_subdirs(&self) -> Result<Vec<SubdirLink>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT name, index_path, files_count, direct_files FROM subdirs ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(SubdirLink {
                name: row.get(0)?,
                index_path: PathBuf::from(row.get::<_, String>(1)?),
                files_count: row.get::<_, i64>(2)? as u64,
                direct_files: row.get::<_, i64>(3)? as u64,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    // === Merkle root ===

    /// Recompute the directory-level content hash: blake3 over every file's
    /// content hash (ordered by path) plus the sorted subdir names and
    /// their recorded hashes.
    pub fn update_merkle_root(&self) -> Result<String> {
        let conn = self.conn.lock().unwrap();

        let mut hasher = blake3::Hasher::new();

        let mut stmt =
            conn.prepare("SELECT full_path, content_hash FROM files ORDER BY full_path")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?;
        for row in rows {
            let (path, hash) = row?;
            hasher.update(path.as_bytes());
            hasher.update(hash.unwrap_or_default().as_bytes());
        }

        let mut stmt = conn.prepare("SELECT name, index_path FROM subdirs ORDER BY name")?;
        let subdirs = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in subdirs {
            let (name, index_path) = row?;
            hasher.update(name.as_bytes());
            // Child hashes are read from the child's own meta table; missing
            // children contribute only their name.
            if let Some(child_hash) = read_child_merkle(Path::new(&index_path)) {
                hasher.update(child_hash.as_bytes());
            }
        }

        let root = hasher.finalize().to_hex().to_string();
        conn.execute(
            "INSERT INTO meta (key, value) VALUES ('merkle_root', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![root],
        )?;
        Ok(root)
    }

    pub fn merkle_root(&self) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let value = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'merkle_root'",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }
}

fn read_child_merkle(index_path: &Path) -> Option<String> {
    let conn = Connection::open_with_flags(
        index_path,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
    )
    .ok()?;
    conn.query_row(
        "SELECT value FROM meta WHERE key = 'merkle_root'",
        [],
        |row| row.get::<_, String>(0),
    )
    .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn scratch_store() -> (TempDir, DirIndexStore) {
        let dir = TempDir::new().unwrap();
        let store = DirIndexStore::open(&dir.path().join("_index.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn register_subdir_is_idempotent() {
        let (_dir, store) = scratch_store();
        store
            .register_subdir("api", Path::new("/idx/api/_index.db"), 3, 3)
            .unwrap();
        store
            .register_subdir("api", Path::new("/idx/api/_index.db"), 5, 5)
            .unwrap();

        let subdirs = store.get_subdirs().unwrap();
        assert_eq!(subdirs.len(), 1);
        assert_eq!(subdirs[0].files_count, 5);
    }

    #[test]
    fn merkle_root_is_stable_for_unchanged_content() {
        let (_dir, store) = scratch_store();
        store
            .add_file(
                "a.py",
                Path::new("/src/a.py"),
                "def a(): pass\n",
                "python",
                &[],
                &[],
            )
            .unwrap();

        let first = store.update_merkle_root().unwrap();
        let second = store.update_merkle_root().unwrap();
        assert_eq!(first, second);
        assert_eq!(store.merkle_root().unwrap(), Some(first));
    }

    #[test]
    fn merkle_root_changes_when_a_file_changes() {
        let (_dir, store) = scratch_store();
        store
            .add_file("a.py", Path::new("/src/a.py"), "x = 1\n", "python", &[], &[])
            .unwrap();
        let before = store.update_merkle_root().unwrap();

        store
            .add_file("a.py", Path::new("/src/a.py"), "x = 2\n", "python", &[], &[])
            .unwrap();
        let after = store.update_merkle_root().unwrap();
        assert_ne!(before, after);
    }
}
