// Centralized vector store
//
// Three co-located artifacts per project index root: the HNSW graph over
// dense embeddings (`_vectors.hnsw.graph` / `_vectors.hnsw.data`), the
// binary sketch mmap (`_binary_vectors.mmap` + meta json), and the chunk
// metadata database (`_vectors_meta.db`). A chunk exists only when all
// three hold it; a failed insert rolls every artifact back.

use super::binary::{BinarySearcher, BinarySketchWriter, pack_sketch};
use super::model_lock::{self, ModelLock};
use crate::errors::{CodexLensError, Result};
use hnsw_rs::prelude::*;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

pub const VECTORS_META_DB_NAME: &str = "_vectors_meta.db";
pub const HNSW_BASENAME: &str = "_vectors";

const HNSW_MAX_LAYERS: usize = 16;
const HNSW_MAX_CONNECTIONS: usize = 32;
const HNSW_EF_CONSTRUCTION: usize = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkCategory {
    Code,
    Doc,
    CoreMemory,
    CliHistory,
    Workflow,
    Entity,
    Pattern,
}

impl ChunkCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Doc => "doc",
            Self::CoreMemory => "core_memory",
            Self::CliHistory => "cli_history",
            Self::Workflow => "workflow",
            Self::Entity => "entity",
            Self::Pattern => "pattern",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "code" => Some(Self::Code),
            "doc" => Some(Self::Doc),
            "core_memory" => Some(Self::CoreMemory),
            "cli_history" => Some(Self::CliHistory),
            "workflow" => Some(Self::Workflow),
            "entity" => Some(Self::Entity),
            "pattern" => Some(Self::Pattern),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChunkMetadata {
    pub chunk_id: i64,
    pub file_path: String,
    pub content: String,
    pub start_line: Option<u32>,
    pub end_line: Option<u32>,
    pub source_index_db: Option<String>,
    pub category: String,
    pub metadata: Option<String>,
}

pub struct VectorStore {
    index_root: PathBuf,
    conn: Mutex<Connection>,
    lock: ModelLock,
    hnsw: Mutex<Option<Hnsw<'static, f32, DistCosine>>>,
    ann_count: Mutex<usize>,
}

impl std::fmt::Debug for VectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorStore")
            .field("index_root", &self.index_root)
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}

impl VectorStore {
    /// Open the store for one project index root under a model lock.
    /// A different active lock without `force` is a `ModelLockConflict`.
    pub fn open(
        index_root: &Path,
        backend: &str,
        model: &str,
        dimension: usize,
        force: bool,
    ) -> Result<Self> {
        std::fs::create_dir_all(index_root)?;
        let conn = Connection::open(index_root.join(VECTORS_META_DB_NAME))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS chunk_metadata (
                chunk_id INTEGER PRIMARY KEY,
                file_path TEXT NOT NULL,
                content TEXT NOT NULL,
                start_line INTEGER,
                end_line INTEGER,
                source_index_db TEXT,
                category TEXT NOT NULL DEFAULT 'code',
                metadata TEXT,
                embedding BLOB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_chunk_file ON chunk_metadata(file_path);
            CREATE TABLE IF NOT EXISTS binary_vectors (
                chunk_id INTEGER PRIMARY KEY REFERENCES chunk_metadata(chunk_id),
                sketch BLOB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS model_lock (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                backend TEXT NOT NULL,
                model TEXT NOT NULL,
                dimension INTEGER NOT NULL,
                locked_at INTEGER NOT NULL
            );",
        )?;

        let persisted: Option<ModelLock> = conn
            .query_row(
                "SELECT backend, model, dimension, locked_at FROM model_lock WHERE id = 1",
                [],
                |row| {
                    Ok(ModelLock {
                        backend: row.get(0)?,
                        model: row.get(1)?,
                        dimension: row.get::<_, i64>(2)? as usize,
                        locked_at: row.get(3)?,
                    })
                },
            )
            .optional()?;

        let lock = model_lock::ensure_lock(index_root, persisted, backend, model, dimension, force)?;
        conn.execute(
            "INSERT OR REPLACE INTO model_lock (id, backend, model, dimension, locked_at)
             VALUES (1, ?1, ?2, ?3, ?4)",
            params![lock.backend, lock.model, lock.dimension as i64, lock.locked_at],
        )?;

        Ok(Self {
            index_root: index_root.to_path_buf(),
            conn: Mutex::new(conn),
            lock,
            hnsw: Mutex::new(None),
            ann_count: Mutex::new(0),
        })
    }

    /// Open an existing store under its persisted model lock. `Ok(None)`
    /// when no metadata database exists at this root.
    pub fn open_existing(index_root: &Path) -> Result<Option<Self>> {
        let meta_path = index_root.join(VECTORS_META_DB_NAME);
        if !meta_path.is_file() {
            return Ok(None);
        }

        let conn = Connection::open(&meta_path)?;
        let persisted: Option<ModelLock> = conn
            .query_row(
                "SELECT backend, model, dimension, locked_at FROM model_lock WHERE id = 1",
                [],
                |row| {
                    Ok(ModelLock {
                        backend: row.get(0)?,
                        model: row.get(1)?,
                        dimension: row.get::<_, i64>(2)? as usize,
                        locked_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        drop(conn);

        let Some(lock) = persisted else {
            return Ok(None);
        };

        Ok(Some(Self::open(
            index_root,
            &lock.backend,
            &lock.model,
            lock.dimension,
            false,
        )?))
    }

    pub fn dimension(&self) -> usize {
        self.lock.dimension
    }

    pub fn model_lock(&self) -> &ModelLock {
        &self.lock
    }

    pub fn index_root(&self) -> &Path {
        &self.index_root
    }

    pub fn count_chunks(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM chunk_metadata", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn ann_count(&self) -> usize {
        *self.ann_count.lock().unwrap()
    }

    pub fn ann_available(&self) -> bool {
        self.hnsw.lock().unwrap().is_some()
    }

    /// Insert a chunk into all three artifacts. The metadata rows and the
    /// binary record commit together or not at all; the in-memory ANN
    /// index picks the vector up immediately when built.
    pub fn add_chunk(
        &self,
        file_path: &str,
        content: &str,
        start_line: Option<u32>,
        end_line: Option<u32>,
        source_index_db: Option<&str>,
        category: ChunkCategory,
        metadata: Option<&str>,
        embedding: &[f32],
    ) -> Result<i64> {
        if embedding.len() != self.lock.dimension {
            return Err(CodexLensError::storage(format!(
                "embedding dimension {} does not match model lock dimension {}",
                embedding.len(),
                self.lock.dimension
            )));
        }

        let sketch = pack_sketch(embedding);

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let chunk_id: i64 = tx.query_row(
            "SELECT COALESCE(MAX(chunk_id) + 1, 0) FROM chunk_metadata",
            [],
            |row| row.get(0),
        )?;

        tx.execute(
            "INSERT INTO chunk_metadata
                 (chunk_id, file_path, content, start_line, end_line,
                  source_index_db, category, metadata, embedding)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                chunk_id,
                file_path,
                content,
                start_line,
                end_line,
                source_index_db,
                category.as_str(),
                metadata,
                embedding_to_blob(embedding),
            ],
        )?;
        tx.execute(
            "INSERT INTO binary_vectors (chunk_id, sketch) VALUES (?1, ?2)",
            params![chunk_id, sketch.as_slice()],
        )?;

        let mut writer = BinarySketchWriter::open(&self.index_root)?;
        writer.append(chunk_id as usize, &sketch)?;

        if let Err(err) = tx.commit() {
            // Roll the mmap record back so the triple stays consistent.
            let _ = writer.truncate(chunk_id as usize);
            return Err(err.into());
        }
        drop(conn);

        if let Some(hnsw) = self.hnsw.lock().unwrap().as_ref() {
            hnsw.insert((embedding, chunk_id as usize));
            *self.ann_count.lock().unwrap() += 1;
        }

        Ok(chunk_id)
    }

    /// Rebuild the HNSW index from `chunk_metadata`.
    pub fn rebuild_ann_index(&self) -> Result<usize> {
        let rows: Vec<(i64, Vec<f32>)> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt =
                conn.prepare("SELECT chunk_id, embedding FROM chunk_metadata ORDER BY chunk_id")?;
            let mapped = stmt.query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;
            mapped
                .map(|r| r.map(|(id, blob)| (id, blob_to_embedding(&blob))))
                .collect::<std::result::Result<Vec<_>, _>>()?
        };

        if rows.is_empty() {
            *self.hnsw.lock().unwrap() = None;
            *self.ann_count.lock().unwrap() = 0;
            return Ok(0);
        }

        debug!(
            "Building HNSW index: {} vectors, dim {}",
            rows.len(),
            self.lock.dimension
        );

        let mut hnsw = Hnsw::<'static, f32, DistCosine>::new(
            HNSW_MAX_CONNECTIONS,
            rows.len().max(1024),
            HNSW_MAX_LAYERS,
            HNSW_EF_CONSTRUCTION,
            DistCosine {},
        );

        let data: Vec<(&Vec<f32>, usize)> = rows
            .iter()
            .map(|(id, vector)| (vector, *id as usize))
            .collect();
        hnsw.parallel_insert(&data);
        hnsw.set_searching_mode(true);

        let count = rows.len();
        *self.hnsw.lock().unwrap() = Some(hnsw);
        *self.ann_count.lock().unwrap() = count;
        info!("HNSW index built: {count} vectors");
        Ok(count)
    }

    /// k-NN over dense vectors. Scores are `1 - cosine_distance`, clamped
    /// to `[0, 1]`; results below `min_score` or outside `category` drop.
    pub fn search_similar(
        &self,
        query: &[f32],
        top_k: usize,
        min_score: f32,
        category: Option<ChunkCategory>,
    ) -> Result<Vec<(ChunkMetadata, f32)>> {
        if query.len() != self.lock.dimension {
            return Err(CodexLensError::Search(format!(
                "query dimension {} does not match index dimension {}",
                query.len(),
                self.lock.dimension
            )));
        }

        let neighbours = {
            let guard = self.hnsw.lock().unwrap();
            let Some(hnsw) = guard.as_ref() else {
                return Err(CodexLensError::Search(
                    "ANN index not built; call rebuild_ann_index first".into(),
                ));
            };
            // Category filtering happens after retrieval, so fetch wider.
            let fetch = if category.is_some() { top_k * 4 } else { top_k };
            let ef_search = (fetch * 2).max(50);
            hnsw.search(query, fetch.max(1), ef_search)
        };

        let mut results = Vec::new();
        for neighbour in neighbours {
            let score = (1.0 - neighbour.distance).clamp(0.0, 1.0);
            if score < min_score {
                continue;
            }
            let Some(chunk) = self.get_chunk(neighbour.d_id as i64)? else {
                continue;
            };
            if let Some(wanted) = category {
                if chunk.category != wanted.as_str() {
                    continue;
                }
            }
            results.push((chunk, score));
            if results.len() >= top_k {
                break;
            }
        }

        Ok(results)
    }

    pub fn get_chunk(&self, chunk_id: i64) -> Result<Option<ChunkMetadata>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT chunk_id, file_path, content, start_line, end_line,
                        source_index_db, category, metadata
                 FROM chunk_metadata WHERE chunk_id = ?1",
                params![chunk_id],
                chunk_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_chunks_by_ids(&self, chunk_ids: &[i64]) -> Result<Vec<ChunkMetadata>> {
        if chunk_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; chunk_ids.len()].join(",");
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT chunk_id, file_path, content, start_line, end_line,
                    source_index_db, category, metadata
             FROM chunk_metadata WHERE chunk_id IN ({placeholders})"
        ))?;
        let rows = stmt.query_map(rusqlite::params_from_iter(chunk_ids.iter()), chunk_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Coarse searcher over the binary sketch mmap; `None` when the
    /// artifacts are missing.
    pub fn binary_searcher(&self) -> Result<Option<BinarySearcher>> {
        BinarySearcher::open(&self.index_root)
    }

    /// Persist the HNSW graph next to the other artifacts.
    pub fn save_ann_index(&self) -> Result<()> {
        let mut guard = self.hnsw.lock().unwrap();
        let Some(hnsw) = guard.as_mut() else {
            return Err(CodexLensError::storage("ANN index not built"));
        };

        // Dumping requires leaving search mode for the duration.
        hnsw.set_searching_mode(false);
        let dump = hnsw.file_dump(&self.index_root, HNSW_BASENAME);
        hnsw.set_searching_mode(true);

        dump.map_err(|e| CodexLensError::storage(format!("HNSW dump failed: {e}")))?;
        Ok(())
    }
}

fn chunk_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChunkMetadata> {
    Ok(ChunkMetadata {
        chunk_id: row.get(0)?,
        file_path: row.get(1)?,
        content: row.get(2)?,
        start_line: row.get(3)?,
        end_line: row.get(4)?,
        source_index_db: row.get(5)?,
        category: row.get(6)?,
        metadata: row.get(7)?,
    })
}

fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes(chunk.try_into().unwrap()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::embedder::{EmbeddingProvider, HashEmbedder};
    use tempfile::TempDir;

    fn open_store(dir: &Path, dim: usize) -> VectorStore {
        VectorStore::open(dir, "builtin", &format!("hash-{dim}"), dim, false).unwrap()
    }

    #[test]
    fn chunks_round_trip_with_stable_dimension() {
        let dir = TempDir::new().unwrap();
        let embedder = HashEmbedder::new(64);
        let store = open_store(dir.path(), 64);

        let embedding = embedder.embed_one("fn parse_config() {}").unwrap();
        let id = store
            .add_chunk(
                "/src/config.rs",
                "fn parse_config() {}",
                Some(1),
                Some(1),
                None,
                ChunkCategory::Code,
                None,
                &embedding,
            )
            .unwrap();

        assert_eq!(id, 0);
        assert_eq!(store.count_chunks().unwrap(), 1);
        let chunk = store.get_chunk(id).unwrap().unwrap();
        assert_eq!(chunk.file_path, "/src/config.rs");
        assert_eq!(chunk.category, "code");
    }

    #[test]
    fn wrong_dimension_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path(), 64);
        let err = store
            .add_chunk("/a", "x", None, None, None, ChunkCategory::Code, None, &[0.0; 16])
            .unwrap_err();
        assert!(matches!(err, CodexLensError::Storage { .. }));
    }

    #[test]
    fn reopening_with_a_different_model_needs_force() {
        let dir = TempDir::new().unwrap();
        {
            let _store = open_store(dir.path(), 64);
        }
        let err = VectorStore::open(dir.path(), "builtin", "hash-128", 128, false).unwrap_err();
        assert!(matches!(err, CodexLensError::ModelLockConflict { .. }));

        let forced = VectorStore::open(dir.path(), "builtin", "hash-128", 128, true).unwrap();
        assert_eq!(forced.dimension(), 128);
        crate::vector::model_lock::release_lock(dir.path());
    }

    #[test]
    fn dense_search_ranks_the_matching_chunk_first() {
        let dir = TempDir::new().unwrap();
        let embedder = HashEmbedder::new(96);
        let store = open_store(dir.path(), 96);

        for (path, text) in [
            ("/src/auth.py", "def authenticate(user, token): check(token)"),
            ("/src/math.py", "def rotate(matrix): transpose(matrix)"),
            ("/src/db.py", "def connect(url): open_session(url)"),
        ] {
            let embedding = embedder.embed_one(text).unwrap();
            store
                .add_chunk(path, text, None, None, None, ChunkCategory::Code, None, &embedding)
                .unwrap();
        }

        store.rebuild_ann_index().unwrap();
        assert!(store.ann_available());
        assert_eq!(store.ann_count(), 3);

        let query = embedder.embed_one("authenticate user token").unwrap();
        let hits = store.search_similar(&query, 2, 0.0, None).unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].0.file_path, "/src/auth.py");
        assert!(hits[0].1 > 0.0 && hits[0].1 <= 1.0);
        crate::vector::model_lock::release_lock(dir.path());
    }

    #[test]
    fn binary_mmap_stays_in_sync_with_metadata() {
        let dir = TempDir::new().unwrap();
        let embedder = HashEmbedder::new(64);
        let store = open_store(dir.path(), 64);

        for i in 0..3 {
            let embedding = embedder.embed_one(&format!("chunk number {i}")).unwrap();
            store
                .add_chunk(
                    &format!("/src/f{i}.py"),
                    "content",
                    None,
                    None,
                    None,
                    ChunkCategory::Code,
                    None,
                    &embedding,
                )
                .unwrap();
        }

        let searcher = store.binary_searcher().unwrap().unwrap();
        assert_eq!(searcher.count(), store.count_chunks().unwrap());
        crate::vector::model_lock::release_lock(dir.path());
    }
}
