// LLM-derived semantic metadata and normalized keyword tables

use super::DirIndexStore;
use crate::errors::Result;
use crate::types::{FileEntry, SemanticMetadata};
use rusqlite::{OptionalExtension, params};
use std::path::{Path, PathBuf};

impl DirIndexStore {
    /// Store per-file LLM annotations and mirror the keyword list into the
    /// normalized `keywords` / `file_keywords` tables.
    pub fn update_semantic_metadata(
        &self,
        full_path: &Path,
        metadata: &SemanticMetadata,
    ) -> Result<bool> {
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

        tx.execute(
            "INSERT OR REPLACE INTO semantic_metadata
                 (file_id, summary, purpose, keywords, llm_tool, generated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                file_id,
                metadata.summary,
                metadata.purpose,
                serde_json::to_string(&metadata.keywords)?,
                metadata.llm_tool,
                metadata.generated_at.to_rfc3339(),
            ],
        )?;

        tx.execute(
            "DELETE FROM file_keywords WHERE file_id = ?1",
            params![file_id],
        )?;
        {
            let mut insert_keyword =
                tx.prepare("INSERT OR IGNORE INTO keywords (keyword) VALUES (?1)")?;
            let mut link = tx.prepare(
                "INSERT OR IGNORE INTO file_keywords (file_id, keyword_id)
                 SELECT ?1, id FROM keywords WHERE keyword = ?2",
            )?;
            for keyword in &metadata.keywords {
                let keyword = keyword.trim().to_ascii_lowercase();
                if keyword.is_empty() {
                    continue;
                }
                insert_keyword.execute(params![keyword])?;
                link.execute(params![file_id, keyword])?;
            }
        }

        tx.commit()?;
        Ok(true)
    }

    /// Files whose LLM keywords match `query`, with their keyword lists.
    ///
    /// `use_normalized` selects the join over `file_keywords`; the
    /// alternative scans the JSON `keywords` column. Both paths return the
    /// same set for a given query.
    pub fn search_semantic_keywords(
        &self,
        query: &str,
        use_normalized: bool,
    ) -> Result<Vec<(FileEntry, Vec<String>)>> {
        let needle = query.trim().to_ascii_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock().unwrap();

        let file_ids: Vec<i64> = if use_normalized {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT fk.file_id
                 FROM file_keywords fk
                 JOIN keywords k ON k.id = fk.keyword_id
                 WHERE k.keyword LIKE ?1
                 ORDER BY fk.file_id",
            )?;
            let rows = stmt.query_map(params![format!("%{needle}%")], |row| row.get(0))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        } else {
            let mut stmt =
                conn.prepare("SELECT file_id, keywords FROM semantic_metadata ORDER BY file_id")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut matched = Vec::new();
            for row in rows {
                let (file_id, keywords_json) = row?;
                let keywords: Vec<String> =
                    serde_json::from_str(&keywords_json).unwrap_or_default();
                if keywords
                    .iter()
                    .any(|k| k.to_ascii_lowercase().contains(&needle))
                {
                    matched.push(file_id);
                }
            }
            matched
        };

        let mut results = Vec::new();
        for file_id in file_ids {
            let entry = conn
                .query_row(
                    "SELECT id, name, full_path, language, mtime_ms, size, line_count, content_hash
                     FROM files WHERE id = ?1",
                    params![file_id],
                    |row| {
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
                    },
                )
                .optional()?;

            let Some(entry) = entry else { continue };

            let keywords_json: String = conn
                .query_row(
                    "SELECT keywords FROM semantic_metadata WHERE file_id = ?1",
                    params![file_id],
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or_else(|| "[]".to_string());
            let keywords: Vec<String> = serde_json::from_str(&keywords_json).unwrap_or_default();

            results.push((entry, keywords));
        }

        Ok(results)
    }
}
