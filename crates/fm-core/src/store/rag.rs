use chrono::{DateTime, Utc};

use super::{enum_from_sql, enum_to_sql, ts_from_sql, ts_to_sql, CoreError, Store};
use crate::types::{epoch, RagChunk, SourceType};

const CHUNK_COLS: &str = "id, source_type, source_ref, chunk_text, indexed_at, metadata";

/// Watermark key for a source type.
pub fn watermark_key(source: SourceType) -> String {
    format!("last_indexed_{}", source.as_str())
}

/// Content-hash key for a source ref.
pub fn hash_key(source_ref: &str) -> String {
    format!("hash_{source_ref}")
}

impl Store {
    /// Insert one chunk row and return its id — the same id the embedding
    /// row must be stored under.
    pub async fn insert_chunk(
        &self,
        source_type: SourceType,
        source_ref: &str,
        chunk_text: &str,
        metadata: serde_json::Value,
    ) -> Result<i64, CoreError> {
        let source_ref = source_ref.to_string();
        let chunk_text = chunk_text.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO rag_chunks (source_type, source_ref, chunk_text, indexed_at, metadata) \
                     VALUES (?1,?2,?3,?4,?5)",
                    rusqlite::params![
                        enum_to_sql(&source_type),
                        source_ref,
                        chunk_text,
                        ts_to_sql(&Utc::now()),
                        metadata.to_string(),
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?)
    }

    pub async fn get_chunks(&self, ids: Vec<i64>) -> Result<Vec<RagChunk>, CoreError> {
        Ok(self
            .conn
            .call(move |conn| {
                let mut out = Vec::new();
                let mut stmt =
                    conn.prepare(&format!("SELECT {CHUNK_COLS} FROM rag_chunks WHERE id = ?1"))?;
                for id in ids {
                    let mut rows = stmt.query(rusqlite::params![id])?;
                    if let Some(row) = rows.next()? {
                        out.push(row_to_chunk(row)?);
                    }
                }
                Ok(out)
            })
            .await?)
    }

    /// Remove every chunk for a source ref, deleting the embedding rows
    /// first so no embedding ever outlives its chunk. Returns how many
    /// chunks were dropped.
    pub async fn delete_chunks_for_ref(
        &self,
        source_type: SourceType,
        source_ref: &str,
    ) -> Result<usize, CoreError> {
        let source_ref = source_ref.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut ids = Vec::new();
                {
                    let mut stmt = tx.prepare(
                        "SELECT id FROM rag_chunks WHERE source_type = ?1 AND source_ref = ?2",
                    )?;
                    let mut rows =
                        stmt.query(rusqlite::params![enum_to_sql(&source_type), source_ref])?;
                    while let Some(row) = rows.next()? {
                        ids.push(row.get::<_, i64>(0)?);
                    }
                }
                let has_vec_table: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE name = 'rag_embeddings'",
                    [],
                    |r| r.get(0),
                )?;
                for id in &ids {
                    if has_vec_table > 0 {
                        tx.execute(
                            "DELETE FROM rag_embeddings WHERE rowid = ?1",
                            rusqlite::params![id],
                        )?;
                    }
                    tx.execute("DELETE FROM rag_chunks WHERE id = ?1", rusqlite::params![id])?;
                }
                tx.commit()?;
                Ok(ids.len())
            })
            .await?)
    }

    pub async fn chunk_count(&self) -> Result<i64, CoreError> {
        Ok(self
            .conn
            .call(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM rag_chunks", [], |r| r.get(0))?))
            .await?)
    }

    // -- RagMeta ------------------------------------------------------------

    pub async fn get_rag_meta(&self, key: &str) -> Result<Option<String>, CoreError> {
        let key = key.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT value FROM rag_meta WHERE meta_key = ?1",
                    rusqlite::params![key],
                    |r| r.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other.into()),
                })
            })
            .await?)
    }

    pub async fn set_rag_meta(&self, key: &str, value: &str) -> Result<(), CoreError> {
        let key = key.to_string();
        let value = value.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO rag_meta (meta_key, value) VALUES (?1,?2) \
                     ON CONFLICT(meta_key) DO UPDATE SET value=excluded.value",
                    rusqlite::params![key, value],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Per-source incremental watermark; epoch when the source was never
    /// indexed (or after a dimension migration reset it).
    pub async fn watermark(&self, source: SourceType) -> Result<DateTime<Utc>, CoreError> {
        Ok(self
            .get_rag_meta(&watermark_key(source))
            .await?
            .map(|raw| ts_from_sql(&raw))
            .unwrap_or_else(epoch))
    }

    pub async fn set_watermark(
        &self,
        source: SourceType,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        self.set_rag_meta(&watermark_key(source), &ts_to_sql(&at)).await
    }
}

fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<RagChunk> {
    let source_type: String = row.get(1)?;
    let indexed_at: String = row.get(4)?;
    let metadata: String = row.get(5)?;
    Ok(RagChunk {
        id: row.get(0)?,
        source_type: enum_from_sql(&source_type),
        source_ref: row.get(2)?,
        chunk_text: row.get(3)?,
        indexed_at: ts_from_sql(&indexed_at),
        metadata: serde_json::from_str(&metadata).expect("valid chunk metadata"),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn chunk_insert_and_fetch() {
        let store = Store::open_in_memory().await.unwrap();
        let id = store
            .insert_chunk(SourceType::Markdown, "README.md", "# Title", serde_json::json!({}))
            .await
            .unwrap();
        let chunks = store.get_chunks(vec![id]).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].source_ref, "README.md");
        assert_eq!(chunks[0].source_type, SourceType::Markdown);
    }

    #[tokio::test]
    async fn delete_chunks_for_ref_scoped_to_source() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .insert_chunk(SourceType::Markdown, "a.md", "one", serde_json::json!({}))
            .await
            .unwrap();
        store
            .insert_chunk(SourceType::Markdown, "a.md", "two", serde_json::json!({}))
            .await
            .unwrap();
        store
            .insert_chunk(SourceType::Codefile, "a.md", "three", serde_json::json!({}))
            .await
            .unwrap();

        let dropped = store.delete_chunks_for_ref(SourceType::Markdown, "a.md").await.unwrap();
        assert_eq!(dropped, 2);
        assert_eq!(store.chunk_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn watermark_defaults_to_epoch() {
        let store = Store::open_in_memory().await.unwrap();
        assert_eq!(store.watermark(SourceType::Markdown).await.unwrap(), epoch());

        let now = Utc::now();
        store.set_watermark(SourceType::Markdown, now).await.unwrap();
        let stored = store.watermark(SourceType::Markdown).await.unwrap();
        assert_eq!(stored.timestamp(), now.timestamp());
    }

    #[tokio::test]
    async fn rag_meta_upsert() {
        let store = Store::open_in_memory().await.unwrap();
        store.set_rag_meta(&hash_key("/p/a.md"), "abc").await.unwrap();
        store.set_rag_meta(&hash_key("/p/a.md"), "def").await.unwrap();
        assert_eq!(store.get_rag_meta(&hash_key("/p/a.md")).await.unwrap().as_deref(), Some("def"));
    }
}
