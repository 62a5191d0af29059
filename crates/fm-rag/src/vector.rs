use fm_core::store::{vector_available, Store};
use fm_core::types::{epoch, SourceType};

use crate::RagError;

// ---------------------------------------------------------------------------
// Blob serialization
// ---------------------------------------------------------------------------

/// vec0 accepts vectors as little-endian f32 byte strings.
pub fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

// ---------------------------------------------------------------------------
// Dimension bookkeeping
// ---------------------------------------------------------------------------

/// Parse the declared dimension out of a persisted vec0 table definition,
/// e.g. `CREATE VIRTUAL TABLE rag_embeddings USING vec0(embedding float[768])`.
pub fn parse_dimension(sql: &str) -> Option<usize> {
    let start = sql.find("float[")? + "float[".len();
    let rest = &sql[start..];
    let end = rest.find(']')?;
    rest[..end].trim().parse().ok()
}

fn declared_dimension(conn: &rusqlite::Connection) -> Result<Option<usize>, rusqlite::Error> {
    let sql: Option<String> = conn
        .query_row(
            "SELECT sql FROM sqlite_master WHERE name = 'rag_embeddings'",
            [],
            |r| r.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    Ok(sql.as_deref().and_then(parse_dimension))
}

/// Outcome of a dimension check that had to rebuild the table.
#[derive(Debug, Clone, Copy)]
pub struct MigrationSummary {
    pub old_dimension: usize,
    pub new_dimension: usize,
    pub dropped_embeddings: i64,
}

/// Startup dimension check. Creates the vec0 table on first run; on a
/// dimension mismatch runs the migration protocol in one transaction:
/// count rows, delete embeddings, drop the table, purge every `hash_*`
/// meta row, reset every watermark to epoch, recreate at the new
/// dimension. The background indexer then re-embeds everything.
pub async fn ensure_dimension(
    store: &Store,
    dimension: usize,
) -> Result<Option<MigrationSummary>, RagError> {
    if !vector_available() {
        return Err(RagError::Unavailable(
            "vec0 extension could not be loaded; vector tables are disabled".into(),
        ));
    }
    let epoch_str = epoch().to_rfc3339();
    store
        .call(move |conn| {
            let tx = conn.transaction()?;
            let declared = declared_dimension(&tx)?;

            let summary = match declared {
                None => {
                    tx.execute_batch(&format!(
                        "CREATE VIRTUAL TABLE rag_embeddings USING vec0(embedding float[{dimension}])"
                    ))?;
                    None
                }
                Some(current) if current == dimension => None,
                Some(current) => {
                    let dropped: i64 =
                        tx.query_row("SELECT COUNT(*) FROM rag_embeddings", [], |r| r.get(0))?;
                    tx.execute("DELETE FROM rag_embeddings", [])?;
                    tx.execute_batch("DROP TABLE rag_embeddings")?;
                    tx.execute("DELETE FROM rag_meta WHERE meta_key LIKE 'hash_%'", [])?;
                    for source in SourceType::ALL {
                        tx.execute(
                            "INSERT INTO rag_meta (meta_key, value) VALUES (?1, ?2) \
                             ON CONFLICT(meta_key) DO UPDATE SET value=excluded.value",
                            rusqlite::params![
                                format!("last_indexed_{}", source.as_str()),
                                epoch_str
                            ],
                        )?;
                    }
                    tx.execute_batch(&format!(
                        "CREATE VIRTUAL TABLE rag_embeddings USING vec0(embedding float[{dimension}])"
                    ))?;
                    tracing::info!(
                        old = current,
                        new = dimension,
                        dropped,
                        "vector dimension migrated; index will rebuild"
                    );
                    Some(MigrationSummary {
                        old_dimension: current,
                        new_dimension: dimension,
                        dropped_embeddings: dropped,
                    })
                }
            };

            tx.commit()?;
            Ok(summary)
        })
        .await
        .map_err(RagError::from)
}

// ---------------------------------------------------------------------------
// Row operations
// ---------------------------------------------------------------------------

/// Store one embedding under the chunk's id.
pub async fn insert_embedding(store: &Store, id: i64, vector: &[f32]) -> Result<(), RagError> {
    let blob = vector_to_blob(vector);
    store
        .call(move |conn| {
            conn.execute(
                "INSERT INTO rag_embeddings (rowid, embedding) VALUES (?1, ?2)",
                rusqlite::params![id, blob],
            )?;
            Ok(())
        })
        .await?;
    Ok(())
}

/// Top-K nearest chunk ids with their distances.
pub async fn knn(store: &Store, query: &[f32], k: usize) -> Result<Vec<(i64, f64)>, RagError> {
    let blob = vector_to_blob(query);
    Ok(store
        .call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT rowid, distance FROM rag_embeddings \
                 WHERE embedding MATCH ?1 AND k = ?2 ORDER BY distance",
            )?;
            let mut rows = stmt.query(rusqlite::params![blob, k as i64])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?));
            }
            Ok(out)
        })
        .await?)
}

pub async fn embedding_count(store: &Store) -> Result<i64, RagError> {
    Ok(store
        .call(|conn| {
            let exists: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 'rag_embeddings'",
                [],
                |r| r.get(0),
            )?;
            if exists == 0 {
                return Ok(0);
            }
            Ok(conn.query_row("SELECT COUNT(*) FROM rag_embeddings", [], |r| r.get(0))?)
        })
        .await?)
}

pub async fn current_dimension(store: &Store) -> Result<Option<usize>, RagError> {
    Ok(store.call(|conn| Ok(declared_dimension(conn)?)).await?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use fm_core::store::vector_available;

    #[test]
    fn dimension_parsing() {
        assert_eq!(
            parse_dimension("CREATE VIRTUAL TABLE rag_embeddings USING vec0(embedding float[768])"),
            Some(768)
        );
        assert_eq!(parse_dimension("vec0(embedding float[ 1536 ])"), Some(1536));
        assert_eq!(parse_dimension("CREATE TABLE plain (x INTEGER)"), None);
    }

    #[test]
    fn blob_layout_is_le_f32() {
        let blob = vector_to_blob(&[1.0, -2.5]);
        assert_eq!(blob.len(), 8);
        assert_eq!(&blob[..4], &1.0f32.to_le_bytes());
        assert_eq!(&blob[4..], &(-2.5f32).to_le_bytes());
    }

    #[tokio::test]
    async fn first_run_creates_table() {
        if !vector_available() {
            return;
        }
        let store = Store::open_in_memory().await.unwrap();
        let summary = ensure_dimension(&store, 8).await.unwrap();
        assert!(summary.is_none());
        assert_eq!(current_dimension(&store).await.unwrap(), Some(8));

        // Same dimension again is a no-op.
        assert!(ensure_dimension(&store, 8).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn knn_orders_by_distance() {
        if !vector_available() {
            return;
        }
        let store = Store::open_in_memory().await.unwrap();
        ensure_dimension(&store, 4).await.unwrap();

        insert_embedding(&store, 1, &[1.0, 0.0, 0.0, 0.0]).await.unwrap();
        insert_embedding(&store, 2, &[0.0, 1.0, 0.0, 0.0]).await.unwrap();
        insert_embedding(&store, 3, &[0.9, 0.1, 0.0, 0.0]).await.unwrap();

        let hits = knn(&store, &[1.0, 0.0, 0.0, 0.0], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, 1);
        assert_eq!(hits[1].0, 3);
        assert!(hits[0].1 <= hits[1].1);
    }

    #[tokio::test]
    async fn migration_resets_hashes_and_watermarks() {
        if !vector_available() {
            return;
        }
        let store = Store::open_in_memory().await.unwrap();
        ensure_dimension(&store, 4).await.unwrap();

        // Three chunks with embeddings, a hash, and a fresh watermark.
        for i in 0..3 {
            let id = store
                .insert_chunk(SourceType::Markdown, "/p/a.md", &format!("chunk {i}"), serde_json::json!({}))
                .await
                .unwrap();
            insert_embedding(&store, id, &[0.0, 0.1, 0.2, 0.3]).await.unwrap();
        }
        store.set_rag_meta("hash_/p/a.md", "somehash").await.unwrap();
        store.set_watermark(SourceType::Markdown, chrono::Utc::now()).await.unwrap();

        let summary = ensure_dimension(&store, 8).await.unwrap().unwrap();
        assert_eq!(summary.old_dimension, 4);
        assert_eq!(summary.new_dimension, 8);
        assert_eq!(summary.dropped_embeddings, 3);

        assert_eq!(embedding_count(&store).await.unwrap(), 0);
        assert_eq!(store.chunk_count().await.unwrap(), 3);
        assert!(store.get_rag_meta("hash_/p/a.md").await.unwrap().is_none());
        assert_eq!(store.watermark(SourceType::Markdown).await.unwrap(), epoch());
        assert_eq!(current_dimension(&store).await.unwrap(), Some(8));
    }
}
