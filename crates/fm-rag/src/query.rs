use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use fm_core::store::{vector_available, Store};
use fm_core::types::SourceType;

use crate::provider::EmbeddingProvider;
use crate::vector;
use crate::RagError;

/// Default number of chunks retrieved per question.
pub const DEFAULT_TOP_K: usize = 5;

// ---------------------------------------------------------------------------
// RagStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct RagStatus {
    pub available: bool,
    pub provider: String,
    pub dimension: Option<usize>,
    pub chunk_count: i64,
    pub embedding_count: i64,
    pub watermarks: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// RagQuery
// ---------------------------------------------------------------------------

/// The "ask the project" front end: embed the question, pull the top-K
/// chunks, assemble a cited answer block. Never returns vectors; always
/// names its sources.
pub struct RagQuery {
    store: Arc<Store>,
    provider: Arc<dyn EmbeddingProvider>,
}

impl RagQuery {
    pub fn new(store: Arc<Store>, provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self { store, provider }
    }

    pub async fn ask(&self, question: &str, top_k: usize) -> Result<String, RagError> {
        if !vector_available() {
            return Err(RagError::Unavailable(
                "vector extension not loaded — vec0 virtual tables are disabled on this host".into(),
            ));
        }
        if vector::embedding_count(&self.store).await? == 0 {
            return Err(RagError::Unavailable(
                "the index is empty — the background indexer has not embedded anything yet \
                 (provider misconfigured, or the first pass has not finished)"
                    .into(),
            ));
        }

        let vectors = self.provider.embed(&[question.to_string()]).await?;
        let query_vector = vectors
            .into_iter()
            .next()
            .ok_or_else(|| RagError::Provider("provider returned no vector for the query".into()))?;

        let hits = vector::knn(&self.store, &query_vector, top_k).await?;
        if hits.is_empty() {
            return Err(RagError::Unavailable(
                "no chunks matched the query — the index is empty".into(),
            ));
        }
        let ids: Vec<i64> = hits.iter().map(|(id, _)| *id).collect();
        let chunks = self.store.get_chunks(ids).await?;

        let mut answer = format!(
            "Answer sources for: \"{}\" ({} match{})\n",
            question,
            chunks.len(),
            if chunks.len() == 1 { "" } else { "es" }
        );
        for (i, chunk) in chunks.iter().enumerate() {
            let ordinal = chunk.metadata.get("ordinal").and_then(|v| v.as_i64()).unwrap_or(0);
            answer.push_str(&format!(
                "\n[{}] {}:{} (chunk {})\n{}\n",
                i + 1,
                chunk.source_type,
                chunk.source_ref,
                ordinal + 1,
                snippet(&chunk.chunk_text, 600),
            ));
        }
        Ok(answer)
    }

    pub async fn status(&self) -> Result<RagStatus, RagError> {
        let available = vector_available();
        let mut watermarks = BTreeMap::new();
        for source in SourceType::ALL {
            let at = self.store.watermark(source).await?;
            watermarks.insert(source.as_str().to_string(), at.to_rfc3339());
        }
        Ok(RagStatus {
            available,
            provider: self.provider.id().to_string(),
            dimension: vector::current_dimension(&self.store).await.unwrap_or(None),
            chunk_count: self.store.chunk_count().await?,
            embedding_count: if available {
                vector::embedding_count(&self.store).await?
            } else {
                0
            },
            watermarks,
        })
    }
}

fn snippet(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
