use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::RagError;

// ---------------------------------------------------------------------------
// EmbeddingProvider trait
// ---------------------------------------------------------------------------

/// What the RAG core requires from an embedding backend: a list of strings
/// in, one float array of the configured dimension per string out.
#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn id(&self) -> &str;
    fn dimension(&self) -> usize;
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError>;
}

// ---------------------------------------------------------------------------
// HttpEmbeddingProvider — OpenAI-compatible /v1/embeddings
// ---------------------------------------------------------------------------

pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dimension: usize,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

impl HttpEmbeddingProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, dimension: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: api_key.into(),
            model: model.into(),
            dimension,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    fn id(&self) -> &str {
        "openai"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "model": self.model,
                "input": texts,
            }))
            .send()
            .await
            .map_err(|e| RagError::Provider(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RagError::Provider(format!("{status}: {body}")));
        }

        let parsed: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| RagError::Provider(e.to_string()))?;
        let vectors: Vec<Vec<f32>> = parsed.data.into_iter().map(|row| row.embedding).collect();
        for vector in &vectors {
            if vector.len() != self.dimension {
                return Err(RagError::Dimension {
                    expected: self.dimension,
                    got: vector.len(),
                });
            }
        }
        Ok(vectors)
    }
}

// ---------------------------------------------------------------------------
// StaticProvider — deterministic, offline
// ---------------------------------------------------------------------------

/// Hash-derived embeddings: the same text always maps to the same unit
/// vector. No semantic similarity, but exact-text retrieval works, which
/// is enough for tests and offline operation.
pub struct StaticProvider {
    dimension: usize,
}

impl StaticProvider {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut bytes = Vec::with_capacity(self.dimension);
        let mut counter: u32 = 0;
        while bytes.len() < self.dimension {
            let mut hasher = Sha256::new();
            hasher.update(text.as_bytes());
            hasher.update(counter.to_le_bytes());
            bytes.extend_from_slice(&hasher.finalize());
            counter += 1;
        }
        bytes.truncate(self.dimension);

        let mut vector: Vec<f32> = bytes.into_iter().map(|b| b as f32 / 255.0 - 0.5).collect();
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for StaticProvider {
    fn id(&self) -> &str {
        "static"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_provider_is_deterministic() {
        let provider = StaticProvider::new(16);
        let a = provider.embed(&["hello".to_string()]).await.unwrap();
        let b = provider.embed(&["hello".to_string()]).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 16);

        let other = provider.embed(&["different".to_string()]).await.unwrap();
        assert_ne!(a[0], other[0]);
    }

    #[tokio::test]
    async fn static_vectors_are_unit_length() {
        let provider = StaticProvider::new(64);
        let vectors = provider.embed(&["text".to_string()]).await.unwrap();
        let norm: f32 = vectors[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn batch_preserves_order() {
        let provider = StaticProvider::new(8);
        let texts: Vec<String> = vec!["a".into(), "b".into(), "a".into()];
        let vectors = provider.embed(&texts).await.unwrap();
        assert_eq!(vectors.len(), 3);
        assert_eq!(vectors[0], vectors[2]);
        assert_ne!(vectors[0], vectors[1]);
    }
}
