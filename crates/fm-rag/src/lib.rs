//! Retrieval-augmented knowledge base over the coordinator's own state and
//! the project tree: chunking, embedding, the vec0 vector index, and the
//! "ask the project" query front end.

pub mod chunker;
pub mod indexer;
pub mod provider;
pub mod query;
pub mod vector;

use fm_core::store::CoreError;

#[derive(Debug, thiserror::Error)]
pub enum RagError {
    #[error(transparent)]
    Core(#[from] CoreError),
    /// The vector index cannot serve queries; the message names the likely
    /// cause (extension not loaded, provider misconfigured, empty index).
    #[error("RAG unavailable: {0}")]
    Unavailable(String),
    #[error("embedding provider error: {0}")]
    Provider(String),
    #[error("embedding dimension mismatch: expected {expected}, provider returned {got}")]
    Dimension { expected: usize, got: usize },
}

pub use indexer::{IndexSummary, RagIndexer};
pub use provider::{EmbeddingProvider, HttpEmbeddingProvider, StaticProvider};
pub use query::{RagQuery, RagStatus};
