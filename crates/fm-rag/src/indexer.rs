use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use fm_core::store::{vector_available, Store, TaskFilter};
use fm_core::types::SourceType;

use crate::chunker::{chunk_code, chunk_markdown, CODE_OVERLAP, CODE_WINDOW, MARKDOWN_TARGET};
use crate::provider::EmbeddingProvider;
use crate::vector;
use crate::RagError;

const SKIP_DIRS: [&str; 5] = [".git", ".agent", "node_modules", "target", ".venv"];
const CODE_EXTENSIONS: [&str; 9] = ["rs", "py", "ts", "js", "go", "java", "rb", "sh", "toml"];

#[derive(Debug, Default, Clone, Copy)]
pub struct IndexSummary {
    pub refs_indexed: usize,
    pub chunks_added: usize,
    pub errors: usize,
}

// ---------------------------------------------------------------------------
// RagIndexer
// ---------------------------------------------------------------------------

/// Background indexer: walks every source type, re-embedding whatever is
/// newer than its watermark or carries a changed content hash. Per-item
/// failures are swallowed — the hash/watermark is not advanced, so the
/// item is retried on the next pass.
pub struct RagIndexer {
    store: Arc<Store>,
    provider: Arc<dyn EmbeddingProvider>,
    project_dir: PathBuf,
    interval: Duration,
}

impl RagIndexer {
    pub fn new(
        store: Arc<Store>,
        provider: Arc<dyn EmbeddingProvider>,
        project_dir: PathBuf,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            provider,
            project_dir,
            interval,
        }
    }

    /// Periodic loop; exits when the shutdown signal flips.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            match self.index_pass().await {
                Ok(summary) if summary.refs_indexed > 0 || summary.errors > 0 => {
                    tracing::info!(
                        refs = summary.refs_indexed,
                        chunks = summary.chunks_added,
                        errors = summary.errors,
                        "index pass complete"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "index pass failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => {
                    tracing::debug!("indexer shutting down");
                    return;
                }
            }
        }
    }

    /// One full pass over every source type.
    pub async fn index_pass(&self) -> Result<IndexSummary, RagError> {
        if !vector_available() {
            return Err(RagError::Unavailable(
                "vec0 extension not loaded; indexing skipped".into(),
            ));
        }
        let mut summary = IndexSummary::default();
        self.index_files(SourceType::Markdown, &mut summary).await?;
        self.index_files(SourceType::Codefile, &mut summary).await?;
        self.index_context(&mut summary).await?;
        self.index_tasks(&mut summary).await?;
        self.index_filemeta(&mut summary).await?;
        Ok(summary)
    }

    // -----------------------------------------------------------------------
    // File sources (markdown, code)
    // -----------------------------------------------------------------------

    async fn index_files(
        &self,
        source: SourceType,
        summary: &mut IndexSummary,
    ) -> Result<(), RagError> {
        let scan_started = Utc::now();
        for path in self.enumerate_files(source) {
            let path_str = path.to_string_lossy().into_owned();
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) => {
                    tracing::debug!(path = %path_str, error = %e, "unreadable file skipped");
                    continue;
                }
            };
            let digest = content_hash(&content);
            let hash_key = format!("hash_{path_str}");
            if self.store.get_rag_meta(&hash_key).await?.as_deref() == Some(digest.as_str()) {
                continue;
            }

            let chunks = match source {
                SourceType::Markdown => chunk_markdown(&content, MARKDOWN_TARGET),
                _ => chunk_code(&content, CODE_WINDOW, CODE_OVERLAP),
            };
            match self.reindex_ref(source, &path_str, chunks).await {
                Ok(added) => {
                    self.store.set_rag_meta(&hash_key, &digest).await?;
                    summary.refs_indexed += 1;
                    summary.chunks_added += added;
                }
                Err(e) => {
                    // Hash not updated: retried next cycle.
                    tracing::warn!(path = %path_str, error = %e, "failed to index file");
                    summary.errors += 1;
                }
            }
        }
        self.store.set_watermark(source, scan_started).await?;
        Ok(())
    }

    fn enumerate_files(&self, source: SourceType) -> Vec<PathBuf> {
        WalkDir::new(&self.project_dir)
            .into_iter()
            .filter_entry(|entry| {
                let name = entry.file_name().to_string_lossy();
                !(entry.file_type().is_dir() && SKIP_DIRS.contains(&name.as_ref()))
            })
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| matches_source(path, source))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Store-backed sources
    // -----------------------------------------------------------------------

    async fn index_context(&self, summary: &mut IndexSummary) -> Result<(), RagError> {
        let scan_started = Utc::now();
        let watermark = self.store.watermark(SourceType::Context).await?;
        for entry in self.store.list_context().await? {
            if entry.last_updated <= watermark {
                continue;
            }
            let text = match &entry.description {
                Some(description) => format!("{}: {} — {}", entry.key, entry.value, description),
                None => format!("{}: {}", entry.key, entry.value),
            };
            self.reindex_one(SourceType::Context, &entry.key, text, summary).await;
        }
        self.store.set_watermark(SourceType::Context, scan_started).await?;
        Ok(())
    }

    async fn index_tasks(&self, summary: &mut IndexSummary) -> Result<(), RagError> {
        let scan_started = Utc::now();
        let watermark = self.store.watermark(SourceType::Task).await?;
        for task in self.store.list_tasks(TaskFilter::default()).await? {
            if task.updated_at <= watermark {
                continue;
            }
            let text = format!(
                "Task {} [{} / {}]: {}\n{}\nassigned to: {}",
                task.task_id,
                task.status,
                task.priority,
                task.title,
                task.description,
                task.assigned_to.as_deref().unwrap_or("nobody"),
            );
            let task_id = task.task_id.clone();
            self.reindex_one(SourceType::Task, &task_id, text, summary).await;
        }
        self.store.set_watermark(SourceType::Task, scan_started).await?;
        Ok(())
    }

    async fn index_filemeta(&self, summary: &mut IndexSummary) -> Result<(), RagError> {
        let scan_started = Utc::now();
        let watermark = self.store.watermark(SourceType::Filemeta).await?;
        for entry in self.store.list_file_metadata().await? {
            if entry.last_updated <= watermark {
                continue;
            }
            let text = format!("{}: {}", entry.key, entry.value);
            self.reindex_one(SourceType::Filemeta, &entry.key, text, summary).await;
        }
        self.store.set_watermark(SourceType::Filemeta, scan_started).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Shared re-embed path
    // -----------------------------------------------------------------------

    async fn reindex_one(
        &self,
        source: SourceType,
        source_ref: &str,
        text: String,
        summary: &mut IndexSummary,
    ) {
        match self.reindex_ref(source, source_ref, vec![text]).await {
            Ok(added) => {
                summary.refs_indexed += 1;
                summary.chunks_added += added;
            }
            Err(e) => {
                tracing::warn!(source = %source, source_ref, error = %e, "failed to index entry");
                summary.errors += 1;
            }
        }
    }

    /// Replace every chunk for a ref: stale embeddings and chunks go first,
    /// then each new chunk row is inserted and its embedding stored under
    /// the same id.
    async fn reindex_ref(
        &self,
        source: SourceType,
        source_ref: &str,
        chunks: Vec<String>,
    ) -> Result<usize, RagError> {
        self.store.delete_chunks_for_ref(source, source_ref).await?;
        if chunks.is_empty() {
            return Ok(0);
        }
        let vectors = self.provider.embed(&chunks).await?;
        if vectors.len() != chunks.len() {
            return Err(RagError::Provider(format!(
                "provider returned {} vectors for {} chunks",
                vectors.len(),
                chunks.len()
            )));
        }
        let total = chunks.len();
        for (ordinal, (chunk, embedding)) in chunks.into_iter().zip(vectors).enumerate() {
            let id = self
                .store
                .insert_chunk(
                    source,
                    source_ref,
                    &chunk,
                    serde_json::json!({ "ordinal": ordinal, "of": total }),
                )
                .await?;
            vector::insert_embedding(&self.store, id, &embedding).await?;
        }
        Ok(total)
    }
}

fn matches_source(path: &Path, source: SourceType) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    match source {
        SourceType::Markdown => ext.eq_ignore_ascii_case("md"),
        SourceType::Codefile => CODE_EXTENSIONS.iter().any(|c| ext.eq_ignore_ascii_case(c)),
        _ => false,
    }
}

fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::StaticProvider;
    use fm_core::store::vector_available;
    use fm_core::types::Task;

    async fn indexer_in(dir: &Path) -> RagIndexer {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        crate::vector::ensure_dimension(&store, 16).await.unwrap();
        RagIndexer::new(
            store,
            Arc::new(StaticProvider::new(16)),
            dir.to_path_buf(),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn markdown_files_are_indexed_once() {
        if !vector_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("README.md"), "# Title\n\nBody text.").unwrap();

        let indexer = indexer_in(dir.path()).await;
        let first = indexer.index_pass().await.unwrap();
        assert_eq!(first.refs_indexed, 1);
        assert!(first.chunks_added >= 1);

        // Unchanged file: hash matches, nothing to do.
        let second = indexer.index_pass().await.unwrap();
        assert_eq!(second.refs_indexed, 0);
    }

    #[tokio::test]
    async fn changed_file_is_reembedded() {
        if !vector_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.md");
        std::fs::write(&path, "# One\n\nfirst version").unwrap();

        let indexer = indexer_in(dir.path()).await;
        indexer.index_pass().await.unwrap();
        let before = indexer.store.chunk_count().await.unwrap();

        std::fs::write(&path, "# One\n\nsecond version with more words").unwrap();
        let pass = indexer.index_pass().await.unwrap();
        assert_eq!(pass.refs_indexed, 1);

        // Old chunks replaced, not accumulated.
        let after = indexer.store.chunk_count().await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn tasks_follow_the_watermark() {
        if !vector_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let indexer = indexer_in(dir.path()).await;
        indexer.store.insert_task(&Task::new("t1", "Fix the parser", "admin")).await.unwrap();

        let pass = indexer.index_pass().await.unwrap();
        assert_eq!(pass.refs_indexed, 1);

        // Watermark now ahead of the row: second pass skips it.
        let pass = indexer.index_pass().await.unwrap();
        assert_eq!(pass.refs_indexed, 0);

        // Touching the task pulls it back in.
        let mut task = indexer.store.get_task("t1").await.unwrap().unwrap();
        task.description = "updated".into();
        indexer.store.update_task(&task).await.unwrap();
        let pass = indexer.index_pass().await.unwrap();
        assert_eq!(pass.refs_indexed, 1);
    }

    #[tokio::test]
    async fn skip_dirs_are_ignored() {
        if !vector_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git").join("internal.md"), "# hidden").unwrap();
        std::fs::write(dir.path().join("visible.md"), "# seen").unwrap();

        let indexer = indexer_in(dir.path()).await;
        let pass = indexer.index_pass().await.unwrap();
        assert_eq!(pass.refs_indexed, 1);
    }

    #[test]
    fn source_matching() {
        assert!(matches_source(Path::new("a/b.md"), SourceType::Markdown));
        assert!(!matches_source(Path::new("a/b.rs"), SourceType::Markdown));
        assert!(matches_source(Path::new("a/b.rs"), SourceType::Codefile));
        assert!(!matches_source(Path::new("Makefile"), SourceType::Codefile));
    }
}
