use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use fm_core::store::{CoreError, Store};
use fm_core::types::FileLock;

// ---------------------------------------------------------------------------
// Path normalization
// ---------------------------------------------------------------------------

/// Resolve a raw path to the absolute, lexically-normalized form used as
/// the lock key. Relative paths resolve against the requesting agent's
/// working directory. Purely lexical: the file need not exist.
pub fn normalize_path(raw: &str, working_directory: &str) -> String {
    let path = Path::new(raw);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        Path::new(working_directory).join(path)
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized.to_string_lossy().into_owned()
}

// ---------------------------------------------------------------------------
// LockCheck
// ---------------------------------------------------------------------------

/// Answer to "may this agent edit this path right now".
#[derive(Debug, Clone)]
pub struct LockCheck {
    pub filepath: String,
    pub can_edit: bool,
    pub locked_by: Option<FileLock>,
}

// ---------------------------------------------------------------------------
// FileLockArbiter
// ---------------------------------------------------------------------------

/// At-most-one-owner lock per normalized path, with history. Every acquire
/// and release also lands in the audit log.
pub struct FileLockArbiter {
    store: Arc<Store>,
}

impl FileLockArbiter {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub async fn acquire(
        &self,
        raw_path: &str,
        agent_id: &str,
        working_directory: &str,
        notes: Option<String>,
    ) -> Result<String, CoreError> {
        let filepath = normalize_path(raw_path, working_directory);
        self.store.acquire_lock_txn(&filepath, agent_id, notes).await?;
        self.store
            .log_action(
                agent_id,
                "file_in_use",
                None,
                Some(serde_json::json!({ "filepath": filepath })),
            )
            .await?;
        tracing::debug!(agent_id, filepath = %filepath, "file lock acquired");
        Ok(filepath)
    }

    pub async fn release(
        &self,
        raw_path: &str,
        agent_id: &str,
        working_directory: &str,
    ) -> Result<String, CoreError> {
        let filepath = normalize_path(raw_path, working_directory);
        self.store.release_lock_txn(&filepath, agent_id).await?;
        self.store
            .log_action(
                agent_id,
                "file_released",
                None,
                Some(serde_json::json!({ "filepath": filepath })),
            )
            .await?;
        tracing::debug!(agent_id, filepath = %filepath, "file lock released");
        Ok(filepath)
    }

    /// Check without mutating. `agent_id` decides whose holds count as
    /// "can edit" (an agent may always edit a path it holds itself).
    pub async fn check(
        &self,
        raw_path: &str,
        agent_id: Option<&str>,
        working_directory: &str,
    ) -> Result<LockCheck, CoreError> {
        let filepath = normalize_path(raw_path, working_directory);
        let holder = self.store.active_lock(&filepath).await?;
        let can_edit = match (&holder, agent_id) {
            (None, _) => true,
            (Some(lock), Some(asker)) => lock.agent_id == asker,
            (Some(_), None) => false,
        };
        Ok(LockCheck {
            filepath,
            can_edit,
            locked_by: holder,
        })
    }

    pub async fn history(&self, raw_path: &str, working_directory: &str) -> Result<Vec<FileLock>, CoreError> {
        let filepath = normalize_path(raw_path, working_directory);
        self.store.lock_history(&filepath, 50).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
