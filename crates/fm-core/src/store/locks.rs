use chrono::Utc;

use super::{enum_from_sql, ts_from_sql, ts_to_sql, CoreError, Store};
use crate::types::{FileLock, LockState};

const LOCK_COLS: &str = "id, filepath, agent_id, locked_at, released_at, status, notes";

impl Store {
    /// The single `in_use` row for a path, if any.
    pub async fn active_lock(&self, filepath: &str) -> Result<Option<FileLock>, CoreError> {
        let filepath = filepath.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {LOCK_COLS} FROM file_status \
                     WHERE filepath = ?1 AND status = 'in_use'"
                ))?;
                let mut rows = stmt.query(rusqlite::params![filepath])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_lock(row)?)),
                    None => Ok(None),
                }
            })
            .await?)
    }

    /// Acquire transaction. Fails when another agent holds the path; a
    /// stale lock held by the same agent is released first so the table
    /// never carries two `in_use` rows for one path.
    pub async fn acquire_lock_txn(
        &self,
        filepath: &str,
        agent_id: &str,
        notes: Option<String>,
    ) -> Result<i64, CoreError> {
        let filepath = filepath.to_string();
        let agent_id = agent_id.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let holder: Option<String> = tx
                    .query_row(
                        "SELECT agent_id FROM file_status \
                         WHERE filepath = ?1 AND status = 'in_use'",
                        rusqlite::params![filepath],
                        |r| r.get(0),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;

                let now = ts_to_sql(&Utc::now());
                match holder {
                    Some(owner) if owner != agent_id => {
                        return Ok(Err(CoreError::LockHeld { filepath, owner }));
                    }
                    Some(_) => {
                        // Stale lock by the same agent: close it out first.
                        tx.execute(
                            "UPDATE file_status SET status = 'released', released_at = ?1 \
                             WHERE filepath = ?2 AND status = 'in_use'",
                            rusqlite::params![now, filepath],
                        )?;
                    }
                    None => {}
                }

                tx.execute(
                    "INSERT INTO file_status (filepath, agent_id, locked_at, status, notes) \
                     VALUES (?1,?2,?3,'in_use',?4)",
                    rusqlite::params![filepath, agent_id, now, notes],
                )?;
                let id = tx.last_insert_rowid();
                tx.commit()?;
                Ok(Ok(id))
            })
            .await?
    }

    /// Release transaction: errors when the agent holds no active lock on
    /// the path.
    pub async fn release_lock_txn(&self, filepath: &str, agent_id: &str) -> Result<(), CoreError> {
        let filepath = filepath.to_string();
        let agent_id = agent_id.to_string();
        self.conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE file_status SET status = 'released', released_at = ?1 \
                     WHERE filepath = ?2 AND agent_id = ?3 AND status = 'in_use'",
                    rusqlite::params![ts_to_sql(&Utc::now()), filepath, agent_id],
                )?;
                if changed == 0 {
                    return Ok(Err(CoreError::LockNotHeld { filepath, agent_id }));
                }
                Ok(Ok(()))
            })
            .await?
    }

    /// Lock history for a path, newest first.
    pub async fn lock_history(&self, filepath: &str, limit: u32) -> Result<Vec<FileLock>, CoreError> {
        let filepath = filepath.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {LOCK_COLS} FROM file_status \
                     WHERE filepath = ?1 ORDER BY id DESC LIMIT ?2"
                ))?;
                let mut rows = stmt.query(rusqlite::params![filepath, limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_lock(row)?);
                }
                Ok(out)
            })
            .await?)
    }

    /// All active locks held by one agent.
    pub async fn locks_held_by(&self, agent_id: &str) -> Result<Vec<FileLock>, CoreError> {
        let agent_id = agent_id.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {LOCK_COLS} FROM file_status \
                     WHERE agent_id = ?1 AND status = 'in_use' ORDER BY id"
                ))?;
                let mut rows = stmt.query(rusqlite::params![agent_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_lock(row)?);
                }
                Ok(out)
            })
            .await?)
    }
}

fn row_to_lock(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileLock> {
    let locked_at: String = row.get(3)?;
    let released_at: Option<String> = row.get(4)?;
    let status: String = row.get(5)?;
    Ok(FileLock {
        id: row.get(0)?,
        filepath: row.get(1)?,
        agent_id: row.get(2)?,
        locked_at: ts_from_sql(&locked_at),
        released_at: released_at.map(|raw| ts_from_sql(&raw)),
        status: enum_from_sql(&status),
        notes: row.get(6)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn at_most_one_active_lock_per_path() {
        let store = Store::open_in_memory().await.unwrap();
        store.acquire_lock_txn("/p/x.js", "worker-1", None).await.unwrap();

        let err = store.acquire_lock_txn("/p/x.js", "worker-2", None).await.unwrap_err();
        match err {
            CoreError::LockHeld { owner, .. } => assert_eq!(owner, "worker-1"),
            other => panic!("unexpected error: {other}"),
        }

        // Re-acquire by the holder releases the stale row first.
        store.acquire_lock_txn("/p/x.js", "worker-1", Some("retry".into())).await.unwrap();
        let history = store.lock_history("/p/x.js", 10).await.unwrap();
        let active: Vec<_> = history.iter().filter(|l| l.status == LockState::InUse).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].notes.as_deref(), Some("retry"));
    }

    #[tokio::test]
    async fn release_requires_active_lock() {
        let store = Store::open_in_memory().await.unwrap();
        let err = store.release_lock_txn("/p/y.js", "worker-1").await.unwrap_err();
        assert!(matches!(err, CoreError::LockNotHeld { .. }));

        store.acquire_lock_txn("/p/y.js", "worker-1", None).await.unwrap();
        store.release_lock_txn("/p/y.js", "worker-1").await.unwrap();
        assert!(store.active_lock("/p/y.js").await.unwrap().is_none());

        let history = store.lock_history("/p/y.js", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].released_at.is_some());
    }

    #[tokio::test]
    async fn locks_held_by_agent() {
        let store = Store::open_in_memory().await.unwrap();
        store.acquire_lock_txn("/a", "worker-1", None).await.unwrap();
        store.acquire_lock_txn("/b", "worker-1", None).await.unwrap();
        store.acquire_lock_txn("/c", "worker-2", None).await.unwrap();
        assert_eq!(store.locks_held_by("worker-1").await.unwrap().len(), 2);
        assert_eq!(store.locks_held_by("worker-2").await.unwrap().len(), 1);
    }
}
