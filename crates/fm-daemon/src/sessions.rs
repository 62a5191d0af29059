use std::sync::Arc;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use fm_core::store::{CoreError, Store};
use fm_core::types::{TransportSessionRecord, TransportStatus};
use fm_harness::RpcRequest;

/// Buffered notifications per session before sends start dropping.
const NOTIFY_BUFFER: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Core(#[from] CoreError),
}

// ---------------------------------------------------------------------------
// SessionManager
// ---------------------------------------------------------------------------

/// Per-client transport sessions: a persistence row in the store plus a
/// live SSE channel. Disconnects start the grace period; a client
/// presenting the same session id before expiry is recovered with its
/// state intact.
pub struct SessionManager {
    store: Arc<Store>,
    grace: Duration,
    channels: DashMap<String, mpsc::Sender<RpcRequest>>,
}

impl SessionManager {
    pub fn new(store: Arc<Store>, grace: Duration) -> Self {
        Self {
            store,
            grace,
            channels: DashMap::new(),
        }
    }

    pub fn mint_session_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Ensure a persistence row exists and refresh its heartbeat. An
    /// expired id is reborn as a fresh session rather than resumed.
    pub async fn ensure(&self, session_id: &str) -> Result<TransportSessionRecord, SessionError> {
        let now = Utc::now();
        match self.store.get_session(session_id).await? {
            Some(mut record) if record.status != TransportStatus::Expired => {
                record.last_heartbeat = now;
                if record.status == TransportStatus::Disconnected {
                    record.status = TransportStatus::Recovered;
                    record.recovery_attempts += 1;
                    record.disconnected_at = None;
                    record.grace_period_expires = None;
                    tracing::info!(session_id, attempts = record.recovery_attempts, "session recovered");
                }
                self.store.upsert_session(&record).await?;
                Ok(record)
            }
            _ => {
                let record = TransportSessionRecord {
                    session_id: session_id.to_string(),
                    state: serde_json::json!({}),
                    status: TransportStatus::Active,
                    last_heartbeat: now,
                    disconnected_at: None,
                    grace_period_expires: None,
                    recovery_attempts: 0,
                };
                self.store.upsert_session(&record).await?;
                Ok(record)
            }
        }
    }

    pub async fn touch(&self, session_id: &str) -> Result<(), SessionError> {
        self.store.touch_session_heartbeat(session_id).await?;
        Ok(())
    }

    /// Persist a client-supplied state snapshot for later recovery.
    pub async fn save_state(
        &self,
        session_id: &str,
        state: serde_json::Value,
    ) -> Result<(), SessionError> {
        if let Some(mut record) = self.store.get_session(session_id).await? {
            record.state = state;
            record.last_heartbeat = Utc::now();
            self.store.upsert_session(&record).await?;
        }
        Ok(())
    }

    /// Open (or replace) the SSE channel for a session. The receiver feeds
    /// the event stream; a fresh one supersedes any channel left over from
    /// before a disconnect.
    pub async fn open_channel(
        &self,
        session_id: &str,
    ) -> Result<mpsc::Receiver<RpcRequest>, SessionError> {
        self.ensure(session_id).await?;
        let (tx, rx) = mpsc::channel(NOTIFY_BUFFER);
        self.channels.insert(session_id.to_string(), tx);
        Ok(rx)
    }

    pub fn sender_for(&self, session_id: &str) -> Option<mpsc::Sender<RpcRequest>> {
        self.channels.get(session_id).map(|entry| entry.value().clone())
    }

    /// Transport drop: status → disconnected, grace window armed, channel
    /// torn down. In-flight handlers are unaffected.
    pub async fn mark_disconnected(&self, session_id: &str) -> Result<(), SessionError> {
        self.channels.remove(session_id);
        if let Some(mut record) = self.store.get_session(session_id).await? {
            if record.status == TransportStatus::Active || record.status == TransportStatus::Recovered {
                let now = Utc::now();
                record.status = TransportStatus::Disconnected;
                record.disconnected_at = Some(now);
                record.grace_period_expires = Some(now + self.grace);
                self.store.upsert_session(&record).await?;
                tracing::debug!(session_id, "session disconnected, grace period armed");
            }
        }
        Ok(())
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<TransportSessionRecord>, SessionError> {
        Ok(self.store.get_session(session_id).await?)
    }

    /// Expire lapsed sessions and evict their rows.
    pub async fn sweep(&self) -> Result<usize, SessionError> {
        let expired = self.store.expire_sessions(Utc::now()).await?;
        if expired > 0 {
            self.store.delete_expired_sessions().await?;
            tracing::info!(expired, "expired transport sessions evicted");
        }
        Ok(expired)
    }

    /// Periodic sweep loop; exits on the shutdown signal.
    pub async fn run_sweeper(
        self: Arc<Self>,
        interval: std::time::Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.sweep().await {
                        tracing::warn!(error = %e, "session sweep failed");
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn manager(grace_minutes: i64) -> SessionManager {
        SessionManager::new(
            Arc::new(Store::open_in_memory().await.unwrap()),
            Duration::minutes(grace_minutes),
        )
    }

    #[tokio::test]
    async fn ensure_creates_then_touches() {
        let sessions = manager(10).await;
        let record = sessions.ensure("s1").await.unwrap();
        assert_eq!(record.status, TransportStatus::Active);
        assert_eq!(record.recovery_attempts, 0);

        sessions.touch("s1").await.unwrap();
        assert!(sessions.get("s1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn disconnect_then_recover_within_grace() {
        let sessions = manager(10).await;
        sessions.ensure("s1").await.unwrap();
        sessions.mark_disconnected("s1").await.unwrap();

        let record = sessions.get("s1").await.unwrap().unwrap();
        assert_eq!(record.status, TransportStatus::Disconnected);
        assert!(record.grace_period_expires.is_some());

        // Same id presented again: recovered, attempts counted.
        let record = sessions.ensure("s1").await.unwrap();
        assert_eq!(record.status, TransportStatus::Recovered);
        assert_eq!(record.recovery_attempts, 1);
        assert!(record.disconnected_at.is_none());
    }

    #[tokio::test]
    async fn expired_session_is_reborn_fresh() {
        let sessions = manager(0).await;
        sessions.ensure("s1").await.unwrap();
        sessions.save_state("s1", serde_json::json!({"cursor": 5})).await.unwrap();
        sessions.mark_disconnected("s1").await.unwrap();

        // Grace of zero: the sweep expires and evicts immediately.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(sessions.sweep().await.unwrap(), 1);
        assert!(sessions.get("s1").await.unwrap().is_none());

        let record = sessions.ensure("s1").await.unwrap();
        assert_eq!(record.status, TransportStatus::Active);
        assert_eq!(record.state, serde_json::json!({}));
        assert_eq!(record.recovery_attempts, 0);
    }

    #[tokio::test]
    async fn channel_delivery_and_replacement() {
        let sessions = manager(10).await;
        let mut rx = sessions.open_channel("s1").await.unwrap();
        let tx = sessions.sender_for("s1").unwrap();
        tx.try_send(RpcRequest::notification("notifications/message", None)).unwrap();
        assert_eq!(rx.recv().await.unwrap().method, "notifications/message");

        // Reconnect replaces the channel; the old sender goes stale.
        let _rx2 = sessions.open_channel("s1").await.unwrap();
        let new_tx = sessions.sender_for("s1").unwrap();
        assert!(!new_tx.is_closed());
    }

    #[tokio::test]
    async fn state_snapshot_survives_recovery() {
        let sessions = manager(10).await;
        sessions.ensure("s1").await.unwrap();
        sessions.save_state("s1", serde_json::json!({"conversation": "abc"})).await.unwrap();
        sessions.mark_disconnected("s1").await.unwrap();

        let record = sessions.ensure("s1").await.unwrap();
        assert_eq!(record.status, TransportStatus::Recovered);
        assert_eq!(record.state["conversation"], "abc");
    }
}
