use std::collections::HashSet;

use chrono::{Duration, Utc};
use serde::Serialize;

use fm_core::types::AgentStatus;
use fm_mux::{sanitize_session_name, Multiplexer};

use crate::manager::{AgentError, AgentManager};

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditFix {
    /// Active agent with no live session: marked terminated.
    MarkedTerminated,
    /// Terminated agent with a live, recently active session: session kept,
    /// relaunch suggested.
    KeptLiveSession,
    /// Terminated agent with a live but idle session: session killed.
    KilledStaleSession,
    /// Cache entry whose session is gone: dropped from memory.
    DroppedCacheEntry,
    /// Live session for a non-terminated agent missing from the cache:
    /// adopted into memory.
    AdoptedSession,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditResolution {
    pub agent_id: String,
    pub session: String,
    pub fix: AuditFix,
    pub note: String,
}

#[derive(Debug, Serialize)]
pub struct AuditReport {
    pub agents_checked: usize,
    pub sessions_seen: usize,
    pub resolutions: Vec<AuditResolution>,
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

impl AgentManager {
    /// Structural audit: reconcile agent rows, live sessions carrying this
    /// server's suffix, and the in-memory cache. Terminated agents with
    /// live sessions are killed unconditionally.
    pub async fn audit_sessions(&self) -> Result<AuditReport, AgentError> {
        self.reconcile(None).await
    }

    /// Audit with an activity window: a terminated agent's live session is
    /// kept (relaunch suggested) when the agent acted within the window,
    /// killed otherwise.
    pub async fn smart_audit(&self, activity_window_minutes: i64) -> Result<AuditReport, AgentError> {
        self.reconcile(Some(Duration::minutes(activity_window_minutes))).await
    }

    async fn reconcile(&self, activity_window: Option<Duration>) -> Result<AuditReport, AgentError> {
        let suffix = format!("-{}", self.session_suffix());
        let mut live: HashSet<String> = self
            .mux()
            .list_sessions()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|name| name.ends_with(&suffix))
            .collect();
        let sessions_seen = live.len();
        let agents = self.store().list_agents(None, None).await?;
        let mut resolutions = Vec::new();

        for agent in &agents {
            let session = format!("{}{}", sanitize_session_name(&agent.agent_id), suffix);
            let session_live = live.contains(&session);

            match (agent.status, session_live) {
                (AgentStatus::Active, false) => {
                    self.store().update_agent_status(&agent.agent_id, AgentStatus::Terminated).await?;
                    self.push_resolution(
                        &mut resolutions,
                        &agent.agent_id,
                        &session,
                        AuditFix::MarkedTerminated,
                        "active agent had no live session",
                    )
                    .await?;
                }
                (AgentStatus::Terminated, true) => {
                    let keep = match activity_window {
                        Some(window) => {
                            self.store()
                                .has_recent_activity(&agent.agent_id, Utc::now() - window)
                                .await?
                        }
                        None => false,
                    };
                    if keep {
                        self.push_resolution(
                            &mut resolutions,
                            &agent.agent_id,
                            &session,
                            AuditFix::KeptLiveSession,
                            "recent activity found; consider relaunch_agent",
                        )
                        .await?;
                    } else {
                        if let Err(e) = self.mux().kill_session(&session).await {
                            tracing::warn!(session = %session, error = %e, "failed to kill stale session");
                        }
                        live.remove(&session);
                        self.push_resolution(
                            &mut resolutions,
                            &agent.agent_id,
                            &session,
                            AuditFix::KilledStaleSession,
                            "terminated agent's session was idle",
                        )
                        .await?;
                    }
                }
                _ => {}
            }
        }

        // Cache entries whose session has gone away.
        for (agent_id, session) in self.cached_sessions() {
            if !live.contains(&session) {
                self.uncache_session(&agent_id);
                self.push_resolution(
                    &mut resolutions,
                    &agent_id,
                    &session,
                    AuditFix::DroppedCacheEntry,
                    "cached session no longer exists",
                )
                .await?;
            }
        }

        // Live sessions for non-terminated agents missing from the cache.
        let cached = self.cached_sessions();
        for agent in &agents {
            if agent.status == AgentStatus::Terminated {
                continue;
            }
            let session = format!("{}{}", sanitize_session_name(&agent.agent_id), suffix);
            if live.contains(&session) && !cached.contains_key(&agent.agent_id) {
                self.cache_session(&agent.agent_id, &session);
                self.push_resolution(
                    &mut resolutions,
                    &agent.agent_id,
                    &session,
                    AuditFix::AdoptedSession,
                    "live session adopted into memory",
                )
                .await?;
            }
        }

        tracing::info!(
            agents = agents.len(),
            sessions = sessions_seen,
            fixes = resolutions.len(),
            "audit reconciliation complete"
        );
        Ok(AuditReport {
            agents_checked: agents.len(),
            sessions_seen,
            resolutions,
        })
    }

    async fn push_resolution(
        &self,
        resolutions: &mut Vec<AuditResolution>,
        agent_id: &str,
        session: &str,
        fix: AuditFix,
        note: &str,
    ) -> Result<(), AgentError> {
        let action_type = match fix {
            AuditFix::MarkedTerminated => "audit_marked_terminated",
            AuditFix::KeptLiveSession => "audit_kept_session",
            AuditFix::KilledStaleSession => "audit_killed_session",
            AuditFix::DroppedCacheEntry => "audit_dropped_cache_entry",
            AuditFix::AdoptedSession => "audit_adopted_session",
        };
        self.store()
            .log_action(
                agent_id,
                action_type,
                None,
                Some(serde_json::json!({ "session": session, "note": note })),
            )
            .await?;
        resolutions.push(AuditResolution {
            agent_id: agent_id.to_string(),
            session: session.to_string(),
            fix,
            note: note.to_string(),
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::CreateAgentParams;
    use crate::test_support::{manager_with, seed_tasks};
    use fm_mux::testing::RecordingMux;
    use std::sync::Arc;

    async fn spawn_worker(manager: &AgentManager, id: &str, task: &str) {
        manager
            .create_agent(CreateAgentParams {
                agent_id: id.into(),
                capabilities: vec![],
                task_ids: vec![task.into()],
                working_directory: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn active_agent_without_session_is_terminated() {
        let mux = Arc::new(RecordingMux::new());
        let manager = manager_with(mux.clone()).await;
        seed_tasks(&manager, &["t1"]).await;
        spawn_worker(&manager, "worker-1", "t1").await;
        manager.mark_active("worker-1").await.unwrap();

        // The session vanishes out from under us.
        mux.kill_session("worker_1-cdef").await.unwrap();

        let report = manager.audit_sessions().await.unwrap();
        let fix = report.resolutions.iter().find(|r| r.agent_id == "worker-1").unwrap();
        assert_eq!(fix.fix, AuditFix::MarkedTerminated);

        let agent = manager.store().get_agent("worker-1").await.unwrap().unwrap();
        assert_eq!(agent.status, fm_core::types::AgentStatus::Terminated);
    }

    #[tokio::test]
    async fn stale_terminated_session_is_killed() {
        let mux = Arc::new(RecordingMux::new());
        let manager = manager_with(mux.clone()).await;
        seed_tasks(&manager, &["t1"]).await;
        spawn_worker(&manager, "worker-1", "t1").await;

        // Terminate in the store but leave the session running.
        manager
            .store()
            .update_agent_status("worker-1", fm_core::types::AgentStatus::Terminated)
            .await
            .unwrap();

        let report = manager.audit_sessions().await.unwrap();
        let fix = report
            .resolutions
            .iter()
            .find(|r| r.fix == AuditFix::KilledStaleSession)
            .unwrap();
        assert_eq!(fix.agent_id, "worker-1");
        assert!(!mux.session_exists("worker_1-cdef").await.unwrap());
    }

    #[tokio::test]
    async fn smart_audit_keeps_recently_active_session() {
        let mux = Arc::new(RecordingMux::new());
        let manager = manager_with(mux.clone()).await;
        seed_tasks(&manager, &["t1"]).await;
        spawn_worker(&manager, "worker-1", "t1").await;
        manager
            .store()
            .update_agent_status("worker-1", fm_core::types::AgentStatus::Terminated)
            .await
            .unwrap();
        // Fresh activity within the window.
        manager.store().log_action("worker-1", "status_report", None, None).await.unwrap();

        let report = manager.smart_audit(30).await.unwrap();
        let fix = report
            .resolutions
            .iter()
            .find(|r| r.fix == AuditFix::KeptLiveSession)
            .unwrap();
        assert!(fix.note.contains("relaunch"));
        assert!(mux.session_exists("worker_1-cdef").await.unwrap());
    }

    #[tokio::test]
    async fn cache_is_rebuilt_from_sessions() {
        let mux = Arc::new(RecordingMux::new());
        let manager = manager_with(mux.clone()).await;
        seed_tasks(&manager, &["t1"]).await;
        spawn_worker(&manager, "worker-1", "t1").await;

        // Simulate a restart: cache lost, session still alive.
        manager.uncache_session("worker-1");
        let report = manager.audit_sessions().await.unwrap();
        assert!(report.resolutions.iter().any(|r| r.fix == AuditFix::AdoptedSession));
        assert_eq!(manager.session_for("worker-1"), "worker_1-cdef");

        // And the reverse: cache entry without a session gets dropped.
        manager.cache_session("ghost", "ghost-cdef");
        let report = manager.audit_sessions().await.unwrap();
        assert!(report
            .resolutions
            .iter()
            .any(|r| r.fix == AuditFix::DroppedCacheEntry && r.agent_id == "ghost"));
    }

    #[tokio::test]
    async fn foreign_sessions_are_ignored() {
        let mux = Arc::new(RecordingMux::new());
        let manager = manager_with(mux.clone()).await;
        mux.seed_session("someone-elses-abcd");

        let report = manager.audit_sessions().await.unwrap();
        assert_eq!(report.sessions_seen, 0);
        assert!(report.resolutions.is_empty());
    }
}
