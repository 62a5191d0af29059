use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use fm_core::auth::{mint_token, Auth};
use fm_core::config::ServerConfig;
use fm_core::store::{CoreError, Store};
use fm_core::types::{Agent, AgentKind, AgentStatus, BACKGROUND_CAPABILITY};
use fm_mux::{agent_session_name, sanitize_session_name, Multiplexer};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("create_agent requires at least one unassigned task id")]
    NoTasks,
    #[error("agent id '{0}' already exists (or collides after sanitization)")]
    DuplicateAgent(String),
    #[error("agent '{agent_id}' is {status}, not a relaunchable state")]
    NotRelaunchable { agent_id: String, status: AgentStatus },
    #[error("agent '{0}' is not a background agent")]
    NotBackground(String),
}

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

/// Pauses in the multiplexer setup sequence. The defaults match what the
/// attached assistants tolerate; tests zero them out.
#[derive(Debug, Clone, Copy)]
pub struct ManagerTiming {
    /// Pause between consecutive setup lines (welcome, cd, register).
    pub setup_pause: Duration,
    /// Pause between launching the CLI and firing the worker prompt.
    pub launch_pause: Duration,
}

impl Default for ManagerTiming {
    fn default() -> Self {
        Self {
            setup_pause: Duration::from_secs(1),
            launch_pause: Duration::from_secs(4),
        }
    }
}

impl ManagerTiming {
    pub fn instant() -> Self {
        Self {
            setup_pause: Duration::ZERO,
            launch_pause: Duration::ZERO,
        }
    }
}

// ---------------------------------------------------------------------------
// Parameters / outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CreateAgentParams {
    pub agent_id: String,
    pub capabilities: Vec<String>,
    pub task_ids: Vec<String>,
    pub working_directory: Option<String>,
}

/// Result of a creation or relaunch. `launch_error` carries any
/// multiplexer failure: the agent row is authoritative and stays either
/// way, and a later audit reconciles the session side.
#[derive(Debug)]
pub struct LaunchOutcome {
    pub agent: Agent,
    pub session_name: String,
    pub launch_error: Option<String>,
}

#[derive(Debug)]
pub struct TerminateOutcome {
    pub agent_id: String,
    pub released_tasks: Vec<String>,
    pub kill_error: Option<String>,
}

#[derive(Debug)]
pub struct RelaunchOutcome {
    pub agent: Agent,
    pub session_name: String,
    pub previous_status: AgentStatus,
    pub launch_error: Option<String>,
}

const COLOR_PALETTE: [&str; 8] = [
    "cyan", "magenta", "green", "yellow", "blue", "red", "bright_cyan", "bright_magenta",
];

// ---------------------------------------------------------------------------
// AgentManager
// ---------------------------------------------------------------------------

/// Lifecycle state machine for worker and background agents:
/// created → active → {failed, completed, cancelled, paused, terminated},
/// with relaunch bringing any dormant or terminated agent back to active.
pub struct AgentManager {
    store: Arc<Store>,
    auth: Arc<Auth>,
    mux: Arc<dyn Multiplexer>,
    config: ServerConfig,
    timing: ManagerTiming,
    /// agent_id → session name. Cache only; audits rebuild it.
    sessions: Mutex<HashMap<String, String>>,
    color_cursor: AtomicUsize,
}

impl AgentManager {
    pub fn new(
        store: Arc<Store>,
        auth: Arc<Auth>,
        mux: Arc<dyn Multiplexer>,
        config: ServerConfig,
    ) -> Self {
        Self {
            store,
            auth,
            mux,
            config,
            timing: ManagerTiming::default(),
            sessions: Mutex::new(HashMap::new()),
            color_cursor: AtomicUsize::new(0),
        }
    }

    pub fn with_timing(mut self, timing: ManagerTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    fn next_color(&self) -> String {
        let idx = self.color_cursor.fetch_add(1, Ordering::Relaxed);
        COLOR_PALETTE[idx % COLOR_PALETTE.len()].to_string()
    }

    /// Session name for an agent, preferring the cache over recomputation.
    pub fn session_for(&self, agent_id: &str) -> String {
        self.sessions
            .lock()
            .expect("session cache lock")
            .get(agent_id)
            .cloned()
            .unwrap_or_else(|| agent_session_name(agent_id, self.auth.admin_token()))
    }

    pub(crate) fn cache_session(&self, agent_id: &str, session: &str) {
        self.sessions
            .lock()
            .expect("session cache lock")
            .insert(agent_id.to_string(), session.to_string());
    }

    pub(crate) fn uncache_session(&self, agent_id: &str) {
        self.sessions.lock().expect("session cache lock").remove(agent_id);
    }

    pub(crate) fn cached_sessions(&self) -> HashMap<String, String> {
        self.sessions.lock().expect("session cache lock").clone()
    }

    pub(crate) fn mux(&self) -> &Arc<dyn Multiplexer> {
        &self.mux
    }

    pub(crate) fn session_suffix(&self) -> String {
        self.auth.session_suffix()
    }

    async fn reject_duplicate(&self, agent_id: &str) -> Result<(), AgentError> {
        let sanitized = sanitize_session_name(agent_id);
        if self.sessions.lock().expect("session cache lock").contains_key(agent_id) {
            return Err(AgentError::DuplicateAgent(agent_id.to_string()));
        }
        for existing in self.store.list_agents(None, None).await? {
            if sanitize_session_name(&existing.agent_id) == sanitized {
                return Err(AgentError::DuplicateAgent(agent_id.to_string()));
            }
        }
        Ok(())
    }

    fn working_directory(&self, requested: Option<String>) -> String {
        requested.unwrap_or_else(|| self.config.project_dir.to_string_lossy().into_owned())
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Create a worker: insert the agent row and reassign its tasks in one
    /// transaction, then set up the multiplexer session. Session failures
    /// do not roll the record back.
    pub async fn create_agent(&self, params: CreateAgentParams) -> Result<LaunchOutcome, AgentError> {
        if params.task_ids.is_empty() {
            return Err(AgentError::NoTasks);
        }
        self.reject_duplicate(&params.agent_id).await?;

        let now = Utc::now();
        let agent = Agent {
            token: mint_token(),
            agent_id: params.agent_id.clone(),
            kind: AgentKind::Worker,
            capabilities: params.capabilities,
            status: AgentStatus::Created,
            current_task: params.task_ids.first().cloned(),
            background_objectives: None,
            working_directory: self.working_directory(params.working_directory),
            color: self.next_color(),
            created_at: now,
            updated_at: now,
            terminated_at: None,
        };

        self.store.create_agent_with_tasks(&agent, &params.task_ids).await?;
        self.store
            .log_action(
                &agent.agent_id,
                "created_agent",
                None,
                Some(serde_json::json!({
                    "assigned_tasks": params.task_ids,
                    "color": agent.color,
                })),
            )
            .await?;
        tracing::info!(agent_id = %agent.agent_id, tasks = params.task_ids.len(), "agent created");

        let prompt = worker_prompt(&agent);
        let (session_name, launch_error) = self.launch(&agent, &prompt).await;
        Ok(LaunchOutcome {
            agent,
            session_name,
            launch_error,
        })
    }

    /// Create a background agent: no task requirement, objectives stored on
    /// the agent row, `background-agent` always present in capabilities.
    pub async fn create_background_agent(
        &self,
        agent_id: &str,
        objectives: Vec<String>,
        mut capabilities: Vec<String>,
        working_directory: Option<String>,
    ) -> Result<LaunchOutcome, AgentError> {
        self.reject_duplicate(agent_id).await?;

        if !capabilities.iter().any(|c| c == BACKGROUND_CAPABILITY) {
            capabilities.push(BACKGROUND_CAPABILITY.to_string());
        }

        let now = Utc::now();
        let agent = Agent {
            token: mint_token(),
            agent_id: agent_id.to_string(),
            kind: AgentKind::Background,
            capabilities,
            status: AgentStatus::Created,
            current_task: None,
            background_objectives: Some(objectives.clone()),
            working_directory: self.working_directory(working_directory),
            color: self.next_color(),
            created_at: now,
            updated_at: now,
            terminated_at: None,
        };

        self.store.insert_agent(&agent).await?;
        self.store
            .log_action(
                agent_id,
                "created_background_agent",
                None,
                Some(serde_json::json!({ "objectives": objectives })),
            )
            .await?;
        tracing::info!(agent_id, objectives = objectives.len(), "background agent created");

        let prompt = background_prompt(&agent);
        let (session_name, launch_error) = self.launch(&agent, &prompt).await;
        Ok(LaunchOutcome {
            agent,
            session_name,
            launch_error,
        })
    }

    /// The shared setup sequence: create the session, walk it through the
    /// welcome / cd / register / launch lines with pauses, wait for the CLI
    /// to come up, then fire the prompt. The record keeps status `created`
    /// either way — the prompt is fire-and-forget, and activation happens
    /// through relaunch or the worker's own lifecycle updates.
    async fn launch(&self, agent: &Agent, prompt: &str) -> (String, Option<String>) {
        let session = agent_session_name(&agent.agent_id, self.auth.admin_token());
        let result = self.run_setup_sequence(agent, &session, prompt).await;
        match result {
            Ok(()) => {
                self.cache_session(&agent.agent_id, &session);
                (session, None)
            }
            Err(e) => {
                tracing::warn!(agent_id = %agent.agent_id, error = %e, "multiplexer setup failed; agent record kept");
                (session, Some(e))
            }
        }
    }

    /// Flip an agent to active once its assistant has demonstrably picked
    /// up work (or an operator confirms it).
    pub async fn mark_active(&self, agent_id: &str) -> Result<(), AgentError> {
        self.store.update_agent_status(agent_id, AgentStatus::Active).await?;
        Ok(())
    }

    async fn run_setup_sequence(
        &self,
        agent: &Agent,
        session: &str,
        prompt: &str,
    ) -> Result<(), String> {
        let mux = &self.mux;
        let wd = PathBuf::from(&agent.working_directory);
        mux.create_session(session, &wd).await.map_err(|e| e.to_string())?;

        mux.send_command(session, &format!("echo 'Agent {} session initialized'", agent.agent_id))
            .await
            .map_err(|e| e.to_string())?;
        tokio::time::sleep(self.timing.setup_pause).await;

        mux.send_command(session, &format!("cd \"{}\"", agent.working_directory))
            .await
            .map_err(|e| e.to_string())?;
        tokio::time::sleep(self.timing.setup_pause).await;

        if let Some(cli) = self.config.cli_agent() {
            let register = cli.register_command.replace("{url}", &self.config.mcp_url());
            mux.send_command(session, &register).await.map_err(|e| e.to_string())?;
            tokio::time::sleep(self.timing.setup_pause).await;

            mux.send_command(session, &cli.launch_command).await.map_err(|e| e.to_string())?;
        }
        tokio::time::sleep(self.timing.launch_pause).await;

        // Fire-and-forget: handing the prompt to the multiplexer is the
        // success condition, not the assistant acting on it.
        mux.send_prompt(session, prompt).await.map_err(|e| e.to_string())?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Termination
    // -----------------------------------------------------------------------

    pub async fn terminate_agent(&self, agent_id: &str) -> Result<TerminateOutcome, AgentError> {
        let released = self.store.terminate_agent_txn(agent_id).await?;
        self.store
            .log_action(
                agent_id,
                "terminated_agent",
                None,
                Some(serde_json::json!({ "released_tasks": released })),
            )
            .await?;
        tracing::info!(agent_id, released = released.len(), "agent terminated");

        let session = self.session_for(agent_id);
        let kill_error = match self.mux.kill_session(&session).await {
            Ok(()) => None,
            Err(e) => Some(e.to_string()),
        };
        self.uncache_session(agent_id);

        Ok(TerminateOutcome {
            agent_id: agent_id.to_string(),
            released_tasks: released,
            kill_error,
        })
    }

    pub async fn terminate_background_agent(
        &self,
        agent_id: &str,
    ) -> Result<TerminateOutcome, AgentError> {
        let agent = self
            .store
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| CoreError::AgentNotFound(agent_id.to_string()))?;
        if !agent.is_background() {
            return Err(AgentError::NotBackground(agent_id.to_string()));
        }
        self.terminate_agent(agent_id).await
    }

    // -----------------------------------------------------------------------
    // Relaunch
    // -----------------------------------------------------------------------

    /// Bring a dormant or terminated agent back to active: optionally mint
    /// a fresh token, clear the session, and send a new prompt.
    pub async fn relaunch_agent(
        &self,
        agent_id: &str,
        generate_new_token: bool,
        custom_prompt: Option<String>,
    ) -> Result<RelaunchOutcome, AgentError> {
        let mut agent = self
            .store
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| CoreError::AgentNotFound(agent_id.to_string()))?;
        if !agent.status.is_relaunchable() {
            return Err(AgentError::NotRelaunchable {
                agent_id: agent_id.to_string(),
                status: agent.status,
            });
        }
        let previous_status = agent.status;

        if generate_new_token {
            agent.token = mint_token();
            self.store.set_agent_token(agent_id, &agent.token).await?;
        }
        self.store.update_agent_status(agent_id, AgentStatus::Active).await?;
        agent.status = AgentStatus::Active;
        self.store
            .log_action(
                agent_id,
                "relaunch_agent",
                None,
                Some(serde_json::json!({
                    "previous_status": previous_status.to_string(),
                    "new_token": generate_new_token,
                })),
            )
            .await?;

        let session = agent_session_name(agent_id, self.auth.admin_token());
        let prompt = custom_prompt.unwrap_or_else(|| worker_prompt(&agent));
        let launch_error = match self.relaunch_session(&agent, &session, &prompt).await {
            Ok(()) => {
                self.cache_session(agent_id, &session);
                None
            }
            Err(e) => {
                tracing::warn!(agent_id, error = %e, "relaunch session delivery failed");
                Some(e)
            }
        };

        Ok(RelaunchOutcome {
            agent,
            session_name: session,
            previous_status,
            launch_error,
        })
    }

    async fn relaunch_session(
        &self,
        agent: &Agent,
        session: &str,
        prompt: &str,
    ) -> Result<(), String> {
        let exists = self.mux.session_exists(session).await.map_err(|e| e.to_string())?;
        if !exists {
            let wd = PathBuf::from(&agent.working_directory);
            self.mux.create_session(session, &wd).await.map_err(|e| e.to_string())?;
        }
        self.mux.send_command(session, "clear").await.map_err(|e| e.to_string())?;
        tokio::time::sleep(self.timing.setup_pause).await;
        self.mux.send_prompt(session, prompt).await.map_err(|e| e.to_string())?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

fn worker_prompt(agent: &Agent) -> String {
    format!(
        "You are {} - Agent Token: {}. Start working on your assigned tasks.",
        agent.agent_id, agent.token
    )
}

fn background_prompt(agent: &Agent) -> String {
    let objectives = agent
        .background_objectives
        .as_deref()
        .unwrap_or(&[])
        .iter()
        .enumerate()
        .map(|(i, o)| format!("{}. {}", i + 1, o))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "You are {} - Agent Token: {}. Work autonomously on these objectives: {}",
        agent.agent_id, agent.token, objectives
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{manager_with, seed_tasks};
    use fm_mux::testing::{MuxEvent, RecordingMux};

    #[tokio::test]
    async fn create_agent_full_sequence() {
        let mux = Arc::new(RecordingMux::new());
        let manager = manager_with(mux.clone()).await;
        seed_tasks(&manager, &["t_alpha", "t_beta"]).await;

        let outcome = manager
            .create_agent(CreateAgentParams {
                agent_id: "worker-1".into(),
                capabilities: vec!["rust".into()],
                task_ids: vec!["t_alpha".into(), "t_beta".into()],
                working_directory: None,
            })
            .await
            .unwrap();

        assert!(outcome.launch_error.is_none());
        assert_eq!(outcome.session_name, "worker_1-cdef");
        assert_eq!(outcome.agent.status, AgentStatus::Created);
        assert_eq!(outcome.agent.token.len(), 32);
        assert_eq!(outcome.agent.current_task.as_deref(), Some("t_alpha"));

        // Setup lines land in order, the prompt last.
        let commands = mux.commands_sent_to("worker_1-cdef");
        assert!(commands[0].contains("session initialized"));
        assert!(commands[1].starts_with("cd "));
        assert!(commands[2].contains("/mcp"));
        let prompts = mux.prompts_sent_to("worker_1-cdef");
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("You are worker-1"));
        assert!(prompts[0].contains(&outcome.agent.token));

        let actions = manager.store().list_actions("worker-1", 10).await.unwrap();
        let created = actions.iter().find(|a| a.action_type == "created_agent").unwrap();
        assert_eq!(
            created.details.as_ref().unwrap()["assigned_tasks"],
            serde_json::json!(["t_alpha", "t_beta"])
        );
    }

    #[tokio::test]
    async fn create_requires_tasks() {
        let manager = manager_with(Arc::new(RecordingMux::new())).await;
        let err = manager
            .create_agent(CreateAgentParams {
                agent_id: "worker-1".into(),
                capabilities: vec![],
                task_ids: vec![],
                working_directory: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::NoTasks));
    }

    #[tokio::test]
    async fn sanitized_collision_is_rejected() {
        let mux = Arc::new(RecordingMux::new());
        let manager = manager_with(mux).await;
        seed_tasks(&manager, &["t1", "t2"]).await;

        manager
            .create_agent(CreateAgentParams {
                agent_id: "worker.1".into(),
                capabilities: vec![],
                task_ids: vec!["t1".into()],
                working_directory: None,
            })
            .await
            .unwrap();

        // "worker:1" sanitizes to the same session name as "worker.1".
        let err = manager
            .create_agent(CreateAgentParams {
                agent_id: "worker:1".into(),
                capabilities: vec![],
                task_ids: vec!["t2".into()],
                working_directory: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::DuplicateAgent(_)));
    }

    #[tokio::test]
    async fn mux_failure_keeps_agent_record() {
        let mux = Arc::new(RecordingMux::failing_creates());
        let manager = manager_with(mux).await;
        seed_tasks(&manager, &["t1"]).await;

        let outcome = manager
            .create_agent(CreateAgentParams {
                agent_id: "worker-1".into(),
                capabilities: vec![],
                task_ids: vec!["t1".into()],
                working_directory: None,
            })
            .await
            .unwrap();

        assert!(outcome.launch_error.is_some());
        // The record is authoritative: row exists, status still created.
        let agent = manager.store().get_agent("worker-1").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Created);
        let task = manager.store().get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.assigned_to.as_deref(), Some("worker-1"));
    }

    #[tokio::test]
    async fn terminate_releases_and_kills() {
        let mux = Arc::new(RecordingMux::new());
        let manager = manager_with(mux.clone()).await;
        seed_tasks(&manager, &["t1", "t2"]).await;
        manager
            .create_agent(CreateAgentParams {
                agent_id: "worker-1".into(),
                capabilities: vec![],
                task_ids: vec!["t1".into(), "t2".into()],
                working_directory: None,
            })
            .await
            .unwrap();

        let outcome = manager.terminate_agent("worker-1").await.unwrap();
        assert_eq!(outcome.released_tasks.len(), 2);
        assert!(outcome.kill_error.is_none());
        assert!(mux.events().iter().any(|e| matches!(e, MuxEvent::Killed { name } if name == "worker_1-cdef")));

        let agent = manager.store().get_agent("worker-1").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Terminated);
    }

    #[tokio::test]
    async fn relaunch_from_failed() {
        let mux = Arc::new(RecordingMux::new());
        let manager = manager_with(mux.clone()).await;
        seed_tasks(&manager, &["t1"]).await;
        manager
            .create_agent(CreateAgentParams {
                agent_id: "worker-3".into(),
                capabilities: vec![],
                task_ids: vec!["t1".into()],
                working_directory: None,
            })
            .await
            .unwrap();
        manager.store().update_agent_status("worker-3", AgentStatus::Failed).await.unwrap();

        let outcome = manager.relaunch_agent("worker-3", false, None).await.unwrap();
        assert_eq!(outcome.previous_status, AgentStatus::Failed);
        assert_eq!(outcome.agent.status, AgentStatus::Active);
        assert!(outcome.launch_error.is_none());

        let commands = mux.commands_sent_to("worker_3-cdef");
        assert_eq!(commands.last().map(String::as_str), Some("clear"));
        assert_eq!(mux.prompts_sent_to("worker_3-cdef").len(), 2);

        let actions = manager.store().list_actions("worker-3", 10).await.unwrap();
        let relaunch = actions.iter().find(|a| a.action_type == "relaunch_agent").unwrap();
        assert_eq!(relaunch.details.as_ref().unwrap()["previous_status"], "failed");
    }

    #[tokio::test]
    async fn relaunch_rejects_active_agent() {
        let mux = Arc::new(RecordingMux::new());
        let manager = manager_with(mux).await;
        seed_tasks(&manager, &["t1"]).await;
        manager
            .create_agent(CreateAgentParams {
                agent_id: "worker-1".into(),
                capabilities: vec![],
                task_ids: vec!["t1".into()],
                working_directory: None,
            })
            .await
            .unwrap();
        manager.mark_active("worker-1").await.unwrap();

        let err = manager.relaunch_agent("worker-1", false, None).await.unwrap_err();
        assert!(matches!(err, AgentError::NotRelaunchable { .. }));

        // Freshly created (prompt pending) agents are not relaunchable either.
        seed_tasks(&manager, &["t2"]).await;
        manager
            .create_agent(CreateAgentParams {
                agent_id: "worker-2".into(),
                capabilities: vec![],
                task_ids: vec!["t2".into()],
                working_directory: None,
            })
            .await
            .unwrap();
        let err = manager.relaunch_agent("worker-2", false, None).await.unwrap_err();
        assert!(matches!(err, AgentError::NotRelaunchable { .. }));
    }

    #[tokio::test]
    async fn background_agent_carries_capability_tag() {
        let mux = Arc::new(RecordingMux::new());
        let manager = manager_with(mux.clone()).await;

        let outcome = manager
            .create_background_agent(
                "indexer",
                vec!["keep the docs index fresh".into()],
                vec![],
                None,
            )
            .await
            .unwrap();

        assert!(outcome.agent.is_background());
        assert!(outcome.agent.capabilities.contains(&BACKGROUND_CAPABILITY.to_string()));
        assert_eq!(
            outcome.agent.background_objectives.as_ref().unwrap()[0],
            "keep the docs index fresh"
        );
        let prompts = mux.prompts_sent_to(&outcome.session_name);
        assert!(prompts[0].contains("objectives"));

        // And a worker cannot be terminated through the background path.
        seed_tasks(&manager, &["t1"]).await;
        manager
            .create_agent(CreateAgentParams {
                agent_id: "worker-1".into(),
                capabilities: vec![],
                task_ids: vec!["t1".into()],
                working_directory: None,
            })
            .await
            .unwrap();
        let err = manager.terminate_background_agent("worker-1").await.unwrap_err();
        assert!(matches!(err, AgentError::NotBackground(_)));
    }
}
