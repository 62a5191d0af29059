use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use fm_core::store::{CoreError, Store, TaskFilter};
use fm_core::types::{Task, TaskPriority, TaskStatus};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("dependency from '{task_id}' on '{depends_on}' would close a cycle")]
    CycleDetected { task_id: String, depends_on: String },
    #[error("invalid status transition {from} → {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },
    #[error("task '{0}' is completed and can no longer be updated")]
    TerminalTask(String),
    #[error("agent '{agent_id}' does not own task '{task_id}'")]
    NotOwner { task_id: String, agent_id: String },
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

/// Who is driving a mutation. Admin may update any task; a worker only its
/// own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskActor {
    Admin,
    Worker(String),
}

impl TaskActor {
    pub fn name(&self) -> &str {
        match self {
            TaskActor::Admin => "admin",
            TaskActor::Worker(id) => id,
        }
    }
}

// ---------------------------------------------------------------------------
// Creation parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct CreateTaskParams {
    /// Stable id; generated (`task_<hex8>`) when absent.
    pub task_id: Option<String>,
    pub title: String,
    pub description: String,
    pub assigned_to: Option<String>,
    pub priority: Option<TaskPriority>,
    pub parent_task: Option<String>,
    pub depends_on_tasks: Vec<String>,
}

// ---------------------------------------------------------------------------
// TaskEngine
// ---------------------------------------------------------------------------

/// The task graph engine: CRUD plus the hierarchy and dependency
/// invariants. All persistence goes through store transactions; the engine
/// owns the cross-row checks (cycles, ownership, transition rules).
pub struct TaskEngine {
    store: Arc<Store>,
}

impl TaskEngine {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub async fn create_task(&self, params: CreateTaskParams, created_by: &str) -> Result<Task, TaskError> {
        let task_id = params
            .task_id
            .unwrap_or_else(|| format!("task_{}", &Uuid::new_v4().simple().to_string()[..8]));

        if let Some(agent_id) = &params.assigned_to {
            if self.store.get_agent(agent_id).await?.is_none() {
                return Err(CoreError::AgentNotFound(agent_id.clone()).into());
            }
        }
        for dep in &params.depends_on_tasks {
            if self.store.get_task(dep).await?.is_none() {
                return Err(CoreError::TaskNotFound(dep.clone()).into());
            }
        }

        let now = Utc::now();
        let task = Task {
            task_id,
            title: params.title,
            description: params.description,
            assigned_to: params.assigned_to,
            created_by: created_by.to_string(),
            status: TaskStatus::Pending,
            priority: params.priority.unwrap_or(TaskPriority::Medium),
            parent_task: params.parent_task,
            child_tasks: Vec::new(),
            // A fresh node has no dependents, so existing deps cannot cycle.
            depends_on_tasks: params.depends_on_tasks,
            notes: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        self.store.insert_task(&task).await?;
        Ok(task)
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<Task>, TaskError> {
        Ok(self.store.get_task(task_id).await?)
    }

    pub async fn list(&self, filter: TaskFilter) -> Result<Vec<Task>, TaskError> {
        Ok(self.store.list_tasks(filter).await?)
    }

    pub async fn search(&self, query: &str) -> Result<Vec<Task>, TaskError> {
        Ok(self.store.search_tasks(query).await?)
    }

    pub async fn assign(&self, task_id: &str, agent_id: &str) -> Result<(), TaskError> {
        self.store.assign_task_txn(task_id, agent_id).await?;
        self.store
            .log_action(agent_id, "task_assigned", Some(task_id), None)
            .await?;
        Ok(())
    }

    /// Status transition with the full rule set: completed is terminal,
    /// transitions follow the table, workers may only touch their own
    /// tasks. An optional note is appended with the change.
    pub async fn update_status(
        &self,
        task_id: &str,
        new_status: TaskStatus,
        actor: &TaskActor,
        note: Option<String>,
    ) -> Result<Task, TaskError> {
        let mut task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| CoreError::TaskNotFound(task_id.to_string()))?;

        if task.status.is_terminal() {
            return Err(TaskError::TerminalTask(task_id.to_string()));
        }
        if let TaskActor::Worker(agent_id) = actor {
            if task.assigned_to.as_deref() != Some(agent_id.as_str()) {
                return Err(TaskError::NotOwner {
                    task_id: task_id.to_string(),
                    agent_id: agent_id.clone(),
                });
            }
        }
        if !task.status.can_transition_to(new_status) {
            return Err(TaskError::InvalidTransition {
                from: task.status,
                to: new_status,
            });
        }

        task.status = new_status;
        if let Some(body) = note {
            task.notes.push(serde_json::json!({
                "author": actor.name(),
                "body": body,
                "created_at": Utc::now().to_rfc3339(),
            }));
        }
        self.store.update_task(&task).await?;
        self.store
            .log_action(
                actor.name(),
                "task_status_updated",
                Some(task_id),
                Some(serde_json::json!({ "status": new_status.to_string() })),
            )
            .await?;
        Ok(task)
    }

    pub async fn append_note(
        &self,
        task_id: &str,
        author: &str,
        body: &str,
    ) -> Result<(), TaskError> {
        self.store
            .append_task_note(
                task_id,
                serde_json::json!({
                    "author": author,
                    "body": body,
                    "created_at": Utc::now().to_rfc3339(),
                }),
            )
            .await?;
        Ok(())
    }

    /// Add a dependency edge after proving it closes no cycle: DFS from the
    /// new dependency along `depends_on_tasks`; reaching `task_id` means
    /// the edge would complete a loop.
    pub async fn add_dependency(&self, task_id: &str, depends_on: &str) -> Result<(), TaskError> {
        let mut task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| CoreError::TaskNotFound(task_id.to_string()))?;
        if self.store.get_task(depends_on).await?.is_none() {
            return Err(CoreError::TaskNotFound(depends_on.to_string()).into());
        }
        if task_id == depends_on || self.reaches(depends_on, task_id).await? {
            return Err(TaskError::CycleDetected {
                task_id: task_id.to_string(),
                depends_on: depends_on.to_string(),
            });
        }
        if !task.depends_on_tasks.iter().any(|d| d == depends_on) {
            task.depends_on_tasks.push(depends_on.to_string());
            self.store.update_task(&task).await?;
        }
        Ok(())
    }

    /// Place a task under a parent; rejected when it already has another.
    pub async fn set_parent(&self, task_id: &str, parent_id: &str) -> Result<(), TaskError> {
        self.store.link_parent_txn(task_id, parent_id).await?;
        Ok(())
    }

    /// Admin-only removal (role enforced at the tool boundary).
    pub async fn delete(&self, task_id: &str) -> Result<(), TaskError> {
        self.store.delete_task_txn(task_id).await?;
        Ok(())
    }

    async fn reaches(&self, from: &str, target: &str) -> Result<bool, TaskError> {
        let mut stack = vec![from.to_string()];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == target {
                return Ok(true);
            }
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(task) = self.store.get_task(&current).await? {
                stack.extend(task.depends_on_tasks.iter().cloned());
            }
        }
        Ok(false)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use fm_core::types::{Agent, AgentKind, AgentStatus};

    async fn engine() -> TaskEngine {
        TaskEngine::new(Arc::new(Store::open_in_memory().await.unwrap()))
    }

    async fn seed_agent(engine: &TaskEngine, agent_id: &str) {
        let now = Utc::now();
        engine
            .store
            .insert_agent(&Agent {
                token: format!("{agent_id}-token"),
                agent_id: agent_id.to_string(),
                kind: AgentKind::Worker,
                capabilities: vec![],
                status: AgentStatus::Active,
                current_task: None,
                background_objectives: None,
                working_directory: "/work".into(),
                color: "cyan".into(),
                created_at: now,
                updated_at: now,
                terminated_at: None,
            })
            .await
            .unwrap();
    }

    fn params(title: &str) -> CreateTaskParams {
        CreateTaskParams {
            title: title.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_generates_stable_id() {
        let engine = engine().await;
        let task = engine.create_task(params("Build"), "admin").await.unwrap();
        assert!(task.task_id.starts_with("task_"));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, TaskPriority::Medium);
    }

    #[tokio::test]
    async fn dependency_cycle_rejected() {
        let engine = engine().await;
        for id in ["a", "b", "c"] {
            engine
                .create_task(
                    CreateTaskParams { task_id: Some(id.into()), ..params(id) },
                    "admin",
                )
                .await
                .unwrap();
        }
        engine.add_dependency("b", "a").await.unwrap();
        engine.add_dependency("c", "b").await.unwrap();

        // a → c would close a ← b ← c ← a.
        let err = engine.add_dependency("a", "c").await.unwrap_err();
        assert!(matches!(err, TaskError::CycleDetected { .. }));

        // Self-dependency is the degenerate cycle.
        let err = engine.add_dependency("a", "a").await.unwrap_err();
        assert!(matches!(err, TaskError::CycleDetected { .. }));
    }

    #[tokio::test]
    async fn completed_is_terminal() {
        let engine = engine().await;
        seed_agent(&engine, "worker-1").await;
        let task = engine
            .create_task(
                CreateTaskParams {
                    task_id: Some("t".into()),
                    assigned_to: Some("worker-1".into()),
                    ..params("T")
                },
                "admin",
            )
            .await
            .unwrap();

        let actor = TaskActor::Worker("worker-1".into());
        engine.update_status(&task.task_id, TaskStatus::InProgress, &actor, None).await.unwrap();
        engine.update_status(&task.task_id, TaskStatus::Completed, &actor, None).await.unwrap();

        let err = engine
            .update_status(&task.task_id, TaskStatus::Pending, &TaskActor::Admin, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::TerminalTask(_)));
    }

    #[tokio::test]
    async fn worker_cannot_touch_foreign_task() {
        let engine = engine().await;
        seed_agent(&engine, "worker-1").await;
        seed_agent(&engine, "worker-2").await;
        engine
            .create_task(
                CreateTaskParams {
                    task_id: Some("t".into()),
                    assigned_to: Some("worker-1".into()),
                    ..params("T")
                },
                "admin",
            )
            .await
            .unwrap();

        let err = engine
            .update_status("t", TaskStatus::Cancelled, &TaskActor::Worker("worker-2".into()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::NotOwner { .. }));

        // Admin may cancel anything.
        engine.update_status("t", TaskStatus::Cancelled, &TaskActor::Admin, None).await.unwrap();
    }

    #[tokio::test]
    async fn invalid_transition_rejected() {
        let engine = engine().await;
        engine
            .create_task(CreateTaskParams { task_id: Some("t".into()), ..params("T") }, "admin")
            .await
            .unwrap();
        let err = engine
            .update_status("t", TaskStatus::Completed, &TaskActor::Admin, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TaskError::InvalidTransition { from: TaskStatus::Pending, to: TaskStatus::Completed }
        ));
    }

    #[tokio::test]
    async fn status_note_is_appended() {
        let engine = engine().await;
        engine
            .create_task(CreateTaskParams { task_id: Some("t".into()), ..params("T") }, "admin")
            .await
            .unwrap();
        let task = engine
            .update_status("t", TaskStatus::InProgress, &TaskActor::Admin, Some("starting".into()))
            .await
            .unwrap();
        assert_eq!(task.notes.len(), 1);
        assert_eq!(task.notes[0]["body"], "starting");
        assert_eq!(task.notes[0]["author"], "admin");
    }

    #[tokio::test]
    async fn assignment_to_missing_agent_rejected_at_create() {
        let engine = engine().await;
        let err = engine
            .create_task(
                CreateTaskParams { assigned_to: Some("ghost".into()), ..params("T") },
                "admin",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Core(CoreError::AgentNotFound(_))));
    }
}
