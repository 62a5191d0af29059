use chrono::Utc;

use super::{enum_from_sql, enum_to_sql, list_from_sql, list_to_sql, ts_from_sql, ts_to_sql, CoreError, Store};
use crate::types::{Agent, AgentKind, AgentStatus, TaskStatus};

const AGENT_COLS: &str = "agent_id, token, kind, capabilities, status, current_task, \
     background_objectives, working_directory, color, created_at, updated_at, terminated_at";

impl Store {
    /// Insert a single agent row. Background agents take this path; worker
    /// creation goes through [`Store::create_agent_with_tasks`] so the task
    /// reassignment lands in the same transaction.
    pub async fn insert_agent(&self, agent: &Agent) -> Result<(), CoreError> {
        let agent = agent.clone();
        self.conn
            .call(move |conn| {
                let existing: Option<String> = conn
                    .query_row(
                        "SELECT agent_id FROM agents WHERE agent_id = ?1",
                        rusqlite::params![agent.agent_id],
                        |r| r.get(0),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                if existing.is_some() {
                    return Ok(Err(CoreError::AgentExists(agent.agent_id.clone())));
                }
                insert_agent_row(conn, &agent)?;
                Ok(Ok(()))
            })
            .await?
    }

    /// Worker creation transaction: reject duplicate ids, verify every task
    /// exists and is unassigned, reassign them, insert the agent with
    /// `current_task` pointing at the first task. Any failure aborts the
    /// whole transaction.
    pub async fn create_agent_with_tasks(
        &self,
        agent: &Agent,
        task_ids: &[String],
    ) -> Result<(), CoreError> {
        let agent = agent.clone();
        let task_ids: Vec<String> = task_ids.to_vec();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let dup: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM agents WHERE agent_id = ?1",
                    rusqlite::params![agent.agent_id],
                    |r| r.get(0),
                )?;
                if dup > 0 {
                    return Ok(Err(CoreError::AgentExists(agent.agent_id.clone())));
                }

                for task_id in &task_ids {
                    let row: Option<Option<String>> = tx
                        .query_row(
                            "SELECT assigned_to FROM tasks WHERE task_id = ?1",
                            rusqlite::params![task_id],
                            |r| r.get(0),
                        )
                        .map(Some)
                        .or_else(|e| match e {
                            rusqlite::Error::QueryReturnedNoRows => Ok(None),
                            other => Err(other),
                        })?;
                    match row {
                        None => return Ok(Err(CoreError::TaskNotFound(task_id.clone()))),
                        Some(Some(owner)) => {
                            return Ok(Err(CoreError::TaskAlreadyAssigned {
                                task_id: task_id.clone(),
                                owner,
                            }));
                        }
                        Some(None) => {}
                    }
                }

                let mut agent = agent;
                agent.current_task = task_ids.first().cloned();
                insert_agent_row(&tx, &agent)?;

                let now = ts_to_sql(&Utc::now());
                for task_id in &task_ids {
                    tx.execute(
                        "UPDATE tasks SET assigned_to = ?1, updated_at = ?2 WHERE task_id = ?3",
                        rusqlite::params![agent.agent_id, now, task_id],
                    )?;
                }

                tx.commit()?;
                Ok(Ok(()))
            })
            .await?
    }

    pub async fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>, CoreError> {
        let agent_id = agent_id.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {AGENT_COLS} FROM agents WHERE agent_id = ?1"
                ))?;
                let mut rows = stmt.query(rusqlite::params![agent_id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_agent(row)?)),
                    None => Ok(None),
                }
            })
            .await?)
    }

    pub async fn get_agent_by_token(&self, token: &str) -> Result<Option<Agent>, CoreError> {
        let token = token.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare(&format!("SELECT {AGENT_COLS} FROM agents WHERE token = ?1"))?;
                let mut rows = stmt.query(rusqlite::params![token])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_agent(row)?)),
                    None => Ok(None),
                }
            })
            .await?)
    }

    pub async fn list_agents(
        &self,
        status: Option<AgentStatus>,
        limit: Option<u32>,
    ) -> Result<Vec<Agent>, CoreError> {
        Ok(self
            .conn
            .call(move |conn| {
                let limit = limit.unwrap_or(u32::MAX);
                let mut out = Vec::new();
                match status {
                    Some(status) => {
                        let mut stmt = conn.prepare(&format!(
                            "SELECT {AGENT_COLS} FROM agents WHERE status = ?1 \
                             ORDER BY created_at LIMIT ?2"
                        ))?;
                        let mut rows =
                            stmt.query(rusqlite::params![enum_to_sql(&status), limit])?;
                        while let Some(row) = rows.next()? {
                            out.push(row_to_agent(row)?);
                        }
                    }
                    None => {
                        let mut stmt = conn.prepare(&format!(
                            "SELECT {AGENT_COLS} FROM agents ORDER BY created_at LIMIT ?1"
                        ))?;
                        let mut rows = stmt.query(rusqlite::params![limit])?;
                        while let Some(row) = rows.next()? {
                            out.push(row_to_agent(row)?);
                        }
                    }
                }
                Ok(out)
            })
            .await?)
    }

    pub async fn list_agents_by_kind(&self, kind: AgentKind) -> Result<Vec<Agent>, CoreError> {
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {AGENT_COLS} FROM agents WHERE kind = ?1 ORDER BY created_at"
                ))?;
                let mut rows = stmt.query(rusqlite::params![enum_to_sql(&kind)])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_agent(row)?);
                }
                Ok(out)
            })
            .await?)
    }

    /// Update an agent's status, stamping `updated_at`.
    pub async fn update_agent_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
    ) -> Result<(), CoreError> {
        let agent_id = agent_id.to_string();
        self.conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE agents SET status = ?1, updated_at = ?2 WHERE agent_id = ?3",
                    rusqlite::params![enum_to_sql(&status), ts_to_sql(&Utc::now()), agent_id],
                )?;
                if changed == 0 {
                    return Ok(Err(CoreError::AgentNotFound(agent_id)));
                }
                Ok(Ok(()))
            })
            .await?
    }

    pub async fn set_agent_token(&self, agent_id: &str, token: &str) -> Result<(), CoreError> {
        let agent_id = agent_id.to_string();
        let token = token.to_string();
        self.conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE agents SET token = ?1, updated_at = ?2 WHERE agent_id = ?3",
                    rusqlite::params![token, ts_to_sql(&Utc::now()), agent_id],
                )?;
                if changed == 0 {
                    return Ok(Err(CoreError::AgentNotFound(agent_id)));
                }
                Ok(Ok(()))
            })
            .await?
    }

    pub async fn set_current_task(
        &self,
        agent_id: &str,
        task_id: Option<String>,
    ) -> Result<(), CoreError> {
        let agent_id = agent_id.to_string();
        self.conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE agents SET current_task = ?1, updated_at = ?2 WHERE agent_id = ?3",
                    rusqlite::params![task_id, ts_to_sql(&Utc::now()), agent_id],
                )?;
                if changed == 0 {
                    return Ok(Err(CoreError::AgentNotFound(agent_id)));
                }
                Ok(Ok(()))
            })
            .await?
    }

    /// Termination transaction: mark the agent terminated, clear its
    /// current task, and hand every task it owned back to the pool as
    /// unassigned + pending. Returns the ids of the released tasks.
    pub async fn terminate_agent_txn(&self, agent_id: &str) -> Result<Vec<String>, CoreError> {
        let agent_id = agent_id.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let exists: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM agents WHERE agent_id = ?1",
                    rusqlite::params![agent_id],
                    |r| r.get(0),
                )?;
                if exists == 0 {
                    return Ok(Err(CoreError::AgentNotFound(agent_id)));
                }

                let mut released = Vec::new();
                {
                    let mut stmt =
                        tx.prepare("SELECT task_id FROM tasks WHERE assigned_to = ?1")?;
                    let mut rows = stmt.query(rusqlite::params![agent_id])?;
                    while let Some(row) = rows.next()? {
                        released.push(row.get::<_, String>(0)?);
                    }
                }

                let now = ts_to_sql(&Utc::now());
                tx.execute(
                    "UPDATE tasks SET assigned_to = NULL, status = ?1, updated_at = ?2 \
                     WHERE assigned_to = ?3",
                    rusqlite::params![enum_to_sql(&TaskStatus::Pending), now, agent_id],
                )?;
                tx.execute(
                    "UPDATE agents SET status = ?1, current_task = NULL, \
                     terminated_at = ?2, updated_at = ?2 WHERE agent_id = ?3",
                    rusqlite::params![enum_to_sql(&AgentStatus::Terminated), now, agent_id],
                )?;

                tx.commit()?;
                Ok(Ok(released))
            })
            .await?
    }

    pub async fn agent_count(&self) -> Result<i64, CoreError> {
        Ok(self
            .conn
            .call(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM agents", [], |r| r.get(0))?))
            .await?)
    }
}

fn insert_agent_row(conn: &rusqlite::Connection, agent: &Agent) -> rusqlite::Result<()> {
    conn.execute(
        &format!("INSERT INTO agents ({AGENT_COLS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)"),
        rusqlite::params![
            agent.agent_id,
            agent.token,
            enum_to_sql(&agent.kind),
            list_to_sql(&agent.capabilities),
            enum_to_sql(&agent.status),
            agent.current_task,
            agent
                .background_objectives
                .as_ref()
                .map(|objs| list_to_sql(objs)),
            agent.working_directory,
            agent.color,
            ts_to_sql(&agent.created_at),
            ts_to_sql(&agent.updated_at),
            agent.terminated_at.as_ref().map(ts_to_sql),
        ],
    )?;
    Ok(())
}

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<Agent> {
    let kind: String = row.get(2)?;
    let capabilities: String = row.get(3)?;
    let status: String = row.get(4)?;
    let objectives: Option<String> = row.get(6)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;
    let terminated_at: Option<String> = row.get(11)?;

    Ok(Agent {
        agent_id: row.get(0)?,
        token: row.get(1)?,
        kind: enum_from_sql(&kind),
        capabilities: list_from_sql(&capabilities),
        status: enum_from_sql(&status),
        current_task: row.get(5)?,
        background_objectives: objectives.map(|raw| list_from_sql(&raw)),
        working_directory: row.get(7)?,
        color: row.get(8)?,
        created_at: ts_from_sql(&created_at),
        updated_at: ts_from_sql(&updated_at),
        terminated_at: terminated_at.map(|raw| ts_from_sql(&raw)),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Task;

    fn worker(agent_id: &str) -> Agent {
        let now = Utc::now();
        Agent {
            token: format!("{agent_id}-token-0123456789abcdef"),
            agent_id: agent_id.to_string(),
            kind: AgentKind::Worker,
            capabilities: vec!["rust".into()],
            status: AgentStatus::Created,
            current_task: None,
            background_objectives: None,
            working_directory: "/work".into(),
            color: "cyan".into(),
            created_at: now,
            updated_at: now,
            terminated_at: None,
        }
    }

    #[tokio::test]
    async fn create_with_tasks_assigns_in_order() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_task(&Task::new("t_alpha", "Alpha", "admin")).await.unwrap();
        store.insert_task(&Task::new("t_beta", "Beta", "admin")).await.unwrap();

        store
            .create_agent_with_tasks(&worker("worker-1"), &["t_alpha".into(), "t_beta".into()])
            .await
            .unwrap();

        let agent = store.get_agent("worker-1").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Created);
        assert_eq!(agent.current_task.as_deref(), Some("t_alpha"));
        for id in ["t_alpha", "t_beta"] {
            let task = store.get_task(id).await.unwrap().unwrap();
            assert_eq!(task.assigned_to.as_deref(), Some("worker-1"));
        }
    }

    #[tokio::test]
    async fn create_rejects_assigned_task_without_side_effects() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_task(&Task::new("t_gamma", "Gamma", "admin")).await.unwrap();
        store
            .create_agent_with_tasks(&worker("worker-1"), &["t_gamma".into()])
            .await
            .unwrap();

        let err = store
            .create_agent_with_tasks(&worker("worker-2"), &["t_gamma".into()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already assigned"));
        assert!(store.get_agent("worker-2").await.unwrap().is_none());
        let task = store.get_task("t_gamma").await.unwrap().unwrap();
        assert_eq!(task.assigned_to.as_deref(), Some("worker-1"));
    }

    #[tokio::test]
    async fn duplicate_agent_id_rejected() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_agent(&worker("worker-1")).await.unwrap();
        let mut dup = worker("worker-1");
        dup.token = "different-token".into();
        let err = store.insert_agent(&dup).await.unwrap_err();
        assert!(matches!(err, CoreError::AgentExists(_)));
    }

    #[tokio::test]
    async fn terminate_releases_tasks() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_task(&Task::new("t_a", "A", "admin")).await.unwrap();
        store.insert_task(&Task::new("t_b", "B", "admin")).await.unwrap();
        store
            .create_agent_with_tasks(&worker("worker-1"), &["t_a".into(), "t_b".into()])
            .await
            .unwrap();

        let released = store.terminate_agent_txn("worker-1").await.unwrap();
        assert_eq!(released.len(), 2);

        let agent = store.get_agent("worker-1").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Terminated);
        assert!(agent.terminated_at.is_some());
        assert!(agent.current_task.is_none());
        for id in ["t_a", "t_b"] {
            let task = store.get_task(id).await.unwrap().unwrap();
            assert!(task.assigned_to.is_none());
            assert_eq!(task.status, TaskStatus::Pending);
        }
    }

    #[tokio::test]
    async fn lookup_by_token() {
        let store = Store::open_in_memory().await.unwrap();
        let agent = worker("worker-9");
        store.insert_agent(&agent).await.unwrap();
        let found = store.get_agent_by_token(&agent.token).await.unwrap().unwrap();
        assert_eq!(found.agent_id, "worker-9");
        assert!(store.get_agent_by_token("nope").await.unwrap().is_none());
    }
}
