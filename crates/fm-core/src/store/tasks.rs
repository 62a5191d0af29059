use chrono::Utc;

use super::{enum_from_sql, enum_to_sql, list_from_sql, list_to_sql, ts_from_sql, ts_to_sql, CoreError, Store};
use crate::types::{Task, TaskStatus};

const TASK_COLS: &str = "task_id, title, description, assigned_to, created_by, status, priority, \
     parent_task, child_tasks, depends_on_tasks, notes, created_at, updated_at";

/// Structured filter for task listings. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub assigned_to: Option<String>,
    pub status: Option<TaskStatus>,
    pub parent: Option<String>,
}

impl Store {
    /// Insert a task. When `parent_task` is set the parent must exist and
    /// gains this task in its `child_tasks` list, inside one transaction,
    /// keeping the parent/child relation bidirectional.
    pub async fn insert_task(&self, task: &Task) -> Result<(), CoreError> {
        let task = task.clone();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                if let Some(parent_id) = &task.parent_task {
                    let children: Option<String> = tx
                        .query_row(
                            "SELECT child_tasks FROM tasks WHERE task_id = ?1",
                            rusqlite::params![parent_id],
                            |r| r.get(0),
                        )
                        .map(Some)
                        .or_else(|e| match e {
                            rusqlite::Error::QueryReturnedNoRows => Ok(None),
                            other => Err(other),
                        })?;
                    match children {
                        None => return Ok(Err(CoreError::TaskNotFound(parent_id.clone()))),
                        Some(raw) => {
                            let mut children = list_from_sql(&raw);
                            if !children.contains(&task.task_id) {
                                children.push(task.task_id.clone());
                            }
                            tx.execute(
                                "UPDATE tasks SET child_tasks = ?1, updated_at = ?2 \
                                 WHERE task_id = ?3",
                                rusqlite::params![
                                    list_to_sql(&children),
                                    ts_to_sql(&Utc::now()),
                                    parent_id
                                ],
                            )?;
                        }
                    }
                }

                tx.execute(
                    &format!(
                        "INSERT INTO tasks ({TASK_COLS}) \
                         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)"
                    ),
                    rusqlite::params![
                        task.task_id,
                        task.title,
                        task.description,
                        task.assigned_to,
                        task.created_by,
                        enum_to_sql(&task.status),
                        enum_to_sql(&task.priority),
                        task.parent_task,
                        list_to_sql(&task.child_tasks),
                        list_to_sql(&task.depends_on_tasks),
                        serde_json::to_string(&task.notes).expect("serialize notes"),
                        ts_to_sql(&task.created_at),
                        ts_to_sql(&task.updated_at),
                    ],
                )?;

                tx.commit()?;
                Ok(Ok(()))
            })
            .await?
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>, CoreError> {
        let task_id = task_id.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare(&format!("SELECT {TASK_COLS} FROM tasks WHERE task_id = ?1"))?;
                let mut rows = stmt.query(rusqlite::params![task_id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_task(row)?)),
                    None => Ok(None),
                }
            })
            .await?)
    }

    pub async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>, CoreError> {
        Ok(self
            .conn
            .call(move |conn| {
                let mut sql = format!("SELECT {TASK_COLS} FROM tasks WHERE 1=1");
                let mut params: Vec<Box<dyn rusqlite::ToSql + Send>> = Vec::new();
                if let Some(assignee) = &filter.assigned_to {
                    sql.push_str(&format!(" AND assigned_to = ?{}", params.len() + 1));
                    params.push(Box::new(assignee.clone()));
                }
                if let Some(status) = &filter.status {
                    sql.push_str(&format!(" AND status = ?{}", params.len() + 1));
                    params.push(Box::new(enum_to_sql(status)));
                }
                if let Some(parent) = &filter.parent {
                    sql.push_str(&format!(" AND parent_task = ?{}", params.len() + 1));
                    params.push(Box::new(parent.clone()));
                }
                sql.push_str(" ORDER BY created_at");

                let mut stmt = conn.prepare(&sql)?;
                let param_refs: Vec<&dyn rusqlite::ToSql> =
                    params.iter().map(|p| p.as_ref() as &dyn rusqlite::ToSql).collect();
                let mut rows = stmt.query(param_refs.as_slice())?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_task(row)?);
                }
                Ok(out)
            })
            .await?)
    }

    /// Case-insensitive substring search over id, title, and description.
    pub async fn search_tasks(&self, query: &str) -> Result<Vec<Task>, CoreError> {
        let pattern = format!("%{}%", query.to_lowercase());
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLS} FROM tasks \
                     WHERE lower(task_id) LIKE ?1 OR lower(title) LIKE ?1 \
                        OR lower(description) LIKE ?1 \
                     ORDER BY created_at"
                ))?;
                let mut rows = stmt.query(rusqlite::params![pattern])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_task(row)?);
                }
                Ok(out)
            })
            .await?)
    }

    /// Rewrite every mutable column of a task row, stamping `updated_at`.
    pub async fn update_task(&self, task: &Task) -> Result<(), CoreError> {
        let task = task.clone();
        self.conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE tasks SET title = ?1, description = ?2, assigned_to = ?3, \
                     status = ?4, priority = ?5, parent_task = ?6, child_tasks = ?7, \
                     depends_on_tasks = ?8, notes = ?9, updated_at = ?10 WHERE task_id = ?11",
                    rusqlite::params![
                        task.title,
                        task.description,
                        task.assigned_to,
                        enum_to_sql(&task.status),
                        enum_to_sql(&task.priority),
                        task.parent_task,
                        list_to_sql(&task.child_tasks),
                        list_to_sql(&task.depends_on_tasks),
                        serde_json::to_string(&task.notes).expect("serialize notes"),
                        ts_to_sql(&Utc::now()),
                        task.task_id,
                    ],
                )?;
                if changed == 0 {
                    return Ok(Err(CoreError::TaskNotFound(task.task_id.clone())));
                }
                Ok(Ok(()))
            })
            .await?
    }

    /// Assignment transaction: the task must exist and be unassigned, the
    /// agent must exist.
    pub async fn assign_task_txn(&self, task_id: &str, agent_id: &str) -> Result<(), CoreError> {
        let task_id = task_id.to_string();
        let agent_id = agent_id.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let agent_exists: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM agents WHERE agent_id = ?1",
                    rusqlite::params![agent_id],
                    |r| r.get(0),
                )?;
                if agent_exists == 0 {
                    return Ok(Err(CoreError::AgentNotFound(agent_id)));
                }

                let owner: Option<Option<String>> = tx
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
                match owner {
                    None => return Ok(Err(CoreError::TaskNotFound(task_id))),
                    Some(Some(owner)) => {
                        return Ok(Err(CoreError::TaskAlreadyAssigned { task_id, owner }));
                    }
                    Some(None) => {}
                }

                tx.execute(
                    "UPDATE tasks SET assigned_to = ?1, updated_at = ?2 WHERE task_id = ?3",
                    rusqlite::params![agent_id, ts_to_sql(&Utc::now()), task_id],
                )?;
                tx.commit()?;
                Ok(Ok(()))
            })
            .await?
    }

    /// Append a note object; order of appends is preserved.
    pub async fn append_task_note(
        &self,
        task_id: &str,
        note: serde_json::Value,
    ) -> Result<(), CoreError> {
        let task_id = task_id.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let raw: Option<String> = tx
                    .query_row(
                        "SELECT notes FROM tasks WHERE task_id = ?1",
                        rusqlite::params![task_id],
                        |r| r.get(0),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                let raw = match raw {
                    None => return Ok(Err(CoreError::TaskNotFound(task_id))),
                    Some(raw) => raw,
                };
                let mut notes: Vec<serde_json::Value> =
                    serde_json::from_str(&raw).unwrap_or_default();
                notes.push(note);
                tx.execute(
                    "UPDATE tasks SET notes = ?1, updated_at = ?2 WHERE task_id = ?3",
                    rusqlite::params![
                        serde_json::to_string(&notes).expect("serialize notes"),
                        ts_to_sql(&Utc::now()),
                        task_id
                    ],
                )?;
                tx.commit()?;
                Ok(Ok(()))
            })
            .await?
    }

    /// Link an existing task under a parent. Fails when the child already
    /// names a different parent; re-linking to the same parent is a no-op.
    pub async fn link_parent_txn(&self, child_id: &str, parent_id: &str) -> Result<(), CoreError> {
        let child_id = child_id.to_string();
        let parent_id = parent_id.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let existing: Option<Option<String>> = tx
                    .query_row(
                        "SELECT parent_task FROM tasks WHERE task_id = ?1",
                        rusqlite::params![child_id],
                        |r| r.get(0),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                match existing {
                    None => return Ok(Err(CoreError::TaskNotFound(child_id))),
                    Some(Some(current)) if current == parent_id => return Ok(Ok(())),
                    Some(Some(current)) => {
                        return Ok(Err(CoreError::TaskParentConflict {
                            task_id: child_id,
                            existing_parent: current,
                        }));
                    }
                    Some(None) => {}
                }

                let children: Option<String> = tx
                    .query_row(
                        "SELECT child_tasks FROM tasks WHERE task_id = ?1",
                        rusqlite::params![parent_id],
                        |r| r.get(0),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                let raw = match children {
                    None => return Ok(Err(CoreError::TaskNotFound(parent_id))),
                    Some(raw) => raw,
                };

                let now = ts_to_sql(&Utc::now());
                let mut children = list_from_sql(&raw);
                if !children.contains(&child_id) {
                    children.push(child_id.clone());
                }
                tx.execute(
                    "UPDATE tasks SET child_tasks = ?1, updated_at = ?2 WHERE task_id = ?3",
                    rusqlite::params![list_to_sql(&children), now, parent_id],
                )?;
                tx.execute(
                    "UPDATE tasks SET parent_task = ?1, updated_at = ?2 WHERE task_id = ?3",
                    rusqlite::params![parent_id, now, child_id],
                )?;

                tx.commit()?;
                Ok(Ok(()))
            })
            .await?
    }

    /// Delete transaction: unlink from the parent's child list, orphan any
    /// children (their `parent_task` becomes NULL), then remove the row.
    pub async fn delete_task_txn(&self, task_id: &str) -> Result<(), CoreError> {
        let task_id = task_id.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let parent: Option<Option<String>> = tx
                    .query_row(
                        "SELECT parent_task FROM tasks WHERE task_id = ?1",
                        rusqlite::params![task_id],
                        |r| r.get(0),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                let parent = match parent {
                    None => return Ok(Err(CoreError::TaskNotFound(task_id))),
                    Some(parent) => parent,
                };

                let now = ts_to_sql(&Utc::now());
                if let Some(parent_id) = parent {
                    let raw: String = tx.query_row(
                        "SELECT child_tasks FROM tasks WHERE task_id = ?1",
                        rusqlite::params![parent_id],
                        |r| r.get(0),
                    )?;
                    let children: Vec<String> = list_from_sql(&raw)
                        .into_iter()
                        .filter(|c| c != &task_id)
                        .collect();
                    tx.execute(
                        "UPDATE tasks SET child_tasks = ?1, updated_at = ?2 WHERE task_id = ?3",
                        rusqlite::params![list_to_sql(&children), now, parent_id],
                    )?;
                }

                tx.execute(
                    "UPDATE tasks SET parent_task = NULL, updated_at = ?1 WHERE parent_task = ?2",
                    rusqlite::params![now, task_id],
                )?;
                tx.execute("DELETE FROM tasks WHERE task_id = ?1", rusqlite::params![task_id])?;

                tx.commit()?;
                Ok(Ok(()))
            })
            .await?
    }

    pub async fn task_count(&self) -> Result<i64, CoreError> {
        Ok(self
            .conn
            .call(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM tasks", [], |r| r.get(0))?))
            .await?)
    }
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get(5)?;
    let priority: String = row.get(6)?;
    let child_tasks: String = row.get(8)?;
    let depends_on: String = row.get(9)?;
    let notes: String = row.get(10)?;
    let created_at: String = row.get(11)?;
    let updated_at: String = row.get(12)?;

    Ok(Task {
        task_id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        assigned_to: row.get(3)?,
        created_by: row.get(4)?,
        status: enum_from_sql(&status),
        priority: enum_from_sql(&priority),
        parent_task: row.get(7)?,
        child_tasks: list_from_sql(&child_tasks),
        depends_on_tasks: list_from_sql(&depends_on),
        notes: serde_json::from_str(&notes).expect("valid notes json"),
        created_at: ts_from_sql(&created_at),
        updated_at: ts_from_sql(&updated_at),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parent_child_stay_bidirectional() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_task(&Task::new("root", "Root", "admin")).await.unwrap();

        let mut child = Task::new("leaf", "Leaf", "admin");
        child.parent_task = Some("root".into());
        store.insert_task(&child).await.unwrap();

        let root = store.get_task("root").await.unwrap().unwrap();
        assert_eq!(root.child_tasks, vec!["leaf".to_string()]);

        store.delete_task_txn("leaf").await.unwrap();
        let root = store.get_task("root").await.unwrap().unwrap();
        assert!(root.child_tasks.is_empty());
    }

    #[tokio::test]
    async fn insert_with_missing_parent_fails() {
        let store = Store::open_in_memory().await.unwrap();
        let mut task = Task::new("orphan", "Orphan", "admin");
        task.parent_task = Some("ghost".into());
        let err = store.insert_task(&task).await.unwrap_err();
        assert!(matches!(err, CoreError::TaskNotFound(_)));
        assert!(store.get_task("orphan").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn filtered_listing() {
        let store = Store::open_in_memory().await.unwrap();
        let mut a = Task::new("a", "First", "admin");
        a.status = TaskStatus::InProgress;
        store.insert_task(&a).await.unwrap();
        store.insert_task(&Task::new("b", "Second", "admin")).await.unwrap();

        let pending = store
            .list_tasks(TaskFilter { status: Some(TaskStatus::Pending), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task_id, "b");

        let all = store.list_tasks(TaskFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn substring_search_matches_title_and_description() {
        let store = Store::open_in_memory().await.unwrap();
        let mut t = Task::new("t1", "Fix parser", "admin");
        t.description = "Tokenizer drops trailing newline".into();
        store.insert_task(&t).await.unwrap();
        store.insert_task(&Task::new("t2", "Write docs", "admin")).await.unwrap();

        assert_eq!(store.search_tasks("PARSER").await.unwrap().len(), 1);
        assert_eq!(store.search_tasks("newline").await.unwrap().len(), 1);
        assert_eq!(store.search_tasks("t").await.unwrap().len(), 2);
        assert!(store.search_tasks("zzz").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn notes_preserve_append_order() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_task(&Task::new("t", "T", "admin")).await.unwrap();
        for i in 0..3 {
            store
                .append_task_note("t", serde_json::json!({"body": format!("note {i}")}))
                .await
                .unwrap();
        }
        let task = store.get_task("t").await.unwrap().unwrap();
        let bodies: Vec<String> = task
            .notes
            .iter()
            .map(|n| n["body"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(bodies, vec!["note 0", "note 1", "note 2"]);
    }

    #[tokio::test]
    async fn reparenting_is_rejected() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_task(&Task::new("p1", "P1", "admin")).await.unwrap();
        store.insert_task(&Task::new("p2", "P2", "admin")).await.unwrap();
        store.insert_task(&Task::new("c", "C", "admin")).await.unwrap();

        store.link_parent_txn("c", "p1").await.unwrap();
        // same parent again is a no-op
        store.link_parent_txn("c", "p1").await.unwrap();

        let err = store.link_parent_txn("c", "p2").await.unwrap_err();
        assert!(matches!(err, CoreError::TaskParentConflict { .. }));
        let p1 = store.get_task("p1").await.unwrap().unwrap();
        assert_eq!(p1.child_tasks, vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn assign_requires_existing_agent() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_task(&Task::new("t", "T", "admin")).await.unwrap();
        let err = store.assign_task_txn("t", "ghost").await.unwrap_err();
        assert!(matches!(err, CoreError::AgentNotFound(_)));
    }
}
