use chrono::{DateTime, Utc};

use super::{ts_from_sql, ts_to_sql, CoreError, Store};
use crate::types::AgentAction;

impl Store {
    /// Append one row to the audit log. Returns the stored timestamp so
    /// callers can correlate the action with other rows written in the
    /// same operation.
    pub async fn log_action(
        &self,
        agent_id: &str,
        action_type: &str,
        task_id: Option<&str>,
        details: Option<serde_json::Value>,
    ) -> Result<DateTime<Utc>, CoreError> {
        self.log_action_at(agent_id, action_type, task_id, details, Utc::now()).await
    }

    /// [`Store::log_action`] with an explicit timestamp, for callers that
    /// must correlate the action with another row written at the same
    /// instant (assistance requests).
    pub async fn log_action_at(
        &self,
        agent_id: &str,
        action_type: &str,
        task_id: Option<&str>,
        details: Option<serde_json::Value>,
        at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, CoreError> {
        let agent_id = agent_id.to_string();
        let action_type = action_type.to_string();
        let task_id = task_id.map(|t| t.to_string());
        let stamp = ts_to_sql(&at);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO agent_actions (agent_id, action_type, task_id, timestamp, details) \
                     VALUES (?1,?2,?3,?4,?5)",
                    rusqlite::params![
                        agent_id,
                        action_type,
                        task_id,
                        stamp,
                        details.as_ref().map(|d| d.to_string()),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(at)
    }

    /// Most recent actions for one agent, newest first.
    pub async fn list_actions(
        &self,
        agent_id: &str,
        limit: u32,
    ) -> Result<Vec<AgentAction>, CoreError> {
        let agent_id = agent_id.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, agent_id, action_type, task_id, timestamp, details \
                     FROM agent_actions WHERE agent_id = ?1 \
                     ORDER BY timestamp DESC, id DESC LIMIT ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![agent_id, limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_action(row)?);
                }
                Ok(out)
            })
            .await?)
    }

    /// Whether the agent has any logged action newer than `since`. Drives
    /// the audit's staleness judgement for terminated-but-live sessions.
    pub async fn has_recent_activity(
        &self,
        agent_id: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let agent_id = agent_id.to_string();
        let since = ts_to_sql(&since);
        Ok(self
            .conn
            .call(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM agent_actions WHERE agent_id = ?1 AND timestamp > ?2",
                    rusqlite::params![agent_id, since],
                    |r| r.get(0),
                )?;
                Ok(count > 0)
            })
            .await?)
    }
}

fn row_to_action(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentAction> {
    let timestamp: String = row.get(4)?;
    let details: Option<String> = row.get(5)?;
    Ok(AgentAction {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        action_type: row.get(2)?,
        task_id: row.get(3)?,
        timestamp: ts_from_sql(&timestamp),
        details: details.map(|raw| serde_json::from_str(&raw).expect("valid details json")),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
