use chrono::{DateTime, Utc};

use super::{enum_from_sql, enum_to_sql, ts_from_sql, ts_to_sql, CoreError, Store};
use crate::types::{TransportSessionRecord, TransportStatus};

const SESSION_COLS: &str = "session_id, state, status, last_heartbeat, disconnected_at, \
     grace_period_expires, recovery_attempts";

impl Store {
    pub async fn upsert_session(&self, record: &TransportSessionRecord) -> Result<(), CoreError> {
        let record = record.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO mcp_sessions ({SESSION_COLS}) VALUES (?1,?2,?3,?4,?5,?6,?7) \
                         ON CONFLICT(session_id) DO UPDATE SET \
                            state=excluded.state, status=excluded.status, \
                            last_heartbeat=excluded.last_heartbeat, \
                            disconnected_at=excluded.disconnected_at, \
                            grace_period_expires=excluded.grace_period_expires, \
                            recovery_attempts=excluded.recovery_attempts"
                    ),
                    rusqlite::params![
                        record.session_id,
                        record.state.to_string(),
                        enum_to_sql(&record.status),
                        ts_to_sql(&record.last_heartbeat),
                        record.disconnected_at.as_ref().map(ts_to_sql),
                        record.grace_period_expires.as_ref().map(ts_to_sql),
                        record.recovery_attempts,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_session(
        &self,
        session_id: &str,
    ) -> Result<Option<TransportSessionRecord>, CoreError> {
        let session_id = session_id.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SESSION_COLS} FROM mcp_sessions WHERE session_id = ?1"
                ))?;
                let mut rows = stmt.query(rusqlite::params![session_id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_session(row)?)),
                    None => Ok(None),
                }
            })
            .await?)
    }

    pub async fn touch_session_heartbeat(&self, session_id: &str) -> Result<(), CoreError> {
        let session_id = session_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE mcp_sessions SET last_heartbeat = ?1 WHERE session_id = ?2",
                    rusqlite::params![ts_to_sql(&Utc::now()), session_id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Mark every disconnected session whose grace period has lapsed as
    /// expired. Returns how many rows were flipped.
    pub async fn expire_sessions(&self, now: DateTime<Utc>) -> Result<usize, CoreError> {
        Ok(self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE mcp_sessions SET status = 'expired' \
                     WHERE status = 'disconnected' AND grace_period_expires < ?1",
                    rusqlite::params![ts_to_sql(&now)],
                )?;
                Ok(changed)
            })
            .await?)
    }

    pub async fn delete_expired_sessions(&self) -> Result<usize, CoreError> {
        Ok(self
            .conn
            .call(|conn| {
                let changed = conn.execute("DELETE FROM mcp_sessions WHERE status = 'expired'", [])?;
                Ok(changed)
            })
            .await?)
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<TransportSessionRecord> {
    let state: String = row.get(1)?;
    let status: String = row.get(2)?;
    let last_heartbeat: String = row.get(3)?;
    let disconnected_at: Option<String> = row.get(4)?;
    let grace: Option<String> = row.get(5)?;
    Ok(TransportSessionRecord {
        session_id: row.get(0)?,
        state: serde_json::from_str(&state).expect("valid session state json"),
        status: enum_from_sql(&status),
        last_heartbeat: ts_from_sql(&last_heartbeat),
        disconnected_at: disconnected_at.map(|raw| ts_from_sql(&raw)),
        grace_period_expires: grace.map(|raw| ts_from_sql(&raw)),
        recovery_attempts: row.get(6)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
