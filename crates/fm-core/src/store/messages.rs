use super::{enum_from_sql, enum_to_sql, ts_from_sql, ts_to_sql, CoreError, Store};
use crate::types::AgentMessage;

const MSG_COLS: &str =
    "message_id, sender_id, recipient_id, content, message_type, priority, timestamp, delivered, read";

impl Store {
    pub async fn insert_message(&self, msg: &AgentMessage) -> Result<(), CoreError> {
        let msg = msg.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO agent_messages ({MSG_COLS}) \
                         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)"
                    ),
                    rusqlite::params![
                        msg.message_id,
                        msg.sender_id,
                        msg.recipient_id,
                        msg.content,
                        enum_to_sql(&msg.message_type),
                        enum_to_sql(&msg.priority),
                        ts_to_sql(&msg.timestamp),
                        msg.delivered as i64,
                        msg.read as i64,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn mark_message_delivered(&self, message_id: &str) -> Result<(), CoreError> {
        let message_id = message_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE agent_messages SET delivered = 1 WHERE message_id = ?1",
                    rusqlite::params![message_id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Fetch a recipient's messages, oldest first. With `unread_only` the
    /// listing is restricted to unread rows; `mark_read` stamps everything
    /// returned in the same transaction so a poll cannot double-deliver.
    pub async fn get_messages(
        &self,
        recipient_id: &str,
        unread_only: bool,
        limit: u32,
        mark_read: bool,
    ) -> Result<Vec<AgentMessage>, CoreError> {
        let recipient_id = recipient_id.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let sql = if unread_only {
                    format!(
                        "SELECT {MSG_COLS} FROM agent_messages \
                         WHERE recipient_id = ?1 AND read = 0 ORDER BY timestamp LIMIT ?2"
                    )
                } else {
                    format!(
                        "SELECT {MSG_COLS} FROM agent_messages \
                         WHERE recipient_id = ?1 ORDER BY timestamp LIMIT ?2"
                    )
                };
                let mut out = Vec::new();
                {
                    let mut stmt = tx.prepare(&sql)?;
                    let mut rows = stmt.query(rusqlite::params![recipient_id, limit])?;
                    while let Some(row) = rows.next()? {
                        out.push(row_to_message(row)?);
                    }
                }
                if mark_read {
                    for msg in &out {
                        tx.execute(
                            "UPDATE agent_messages SET read = 1 WHERE message_id = ?1",
                            rusqlite::params![msg.message_id],
                        )?;
                    }
                }
                tx.commit()?;
                Ok(out)
            })
            .await?)
    }

    pub async fn message_count(&self) -> Result<i64, CoreError> {
        Ok(self
            .conn
            .call(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM agent_messages", [], |r| r.get(0))?)
            })
            .await?)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentMessage> {
    let message_type: String = row.get(4)?;
    let priority: String = row.get(5)?;
    let timestamp: String = row.get(6)?;
    let delivered: i64 = row.get(7)?;
    let read: i64 = row.get(8)?;
    Ok(AgentMessage {
        message_id: row.get(0)?,
        sender_id: row.get(1)?,
        recipient_id: row.get(2)?,
        content: row.get(3)?,
        message_type: enum_from_sql(&message_type),
        priority: enum_from_sql(&priority),
        timestamp: ts_from_sql(&timestamp),
        delivered: delivered != 0,
        read: read != 0,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MessagePriority, MessageType};
    use chrono::Utc;

    fn message(id: &str, recipient: &str) -> AgentMessage {
        AgentMessage {
            message_id: id.to_string(),
            sender_id: "worker-1".into(),
            recipient_id: recipient.to_string(),
            content: "hello".into(),
            message_type: MessageType::Text,
            priority: MessagePriority::Normal,
            timestamp: Utc::now(),
            delivered: false,
            read: false,
        }
    }

    #[tokio::test]
    async fn poll_marks_read() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_message(&message("m1", "worker-2")).await.unwrap();
        store.insert_message(&message("m2", "worker-2")).await.unwrap();

        let first = store.get_messages("worker-2", true, 50, true).await.unwrap();
        assert_eq!(first.len(), 2);

        let second = store.get_messages("worker-2", true, 50, true).await.unwrap();
        assert!(second.is_empty());

        let all = store.get_messages("worker-2", false, 50, false).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|m| m.read));
    }

    #[tokio::test]
    async fn delivered_flag() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_message(&message("m1", "admin")).await.unwrap();
        store.mark_message_delivered("m1").await.unwrap();
        let msgs = store.get_messages("admin", false, 10, false).await.unwrap();
        assert!(msgs[0].delivered);
    }

    #[tokio::test]
    async fn timestamps_non_decreasing_in_insertion_order() {
        let store = Store::open_in_memory().await.unwrap();
        for i in 0..5 {
            store.insert_message(&message(&format!("m{i}"), "admin")).await.unwrap();
        }
        let msgs = store.get_messages("admin", false, 10, false).await.unwrap();
        for pair in msgs.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }
}
