use chrono::Utc;

use super::{ts_from_sql, ts_to_sql, CoreError, Store};
use crate::types::ContextEntry;

// The three key→value containers share one shape: project_context,
// file_metadata, and admin_config differ only in table and key column.

impl Store {
    pub async fn upsert_context(
        &self,
        key: &str,
        value: serde_json::Value,
        description: Option<String>,
        updated_by: &str,
    ) -> Result<(), CoreError> {
        self.upsert_kv("project_context", "context_key", key, value, description, updated_by)
            .await
    }

    pub async fn get_context(&self, key: &str) -> Result<Option<ContextEntry>, CoreError> {
        self.get_kv("project_context", "context_key", key).await
    }

    pub async fn list_context(&self) -> Result<Vec<ContextEntry>, CoreError> {
        self.list_kv("project_context", "context_key").await
    }

    pub async fn upsert_file_metadata(
        &self,
        filepath: &str,
        value: serde_json::Value,
        description: Option<String>,
        updated_by: &str,
    ) -> Result<(), CoreError> {
        self.upsert_kv("file_metadata", "filepath", filepath, value, description, updated_by)
            .await
    }

    pub async fn get_file_metadata(&self, filepath: &str) -> Result<Option<ContextEntry>, CoreError> {
        self.get_kv("file_metadata", "filepath", filepath).await
    }

    pub async fn list_file_metadata(&self) -> Result<Vec<ContextEntry>, CoreError> {
        self.list_kv("file_metadata", "filepath").await
    }

    pub async fn upsert_admin_config(
        &self,
        key: &str,
        value: serde_json::Value,
        description: Option<String>,
        updated_by: &str,
    ) -> Result<(), CoreError> {
        self.upsert_kv("admin_config", "config_key", key, value, description, updated_by)
            .await
    }

    pub async fn get_admin_config(&self, key: &str) -> Result<Option<ContextEntry>, CoreError> {
        self.get_kv("admin_config", "config_key", key).await
    }

    async fn upsert_kv(
        &self,
        table: &'static str,
        key_col: &'static str,
        key: &str,
        value: serde_json::Value,
        description: Option<String>,
        updated_by: &str,
    ) -> Result<(), CoreError> {
        let key = key.to_string();
        let updated_by = updated_by.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO {table} ({key_col}, value, description, last_updated, updated_by) \
                         VALUES (?1,?2,?3,?4,?5) \
                         ON CONFLICT({key_col}) DO UPDATE SET \
                            value=excluded.value, \
                            description=COALESCE(excluded.description, {table}.description), \
                            last_updated=excluded.last_updated, updated_by=excluded.updated_by"
                    ),
                    rusqlite::params![
                        key,
                        value.to_string(),
                        description,
                        ts_to_sql(&Utc::now()),
                        updated_by
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn get_kv(
        &self,
        table: &'static str,
        key_col: &'static str,
        key: &str,
    ) -> Result<Option<ContextEntry>, CoreError> {
        let key = key.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {key_col}, value, description, last_updated, updated_by \
                     FROM {table} WHERE {key_col} = ?1"
                ))?;
                let mut rows = stmt.query(rusqlite::params![key])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_entry(row)?)),
                    None => Ok(None),
                }
            })
            .await?)
    }

    async fn list_kv(
        &self,
        table: &'static str,
        key_col: &'static str,
    ) -> Result<Vec<ContextEntry>, CoreError> {
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {key_col}, value, description, last_updated, updated_by \
                     FROM {table} ORDER BY {key_col}"
                ))?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_entry(row)?);
                }
                Ok(out)
            })
            .await?)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContextEntry> {
    let value: String = row.get(1)?;
    let last_updated: String = row.get(3)?;
    Ok(ContextEntry {
        key: row.get(0)?,
        value: serde_json::from_str(&value).expect("valid context json"),
        description: row.get(2)?,
        last_updated: ts_from_sql(&last_updated),
        updated_by: row.get(4)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
