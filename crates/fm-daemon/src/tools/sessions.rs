use std::sync::Arc;

use serde_json::json;

use fm_core::capabilities::ToolCategory;
use fm_harness::{FnHandler, ToolContext, ToolError, ToolRegistry, ToolResult, ToolSpec};

use crate::context::ServerContext;

pub fn register(registry: &mut ToolRegistry, ctx: &Arc<ServerContext>) {
    let ctx = ctx.clone();
    registry.register(
        ToolSpec {
            name: "session_info".into(),
            description: "Status, heartbeat, and recovery count of the calling transport session.".into(),
            category: ToolCategory::SessionState,
            input_schema: json!({ "type": "object", "properties": {} }),
        },
        Arc::new(FnHandler(move |_args: serde_json::Value, tctx: ToolContext| {
            let ctx = ctx.clone();
            async move {
                let Some(session_id) = tctx.session_id.clone() else {
                    return Err(ToolError::Internal("no transport session attached".into()));
                };
                let record = ctx
                    .sessions
                    .get(&session_id)
                    .await
                    .map_err(|e| ToolError::Internal(e.to_string()))?
                    .ok_or_else(|| ToolError::Internal("session row missing".into()))?;
                let mut text = format!(
                    "session {}\n  status: {}\n  last_heartbeat: {}\n  recovery_attempts: {}",
                    record.session_id,
                    record.status,
                    record.last_heartbeat.to_rfc3339(),
                    record.recovery_attempts,
                );
                if let Some(expires) = record.grace_period_expires {
                    text.push_str(&format!("\n  grace_period_expires: {}", expires.to_rfc3339()));
                }
                Ok(ToolResult::text(text))
            }
        })),
    );
}
