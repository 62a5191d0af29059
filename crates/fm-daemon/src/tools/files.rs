use std::sync::Arc;

use serde_json::json;

use fm_core::capabilities::ToolCategory;
use fm_harness::{FnHandler, ToolError, ToolRegistry, ToolResult, ToolSpec};

use crate::context::ServerContext;
use crate::tools::{core_err, str_arg};

pub fn register(registry: &mut ToolRegistry, ctx: &Arc<ServerContext>) {
    register_check(registry, ctx);
    register_update(registry, ctx);
}

/// Working directory used to resolve relative paths: the requesting
/// agent's when known, the project root otherwise.
async fn working_dir_for(ctx: &ServerContext, agent_id: Option<&str>) -> String {
    if let Some(agent_id) = agent_id {
        if let Ok(Some(agent)) = ctx.store.get_agent(agent_id).await {
            return agent.working_directory;
        }
    }
    ctx.config.project_dir.to_string_lossy().into_owned()
}

// ---------------------------------------------------------------------------
// check_file_status
// ---------------------------------------------------------------------------

fn register_check(registry: &mut ToolRegistry, ctx: &Arc<ServerContext>) {
    let ctx = ctx.clone();
    registry.register(
        ToolSpec {
            name: "check_file_status".into(),
            description: "Is this path free to edit, and if not, who holds it.".into(),
            category: ToolCategory::FileManagement,
            input_schema: json!({
                "type": "object",
                "properties": {
                    "filepath": { "type": "string" },
                    "agent_id": { "type": "string" }
                },
                "required": ["filepath"]
            }),
        },
        Arc::new(FnHandler(move |args: serde_json::Value, _tctx| {
            let ctx = ctx.clone();
            async move {
                let filepath = str_arg(&args, "filepath").unwrap_or_default();
                let agent_id = str_arg(&args, "agent_id");
                let workdir = working_dir_for(&ctx, agent_id.as_deref()).await;
                let check = ctx
                    .locks
                    .check(&filepath, agent_id.as_deref(), &workdir)
                    .await
                    .map_err(core_err)?;

                let text = match &check.locked_by {
                    None => format!(
                        "status: available\nfilepath: {}\ncan_edit: true",
                        check.filepath
                    ),
                    Some(lock) => format!(
                        "status: locked\nfilepath: {}\ncan_edit: {}\nlocked_by:\n  agent_id: {}\n  locked_at: {}{}",
                        check.filepath,
                        check.can_edit,
                        lock.agent_id,
                        lock.locked_at.to_rfc3339(),
                        lock.notes
                            .as_deref()
                            .map(|n| format!("\n  notes: {n}"))
                            .unwrap_or_default(),
                    ),
                };
                Ok(ToolResult::text(text))
            }
        })),
    );
}

// ---------------------------------------------------------------------------
// update_file_status
// ---------------------------------------------------------------------------

fn register_update(registry: &mut ToolRegistry, ctx: &Arc<ServerContext>) {
    let ctx = ctx.clone();
    registry.register(
        ToolSpec {
            name: "update_file_status".into(),
            description: "Acquire (in_use) or release a file lock for an agent.".into(),
            category: ToolCategory::FileManagement,
            input_schema: json!({
                "type": "object",
                "properties": {
                    "filepath": { "type": "string" },
                    "status": { "type": "string", "enum": ["in_use", "released"] },
                    "agent_id": { "type": "string" },
                    "notes": { "type": "string" }
                },
                "required": ["filepath", "status", "agent_id"]
            }),
        },
        Arc::new(FnHandler(move |args: serde_json::Value, _tctx| {
            let ctx = ctx.clone();
            async move {
                let filepath = str_arg(&args, "filepath").unwrap_or_default();
                let agent_id = str_arg(&args, "agent_id").unwrap_or_default();
                let status = str_arg(&args, "status").unwrap_or_default();
                let workdir = working_dir_for(&ctx, Some(&agent_id)).await;

                match status.as_str() {
                    "in_use" => {
                        let normalized = ctx
                            .locks
                            .acquire(&filepath, &agent_id, &workdir, str_arg(&args, "notes"))
                            .await
                            .map_err(core_err)?;
                        Ok(ToolResult::text(format!("✓ {normalized} locked by {agent_id}")))
                    }
                    "released" => {
                        let normalized = ctx
                            .locks
                            .release(&filepath, &agent_id, &workdir)
                            .await
                            .map_err(core_err)?;
                        Ok(ToolResult::text(format!("✓ {normalized} released by {agent_id}")))
                    }
                    other => Err(ToolError::Validation(format!("unknown lock status '{other}'"))),
                }
            }
        })),
    );
}
