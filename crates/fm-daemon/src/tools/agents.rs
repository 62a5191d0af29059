use std::sync::Arc;

use serde_json::json;

use fm_agents::CreateAgentParams;
use fm_core::capabilities::ToolCategory;
use fm_core::types::AgentKind;
use fm_harness::{FnHandler, ToolError, ToolRegistry, ToolResult, ToolSpec};

use crate::context::ServerContext;
use crate::tools::{agent_err, bool_arg, core_err, require_admin, str_arg, str_list_arg, u32_arg};

// ---------------------------------------------------------------------------
// Agent management (admin-gated)
// ---------------------------------------------------------------------------

pub fn register_management(registry: &mut ToolRegistry, ctx: &Arc<ServerContext>) {
    register_create_agent(registry, ctx);
    register_terminate_agent(registry, ctx);
    register_relaunch_agent(registry, ctx);
    register_audits(registry, ctx);
}

fn register_create_agent(registry: &mut ToolRegistry, ctx: &Arc<ServerContext>) {
    let ctx = ctx.clone();
    registry.register(
        ToolSpec {
            name: "create_agent".into(),
            description: "Spawn a worker agent in a new tmux session and assign it unassigned tasks.".into(),
            category: ToolCategory::AgentManagement,
            input_schema: json!({
                "type": "object",
                "properties": {
                    "agent_id": { "type": "string" },
                    "capabilities": { "type": "array", "items": { "type": "string" } },
                    "task_ids": { "type": "array", "items": { "type": "string" } },
                    "working_directory": { "type": "string" },
                    "admin_token": { "type": "string" }
                },
                "required": ["agent_id", "task_ids", "admin_token"]
            }),
        },
        Arc::new(FnHandler(move |args: serde_json::Value, tctx| {
            let ctx = ctx.clone();
            async move {
                require_admin(&tctx)?;
                let params = CreateAgentParams {
                    agent_id: str_arg(&args, "agent_id").unwrap_or_default(),
                    capabilities: str_list_arg(&args, "capabilities"),
                    task_ids: str_list_arg(&args, "task_ids"),
                    working_directory: str_arg(&args, "working_directory"),
                };
                let outcome = ctx.manager.create_agent(params).await.map_err(agent_err)?;

                let mut text = format!(
                    "✓ agent {} created\n  token: {}\n  session: {}\n  color: {}\n  current task: {}",
                    outcome.agent.agent_id,
                    outcome.agent.token,
                    outcome.session_name,
                    outcome.agent.color,
                    outcome.agent.current_task.as_deref().unwrap_or("-"),
                );
                if let Some(error) = outcome.launch_error {
                    text.push_str(&format!(
                        "\n⚠ session launch failed: {error}\n  the agent record is kept; run audit_agent_sessions to reconcile"
                    ));
                }
                Ok(ToolResult::text(text))
            }
        })),
    );
}

fn register_terminate_agent(registry: &mut ToolRegistry, ctx: &Arc<ServerContext>) {
    let ctx = ctx.clone();
    registry.register(
        ToolSpec {
            name: "terminate_agent".into(),
            description: "Terminate a worker: release its tasks back to the pool and kill its session.".into(),
            category: ToolCategory::AgentManagement,
            input_schema: json!({
                "type": "object",
                "properties": {
                    "agent_id": { "type": "string" },
                    "admin_token": { "type": "string" }
                },
                "required": ["agent_id", "admin_token"]
            }),
        },
        Arc::new(FnHandler(move |args: serde_json::Value, tctx| {
            let ctx = ctx.clone();
            async move {
                require_admin(&tctx)?;
                let agent_id = str_arg(&args, "agent_id").unwrap_or_default();
                let outcome = ctx.manager.terminate_agent(&agent_id).await.map_err(agent_err)?;
                let mut text = format!(
                    "✓ agent {} terminated — {} task(s) back to pending",
                    outcome.agent_id,
                    outcome.released_tasks.len()
                );
                if let Some(error) = outcome.kill_error {
                    text.push_str(&format!("\n⚠ session kill failed: {error}"));
                }
                Ok(ToolResult::text(text))
            }
        })),
    );
}

fn register_relaunch_agent(registry: &mut ToolRegistry, ctx: &Arc<ServerContext>) {
    let ctx = ctx.clone();
    registry.register(
        ToolSpec {
            name: "relaunch_agent".into(),
            description: "Bring a dormant or terminated agent back to active with a fresh prompt.".into(),
            category: ToolCategory::AgentManagement,
            input_schema: json!({
                "type": "object",
                "properties": {
                    "agent_id": { "type": "string" },
                    "generate_new_token": { "type": "boolean" },
                    "custom_prompt": { "type": "string" },
                    "admin_token": { "type": "string" }
                },
                "required": ["agent_id", "admin_token"]
            }),
        },
        Arc::new(FnHandler(move |args: serde_json::Value, tctx| {
            let ctx = ctx.clone();
            async move {
                require_admin(&tctx)?;
                let agent_id = str_arg(&args, "agent_id").unwrap_or_default();
                let new_token = bool_arg(&args, "generate_new_token", false);
                let custom_prompt = str_arg(&args, "custom_prompt");
                let outcome = ctx
                    .manager
                    .relaunch_agent(&agent_id, new_token, custom_prompt)
                    .await
                    .map_err(agent_err)?;

                let mut text = format!(
                    "✓ agent {} relaunched ({} → active)",
                    outcome.agent.agent_id, outcome.previous_status
                );
                if new_token {
                    text.push_str(&format!("\n  new token: {}", outcome.agent.token));
                }
                if let Some(error) = outcome.launch_error {
                    text.push_str(&format!("\n⚠ session delivery failed: {error}"));
                }
                Ok(ToolResult::text(text))
            }
        })),
    );
}

fn register_audits(registry: &mut ToolRegistry, ctx: &Arc<ServerContext>) {
    let audit_ctx = ctx.clone();
    registry.register(
        ToolSpec {
            name: "audit_agent_sessions".into(),
            description: "Reconcile agent rows, live tmux sessions, and the in-memory cache.".into(),
            category: ToolCategory::AgentManagement,
            input_schema: json!({
                "type": "object",
                "properties": { "admin_token": { "type": "string" } },
                "required": ["admin_token"]
            }),
        },
        Arc::new(FnHandler(move |_args, tctx| {
            let ctx = audit_ctx.clone();
            async move {
                require_admin(&tctx)?;
                let report = ctx.manager.audit_sessions().await.map_err(agent_err)?;
                Ok(ToolResult::text(format_audit(&report)))
            }
        })),
    );

    let smart_ctx = ctx.clone();
    registry.register(
        ToolSpec {
            name: "smart_audit_agents".into(),
            description: "Audit with an activity window: recently active sessions of terminated agents are kept for relaunch.".into(),
            category: ToolCategory::AgentManagement,
            input_schema: json!({
                "type": "object",
                "properties": {
                    "admin_token": { "type": "string" },
                    "activity_window_minutes": { "type": "integer" }
                },
                "required": ["admin_token"]
            }),
        },
        Arc::new(FnHandler(move |args: serde_json::Value, tctx| {
            let ctx = smart_ctx.clone();
            async move {
                require_admin(&tctx)?;
                let window = u32_arg(&args, "activity_window_minutes", 30) as i64;
                let report = ctx.manager.smart_audit(window).await.map_err(agent_err)?;
                Ok(ToolResult::text(format_audit(&report)))
            }
        })),
    );
}

fn format_audit(report: &fm_agents::AuditReport) -> String {
    let mut text = format!(
        "Audit: {} agent(s), {} session(s), {} fix(es)",
        report.agents_checked, report.sessions_seen, report.resolutions.len()
    );
    for resolution in &report.resolutions {
        text.push_str(&format!(
            "\n• {} ({}): {:?} — {}",
            resolution.agent_id, resolution.session, resolution.fix, resolution.note
        ));
    }
    text
}

// ---------------------------------------------------------------------------
// Background agents
// ---------------------------------------------------------------------------

pub fn register_background(registry: &mut ToolRegistry, ctx: &Arc<ServerContext>) {
    let create_ctx = ctx.clone();
    registry.register(
        ToolSpec {
            name: "create_background_agent".into(),
            description: "Spawn a standalone background agent driven by objectives instead of the task graph. No admin token needed.".into(),
            category: ToolCategory::BackgroundAgents,
            input_schema: json!({
                "type": "object",
                "properties": {
                    "agent_id": { "type": "string" },
                    "objectives": { "type": "array", "items": { "type": "string" } },
                    "capabilities": { "type": "array", "items": { "type": "string" } },
                    "working_directory": { "type": "string" }
                },
                "required": ["agent_id", "objectives"]
            }),
        },
        Arc::new(FnHandler(move |args: serde_json::Value, _tctx| {
            let ctx = create_ctx.clone();
            async move {
                let agent_id = str_arg(&args, "agent_id").unwrap_or_default();
                let outcome = ctx
                    .manager
                    .create_background_agent(
                        &agent_id,
                        str_list_arg(&args, "objectives"),
                        str_list_arg(&args, "capabilities"),
                        str_arg(&args, "working_directory"),
                    )
                    .await
                    .map_err(agent_err)?;
                let mut text = format!(
                    "✓ background agent {} created\n  token: {}\n  session: {}",
                    outcome.agent.agent_id, outcome.agent.token, outcome.session_name,
                );
                if let Some(error) = outcome.launch_error {
                    text.push_str(&format!("\n⚠ session launch failed: {error}"));
                }
                Ok(ToolResult::text(text))
            }
        })),
    );

    let list_ctx = ctx.clone();
    registry.register(
        ToolSpec {
            name: "list_background_agents".into(),
            description: "List background agents and their objectives.".into(),
            category: ToolCategory::BackgroundAgents,
            input_schema: json!({ "type": "object", "properties": {} }),
        },
        Arc::new(FnHandler(move |_args, _tctx| {
            let ctx = list_ctx.clone();
            async move {
                let agents = ctx
                    .store
                    .list_agents_by_kind(AgentKind::Background)
                    .await
                    .map_err(core_err)?;
                if agents.is_empty() {
                    return Ok(ToolResult::text("No background agents."));
                }
                let mut text = format!("{} background agent(s):", agents.len());
                for agent in agents {
                    text.push_str(&format!(
                        "\n• {} [{}] — {}",
                        agent.agent_id,
                        agent.status,
                        agent
                            .background_objectives
                            .map(|objectives| objectives.join("; "))
                            .unwrap_or_else(|| "no objectives recorded".into()),
                    ));
                }
                Ok(ToolResult::text(text))
            }
        })),
    );

    let terminate_ctx = ctx.clone();
    registry.register(
        ToolSpec {
            name: "terminate_background_agent".into(),
            description: "Terminate a background agent and kill its session.".into(),
            category: ToolCategory::BackgroundAgents,
            input_schema: json!({
                "type": "object",
                "properties": {
                    "agent_id": { "type": "string" },
                    "admin_token": { "type": "string" }
                },
                "required": ["agent_id", "admin_token"]
            }),
        },
        Arc::new(FnHandler(move |args: serde_json::Value, tctx| {
            let ctx = terminate_ctx.clone();
            async move {
                require_admin(&tctx)?;
                let agent_id = str_arg(&args, "agent_id").unwrap_or_default();
                let outcome = ctx
                    .manager
                    .terminate_background_agent(&agent_id)
                    .await
                    .map_err(agent_err)?;
                Ok(ToolResult::text(format!(
                    "✓ background agent {} terminated",
                    outcome.agent_id
                )))
            }
        })),
    );
}

// ---------------------------------------------------------------------------
// Token tools (admin-gated)
// ---------------------------------------------------------------------------

pub fn register_tokens(registry: &mut ToolRegistry, ctx: &Arc<ServerContext>) {
    let list_ctx = ctx.clone();
    registry.register(
        ToolSpec {
            name: "list_tokens".into(),
            description: "List every worker token alongside its agent.".into(),
            category: ToolCategory::AgentManagement,
            input_schema: json!({
                "type": "object",
                "properties": { "admin_token": { "type": "string" } },
                "required": ["admin_token"]
            }),
        },
        Arc::new(FnHandler(move |_args, tctx| {
            let ctx = list_ctx.clone();
            async move {
                require_admin(&tctx)?;
                let agents = ctx.store.list_agents(None, None).await.map_err(core_err)?;
                if agents.is_empty() {
                    return Ok(ToolResult::text("No worker tokens minted."));
                }
                let mut text = format!("{} token(s):", agents.len());
                for agent in agents {
                    text.push_str(&format!("\n• {} → {} [{}]", agent.agent_id, agent.token, agent.status));
                }
                Ok(ToolResult::text(text))
            }
        })),
    );

    let get_ctx = ctx.clone();
    registry.register(
        ToolSpec {
            name: "get_token".into(),
            description: "Fetch one agent's worker token.".into(),
            category: ToolCategory::AgentManagement,
            input_schema: json!({
                "type": "object",
                "properties": {
                    "agent_id": { "type": "string" },
                    "admin_token": { "type": "string" }
                },
                "required": ["agent_id", "admin_token"]
            }),
        },
        Arc::new(FnHandler(move |args: serde_json::Value, tctx| {
            let ctx = get_ctx.clone();
            async move {
                require_admin(&tctx)?;
                let agent_id = str_arg(&args, "agent_id").unwrap_or_default();
                match ctx.store.get_agent(&agent_id).await.map_err(core_err)? {
                    Some(agent) => Ok(ToolResult::text(format!("{} → {}", agent.agent_id, agent.token))),
                    None => Err(ToolError::Invariant(format!("agent '{agent_id}' not found"))),
                }
            }
        })),
    );

    let validate_ctx = ctx.clone();
    registry.register(
        ToolSpec {
            name: "validate_token".into(),
            description: "Check a token's validity and role.".into(),
            category: ToolCategory::AgentManagement,
            input_schema: json!({
                "type": "object",
                "properties": { "token": { "type": "string" } },
                "required": ["token"]
            }),
        },
        Arc::new(FnHandler(move |args: serde_json::Value, _tctx| {
            let ctx = validate_ctx.clone();
            async move {
                let token = str_arg(&args, "token").unwrap_or_default();
                if ctx.auth.is_admin(&token) {
                    return Ok(ToolResult::text("✓ valid admin token"));
                }
                match ctx.auth.agent_id_for(&token).await.map_err(core_err)? {
                    Some(agent_id) => {
                        Ok(ToolResult::text(format!("✓ valid worker token for {agent_id}")))
                    }
                    None => Ok(ToolResult::error("✗ token is not recognized")),
                }
            }
        })),
    );
}
