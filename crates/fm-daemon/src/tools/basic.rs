use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;

use fm_core::capabilities::ToolCategory;
use fm_core::store::{vector_available, TaskFilter};
use fm_core::types::AgentStatus;
use fm_harness::{FnHandler, ToolRegistry, ToolResult, ToolSpec};

use crate::context::ServerContext;
use crate::tools::{bool_arg, core_err, parse_enum, u32_arg};

pub fn register(registry: &mut ToolRegistry, ctx: &Arc<ServerContext>) {
    register_health(registry, ctx);
    register_view_status(registry, ctx);
    register_list_agents(registry, ctx);
}

// ---------------------------------------------------------------------------
// health
// ---------------------------------------------------------------------------

fn register_health(registry: &mut ToolRegistry, ctx: &Arc<ServerContext>) {
    let ctx = ctx.clone();
    registry.register(
        ToolSpec {
            name: "health".into(),
            description: "Server liveness and basic runtime facts.".into(),
            category: ToolCategory::Basic,
            input_schema: json!({ "type": "object", "properties": {} }),
        },
        Arc::new(FnHandler(move |_args, _tctx| {
            let ctx = ctx.clone();
            async move {
                let vector = if vector_available() { "available" } else { "unavailable" };
                Ok(ToolResult::text(format!(
                    "✓ foreman {} healthy — uptime {}s, vector index {}",
                    env!("CARGO_PKG_VERSION"),
                    ctx.uptime_secs(),
                    vector,
                )))
            }
        })),
    );
}

// ---------------------------------------------------------------------------
// view_status
// ---------------------------------------------------------------------------

fn register_view_status(registry: &mut ToolRegistry, ctx: &Arc<ServerContext>) {
    let ctx = ctx.clone();
    registry.register(
        ToolSpec {
            name: "view_status".into(),
            description: "Overview of agents, tasks, messages, and locks.".into(),
            category: ToolCategory::Basic,
            input_schema: json!({
                "type": "object",
                "properties": {
                    "admin_token": { "type": "string", "description": "Optional; the status view is not gated" }
                }
            }),
        },
        Arc::new(FnHandler(move |_args, _tctx| {
            let ctx = ctx.clone();
            async move {
                let agents = ctx.store.list_agents(None, None).await.map_err(core_err)?;
                let tasks = ctx.store.list_tasks(TaskFilter::default()).await.map_err(core_err)?;
                let messages = ctx.store.message_count().await.map_err(core_err)?;

                let mut agent_counts: BTreeMap<String, usize> = BTreeMap::new();
                for agent in &agents {
                    *agent_counts.entry(agent.status.to_string()).or_default() += 1;
                }
                let mut task_counts: BTreeMap<String, usize> = BTreeMap::new();
                for task in &tasks {
                    *task_counts.entry(task.status.to_string()).or_default() += 1;
                }

                let mut text = format!(
                    "Server status\n  agents: {} total",
                    agents.len()
                );
                for (status, count) in &agent_counts {
                    text.push_str(&format!("\n    {status}: {count}"));
                }
                text.push_str(&format!("\n  tasks: {} total", tasks.len()));
                for (status, count) in &task_counts {
                    text.push_str(&format!("\n    {status}: {count}"));
                }
                text.push_str(&format!("\n  messages stored: {messages}"));
                text.push_str(&format!(
                    "\n  vector index: {}",
                    if vector_available() { "available" } else { "unavailable" }
                ));
                Ok(ToolResult::text(text))
            }
        })),
    );
}

// ---------------------------------------------------------------------------
// list_agents
// ---------------------------------------------------------------------------

fn register_list_agents(registry: &mut ToolRegistry, ctx: &Arc<ServerContext>) {
    let ctx = ctx.clone();
    registry.register(
        ToolSpec {
            name: "list_agents".into(),
            description: "List agents, optionally filtered by status. Tokens are never shown here.".into(),
            category: ToolCategory::Basic,
            input_schema: json!({
                "type": "object",
                "properties": {
                    "status": {
                        "type": "string",
                        "enum": ["created", "active", "terminated", "failed", "completed", "cancelled", "paused"]
                    },
                    "limit": { "type": "integer" },
                    "include_details": { "type": "boolean" }
                }
            }),
        },
        Arc::new(FnHandler(move |args: serde_json::Value, _tctx| {
            let ctx = ctx.clone();
            async move {
                let status: Option<AgentStatus> = parse_enum(&args, "status");
                let limit = u32_arg(&args, "limit", 100);
                let details = bool_arg(&args, "include_details", false);

                let agents = ctx.store.list_agents(status, Some(limit)).await.map_err(core_err)?;
                if agents.is_empty() {
                    return Ok(ToolResult::text("No agents match."));
                }
                let mut text = format!("{} agent(s):", agents.len());
                for agent in agents {
                    text.push_str(&format!("\n• {} [{}]", agent.agent_id, agent.status));
                    if let Some(task) = &agent.current_task {
                        text.push_str(&format!(" — current task {task}"));
                    }
                    if details {
                        text.push_str(&format!(
                            "\n    capabilities: {}\n    workdir: {}\n    color: {}\n    created: {}",
                            agent.capabilities.join(", "),
                            agent.working_directory,
                            agent.color,
                            agent.created_at.to_rfc3339(),
                        ));
                        if let Some(objectives) = &agent.background_objectives {
                            text.push_str(&format!("\n    objectives: {}", objectives.join("; ")));
                        }
                    }
                }
                Ok(ToolResult::text(text))
            }
        })),
    );
}
