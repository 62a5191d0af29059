use std::sync::Arc;

use serde_json::json;

use fm_agents::CreateTaskParams;
use fm_core::capabilities::ToolCategory;
use fm_core::store::TaskFilter;
use fm_core::types::{Task, TaskPriority, TaskStatus};
use fm_harness::{FnHandler, ToolError, ToolRegistry, ToolResult, ToolSpec};

use crate::context::ServerContext;
use crate::tools::{
    parse_enum, require_admin, require_caller, require_worker, str_arg, str_list_arg, task_err,
};

pub fn register(registry: &mut ToolRegistry, ctx: &Arc<ServerContext>) {
    register_create_task(registry, ctx);
    register_create_self_task(registry, ctx);
    register_assign_task(registry, ctx);
    register_view_tasks(registry, ctx);
    register_update_task_status(registry, ctx);
    register_search_tasks(registry, ctx);
    register_delete_task(registry, ctx);
}

fn format_task(task: &Task) -> String {
    let mut text = format!(
        "• {} [{} / {}] {}",
        task.task_id, task.status, task.priority, task.title
    );
    if let Some(assignee) = &task.assigned_to {
        text.push_str(&format!(" → {assignee}"));
    }
    if let Some(parent) = &task.parent_task {
        text.push_str(&format!(" (child of {parent})"));
    }
    if !task.depends_on_tasks.is_empty() {
        text.push_str(&format!(" [depends on {}]", task.depends_on_tasks.join(", ")));
    }
    text
}

// ---------------------------------------------------------------------------
// create_task (admin) / create_self_task (worker)
// ---------------------------------------------------------------------------

fn register_create_task(registry: &mut ToolRegistry, ctx: &Arc<ServerContext>) {
    let ctx = ctx.clone();
    registry.register(
        ToolSpec {
            name: "create_task".into(),
            description: "Create a task, optionally assigned, parented, or with dependencies.".into(),
            category: ToolCategory::TaskManagement,
            input_schema: json!({
                "type": "object",
                "properties": {
                    "task_id": { "type": "string" },
                    "title": { "type": "string" },
                    "description": { "type": "string" },
                    "assigned_to": { "type": "string" },
                    "priority": { "type": "string", "enum": ["low", "medium", "high"] },
                    "parent_task": { "type": "string" },
                    "depends_on_tasks": { "type": "array", "items": { "type": "string" } },
                    "admin_token": { "type": "string" }
                },
                "required": ["title", "admin_token"]
            }),
        },
        Arc::new(FnHandler(move |args: serde_json::Value, tctx| {
            let ctx = ctx.clone();
            async move {
                require_admin(&tctx)?;
                let task = ctx
                    .tasks
                    .create_task(
                        CreateTaskParams {
                            task_id: str_arg(&args, "task_id"),
                            title: str_arg(&args, "title").unwrap_or_default(),
                            description: str_arg(&args, "description").unwrap_or_default(),
                            assigned_to: str_arg(&args, "assigned_to"),
                            priority: parse_enum::<TaskPriority>(&args, "priority"),
                            parent_task: str_arg(&args, "parent_task"),
                            depends_on_tasks: str_list_arg(&args, "depends_on_tasks"),
                        },
                        "admin",
                    )
                    .await
                    .map_err(task_err)?;
                Ok(ToolResult::text(format!("✓ task created\n{}", format_task(&task))))
            }
        })),
    );
}

fn register_create_self_task(registry: &mut ToolRegistry, ctx: &Arc<ServerContext>) {
    let ctx = ctx.clone();
    registry.register(
        ToolSpec {
            name: "create_self_task".into(),
            description: "Worker shortcut: create a task assigned to the calling agent.".into(),
            category: ToolCategory::TaskManagement,
            input_schema: json!({
                "type": "object",
                "properties": {
                    "token": { "type": "string" },
                    "title": { "type": "string" },
                    "description": { "type": "string" },
                    "priority": { "type": "string", "enum": ["low", "medium", "high"] },
                    "parent_task": { "type": "string" }
                },
                "required": ["token", "title"]
            }),
        },
        Arc::new(FnHandler(move |args: serde_json::Value, tctx| {
            let ctx = ctx.clone();
            async move {
                let agent_id = require_worker(&tctx)?;
                let task = ctx
                    .tasks
                    .create_task(
                        CreateTaskParams {
                            task_id: None,
                            title: str_arg(&args, "title").unwrap_or_default(),
                            description: str_arg(&args, "description").unwrap_or_default(),
                            assigned_to: Some(agent_id.clone()),
                            priority: parse_enum::<TaskPriority>(&args, "priority"),
                            parent_task: str_arg(&args, "parent_task"),
                            depends_on_tasks: Vec::new(),
                        },
                        &agent_id,
                    )
                    .await
                    .map_err(task_err)?;
                Ok(ToolResult::text(format!("✓ self task created\n{}", format_task(&task))))
            }
        })),
    );
}

// ---------------------------------------------------------------------------
// assign / view / update / search / delete
// ---------------------------------------------------------------------------

fn register_assign_task(registry: &mut ToolRegistry, ctx: &Arc<ServerContext>) {
    let ctx = ctx.clone();
    registry.register(
        ToolSpec {
            name: "assign_task".into(),
            description: "Assign an unassigned task to a worker.".into(),
            category: ToolCategory::TaskManagement,
            input_schema: json!({
                "type": "object",
                "properties": {
                    "task_id": { "type": "string" },
                    "agent_id": { "type": "string" },
                    "admin_token": { "type": "string" }
                },
                "required": ["task_id", "agent_id", "admin_token"]
            }),
        },
        Arc::new(FnHandler(move |args: serde_json::Value, tctx| {
            let ctx = ctx.clone();
            async move {
                require_admin(&tctx)?;
                let task_id = str_arg(&args, "task_id").unwrap_or_default();
                let agent_id = str_arg(&args, "agent_id").unwrap_or_default();
                ctx.tasks.assign(&task_id, &agent_id).await.map_err(task_err)?;
                Ok(ToolResult::text(format!("✓ task {task_id} assigned to {agent_id}")))
            }
        })),
    );
}

fn register_view_tasks(registry: &mut ToolRegistry, ctx: &Arc<ServerContext>) {
    let ctx = ctx.clone();
    registry.register(
        ToolSpec {
            name: "view_tasks".into(),
            description: "List tasks, filterable by assignee, status, or parent.".into(),
            category: ToolCategory::TaskManagement,
            input_schema: json!({
                "type": "object",
                "properties": {
                    "assigned_to": { "type": "string" },
                    "status": {
                        "type": "string",
                        "enum": ["pending", "in_progress", "completed", "cancelled", "failed"]
                    },
                    "parent_task": { "type": "string" }
                }
            }),
        },
        Arc::new(FnHandler(move |args: serde_json::Value, _tctx| {
            let ctx = ctx.clone();
            async move {
                let tasks = ctx
                    .tasks
                    .list(TaskFilter {
                        assigned_to: str_arg(&args, "assigned_to"),
                        status: parse_enum::<TaskStatus>(&args, "status"),
                        parent: str_arg(&args, "parent_task"),
                    })
                    .await
                    .map_err(task_err)?;
                if tasks.is_empty() {
                    return Ok(ToolResult::text("No tasks match."));
                }
                let mut text = format!("{} task(s):", tasks.len());
                for task in &tasks {
                    text.push('\n');
                    text.push_str(&format_task(task));
                }
                Ok(ToolResult::text(text))
            }
        })),
    );
}

fn register_update_task_status(registry: &mut ToolRegistry, ctx: &Arc<ServerContext>) {
    let ctx = ctx.clone();
    registry.register(
        ToolSpec {
            name: "update_task_status".into(),
            description: "Move a task through its lifecycle. Workers may only update their own tasks; completed is terminal.".into(),
            category: ToolCategory::TaskManagement,
            input_schema: json!({
                "type": "object",
                "properties": {
                    "token": { "type": "string" },
                    "task_id": { "type": "string" },
                    "status": {
                        "type": "string",
                        "enum": ["pending", "in_progress", "completed", "cancelled", "failed"]
                    },
                    "note": { "type": "string" }
                },
                "required": ["token", "task_id", "status"]
            }),
        },
        Arc::new(FnHandler(move |args: serde_json::Value, tctx| {
            let ctx = ctx.clone();
            async move {
                let actor = require_caller(&tctx)?;
                let task_id = str_arg(&args, "task_id").unwrap_or_default();
                let status: TaskStatus = parse_enum(&args, "status")
                    .ok_or_else(|| ToolError::Validation("unknown status".into()))?;
                let task = ctx
                    .tasks
                    .update_status(&task_id, status, &actor, str_arg(&args, "note"))
                    .await
                    .map_err(task_err)?;
                Ok(ToolResult::text(format!("✓ task updated\n{}", format_task(&task))))
            }
        })),
    );
}

fn register_search_tasks(registry: &mut ToolRegistry, ctx: &Arc<ServerContext>) {
    let ctx = ctx.clone();
    registry.register(
        ToolSpec {
            name: "search_tasks".into(),
            description: "Substring search over task ids, titles, and descriptions.".into(),
            category: ToolCategory::TaskManagement,
            input_schema: json!({
                "type": "object",
                "properties": { "query": { "type": "string" } },
                "required": ["query"]
            }),
        },
        Arc::new(FnHandler(move |args: serde_json::Value, _tctx| {
            let ctx = ctx.clone();
            async move {
                let query = str_arg(&args, "query").unwrap_or_default();
                let tasks = ctx.tasks.search(&query).await.map_err(task_err)?;
                if tasks.is_empty() {
                    return Ok(ToolResult::text(format!("No tasks match \"{query}\".")));
                }
                let mut text = format!("{} task(s) matching \"{query}\":", tasks.len());
                for task in &tasks {
                    text.push('\n');
                    text.push_str(&format_task(task));
                }
                Ok(ToolResult::text(text))
            }
        })),
    );
}

fn register_delete_task(registry: &mut ToolRegistry, ctx: &Arc<ServerContext>) {
    let ctx = ctx.clone();
    registry.register(
        ToolSpec {
            name: "delete_task".into(),
            description: "Admin-only: remove a task permanently, unlinking children.".into(),
            category: ToolCategory::TaskManagement,
            input_schema: json!({
                "type": "object",
                "properties": {
                    "task_id": { "type": "string" },
                    "admin_token": { "type": "string" }
                },
                "required": ["task_id", "admin_token"]
            }),
        },
        Arc::new(FnHandler(move |args: serde_json::Value, tctx| {
            let ctx = ctx.clone();
            async move {
                require_admin(&tctx)?;
                let task_id = str_arg(&args, "task_id").unwrap_or_default();
                ctx.tasks.delete(&task_id).await.map_err(task_err)?;
                Ok(ToolResult::text(format!("✓ task {task_id} deleted")))
            }
        })),
    );
}
