use std::sync::Arc;

use fm_agents::{AgentError, BusError, TaskActor, TaskError};
use fm_core::capabilities::ToolCategories;
use fm_core::store::CoreError;
use fm_harness::{ToolContext, ToolError, ToolRegistry};
use fm_rag::RagError;

use crate::context::ServerContext;

pub mod agents;
pub mod basic;
pub mod files;
pub mod messages;
pub mod rag;
pub mod sessions;
pub mod tasks;

/// Register every tool whose category the gate enables. `basic` is always
/// on; dependency warnings are logged, never acted upon.
pub fn register_all(gate: &ToolCategories, registry: &mut ToolRegistry, ctx: &Arc<ServerContext>) {
    basic::register(registry, ctx);
    if gate.agent_management {
        agents::register_management(registry, ctx);
        agents::register_tokens(registry, ctx);
    }
    if gate.background_agents {
        agents::register_background(registry, ctx);
    }
    if gate.task_management {
        tasks::register(registry, ctx);
    }
    if gate.agent_communication {
        messages::register(registry, ctx);
    }
    if gate.assistance_request {
        messages::register_assistance(registry, ctx);
    }
    if gate.file_management {
        files::register(registry, ctx);
    }
    if gate.rag {
        rag::register(registry, ctx);
    }
    if gate.memory {
        rag::register_memory(registry, ctx);
    }
    if gate.session_state {
        sessions::register(registry, ctx);
    }
    for warning in gate.dependency_warnings() {
        tracing::warn!(%warning, "capability gate dependency");
    }
    tracing::info!(tools = registry.tool_count(), "tool registry populated");
}

// ---------------------------------------------------------------------------
// Caller identity helpers
// ---------------------------------------------------------------------------

pub(crate) fn require_admin(tctx: &ToolContext) -> Result<(), ToolError> {
    if tctx.is_admin {
        Ok(())
    } else {
        Err(ToolError::Auth("admin token required".into()))
    }
}

pub(crate) fn require_worker(tctx: &ToolContext) -> Result<String, ToolError> {
    tctx.agent_id
        .clone()
        .ok_or_else(|| ToolError::Auth("valid worker token required".into()))
}

/// Admin or worker; either identity is acceptable.
pub(crate) fn require_caller(tctx: &ToolContext) -> Result<TaskActor, ToolError> {
    if tctx.is_admin {
        return Ok(TaskActor::Admin);
    }
    match &tctx.agent_id {
        Some(agent_id) => Ok(TaskActor::Worker(agent_id.clone())),
        None => Err(ToolError::Auth("a valid token is required".into())),
    }
}

// ---------------------------------------------------------------------------
// Argument helpers (schemas guarantee types; these only extract)
// ---------------------------------------------------------------------------

pub(crate) fn str_arg(args: &serde_json::Value, name: &str) -> Option<String> {
    args.get(name).and_then(|v| v.as_str()).map(|s| s.to_string())
}

pub(crate) fn str_list_arg(args: &serde_json::Value, name: &str) -> Vec<String> {
    args.get(name)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn bool_arg(args: &serde_json::Value, name: &str, default: bool) -> bool {
    args.get(name).and_then(|v| v.as_bool()).unwrap_or(default)
}

pub(crate) fn u32_arg(args: &serde_json::Value, name: &str, default: u32) -> u32 {
    args.get(name)
        .and_then(|v| v.as_u64())
        .map(|v| v.min(u32::MAX as u64) as u32)
        .unwrap_or(default)
}

pub(crate) fn parse_enum<T: serde::de::DeserializeOwned>(
    args: &serde_json::Value,
    name: &str,
) -> Option<T> {
    args.get(name)
        .and_then(|v| v.as_str())
        .and_then(|s| serde_json::from_str(&format!("\"{s}\"")).ok())
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

pub(crate) fn core_err(e: CoreError) -> ToolError {
    match e {
        CoreError::AgentExists(_)
        | CoreError::AgentNotFound(_)
        | CoreError::TaskNotFound(_)
        | CoreError::TaskAlreadyAssigned { .. }
        | CoreError::TaskParentConflict { .. }
        | CoreError::LockHeld { .. }
        | CoreError::LockNotHeld { .. }
        | CoreError::SessionNotFound(_) => ToolError::Invariant(e.to_string()),
        other => ToolError::Internal(other.to_string()),
    }
}

pub(crate) fn agent_err(e: AgentError) -> ToolError {
    match e {
        AgentError::Core(core) => core_err(core),
        AgentError::NoTasks => ToolError::Validation(e.to_string()),
        other => ToolError::Invariant(other.to_string()),
    }
}

pub(crate) fn task_err(e: TaskError) -> ToolError {
    match e {
        TaskError::Core(core) => core_err(core),
        other => ToolError::Invariant(other.to_string()),
    }
}

pub(crate) fn bus_err(e: BusError) -> ToolError {
    match e {
        BusError::Core(core) => core_err(core),
        other => ToolError::Invariant(other.to_string()),
    }
}

pub(crate) fn rag_err(e: RagError) -> ToolError {
    match e {
        RagError::Core(core) => core_err(core),
        other => ToolError::External(other.to_string()),
    }
}
