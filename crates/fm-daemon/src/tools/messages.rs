use std::sync::Arc;

use serde_json::json;

use fm_agents::{AssistanceParams, SendMessageParams};
use fm_core::capabilities::ToolCategory;
use fm_core::types::{DeliveryMethod, MessagePriority, MessageType};
use fm_harness::{FnHandler, ToolError, ToolRegistry, ToolResult, ToolSpec};

use crate::context::ServerContext;
use crate::tools::{
    bool_arg, bus_err, parse_enum, require_admin, require_caller, require_worker, str_arg,
    str_list_arg, u32_arg,
};

pub fn register(registry: &mut ToolRegistry, ctx: &Arc<ServerContext>) {
    register_send(registry, ctx);
    register_get(registry, ctx);
    register_broadcast(registry, ctx);
}

// ---------------------------------------------------------------------------
// send_agent_message
// ---------------------------------------------------------------------------

fn register_send(registry: &mut ToolRegistry, ctx: &Arc<ServerContext>) {
    let ctx = ctx.clone();
    registry.register(
        ToolSpec {
            name: "send_agent_message".into(),
            description: "Send a message to another agent or to the admin. Live delivery is best-effort; the message is stored either way.".into(),
            category: ToolCategory::AgentCommunication,
            input_schema: json!({
                "type": "object",
                "properties": {
                    "token": { "type": "string" },
                    "recipient_id": { "type": "string" },
                    "message": { "type": "string" },
                    "message_type": {
                        "type": "string",
                        "enum": ["text", "task_update", "notification", "stop_command", "announcement", "system_alert"]
                    },
                    "priority": { "type": "string", "enum": ["low", "normal", "high", "urgent"] },
                    "deliver_method": { "type": "string", "enum": ["store", "live"] }
                },
                "required": ["token", "recipient_id", "message"]
            }),
        },
        Arc::new(FnHandler(move |args: serde_json::Value, tctx| {
            let ctx = ctx.clone();
            async move {
                let actor = require_caller(&tctx)?;
                let sender_id = actor.name().to_string();
                let recipient_id = str_arg(&args, "recipient_id").unwrap_or_default();
                let message_type = parse_enum::<MessageType>(&args, "message_type")
                    .unwrap_or(MessageType::Text);

                if message_type == MessageType::StopCommand {
                    require_admin(&tctx)?;
                    let message = ctx.bus.send_stop(&sender_id, &recipient_id).await.map_err(bus_err)?;
                    return Ok(ToolResult::text(format!(
                        "✓ stop command sent to {} ({})",
                        recipient_id,
                        if message.delivered { "interrupts delivered" } else { "session unreachable" },
                    )));
                }

                let message = ctx
                    .bus
                    .send(SendMessageParams {
                        sender_id,
                        recipient_id,
                        content: str_arg(&args, "message").unwrap_or_default(),
                        message_type,
                        priority: parse_enum::<MessagePriority>(&args, "priority")
                            .unwrap_or(MessagePriority::Normal),
                        delivery: parse_enum::<DeliveryMethod>(&args, "deliver_method")
                            .unwrap_or(DeliveryMethod::Live),
                    })
                    .await
                    .map_err(bus_err)?;

                Ok(ToolResult::text(format!(
                    "✓ message {} to {} {}",
                    message.message_id,
                    message.recipient_id,
                    if message.delivered { "delivered live" } else { "stored for next poll" },
                )))
            }
        })),
    );
}

// ---------------------------------------------------------------------------
// get_agent_messages
// ---------------------------------------------------------------------------

fn register_get(registry: &mut ToolRegistry, ctx: &Arc<ServerContext>) {
    let ctx = ctx.clone();
    registry.register(
        ToolSpec {
            name: "get_agent_messages".into(),
            description: "Poll the calling agent's inbox (admin token reads the admin inbox).".into(),
            category: ToolCategory::AgentCommunication,
            input_schema: json!({
                "type": "object",
                "properties": {
                    "token": { "type": "string" },
                    "unread_only": { "type": "boolean" },
                    "limit": { "type": "integer" },
                    "mark_read": { "type": "boolean" }
                },
                "required": ["token"]
            }),
        },
        Arc::new(FnHandler(move |args: serde_json::Value, tctx| {
            let ctx = ctx.clone();
            async move {
                let actor = require_caller(&tctx)?;
                let recipient = actor.name().to_string();
                let messages = ctx
                    .bus
                    .get_messages(
                        &recipient,
                        bool_arg(&args, "unread_only", true),
                        u32_arg(&args, "limit", 50),
                        bool_arg(&args, "mark_read", true),
                    )
                    .await
                    .map_err(bus_err)?;
                if messages.is_empty() {
                    return Ok(ToolResult::text("No messages."));
                }
                let mut text = format!("{} message(s):", messages.len());
                for message in messages {
                    text.push_str(&format!(
                        "\n• [{} | {} | {:?}] from {}: {}",
                        message.timestamp.to_rfc3339(),
                        message.message_type,
                        message.priority,
                        message.sender_id,
                        message.content,
                    ));
                }
                Ok(ToolResult::text(text))
            }
        })),
    );
}

// ---------------------------------------------------------------------------
// broadcast_admin_message
// ---------------------------------------------------------------------------

fn register_broadcast(registry: &mut ToolRegistry, ctx: &Arc<ServerContext>) {
    let ctx = ctx.clone();
    registry.register(
        ToolSpec {
            name: "broadcast_admin_message".into(),
            description: "Admin broadcast to every active agent.".into(),
            category: ToolCategory::AgentCommunication,
            input_schema: json!({
                "type": "object",
                "properties": {
                    "token": { "type": "string" },
                    "message": { "type": "string" },
                    "priority": { "type": "string", "enum": ["low", "normal", "high", "urgent"] },
                    "deliver_method": { "type": "string", "enum": ["store", "live"] }
                },
                "required": ["token", "message"]
            }),
        },
        Arc::new(FnHandler(move |args: serde_json::Value, tctx| {
            let ctx = ctx.clone();
            async move {
                require_admin(&tctx)?;
                let sent = ctx
                    .bus
                    .broadcast(
                        "admin",
                        &str_arg(&args, "message").unwrap_or_default(),
                        parse_enum::<MessagePriority>(&args, "priority").unwrap_or(MessagePriority::Normal),
                        parse_enum::<DeliveryMethod>(&args, "deliver_method").unwrap_or(DeliveryMethod::Live),
                    )
                    .await
                    .map_err(bus_err)?;
                let delivered = sent.iter().filter(|m| m.delivered).count();
                Ok(ToolResult::text(format!(
                    "✓ broadcast to {} active agent(s), {} delivered live",
                    sent.len(),
                    delivered,
                )))
            }
        })),
    );
}

// ---------------------------------------------------------------------------
// request_assistance
// ---------------------------------------------------------------------------

pub fn register_assistance(registry: &mut ToolRegistry, ctx: &Arc<ServerContext>) {
    let ctx = ctx.clone();
    registry.register(
        ToolSpec {
            name: "request_assistance".into(),
            description: "Escalate to the operator: stored for the admin and pushed at their session when reachable.".into(),
            category: ToolCategory::AssistanceRequest,
            input_schema: json!({
                "type": "object",
                "properties": {
                    "token": { "type": "string" },
                    "task_id": { "type": "string" },
                    "description": { "type": "string" },
                    "urgency": { "type": "string", "enum": ["low", "normal", "high", "urgent"] },
                    "context": { "type": "string" },
                    "suggested_actions": { "type": "array", "items": { "type": "string" } },
                    "blocking": { "type": "boolean" }
                },
                "required": ["token", "description"]
            }),
        },
        Arc::new(FnHandler(move |args: serde_json::Value, tctx| {
            let ctx = ctx.clone();
            async move {
                let agent_id = require_worker(&tctx)?;
                let description = str_arg(&args, "description").unwrap_or_default();
                if description.trim().is_empty() {
                    return Err(ToolError::Validation("description must not be empty".into()));
                }
                let message = ctx
                    .bus
                    .request_assistance(AssistanceParams {
                        agent_id,
                        task_id: str_arg(&args, "task_id"),
                        description,
                        urgency: parse_enum::<MessagePriority>(&args, "urgency")
                            .unwrap_or(MessagePriority::Normal),
                        context: str_arg(&args, "context"),
                        suggested_actions: str_list_arg(&args, "suggested_actions"),
                        blocking: bool_arg(&args, "blocking", false),
                    })
                    .await
                    .map_err(bus_err)?;
                Ok(ToolResult::text(format!(
                    "✓ assistance request {} recorded ({})",
                    message.message_id,
                    if message.delivered {
                        "operator session notified"
                    } else {
                        "stored; operator will see it on next check"
                    },
                )))
            }
        })),
    );
}
