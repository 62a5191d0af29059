use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use fm_core::capabilities::ToolCategory;

use crate::rpc::{RpcRequest, ToolDescriptor, ToolResult};
use crate::schema;

// ---------------------------------------------------------------------------
// ToolError
// ---------------------------------------------------------------------------

/// Tool failure classes. Every variant surfaces as `isError: true` text;
/// the class decides the prefix so callers can tell retry semantics apart.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("✗ unauthorized: {0}")]
    Auth(String),
    #[error("✗ invalid arguments: {0}")]
    Validation(String),
    #[error("✗ {0}")]
    Invariant(String),
    #[error("⚠ external failure: {0}")]
    External(String),
    #[error("✗ internal error: {0}")]
    Internal(String),
}

impl ToolError {
    pub fn into_result(self) -> ToolResult {
        ToolResult::error(self.to_string())
    }
}

// ---------------------------------------------------------------------------
// ToolContext
// ---------------------------------------------------------------------------

/// Who is calling, over which transport session, and how to push
/// server-initiated notifications back at them.
#[derive(Clone, Default)]
pub struct ToolContext {
    pub session_id: Option<String>,
    /// Set when the caller presented the admin token.
    pub is_admin: bool,
    /// Set when the caller's token resolved to a worker.
    pub agent_id: Option<String>,
    /// SSE channel back to the calling session, when one is open.
    pub notifications: Option<tokio::sync::mpsc::Sender<RpcRequest>>,
}

impl ToolContext {
    /// Best-effort server→client notification.
    pub fn notify(&self, method: &str, params: serde_json::Value) {
        if let Some(tx) = &self.notifications {
            let _ = tx.try_send(RpcRequest::notification(method, Some(params)));
        }
    }
}

// ---------------------------------------------------------------------------
// Handler plumbing
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: serde_json::Value, ctx: ToolContext) -> Result<ToolResult, ToolError>;
}

/// Adapter so plain async closures register as handlers.
pub struct FnHandler<F>(pub F);

#[async_trait::async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(serde_json::Value, ToolContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ToolResult, ToolError>> + Send + 'static,
{
    async fn call(&self, args: serde_json::Value, ctx: ToolContext) -> Result<ToolResult, ToolError> {
        (self.0)(args, ctx).await
    }
}

#[derive(Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub category: ToolCategory,
    pub input_schema: serde_json::Value,
}

struct RegisteredTool {
    spec: ToolSpec,
    handler: Arc<dyn ToolHandler>,
}

// ---------------------------------------------------------------------------
// ToolRegistry
// ---------------------------------------------------------------------------

/// Name → tool map populated once at boot (the capability gate decides
/// which categories get in) and immutable afterwards.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: ToolSpec, handler: Arc<dyn ToolHandler>) {
        tracing::debug!(tool = %spec.name, category = %spec.category, "tool registered");
        self.tools.insert(spec.name.clone(), RegisteredTool { spec, handler });
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    /// Projection served by `tools/list`.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools
            .values()
            .map(|tool| ToolDescriptor {
                name: tool.spec.name.clone(),
                description: tool.spec.description.clone(),
                input_schema: tool.spec.input_schema.clone(),
            })
            .collect()
    }

    /// Validate and dispatch one call. Every failure path folds into the
    /// protocol result shape; nothing escapes as a transport error.
    pub async fn call(&self, name: &str, args: serde_json::Value, ctx: ToolContext) -> ToolResult {
        let Some(tool) = self.tools.get(name) else {
            return ToolResult::error(format!("✗ unknown tool '{name}'"));
        };
        if let Err(e) = schema::validate(&tool.spec.input_schema, &args) {
            return ToolError::Validation(e.to_string()).into_result();
        }
        match tool.handler.call(args, ctx).await {
            Ok(result) => result,
            Err(e) => {
                tracing::debug!(tool = name, error = %e, "tool call failed");
                e.into_result()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_spec() -> ToolSpec {
        ToolSpec {
            name: "echo".into(),
            description: "Echo the message back".into(),
            category: ToolCategory::Basic,
            input_schema: json!({
                "type": "object",
                "properties": { "message": { "type": "string" } },
                "required": ["message"]
            }),
        }
    }

    fn registry_with_echo() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(
            echo_spec(),
            Arc::new(FnHandler(|args: serde_json::Value, _ctx| async move {
                let message = args["message"].as_str().unwrap_or_default().to_string();
                Ok(ToolResult::text(message))
            })),
        );
        registry
    }

    #[tokio::test]
    async fn dispatch_round_trip() {
        let registry = registry_with_echo();
        assert!(registry.has_tool("echo"));
        let result = registry
            .call("echo", json!({"message": "hello"}), ToolContext::default())
            .await;
        assert!(!result.is_error);
        assert_eq!(result.text_content(), Some("hello"));
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_result() {
        let registry = registry_with_echo();
        let result = registry.call("nope", json!({}), ToolContext::default()).await;
        assert!(result.is_error);
        assert!(result.text_content().unwrap().contains("unknown tool"));
    }

    #[tokio::test]
    async fn schema_rejection_never_reaches_handler() {
        let registry = registry_with_echo();
        let result = registry.call("echo", json!({}), ToolContext::default()).await;
        assert!(result.is_error);
        assert!(result.text_content().unwrap().contains("message"));
    }

    #[tokio::test]
    async fn handler_errors_fold_into_result() {
        let mut registry = ToolRegistry::new();
        let mut spec = echo_spec();
        spec.name = "broken".into();
        spec.input_schema = json!({"type": "object", "properties": {}});
        registry.register(
            spec,
            Arc::new(FnHandler(|_args, _ctx| async move {
                Err::<ToolResult, _>(ToolError::Invariant("task 't1' is already assigned to 'worker-1'".into()))
            })),
        );
        let result = registry.call("broken", json!({}), ToolContext::default()).await;
        assert!(result.is_error);
        assert!(result.text_content().unwrap().contains("already assigned"));
    }

    #[test]
    fn descriptors_are_sorted_by_name() {
        let mut registry = registry_with_echo();
        let mut spec = echo_spec();
        spec.name = "alpha".into();
        registry.register(
            spec,
            Arc::new(FnHandler(|_args, _ctx| async move { Ok(ToolResult::text("a")) })),
        );
        let names: Vec<String> = registry.descriptors().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["alpha", "echo"]);
    }

    #[tokio::test]
    async fn context_notification_is_best_effort() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let ctx = ToolContext {
            notifications: Some(tx),
            ..Default::default()
        };
        ctx.notify("notifications/message", json!({"level": "info"}));
        let sent = rx.recv().await.unwrap();
        assert!(sent.is_notification());
        assert_eq!(sent.method, "notifications/message");

        // No channel: silently dropped.
        ToolContext::default().notify("x", json!({}));
    }
}
