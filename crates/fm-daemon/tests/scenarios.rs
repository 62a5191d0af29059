//! End-to-end scenarios driven through the tool dispatcher, with a
//! recording multiplexer standing in for tmux and hash-derived embeddings
//! standing in for the provider.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;

use fm_agents::ManagerTiming;
use fm_core::config::ServerConfig;
use fm_core::store::{vector_available, Store};
use fm_core::types::{epoch, AgentStatus, SourceType, Task, TaskStatus};
use fm_daemon::context::ServerContext;
use fm_daemon::tools;
use fm_harness::{ToolContext, ToolRegistry, ToolResult};
use fm_mux::testing::RecordingMux;
use fm_mux::Multiplexer;
use fm_rag::StaticProvider;

const ADMIN: &str = "0123456789abcdef0123456789abcdef";

struct Harness {
    ctx: Arc<ServerContext>,
    registry: Arc<ToolRegistry>,
    mux: Arc<RecordingMux>,
}

async fn harness() -> Harness {
    let store = Arc::new(Store::open_in_memory().await.unwrap());
    let mux = Arc::new(RecordingMux::new());
    let mut config = ServerConfig::default();
    config.project_dir = PathBuf::from("/work");
    config.embedding_provider = "static".into();
    config.embedding_dimension = 16;

    let ctx = ServerContext::assemble(
        config.clone(),
        store,
        mux.clone(),
        Arc::new(StaticProvider::new(16)),
        ManagerTiming::instant(),
        Some(ADMIN.to_string()),
    )
    .await
    .unwrap();

    let mut registry = ToolRegistry::new();
    tools::register_all(&config.tool_categories, &mut registry, &ctx);

    Harness {
        ctx,
        registry: Arc::new(registry),
        mux,
    }
}

impl Harness {
    /// Dispatch the way the transport does: resolve the token argument to
    /// a caller identity, then route through the registry.
    async fn call(&self, name: &str, args: serde_json::Value) -> ToolResult {
        let token = args
            .get("admin_token")
            .or_else(|| args.get("token"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let (is_admin, agent_id) = match token.as_deref() {
            Some(token) if self.ctx.auth.is_admin(token) => (true, None),
            Some(token) => (false, self.ctx.auth.agent_id_for(token).await.unwrap()),
            None => (false, None),
        };
        self.registry
            .call(
                name,
                args,
                ToolContext {
                    session_id: None,
                    is_admin,
                    agent_id,
                    notifications: None,
                },
            )
            .await
    }

    async fn seed_task(&self, task_id: &str, title: &str) {
        self.ctx
            .store
            .insert_task(&Task::new(task_id, title, "admin"))
            .await
            .unwrap();
    }
}

fn text(result: &ToolResult) -> &str {
    result.text_content().unwrap_or_default()
}

// ---------------------------------------------------------------------------
// S1 — create and assign
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s1_create_and_assign() {
    let harness = harness().await;
    harness.seed_task("t_alpha", "Alpha").await;
    harness.seed_task("t_beta", "Beta").await;

    let result = harness
        .call(
            "create_agent",
            json!({
                "agent_id": "worker-1",
                "task_ids": ["t_alpha", "t_beta"],
                "admin_token": ADMIN,
            }),
        )
        .await;
    assert!(!result.is_error, "unexpected error: {}", text(&result));

    let agent = harness.ctx.store.get_agent("worker-1").await.unwrap().unwrap();
    assert_eq!(agent.status, AgentStatus::Created);
    assert!(!agent.color.is_empty());
    assert_eq!(agent.token.len(), 32);
    assert!(agent.token.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(agent.current_task.as_deref(), Some("t_alpha"));

    for task_id in ["t_alpha", "t_beta"] {
        let task = harness.ctx.store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.assigned_to.as_deref(), Some("worker-1"));
    }

    let actions = harness.ctx.store.list_actions("worker-1", 10).await.unwrap();
    let created = actions.iter().find(|a| a.action_type == "created_agent").unwrap();
    assert_eq!(
        created.details.as_ref().unwrap()["assigned_tasks"],
        json!(["t_alpha", "t_beta"])
    );
}

// ---------------------------------------------------------------------------
// S2 — double-assign rejection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s2_double_assign_rejected() {
    let harness = harness().await;
    harness.seed_task("t_gamma", "Gamma").await;
    let first = harness
        .call(
            "create_agent",
            json!({"agent_id": "worker-1", "task_ids": ["t_gamma"], "admin_token": ADMIN}),
        )
        .await;
    assert!(!first.is_error);

    let second = harness
        .call(
            "create_agent",
            json!({"agent_id": "worker-2", "task_ids": ["t_gamma"], "admin_token": ADMIN}),
        )
        .await;
    assert!(second.is_error);
    assert!(text(&second).contains("already assigned"));

    assert!(harness.ctx.store.get_agent("worker-2").await.unwrap().is_none());
    let task = harness.ctx.store.get_task("t_gamma").await.unwrap().unwrap();
    assert_eq!(task.assigned_to.as_deref(), Some("worker-1"));
}

// ---------------------------------------------------------------------------
// S3 — file lock contention
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s3_file_lock_contention() {
    let harness = harness().await;

    let acquire = harness
        .call(
            "update_file_status",
            json!({"filepath": "/p/x.js", "status": "in_use", "agent_id": "worker-1"}),
        )
        .await;
    assert!(!acquire.is_error);

    let contend = harness
        .call(
            "update_file_status",
            json!({"filepath": "/p/x.js", "status": "in_use", "agent_id": "worker-2"}),
        )
        .await;
    assert!(contend.is_error);
    assert!(text(&contend).contains("worker-1"));

    let check = harness
        .call(
            "check_file_status",
            json!({"filepath": "/p/x.js", "agent_id": "worker-2"}),
        )
        .await;
    assert!(!check.is_error);
    let body = text(&check);
    assert!(body.contains("status: locked"));
    assert!(body.contains("can_edit: false"));
    assert!(body.contains("agent_id: worker-1"));
}

// ---------------------------------------------------------------------------
// S4 — terminate unassigns
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s4_terminate_unassigns() {
    let harness = harness().await;
    harness.seed_task("t_alpha", "Alpha").await;
    harness.seed_task("t_beta", "Beta").await;
    harness
        .call(
            "create_agent",
            json!({"agent_id": "worker-1", "task_ids": ["t_alpha", "t_beta"], "admin_token": ADMIN}),
        )
        .await;

    let result = harness
        .call(
            "terminate_agent",
            json!({"agent_id": "worker-1", "admin_token": ADMIN}),
        )
        .await;
    assert!(!result.is_error);

    let agent = harness.ctx.store.get_agent("worker-1").await.unwrap().unwrap();
    assert_eq!(agent.status, AgentStatus::Terminated);
    assert!(agent.terminated_at.is_some());
    assert!(agent.current_task.is_none());

    for task_id in ["t_alpha", "t_beta"] {
        let task = harness.ctx.store.get_task(task_id).await.unwrap().unwrap();
        assert!(task.assigned_to.is_none());
        assert_eq!(task.status, TaskStatus::Pending);
    }
}

// ---------------------------------------------------------------------------
// S5 — dimension migration across a restart
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s5_dimension_migration() {
    if !vector_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("foreman.db");

    {
        let store = Store::open(&db_path).await.unwrap();
        fm_rag::vector::ensure_dimension(&store, 768).await.unwrap();
        let vector = vec![0.25f32; 768];
        for i in 0..3 {
            let id = store
                .insert_chunk(SourceType::Markdown, "/p/a.md", &format!("chunk {i}"), json!({}))
                .await
                .unwrap();
            fm_rag::vector::insert_embedding(&store, id, &vector).await.unwrap();
        }
        store.set_rag_meta("hash_/p/a.md", "somehash").await.unwrap();
        store.set_watermark(SourceType::Markdown, chrono::Utc::now()).await.unwrap();
    }

    // Restart with a different configured dimension.
    let store = Store::open(&db_path).await.unwrap();
    let summary = fm_rag::vector::ensure_dimension(&store, 1536).await.unwrap().unwrap();
    assert_eq!(summary.old_dimension, 768);
    assert_eq!(summary.new_dimension, 1536);

    assert_eq!(fm_rag::vector::embedding_count(&store).await.unwrap(), 0);
    assert_eq!(store.chunk_count().await.unwrap(), 3);
    assert!(store.get_rag_meta("hash_/p/a.md").await.unwrap().is_none());
    assert_eq!(store.watermark(SourceType::Markdown).await.unwrap(), epoch());
    assert_eq!(fm_rag::vector::current_dimension(&store).await.unwrap(), Some(1536));
}

// ---------------------------------------------------------------------------
// S6 — relaunch lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s6_relaunch_lifecycle() {
    let harness = harness().await;
    harness.seed_task("t1", "Only task").await;
    harness
        .call(
            "create_agent",
            json!({"agent_id": "worker-3", "task_ids": ["t1"], "admin_token": ADMIN}),
        )
        .await;
    harness
        .ctx
        .store
        .update_agent_status("worker-3", AgentStatus::Failed)
        .await
        .unwrap();
    assert!(harness.mux.session_exists("worker_3-cdef").await.unwrap());

    let result = harness
        .call(
            "relaunch_agent",
            json!({"agent_id": "worker-3", "admin_token": ADMIN}),
        )
        .await;
    assert!(!result.is_error, "unexpected error: {}", text(&result));
    assert!(text(&result).contains("failed → active"));

    let agent = harness.ctx.store.get_agent("worker-3").await.unwrap().unwrap();
    assert_eq!(agent.status, AgentStatus::Active);

    let commands = harness.mux.commands_sent_to("worker_3-cdef");
    assert_eq!(commands.last().map(String::as_str), Some("clear"));
    assert_eq!(harness.mux.prompts_sent_to("worker_3-cdef").len(), 2);

    let actions = harness.ctx.store.list_actions("worker-3", 10).await.unwrap();
    let relaunch = actions.iter().find(|a| a.action_type == "relaunch_agent").unwrap();
    assert_eq!(relaunch.details.as_ref().unwrap()["previous_status"], "failed");
}

// ---------------------------------------------------------------------------
// Dispatcher-level properties
// ---------------------------------------------------------------------------

#[tokio::test]
async fn admin_gate_blocks_bad_tokens() {
    let harness = harness().await;
    harness.seed_task("t1", "T").await;

    let result = harness
        .call(
            "create_agent",
            json!({"agent_id": "worker-1", "task_ids": ["t1"], "admin_token": "wrong"}),
        )
        .await;
    assert!(result.is_error);
    assert!(text(&result).contains("unauthorized"));
    assert!(harness.ctx.store.get_agent("worker-1").await.unwrap().is_none());
}

#[tokio::test]
async fn capability_gate_is_monotonic() {
    // A registry built from the minimal gate carries exactly the basic
    // tools; one from the full gate carries the whole surface.
    let harness = harness().await;
    let minimal_gate = fm_core::capabilities::ToolCategories::minimal();
    let mut minimal = ToolRegistry::new();
    tools::register_all(&minimal_gate, &mut minimal, &harness.ctx);

    for tool in ["health", "view_status", "list_agents"] {
        assert!(minimal.has_tool(tool));
    }
    for tool in ["create_agent", "ask_project_rag", "send_agent_message", "update_file_status"] {
        assert!(!minimal.has_tool(tool), "{tool} should be gated off");
    }

    for tool in [
        "create_agent",
        "ask_project_rag",
        "send_agent_message",
        "update_file_status",
        "request_assistance",
        "create_background_agent",
        "session_info",
        "view_project_context",
    ] {
        assert!(harness.registry.has_tool(tool), "{tool} missing from full gate");
    }
}

#[tokio::test]
async fn worker_token_flows_through_dispatch() {
    let harness = harness().await;
    harness.seed_task("t1", "T").await;
    harness
        .call(
            "create_agent",
            json!({"agent_id": "worker-1", "task_ids": ["t1"], "admin_token": ADMIN}),
        )
        .await;
    let token = harness.ctx.store.get_agent("worker-1").await.unwrap().unwrap().token;

    // The worker moves its own task along.
    let result = harness
        .call(
            "update_task_status",
            json!({"token": token, "task_id": "t1", "status": "in_progress", "note": "picking this up"}),
        )
        .await;
    assert!(!result.is_error, "unexpected error: {}", text(&result));

    let task = harness.ctx.store.get_task("t1").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(task.notes.len(), 1);

    // A bogus token is not an identity.
    let result = harness
        .call(
            "update_task_status",
            json!({"token": "bogus", "task_id": "t1", "status": "completed"}),
        )
        .await;
    assert!(result.is_error);
}

#[tokio::test]
async fn rag_tools_surface_clear_unavailability() {
    if !vector_available() {
        return;
    }
    let harness = harness().await;
    fm_rag::vector::ensure_dimension(&harness.ctx.store, 16).await.unwrap();

    // No index content yet: the error names the cause.
    let result = harness.call("ask_project_rag", json!({"query": "how do builds work"})).await;
    assert!(result.is_error);
    assert!(text(&result).contains("empty"));

    let status = harness.call("get_rag_status", json!({})).await;
    assert!(!status.is_error);
    assert!(text(&status).contains("available: true"));
    assert!(text(&status).contains("last_indexed_markdown"));
}
