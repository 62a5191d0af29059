use std::sync::Arc;

use serde_json::json;

use fm_core::capabilities::ToolCategory;
use fm_harness::{FnHandler, ToolError, ToolRegistry, ToolResult, ToolSpec};
use fm_rag::query::DEFAULT_TOP_K;

use crate::context::ServerContext;
use crate::tools::{core_err, rag_err, require_caller, str_arg, u32_arg};

pub fn register(registry: &mut ToolRegistry, ctx: &Arc<ServerContext>) {
    register_ask(registry, ctx);
    register_status(registry, ctx);
}

// ---------------------------------------------------------------------------
// ask_project_rag / get_rag_status
// ---------------------------------------------------------------------------

fn register_ask(registry: &mut ToolRegistry, ctx: &Arc<ServerContext>) {
    let ctx = ctx.clone();
    registry.register(
        ToolSpec {
            name: "ask_project_rag".into(),
            description: "Ask the indexed project knowledge base; answers cite their source chunks.".into(),
            category: ToolCategory::Rag,
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "top_k": { "type": "integer" }
                },
                "required": ["query"]
            }),
        },
        Arc::new(FnHandler(move |args: serde_json::Value, _tctx| {
            let ctx = ctx.clone();
            async move {
                let query = str_arg(&args, "query").unwrap_or_default();
                if query.trim().is_empty() {
                    return Err(ToolError::Validation("query must not be empty".into()));
                }
                let top_k = u32_arg(&args, "top_k", DEFAULT_TOP_K as u32) as usize;
                let answer = ctx.rag.ask(&query, top_k).await.map_err(rag_err)?;
                Ok(ToolResult::text(answer))
            }
        })),
    );
}

fn register_status(registry: &mut ToolRegistry, ctx: &Arc<ServerContext>) {
    let ctx = ctx.clone();
    registry.register(
        ToolSpec {
            name: "get_rag_status".into(),
            description: "Vector index health: availability, dimension, counts, and per-source watermarks.".into(),
            category: ToolCategory::Rag,
            input_schema: json!({ "type": "object", "properties": {} }),
        },
        Arc::new(FnHandler(move |_args, _tctx| {
            let ctx = ctx.clone();
            async move {
                let status = ctx.rag.status().await.map_err(rag_err)?;
                let mut text = format!(
                    "RAG status\n  available: {}\n  provider: {}\n  dimension: {}\n  chunks: {}\n  embeddings: {}",
                    status.available,
                    status.provider,
                    status.dimension.map(|d| d.to_string()).unwrap_or_else(|| "-".into()),
                    status.chunk_count,
                    status.embedding_count,
                );
                for (source, watermark) in &status.watermarks {
                    text.push_str(&format!("\n  last_indexed_{source}: {watermark}"));
                }
                Ok(ToolResult::text(text))
            }
        })),
    );
}

// ---------------------------------------------------------------------------
// Project-context & file-metadata stores ("memory" category)
// ---------------------------------------------------------------------------

pub fn register_memory(registry: &mut ToolRegistry, ctx: &Arc<ServerContext>) {
    register_update_context(registry, ctx);
    register_view_context(registry, ctx);
    register_update_filemeta(registry, ctx);
    register_view_filemeta(registry, ctx);
}

fn register_update_context(registry: &mut ToolRegistry, ctx: &Arc<ServerContext>) {
    let ctx = ctx.clone();
    registry.register(
        ToolSpec {
            name: "update_project_context".into(),
            description: "Store or update one project-context entry (JSON value under a stable key).".into(),
            category: ToolCategory::Memory,
            input_schema: json!({
                "type": "object",
                "properties": {
                    "token": { "type": "string" },
                    "key": { "type": "string" },
                    "value": {},
                    "description": { "type": "string" }
                },
                "required": ["token", "key", "value"]
            }),
        },
        Arc::new(FnHandler(move |args: serde_json::Value, tctx| {
            let ctx = ctx.clone();
            async move {
                let actor = require_caller(&tctx)?;
                let key = str_arg(&args, "key").unwrap_or_default();
                let value = args.get("value").cloned().unwrap_or(serde_json::Value::Null);
                ctx.store
                    .upsert_context(&key, value, str_arg(&args, "description"), actor.name())
                    .await
                    .map_err(core_err)?;
                Ok(ToolResult::text(format!("✓ context '{key}' updated")))
            }
        })),
    );
}

fn register_view_context(registry: &mut ToolRegistry, ctx: &Arc<ServerContext>) {
    let ctx = ctx.clone();
    registry.register(
        ToolSpec {
            name: "view_project_context".into(),
            description: "Read one context entry by key, or list all of them.".into(),
            category: ToolCategory::Memory,
            input_schema: json!({
                "type": "object",
                "properties": { "key": { "type": "string" } }
            }),
        },
        Arc::new(FnHandler(move |args: serde_json::Value, _tctx| {
            let ctx = ctx.clone();
            async move {
                match str_arg(&args, "key") {
                    Some(key) => match ctx.store.get_context(&key).await.map_err(core_err)? {
                        Some(entry) => Ok(ToolResult::text(format!(
                            "{}: {}\n  updated {} by {}{}",
                            entry.key,
                            entry.value,
                            entry.last_updated.to_rfc3339(),
                            entry.updated_by,
                            entry
                                .description
                                .as_deref()
                                .map(|d| format!("\n  {d}"))
                                .unwrap_or_default(),
                        ))),
                        None => Ok(ToolResult::error(format!("✗ no context entry '{key}'"))),
                    },
                    None => {
                        let entries = ctx.store.list_context().await.map_err(core_err)?;
                        if entries.is_empty() {
                            return Ok(ToolResult::text("Project context is empty."));
                        }
                        let mut text = format!("{} entry(ies):", entries.len());
                        for entry in entries {
                            text.push_str(&format!("\n• {}: {}", entry.key, entry.value));
                        }
                        Ok(ToolResult::text(text))
                    }
                }
            }
        })),
    );
}

fn register_update_filemeta(registry: &mut ToolRegistry, ctx: &Arc<ServerContext>) {
    let ctx = ctx.clone();
    registry.register(
        ToolSpec {
            name: "update_file_metadata".into(),
            description: "Attach JSON metadata to a file path.".into(),
            category: ToolCategory::Memory,
            input_schema: json!({
                "type": "object",
                "properties": {
                    "token": { "type": "string" },
                    "filepath": { "type": "string" },
                    "metadata": {},
                    "description": { "type": "string" }
                },
                "required": ["token", "filepath", "metadata"]
            }),
        },
        Arc::new(FnHandler(move |args: serde_json::Value, tctx| {
            let ctx = ctx.clone();
            async move {
                let actor = require_caller(&tctx)?;
                let filepath = str_arg(&args, "filepath").unwrap_or_default();
                let metadata = args.get("metadata").cloned().unwrap_or(serde_json::Value::Null);
                ctx.store
                    .upsert_file_metadata(&filepath, metadata, str_arg(&args, "description"), actor.name())
                    .await
                    .map_err(core_err)?;
                Ok(ToolResult::text(format!("✓ metadata for {filepath} updated")))
            }
        })),
    );
}

fn register_view_filemeta(registry: &mut ToolRegistry, ctx: &Arc<ServerContext>) {
    let ctx = ctx.clone();
    registry.register(
        ToolSpec {
            name: "view_file_metadata".into(),
            description: "Read metadata for one path, or list every annotated path.".into(),
            category: ToolCategory::Memory,
            input_schema: json!({
                "type": "object",
                "properties": { "filepath": { "type": "string" } }
            }),
        },
        Arc::new(FnHandler(move |args: serde_json::Value, _tctx| {
            let ctx = ctx.clone();
            async move {
                match str_arg(&args, "filepath") {
                    Some(filepath) => {
                        match ctx.store.get_file_metadata(&filepath).await.map_err(core_err)? {
                            Some(entry) => Ok(ToolResult::text(format!("{}: {}", entry.key, entry.value))),
                            None => Ok(ToolResult::error(format!("✗ no metadata for '{filepath}'"))),
                        }
                    }
                    None => {
                        let entries = ctx.store.list_file_metadata().await.map_err(core_err)?;
                        if entries.is_empty() {
                            return Ok(ToolResult::text("No file metadata recorded."));
                        }
                        let mut text = format!("{} annotated file(s):", entries.len());
                        for entry in entries {
                            text.push_str(&format!("\n• {}: {}", entry.key, entry.value));
                        }
                        Ok(ToolResult::text(text))
                    }
                }
            }
        })),
    );
}
