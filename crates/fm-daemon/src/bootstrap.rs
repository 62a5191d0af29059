use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tokio::net::TcpListener;
use tracing::{info, warn};

use fm_agents::ManagerTiming;
use fm_core::config::ServerConfig;
use fm_core::store::{vector_available, Store};
use fm_harness::ToolRegistry;
use fm_mux::{Multiplexer, TmuxMultiplexer};
use fm_rag::{EmbeddingProvider, HttpEmbeddingProvider, RagIndexer, StaticProvider};

use crate::context::ServerContext;
use crate::http::{router, HttpState};
use crate::tools;

const INDEX_INTERVAL: Duration = Duration::from_secs(60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Full assembly: open the store, run the vector dimension check, mint the
/// admin token, register the gated tool surface, spawn the background
/// loops, and serve until ctrl-c.
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let store = Arc::new(
        Store::open(config.db_path())
            .await
            .with_context(|| format!("failed to open store at {}", config.db_path().display()))?,
    );

    // Vector probe + dimension check. A migration failure is fatal at
    // boot; a missing extension only disables the RAG surface.
    if vector_available() {
        match fm_rag::vector::ensure_dimension(&store, config.embedding_dimension).await {
            Ok(Some(migration)) => info!(
                old = migration.old_dimension,
                new = migration.new_dimension,
                dropped = migration.dropped_embeddings,
                "embedding dimension migrated"
            ),
            Ok(None) => {}
            Err(e) => anyhow::bail!("vector dimension check failed: {e}"),
        }
    } else {
        warn!("vec0 extension unavailable — RAG tools will report errors");
    }

    let provider = build_provider(&config);
    let mux: Arc<dyn Multiplexer> = Arc::new(TmuxMultiplexer::new());
    if !mux.available().await {
        warn!("tmux not found — agent sessions cannot be created; records will still be kept");
    }

    let ctx = ServerContext::assemble(
        config.clone(),
        store,
        mux,
        provider,
        ManagerTiming::default(),
        None,
    )
    .await?;

    info!(
        port = config.port,
        project = %config.project_dir.display(),
        admin_token = %ctx.auth.admin_token(),
        "foreman coordinator starting"
    );
    for category in config.tool_categories.enabled() {
        info!(%category, "category enabled");
    }

    let mut registry = ToolRegistry::new();
    tools::register_all(&config.tool_categories, &mut registry, &ctx);

    // Background loops, all tied to one shutdown signal.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    if vector_available() {
        let indexer = Arc::new(RagIndexer::new(
            ctx.store.clone(),
            ctx.provider.clone(),
            config.project_dir.clone(),
            INDEX_INTERVAL,
        ));
        tokio::spawn(indexer.run(shutdown_rx.clone()));
    }
    tokio::spawn(ctx.sessions.clone().run_sweeper(SWEEP_INTERVAL, shutdown_rx));

    let state = Arc::new(HttpState {
        ctx,
        registry: Arc::new(registry),
    });
    let listener = TcpListener::bind(("127.0.0.1", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    info!("listening on http://127.0.0.1:{}/mcp", config.port);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    let _ = shutdown_tx.send(true);
    info!("foreman stopped");
    Ok(())
}

/// First ctrl-c drains gracefully; a second one force-exits.
async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    info!("ctrl-c received, draining connections (press again to force quit)");
    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("second ctrl-c — exiting immediately");
            std::process::exit(130);
        }
    });
}

fn build_provider(config: &ServerConfig) -> Arc<dyn EmbeddingProvider> {
    match config.embedding_provider.as_str() {
        "static" | "offline" => Arc::new(StaticProvider::new(config.embedding_dimension)),
        other => {
            let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
            if api_key.is_empty() {
                warn!(provider = other, "OPENAI_API_KEY not set — embedding calls will fail until configured");
            }
            let mut provider = HttpEmbeddingProvider::new(
                api_key,
                "text-embedding-3-small",
                config.embedding_dimension,
            );
            if let Some(base) = &config.embedding_api_base {
                provider = provider.with_base_url(base.clone());
            }
            Arc::new(provider)
        }
    }
}
