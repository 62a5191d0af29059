//! foreman daemon — the multi-agent coordination server.
//!
//! Usage: `fm-daemon [project_dir]`. Configuration is read from
//! `<project_dir>/.agent/config.json` with environment fallbacks
//! (`PORT`, `FM_DEBUG`, `EMBEDDING_PROVIDER`, `EMBEDDING_DIMENSION`).

use anyhow::Context as _;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let default_level = if std::env::var("FM_DEBUG").map(|v| v == "1" || v == "true").unwrap_or(false)
    {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let project_dir = std::env::args()
        .nth(1)
        .map(std::path::PathBuf::from)
        .unwrap_or(std::env::current_dir().context("cannot resolve current directory")?);

    let config = fm_core::config::ServerConfig::load(&project_dir)
        .with_context(|| format!("failed to load config for {}", project_dir.display()))?;

    fm_daemon::bootstrap::run(config).await
}
