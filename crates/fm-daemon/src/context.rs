use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;

use fm_agents::{
    AdminNotifier, AgentManager, FileLockArbiter, ManagerTiming, MessageBus, TaskEngine,
    TmuxAdminNotifier,
};
use fm_core::auth::Auth;
use fm_core::config::ServerConfig;
use fm_core::store::Store;
use fm_mux::Multiplexer;
use fm_rag::{EmbeddingProvider, RagQuery};

use crate::sessions::SessionManager;

/// Everything a tool handler can reach, assembled once at boot.
pub struct ServerContext {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub auth: Arc<Auth>,
    pub mux: Arc<dyn Multiplexer>,
    pub manager: Arc<AgentManager>,
    pub tasks: Arc<TaskEngine>,
    pub locks: Arc<FileLockArbiter>,
    pub bus: Arc<MessageBus>,
    pub rag: Arc<RagQuery>,
    pub provider: Arc<dyn EmbeddingProvider>,
    pub sessions: Arc<SessionManager>,
    pub started_at: Instant,
}

impl ServerContext {
    /// Wire the component graph. The store must already be open and the
    /// vector dimension check must have run; this only builds the layers
    /// above it.
    pub async fn assemble(
        config: ServerConfig,
        store: Arc<Store>,
        mux: Arc<dyn Multiplexer>,
        provider: Arc<dyn EmbeddingProvider>,
        timing: ManagerTiming,
        admin_token: Option<String>,
    ) -> anyhow::Result<Arc<Self>> {
        let auth = Arc::new(match admin_token {
            Some(token) => Auth::with_admin_token(store.clone(), token),
            None => Auth::new(store.clone()),
        });

        let manager = Arc::new(
            AgentManager::new(store.clone(), auth.clone(), mux.clone(), config.clone())
                .with_timing(timing),
        );
        let notifier: Arc<dyn AdminNotifier> = Arc::new(TmuxAdminNotifier::new(
            mux.clone(),
            config.admin_session.clone(),
        ));
        let bus = Arc::new(MessageBus::new(
            store.clone(),
            manager.clone(),
            mux.clone(),
            notifier,
        ));
        let sessions = Arc::new(SessionManager::new(
            store.clone(),
            chrono::Duration::minutes(config.grace_period_minutes),
        ));
        let rag = Arc::new(RagQuery::new(store.clone(), provider.clone()));

        let context = Arc::new(Self {
            tasks: Arc::new(TaskEngine::new(store.clone())),
            locks: Arc::new(FileLockArbiter::new(store.clone())),
            config,
            store,
            auth,
            mux,
            manager,
            bus,
            rag,
            provider,
            sessions,
            started_at: Instant::now(),
        });
        context
            .store
            .upsert_admin_config(
                "server_started_at",
                serde_json::json!(chrono::Utc::now().to_rfc3339()),
                Some("last daemon boot".into()),
                "admin",
            )
            .await
            .context("failed to stamp boot time")?;
        Ok(context)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
