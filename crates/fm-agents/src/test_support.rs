//! Shared fixtures for this crate's tests.

use std::path::PathBuf;
use std::sync::Arc;

use fm_core::auth::Auth;
use fm_core::config::ServerConfig;
use fm_core::store::Store;
use fm_core::types::Task;
use fm_mux::testing::RecordingMux;

use crate::manager::{AgentManager, ManagerTiming};

pub(crate) const ADMIN_TOKEN: &str = "0123456789abcdef0123456789abcdef";

pub(crate) async fn manager_with(mux: Arc<RecordingMux>) -> Arc<AgentManager> {
    let store = Arc::new(Store::open_in_memory().await.unwrap());
    let auth = Arc::new(Auth::with_admin_token(store.clone(), ADMIN_TOKEN));
    let mut config = ServerConfig::default();
    config.project_dir = PathBuf::from("/work");
    Arc::new(AgentManager::new(store, auth, mux, config).with_timing(ManagerTiming::instant()))
}

pub(crate) async fn seed_tasks(manager: &AgentManager, ids: &[&str]) {
    for id in ids {
        manager.store().insert_task(&Task::new(*id, *id, "admin")).await.unwrap();
    }
}
