pub mod adapters;
pub mod config;
pub mod error;
pub mod hub;
pub mod manager;
pub mod model;
pub mod providers;
pub mod rest;
pub mod service;
pub mod sinks;
pub mod store;
pub mod syncer;
pub mod worktree;

use std::sync::Arc;

use config::DaemonConfig;
use manager::SessionManager;
use service::SessionService;
use store::Stores;

/// Shared application state passed to every REST handler and background
/// task, built once at startup.
#[derive(Clone)]
pub struct AppContext {
    pub config: DaemonConfig,
    pub stores: Stores,
    pub manager: Arc<SessionManager>,
    pub service: Arc<SessionService>,
    pub started_at: std::time::Instant,
    pub daemon_id: String,
}

impl AppContext {
    pub async fn new(config: DaemonConfig) -> anyhow::Result<Self> {
        let stores = Stores::new(&config.data_dir).await?;
        let manager = Arc::new(SessionManager::new(
            config.data_dir.join("sessions"),
            stores.clone(),
            config.clone(),
        ));
        let service = Arc::new(SessionService::new(manager.clone(), stores.clone(), config.clone()));
        let daemon_id = uuid::Uuid::new_v4().to_string();

        Ok(Self {
            config,
            stores,
            manager,
            service,
            started_at: std::time::Instant::now(),
            daemon_id,
        })
    }
}
