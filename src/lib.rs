pub mod config;
pub mod invitations;
pub mod onboarding;
pub mod rest;
pub mod retry;
pub mod storage;

use std::sync::Arc;

use anyhow::Result;

use config::ServiceConfig;
use invitations::InvitationStore;
use onboarding::ConfirmationEventHandler;
use storage::Storage;

/// Shared application state passed to every HTTP handler and background task.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ServiceConfig>,
    pub storage: Arc<Storage>,
    pub invitations: Arc<InvitationStore>,
    pub handler: Arc<ConfirmationEventHandler>,
    pub started_at: std::time::Instant,
}

impl AppContext {
    /// Open storage under the configured data directory and wire up the
    /// onboarding pipeline.
    pub async fn init(config: ServiceConfig) -> Result<Arc<Self>> {
        let storage = Arc::new(
            Storage::new_with_slow_query(
                &config.data_dir,
                config.observability.slow_query_threshold_ms,
            )
            .await?,
        );
        let invitations = Arc::new(InvitationStore::new(
            storage.pool(),
            config.invitations.ttl_days,
        ));
        let handler = Arc::new(ConfirmationEventHandler::new(
            storage.clone(),
            invitations.clone(),
            &config,
        ));
        Ok(Arc::new(Self {
            config: Arc::new(config),
            storage,
            invitations,
            handler,
            started_at: std::time::Instant::now(),
        }))
    }
}
