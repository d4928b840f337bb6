use std::sync::Arc;

use shared::config::server::Config;
use tokio_util::sync::CancellationToken;

use crate::{
    bridge::HubHandle,
    cache::{CacheBackend, ReadStateCache, SeenByTracker},
    handlers::streaming::DeliveryHub,
    services::{
        pagination::PaginationEngine, read_tracking::ReadTracker,
        reconciliation::ReconciliationWorker,
    },
    store::{MembershipDirectory, MessageStore, ReceiptStore},
};

/// External collaborators the application is assembled from.
pub struct Dependencies {
    pub pool: Option<sqlx::PgPool>,
    pub messages: Arc<dyn MessageStore>,
    pub receipts: Arc<dyn ReceiptStore>,
    pub directory: Arc<dyn MembershipDirectory>,
    pub cache: Arc<dyn CacheBackend>,
    pub hub: Option<HubHandle>,
    /// Cancelled when the process shuts down; long-lived responses end with it.
    pub shutdown: CancellationToken,
}

// Application state that will be shared across all routes
#[derive(Clone)]
pub struct AppState {
    pub(crate) pool: Option<sqlx::PgPool>,
    pub(crate) read_state: ReadStateCache,
    pub(crate) read_tracker: ReadTracker,
    pub(crate) pagination: PaginationEngine,
    pub(crate) reconciliation: ReconciliationWorker,
    pub(crate) directory: Arc<dyn MembershipDirectory>,
    pub(crate) delivery: Arc<DeliveryHub>,
    pub(crate) hub: Option<HubHandle>,
    pub(crate) shutdown: CancellationToken,
}

impl AppState {
    pub fn build(deps: Dependencies, config: &Config) -> Self {
        let read_state = ReadStateCache::new(Arc::clone(&deps.cache), &config.cache);
        let seen_by = SeenByTracker::new(deps.cache, &config.cache);

        let read_tracker = ReadTracker::new(
            read_state.clone(),
            seen_by.clone(),
            Arc::clone(&deps.messages),
            Arc::clone(&deps.directory),
            deps.hub.clone(),
        );
        let pagination = PaginationEngine::new(
            deps.messages,
            Arc::clone(&deps.directory),
            read_state.clone(),
            config.pagination.clone(),
        );
        let reconciliation = ReconciliationWorker::new(
            seen_by,
            deps.receipts,
            config.reconciliation.clone(),
        );

        Self {
            pool: deps.pool,
            read_state,
            read_tracker,
            pagination,
            reconciliation,
            directory: deps.directory,
            delivery: Arc::new(DeliveryHub::new(&config.delivery)),
            hub: deps.hub,
            shutdown: deps.shutdown,
        }
    }
}
