//! Wiring of stores, cache, index, event bus and the services on top.
//!
//! ```text
//!  RunIngestion ──► SqliteStore ◄── StatusQuery ◄── CacheInvalidator
//!       │               ▲                                 ▲
//!       ├──► RunCache   │                                 │
//!       ├──► DeadlineIndex ──► BreachDetector ──► EventBus┤
//!       └──────────────────────────────────────► EventBus─┴──► AlertPipeline ──► AlertSink
//! ```

use std::sync::Arc;

use tracing::info;

use crate::alert_sink::{AlertSink, build_sink};
use crate::alerting::AlertPipeline;
use crate::cache::{CacheBackend, RunCache, connect_backend};
use crate::cache_sync::CacheInvalidator;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::deadline_index::DeadlineIndex;
use crate::detection::BreachDetector;
use crate::error::Result;
use crate::events::EventBus;
use crate::ingestion::RunIngestion;
use crate::query::StatusQuery;
use crate::store::SqliteStore;

/// Every long-lived service of one slawatch node.
#[derive(Clone)]
pub struct Services {
    pub store: SqliteStore,
    pub backend: Arc<dyn CacheBackend>,
    pub cache: Arc<RunCache>,
    pub index: DeadlineIndex,
    pub bus: Arc<EventBus>,
    pub clock: Arc<dyn Clock>,
    pub ingestion: Arc<RunIngestion>,
    pub query: Arc<StatusQuery>,
    pub detector: Arc<BreachDetector>,
    pub alerts: Arc<AlertPipeline>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("store", &self.store)
            .field("cache", &self.cache)
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

impl Services {
    /// Open the configured store, cache backend and alert sink.
    pub async fn open(config: &Config) -> Result<Self> {
        let store = SqliteStore::open(&config.store.db_path, config.store.command_timeout())?;
        let backend = connect_backend(&config.cache).await?;
        let sink = build_sink(&config.alerting)?;
        info!(
            db_path = %config.store.db_path,
            cache = ?config.cache.backend,
            sink = sink.name(),
            "Services opened"
        );
        Ok(Self::assemble(config, store, backend, sink, Arc::new(SystemClock)))
    }

    /// Wire services over already-open resources.
    #[must_use]
    pub fn assemble(
        config: &Config,
        store: SqliteStore,
        backend: Arc<dyn CacheBackend>,
        sink: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cache = Arc::new(RunCache::from_config(Arc::clone(&backend), &config.cache));
        let index = DeadlineIndex::new(Arc::clone(&backend), &config.cache.key_prefix);
        let bus = Arc::new(EventBus::new(config.events.dispatch));
        let runs = Arc::new(store.clone());

        let query = Arc::new(StatusQuery::new(
            runs.clone(),
            runs.clone(),
            Arc::clone(&cache),
            Arc::clone(&clock),
        ));
        let ingestion = Arc::new(RunIngestion::new(
            runs.clone(),
            runs.clone(),
            runs.clone(),
            Arc::clone(&cache),
            index.clone(),
            Arc::clone(&bus),
            Arc::clone(&clock),
        ));
        let detector = Arc::new(BreachDetector::new(
            runs.clone(),
            index.clone(),
            Arc::clone(&bus),
            config.detection.early_warning_window_minutes,
        ));
        let alerts = Arc::new(AlertPipeline::new(
            runs.clone(),
            runs.clone(),
            sink,
            Arc::clone(&clock),
            &config.alerting,
        ));

        let mut invalidator = CacheInvalidator::new(
            Arc::clone(&cache),
            runs,
            Arc::clone(&clock),
        );
        if config.cache.warm_on_change {
            invalidator = invalidator.warming(Arc::clone(&query));
        }
        bus.subscribe(Arc::new(invalidator));
        bus.subscribe(alerts.clone());

        Self {
            store,
            backend,
            cache,
            index,
            bus,
            clock,
            ingestion,
            query,
            detector,
            alerts,
        }
    }
}
