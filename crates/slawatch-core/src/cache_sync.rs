//! Keeps the status response cache in step with run mutations.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::cache::RunCache;
use crate::clock::Clock;
use crate::error::Result;
use crate::events::{DomainEvent, EventSubscriber};
use crate::query::StatusQuery;
use crate::store::RunStore;

/// Evicts the status response of every run that changed and, when warming
/// is enabled, recomputes it from the store straight away.
pub struct CacheInvalidator {
    cache: Arc<RunCache>,
    runs: Arc<dyn RunStore>,
    clock: Arc<dyn Clock>,
    warm: Option<Arc<StatusQuery>>,
}

impl std::fmt::Debug for CacheInvalidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheInvalidator")
            .field("warm", &self.warm.is_some())
            .finish_non_exhaustive()
    }
}

impl CacheInvalidator {
    #[must_use]
    pub fn new(cache: Arc<RunCache>, runs: Arc<dyn RunStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache,
            runs,
            clock,
            warm: None,
        }
    }

    /// Recompute evicted responses through `query`.
    #[must_use]
    pub fn warming(mut self, query: Arc<StatusQuery>) -> Self {
        self.warm = Some(query);
        self
    }
}

#[async_trait]
impl EventSubscriber for CacheInvalidator {
    fn name(&self) -> &'static str {
        "cache_invalidator"
    }

    async fn handle(&self, event: &DomainEvent) -> Result<()> {
        let run = event.run();
        // Live detection writes the store directly; mirror the flag from the
        // stored row, which may have completed since the event was built.
        if matches!(event, DomainEvent::SlaBreached { .. }) {
            match self.runs.get_by_id_on(&run.run_id, run.reporting_date).await {
                Ok(Some(stored)) => self.cache.write_through(&stored, self.clock.now()).await,
                Ok(None) => debug!(run_id = %run.run_id, "Breached run no longer stored"),
                Err(err) => warn!(
                    run_id = %run.run_id,
                    error = %err,
                    "Failed to re-read breached run, skipping write-through"
                ),
            }
        }

        let key = run.cache_key();
        self.cache.evict_response(&key, run.frequency).await;
        if let Some(query) = &self.warm {
            let refreshed = query.refresh(&key, run.frequency).await?;
            debug!(
                calculator_id = %key.calculator_id,
                tenant_id = %key.tenant_id,
                kind = event.kind(),
                warmed = refreshed.is_some(),
                "Status response invalidated"
            );
        }
        Ok(())
    }
}
