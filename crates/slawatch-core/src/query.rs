//! Read side: calculator status, batch status, run history, single runs,
//! daily aggregates and running counts.
//!
//! Every read tries the cache first and falls back to a partition-pruned
//! store query on a miss, repopulating the cache with what it read.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Days, NaiveDate};
use tracing::debug;

use crate::cache::RunCache;
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::model::{CalculatorKey, CalculatorStatusResponse, DailyAggregate, Frequency, JobRun};
use crate::store::{AggregateStore, RunStore};
use crate::store::partition::RECENT_LOOKUP_DAYS;

pub struct StatusQuery {
    runs: Arc<dyn RunStore>,
    aggregates: Arc<dyn AggregateStore>,
    cache: Arc<RunCache>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for StatusQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusQuery")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl StatusQuery {
    #[must_use]
    pub fn new(
        runs: Arc<dyn RunStore>,
        aggregates: Arc<dyn AggregateStore>,
        cache: Arc<RunCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            runs,
            aggregates,
            cache,
            clock,
        }
    }

    /// Current run plus history for one calculator.
    pub async fn status(
        &self,
        key: &CalculatorKey,
        frequency: Frequency,
    ) -> Result<CalculatorStatusResponse> {
        if let Some(response) = self.cache.get_response(key, frequency).await {
            return Ok(response);
        }
        self.refresh(key, frequency)
            .await?
            .ok_or_else(|| Error::CalculatorNotFound {
                calculator_id: key.calculator_id.clone(),
                tenant_id: key.tenant_id.clone(),
            })
    }

    /// Recompute one status response from the store and cache it.
    /// `None` when the calculator has no runs in its partition window.
    pub async fn refresh(
        &self,
        key: &CalculatorKey,
        frequency: Frequency,
    ) -> Result<Option<CalculatorStatusResponse>> {
        let runs = self
            .runs
            .query_recent(key, frequency, self.clock.today(), self.window_limit())
            .await?;
        let Some(response) = CalculatorStatusResponse::from_runs(&runs, self.clock.now()) else {
            return Ok(None);
        };
        self.cache.set_response(&response, frequency).await;
        Ok(Some(response))
    }

    /// Status for many calculators of one tenant, in request order.
    ///
    /// Cache misses are resolved with a single batch store query.
    /// Calculators without runs are left out.
    pub async fn batch_status(
        &self,
        calculator_ids: &[String],
        tenant_id: &str,
        frequency: Frequency,
    ) -> Result<Vec<CalculatorStatusResponse>> {
        let mut seen = HashSet::new();
        let requested: Vec<String> = calculator_ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect();

        let mut found = self
            .cache
            .get_responses(&requested, tenant_id, frequency)
            .await;
        let misses: Vec<String> = requested
            .iter()
            .filter(|id| !found.contains_key(id.as_str()))
            .cloned()
            .collect();

        if !misses.is_empty() {
            let now = self.clock.now();
            let by_calculator = self
                .runs
                .query_batch_recent(
                    &misses,
                    tenant_id,
                    frequency,
                    self.clock.today(),
                    self.window_limit(),
                )
                .await?;
            let fresh: Vec<CalculatorStatusResponse> = misses
                .iter()
                .filter_map(|id| {
                    by_calculator
                        .get(id)
                        .and_then(|runs| CalculatorStatusResponse::from_runs(runs, now))
                })
                .collect();
            debug!(
                cached = found.len(),
                queried = misses.len(),
                resolved = fresh.len(),
                "Batch status resolved from store"
            );
            self.cache.set_responses(&fresh, frequency).await;
            found.extend(fresh.into_iter().map(|r| (r.calculator_id.clone(), r)));
        }

        Ok(requested
            .iter()
            .filter_map(|id| found.remove(id.as_str()))
            .collect())
    }

    /// Latest runs for one calculator, newest first.
    pub async fn run_history(
        &self,
        key: &CalculatorKey,
        frequency: Frequency,
        limit: usize,
    ) -> Result<Vec<JobRun>> {
        if let Some(runs) = self.cache.recent_runs(key, limit).await {
            if runs.iter().all(|r| r.frequency == frequency) {
                return Ok(runs);
            }
        }
        self.runs
            .query_recent(key, frequency, self.clock.today(), limit)
            .await
    }

    /// One run by id. Runs of another tenant are refused.
    pub async fn run(&self, run_id: &str, tenant_id: &str) -> Result<JobRun> {
        let run = self
            .runs
            .find_recent(run_id, self.clock.today())
            .await?
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?;
        if run.tenant_id != tenant_id {
            return Err(Error::TenantAccessDenied {
                run_id: run_id.to_string(),
                tenant_id: tenant_id.to_string(),
            });
        }
        Ok(run)
    }

    /// Daily aggregates covering today and the `days` reporting dates
    /// before it, newest first.
    pub async fn daily_averages(
        &self,
        key: &CalculatorKey,
        days: u32,
    ) -> Result<Vec<DailyAggregate>> {
        let today = self.clock.today();
        let since = today
            .checked_sub_days(Days::new(u64::from(days)))
            .unwrap_or(NaiveDate::MIN);
        self.aggregates.recent_aggregates(key, since).await
    }

    /// Whether the calculator has a RUNNING run.
    pub async fn is_running(&self, key: &CalculatorKey, frequency: Frequency) -> Result<bool> {
        if let Some(running) = self.cache.is_running(key).await {
            return Ok(running);
        }
        let latest = self
            .runs
            .query_recent(key, frequency, self.clock.today(), 1)
            .await?;
        Ok(latest.first().is_some_and(JobRun::is_running))
    }

    /// Number of RUNNING (calculator, tenant) pairs; falls back to counting
    /// RUNNING rows of the last seven reporting dates.
    pub async fn running_count(&self) -> Result<u64> {
        if let Some(count) = self.cache.running_count().await {
            return Ok(count);
        }
        let today = self.clock.today();
        let since = today
            .checked_sub_days(Days::new(RECENT_LOOKUP_DAYS))
            .unwrap_or(today);
        self.runs.count_running(since).await
    }

    fn window_limit(&self) -> usize {
        self.cache.history_limit() + 1
    }
}
