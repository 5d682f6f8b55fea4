//! Canonical store contracts.
//!
//! The canonical store is the only source of truth for runs, breach events,
//! calculator definitions and daily aggregates. Everything in `cache` and
//! `deadline_index` is derived from it and may be dropped at any time.
//!
//! Run reads are always shaped by a [`partition::PartitionWindow`]; callers
//! pass the business date (`today`) explicitly so the store never consults
//! a clock of its own.

pub mod partition;
pub mod sqlite;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{BreachEvent, CalculatorKey, DailyAggregate, Frequency, JobDefinition, JobRun};

pub use sqlite::SqliteStore;

/// Run persistence used by ingestion, detection and queries.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Full lookup by run id across all reporting dates (newest first wins).
    async fn get_by_id(&self, run_id: &str) -> Result<Option<JobRun>>;

    /// Lookup by run id inside a single reporting-date partition.
    async fn get_by_id_on(&self, run_id: &str, reporting_date: NaiveDate)
    -> Result<Option<JobRun>>;

    /// Probe the last seven reporting dates by key, then fall back to a full lookup.
    async fn find_recent(&self, run_id: &str, today: NaiveDate) -> Result<Option<JobRun>>;

    /// Insert or update a run keyed by (run_id, reporting_date).
    ///
    /// Updates apply only while the stored run is still RUNNING, and never
    /// clear an already-set breach flag or reason. Returns the stored row.
    async fn upsert(&self, run: &JobRun) -> Result<JobRun>;

    /// Most recent runs for one calculator inside its partition window,
    /// ordered by reporting date then creation time, newest first.
    async fn query_recent(
        &self,
        key: &CalculatorKey,
        frequency: Frequency,
        today: NaiveDate,
        limit: usize,
    ) -> Result<Vec<JobRun>>;

    /// Top `limit` runs per calculator for many calculators in one query.
    async fn query_batch_recent(
        &self,
        calculator_ids: &[String],
        tenant_id: &str,
        frequency: Frequency,
        today: NaiveDate,
        limit: usize,
    ) -> Result<HashMap<String, Vec<JobRun>>>;

    /// Compare-and-set breach flag: succeeds only while the run is RUNNING
    /// and not yet breached. Returns whether this call set the flag.
    async fn conditional_mark_breached(
        &self,
        run_id: &str,
        reporting_date: NaiveDate,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Number of RUNNING runs with a reporting date on or after `since`.
    async fn count_running(&self, since: NaiveDate) -> Result<u64>;

    /// Counters of issued queries, by shape.
    fn stats(&self) -> StoreStatsSnapshot;
}

/// Result of an idempotent breach insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(BreachEvent),
    /// A breach already existed for this run id; carries the stored row.
    AlreadyRecorded(BreachEvent),
}

impl CreateOutcome {
    #[must_use]
    pub fn event(&self) -> &BreachEvent {
        match self {
            Self::Created(event) | Self::AlreadyRecorded(event) => event,
        }
    }

    #[must_use]
    pub fn into_event(self) -> BreachEvent {
        match self {
            Self::Created(event) | Self::AlreadyRecorded(event) => event,
        }
    }

    #[must_use]
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Breach event persistence for the alert pipeline.
#[async_trait]
pub trait BreachStore: Send + Sync {
    /// Insert guarded by the unique run id; a conflict is not an error.
    async fn create(&self, breach: &BreachEvent) -> Result<CreateOutcome>;

    async fn get_by_run_id(&self, run_id: &str) -> Result<Option<BreachEvent>>;

    /// PENDING or FAILED breaches, plus RETRYING ones last updated before
    /// `retrying_before` (sends abandoned mid-flight), oldest first.
    async fn find_unalerted(
        &self,
        limit: usize,
        retrying_before: DateTime<Utc>,
    ) -> Result<Vec<BreachEvent>>;

    /// Persist alerted/alerted_at/alert_status/retry_count/last_error/updated_at by breach id.
    async fn update_alert_state(&self, breach: &BreachEvent) -> Result<()>;
}

/// Calculator catalog.
#[async_trait]
pub trait JobCatalog: Send + Sync {
    async fn get_definition(&self, calculator_id: &str) -> Result<Option<JobDefinition>>;

    async fn save_definition(&self, definition: &JobDefinition) -> Result<()>;

    async fn list_active(&self) -> Result<Vec<JobDefinition>>;
}

/// Daily roll-ups maintained by the completion path.
#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Fold one completed run into its (calculator, tenant, reporting date) aggregate.
    async fn upsert_daily(&self, run: &JobRun, now: DateTime<Utc>) -> Result<()>;

    /// Aggregates with a reporting date on or after `since`, newest first.
    async fn recent_aggregates(
        &self,
        key: &CalculatorKey,
        since: NaiveDate,
    ) -> Result<Vec<DailyAggregate>>;
}

/// Live query counters kept by a store implementation.
#[derive(Debug, Default)]
pub struct StoreStats {
    recent_queries: AtomicU64,
    batch_queries: AtomicU64,
    last_batch_size: AtomicU64,
    lookups: AtomicU64,
    writes: AtomicU64,
}

impl StoreStats {
    pub fn record_recent(&self) {
        self.recent_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch(&self, calculators: usize) {
        self.batch_queries.fetch_add(1, Ordering::Relaxed);
        self.last_batch_size
            .store(calculators as u64, Ordering::Relaxed);
    }

    pub fn record_lookup(&self) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> StoreStatsSnapshot {
        StoreStatsSnapshot {
            recent_queries: self.recent_queries.load(Ordering::Relaxed),
            batch_queries: self.batch_queries.load(Ordering::Relaxed),
            last_batch_size: self.last_batch_size.load(Ordering::Relaxed),
            lookups: self.lookups.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`StoreStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStatsSnapshot {
    pub recent_queries: u64,
    pub batch_queries: u64,
    /// Calculators covered by the most recent batch query.
    pub last_batch_size: u64,
    pub lookups: u64,
    pub writes: u64,
}
