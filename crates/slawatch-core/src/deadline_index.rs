//! Deadline monitoring index.
//!
//! Holds one entry per RUNNING run that has an SLA deadline, ordered by
//! that deadline. The detection loop asks "what is overdue now?" and the
//! early-warning loop asks "what falls due within the next window?"; both
//! answers cost time proportional to the matching entries only.
//!
//! The index lives in the cache backend:
//!
//! - `{prefix}:sla:deadlines`: sorted set, member = run id, score = deadline ms
//! - `{prefix}:sla:run_info`: hash, run id -> [`RunInfo`] JSON
//!
//! Both keys carry a 24h safety expiry so an abandoned index drains on its
//! own. Entries can be stale; consumers re-check the canonical store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::{CacheBackend, CacheResult};
use crate::error::CacheError;
use crate::model::JobRun;

/// Safety expiry applied to both index structures.
pub const SAFETY_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

/// Display info kept next to each deadline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunInfo {
    pub calculator_id: String,
    pub calculator_name: String,
    pub tenant_id: String,
    pub start_time: DateTime<Utc>,
}

/// One monitored run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadlineEntry {
    pub run_id: String,
    pub deadline: DateTime<Utc>,
    /// `None` when the info hash lost the entry (expiry, partial write).
    pub info: Option<RunInfo>,
}

#[derive(Clone)]
pub struct DeadlineIndex {
    backend: Arc<dyn CacheBackend>,
    deadlines_key: String,
    info_key: String,
}

impl std::fmt::Debug for DeadlineIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadlineIndex")
            .field("deadlines_key", &self.deadlines_key)
            .field("info_key", &self.info_key)
            .finish_non_exhaustive()
    }
}

#[allow(clippy::cast_precision_loss)]
fn score(instant: DateTime<Utc>) -> f64 {
    instant.timestamp_millis() as f64
}

#[allow(clippy::cast_possible_truncation)]
fn instant(score: f64) -> CacheResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(score as i64)
        .ok_or_else(|| CacheError::Decode(format!("deadline score out of range: {score}")))
}

impl DeadlineIndex {
    #[must_use]
    pub fn new(backend: Arc<dyn CacheBackend>, prefix: &str) -> Self {
        Self {
            backend,
            deadlines_key: format!("{prefix}:sla:deadlines"),
            info_key: format!("{prefix}:sla:run_info"),
        }
    }

    /// Start monitoring `run`. Returns `false` (and does nothing) unless
    /// the run is RUNNING with a deadline. Re-registering replaces the entry.
    pub async fn register(&self, run: &JobRun) -> CacheResult<bool> {
        let Some(deadline) = run.sla_deadline else {
            debug!(run_id = %run.run_id, "No SLA deadline, skipping monitoring");
            return Ok(false);
        };
        if !run.is_running() {
            debug!(run_id = %run.run_id, status = %run.status, "Run not RUNNING, skipping monitoring");
            return Ok(false);
        }

        let info = RunInfo {
            calculator_id: run.calculator_id.clone(),
            calculator_name: run.calculator_name.clone(),
            tenant_id: run.tenant_id.clone(),
            start_time: run.start_time,
        };
        let payload =
            serde_json::to_string(&info).map_err(|e| CacheError::Backend(format!("encode: {e}")))?;

        self.backend
            .hset(&self.info_key, &run.run_id, &payload)
            .await?;
        self.backend
            .zadd(&self.deadlines_key, &run.run_id, score(deadline))
            .await?;
        self.refresh_safety_expiry().await?;

        debug!(run_id = %run.run_id, deadline = %deadline, "Registered run for SLA monitoring");
        Ok(true)
    }

    /// Stop monitoring `run_id`. Missing entries are fine.
    pub async fn deregister(&self, run_id: &str) -> CacheResult<()> {
        self.backend.zrem(&self.deadlines_key, run_id).await?;
        self.backend.hdel(&self.info_key, run_id).await?;
        debug!(run_id, "Deregistered run from SLA monitoring");
        Ok(())
    }

    /// Entries with `deadline <= now`, earliest first, ties by run id.
    pub async fn breached(&self, now: DateTime<Utc>) -> CacheResult<Vec<DeadlineEntry>> {
        let scored = self
            .backend
            .zrange_by_score(&self.deadlines_key, f64::NEG_INFINITY, score(now))
            .await?;
        self.entries(scored).await
    }

    /// Entries with `now < deadline <= now + window`, earliest first.
    pub async fn approaching(
        &self,
        now: DateTime<Utc>,
        window: chrono::Duration,
    ) -> CacheResult<Vec<DeadlineEntry>> {
        let floor = score(now);
        let scored = self
            .backend
            .zrange_by_score(&self.deadlines_key, floor, score(now + window))
            .await?
            .into_iter()
            .filter(|(_, s)| *s > floor)
            .collect();
        self.entries(scored).await
    }

    /// Number of monitored runs.
    pub async fn count(&self) -> CacheResult<u64> {
        self.backend.zcard(&self.deadlines_key).await
    }

    /// Earliest monitored deadline.
    pub async fn next_deadline(&self) -> CacheResult<Option<DateTime<Utc>>> {
        // Last by descending score is the lowest score.
        let Some(run_id) = self
            .backend
            .zrevrange(&self.deadlines_key, -1, -1)
            .await?
            .into_iter()
            .next()
        else {
            return Ok(None);
        };
        self.backend
            .zscore(&self.deadlines_key, &run_id)
            .await?
            .map(instant)
            .transpose()
    }

    /// Re-apply the 24h expiry to both structures.
    pub async fn refresh_safety_expiry(&self) -> CacheResult<()> {
        self.backend
            .expire(&self.deadlines_key, SAFETY_EXPIRY)
            .await?;
        self.backend.expire(&self.info_key, SAFETY_EXPIRY).await
    }

    async fn entries(&self, scored: Vec<(String, f64)>) -> CacheResult<Vec<DeadlineEntry>> {
        let mut entries = Vec::with_capacity(scored.len());
        for (run_id, s) in scored {
            let info = match self.backend.hget(&self.info_key, &run_id).await? {
                Some(raw) => Some(
                    serde_json::from_str::<RunInfo>(&raw)
                        .map_err(|e| CacheError::Decode(e.to_string()))?,
                ),
                None => None,
            };
            entries.push(DeadlineEntry {
                deadline: instant(s)?,
                run_id,
                info,
            });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheBackend;
    use crate::model::{Frequency, RunStatus};
    use chrono::{NaiveDate, TimeZone};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, h, m, 0).unwrap()
    }

    fn run(run_id: &str, deadline: Option<DateTime<Utc>>) -> JobRun {
        JobRun {
            run_id: run_id.into(),
            calculator_id: "c1".into(),
            calculator_name: "FX Rates".into(),
            tenant_id: "t1".into(),
            frequency: Frequency::Daily,
            reporting_date: NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
            start_time: at(4, 0),
            end_time: None,
            duration_ms: None,
            status: RunStatus::Running,
            sla_deadline: deadline,
            sla_breached: false,
            sla_breach_reason: None,
            expected_duration_ms: None,
            estimated_end_time: None,
            run_parameters: None,
            created_at: at(4, 0),
            updated_at: at(4, 0),
        }
    }

    fn index() -> (Arc<MemoryCacheBackend>, DeadlineIndex) {
        let backend = Arc::new(MemoryCacheBackend::new());
        (backend.clone(), DeadlineIndex::new(backend, "obs"))
    }

    #[tokio::test]
    async fn register_requires_running_with_deadline() {
        let (_, index) = index();
        assert!(!index.register(&run("r1", None)).await.unwrap());

        let mut done = run("r2", Some(at(5, 0)));
        done.status = RunStatus::Success;
        assert!(!index.register(&done).await.unwrap());

        assert!(index.register(&run("r3", Some(at(5, 0)))).await.unwrap());
        assert_eq!(index.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reregister_moves_the_deadline() {
        let (_, index) = index();
        index.register(&run("r1", Some(at(5, 0)))).await.unwrap();
        index.register(&run("r1", Some(at(7, 0)))).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 1);
        assert!(index.breached(at(6, 0)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn breached_is_inclusive_and_ordered() {
        let (_, index) = index();
        index.register(&run("r-b", Some(at(5, 15)))).await.unwrap();
        index.register(&run("r-a", Some(at(5, 15)))).await.unwrap();
        index.register(&run("r-early", Some(at(5, 0)))).await.unwrap();
        index.register(&run("r-late", Some(at(6, 30)))).await.unwrap();

        let due = index.breached(at(5, 15)).await.unwrap();
        let ids: Vec<&str> = due.iter().map(|e| e.run_id.as_str()).collect();
        assert_eq!(ids, ["r-early", "r-a", "r-b"]);
        assert_eq!(due[0].deadline, at(5, 0));
        assert_eq!(due[0].info.as_ref().unwrap().calculator_name, "FX Rates");
    }

    #[tokio::test]
    async fn approaching_excludes_already_due() {
        let (_, index) = index();
        index.register(&run("due", Some(at(6, 0)))).await.unwrap();
        index.register(&run("soon", Some(at(6, 5)))).await.unwrap();
        index.register(&run("edge", Some(at(6, 10)))).await.unwrap();
        index.register(&run("later", Some(at(6, 11)))).await.unwrap();

        let soon = index
            .approaching(at(6, 0), chrono::Duration::minutes(10))
            .await
            .unwrap();
        let ids: Vec<&str> = soon.iter().map(|e| e.run_id.as_str()).collect();
        assert_eq!(ids, ["soon", "edge"]);
    }

    #[tokio::test]
    async fn deregister_is_idempotent() {
        let (backend, index) = index();
        index.register(&run("r1", Some(at(5, 0)))).await.unwrap();
        index.deregister("r1").await.unwrap();
        index.deregister("r1").await.unwrap();
        assert_eq!(index.count().await.unwrap(), 0);
        assert!(backend.hget("obs:sla:run_info", "r1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn next_deadline_is_the_earliest() {
        let (_, index) = index();
        assert_eq!(index.next_deadline().await.unwrap(), None);
        index.register(&run("r1", Some(at(7, 0)))).await.unwrap();
        index.register(&run("r2", Some(at(5, 30)))).await.unwrap();
        assert_eq!(index.next_deadline().await.unwrap(), Some(at(5, 30)));
    }

    #[tokio::test]
    async fn lost_info_still_surfaces_the_run() {
        let (backend, index) = index();
        index.register(&run("r1", Some(at(5, 0)))).await.unwrap();
        backend.hdel("obs:sla:run_info", "r1").await.unwrap();

        let due = index.breached(at(6, 0)).await.unwrap();
        assert_eq!(due.len(), 1);
        assert!(due[0].info.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn safety_expiry_covers_both_structures() {
        let (backend, index) = index();
        index.register(&run("r1", Some(at(5, 0)))).await.unwrap();
        assert_eq!(backend.ttl("obs:sla:deadlines"), Some(SAFETY_EXPIRY));
        assert_eq!(backend.ttl("obs:sla:run_info"), Some(SAFETY_EXPIRY));

        tokio::time::advance(Duration::from_secs(3600)).await;
        index.refresh_safety_expiry().await.unwrap();
        assert_eq!(backend.ttl("obs:sla:deadlines"), Some(SAFETY_EXPIRY));

        tokio::time::advance(SAFETY_EXPIRY).await;
        assert_eq!(index.count().await.unwrap(), 0);
    }
}
