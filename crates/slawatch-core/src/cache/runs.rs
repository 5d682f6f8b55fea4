//! Run cache tiers: recent-run lists, status responses, running set and the
//! calculator existence pre-filter.
//!
//! Every method here is infallible from the caller's point of view. Backend
//! errors are logged, counted under `cache.errors{op}` and reported as a
//! miss, so reads fall through to the store and writes still succeed.
//!
//! Key layout (`{p}` is `cache.key_prefix`):
//!
//! | Key | Type | Content |
//! |-----|------|---------|
//! | `{p}:recent:{calc}:{tenant}` | sorted set | run ids scored by `createdAt` ms, last 100 |
//! | `{p}:run:{run_id}` | string | run JSON, TTL from [`ttl_for`] |
//! | `{p}:status:{calc}:{tenant}:{FREQ}` | string | `CalculatorStatusResponse` JSON |
//! | `{p}:running` | set | `calc:tenant` pairs currently RUNNING |

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{CacheBackend, CacheResult};
use crate::bloom_filter::BloomFilter;
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::metrics::{self, CacheTier};
use crate::model::{CalculatorKey, CalculatorStatusResponse, Frequency, JobRun};

/// Runs kept per (calculator, tenant) recent list.
pub const RECENT_CAPACITY: usize = 100;

pub const RUNNING_TTL: Duration = Duration::from_secs(5 * 60);
pub const RECENTLY_COMPLETED_TTL: Duration = Duration::from_secs(15 * 60);
pub const MONTHLY_COMPLETED_TTL: Duration = Duration::from_secs(4 * 60 * 60);
pub const COMPLETED_TTL: Duration = Duration::from_secs(60 * 60);

/// Completions younger than this get [`RECENTLY_COMPLETED_TTL`].
const RECENT_COMPLETION_MINUTES: i64 = 30;

pub const RUNNING_RESPONSE_TTL: Duration = Duration::from_secs(30);
pub const COMPLETED_RESPONSE_TTL: Duration = Duration::from_secs(60);

/// Safety expiry of the running set.
pub const RUNNING_SET_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// The existence filter is rebuilt from scratch after this long.
pub const EXISTENCE_RESET_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

const EXISTENCE_CAPACITY: usize = 10_000;
const EXISTENCE_FP_RATE: f64 = 0.01;

/// Cache lifetime of a recent-run entry.
///
/// Running runs change soon and get the shortest TTL. Fresh completions may
/// be followed by a rerun. Settled MONTHLY runs are read for hours.
#[must_use]
pub fn ttl_for(run: &JobRun, now: DateTime<Utc>) -> Duration {
    if run.is_running() {
        return RUNNING_TTL;
    }
    let completed_at = run.end_time.unwrap_or(run.created_at);
    if (now - completed_at).num_minutes() < RECENT_COMPLETION_MINUTES {
        return RECENTLY_COMPLETED_TTL;
    }
    match run.frequency {
        Frequency::Monthly => MONTHLY_COMPLETED_TTL,
        Frequency::Daily => COMPLETED_TTL,
    }
}

#[must_use]
pub fn response_ttl(response: &CalculatorStatusResponse) -> Duration {
    if response.current_is_running() {
        RUNNING_RESPONSE_TTL
    } else {
        COMPLETED_RESPONSE_TTL
    }
}

#[derive(Debug)]
struct Existence {
    filter: BloomFilter,
    created: Instant,
}

impl Existence {
    fn new() -> Self {
        Self {
            filter: BloomFilter::with_capacity(EXISTENCE_CAPACITY, EXISTENCE_FP_RATE),
            created: Instant::now(),
        }
    }

    fn expire_if_due(&mut self) {
        if self.created.elapsed() >= EXISTENCE_RESET_AFTER {
            debug!(entries = self.filter.count(), "Resetting calculator existence filter");
            self.filter.clear();
            self.created = Instant::now();
        }
    }
}

/// Cache facade used by ingestion, queries and invalidation.
pub struct RunCache {
    backend: Arc<dyn CacheBackend>,
    prefix: String,
    history_limit: usize,
    existence: Mutex<Existence>,
}

impl std::fmt::Debug for RunCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunCache")
            .field("prefix", &self.prefix)
            .field("history_limit", &self.history_limit)
            .finish_non_exhaustive()
    }
}

impl RunCache {
    #[must_use]
    pub fn new(backend: Arc<dyn CacheBackend>, prefix: impl Into<String>, history_limit: usize) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
            history_limit,
            existence: Mutex::new(Existence::new()),
        }
    }

    #[must_use]
    pub fn from_config(backend: Arc<dyn CacheBackend>, config: &CacheConfig) -> Self {
        Self::new(backend, config.key_prefix.clone(), config.history_limit)
    }

    /// History entries shown under the current run in a status response.
    #[must_use]
    pub fn history_limit(&self) -> usize {
        self.history_limit
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    // -- keys ----------------------------------------------------------------

    #[must_use]
    pub fn recent_key(&self, key: &CalculatorKey) -> String {
        format!("{}:recent:{}:{}", self.prefix, key.calculator_id, key.tenant_id)
    }

    #[must_use]
    pub fn run_key(&self, run_id: &str) -> String {
        format!("{}:run:{run_id}", self.prefix)
    }

    #[must_use]
    pub fn response_key(&self, key: &CalculatorKey, frequency: Frequency) -> String {
        format!(
            "{}:status:{}:{}:{}",
            self.prefix, key.calculator_id, key.tenant_id, frequency
        )
    }

    #[must_use]
    pub fn running_key(&self) -> String {
        format!("{}:running", self.prefix)
    }

    // -- write-through -------------------------------------------------------

    /// Mirror a canonical write into the recent list and the running set.
    pub async fn write_through(&self, run: &JobRun, now: DateTime<Utc>) {
        self.note_exists(&run.calculator_id);
        if let Err(err) = self.try_write_through(run, now).await {
            warn!(
                run_id = %run.run_id,
                calculator_id = %run.calculator_id,
                error = %err,
                "Failed to cache run on write"
            );
            metrics::record_cache_error("write_through");
        }
    }

    async fn try_write_through(&self, run: &JobRun, now: DateTime<Utc>) -> CacheResult<()> {
        let payload = encode(run)?;
        let ttl = ttl_for(run, now);
        let recent = self.recent_key(&run.cache_key());

        self.backend
            .set_ex(&self.run_key(&run.run_id), &payload, ttl)
            .await?;
        #[allow(clippy::cast_precision_loss)]
        let score = run.created_at.timestamp_millis() as f64;
        self.backend.zadd(&recent, &run.run_id, score).await?;
        self.backend
            .zremrange_by_rank(&recent, 0, -(RECENT_CAPACITY as isize) - 1)
            .await?;
        self.backend.expire(&recent, ttl).await?;

        let running = self.running_key();
        let member = run.cache_key().to_string();
        if run.is_running() {
            self.backend.sadd(&running, &member).await?;
            self.backend.expire(&running, RUNNING_SET_TTL).await?;
        } else {
            self.backend.srem(&running, &member).await?;
        }

        debug!(run_id = %run.run_id, ttl_secs = ttl.as_secs(), "Cached run on write");
        Ok(())
    }

    /// Up to `limit` cached runs, newest first. `None` is a miss.
    ///
    /// A list whose run entries have partly expired is reported as a miss
    /// rather than returned incomplete.
    pub async fn recent_runs(&self, key: &CalculatorKey, limit: usize) -> Option<Vec<JobRun>> {
        if limit == 0 {
            return None;
        }
        let stop = isize::try_from(limit).unwrap_or(isize::MAX) - 1;
        let ids = self
            .swallow("zrevrange", self.backend.zrevrange(&self.recent_key(key), 0, stop).await)?;
        if ids.is_empty() {
            metrics::record_cache_miss(CacheTier::Recent);
            return None;
        }

        let keys: Vec<String> = ids.iter().map(|id| self.run_key(id)).collect();
        let values = self.swallow("mget", self.backend.mget(&keys).await)?;
        let mut runs = Vec::with_capacity(values.len());
        for raw in values {
            let Some(raw) = raw else {
                metrics::record_cache_miss(CacheTier::Recent);
                return None;
            };
            runs.push(self.swallow("decode", decode::<JobRun>(&raw))?);
        }
        metrics::record_cache_hit(CacheTier::Recent);
        Some(runs)
    }

    // -- status responses ----------------------------------------------------

    pub async fn get_response(
        &self,
        key: &CalculatorKey,
        frequency: Frequency,
    ) -> Option<CalculatorStatusResponse> {
        if !self.might_exist(&key.calculator_id) {
            return None;
        }
        let raw = self.swallow("get", self.backend.get(&self.response_key(key, frequency)).await)?;
        let Some(raw) = raw else {
            metrics::record_cache_miss(CacheTier::Response);
            return None;
        };
        let response = self.swallow("decode", decode::<CalculatorStatusResponse>(&raw))?;
        metrics::record_cache_hit(CacheTier::Response);
        Some(response)
    }

    pub async fn set_response(&self, response: &CalculatorStatusResponse, frequency: Frequency) {
        let key = CalculatorKey::new(&response.calculator_id, &response.tenant_id);
        self.note_exists(&key.calculator_id);
        let result = match encode(response) {
            Ok(payload) => {
                self.backend
                    .set_ex(&self.response_key(&key, frequency), &payload, response_ttl(response))
                    .await
            }
            Err(err) => Err(err),
        };
        self.swallow("set_response", result);
    }

    /// Pipelined lookup for many calculators of one tenant. Misses are absent.
    pub async fn get_responses(
        &self,
        calculator_ids: &[String],
        tenant_id: &str,
        frequency: Frequency,
    ) -> HashMap<String, CalculatorStatusResponse> {
        let candidates: Vec<&String> = calculator_ids
            .iter()
            .filter(|id| self.might_exist(id))
            .collect();
        let mut found = HashMap::new();
        if candidates.is_empty() {
            return found;
        }

        let keys: Vec<String> = candidates
            .iter()
            .map(|id| self.response_key(&CalculatorKey::new(id.as_str(), tenant_id), frequency))
            .collect();
        let Some(values) = self.swallow("mget", self.backend.mget(&keys).await) else {
            return found;
        };

        for (id, raw) in candidates.into_iter().zip(values) {
            let decoded = raw.and_then(|raw| {
                self.swallow("decode", decode::<CalculatorStatusResponse>(&raw))
            });
            match decoded {
                Some(response) => {
                    metrics::record_cache_hit(CacheTier::Response);
                    found.insert(id.clone(), response);
                }
                None => metrics::record_cache_miss(CacheTier::Response),
            }
        }
        debug!(
            hits = found.len(),
            requested = calculator_ids.len(),
            "Batch status response lookup"
        );
        found
    }

    /// Pipelined store of many responses; one round trip per TTL class.
    pub async fn set_responses(&self, responses: &[CalculatorStatusResponse], frequency: Frequency) {
        let mut running = Vec::new();
        let mut settled = Vec::new();
        for response in responses {
            self.note_exists(&response.calculator_id);
            let key = CalculatorKey::new(&response.calculator_id, &response.tenant_id);
            let Some(payload) = self.swallow("encode", encode(response)) else {
                continue;
            };
            let entry = (self.response_key(&key, frequency), payload);
            if response.current_is_running() {
                running.push(entry);
            } else {
                settled.push(entry);
            }
        }
        for (entries, ttl) in [
            (running, RUNNING_RESPONSE_TTL),
            (settled, COMPLETED_RESPONSE_TTL),
        ] {
            if !entries.is_empty() {
                self.swallow("mset", self.backend.mset_ex(&entries, ttl).await);
            }
        }
    }

    pub async fn evict_response(&self, key: &CalculatorKey, frequency: Frequency) {
        let result = self.backend.del(&self.response_key(key, frequency)).await;
        if self.swallow("evict", result).is_some() {
            debug!(calculator_id = %key.calculator_id, tenant_id = %key.tenant_id, "Evicted status response");
        }
    }

    // -- running set ---------------------------------------------------------

    /// `None` when the backend could not answer.
    pub async fn is_running(&self, key: &CalculatorKey) -> Option<bool> {
        let result = self
            .backend
            .sismember(&self.running_key(), &key.to_string())
            .await;
        let running = self.swallow("sismember", result)?;
        metrics::record_cache_hit(CacheTier::Running);
        Some(running)
    }

    /// `calc:tenant` members of the running set.
    pub async fn running_members(&self) -> Option<Vec<String>> {
        self.swallow("smembers", self.backend.smembers(&self.running_key()).await)
    }

    pub async fn running_count(&self) -> Option<u64> {
        self.running_members().await.map(|m| m.len() as u64)
    }

    // -- existence pre-filter ------------------------------------------------

    /// `false` means no run or response for this calculator went through this cache.
    pub fn might_exist(&self, calculator_id: &str) -> bool {
        let mut existence = self.existence();
        existence.expire_if_due();
        let present = existence.filter.contains(calculator_id);
        if present {
            metrics::record_cache_hit(CacheTier::Existence);
        } else {
            metrics::record_cache_miss(CacheTier::Existence);
        }
        present
    }

    fn note_exists(&self, calculator_id: &str) {
        let mut existence = self.existence();
        existence.expire_if_due();
        if !existence.filter.contains(calculator_id) {
            existence.filter.insert(calculator_id);
        }
    }

    fn existence(&self) -> std::sync::MutexGuard<'_, Existence> {
        match self.existence.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn swallow<T>(&self, op: &'static str, result: CacheResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(op, prefix = %self.prefix, error = %err, "Cache operation failed");
                metrics::record_cache_error(op);
                None
            }
        }
    }
}

fn encode<T: Serialize>(value: &T) -> CacheResult<String> {
    serde_json::to_string(value).map_err(|e| CacheError::Backend(format!("encode: {e}")))
}

fn decode<T: DeserializeOwned>(raw: &str) -> CacheResult<T> {
    serde_json::from_str(raw).map_err(|e| CacheError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheBackend;
    use crate::model::RunStatus;
    use chrono::{NaiveDate, TimeZone};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, h, m, 0).unwrap()
    }

    fn run(run_id: &str, calc: &str, status: RunStatus, created: DateTime<Utc>) -> JobRun {
        JobRun {
            run_id: run_id.into(),
            calculator_id: calc.into(),
            calculator_name: format!("{calc} name"),
            tenant_id: "t1".into(),
            frequency: Frequency::Daily,
            reporting_date: NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
            start_time: created,
            end_time: None,
            duration_ms: None,
            status,
            sla_deadline: None,
            sla_breached: false,
            sla_breach_reason: None,
            expected_duration_ms: None,
            estimated_end_time: None,
            run_parameters: None,
            created_at: created,
            updated_at: created,
        }
    }

    fn cache() -> (Arc<MemoryCacheBackend>, RunCache) {
        let backend = Arc::new(MemoryCacheBackend::new());
        let cache = RunCache::new(backend.clone(), "obs", 5);
        (backend, cache)
    }

    #[test]
    fn ttl_follows_status_and_age() {
        let now = at(12, 0);
        let running = run("r1", "c1", RunStatus::Running, at(11, 0));
        assert_eq!(ttl_for(&running, now), RUNNING_TTL);

        let mut fresh = run("r2", "c1", RunStatus::Success, at(11, 0));
        fresh.end_time = Some(at(11, 45));
        assert_eq!(ttl_for(&fresh, now), RECENTLY_COMPLETED_TTL);

        let mut settled = fresh.clone();
        settled.end_time = Some(at(11, 0));
        assert_eq!(ttl_for(&settled, now), COMPLETED_TTL);

        settled.frequency = Frequency::Monthly;
        assert_eq!(ttl_for(&settled, now), MONTHLY_COMPLETED_TTL);
    }

    #[test]
    fn completion_without_end_time_ages_from_creation() {
        let old = run("r1", "c1", RunStatus::Failed, at(8, 0));
        assert_eq!(ttl_for(&old, at(12, 0)), COMPLETED_TTL);
    }

    #[tokio::test(start_paused = true)]
    async fn write_through_tracks_running_set() {
        let (backend, cache) = cache();
        let mut r = run("r1", "c1", RunStatus::Running, at(4, 0));
        cache.write_through(&r, at(4, 0)).await;

        let key = r.cache_key();
        assert_eq!(cache.is_running(&key).await, Some(true));
        assert_eq!(cache.running_count().await, Some(1));
        assert!(backend.ttl("obs:running").is_some());
        assert_eq!(backend.ttl("obs:run:r1"), Some(RUNNING_TTL));

        r.status = RunStatus::Success;
        r.end_time = Some(at(5, 0));
        cache.write_through(&r, at(5, 0)).await;
        assert_eq!(cache.is_running(&key).await, Some(false));
        assert_eq!(backend.ttl("obs:run:r1"), Some(RECENTLY_COMPLETED_TTL));
    }

    #[tokio::test]
    async fn recent_list_is_newest_first_and_capped() {
        let (backend, cache) = cache();
        for i in 0..(RECENT_CAPACITY + 5) {
            let created = at(0, 0) + chrono::Duration::minutes(i as i64);
            cache
                .write_through(&run(&format!("r{i}"), "c1", RunStatus::Running, created), created)
                .await;
        }
        assert_eq!(
            backend.zcard("obs:recent:c1:t1").await.unwrap(),
            RECENT_CAPACITY as u64
        );

        let key = CalculatorKey::new("c1", "t1");
        let runs = cache.recent_runs(&key, 3).await.unwrap();
        let ids: Vec<&str> = runs.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, ["r104", "r103", "r102"]);
    }

    #[tokio::test]
    async fn recent_list_with_expired_entry_is_a_miss() {
        let (backend, cache) = cache();
        let r = run("r1", "c1", RunStatus::Running, at(4, 0));
        cache.write_through(&r, at(4, 0)).await;
        backend.del("obs:run:r1").await.unwrap();
        assert!(cache.recent_runs(&r.cache_key(), 5).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn response_ttl_depends_on_current_status() {
        let (backend, cache) = cache();
        let running = CalculatorStatusResponse::from_runs(
            &[run("r1", "c1", RunStatus::Running, at(4, 0))],
            at(4, 1),
        )
        .unwrap();
        let settled = CalculatorStatusResponse::from_runs(
            &[run("r2", "c2", RunStatus::Success, at(4, 0))],
            at(4, 1),
        )
        .unwrap();
        cache.set_response(&running, Frequency::Daily).await;
        cache.set_response(&settled, Frequency::Daily).await;

        assert_eq!(backend.ttl("obs:status:c1:t1:DAILY"), Some(RUNNING_RESPONSE_TTL));
        assert_eq!(backend.ttl("obs:status:c2:t1:DAILY"), Some(COMPLETED_RESPONSE_TTL));

        let key = CalculatorKey::new("c1", "t1");
        assert_eq!(cache.get_response(&key, Frequency::Daily).await, Some(running));
        assert!(cache.get_response(&key, Frequency::Monthly).await.is_none());

        cache.evict_response(&key, Frequency::Daily).await;
        assert!(cache.get_response(&key, Frequency::Daily).await.is_none());
    }

    #[tokio::test]
    async fn existence_negative_skips_backend() {
        let (backend, cache) = cache();
        let response = CalculatorStatusResponse::from_runs(
            &[run("r1", "c9", RunStatus::Success, at(4, 0))],
            at(4, 1),
        )
        .unwrap();
        // Written behind the cache's back, so the filter never saw c9.
        backend
            .set_ex(
                "obs:status:c9:t1:DAILY",
                &serde_json::to_string(&response).unwrap(),
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        let key = CalculatorKey::new("c9", "t1");
        assert!(!cache.might_exist("c9"));
        assert!(cache.get_response(&key, Frequency::Daily).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn batch_responses_split_by_ttl_class() {
        let (backend, cache) = cache();
        let responses: Vec<_> = ["c1", "c2", "c3"]
            .iter()
            .enumerate()
            .map(|(i, calc)| {
                let status = if i == 0 { RunStatus::Running } else { RunStatus::Success };
                CalculatorStatusResponse::from_runs(&[run(&format!("r{i}"), calc, status, at(4, 0))], at(4, 1))
                    .unwrap()
            })
            .collect();
        cache.set_responses(&responses, Frequency::Daily).await;
        assert_eq!(backend.ttl("obs:status:c1:t1:DAILY"), Some(RUNNING_RESPONSE_TTL));
        assert_eq!(backend.ttl("obs:status:c3:t1:DAILY"), Some(COMPLETED_RESPONSE_TTL));

        let ids: Vec<String> = ["c1", "c2", "c3", "c4"].iter().map(ToString::to_string).collect();
        let found = cache.get_responses(&ids, "t1", Frequency::Daily).await;
        assert_eq!(found.len(), 3);
        assert_eq!(found["c2"], responses[1]);
        assert!(!found.contains_key("c4"));
    }

    #[tokio::test]
    async fn unavailable_backend_degrades_to_misses() {
        let (backend, cache) = cache();
        backend.set_unavailable(true);
        let r = run("r1", "c1", RunStatus::Running, at(4, 0));
        cache.write_through(&r, at(4, 0)).await;

        let key = r.cache_key();
        assert!(cache.get_response(&key, Frequency::Daily).await.is_none());
        assert!(cache.recent_runs(&key, 5).await.is_none());
        assert_eq!(cache.is_running(&key).await, None);
        assert!(cache.get_responses(&["c1".to_string()], "t1", Frequency::Daily).await.is_empty());

        backend.set_unavailable(false);
        assert!(backend.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn existence_filter_resets_after_a_day() {
        let (_backend, cache) = cache();
        cache
            .write_through(&run("r1", "c1", RunStatus::Running, at(4, 0)), at(4, 0))
            .await;
        assert!(cache.might_exist("c1"));

        tokio::time::advance(EXISTENCE_RESET_AFTER).await;
        assert!(!cache.might_exist("c1"));
    }
}
