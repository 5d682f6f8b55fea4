//! In-process [`CacheBackend`] with Redis-compatible semantics.
//!
//! Expiry uses `tokio::time::Instant`, so paused-clock tests can advance
//! past a TTL. Expired keys are dropped lazily on access and by a periodic
//! sweep on writes.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{CacheBackend, CacheResult};
use crate::error::CacheError;

const SWEEP_EVERY_WRITES: u64 = 512;

#[derive(Debug)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(BTreeSet<String>),
    Sorted(HashMap<String, f64>),
}

impl Value {
    fn is_empty(&self) -> bool {
        match self {
            Self::Str(_) => false,
            Self::Hash(h) => h.is_empty(),
            Self::Set(s) => s.is_empty(),
            Self::Sorted(z) => z.is_empty(),
        }
    }
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

type Entries = HashMap<String, Entry>;

fn wrong_type(key: &str) -> CacheError {
    CacheError::Backend(format!(
        "WRONGTYPE operation against key `{key}` holding the wrong kind of value"
    ))
}

/// Live entry for `key`, dropping it first when expired.
fn live<'a>(entries: &'a mut Entries, key: &str, now: Instant) -> Option<&'a mut Entry> {
    if entries
        .get(key)
        .is_some_and(|e| e.expires_at.is_some_and(|at| at <= now))
    {
        entries.remove(key);
    }
    entries.get_mut(key)
}

fn live_or_insert<'a>(
    entries: &'a mut Entries,
    key: &str,
    now: Instant,
    empty: fn() -> Value,
) -> &'a mut Entry {
    if entries
        .get(key)
        .is_some_and(|e| e.expires_at.is_some_and(|at| at <= now))
    {
        entries.remove(key);
    }
    entries.entry(key.to_string()).or_insert_with(|| Entry {
        value: empty(),
        expires_at: None,
    })
}

fn drop_if_empty(entries: &mut Entries, key: &str) {
    if entries.get(key).is_some_and(|e| e.value.is_empty()) {
        entries.remove(key);
    }
}

/// Sorted-set members ordered by (score, member).
fn ordered(set: &HashMap<String, f64>) -> Vec<(String, f64)> {
    let mut members: Vec<(String, f64)> = set.iter().map(|(m, s)| (m.clone(), *s)).collect();
    members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    members
}

/// Normalize Redis-style inclusive rank bounds against `len`.
fn rank_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = isize::try_from(len).ok()?;
    let start = if start < 0 { len + start } else { start }.max(0);
    let stop = if stop < 0 { len + stop } else { stop }.min(len - 1);
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

/// Single-process cache backend.
#[derive(Debug, Default)]
pub struct MemoryCacheBackend {
    entries: Mutex<Entries>,
    unavailable: AtomicBool,
    writes: AtomicU64,
}

impl MemoryCacheBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`CacheError::Unavailable`] until reset.
    ///
    /// Lets callers exercise their degraded (store-only) paths.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Remaining time-to-live of `key`; `None` when missing or persistent.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut entries = self.lock();
        live(&mut entries, key, now)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        entries.retain(|_, e| e.expires_at.is_none_or(|at| at > now));
        entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Entries> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn read<T>(&self, f: impl FnOnce(&mut Entries, Instant) -> CacheResult<T>) -> CacheResult<T> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("memory backend marked unavailable".into()));
        }
        let now = Instant::now();
        let mut entries = self.lock();
        f(&mut entries, now)
    }

    fn write<T>(&self, f: impl FnOnce(&mut Entries, Instant) -> CacheResult<T>) -> CacheResult<T> {
        self.read(|entries, now| {
            if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY_WRITES == 0 {
                entries.retain(|_, e| e.expires_at.is_none_or(|at| at > now));
            }
            f(entries, now)
        })
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn zadd(&self, key: &str, member: &str, score: f64) -> CacheResult<()> {
        self.write(|entries, now| {
            match &mut live_or_insert(entries, key, now, || Value::Sorted(HashMap::new())).value {
                Value::Sorted(set) => {
                    set.insert(member.to_string(), score);
                    Ok(())
                }
                _ => Err(wrong_type(key)),
            }
        })
    }

    async fn zrem(&self, key: &str, member: &str) -> CacheResult<()> {
        self.write(|entries, now| {
            match live(entries, key, now).map(|e| &mut e.value) {
                None => return Ok(()),
                Some(Value::Sorted(set)) => {
                    set.remove(member);
                }
                Some(_) => return Err(wrong_type(key)),
            }
            drop_if_empty(entries, key);
            Ok(())
        })
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> CacheResult<Vec<(String, f64)>> {
        self.read(|entries, now| match live(entries, key, now).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::Sorted(set)) => Ok(ordered(set)
                .into_iter()
                .filter(|(_, score)| *score >= min && *score <= max)
                .collect()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn zrevrange(&self, key: &str, start: isize, stop: isize) -> CacheResult<Vec<String>> {
        self.read(|entries, now| match live(entries, key, now).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::Sorted(set)) => {
                let mut members = ordered(set);
                members.reverse();
                Ok(match rank_range(members.len(), start, stop) {
                    Some((from, to)) => members[from..=to]
                        .iter()
                        .map(|(m, _)| m.clone())
                        .collect(),
                    None => Vec::new(),
                })
            }
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn zcard(&self, key: &str) -> CacheResult<u64> {
        self.read(|entries, now| match live(entries, key, now).map(|e| &e.value) {
            None => Ok(0),
            Some(Value::Sorted(set)) => Ok(set.len() as u64),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn zscore(&self, key: &str, member: &str) -> CacheResult<Option<f64>> {
        self.read(|entries, now| match live(entries, key, now).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Sorted(set)) => Ok(set.get(member).copied()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn zremrange_by_rank(&self, key: &str, start: isize, stop: isize) -> CacheResult<()> {
        self.write(|entries, now| {
            match live(entries, key, now).map(|e| &mut e.value) {
                None => return Ok(()),
                Some(Value::Sorted(set)) => {
                    let members = ordered(set);
                    if let Some((from, to)) = rank_range(members.len(), start, stop) {
                        for (member, _) in &members[from..=to] {
                            set.remove(member);
                        }
                    }
                }
                Some(_) => return Err(wrong_type(key)),
            }
            drop_if_empty(entries, key);
            Ok(())
        })
    }

    async fn hget(&self, key: &str, field: &str) -> CacheResult<Option<String>> {
        self.read(|entries, now| match live(entries, key, now).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Hash(hash)) => Ok(hash.get(field).cloned()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> CacheResult<()> {
        self.write(|entries, now| {
            match &mut live_or_insert(entries, key, now, || Value::Hash(HashMap::new())).value {
                Value::Hash(hash) => {
                    hash.insert(field.to_string(), value.to_string());
                    Ok(())
                }
                _ => Err(wrong_type(key)),
            }
        })
    }

    async fn hdel(&self, key: &str, field: &str) -> CacheResult<()> {
        self.write(|entries, now| {
            match live(entries, key, now).map(|e| &mut e.value) {
                None => return Ok(()),
                Some(Value::Hash(hash)) => {
                    hash.remove(field);
                }
                Some(_) => return Err(wrong_type(key)),
            }
            drop_if_empty(entries, key);
            Ok(())
        })
    }

    async fn sadd(&self, key: &str, member: &str) -> CacheResult<()> {
        self.write(|entries, now| {
            match &mut live_or_insert(entries, key, now, || Value::Set(BTreeSet::new())).value {
                Value::Set(set) => {
                    set.insert(member.to_string());
                    Ok(())
                }
                _ => Err(wrong_type(key)),
            }
        })
    }

    async fn srem(&self, key: &str, member: &str) -> CacheResult<()> {
        self.write(|entries, now| {
            match live(entries, key, now).map(|e| &mut e.value) {
                None => return Ok(()),
                Some(Value::Set(set)) => {
                    set.remove(member);
                }
                Some(_) => return Err(wrong_type(key)),
            }
            drop_if_empty(entries, key);
            Ok(())
        })
    }

    async fn sismember(&self, key: &str, member: &str) -> CacheResult<bool> {
        self.read(|entries, now| match live(entries, key, now).map(|e| &e.value) {
            None => Ok(false),
            Some(Value::Set(set)) => Ok(set.contains(member)),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn smembers(&self, key: &str) -> CacheResult<Vec<String>> {
        self.read(|entries, now| match live(entries, key, now).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        self.read(|entries, now| match live(entries, key, now).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Str(value)) => Ok(Some(value.clone())),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        self.write(|entries, now| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at: Some(now + ttl),
                },
            );
            Ok(())
        })
    }

    async fn del(&self, key: &str) -> CacheResult<()> {
        self.write(|entries, _| {
            entries.remove(key);
            Ok(())
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<()> {
        self.write(|entries, now| {
            if let Some(entry) = live(entries, key, now) {
                entry.expires_at = Some(now + ttl);
            }
            Ok(())
        })
    }

    async fn mget(&self, keys: &[String]) -> CacheResult<Vec<Option<String>>> {
        self.read(|entries, now| {
            keys.iter()
                .map(|key| match live(entries, key, now).map(|e| &e.value) {
                    None => Ok(None),
                    Some(Value::Str(value)) => Ok(Some(value.clone())),
                    Some(_) => Err(wrong_type(key)),
                })
                .collect()
        })
    }

    async fn mset_ex(&self, pairs: &[(String, String)], ttl: Duration) -> CacheResult<()> {
        self.write(|entries, now| {
            for (key, value) in pairs {
                entries.insert(
                    key.clone(),
                    Entry {
                        value: Value::Str(value.clone()),
                        expires_at: Some(now + ttl),
                    },
                );
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sorted_set_orders_by_score_then_member() {
        let cache = MemoryCacheBackend::new();
        cache.zadd("z", "b", 2.0).await.unwrap();
        cache.zadd("z", "a", 2.0).await.unwrap();
        cache.zadd("z", "c", 1.0).await.unwrap();

        let range = cache.zrange_by_score("z", f64::NEG_INFINITY, 2.0).await.unwrap();
        let members: Vec<_> = range.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(members, vec!["c", "a", "b"]);

        assert_eq!(cache.zrevrange("z", 0, 0).await.unwrap(), vec!["b"]);
        assert_eq!(cache.zcard("z").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn zadd_updates_existing_score() {
        let cache = MemoryCacheBackend::new();
        cache.zadd("z", "a", 5.0).await.unwrap();
        cache.zadd("z", "a", 1.0).await.unwrap();
        assert_eq!(cache.zcard("z").await.unwrap(), 1);
        assert_eq!(
            cache.zrange_by_score("z", 0.0, 1.0).await.unwrap(),
            vec![("a".to_string(), 1.0)]
        );
    }

    #[tokio::test]
    async fn remrange_by_rank_trims_oldest() {
        let cache = MemoryCacheBackend::new();
        for i in 0..5 {
            cache.zadd("z", &format!("m{i}"), f64::from(i)).await.unwrap();
        }
        // Keep the newest three.
        cache.zremrange_by_rank("z", 0, -4).await.unwrap();
        assert_eq!(cache.zrevrange("z", 0, -1).await.unwrap(), vec!["m4", "m3", "m2"]);
    }

    #[test]
    fn rank_range_matches_redis() {
        assert_eq!(rank_range(5, 0, -1), Some((0, 4)));
        assert_eq!(rank_range(5, 0, -4), Some((0, 1)));
        assert_eq!(rank_range(3, 0, -4), None);
        assert_eq!(rank_range(0, 0, -1), None);
        assert_eq!(rank_range(5, 2, 100), Some((2, 4)));
    }

    #[tokio::test]
    async fn emptied_collections_disappear() {
        let cache = MemoryCacheBackend::new();
        cache.sadd("s", "x").await.unwrap();
        cache.expire("s", Duration::from_secs(60)).await.unwrap();
        cache.srem("s", "x").await.unwrap();
        assert!(cache.is_empty());
        assert!(cache.ttl("s").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn keys_expire_after_ttl() {
        let cache = MemoryCacheBackend::new();
        cache
            .set_ex("k", "v", Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(cache.ttl("k"), Some(Duration::from_secs(30)));

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn batch_get_is_positional() {
        let cache = MemoryCacheBackend::new();
        cache
            .mset_ex(
                &[("a".into(), "1".into()), ("c".into(), "3".into())],
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        let values = cache
            .mget(&["a".into(), "b".into(), "c".into()])
            .await
            .unwrap();
        assert_eq!(values, vec![Some("1".into()), None, Some("3".into())]);
    }

    #[tokio::test]
    async fn wrong_type_is_an_error() {
        let cache = MemoryCacheBackend::new();
        cache.sadd("k", "x").await.unwrap();
        assert!(cache.get("k").await.is_err());
        assert!(cache.zadd("k", "x", 1.0).await.is_err());
    }

    #[tokio::test]
    async fn unavailable_backend_fails_every_call() {
        let cache = MemoryCacheBackend::new();
        cache.set_unavailable(true);
        assert!(matches!(
            cache.get("k").await,
            Err(CacheError::Unavailable(_))
        ));
        cache.set_unavailable(false);
        assert!(cache.get("k").await.unwrap().is_none());
    }
}
