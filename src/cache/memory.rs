//! In-memory [`CacheBackend`] used as the fallback store.
//!
//! Entries live in a fixed number of shards, each a `HashMap` behind its own
//! `std::sync::RwLock`, so concurrent requests for different keys rarely
//! contend. Hash counters are sharded the same way, by key and field, so
//! stats updates from parallel requests do not queue on one lock. Expiry is
//! checked lazily on read and eagerly by
//! [`purge_expired`](CacheBackend::purge_expired), which the cache's
//! maintenance task calls periodically.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use super::CacheBackend;

const SHARDS: usize = 16;

struct MemEntry {
    value: String,
    expires_at: Instant,
}

/// Hash key and field of one counter.
type CounterId = (String, String);

/// Sharded in-process key-value store with per-entry TTL.
pub struct MemoryBackend {
    shards: Vec<RwLock<HashMap<String, MemEntry>>>,
    counters: Vec<Mutex<HashMap<CounterId, i64>>>,
}

fn shard_index<T: Hash + ?Sized>(value: &T) -> usize {
    let mut h = DefaultHasher::new();
    value.hash(&mut h);
    (h.finish() as usize) % SHARDS
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
            counters: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: &str) -> &RwLock<HashMap<String, MemEntry>> {
        &self.shards[shard_index(key)]
    }

    fn counter_shard(&self, key: &str, field: &str) -> &Mutex<HashMap<CounterId, i64>> {
        &self.counters[shard_index(&(key, field))]
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.shards
            .iter()
            .filter_map(|s| s.read().ok())
            .map(|m| m.values().filter(|e| e.expires_at > now).count())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("in-memory cache lock poisoned")
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let shard = self.shard(key);
        {
            let map = shard.read().map_err(poisoned)?;
            match map.get(key) {
                None => return Ok(None),
                Some(e) if e.expires_at > Instant::now() => return Ok(Some(e.value.clone())),
                Some(_) => {}
            }
        }
        // Expired: drop it unless it was refreshed in between.
        let mut map = shard.write().map_err(poisoned)?;
        if map.get(key).is_some_and(|e| e.expires_at <= Instant::now()) {
            map.remove(key);
        }
        Ok(None)
    }

    async fn set_ex(&self, key: &str, ttl_secs: u64, value: &str) -> Result<()> {
        let entry = MemEntry {
            value: value.to_string(),
            expires_at: Instant::now() + Duration::from_secs(ttl_secs),
        };
        self.shard(key)
            .write()
            .map_err(poisoned)?
            .insert(key.to_string(), entry);
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.shard(key).write().map_err(poisoned)?.remove(key);
        Ok(())
    }

    async fn hincr_by(&self, key: &str, field: &str, by: i64) -> Result<i64> {
        let mut counters = self.counter_shard(key, field).lock().map_err(poisoned)?;
        let slot = counters
            .entry((key.to_string(), field.to_string()))
            .or_insert(0);
        *slot += by;
        Ok(*slot)
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, i64>> {
        let mut out = HashMap::new();
        for shard in &self.counters {
            let counters = shard.lock().map_err(poisoned)?;
            out.extend(
                counters
                    .iter()
                    .filter(|((k, _), _)| k == key)
                    .map(|((_, field), v)| (field.clone(), *v)),
            );
        }
        Ok(out)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let mut removed = 0u64;
        for shard in &self.shards {
            let mut map = shard.write().map_err(poisoned)?;
            let before = map.len();
            map.retain(|k, _| !k.starts_with(prefix));
            removed += (before - map.len()) as u64;
        }
        Ok(removed)
    }

    async fn purge_expired(&self) -> Result<u64> {
        let now = Instant::now();
        let mut removed = 0u64;
        for shard in &self.shards {
            let mut map = shard.write().map_err(poisoned)?;
            let before = map.len();
            map.retain(|_, e| e.expires_at > now);
            removed += (before - map.len()) as u64;
        }
        Ok(removed)
    }
}
