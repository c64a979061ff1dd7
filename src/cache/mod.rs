//! Content-addressed result cache.
//!
//! Analysis responses are cached under
//! `structlint:analysis:{sha256(content)[..16]}:{file_type}:{max_errors}`
//! for `ttl_secs` (default 86400).
//!
//! # Backends
//!
//! Storage goes through the [`CacheBackend`] port, a key-value contract of
//! `get`, `set_ex`, `del`, `hincr_by` and `hget_all` (plus prefix delete,
//! expiry purge and a health probe). [`ResultCache`] holds an optional
//! primary backend ([`SqliteBackend`](sqlite::SqliteBackend) by default) and
//! an always-available [`MemoryBackend`](memory::MemoryBackend) fallback.
//!
//! The first primary error flips a `primary_available` flag and every later
//! operation goes straight to the fallback; nothing retries the primary per
//! call. The maintenance task probes the primary and flips the flag back
//! once it answers.
//!
//! # Validity
//!
//! An entry is served only while its `model_version` and `rag_version` equal
//! the running configuration. A mismatch counts as a miss and an
//! invalidation, and the entry is deleted.
//!
//! # Stats
//!
//! `hits`, `misses`, `invalidations` and `total_requests` are counters kept
//! in whichever backend served the lookup, so primary and fallback figures
//! are reported separately.

pub mod memory;
pub mod sqlite;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::models::FileType;
use memory::MemoryBackend;

/// Prefix shared by every cached analysis entry.
pub const ENTRY_PREFIX: &str = "structlint:analysis:";
const STATS_KEY: &str = "structlint:stats";

/// Minimal key-value contract a cache store must satisfy.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Short label used in stats and logs.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_ex(&self, key: &str, ttl_secs: u64, value: &str) -> Result<()>;

    async fn del(&self, key: &str) -> Result<()>;

    /// Adds `by` to a counter field and returns the new value.
    async fn hincr_by(&self, key: &str, field: &str, by: i64) -> Result<i64>;

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, i64>>;

    /// Deletes every entry whose key starts with `prefix`.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;

    /// Deletes expired entries. Backends with native expiry need not override.
    async fn purge_expired(&self) -> Result<u64> {
        Ok(0)
    }

    async fn ping(&self) -> Result<()> {
        self.get("structlint:ping").await.map(|_| ())
    }
}

/// Identity of a cacheable analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheKey {
    pub content_hash: String,
    pub file_type: FileType,
    pub max_errors: u32,
}

impl CacheKey {
    pub fn new(content: &str, file_type: FileType, max_errors: u32) -> Self {
        let digest = hex::encode(Sha256::digest(content.as_bytes()));
        Self {
            content_hash: digest[..16].to_string(),
            file_type,
            max_errors,
        }
    }

    pub fn storage_key(&self) -> String {
        format!(
            "{}{}:{}:{}",
            ENTRY_PREFIX, self.content_hash, self.file_type, self.max_errors
        )
    }
}

/// A cached analysis response and the versions it was produced under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub request_id: String,
    pub cache_key: CacheKey,
    /// The serialized response body, returned verbatim on a hit.
    pub response: String,
    pub model: String,
    pub model_version: String,
    pub rag_version: String,
    pub created_at: String,
    pub ttl_seconds: u64,
}

/// Counters for one backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackendStats {
    pub backend: String,
    pub hits: i64,
    pub misses: i64,
    pub invalidations: i64,
    pub total_requests: i64,
    pub hit_rate: f64,
}

impl BackendStats {
    fn from_counters(backend: &str, c: &HashMap<String, i64>) -> Self {
        let field = |k: &str| c.get(k).copied().unwrap_or(0);
        let (hits, total) = (field("hits"), field("total_requests"));
        Self {
            backend: backend.to_string(),
            hits,
            misses: field("misses"),
            invalidations: field("invalidations"),
            total_requests: total,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub primary_available: bool,
    pub ttl_secs: u64,
    pub model_version: String,
    pub rag_version: String,
    /// `None` when there is no primary or it is currently unavailable.
    pub primary: Option<BackendStats>,
    pub fallback: BackendStats,
}

/// Which store served an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Primary,
    Fallback,
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Result cache over a primary backend with an in-memory fallback.
pub struct ResultCache {
    primary: Option<Arc<dyn CacheBackend>>,
    fallback: Arc<MemoryBackend>,
    primary_available: AtomicBool,
    ttl_secs: u64,
    model_version: String,
    rag_version: String,
}

impl ResultCache {
    pub fn new(
        primary: Option<Arc<dyn CacheBackend>>,
        ttl_secs: u64,
        model_version: &str,
        rag_version: &str,
    ) -> Self {
        Self {
            primary_available: AtomicBool::new(primary.is_some()),
            primary,
            fallback: Arc::new(MemoryBackend::new()),
            ttl_secs,
            model_version: model_version.to_string(),
            rag_version: rag_version.to_string(),
        }
    }

    /// A cache with no primary store.
    pub fn in_memory(ttl_secs: u64, model_version: &str, rag_version: &str) -> Self {
        Self::new(None, ttl_secs, model_version, rag_version)
    }

    pub fn primary_available(&self) -> bool {
        self.primary.is_some() && self.primary_available.load(Ordering::Acquire)
    }

    pub fn fallback(&self) -> &MemoryBackend {
        &self.fallback
    }

    fn live_primary(&self) -> Option<&Arc<dyn CacheBackend>> {
        self.primary
            .as_ref()
            .filter(|_| self.primary_available.load(Ordering::Acquire))
    }

    fn trip_primary(&self, op: &str, e: &anyhow::Error) {
        if self.primary_available.swap(false, Ordering::AcqRel) {
            log::warn!(
                "primary cache unavailable during {} ({}); using in-memory fallback",
                op,
                e
            );
        }
    }

    /// Runs `op` on the primary if it is live, else (or on failure) on the fallback.
    async fn run<'a, T>(
        &'a self,
        name: &str,
        op: impl Fn(&'a dyn CacheBackend) -> BoxFuture<'a, T>,
    ) -> (Tier, Result<T>) {
        if let Some(primary) = self.live_primary() {
            match op(primary.as_ref()).await {
                Ok(v) => return (Tier::Primary, Ok(v)),
                Err(e) => self.trip_primary(name, &e),
            }
        }
        let fallback: &'a dyn CacheBackend = self.fallback.as_ref();
        (Tier::Fallback, op(fallback).await)
    }

    fn backend(&self, tier: Tier) -> &dyn CacheBackend {
        match (tier, &self.primary) {
            (Tier::Primary, Some(p)) => p.as_ref(),
            _ => self.fallback.as_ref(),
        }
    }

    async fn count(&self, tier: Tier, field: &str) {
        let result = match tier {
            Tier::Primary => self
                .run("hincr_by", |b| b.hincr_by(STATS_KEY, field, 1))
                .await
                .1
                .map(|_| ()),
            Tier::Fallback => self.fallback.hincr_by(STATS_KEY, field, 1).await.map(|_| ()),
        };
        if let Err(e) = result {
            log::debug!("cache counter {} not updated: {}", field, e);
        }
    }

    /// Looks up a valid entry, updating stats and evicting stale versions.
    pub async fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        let storage_key = key.storage_key();
        let (tier, result) = self.run("get", |b| b.get(&storage_key)).await;

        let outcome = match result {
            Ok(Some(raw)) => match serde_json::from_str::<CacheEntry>(&raw) {
                Ok(entry)
                    if entry.model_version == self.model_version
                        && entry.rag_version == self.rag_version =>
                {
                    Some(entry)
                }
                Ok(entry) => {
                    log::info!(
                        "cache entry {} invalidated (model_version {} -> {}, rag_version {} -> {})",
                        storage_key,
                        entry.model_version,
                        self.model_version,
                        entry.rag_version,
                        self.rag_version
                    );
                    self.evict(tier, &storage_key).await;
                    self.count(tier, "invalidations").await;
                    None
                }
                Err(e) => {
                    log::warn!("discarding unreadable cache entry {}: {}", storage_key, e);
                    self.evict(tier, &storage_key).await;
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                log::warn!("cache lookup failed: {}", e);
                None
            }
        };

        self.count(tier, "total_requests").await;
        self.count(tier, if outcome.is_some() { "hits" } else { "misses" })
            .await;
        outcome
    }

    async fn evict(&self, tier: Tier, storage_key: &str) {
        if let Err(e) = self.backend(tier).del(storage_key).await {
            log::debug!("cache delete of {} failed: {}", storage_key, e);
        }
    }

    /// Writes a response through to the active store.
    pub async fn store(
        &self,
        key: &CacheKey,
        request_id: &str,
        model: &str,
        response_body: &str,
    ) -> Result<Tier> {
        let entry = CacheEntry {
            request_id: request_id.to_string(),
            cache_key: key.clone(),
            response: response_body.to_string(),
            model: model.to_string(),
            model_version: self.model_version.clone(),
            rag_version: self.rag_version.clone(),
            created_at: chrono::Utc::now().to_rfc3339(),
            ttl_seconds: self.ttl_secs,
        };
        let serialized = serde_json::to_string(&entry)?;
        let storage_key = key.storage_key();
        let ttl = self.ttl_secs;
        let (tier, result) = self
            .run("set_ex", |b| b.set_ex(&storage_key, ttl, &serialized))
            .await;
        result?;
        log::debug!("cached {} in {:?} store", storage_key, tier);
        Ok(tier)
    }

    /// Deletes every analysis entry from both stores.
    pub async fn flush(&self) -> Result<u64> {
        let mut removed = self.fallback.delete_prefix(ENTRY_PREFIX).await?;
        if let Some(primary) = self.live_primary() {
            match primary.delete_prefix(ENTRY_PREFIX).await {
                Ok(n) => removed += n,
                Err(e) => self.trip_primary("flush", &e),
            }
        }
        log::info!("flushed {} cache entries", removed);
        Ok(removed)
    }

    pub async fn stats(&self, enabled: bool) -> CacheStats {
        let primary = match self.live_primary() {
            Some(p) => match p.hget_all(STATS_KEY).await {
                Ok(c) => Some(BackendStats::from_counters(p.name(), &c)),
                Err(e) => {
                    self.trip_primary("stats", &e);
                    None
                }
            },
            None => None,
        };
        let fallback_counters = self.fallback.hget_all(STATS_KEY).await.unwrap_or_default();
        CacheStats {
            enabled,
            primary_available: self.primary_available(),
            ttl_secs: self.ttl_secs,
            model_version: self.model_version.clone(),
            rag_version: self.rag_version.clone(),
            primary,
            fallback: BackendStats::from_counters(self.fallback.name(), &fallback_counters),
        }
    }

    /// One maintenance pass: sweep expired entries and re-probe a tripped primary.
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let swept = match self.fallback.purge_expired().await {
            Ok(n) => n,
            Err(e) => {
                log::warn!("in-memory cache sweep failed: {}", e);
                0
            }
        };

        if let Some(primary) = &self.primary {
            if self.primary_available.load(Ordering::Acquire) {
                if let Err(e) = primary.purge_expired().await {
                    self.trip_primary("purge", &e);
                }
            } else if primary.ping().await.is_ok() {
                self.primary_available.store(true, Ordering::Release);
                log::info!("primary cache ({}) reachable again", primary.name());
            }
        }

        if swept > 0 {
            log::debug!("swept {} expired in-memory cache entries", swept);
        }
        MaintenanceReport {
            swept,
            primary_available: self.primary_available(),
        }
    }

    /// Spawns the periodic maintenance task.
    pub fn start_maintenance(self: &Arc<Self>, interval: Duration) -> MaintenanceHandle {
        let cache = Arc::clone(self);
        let (tx, mut rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        cache.run_maintenance().await;
                    }
                    _ = &mut rx => break,
                }
            }
        });
        MaintenanceHandle {
            shutdown: Some(tx),
            task: Some(task),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub swept: u64,
    pub primary_available: bool,
}

/// Stops the maintenance task when shut down or dropped.
pub struct MaintenanceHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl MaintenanceHandle {
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    /// Memory backend that can be switched into a failing state.
    struct FlakyBackend {
        inner: MemoryBackend,
        failing: AtomicBool,
        calls: AtomicU32,
    }

    impl FlakyBackend {
        fn new() -> Self {
            Self {
                inner: MemoryBackend::new(),
                failing: AtomicBool::new(false),
                calls: AtomicU32::new(0),
            }
        }
        fn check(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("connection refused");
            }
            Ok(())
        }
    }

    #[async_trait]
    impl CacheBackend for FlakyBackend {
        fn name(&self) -> &'static str {
            "flaky"
        }
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.check()?;
            self.inner.get(key).await
        }
        async fn set_ex(&self, key: &str, ttl: u64, value: &str) -> Result<()> {
            self.check()?;
            self.inner.set_ex(key, ttl, value).await
        }
        async fn del(&self, key: &str) -> Result<()> {
            self.check()?;
            self.inner.del(key).await
        }
        async fn hincr_by(&self, key: &str, field: &str, by: i64) -> Result<i64> {
            self.check()?;
            self.inner.hincr_by(key, field, by).await
        }
        async fn hget_all(&self, key: &str) -> Result<HashMap<String, i64>> {
            self.check()?;
            self.inner.hget_all(key).await
        }
        async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
            self.check()?;
            self.inner.delete_prefix(prefix).await
        }
    }

    fn key() -> CacheKey {
        CacheKey::new("{\"a\": 1}", FileType::Json, 50)
    }

    #[test]
    fn test_key_shape() {
        let k = key();
        assert_eq!(k.content_hash.len(), 16);
        assert!(k.content_hash.chars().all(|c| c.is_ascii_hexdigit()));
        let s = k.storage_key();
        assert!(s.starts_with(ENTRY_PREFIX));
        assert!(s.ends_with(":json:50"));
        assert_ne!(s, CacheKey::new("{\"a\": 1}", FileType::Json, 10).storage_key());
    }

    #[tokio::test]
    async fn test_store_then_hit_returns_same_body() {
        let cache = ResultCache::in_memory(60, "m1", "1.0.0");
        assert!(cache.lookup(&key()).await.is_none());
        cache.store(&key(), "req-1", "model", "{\"errors\":[]}").await.unwrap();
        let entry = cache.lookup(&key()).await.unwrap();
        assert_eq!(entry.response, "{\"errors\":[]}");
        assert_eq!(entry.request_id, "req-1");

        let stats = cache.stats(true).await;
        assert_eq!(stats.fallback.hits, 1);
        assert_eq!(stats.fallback.misses, 1);
        assert_eq!(stats.fallback.total_requests, 2);
        assert!(stats.primary.is_none());
    }

    #[tokio::test]
    async fn test_rag_version_bump_invalidates() {
        let primary = Arc::new(MemoryBackend::new());
        let old = ResultCache::new(Some(primary.clone()), 60, "m1", "1.0.0");
        old.store(&key(), "req-1", "model", "{}").await.unwrap();

        let new = ResultCache::new(Some(primary.clone()), 60, "m1", "1.1.0");
        assert!(new.lookup(&key()).await.is_none());
        assert!(primary.get(&key().storage_key()).await.unwrap().is_none());

        let stats = new.stats(true).await;
        let p = stats.primary.unwrap();
        assert_eq!(p.invalidations, 1);
        assert_eq!(p.misses, 1);
    }

    #[tokio::test]
    async fn test_primary_failure_trips_to_fallback() {
        let primary = Arc::new(FlakyBackend::new());
        let cache = ResultCache::new(Some(primary.clone()), 60, "m1", "1.0.0");
        assert!(cache.primary_available());

        primary.failing.store(true, Ordering::SeqCst);
        assert_eq!(cache.store(&key(), "r", "m", "{}").await.unwrap(), Tier::Fallback);
        assert!(!cache.primary_available());

        // Later calls skip the primary entirely.
        let calls = primary.calls.load(Ordering::SeqCst);
        assert!(cache.lookup(&key()).await.is_some());
        assert_eq!(primary.calls.load(Ordering::SeqCst), calls);
        assert_eq!(cache.stats(true).await.fallback.hits, 1);
    }

    #[tokio::test]
    async fn test_maintenance_restores_primary() {
        let primary = Arc::new(FlakyBackend::new());
        let cache = ResultCache::new(Some(primary.clone()), 60, "m1", "1.0.0");
        primary.failing.store(true, Ordering::SeqCst);
        cache.lookup(&key()).await;
        assert!(!cache.primary_available());

        assert!(!cache.run_maintenance().await.primary_available);
        primary.failing.store(false, Ordering::SeqCst);
        assert!(cache.run_maintenance().await.primary_available);
        assert_eq!(cache.store(&key(), "r", "m", "{}").await.unwrap(), Tier::Primary);
    }

    #[tokio::test]
    async fn test_maintenance_sweeps_expired_fallback_entries() {
        let cache = ResultCache::in_memory(0, "m1", "1.0.0");
        cache.store(&key(), "r", "m", "{}").await.unwrap();
        let report = cache.run_maintenance().await;
        assert_eq!(report.swept, 1);
        assert!(cache.fallback().is_empty());
    }

    #[tokio::test]
    async fn test_flush_clears_entries_but_keeps_stats() {
        let cache = ResultCache::in_memory(60, "m1", "1.0.0");
        cache.store(&key(), "r", "m", "{}").await.unwrap();
        cache.lookup(&key()).await;
        assert_eq!(cache.flush().await.unwrap(), 1);
        assert!(cache.lookup(&key()).await.is_none());
        assert_eq!(cache.stats(true).await.fallback.hits, 1);
    }

    #[tokio::test]
    async fn test_maintenance_task_shuts_down() {
        let cache = Arc::new(ResultCache::in_memory(60, "m1", "1.0.0"));
        let handle = cache.start_maintenance(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.shutdown().await;
    }
}
