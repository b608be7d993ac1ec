//! In-memory TTL cache for non-streaming chat completions.
//!
//! Reads take the shared side of an `RwLock`; expired entries are filtered at
//! read time and physically removed by the background sweeper.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use axum::body::Bytes;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::time::{Instant, MissedTickBehavior};

use crate::lifecycle::BackgroundTask;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl: Duration,
    /// Zero means unbounded.
    pub max_entries: usize,
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(5 * 60),
            max_entries: 1000,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Model id plus the hex SHA-256 of the serialized message list. Message
/// order is part of the digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    model: String,
    digest: String,
}

impl CacheKey {
    pub fn new<T: Serialize + ?Sized>(model: &str, messages: &T) -> Result<Self, serde_json::Error> {
        let bytes = serde_json::to_vec(messages)?;
        let digest = Sha256::digest(&bytes);
        let hex = digest.iter().fold(String::with_capacity(64), |mut acc, b| {
            use fmt::Write;
            let _ = write!(acc, "{b:02x}");
            acc
        });
        Ok(Self {
            model: model.to_string(),
            digest: hex,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.model, self.digest)
    }
}

/// Expiry used when `now + ttl` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Bytes,
    expires_at: Instant,
    size_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub size_bytes: usize,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug)]
pub struct ResponseCache {
    config: CacheConfig,
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    sweeper: BackgroundTask,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sweeper: BackgroundTask::new("cache-sweeper"),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn get(&self, key: &CacheKey) -> Option<Bytes> {
        let now = Instant::now();
        let found = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.value.clone());

        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    pub fn set(&self, key: CacheKey, value: impl Into<Bytes>) {
        self.set_with_ttl(key, value, self.config.ttl);
    }

    pub fn set_with_ttl(&self, key: CacheKey, value: impl Into<Bytes>, ttl: Duration) {
        let value = value.into();
        let now = Instant::now();
        let entry = CacheEntry {
            size_bytes: value.len(),
            value,
            expires_at: now.checked_add(ttl).unwrap_or(now + FAR_FUTURE),
        };

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let max = self.config.max_entries;
        if max > 0 && !entries.contains_key(&key) && entries.len() >= max {
            entries.retain(|_, e| e.expires_at > now);
            if entries.len() >= max {
                evict_soonest(&mut entries, entries_to_evict(max));
            }
        }
        entries.insert(key, entry);
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        CacheStats {
            entries: entries.len(),
            size_bytes: entries.values().map(|e| e.size_bytes).sum(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Starts the periodic sweep. Idempotent.
    pub fn start_sweeper(self: &Arc<Self>) -> bool {
        let cache = Arc::downgrade(self);
        let interval = self.config.sweep_interval;
        self.sweeper.start(move |token| async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(cache) = cache.upgrade() else { break };
                        let removed = cache.sweep();
                        if removed > 0 {
                            tracing::debug!(removed, remaining = cache.len(), "Swept expired cache entries");
                        }
                    }
                }
            }
        })
    }

    pub async fn stop_sweeper(&self) {
        self.sweeper.stop().await;
    }

    pub fn sweeper_running(&self) -> bool {
        self.sweeper.is_running()
    }
}

/// A full cache drops a tenth of its entries at once so the next inserts
/// don't each pay for a scan.
fn entries_to_evict(max: usize) -> usize {
    (max / 10).max(1)
}

fn evict_soonest(entries: &mut HashMap<CacheKey, CacheEntry>, count: usize) {
    let mut by_expiry: Vec<(Instant, CacheKey)> = entries
        .iter()
        .map(|(k, e)| (e.expires_at, k.clone()))
        .collect();
    let count = count.min(by_expiry.len());
    if count == 0 {
        return;
    }
    if count < by_expiry.len() {
        by_expiry.select_nth_unstable_by_key(count - 1, |(at, _)| *at);
    }
    for (_, victim) in by_expiry.into_iter().take(count) {
        entries.remove(&victim);
    }
}
