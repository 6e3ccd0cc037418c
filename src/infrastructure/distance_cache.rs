use crate::domain::models::{ResolutionConfidence, TravelMode};
use crate::infrastructure::error::EngineError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

pub const DEFAULT_TTL_SECONDS: u64 = 600;
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    pub origin: String,
    pub destination: String,
    pub mode: TravelMode,
}

impl RouteKey {
    pub fn new(origin: &str, destination: &str, mode: TravelMode) -> Self {
        Self {
            origin: origin.trim().to_lowercase(),
            destination: destination.trim().to_lowercase(),
            mode,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEstimate {
    pub distance_meters: u64,
    pub duration_seconds: u64,
    pub origin_address: String,
    pub destination_address: String,
    pub resolved_at: DateTime<Utc>,
    pub confidence: ResolutionConfidence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CacheStats {
    pub size: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
}

pub trait DistanceCacheRepository: Send + Sync {
    /// Entry for `key` if it is younger than the TTL at `now`; counts a hit or miss.
    fn get_fresh(&self, key: &RouteKey, now: DateTime<Utc>) -> Result<Option<RouteEstimate>, EngineError>;
    fn put(&self, key: RouteKey, estimate: RouteEstimate, now: DateTime<Utc>) -> Result<(), EngineError>;
    fn clear(&self) -> Result<(), EngineError>;
    fn stats(&self) -> Result<CacheStats, EngineError>;
}

#[derive(Debug)]
pub struct InMemoryDistanceCache {
    entries: Mutex<HashMap<RouteKey, RouteEstimate>>,
    ttl: Duration,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for InMemoryDistanceCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL_SECONDS, DEFAULT_MAX_ENTRIES)
    }
}

impl InMemoryDistanceCache {
    pub fn new(ttl_seconds: u64, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: Duration::seconds(i64::try_from(ttl_seconds).unwrap_or(i64::MAX / 1000)),
            max_entries: max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn is_fresh(&self, estimate: &RouteEstimate, now: DateTime<Utc>) -> bool {
        now - estimate.resolved_at < self.ttl
    }

    fn make_room(&self, entries: &mut HashMap<RouteKey, RouteEstimate>, now: DateTime<Utc>) {
        entries.retain(|_, estimate| self.is_fresh(estimate, now));
        if entries.len() < self.max_entries {
            return;
        }

        let evict_count = self.max_entries.div_ceil(5).max(1);
        let mut by_age = entries
            .iter()
            .map(|(key, estimate)| (estimate.resolved_at, key.clone()))
            .collect::<Vec<_>>();
        by_age.sort_by(|left, right| left.0.cmp(&right.0));
        for (_, key) in by_age.into_iter().take(evict_count) {
            entries.remove(&key);
        }
        tracing::debug!(evicted = evict_count, remaining = entries.len(), "distance cache evicted oldest entries");
    }
}

impl DistanceCacheRepository for InMemoryDistanceCache {
    fn get_fresh(&self, key: &RouteKey, now: DateTime<Utc>) -> Result<Option<RouteEstimate>, EngineError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|error| EngineError::lock_poisoned("distance cache", error))?;
        let fresh = match entries.get(key) {
            Some(estimate) if self.is_fresh(estimate, now) => Some(estimate.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        };
        if fresh.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(fresh)
    }

    fn put(&self, key: RouteKey, estimate: RouteEstimate, now: DateTime<Utc>) -> Result<(), EngineError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|error| EngineError::lock_poisoned("distance cache", error))?;
        if !entries.contains_key(&key) && entries.len() >= self.max_entries {
            self.make_room(&mut entries, now);
        }
        entries.insert(key, estimate);
        Ok(())
    }

    fn clear(&self) -> Result<(), EngineError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|error| EngineError::lock_poisoned("distance cache", error))?;
        entries.clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn stats(&self) -> Result<CacheStats, EngineError> {
        let entries = self
            .entries
            .lock()
            .map_err(|error| EngineError::lock_poisoned("distance cache", error))?;
        Ok(CacheStats {
            size: entries.len(),
            max_entries: self.max_entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        })
    }
}
