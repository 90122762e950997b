use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use xxhash_rust::xxh3::xxh3_64;

use crate::model::{AggregationMethod, Query, QueryResult};

pub type CacheKey = u64;

/// Builds the stable fingerprint a query caches under: sorted sensors and
/// assets (selector order must not affect cache hits), ISO-8601 timestamps,
/// interval, aggregation, and max_datapoints, joined into one string and
/// hashed with xxh3.
pub fn fingerprint(query: &Query) -> CacheKey {
    let mut sensors = query.sensors.clone();
    sensors.sort();
    let mut assets = query.assets.clone();
    assets.sort();

    let canonical = format!(
        "sensors={}|assets={}|start={}|end={}|interval={}|agg={}|max_points={}",
        sensors.join(","),
        assets.join(","),
        query.start.to_rfc3339(),
        query.end.to_rfc3339(),
        query.interval_ms.map(|v| v.to_string()).unwrap_or_default(),
        query.aggregation.map(AggregationMethod::as_str).unwrap_or(""),
        query.max_datapoints,
    );
    xxh3_64(canonical.as_bytes())
}

struct Entry {
    result: QueryResult,
    inserted_at: Instant,
    ttl: Duration,
    size_bytes: u64,
}

/// An LRU cache of query results with per-entry TTL and a byte budget in
/// addition to an entry-count cap.
struct Lru {
    entries: HashMap<CacheKey, Entry>,
    recency: VecDeque<CacheKey>,
    max_entries: usize,
    max_bytes: u64,
    used_bytes: u64,
}

impl Lru {
    fn new(max_entries: usize, max_bytes: u64) -> Self {
        Self {
            entries: HashMap::new(),
            recency: VecDeque::new(),
            max_entries,
            max_bytes,
            used_bytes: 0,
        }
    }

    fn touch(&mut self, key: CacheKey) {
        if let Some(pos) = self.recency.iter().position(|k| *k == key) {
            self.recency.remove(pos);
        }
        self.recency.push_back(key);
    }

    fn get(&mut self, key: CacheKey) -> Option<QueryResult> {
        let expired = match self.entries.get(&key) {
            Some(entry) => entry.inserted_at.elapsed() >= entry.ttl,
            None => return None,
        };
        if expired {
            self.remove(key);
            return None;
        }
        self.touch(key);
        self.entries.get(&key).map(|e| e.result.clone())
    }

    fn remove(&mut self, key: CacheKey) {
        if let Some(entry) = self.entries.remove(&key) {
            self.used_bytes = self.used_bytes.saturating_sub(entry.size_bytes);
        }
        if let Some(pos) = self.recency.iter().position(|k| *k == key) {
            self.recency.remove(pos);
        }
    }

    fn make_space(&mut self, incoming_bytes: u64) {
        while (self.entries.len() >= self.max_entries
            || self.used_bytes + incoming_bytes > self.max_bytes)
            && !self.recency.is_empty()
        {
            if let Some(oldest) = self.recency.pop_front() {
                if let Some(entry) = self.entries.remove(&oldest) {
                    self.used_bytes = self.used_bytes.saturating_sub(entry.size_bytes);
                }
            }
        }
    }

    fn put(&mut self, key: CacheKey, result: QueryResult, ttl: Duration, size_bytes: u64) {
        self.remove(key);
        self.make_space(size_bytes);
        self.entries.insert(
            key,
            Entry {
                result,
                inserted_at: Instant::now(),
                ttl,
                size_bytes,
            },
        );
        self.recency.push_back(key);
        self.used_bytes += size_bytes;
    }

    fn cleanup_expired(&mut self) -> usize {
        let expired: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(_, e)| e.inserted_at.elapsed() >= e.ttl)
            .map(|(k, _)| *k)
            .collect();
        let count = expired.len();
        for key in expired {
            self.remove(key);
        }
        count
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
        self.used_bytes = 0;
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub used_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions_tracked: u64,
}

struct FrequencyEntry {
    count: u32,
    last_access: Instant,
}

/// Admission, eviction, and adaptive-TTL policy layered over the plain LRU.
/// The frequency tracker lives behind its own lock so a burst of popular
/// lookups never contends with the cache's own insert/evict path.
pub struct SmartCacheManager {
    lru: Mutex<Lru>,
    frequency: Mutex<HashMap<CacheKey, FrequencyEntry>>,
    default_ttl: Duration,
    min_duration_seconds: i64,
    min_sensor_count_bypass: usize,
    max_bytes: u64,
    hits: std::sync::atomic::AtomicU64,
    misses: std::sync::atomic::AtomicU64,
}

impl SmartCacheManager {
    pub fn new(
        max_entries: usize,
        max_bytes: u64,
        default_ttl_seconds: u64,
        min_duration_seconds: u64,
        min_sensor_count_bypass: usize,
    ) -> Self {
        Self {
            lru: Mutex::new(Lru::new(max_entries, max_bytes)),
            frequency: Mutex::new(HashMap::new()),
            default_ttl: Duration::from_secs(default_ttl_seconds),
            min_duration_seconds: min_duration_seconds as i64,
            min_sensor_count_bypass,
            max_bytes,
            hits: std::sync::atomic::AtomicU64::new(0),
            misses: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Admission policy, checked in order: anything whose estimated size
    /// would exceed half the cache's byte budget on its own is rejected to
    /// avoid one query evicting everything else; short-duration queries
    /// (< the configured minimum) are never cached since they are cheap and
    /// churn fast; past those guards, queries touching more than
    /// `min_sensor_count_bypass` sensors are always cached (they are
    /// expensive to recompute); anything else is cached by default.
    pub fn should_cache_query(&self, query: &Query, estimated_size_bytes: u64) -> bool {
        if estimated_size_bytes as f64 > 0.5 * self.max_bytes as f64 {
            return false;
        }
        if query.duration_seconds() < self.min_duration_seconds {
            return false;
        }
        if query.sensors.len() > self.min_sensor_count_bypass {
            return true;
        }
        true
    }

    /// TTL multiplier grows with how often a key has been looked up:
    /// x3 beyond 10 accesses, x2 beyond 5, x1 otherwise.
    pub fn adaptive_ttl(&self, key: CacheKey) -> Duration {
        let accesses = self
            .frequency
            .lock()
            .expect("frequency tracker poisoned")
            .get(&key)
            .map(|e| e.count)
            .unwrap_or(0);
        let multiplier = if accesses > 10 {
            3
        } else if accesses > 5 {
            2
        } else {
            1
        };
        self.default_ttl * multiplier
    }

    /// Bumps a key's access count and last-access time. Called on every
    /// `get` attempt, hit or miss, so adaptive TTL reflects lookup pressure
    /// even while a key is cold.
    pub fn track_query_access(&self, key: CacheKey) {
        let mut frequency = self.frequency.lock().expect("frequency tracker poisoned");
        let entry = frequency.entry(key).or_insert(FrequencyEntry {
            count: 0,
            last_access: Instant::now(),
        });
        entry.count += 1;
        entry.last_access = Instant::now();
    }

    pub fn get_cached_result(&self, key: CacheKey) -> Option<QueryResult> {
        self.track_query_access(key);
        let result = self.lru.lock().expect("cache poisoned").get(key);
        if result.is_some() {
            self.hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        result
    }

    pub fn cache_result(&self, key: CacheKey, result: QueryResult, size_bytes: u64) {
        let ttl = self.adaptive_ttl(key);
        self.lru.lock().expect("cache poisoned").put(key, result, ttl, size_bytes);
    }

    /// Keys ordered by access frequency, most popular first.
    pub fn get_popular_queries(&self, limit: usize) -> Vec<(CacheKey, u32)> {
        let frequency = self.frequency.lock().expect("frequency tracker poisoned");
        let mut entries: Vec<(CacheKey, u32)> = frequency.iter().map(|(k, v)| (*k, v.count)).collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        entries.truncate(limit);
        entries
    }

    pub fn cleanup_expired(&self) -> usize {
        self.lru.lock().expect("cache poisoned").cleanup_expired()
    }

    /// Housekeeping pass dropping any frequency tracker entry whose last
    /// access is older than `max_age`. Independent of the LRU's own TTL —
    /// a key can still be tracked for adaptive TTL long after its cached
    /// payload has expired or been evicted.
    pub fn cleanup_frequency_tracking(&self, max_age: Duration) -> usize {
        let mut frequency = self.frequency.lock().expect("frequency tracker poisoned");
        let before = frequency.len();
        frequency.retain(|_, entry| entry.last_access.elapsed() < max_age);
        before - frequency.len()
    }

    pub fn get_cache_stats(&self) -> CacheStats {
        let lru = self.lru.lock().expect("cache poisoned");
        CacheStats {
            entries: lru.entries.len(),
            used_bytes: lru.used_bytes,
            hits: self.hits.load(std::sync::atomic::Ordering::Relaxed),
            misses: self.misses.load(std::sync::atomic::Ordering::Relaxed),
            evictions_tracked: 0,
        }
    }

    pub fn clear_all(&self) {
        self.lru.lock().expect("cache poisoned").clear();
        self.frequency.lock().expect("frequency tracker poisoned").clear();
    }
}
