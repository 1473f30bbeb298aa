//! Response cache.
//!
//! Keyed by a stable fingerprint of the normalized query text plus a
//! configured subset of the query context. Entries expire by TTL and are
//! evicted least-recently-used when the cache is bounded. Concurrent
//! misses on the same fingerprint coalesce: a per-fingerprint build slot
//! guarantees at most one pipeline build at a time, and waiters re-check
//! the cache once the leader finishes.
//!
//! Failures are never cached; only successfully built responses enter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use ens_domain::config::CacheConfig;
use ens_domain::query::Query;
use ens_domain::response::FinalResponse;

use crate::chitchat::normalize;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fingerprint
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Stable cache key: SHA-256 over the normalized text and the configured
/// context values (in configured key order, so the digest is stable).
pub fn fingerprint(query: &Query, context_keys: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize(&query.text).as_bytes());
    for key in context_keys {
        if let Some(value) = query.context.get(key) {
            hasher.update([0u8]);
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hasher.update(value.to_string().as_bytes());
        }
    }
    hex::encode(hasher.finalize())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cache
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct StoredEntry {
    response: Arc<FinalResponse>,
    created_at: Instant,
    last_used: u64,
}

pub struct ResponseCache {
    enabled: bool,
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<EntryMap>,
    /// fingerprint → single-flight build slot. Shared with outstanding
    /// [`BuildSlot`]s so they can clean up after themselves.
    flights: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
}

struct EntryMap {
    map: HashMap<String, StoredEntry>,
    /// Monotonic use counter backing LRU eviction.
    tick: u64,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            enabled: config.enabled,
            ttl: Duration::from_millis(config.ttl_ms),
            max_entries: config.max_entries,
            entries: Mutex::new(EntryMap {
                map: HashMap::new(),
                tick: 0,
            }),
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Fetch a live entry. Touches it for LRU purposes.
    pub fn get(&self, fingerprint: &str) -> Option<Arc<FinalResponse>> {
        if !self.enabled {
            return None;
        }
        let mut entries = self.entries.lock();
        entries.tick += 1;
        let tick = entries.tick;
        let expired = entries
            .map
            .get(fingerprint)
            .map(|e| e.created_at.elapsed() >= self.ttl)?;
        if expired {
            entries.map.remove(fingerprint);
            return None;
        }
        let entry = entries.map.get_mut(fingerprint)?;
        entry.last_used = tick;
        Some(entry.response.clone())
    }

    /// Store a response. Expired entries are purged and, when bounded,
    /// the least-recently-used entry makes room.
    pub fn put(&self, fingerprint: &str, response: FinalResponse) {
        if !self.enabled {
            return;
        }
        let mut entries = self.entries.lock();
        entries.tick += 1;
        let tick = entries.tick;

        let ttl = self.ttl;
        entries.map.retain(|_, e| e.created_at.elapsed() < ttl);

        if self.max_entries > 0
            && entries.map.len() >= self.max_entries
            && !entries.map.contains_key(fingerprint)
        {
            if let Some(oldest) = entries
                .map
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                tracing::debug!(fingerprint = %oldest, "evicting least-recently-used cache entry");
                entries.map.remove(&oldest);
            }
        }

        entries.map.insert(
            fingerprint.to_string(),
            StoredEntry {
                response: Arc::new(response),
                created_at: Instant::now(),
                last_used: tick,
            },
        );
    }

    /// Acquire the build slot for a fingerprint, waiting if another
    /// request is already building it. Callers re-check [`get`] after
    /// acquiring; the previous holder usually populated the entry.
    ///
    /// Dropping the returned slot releases the next waiter. A waiter whose
    /// future is dropped mid-wait affects neither the build nor the others.
    pub async fn begin_build(&self, fingerprint: &str) -> BuildSlot {
        if !self.enabled {
            return BuildSlot {
                _permit: None,
                fingerprint: String::new(),
                flights: None,
            };
        }

        let sem = {
            let mut flights = self.flights.lock();
            flights
                .entry(fingerprint.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };

        // The semaphore is never closed, so acquisition only fails if the
        // runtime is tearing down; degrade to an unguarded build then.
        let permit = sem.acquire_owned().await.ok();
        BuildSlot {
            _permit: permit,
            fingerprint: fingerprint.to_string(),
            flights: Some(self.flights.clone()),
        }
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        let entries = self.entries.lock();
        entries
            .map
            .values()
            .filter(|e| e.created_at.elapsed() < self.ttl)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive right to build the response for one fingerprint.
pub struct BuildSlot {
    _permit: Option<OwnedSemaphorePermit>,
    fingerprint: String,
    flights: Option<Arc<Mutex<HashMap<String, Arc<Semaphore>>>>>,
}

impl Drop for BuildSlot {
    fn drop(&mut self) {
        let Some(flights) = self.flights.take() else {
            return;
        };
        // Release the permit first so a queued waiter can proceed, then
        // drop the map entry once nobody else holds the semaphore.
        self._permit = None;
        let mut flights = flights.lock();
        if let Some(sem) = flights.get(&self.fingerprint) {
            if Arc::strong_count(sem) == 1 {
                flights.remove(&self.fingerprint);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ens_domain::trace::MoETrace;

    fn response(text: &str) -> FinalResponse {
        FinalResponse {
            text: text.into(),
            structured_payloads: Vec::new(),
            trace: MoETrace {
                request_id: "q-0".into(),
                query: Query::new("q-0", "x"),
                selection_window: None,
                execution_window: None,
                mixing_window: None,
                selected_expert_ids: Vec::new(),
                per_expert: Vec::new(),
                latency_ms: 0,
                cache_hit: false,
                emitted_events: Vec::new(),
            },
        }
    }

    fn config(ttl_ms: u64, max_entries: usize) -> CacheConfig {
        CacheConfig {
            enabled: true,
            ttl_ms,
            max_entries,
            ..Default::default()
        }
    }

    #[test]
    fn fingerprint_is_normalization_stable() {
        let keys: Vec<String> = vec![];
        let a = fingerprint(&Query::new("q-1", "Show me PIZZA!"), &keys);
        let b = fingerprint(&Query::new("q-2", "  show   me pizza  "), &keys);
        assert_eq!(a, b);

        let c = fingerprint(&Query::new("q-3", "show me pasta"), &keys);
        assert_ne!(a, c);
    }

    #[test]
    fn fingerprint_separates_configured_context() {
        let keys = vec!["session_id".to_string()];
        let mut ctx_a = HashMap::new();
        ctx_a.insert("session_id".to_string(), serde_json::json!("alice"));
        let mut ctx_b = HashMap::new();
        ctx_b.insert("session_id".to_string(), serde_json::json!("bob"));

        let a = fingerprint(&Query::new("q-1", "hi").with_context(ctx_a.clone()), &keys);
        let b = fingerprint(&Query::new("q-2", "hi").with_context(ctx_b), &keys);
        assert_ne!(a, b);

        // Context keys not in the configured subset do not perturb the key.
        let mut ctx_c = ctx_a.clone();
        ctx_c.insert("mood".to_string(), serde_json::json!("sunny"));
        let c = fingerprint(&Query::new("q-3", "hi").with_context(ctx_c), &keys);
        let a2 = fingerprint(&Query::new("q-4", "hi").with_context(ctx_a), &keys);
        assert_eq!(c, a2);
    }

    #[test]
    fn get_put_roundtrip() {
        let cache = ResponseCache::new(&config(60_000, 0));
        assert!(cache.get("fp").is_none());
        cache.put("fp", response("hello"));
        assert_eq!(cache.get("fp").unwrap().text, "hello");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn ttl_expires_entries() {
        let cache = ResponseCache::new(&config(0, 0));
        cache.put("fp", response("hello"));
        // ttl_ms = 0: expired immediately.
        assert!(cache.get("fp").is_none());
    }

    #[test]
    fn lru_evicts_coldest() {
        let cache = ResponseCache::new(&config(60_000, 2));
        cache.put("a", response("A"));
        cache.put("b", response("B"));
        // Touch "a" so "b" is the LRU entry.
        assert!(cache.get("a").is_some());
        cache.put("c", response("C"));

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn disabled_cache_is_inert() {
        let cache = ResponseCache::new(&CacheConfig {
            enabled: false,
            ..Default::default()
        });
        cache.put("fp", response("hello"));
        assert!(cache.get("fp").is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn build_slot_serializes_same_fingerprint() {
        let cache = Arc::new(ResponseCache::new(&config(60_000, 0)));

        let slot = cache.begin_build("fp").await;

        let contender = cache.clone();
        let waiter = tokio::spawn(async move {
            let _slot = contender.begin_build("fp").await;
            contender.get("fp").map(|r| r.text.clone())
        });

        // Give the waiter time to queue, then publish and release.
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.put("fp", response("built once"));
        drop(slot);

        let seen = waiter.await.unwrap();
        assert_eq!(seen.as_deref(), Some("built once"));
    }

    #[tokio::test]
    async fn distinct_fingerprints_build_concurrently() {
        let cache = ResponseCache::new(&config(60_000, 0));
        let slot_a = cache.begin_build("a").await;
        // Must not block on slot_a.
        let slot_b = cache.begin_build("b").await;
        drop(slot_a);
        drop(slot_b);
    }

    #[tokio::test]
    async fn dropped_waiter_does_not_poison_the_slot() {
        let cache = Arc::new(ResponseCache::new(&config(60_000, 0)));
        let slot = cache.begin_build("fp").await;

        let contender = cache.clone();
        let waiter = tokio::spawn(async move {
            let _slot = contender.begin_build("fp").await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        waiter.abort();
        let _ = waiter.await;

        drop(slot);
        // The slot is still acquirable after the waiter vanished.
        let reacquired = cache.begin_build("fp").await;
        drop(reacquired);
    }

    #[tokio::test]
    async fn flight_map_is_cleaned_up() {
        let cache = ResponseCache::new(&config(60_000, 0));
        {
            let _slot = cache.begin_build("fp").await;
        }
        assert!(cache.flights.lock().is_empty());
    }
}
