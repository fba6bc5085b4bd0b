//! Generic TTL store backing the cached envelope service.
//!
//! Two expiry disciplines coexist:
//! - keyed entries slide: every `get` refreshes the access stamp, and a
//!   background sweep evicts entries that went unread for a full TTL;
//! - the one "current" slot is absolute: it expires a fixed interval after
//!   creation no matter how often it is read.
//!
//! Evicted values are dropped, which is how scoped resources (vault-backed
//! DEK holders) release their entries.

use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

struct TimedEntry<V> {
    value: V,
    last_access: Instant,
}

struct CurrentEntry<V> {
    value: V,
    born: Instant,
}

struct CacheShared<K, V> {
    entries: DashMap<K, TimedEntry<V>>,
    current: Mutex<Option<CurrentEntry<V>>>,
    entry_ttl: Duration,
    current_ttl: Duration,
    latch: crate::sync::ShutdownLatch,
}

/// TTL cache with a distinguished current slot and a background sweep.
///
/// The sweep thread stops on `shutdown()` or when the cache is dropped.
pub struct EphemeralKeyCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    shared: Arc<CacheShared<K, V>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<K, V> EphemeralKeyCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create the cache and start its sweep loop.
    pub fn new(entry_ttl: Duration, current_ttl: Duration, sweep_interval: Duration) -> Self {
        let shared = Arc::new(CacheShared {
            entries: DashMap::new(),
            current: Mutex::new(None),
            entry_ttl,
            current_ttl,
            latch: crate::sync::ShutdownLatch::new(),
        });

        let sweeper = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || {
                while shared.latch.wait_for(sweep_interval) {
                    // A panicking value drop must not kill the loop.
                    if catch_unwind(AssertUnwindSafe(|| shared.sweep())).is_err() {
                        warn!("cache sweep panicked; next sweep continues");
                    }
                }
            })
        };

        Self {
            shared,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    /// Insert or replace a keyed entry with a fresh access stamp.
    pub fn put(&self, key: K, value: V) {
        self.shared.entries.insert(
            key,
            TimedEntry {
                value,
                last_access: Instant::now(),
            },
        );
    }

    /// Fetch a keyed entry, refreshing its access stamp. An entry whose last
    /// access is a full TTL in the past is evicted instead of returned.
    pub fn get(&self, key: &K) -> Option<V> {
        {
            let mut entry = self.shared.entries.get_mut(key)?;
            if entry.last_access.elapsed() < self.shared.entry_ttl {
                entry.last_access = Instant::now();
                return Some(entry.value.clone());
            }
        }
        // Stale: the guard is released above, safe to remove now.
        self.shared.entries.remove(key);
        None
    }

    /// Replace the current slot; its clock starts now.
    pub fn put_current(&self, value: V) {
        let mut current = self.shared.current.lock();
        *current = Some(CurrentEntry {
            value,
            born: Instant::now(),
        });
    }

    /// Fetch the current slot while it is younger than its absolute TTL.
    /// Reads never extend its life.
    pub fn get_current(&self) -> Option<V> {
        let mut current = self.shared.current.lock();
        match current.as_ref() {
            Some(entry) if entry.born.elapsed() < self.shared.current_ttl => {
                Some(entry.value.clone())
            }
            Some(_) => {
                *current = None;
                None
            }
            None => None,
        }
    }

    /// Drop every value, keyed and current.
    pub fn clear(&self) {
        self.shared.entries.clear();
        *self.shared.current.lock() = None;
    }

    pub fn len(&self) -> usize {
        self.shared.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.entries.is_empty()
    }

    /// Stop the sweep loop. Idempotent; entries stay readable afterwards.
    pub fn shutdown(&self) {
        self.shared.latch.trip();
        if let Some(handle) = self.sweeper.lock().take() {
            let _ = handle.join();
        }
    }
}

impl<K, V> CacheShared<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn sweep(&self) {
        let stale: Vec<K> = self
            .entries
            .iter()
            .filter(|e| e.last_access.elapsed() >= self.entry_ttl)
            .map(|e| e.key().clone())
            .collect();

        let mut evicted = 0usize;
        for key in stale {
            if let Some((_, entry)) = self.entries.remove(&key) {
                drop(entry);
                evicted += 1;
            }
        }

        // The current slot expires here too if nobody read it out.
        {
            let mut current = self.current.lock();
            if matches!(current.as_ref(), Some(e) if e.born.elapsed() >= self.current_ttl) {
                *current = None;
                evicted += 1;
            }
        }

        if evicted > 0 {
            debug!(evicted, "cache sweep evicted stale entries");
        }
    }
}

impl<K, V> Drop for EphemeralKeyCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(entry_ms: u64, current_ms: u64) -> EphemeralKeyCache<String, String> {
        EphemeralKeyCache::new(
            Duration::from_millis(entry_ms),
            Duration::from_millis(current_ms),
            Duration::from_millis(10),
        )
    }

    #[test]
    fn get_refreshes_the_sliding_window() {
        let c = cache(80, 80);
        c.put("k".to_string(), "v".to_string());
        for _ in 0..5 {
            std::thread::sleep(Duration::from_millis(30));
            assert_eq!(c.get(&"k".to_string()).as_deref(), Some("v"));
        }
    }

    #[test]
    fn unread_entries_expire() {
        let c = cache(40, 40);
        c.put("k".to_string(), "v".to_string());
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(c.get(&"k".to_string()), None);
    }

    #[test]
    fn current_slot_ignores_reads() {
        let c = cache(500, 60);
        c.put_current("dek".to_string());
        assert_eq!(c.get_current().as_deref(), Some("dek"));
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(c.get_current(), None);
    }

    #[test]
    fn clear_empties_everything() {
        let c = cache(500, 500);
        c.put("k".to_string(), "v".to_string());
        c.put_current("c".to_string());
        c.clear();
        assert!(c.is_empty());
        assert_eq!(c.get_current(), None);
    }

    #[test]
    fn sweep_evicts_without_reads() {
        let c = cache(30, 30);
        c.put("k".to_string(), "v".to_string());
        std::thread::sleep(Duration::from_millis(100));
        // The sweeper ran at least once by now; no get() was needed.
        assert!(c.is_empty());
        c.shutdown();
    }
}
