//! Bounded TTL cache for expensive client handles.

use lru::LruCache;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// Identity of a vendor client: endpoint plus credential fingerprint (never
/// the raw secret) plus the timeouts the client was built with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    pub endpoint: String,
    pub credential: String,
    pub connect_ms: u64,
    pub read_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    Expired,
    Capacity,
    Replaced,
    Removed,
    Cleared,
}

type EvictHook<K, V> = Arc<dyn Fn(&K, &V, EvictReason) + Send + Sync>;

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

/// LRU + TTL cache. Reads take the read lock and never reorder; inserts and
/// expiry take the write lock. The evict hook runs on the calling task after
/// the lock is released, once per evicted entry.
pub struct ClientCache<K, V> {
    entries: RwLock<LruCache<K, Entry<V>>>,
    ttl: Duration,
    on_evict: EvictHook<K, V>,
}

impl<K, V> ClientCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new<F>(capacity: NonZeroUsize, ttl: Duration, on_evict: F) -> Self
    where
        F: Fn(&K, &V, EvictReason) + Send + Sync + 'static,
    {
        Self {
            entries: RwLock::new(LruCache::new(capacity)),
            ttl,
            on_evict: Arc::new(on_evict),
        }
    }

    fn is_expired(&self, entry: &Entry<V>, now: Instant) -> bool {
        now.duration_since(entry.inserted_at) >= self.ttl
    }

    fn fire(&self, evicted: Vec<(K, V, EvictReason)>) {
        for (k, v, reason) in evicted {
            (self.on_evict)(&k, &v, reason);
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            match entries.peek(key) {
                None => return None,
                Some(entry) if !self.is_expired(entry, now) => return Some(entry.value.clone()),
                Some(_) => {}
            }
        }
        let evicted = {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            let expired = entries.peek(key).map(|entry| self.is_expired(entry, now));
            match expired {
                Some(true) => entries
                    .pop(key)
                    .map(|entry| vec![(key.clone(), entry.value, EvictReason::Expired)])
                    .unwrap_or_default(),
                _ => Vec::new(),
            }
        };
        self.fire(evicted);
        None
    }

    pub fn insert(&self, key: K, value: V) {
        let evicted = {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            self.push_locked(&mut entries, key, value)
        };
        self.fire(evicted);
    }

    fn push_locked(&self, entries: &mut LruCache<K, Entry<V>>, key: K, value: V) -> Vec<(K, V, EvictReason)> {
        let entry = Entry {
            value,
            inserted_at: Instant::now(),
        };
        match entries.push(key.clone(), entry) {
            Some((old_key, old)) if old_key == key => vec![(old_key, old.value, EvictReason::Replaced)],
            Some((old_key, old)) => vec![(old_key, old.value, EvictReason::Capacity)],
            None => Vec::new(),
        }
    }

    /// Cached value, or build one under the write lock so concurrent misses
    /// for the same key construct a single client.
    pub fn get_or_try_insert_with<E, F>(&self, key: &K, build: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        if let Some(v) = self.get(key) {
            return Ok(v);
        }
        let now = Instant::now();
        let (value, evicted) = {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            let mut evicted = Vec::new();
            let fresh = entries
                .peek(key)
                .map(|entry| (!self.is_expired(entry, now)).then(|| entry.value.clone()));
            match fresh {
                Some(Some(value)) => return Ok(value),
                Some(None) => {
                    if let Some(old) = entries.pop(key) {
                        evicted.push((key.clone(), old.value, EvictReason::Expired));
                    }
                }
                None => {}
            }
            let value = match build() {
                Ok(v) => v,
                Err(e) => {
                    drop(entries);
                    self.fire(evicted);
                    return Err(e);
                }
            };
            evicted.extend(self.push_locked(&mut entries, key.clone(), value.clone()));
            (value, evicted)
        };
        self.fire(evicted);
        Ok(value)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let removed = {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            entries.pop(key)
        };
        removed.map(|entry| {
            (self.on_evict)(key, &entry.value, EvictReason::Removed);
            entry.value
        })
    }

    /// Drop every expired entry, returning how many were evicted.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let evicted = {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            let expired: Vec<K> = entries
                .iter()
                .filter(|(_, entry)| self.is_expired(entry, now))
                .map(|(k, _)| k.clone())
                .collect();
            expired
                .into_iter()
                .filter_map(|k| entries.pop(&k).map(|entry| (k, entry.value, EvictReason::Expired)))
                .collect::<Vec<_>>()
        };
        let count = evicted.len();
        self.fire(evicted);
        count
    }

    pub fn clear(&self) {
        let evicted = {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            let mut drained = Vec::with_capacity(entries.len());
            while let Some((k, entry)) = entries.pop_lru() {
                drained.push((k, entry.value, EvictReason::Cleared));
            }
            drained
        };
        self.fire(evicted);
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
