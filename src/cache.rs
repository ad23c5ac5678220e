use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::warn;
use lru::LruCache;

use crate::metrics;
use crate::parser::parse_value;
use crate::types::{encode_value, Value};

/// Local cache of upstream responses, keyed by the request key bytes as
/// they appear on the wire.
///
/// Entries hold the already-encoded response frame for a single key, so a
/// hit is a buffer copy rather than a re-serialization.  Total retained
/// bytes never exceed the configured cap; under pressure the least
/// recently used entries of the affected shard are dropped first, so any
/// entry may vanish at any time.  Coherence is the invalidator's job: the
/// cache itself only enforces the TTL ceiling.
pub struct Cache {
    shards: Vec<Mutex<Shard>>,
    shard_max_bytes: usize,
    ttl: Duration,
}

struct Shard {
    entries: LruCache<Vec<u8>, CacheEntry>,
    bytes: usize,
}

struct CacheEntry {
    payload: Vec<u8>,
    expires_at: Instant,
}

impl CacheEntry {
    fn cost(key: &[u8], payload: &[u8]) -> usize {
        key.len() + payload.len()
    }
}

impl Cache {
    const SHARD_COUNT: usize = 32;

    /// Creates a cache holding at most `max_bytes` of keys and payloads,
    /// with `ttl` as the lifetime ceiling of every entry.
    pub fn new(max_bytes: usize, ttl: Duration) -> Self {
        let mut shards = Vec::with_capacity(Self::SHARD_COUNT);
        for _ in 0..Self::SHARD_COUNT {
            shards.push(Mutex::new(Shard {
                entries: LruCache::unbounded(),
                bytes: 0,
            }));
        }
        Cache {
            shards,
            shard_max_bytes: (max_bytes / Self::SHARD_COUNT).max(1),
            ttl,
        }
    }

    /// get_shard returns the locked shard for a key, recovering the lock
    /// if it was poisoned.
    fn get_shard(&self, key: &[u8]) -> std::sync::MutexGuard<'_, Shard> {
        let mut s = DefaultHasher::new();
        s.write(key);
        let lock = &self.shards[s.finish() as usize % self.shards.len()];
        lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stores a response under the positional key list.
    ///
    /// Handles single values and arrays alike, because both `GET` and
    /// `MGET` responses are cacheable: arrays recurse element-wise, keys
    /// and elements zipped positionally.  Error replies are never stored.
    pub fn set(&self, keys: &[Vec<u8>], message: &Value) {
        if message.is_error() {
            return;
        }
        if let Value::Array(items) = message {
            for (key, item) in keys.iter().zip(items) {
                self.set(std::slice::from_ref(key), item);
            }
        } else if let Some(key) = keys.first() {
            self.set_single(key, message);
        }
    }

    fn set_single(&self, key: &[u8], message: &Value) {
        if message.is_error() {
            return;
        }
        let payload = encode_value(message);
        let cost = CacheEntry::cost(key, &payload);
        if cost > self.shard_max_bytes {
            warn!(
                "cache entry larger than shard budget, not stored (key bytes: {})",
                key.len()
            );
            return;
        }

        let mut shard = self.get_shard(key);
        if let Some(old) = shard.entries.put(
            key.to_vec(),
            CacheEntry {
                payload,
                expires_at: Instant::now() + self.ttl,
            },
        ) {
            shard.bytes -= CacheEntry::cost(key, &old.payload);
        }
        shard.bytes += cost;
        while shard.bytes > self.shard_max_bytes {
            match shard.entries.pop_lru() {
                Some((evicted_key, evicted)) => {
                    shard.bytes -= CacheEntry::cost(&evicted_key, &evicted.payload);
                }
                None => break,
            }
        }
    }

    /// Returns the decoded response for `key`, or `None` on a miss.
    /// Expired and undecodable entries surface as a miss.
    pub fn get(&self, key: &[u8]) -> Option<Value> {
        let mut shard = self.get_shard(key);
        let entry = match shard.entries.get(key) {
            Some(entry) => entry,
            None => {
                metrics::cache_miss();
                return None;
            }
        };
        if Instant::now() > entry.expires_at {
            Self::pop_entry(&mut shard, key);
            metrics::cache_miss();
            return None;
        }
        match parse_value(&entry.payload) {
            Ok(value) => {
                metrics::cache_hit();
                Some(value)
            }
            Err(err) => {
                warn!("dropping undecodable cache entry: {err}");
                Self::pop_entry(&mut shard, key);
                metrics::cache_miss();
                None
            }
        }
    }

    /// Returns decoded responses for every key, or `None` if any single
    /// key misses.  Multi-key reads are all-or-nothing.
    pub fn get_all(&self, keys: &[Vec<u8>]) -> Option<Vec<Value>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key)?);
        }
        Some(values)
    }

    /// Removes `key` if present.
    pub fn delete(&self, key: &[u8]) {
        let mut shard = self.get_shard(key);
        Self::pop_entry(&mut shard, key);
    }

    /// Removes every entry.
    pub fn clear(&self) {
        for lock in &self.shards {
            let mut shard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            shard.entries.clear();
            shard.bytes = 0;
        }
    }

    fn pop_entry(shard: &mut Shard, key: &[u8]) {
        if let Some(entry) = shard.entries.pop(key) {
            shard.bytes -= CacheEntry::cost(key, &entry.payload);
        }
    }
}
