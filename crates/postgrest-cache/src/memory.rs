use crate::backend::{KvStore, StoreResult};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Number of shards. Must be a power of two for fast modulo via bitmask.
const NUM_SHARDS: usize = 64;
const SHARD_MASK: u64 = (NUM_SHARDS as u64) - 1;

struct Entry {
    value: Bytes,
    expires_at: Instant,
    /// Matches the queue slot that owns this entry; stale slots are skipped.
    generation: u64,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// One shard: entries plus their insertion order for FIFO eviction.
struct Shard {
    map: HashMap<String, Entry>,
    order: VecDeque<(String, u64)>,
    capacity: usize,
    next_generation: u64,
}

impl Shard {
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
            next_generation: 0,
        }
    }

    fn get(&mut self, key: &str, now: Instant) -> Option<Bytes> {
        let entry = self.map.get(key)?;
        if entry.is_expired(now) {
            // Lazy expiration; the queue slot goes stale and is skipped later
            self.map.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    fn insert(&mut self, key: String, value: Bytes, expires_at: Instant) {
        self.map.remove(&key);

        while self.map.len() >= self.capacity {
            let Some((oldest, generation)) = self.order.pop_front() else {
                break;
            };
            if self.map.get(&oldest).is_some_and(|e| e.generation == generation) {
                self.map.remove(&oldest);
            }
        }

        let generation = self.next_generation;
        self.next_generation += 1;
        self.order.push_back((key.clone(), generation));
        self.map.insert(
            key,
            Entry {
                value,
                expires_at,
                generation,
            },
        );

        // Keep the queue from growing without bound under overwrite churn
        if self.order.len() > self.capacity * 2 {
            let map = &self.map;
            self.order
                .retain(|(k, g)| map.get(k).is_some_and(|e| e.generation == *g));
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        self.map.remove(key).is_some()
    }
}

/// In-process expiring store.
///
/// Keys are spread over 64 independently locked shards. Expiry is lazy and
/// uses the tokio clock, so a paused runtime can fast-forward it. When a
/// shard is full the oldest insertion is dropped.
pub struct MemoryStore {
    shards: Box<[Mutex<Shard>]>,
    hasher: ahash::RandomState,
}

impl MemoryStore {
    /// `capacity` is split evenly across shards (minimum one entry each).
    pub fn new(capacity: usize) -> Self {
        let per_shard = (capacity / NUM_SHARDS).max(1);
        let shards = (0..NUM_SHARDS)
            .map(|_| Mutex::new(Shard::new(per_shard)))
            .collect();
        Self {
            shards,
            hasher: ahash::RandomState::new(),
        }
    }

    #[inline]
    fn shard(&self, key: &str) -> &Mutex<Shard> {
        let hash = self.hasher.hash_one(key);
        &self.shards[(hash & SHARD_MASK) as usize]
    }

    /// Live entries across all shards, expired ones included until touched.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().map.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shards.iter().map(|s| s.lock().capacity).sum()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>> {
        Ok(self.shard(key).lock().get(key, Instant::now()))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> StoreResult<()> {
        let expires_at = Instant::now() + ttl;
        self.shard(key)
            .lock()
            .insert(key.to_owned(), value, expires_at);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        Ok(self.shard(key).lock().remove(key))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
