//! Approximate-LRU / TTL / random eviction sampling (spec.md §4.4's
//! maxmemory policies). Each shard keeps a small pool of the worst
//! candidates seen so far, refreshed by sampling a handful of live keys per
//! call — the same amortized approach Redis uses instead of sorting the
//! whole keyspace by recency on every eviction.

use crate::db::dict::Dict;
use crate::object::{now_secs, Object};
use rand::seq::IteratorRandom;

pub const EVICTION_POOL_SIZE: usize = 16;
pub const EVICTION_SAMPLE_SIZE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    NoEviction,
    AllKeysLru,
    VolatileLru,
    AllKeysRandom,
    VolatileRandom,
    VolatileTtl,
}

impl EvictionPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "noeviction" => EvictionPolicy::NoEviction,
            "allkeys-lru" => EvictionPolicy::AllKeysLru,
            "volatile-lru" => EvictionPolicy::VolatileLru,
            "allkeys-random" => EvictionPolicy::AllKeysRandom,
            "volatile-random" => EvictionPolicy::VolatileRandom,
            "volatile-ttl" => EvictionPolicy::VolatileTtl,
            _ => return None,
        })
    }

    pub fn needs_volatile_only(&self) -> bool {
        matches!(
            self,
            EvictionPolicy::VolatileLru | EvictionPolicy::VolatileRandom | EvictionPolicy::VolatileTtl
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionPolicy::NoEviction => "noeviction",
            EvictionPolicy::AllKeysLru => "allkeys-lru",
            EvictionPolicy::VolatileLru => "volatile-lru",
            EvictionPolicy::AllKeysRandom => "allkeys-random",
            EvictionPolicy::VolatileRandom => "volatile-random",
            EvictionPolicy::VolatileTtl => "volatile-ttl",
        }
    }
}

#[derive(Debug, Clone)]
struct PoolEntry {
    key: Vec<u8>,
    /// Higher sorts first for eviction: idle seconds for `*-lru`, negated
    /// remaining TTL for `volatile-ttl`, a random draw for `*-random`.
    rank: i64,
}

#[derive(Debug, Default)]
pub struct EvictionPool {
    entries: Vec<PoolEntry>,
}

impl EvictionPool {
    pub fn new() -> Self {
        Self { entries: Vec::with_capacity(EVICTION_POOL_SIZE) }
    }

    fn insert_candidate(&mut self, key: Vec<u8>, rank: i64) {
        if let Some(pos) = self.entries.iter().position(|e| e.key == key) {
            self.entries[pos].rank = rank;
            return;
        }
        self.entries.push(PoolEntry { key, rank });
        self.entries.sort_by_key(|e| std::cmp::Reverse(e.rank));
        self.entries.truncate(EVICTION_POOL_SIZE);
    }

    /// Sample a handful of keys, rank them by the active policy, fold the
    /// worst candidates into the pool, and return the current worst key.
    pub fn refresh_and_pick(
        &mut self,
        policy: EvictionPolicy,
        dict: &Dict<Vec<u8>, Object>,
        expires: &Dict<Vec<u8>, i64>,
    ) -> Option<Vec<u8>> {
        if policy == EvictionPolicy::NoEviction {
            return None;
        }
        let now = now_secs() as i64;
        let mut rng = rand::thread_rng();
        let sampled: Vec<Vec<u8>> = if policy.needs_volatile_only() {
            expires.iter().map(|(k, _)| k.clone()).choose_multiple(&mut rng, EVICTION_SAMPLE_SIZE)
        } else {
            dict.iter().map(|(k, _)| k.clone()).choose_multiple(&mut rng, EVICTION_SAMPLE_SIZE)
        };
        for key in sampled {
            let rank = match policy {
                EvictionPolicy::AllKeysLru | EvictionPolicy::VolatileLru => dict
                    .get_no_step(key.as_slice())
                    .map(|o| now - o.access_time_secs as i64)
                    .unwrap_or(0),
                EvictionPolicy::VolatileTtl => {
                    -expires.get_no_step(key.as_slice()).copied().unwrap_or(i64::MAX)
                }
                EvictionPolicy::AllKeysRandom | EvictionPolicy::VolatileRandom => {
                    rand::random::<i32>() as i64
                }
                EvictionPolicy::NoEviction => unreachable!(),
            };
            self.insert_candidate(key, rank);
        }
        self.entries.first().map(|e| e.key.clone())
    }

    pub fn remove(&mut self, key: &[u8]) {
        self.entries.retain(|e| e.key != key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_caps_at_fixed_size() {
        let mut pool = EvictionPool::new();
        for i in 0..(EVICTION_POOL_SIZE * 4) {
            pool.insert_candidate(format!("k{i}").into_bytes(), i as i64);
        }
        assert_eq!(pool.entries.len(), EVICTION_POOL_SIZE);
        // highest ranks (most recently inserted) should have survived.
        assert!(pool.entries.iter().all(|e| e.rank >= (EVICTION_POOL_SIZE * 3) as i64));
    }
}
