//! A separate-chaining hash table with incremental rehashing.
//!
//! Backs a shard's `dict`, `expires`, and `watched_keys` maps. Built by hand
//! (rather than wrapping `std::collections::HashMap`) because the spec's
//! rehashing invariant — "every access migrates one bucket; additionally
//! the worker cron spends up to 1ms per shard per tick migrating buckets"
//! (spec.md §4.4) — requires visibility into individual buckets that a
//! stdlib map doesn't expose. The design note on "Incremental rehashing
//! mid-iteration" asks for a "safe iterator" mode that forbids resize for
//! its lifetime: here that invariant is enforced for free by the borrow
//! checker, since `iter()`/`scan()` borrow `&self` and every resizing
//! operation requires `&mut self`.

use std::borrow::Borrow;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

const INITIAL_BUCKETS: usize = 4;
/// Migrate at most this many non-empty buckets per incremental rehash step
/// called from a single access (spec.md §4.4: "every access migrates one
/// bucket").
const STEP_BUCKETS_PER_ACCESS: usize = 1;

struct Table<K, V> {
    buckets: Vec<Vec<(K, V)>>,
}

impl<K, V> Table<K, V> {
    fn new(num_buckets: usize) -> Self {
        let mut buckets = Vec::with_capacity(num_buckets);
        buckets.resize_with(num_buckets, Vec::new);
        Self { buckets }
    }

    fn mask(&self) -> usize {
        self.buckets.len() - 1
    }
}

fn next_pow2(mut n: usize) -> usize {
    if n < INITIAL_BUCKETS {
        return INITIAL_BUCKETS;
    }
    n -= 1;
    let mut p = 1usize;
    while p <= n {
        p <<= 1;
    }
    p
}

fn hash_of<Q: Hash + ?Sized>(k: &Q) -> u64 {
    let mut h = DefaultHasher::new();
    k.hash(&mut h);
    h.finish()
}

/// An incrementally-rehashing hash table.
pub struct Dict<K, V> {
    tables: [Table<K, V>; 2],
    /// -1 when not rehashing; otherwise the index of the next bucket in
    /// `tables[0]` to migrate into `tables[1]`.
    rehash_idx: i64,
    len: usize,
}

impl<K: Hash + Eq + Clone, V> Default for Dict<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq + Clone, V> Dict<K, V> {
    pub fn new() -> Self {
        Self { tables: [Table::new(INITIAL_BUCKETS), Table::new(0)], rehash_idx: -1, len: 0 }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_rehashing(&self) -> bool {
        self.rehash_idx >= 0
    }

    pub fn capacity_buckets(&self) -> usize {
        self.tables[0].buckets.len()
            + if self.is_rehashing() { self.tables[1].buckets.len() } else { 0 }
    }

    /// Migrate up to one bucket of rehash work; called on every dict access
    /// per spec.md §4.4.
    fn rehash_step_on_access(&mut self) {
        if self.is_rehashing() {
            self.rehash_steps(STEP_BUCKETS_PER_ACCESS);
        }
    }

    /// Migrate up to `n` non-empty buckets from the old table into the new
    /// one. Called from the worker cron with a larger budget (spec.md §4.4:
    /// "up to 1ms per shard per tick"). Returns `true` if rehashing is still
    /// in progress afterwards.
    pub fn rehash_steps(&mut self, n: usize) -> bool {
        if !self.is_rehashing() {
            return false;
        }
        let mut migrated = 0;
        while migrated < n {
            if self.rehash_idx as usize >= self.tables[0].buckets.len() {
                self.finish_rehash();
                return false;
            }
            let bucket = std::mem::take(&mut self.tables[0].buckets[self.rehash_idx as usize]);
            self.rehash_idx += 1;
            if bucket.is_empty() {
                continue;
            }
            let mask1 = self.tables[1].mask();
            for (k, v) in bucket {
                let idx = (hash_of(&k) as usize) & mask1;
                self.tables[1].buckets[idx].push((k, v));
            }
            migrated += 1;
        }
        true
    }

    fn finish_rehash(&mut self) {
        let new_main = std::mem::replace(&mut self.tables[1], Table::new(0));
        self.tables[0] = new_main;
        self.rehash_idx = -1;
    }

    fn start_rehash(&mut self, new_size: usize) {
        debug_assert!(!self.is_rehashing());
        self.tables[1] = Table::new(next_pow2(new_size));
        self.rehash_idx = 0;
    }

    /// Grow when the load factor exceeds 1; shrink when the fill factor
    /// drops below 10% (spec.md §4.4: "Resizing down is triggered when the
    /// fill factor falls below 10%").
    fn maybe_resize(&mut self) {
        if self.is_rehashing() {
            return;
        }
        let buckets = self.tables[0].buckets.len();
        if buckets == 0 {
            self.start_rehash(INITIAL_BUCKETS.max(self.len));
            return;
        }
        let load = self.len as f64 / buckets as f64;
        if load > 1.0 {
            self.start_rehash(self.len * 2);
        } else if buckets > INITIAL_BUCKETS && load < 0.1 {
            self.start_rehash((self.len * 2).max(INITIAL_BUCKETS));
        }
    }

    fn find_pos<Q>(table: &Table<K, V>, key: &Q) -> Option<(usize, usize)>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if table.buckets.is_empty() {
            return None;
        }
        let idx = (hash_of(key) as usize) & table.mask();
        let pos = table.buckets[idx].iter().position(|(k, _)| k.borrow() == key)?;
        Some((idx, pos))
    }

    pub fn get<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.rehash_step_on_access();
        self.get_no_step(key)
    }

    /// Read-only lookup that does not advance rehashing (used by callers
    /// that only hold a shared borrow, e.g. during a safe iteration pass).
    pub fn get_no_step<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if self.is_rehashing() {
            if let Some((idx, pos)) = Self::find_pos(&self.tables[1], key) {
                return Some(&self.tables[1].buckets[idx][pos].1);
            }
        }
        let (idx, pos) = Self::find_pos(&self.tables[0], key)?;
        Some(&self.tables[0].buckets[idx][pos].1)
    }

    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.rehash_step_on_access();
        if self.is_rehashing() {
            if let Some((idx, pos)) = Self::find_pos(&self.tables[1], key) {
                return Some(&mut self.tables[1].buckets[idx][pos].1);
            }
        }
        let (idx, pos) = Self::find_pos(&self.tables[0], key)?;
        Some(&mut self.tables[0].buckets[idx][pos].1)
    }

    pub fn contains_key<Q>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get(key).is_some()
    }

    /// Insert, returning the previous value if the key already existed.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.rehash_step_on_access();
        if self.is_rehashing() {
            let idx = (hash_of(&key) as usize) & self.tables[1].mask();
            if let Some(pos) = self.tables[1].buckets[idx].iter().position(|(k, _)| *k == key) {
                return Some(std::mem::replace(&mut self.tables[1].buckets[idx][pos].1, value));
            }
            if !self.tables[0].buckets.is_empty() {
                let idx0 = (hash_of(&key) as usize) & self.tables[0].mask();
                if let Some(pos) =
                    self.tables[0].buckets[idx0].iter().position(|(k, _)| *k == key)
                {
                    let (_, old) = self.tables[0].buckets[idx0].remove(pos);
                    self.tables[1].buckets[idx].push((key, value));
                    return Some(old);
                }
            }
            self.tables[1].buckets[idx].push((key, value));
            self.len += 1;
            return None;
        }

        if self.tables[0].buckets.is_empty() {
            self.tables[0] = Table::new(INITIAL_BUCKETS);
        }
        let idx = (hash_of(&key) as usize) & self.tables[0].mask();
        if let Some(pos) = self.tables[0].buckets[idx].iter().position(|(k, _)| *k == key) {
            return Some(std::mem::replace(&mut self.tables[0].buckets[idx][pos].1, value));
        }
        self.tables[0].buckets[idx].push((key, value));
        self.len += 1;
        self.maybe_resize();
        None
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.rehash_step_on_access();
        if self.is_rehashing() {
            if let Some((idx, pos)) = Self::find_pos(&self.tables[1], key) {
                self.len -= 1;
                return Some(self.tables[1].buckets[idx].remove(pos).1);
            }
        }
        let (idx, pos) = Self::find_pos(&self.tables[0], key)?;
        self.len -= 1;
        let removed = self.tables[0].buckets[idx].remove(pos).1;
        self.maybe_resize();
        Some(removed)
    }

    /// Safe, non-mutating iteration over every live entry. Because this
    /// borrows `&self`, no resize or rehash step can interleave with it —
    /// enforced by the borrow checker rather than a runtime flag.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        let extra: Box<dyn Iterator<Item = (&K, &V)>> = if self.is_rehashing() {
            Box::new(self.tables[1].buckets.iter().flatten().map(|(k, v)| (k, v)))
        } else {
            Box::new(std::iter::empty())
        };
        self.tables[0].buckets.iter().flatten().map(|(k, v)| (k, v)).chain(extra)
    }

    /// Resumable cursor for `SCAN`: walks buckets of the currently-active
    /// table in index order. A structural resize invalidates an in-flight
    /// cursor's exhaustiveness guarantee (elements may be revisited or
    /// skipped across a resize) — an accepted simplification versus Redis's
    /// full reverse-binary-increment cursor, documented in DESIGN.md.
    pub fn scan(&self, cursor: u64, count: usize, mut visit: impl FnMut(&K, &V)) -> u64 {
        let table = if self.is_rehashing() { &self.tables[1] } else { &self.tables[0] };
        if table.buckets.is_empty() {
            return 0;
        }
        let mut idx = cursor as usize;
        let mut visited_buckets = 0;
        while idx < table.buckets.len() && visited_buckets < count.max(1) {
            for (k, v) in &table.buckets[idx] {
                visit(k, v);
            }
            idx += 1;
            visited_buckets += 1;
        }
        if idx >= table.buckets.len() {
            0
        } else {
            idx as u64
        }
    }

    /// Pick a uniformly random live entry, used by eviction / active
    /// expiration sampling (spec.md §4.4). Returns `None` on an empty dict.
    pub fn random_entry(&self) -> Option<(&K, &V)> {
        if self.len == 0 {
            return None;
        }
        let n = rand::random::<usize>() % self.len;
        self.iter().nth(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let mut d: Dict<Vec<u8>, i32> = Dict::new();
        d.insert(b"a".to_vec(), 1);
        d.insert(b"b".to_vec(), 2);
        assert_eq!(d.get(b"a".as_slice()), Some(&1));
        assert_eq!(d.len(), 2);
        assert_eq!(d.remove(b"a".as_slice()), Some(1));
        assert_eq!(d.get(b"a".as_slice()), None);
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn grows_and_rehashes_fully() {
        let mut d: Dict<i64, i64> = Dict::new();
        for i in 0..500 {
            d.insert(i, i * 2);
        }
        while d.is_rehashing() {
            d.rehash_steps(1000);
        }
        for i in 0..500 {
            assert_eq!(d.get(&i), Some(&(i * 2)));
        }
        assert_eq!(d.len(), 500);
    }

    #[test]
    fn scan_visits_every_key_eventually() {
        let mut d: Dict<i64, i64> = Dict::new();
        for i in 0..50 {
            d.insert(i, i);
        }
        while d.is_rehashing() {
            d.rehash_steps(1000);
        }
        let mut seen = std::collections::HashSet::new();
        let mut cursor = 0u64;
        loop {
            cursor = d.scan(cursor, 4, |k, _| {
                seen.insert(*k);
            });
            if cursor == 0 {
                break;
            }
        }
        assert_eq!(seen.len(), 50);
    }
}
