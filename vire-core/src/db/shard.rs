//! One internal shard: a dict, its expires table, blocking/watch
//! bookkeeping, an eviction sample pool, and the persistence write barrier.
//!
//! A `Keyspace` (db/keyspace.rs) owns `L * I` of these behind one `RwLock`
//! each, exactly as spec.md §4.4 describes: "each shard is independently
//! lockable so operations on unrelated keys never contend." The
//! closure-based `read`/`write` entry points are modeled on
//! `examples/lithair-lithair/lithair-core/src/engine/scc2_engine.rs`'s
//! `Scc2Engine::read<R, F>(&self, key, f) -> Option<R>` /
//! `update_entry_volatile` pair: callers never see the lock guard directly,
//! which keeps the expiry check and the write barrier from being
//! accidentally bypassed by a handler that forgets to call them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::RwLock;

use crate::db::dict::Dict;
use crate::db::eviction::{EvictionPolicy, EvictionPool};
use crate::db::expire::{now_ms, ExpireStats};
use crate::object::Object;

/// Identifies a connected client across the worker that owns it. Assigned
/// once at accept time and never reused while the process runs.
pub type ClientId = u64;

/// A key's pre-mutation snapshot, captured by `ShardData::barrier` before a
/// write touches an object the in-progress dump pass hasn't serialized yet.
/// `encoded` holds the full RDB record (type byte + key + value, see
/// `persist::rdb::encode_record`) so the dump driver only has to append
/// bytes, never re-enter the live dict.
#[derive(Debug, Clone)]
pub struct PreImage {
    pub key: Vec<u8>,
    pub encoded: Vec<u8>,
    pub expire_at: Option<i64>,
}

/// A big key (spec.md §4.5, `Value::is_big`) caught mid-dump: its header
/// (type byte, key, element count) is already in `DumpCursor::buf`, and
/// `remaining` holds the rest of its elements pre-encoded, one chunk per
/// `Vec<u8>`, to be drained at up to [`crate::persist::engine::BIG_KEY_CHUNK`]
/// per tick.
#[derive(Debug, Default)]
pub struct BigKeyCursor {
    pub remaining: VecDeque<Vec<u8>>,
}

/// Chunked-dump resume state for the persistence engine's write barrier
/// (spec.md §4.5). `pending_preimages` accumulates pre-mutation snapshots the
/// in-progress dump hasn't passed yet; the persistence module drains this
/// queue once per tick.
#[derive(Debug, Default)]
pub struct DumpCursor {
    pub dumping: bool,
    pub first_step: bool,
    /// The main dict iterator's resume cursor (`Dict::scan`'s bucket
    /// cursor).
    pub dict_cursor: u64,
    pub pending_preimages: Vec<PreImage>,
    /// Set while a big key's element list is being drained across more than
    /// one tick. The outer scan doesn't advance past this key's bucket until
    /// it's `None` again.
    pub big_key: Option<BigKeyCursor>,
    /// Accumulated RDB bytes for the snapshot pass currently in progress;
    /// flushed to the `rdbtmp_*` file and renamed once the pass finishes.
    pub buf: Vec<u8>,
    /// `dirty` counter value at snapshot start, subtracted back off once the
    /// pass finishes (spec.md §4.5's "Finish").
    pub dirty_at_start: u64,
}

/// The mutable state behind one shard's `RwLock`. Fields are `pub(crate)` so
/// command handlers, given a lock guard by `Shard::write`/`Shard::lock_write`,
/// can manipulate more than one sub-structure (e.g. `BLPOP` touching both
/// `dict` and `ready_keys`) without a method for every combination.
pub struct ShardData {
    pub dict: Dict<Vec<u8>, Object>,
    pub expires: Dict<Vec<u8>, i64>,
    /// Keys with at least one client parked in `BLPOP`/`BRPOP`, each queued
    /// in arrival order (first-blocked-first-served, spec.md §4.6).
    pub blocking_keys: HashMap<Vec<u8>, VecDeque<ClientId>>,
    /// Keys that gained an element this tick and may unblock a waiter;
    /// drained by the worker's blocking-client pass (spec.md §4.7).
    pub ready_keys: Vec<Vec<u8>>,
    /// `WATCH`ed keys, used by `EXEC` to decide whether to abort
    /// optimistically-queued transactions.
    pub watched_keys: HashMap<Vec<u8>, HashSet<ClientId>>,
    pub eviction_pool: EvictionPool,
    pub expire_stats: ExpireStats,
    /// Bumped on every successful mutation; also the snapshot fence an
    /// `Object`'s own `version` is compared against by the write barrier.
    pub version: u64,
    /// Writes since the last completed (or currently in-flight) snapshot.
    pub dirty: u64,
    pub dump: DumpCursor,
}

impl ShardData {
    fn new() -> Self {
        Self {
            dict: Dict::new(),
            expires: Dict::new(),
            blocking_keys: HashMap::new(),
            ready_keys: Vec::new(),
            watched_keys: HashMap::new(),
            eviction_pool: EvictionPool::new(),
            expire_stats: ExpireStats::default(),
            version: 0,
            dirty: 0,
            dump: DumpCursor::default(),
        }
    }

    /// Removes an expired key outright (called with the write lock held).
    /// Returns `true` if the key was present and expired.
    pub fn expire_if_due(&mut self, key: &[u8], now: i64) -> bool {
        let due = matches!(self.expires.get_no_step(key), Some(&exp) if exp <= now);
        if due {
            self.dict.remove(key);
            self.expires.remove(key);
            self.eviction_pool.remove(key);
            self.version += 1;
        }
        due
    }

    /// Write barrier (spec.md §4.5): if a dump is in progress and `key`'s
    /// object hasn't been touched since the dump started (`obj.version` is
    /// still behind the shard's), its current value is encoded and queued
    /// before the caller's closure is allowed to mutate it. Called by
    /// `Shard::write` for every single-key mutation; call sites that bypass
    /// `Shard::write` to hold two shard locks at once (`RENAME`) call this
    /// directly on each shard they touch.
    pub fn barrier(&mut self, key: &[u8]) {
        if !self.dump.dumping {
            return;
        }
        let version = self.version;
        let expire_at = self.expires.get_no_step(key).copied();
        if let Some(obj) = self.dict.get_mut(key) {
            if obj.version < version {
                let encoded = crate::persist::rdb::encode_record(key, obj);
                self.dump.pending_preimages.push(PreImage { key: key.to_vec(), encoded, expire_at });
                obj.version = version;
            }
        }
    }

    /// Starts a new snapshot pass (spec.md §4.5 "Snapshot start"): bumps
    /// `version` so every existing Object is now stale relative to it, and
    /// arms `DUMPING`/`DUMP_FIRST_STEP` for the next cron tick to act on. A
    /// no-op if a dump is already in progress.
    pub fn begin_dump(&mut self) -> bool {
        if self.dump.dumping {
            return false;
        }
        self.version += 1;
        self.dump.dumping = true;
        self.dump.first_step = true;
        self.dump.dict_cursor = 0;
        self.dump.pending_preimages.clear();
        self.dump.big_key = None;
        self.dump.buf.clear();
        true
    }

    /// Marks a key ready so a parked `BLPOP`/`BRPOP` client can be resumed
    /// on the next worker tick.
    pub fn notify_ready(&mut self, key: &[u8]) {
        if self.blocking_keys.contains_key(key) {
            self.ready_keys.push(key.to_vec());
        }
    }

    /// Touches the version and dirty counters after a successful mutation.
    pub fn mark_dirty(&mut self) {
        self.version += 1;
        self.dirty += 1;
    }

    /// Discards all keys, used by `FLUSHDB`/`FLUSHALL`. Keeps no bookkeeping
    /// from before the flush: a fresh dump pass starts from version 0.
    pub fn reset(&mut self) {
        *self = ShardData::new();
    }
}

/// One independently-lockable shard of the keyspace.
pub struct Shard {
    pub id: usize,
    inner: RwLock<ShardData>,
}

impl Shard {
    pub fn new(id: usize) -> Self {
        Self { id, inner: RwLock::new(ShardData::new()) }
    }

    /// Read-only access to a single key. Performs the expiry check first
    /// (upgrading to the write lock only if the key has actually expired),
    /// then hands the caller's closure a reference to the live object.
    pub fn read<R>(&self, key: &[u8], f: impl FnOnce(&Object) -> R) -> Option<R> {
        self.expire_if_due(key);
        let guard = self.inner.read().unwrap();
        guard.dict.get_no_step(key).map(f)
    }

    /// Full write access: locks the shard exclusively, expires `key` first
    /// if due, then hands the caller's closure the whole `ShardData` so it
    /// can read/insert/remove and touch ancillary structures (`expires`,
    /// `blocking_keys`, watch notifications) as the command requires.
    pub fn write<R>(&self, key: &[u8], f: impl FnOnce(&mut ShardData) -> R) -> R {
        let mut guard = self.inner.write().unwrap();
        guard.expire_if_due(key, now_ms());
        guard.barrier(key);
        f(&mut guard)
    }

    /// Raw read lock, for commands that must inspect many keys at once
    /// (`KEYS`, `SCAN`, multi-key set algebra) where the single-key
    /// expiry-then-closure convenience doesn't fit.
    pub fn lock_read(&self) -> std::sync::RwLockReadGuard<'_, ShardData> {
        self.inner.read().unwrap()
    }

    /// Raw write lock, for the same multi-key commands and for the worker
    /// cron's rehash/expire/eviction passes.
    pub fn lock_write(&self) -> std::sync::RwLockWriteGuard<'_, ShardData> {
        self.inner.write().unwrap()
    }

    fn expire_if_due(&self, key: &[u8]) -> bool {
        let now = now_ms();
        let due = {
            let guard = self.inner.read().unwrap();
            matches!(guard.expires.get_no_step(key), Some(&exp) if exp <= now)
        };
        if due {
            let mut guard = self.inner.write().unwrap();
            return guard.expire_if_due(key, now);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Value;

    #[test]
    fn read_after_write_sees_value() {
        let shard = Shard::new(0);
        shard.write(b"k", |d| {
            d.dict.insert(b"k".to_vec(), Object::new(Value::Str(b"v".to_vec())));
            d.mark_dirty();
        });
        let seen = shard.read(b"k", |o| matches!(&o.value, Value::Str(s) if s == b"v"));
        assert_eq!(seen, Some(true));
    }

    #[test]
    fn expired_key_disappears_on_read() {
        let shard = Shard::new(0);
        shard.write(b"k", |d| {
            d.dict.insert(b"k".to_vec(), Object::new(Value::Str(b"v".to_vec())));
            d.expires.insert(b"k".to_vec(), now_ms() - 1);
        });
        assert!(shard.read(b"k", |_| ()).is_none());
    }
}
