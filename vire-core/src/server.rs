//! Immutable, shared server context: the keyspace, the loaded
//! configuration, and process-wide stats. One `Arc<Server>` is handed to
//! every worker and to the acceptor thread (spec.md §6).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::Config;
use crate::db::Keyspace;
use crate::persist::PersistenceEngine;
use crate::stats::Stats;

pub struct Server {
    pub config: Config,
    pub keyspace: Keyspace,
    pub stats: Stats,
    pub persistence: PersistenceEngine,
    pub start_time_secs: u32,
    /// Mutations since the last completed save, tracked separately from
    /// each shard's own `dirty` counter: this one exists to drive a future
    /// save-points cron decision ("save if N changes in M seconds"), not
    /// the incremental dump's own bookkeeping.
    pub dirty_since_save: AtomicU64,
}

impl Server {
    pub fn new(config: Config) -> Self {
        let keyspace = Keyspace::new(config.databases, config.internal_shards);
        let persistence = PersistenceEngine::new(&config);
        let now = now_secs();
        Self {
            config,
            keyspace,
            stats: Stats::new(),
            persistence,
            start_time_secs: now,
            dirty_since_save: AtomicU64::new(0),
        }
    }

    pub fn uptime_secs(&self) -> u32 {
        now_secs().saturating_sub(self.start_time_secs)
    }

    pub fn mark_saved(&self) {
        self.dirty_since_save.store(0, Ordering::Relaxed);
    }
}

fn now_secs() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as u32
}
