//! Persistence: the on-disk filename grammar, the RDB-shaped snapshot
//! codec, the append-log writer, and the engine that drives both from the
//! worker/backend cron (spec.md §4.5).

pub mod aof;
pub mod engine;
pub mod filename;
pub mod rdb;

pub use engine::PersistenceEngine;
pub use filename::{Descriptor, FileKind};

use crate::error::PersistError;

/// Surfaces the result of a persistence-engine write. Most failures are
/// logged and otherwise swallowed — a dump or log write that falls behind
/// shouldn't take the server down — but `PersistError::FatalFsync` is the
/// `appendfsync always` policy's documented exception (spec.md §4.5/§7):
/// the caller asked for every write durably fsynced before it's
/// acknowledged, so an fsync failure under that policy means durability
/// can no longer be guaranteed and the process exits rather than silently
/// continuing to serve writes it can't make good on.
pub fn handle_result(result: Result<(), PersistError>) {
    if let Err(e) = result {
        log::error!("persistence: {e}");
        if matches!(e, PersistError::FatalFsync(_)) {
            std::process::exit(1);
        }
    }
}
