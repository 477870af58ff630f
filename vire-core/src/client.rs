//! Per-connection state: I/O buffers, the parsed command pending dispatch,
//! `MULTI`/`WATCH` bookkeeping, and the worker-jump continuation used by
//! cross-worker admin commands (spec.md §4.3).

use crate::db::ClientId;
use crate::resp::{RequestParser, ReplyWriter};
use crate::buf::ByteBuf;

/// Bits mirroring `original_source/src/vr_client.h`'s `CLIENT_*` flags,
/// trimmed to the ones this server actually tracks.
pub mod flags {
    pub const NONE: u32 = 0;
    pub const MULTI: u32 = 1 << 0;
    pub const DIRTY_CAS: u32 = 1 << 1;
    pub const CLOSE_AFTER_REPLY: u32 = 1 << 2;
    pub const CLOSE_ASAP: u32 = 1 << 3;
    pub const MONITOR: u32 = 1 << 4;
    /// `CLIENT_DIRTY_EXEC`: set when a command failed to queue (unknown
    /// command or wrong arity) while inside `MULTI`. `EXEC` checks this
    /// separately from `DIRTY_CAS` so it can reply `-EXECABORT` instead of
    /// the nil array a failed `WATCH` gets.
    pub const DIRTY_EXEC: u32 = 1 << 5;
}

/// A command queued by `MULTI`, replayed verbatim by `EXEC`.
pub type QueuedCommand = Vec<Vec<u8>>;

/// One key a client is watching. `EXEC` aborts the transaction if the
/// owning shard's `version` counter has moved since `version_at_watch` was
/// recorded. This is shard-wide rather than per-key precision (several keys
/// share a shard and its single version counter), a deliberate
/// simplification over real Redis's per-key touch tracking: it can abort a
/// transaction unnecessarily when an unrelated key in the same shard
/// changes, but never misses a genuine conflict. `ShardData::watched_keys`
/// still records per-key interest, for use by a future invalidation path.
#[derive(Debug, Clone)]
pub struct WatchedKey {
    pub db: usize,
    pub key: Vec<u8>,
    pub version_at_watch: u64,
}

/// State carried by a multi-step, cross-worker admin command (`CLIENT
/// LIST`, `CLIENT KILL`) while it "jumps" from worker to worker collecting
/// or acting on each one's client table (spec.md §4.3). Bounded by
/// `steps_remaining` so a jump can never cycle more times than there are
/// workers.
#[derive(Debug, Clone)]
pub struct Continuation {
    pub steps_remaining: usize,
    pub origin_worker: usize,
    pub kind: ContinuationKind,
}

#[derive(Debug, Clone)]
pub enum ContinuationKind {
    ClientList { collected: Vec<String> },
    ClientKill { target_id: ClientId, killed: bool },
}

/// A client parked on `BLPOP`/`BRPOP` with no data available yet. The
/// worker registers `id` against each of `keys` in the owning shards'
/// `ShardData::blocking_keys`, and re-runs the pop (in `front` order) once
/// `notify_ready` wakes it or `deadline_ms` passes (`None` deadline means
/// block forever, per a `BLPOP`/`BRPOP` timeout of `0`).
#[derive(Debug, Clone)]
pub struct BlockedState {
    pub keys: Vec<Vec<u8>>,
    pub front: bool,
    pub deadline_ms: Option<i64>,
}

/// One connected client, owned exclusively by the worker that accepted it.
pub struct Client {
    pub id: ClientId,
    pub worker_id: usize,
    pub addr: std::net::SocketAddr,
    pub db_index: usize,
    pub name: Vec<u8>,
    pub authenticated: bool,
    pub flags: u32,
    pub created_at_secs: u32,
    pub last_interaction_secs: u32,

    pub input: ByteBuf,
    pub parser: RequestParser,
    pub output: ReplyWriter,

    /// Arguments of the command currently being dispatched.
    pub argv: Vec<Vec<u8>>,

    pub multi_queue: Vec<QueuedCommand>,
    pub watches: Vec<WatchedKey>,

    pub continuation: Option<Continuation>,

    /// Set while this client is parked on a blocking pop with nothing to
    /// return yet. The worker skips reading further input from this client
    /// (it already has the full `BLPOP`/`BRPOP` request) until it is woken.
    pub blocked: Option<BlockedState>,

    pub should_close: bool,
}

impl Client {
    pub fn new(id: ClientId, worker_id: usize, addr: std::net::SocketAddr, requires_auth: bool) -> Self {
        let now = crate::object::now_secs();
        Self {
            id,
            worker_id,
            addr,
            db_index: 0,
            name: Vec::new(),
            authenticated: !requires_auth,
            flags: flags::NONE,
            created_at_secs: now,
            last_interaction_secs: now,
            input: ByteBuf::new(),
            parser: RequestParser::new(),
            output: ReplyWriter::new(),
            argv: Vec::new(),
            multi_queue: Vec::new(),
            watches: Vec::new(),
            continuation: None,
            blocked: None,
            should_close: false,
        }
    }

    pub fn in_multi(&self) -> bool {
        self.flags & flags::MULTI != 0
    }

    pub fn set_in_multi(&mut self, on: bool) {
        if on {
            self.flags |= flags::MULTI;
        } else {
            self.flags &= !flags::MULTI;
        }
    }

    pub fn dirty_cas(&self) -> bool {
        self.flags & flags::DIRTY_CAS != 0
    }

    pub fn set_dirty_cas(&mut self) {
        self.flags |= flags::DIRTY_CAS;
    }

    pub fn dirty_exec(&self) -> bool {
        self.flags & flags::DIRTY_EXEC != 0
    }

    pub fn set_dirty_exec(&mut self) {
        self.flags |= flags::DIRTY_EXEC;
    }

    pub fn clear_transaction_state(&mut self) {
        self.set_in_multi(false);
        self.flags &= !(flags::DIRTY_CAS | flags::DIRTY_EXEC);
        self.multi_queue.clear();
        self.watches.clear();
    }

    pub fn touch(&mut self) {
        self.last_interaction_secs = crate::object::now_secs();
    }

    /// One `CLIENT LIST` line for this client.
    pub fn describe(&self) -> String {
        format!(
            "id={} addr={} name={} db={} age={} worker={}",
            self.id,
            self.addr,
            String::from_utf8_lossy(&self.name),
            self.db_index,
            self.created_at_secs,
            self.worker_id,
        )
    }
}
