//! Per-worker I/O reactor: one `mio::Poll` loop per OS thread, each owning
//! an exclusive slice of connected clients (spec.md §4.2).
//!
//! Modeled on `examples/other_examples/yijun-tang-rudis`'s event-loop shape
//! (`ae-handler.rs`/`handler.rs`: file events plus a periodic time event)
//! but built over `mio::Poll`/`Events` rather than raw `libc::poll`, per the
//! `mio` event-loop this project settled on. Each tick: drain the inbox,
//! service readable/writable sockets, then (at most once per
//! `cron_interval_ms`) run the background maintenance pass — active
//! expiration, incremental rehashing, snapshot ticking, and waking blocked
//! clients.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::Ordering;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::client::{Client, ContinuationKind};
use crate::command::{self, CommandCtx};
use crate::db::ClientId;
use crate::resp::ParseOutcome;
use crate::server::Server;

const WAKE_TOKEN: Token = Token(usize::MAX);
/// Incremental-rehash buckets migrated per shard per cron tick.
const CRON_REHASH_STEPS: usize = 100;

/// Work handed to a worker's inbox: either a fresh connection from the
/// acceptor thread, or a client "jumping" here from a sibling worker mid
/// `CLIENT LIST`/`CLIENT KILL` (spec.md §4.3).
pub enum Dispatch {
    NewConn { stream: TcpStream, id: ClientId, addr: std::net::SocketAddr },
    Jump { client: Box<Client>, stream: TcpStream },
}

/// What a worker (or the acceptor) needs to hand work to another worker:
/// its inbox and the waker that interrupts its `Poll::poll`.
#[derive(Clone)]
pub struct WorkerHandle {
    pub tx: std::sync::mpsc::Sender<Dispatch>,
    pub waker: Arc<Waker>,
}

struct Connection {
    client: Client,
    stream: TcpStream,
    /// Bytes already rendered but not yet written, left over from a write
    /// that hit `WouldBlock`. Non-empty only while `write_interest` is set.
    pending_out: Vec<u8>,
    write_interest: bool,
}

pub struct Worker {
    id: usize,
    server: Arc<Server>,
    poll: Poll,
    rx: Receiver<Dispatch>,
    peers: Vec<WorkerHandle>,
    conns: HashMap<Token, Connection>,
    next_token: usize,
    cron_interval: Duration,
    last_cron: Instant,
}

impl Worker {
    pub fn new(
        id: usize,
        server: Arc<Server>,
        poll: Poll,
        rx: Receiver<Dispatch>,
        peers: Vec<WorkerHandle>,
    ) -> Self {
        let cron_interval = Duration::from_millis(server.config.cron_interval_ms.max(1));
        Self {
            id,
            server,
            poll,
            rx,
            peers,
            conns: HashMap::new(),
            next_token: 0,
            cron_interval,
            last_cron: Instant::now(),
        }
    }

    fn alloc_token(&mut self) -> Token {
        let t = Token(self.next_token);
        self.next_token += 1;
        t
    }

    pub fn run(mut self) {
        let mut events = Events::with_capacity(256);
        loop {
            let until_cron = self.cron_interval.saturating_sub(self.last_cron.elapsed());
            if let Err(e) = self.poll.poll(&mut events, Some(until_cron)) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                log::error!("worker {}: poll failed: {e}", self.id);
                continue;
            }
            let tokens: Vec<(Token, bool, bool)> =
                events.iter().map(|e| (e.token(), e.is_readable(), e.is_writable())).collect();
            for (token, readable, writable) in tokens {
                if token == WAKE_TOKEN {
                    self.drain_inbox();
                    continue;
                }
                if writable {
                    self.flush_pending(token);
                }
                if readable {
                    self.service_readable(token);
                }
            }
            if self.last_cron.elapsed() >= self.cron_interval {
                self.run_cron();
                self.last_cron = Instant::now();
            }
        }
    }

    fn drain_inbox(&mut self) {
        while let Ok(msg) = self.rx.try_recv() {
            match msg {
                Dispatch::NewConn { mut stream, id, addr } => {
                    let token = self.alloc_token();
                    if self.poll.registry().register(&mut stream, token, Interest::READABLE).is_err() {
                        continue;
                    }
                    let requires_auth = self.server.config.requirepass.is_some();
                    let client = Client::new(id, self.id, addr, requires_auth);
                    self.server.stats.connections_received.fetch_add(1, Ordering::Relaxed);
                    self.conns.insert(token, Connection { client, stream, pending_out: Vec::new(), write_interest: false });
                }
                Dispatch::Jump { client, mut stream } => {
                    let token = self.alloc_token();
                    if self.poll.registry().register(&mut stream, token, Interest::READABLE).is_err() {
                        continue;
                    }
                    let mut client = *client;
                    client.worker_id = self.id;
                    self.conns.insert(token, Connection { client, stream, pending_out: Vec::new(), write_interest: false });
                    self.advance_continuation(token);
                }
            }
        }
    }

    fn service_readable(&mut self, token: Token) {
        loop {
            let Some(conn) = self.conns.get_mut(&token) else { return };
            let mut buf = [0u8; 16 * 1024];
            match conn.stream.read(&mut buf) {
                Ok(0) => {
                    self.drop_connection(token);
                    return;
                }
                Ok(n) => {
                    conn.client.input.extend_from_slice(&buf[..n]);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.drop_connection(token);
                    return;
                }
            }
        }
        if !self.drain_requests(token) {
            return;
        }
        self.flush_pending(token);
    }

    /// Feeds every complete request currently buffered through the command
    /// dispatcher. Returns `false` if the client was removed from `conns`
    /// while doing so (closed, killed, or jumped to another worker).
    fn drain_requests(&mut self, token: Token) -> bool {
        loop {
            let Some(conn) = self.conns.get_mut(&token) else { return false };
            if conn.client.blocked.is_some() {
                return true;
            }
            let outcome = conn.client.parser.feed(&mut conn.client.input);
            let argv = match outcome {
                Ok(ParseOutcome::Ready(argv)) => argv,
                Ok(ParseOutcome::NeedMore) => return true,
                Err(e) => {
                    conn.client.output.write_error(&format!("ERR Protocol error: {e}"));
                    conn.client.should_close = true;
                    break;
                }
            };
            conn.client.argv = argv;
            conn.client.touch();
            {
                let mut ctx = CommandCtx { server: &self.server, client: &mut conn.client, propagate_override: None };
                command::handle_command(&mut ctx);
            }
            if self.conns.get(&token).map(|c| c.client.continuation.is_some()).unwrap_or(false) {
                self.start_continuation(token);
                return false;
            }
            let conn = self.conns.get_mut(&token).unwrap();
            if conn.client.blocked.is_some() {
                return true;
            }
            if conn.client.should_close && conn.client.output.is_empty() {
                break;
            }
        }
        self.drop_connection(token);
        false
    }

    /// A `CLIENT LIST`/`CLIENT KILL` just started locally (on the same
    /// worker the client is already connected to): runs the same
    /// local-table step a jump-in does, then either finalizes here or hands
    /// off to the next worker.
    fn start_continuation(&mut self, token: Token) {
        self.advance_continuation(token);
    }

    /// Applies this worker's leg of a `CLIENT LIST`/`CLIENT KILL`
    /// continuation: folds in this worker's own client table, then either
    /// finalizes the reply (if every worker has now been visited) or hands
    /// the client off to the next one.
    fn advance_continuation(&mut self, token: Token) {
        let Some(Connection { client, .. }) = self.conns.get(&token) else { return };
        let mut cont = match &client.continuation {
            Some(c) => c.clone(),
            None => return,
        };
        match &mut cont.kind {
            ContinuationKind::ClientList { collected } => {
                for (t, c) in &self.conns {
                    if *t != token {
                        collected.push(c.client.describe());
                    }
                }
            }
            ContinuationKind::ClientKill { target_id, killed } => {
                for c in self.conns.values_mut() {
                    if c.client.id == *target_id {
                        c.client.should_close = true;
                        *killed = true;
                    }
                }
            }
        }
        cont.steps_remaining = cont.steps_remaining.saturating_sub(1);
        let num_workers = self.peers.len().max(1);
        if cont.steps_remaining == 0 || num_workers <= 1 {
            let conn = self.conns.get_mut(&token).unwrap();
            conn.client.continuation = None;
            finalize_continuation(&mut conn.client, cont.kind);
            self.flush_pending(token);
            return;
        }
        let Connection { mut client, mut stream, .. } = self.conns.remove(&token).unwrap();
        let _ = self.poll.registry().deregister(&mut stream);
        let next = (self.id + 1) % num_workers;
        client.continuation = Some(cont);
        client.worker_id = next;
        let peer = self.peers[next].clone();
        let _ = peer.tx.send(Dispatch::Jump { client: Box::new(client), stream });
        peer.waker.wake();
    }

    fn flush_pending(&mut self, token: Token) {
        let Some(conn) = self.conns.get_mut(&token) else { return };
        if conn.pending_out.is_empty() {
            let rendered = conn.client.output.take_contiguous();
            if rendered.is_empty() {
                if conn.client.should_close {
                    self.drop_connection(token);
                }
                return;
            }
            conn.pending_out = rendered;
        }
        let mut offset = 0;
        let close_after = conn.client.should_close;
        loop {
            if offset >= conn.pending_out.len() {
                conn.pending_out.clear();
                if conn.write_interest {
                    let _ = self.poll.registry().reregister(&mut conn.stream, token, Interest::READABLE);
                    conn.write_interest = false;
                }
                if close_after {
                    self.drop_connection(token);
                }
                return;
            }
            match conn.stream.write(&conn.pending_out[offset..]) {
                Ok(0) => {
                    self.drop_connection(token);
                    return;
                }
                Ok(n) => offset += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    conn.pending_out.drain(0..offset);
                    if !conn.write_interest {
                        let _ = self.poll.registry().reregister(&mut conn.stream, token, Interest::READABLE | Interest::WRITABLE);
                        conn.write_interest = true;
                    }
                    return;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.drop_connection(token);
                    return;
                }
            }
        }
    }

    fn drop_connection(&mut self, token: Token) {
        if let Some(mut conn) = self.conns.remove(&token) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            for watch in &conn.client.watches {
                let shard = self.server.keyspace.shard(watch.db, &watch.key);
                let mut guard = shard.lock_write();
                if let Some(set) = guard.watched_keys.get_mut(&watch.key) {
                    set.remove(&conn.client.id);
                    if set.is_empty() {
                        guard.watched_keys.remove(&watch.key);
                    }
                }
            }
        }
    }

    /// Background maintenance pass (spec.md §4.7): active expiration,
    /// incremental rehashing, and snapshot ticking for the shards this
    /// worker is responsible for (striped by shard index so every shard
    /// gets serviced by exactly one worker's cron), plus waking this
    /// worker's own blocked clients.
    fn run_cron(&mut self) {
        let num_workers = self.peers.len().max(1);
        let keyspace = &self.server.keyspace;
        let shards = keyspace.all_shards();
        for (global_id, shard) in shards.iter().enumerate() {
            if global_id % num_workers != self.id {
                continue;
            }
            {
                let mut guard = shard.lock_write();
                guard.dict.rehash_steps(CRON_REHASH_STEPS);
                guard.expires.rehash_steps(CRON_REHASH_STEPS);
            }
            active_expire_cycle(shard, &self.server.stats);
            let db = global_id / self.server.config.internal_shards.max(1);
            let shard_in_db = global_id % self.server.config.internal_shards.max(1);
            crate::persist::handle_result(self.server.persistence.snapshot_tick(keyspace, db, shard_in_db));
        }
        self.wake_blocked_clients();
    }

    /// Retries every locally-blocked `BLPOP`/`BRPOP` client: on success,
    /// writes the reply and flushes it; on timeout, replies with a nil
    /// array. A client still empty-handed stays parked for the next tick.
    /// Polling every tick rather than waiting on `ShardData::ready_keys`'s
    /// per-key wakeups is a deliberate simplification (`DESIGN.md`): it
    /// costs at most one cron interval of latency but needs no cross-worker
    /// wakeup channel, since the blocked client and the key it's waiting on
    /// can live on different workers' shards.
    fn wake_blocked_clients(&mut self) {
        let now = crate::db::expire::now_ms();
        let tokens: Vec<Token> = self
            .conns
            .iter()
            .filter(|(_, c)| c.client.blocked.is_some())
            .map(|(t, _)| *t)
            .collect();
        for token in tokens {
            let Some(conn) = self.conns.get_mut(&token) else { continue };
            let Some(state) = conn.client.blocked.clone() else { continue };
            let db = conn.client.db_index;
            let mut found = None;
            for key in &state.keys {
                let shard = self.server.keyspace.shard(db, key);
                let popped = shard.write(key, |d| {
                    let Some(obj) = d.dict.get_mut(key.as_slice()) else { return None };
                    let crate::object::Value::List(list) = &mut obj.value else { return None };
                    let v = if state.front { list.pop_front() } else { list.pop_back() };
                    if list.is_empty() {
                        d.dict.remove(key.as_slice());
                    }
                    if v.is_some() {
                        d.mark_dirty();
                    }
                    v
                });
                if let Some(v) = popped {
                    found = Some((key.clone(), v));
                    break;
                }
            }
            match found {
                Some((key, val)) => {
                    conn.client.blocked = None;
                    conn.client.output.write_bulk_array(&[key.clone(), val.clone()]);
                    let db = conn.client.db_index;
                    let shard_in_db = self.server.keyspace.shard_in_db(db, &key);
                    crate::persist::handle_result(self.server.persistence.log_write(
                        db,
                        shard_in_db,
                        &[if state.front { b"LPOP".to_vec() } else { b"RPOP".to_vec() }, key],
                    ));
                    self.flush_pending(token);
                }
                None => {
                    let timed_out = state.deadline_ms.is_some_and(|d| now >= d);
                    if timed_out {
                        conn.client.blocked = None;
                        conn.client.output.write_nil_array();
                        self.flush_pending(token);
                    }
                }
            }
        }
    }
}

fn finalize_continuation(client: &mut Client, kind: ContinuationKind) {
    match kind {
        ContinuationKind::ClientList { collected } => {
            client.output.write_bulk(collected.join("\n").as_bytes());
        }
        ContinuationKind::ClientKill { killed, .. } => {
            client.output.write_integer(if killed { 1 } else { 0 });
        }
    }
}

/// Samples a handful of keys-with-a-TTL per tick and evicts the ones that
/// have already expired (spec.md §4.7's "active expiration": 20-key
/// sample, repeat if more than 25% were due).
fn active_expire_cycle(shard: &crate::db::Shard, stats: &crate::stats::Stats) {
    use crate::db::expire::{now_ms, ACTIVE_EXPIRE_REPEAT_THRESHOLD, ACTIVE_EXPIRE_SAMPLE_SIZE};
    loop {
        let mut guard = shard.lock_write();
        if guard.expires.is_empty() {
            return;
        }
        let now = now_ms();
        let mut sampled = 0usize;
        let due: Vec<Vec<u8>> = {
            let mut out = Vec::new();
            let mut cursor = 0u64;
            while sampled < ACTIVE_EXPIRE_SAMPLE_SIZE {
                let next = guard.expires.scan(cursor, 1, |k, &exp| {
                    sampled += 1;
                    if exp <= now {
                        out.push(k.clone());
                    }
                });
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            out
        };
        let expired = due.len();
        for key in &due {
            guard.expire_if_due(key, now);
        }
        if expired > 0 {
            for _ in 0..expired {
                crate::stats::Stats::incr(&stats.expired_keys);
            }
        }
        drop(guard);
        if sampled == 0 || (expired as f64) < ACTIVE_EXPIRE_REPEAT_THRESHOLD * sampled as f64 {
            return;
        }
    }
}
