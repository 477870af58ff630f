//! Command table and dispatch (spec.md §4.6).
//!
//! Each command is a `(name, arity, flags, handler)` entry in a table built
//! once and looked up by name. `handle_command` is the single entry point
//! the worker calls per parsed request: it does arity/auth checking,
//! transparently queues into `MULTI` when a client has one open, and
//! otherwise runs the handler and works out what (if anything) should be
//! propagated to the append log.

pub mod connection;
pub mod generic;
pub mod hashes;
pub mod lists;
pub mod multi;
pub mod persist_ctl;
pub mod sets;
pub mod strings;
pub mod zsets;

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::client::Client;
use crate::server::Server;

pub mod cflags {
    pub const WRITE: u32 = 1 << 0;
    pub const READONLY: u32 = 1 << 1;
    pub const ADMIN: u32 = 1 << 2;
    pub const FAST: u32 = 1 << 3;
    pub const BLOCKING: u32 = 1 << 4;
}

pub type Handler = fn(&mut CommandCtx);

#[derive(Clone, Copy)]
pub struct CommandSpec {
    pub name: &'static str,
    /// Positive: exact argument count including the command name. Negative:
    /// at least `-arity` arguments.
    pub arity: i32,
    pub flags: u32,
    pub handler: Handler,
}

/// One command's worth of context: the immutable server, the client that
/// issued it (mutable — its output buffer, db index, watch list, etc.), and
/// whatever this call decides should be appended to the write log instead
/// of the verbatim command (spec.md §4.6's `prevent_propagation` /
/// `also_propagate` escape hatch, used by e.g. `SPOP` propagating as
/// `SREM`).
pub struct CommandCtx<'a> {
    pub server: &'a Server,
    pub client: &'a mut Client,
    pub propagate_override: Option<Vec<Vec<Vec<u8>>>>,
}

impl<'a> CommandCtx<'a> {
    pub fn argv(&self) -> &[Vec<u8>] {
        &self.client.argv
    }

    pub fn db(&self) -> usize {
        self.client.db_index
    }

    pub fn shard(&self, key: &[u8]) -> &crate::db::Shard {
        self.server.keyspace.shard(self.client.db_index, key)
    }

    pub fn reply_error(&mut self, msg: &str) {
        self.client.output.write_error(msg);
    }

    /// Suppresses propagation entirely (the command had no observable
    /// write effect, e.g. `SET ... NX` that didn't set).
    pub fn prevent_propagation(&mut self) {
        self.propagate_override = Some(Vec::new());
    }

    /// Propagates `cmd` instead of (or in addition to) the verbatim
    /// command.
    pub fn also_propagate(&mut self, cmd: Vec<Vec<u8>>) {
        self.propagate_override.get_or_insert_with(Vec::new).push(cmd);
    }

    pub fn mark_dirty(&self) {
        self.server.dirty_since_save.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}

fn all_specs() -> Vec<CommandSpec> {
    let mut v = Vec::new();
    v.extend(connection::specs());
    v.extend(generic::specs());
    v.extend(strings::specs());
    v.extend(lists::specs());
    v.extend(sets::specs());
    v.extend(hashes::specs());
    v.extend(zsets::specs());
    v.extend(multi::specs());
    v.extend(persist_ctl::specs());
    v
}

pub fn command_table() -> &'static HashMap<&'static str, CommandSpec> {
    static TABLE: OnceLock<HashMap<&'static str, CommandSpec>> = OnceLock::new();
    TABLE.get_or_init(|| all_specs().into_iter().map(|s| (s.name, s)).collect())
}

fn arity_ok(spec: &CommandSpec, argc: i32) -> bool {
    if spec.arity >= 0 {
        argc == spec.arity
    } else {
        argc >= -spec.arity
    }
}

/// The names `handle_command` never queues into `MULTI`, because they
/// control the transaction itself or connection setup.
fn bypasses_multi_queue(name: &str) -> bool {
    matches!(name, "MULTI" | "EXEC" | "DISCARD" | "WATCH" | "RESET" | "QUIT" | "AUTH")
}

/// Single entry point the worker calls for every parsed request. Handles
/// unknown-command and arity errors, auth gating, `MULTI` queueing, and
/// otherwise executes the handler directly.
pub fn handle_command(ctx: &mut CommandCtx) {
    if ctx.client.argv.is_empty() {
        return;
    }
    let name = String::from_utf8_lossy(&ctx.client.argv[0]).to_ascii_uppercase();
    let table = command_table();
    let Some(spec) = table.get(name.as_str()).copied() else {
        if ctx.client.in_multi() {
            ctx.client.set_dirty_exec();
        }
        ctx.client.output.write_error(&format!("ERR unknown command '{name}'"));
        return;
    };
    let argc = ctx.client.argv.len() as i32;
    if !arity_ok(&spec, argc) {
        if ctx.client.in_multi() {
            ctx.client.set_dirty_exec();
        }
        ctx.client
            .output
            .write_error(&format!("ERR wrong number of arguments for '{}' command", name.to_lowercase()));
        return;
    }
    if !ctx.client.authenticated && name != "AUTH" {
        ctx.client.output.write_static(crate::resp::shared::NOAUTH_ERR);
        return;
    }
    if ctx.client.in_multi() && !bypasses_multi_queue(&name) {
        ctx.client.multi_queue.push(ctx.client.argv.clone());
        ctx.client.output.write_static(crate::resp::shared::QUEUED);
        return;
    }
    execute(ctx, &spec);
}

/// Runs a command's handler directly, bypassing `MULTI` queueing — used
/// both by `handle_command`'s non-queued path and by `EXEC` replaying each
/// queued command. Write commands are appended to the log afterwards,
/// either verbatim or as whatever the handler substituted via
/// `also_propagate`/`prevent_propagation` (spec.md §4.5).
pub fn execute(ctx: &mut CommandCtx, spec: &CommandSpec) {
    ctx.propagate_override = None;
    (spec.handler)(ctx);
    ctx.server.stats.commands_processed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    if spec.flags & cflags::WRITE != 0 {
        propagate(ctx);
    }
}

/// Appends the effective write to the shard that owns its routing key. A
/// handler's `propagate_override` (set via `also_propagate`/
/// `prevent_propagation`) takes precedence over the verbatim argv; an empty
/// override means the command had no observable effect and logs nothing.
///
/// Which shard's file physically holds the bytes only matters for
/// bookkeeping — `PersistenceEngine::load_all` replays every logged command
/// back through the real command handler, which re-derives correct shard
/// routing per key on its own. So routing the log entry by the first key
/// argument (falling back to shard 0 for admin commands with no key, e.g.
/// `FLUSHDB`) is sufficient for replay correctness even when a command
/// touches keys in more than one shard.
fn propagate(ctx: &mut CommandCtx) {
    let db = ctx.db();
    let key: &[u8] = ctx.argv().get(1).map(|v| v.as_slice()).unwrap_or(&[]);
    let shard_in_db = ctx.server.keyspace.shard_in_db(db, key);
    match ctx.propagate_override.take() {
        Some(cmds) => {
            for cmd in cmds {
                crate::persist::handle_result(ctx.server.persistence.log_write(db, shard_in_db, &cmd));
            }
        }
        None => {
            crate::persist::handle_result(ctx.server.persistence.log_write(db, shard_in_db, ctx.argv()));
        }
    }
}

/// Looks a command up by name for callers (like `EXEC`) that already have
/// the argv and just need the spec.
pub fn lookup(name: &str) -> Option<CommandSpec> {
    command_table().get(name.to_ascii_uppercase().as_str()).copied()
}

pub(crate) fn arg_str(argv: &[Vec<u8>], idx: usize) -> String {
    String::from_utf8_lossy(&argv[idx]).to_string()
}

pub(crate) fn arg_upper(argv: &[Vec<u8>], idx: usize) -> String {
    arg_str(argv, idx).to_ascii_uppercase()
}
