//! Transaction commands (spec.md §4.6.1 "transactions"). `MULTI`/`EXEC`
//! bracket a client's queued commands; `WATCH` arms an optimistic-lock
//! check that `EXEC` consults before replaying the queue.

use super::{cflags, execute, lookup, CommandCtx, CommandSpec};
use crate::client::WatchedKey;
use crate::resp::shared;

pub fn specs() -> Vec<CommandSpec> {
    vec![
        CommandSpec { name: "MULTI", arity: 1, flags: cflags::FAST, handler: multi },
        CommandSpec { name: "EXEC", arity: 1, flags: cflags::FAST, handler: exec },
        CommandSpec { name: "DISCARD", arity: 1, flags: cflags::FAST, handler: discard },
        CommandSpec { name: "WATCH", arity: -2, flags: cflags::FAST, handler: watch },
        CommandSpec { name: "UNWATCH", arity: 1, flags: cflags::FAST, handler: unwatch },
    ]
}

fn multi(ctx: &mut CommandCtx) {
    if ctx.client.in_multi() {
        ctx.reply_error("ERR MULTI calls can not be nested");
        return;
    }
    ctx.client.set_in_multi(true);
    ctx.client.output.write_static(shared::OK);
}

fn discard(ctx: &mut CommandCtx) {
    if !ctx.client.in_multi() {
        ctx.reply_error("ERR DISCARD without MULTI");
        return;
    }
    ctx.client.clear_transaction_state();
    ctx.client.output.write_static(shared::OK);
}

fn watch(ctx: &mut CommandCtx) {
    if ctx.client.in_multi() {
        ctx.reply_error("ERR WATCH inside MULTI is not allowed");
        return;
    }
    let db = ctx.db();
    let keys = ctx.argv()[1..].to_vec();
    for key in keys {
        let version_at_watch = {
            let shard = ctx.server.keyspace.shard(db, &key);
            let mut guard = shard.lock_write();
            guard.watched_keys.entry(key.clone()).or_default().insert(ctx.client.id);
            guard.version
        };
        ctx.client.watches.push(WatchedKey { db, key, version_at_watch });
    }
    ctx.client.output.write_static(shared::OK);
}

fn unwatch(ctx: &mut CommandCtx) {
    clear_watches(ctx);
    ctx.client.output.write_static(shared::OK);
}

fn clear_watches(ctx: &mut CommandCtx) {
    for w in ctx.client.watches.drain(..) {
        let shard = ctx.server.keyspace.shard(w.db, &w.key);
        let mut guard = shard.lock_write();
        if let Some(set) = guard.watched_keys.get_mut(&w.key) {
            set.remove(&ctx.client.id);
            if set.is_empty() {
                guard.watched_keys.remove(&w.key);
            }
        }
    }
}

/// `true` if every watched key's shard version is unchanged since `WATCH`.
fn watches_still_valid(ctx: &CommandCtx) -> bool {
    ctx.client.watches.iter().all(|w| {
        let shard = ctx.server.keyspace.shard(w.db, &w.key);
        shard.lock_read().version == w.version_at_watch
    })
}

fn exec(ctx: &mut CommandCtx) {
    if !ctx.client.in_multi() {
        ctx.reply_error("ERR EXEC without MULTI");
        return;
    }
    if ctx.client.dirty_exec() {
        clear_watches(ctx);
        ctx.client.clear_transaction_state();
        ctx.client.output.write_static(shared::EXECABORT_ERR);
        return;
    }
    if ctx.client.dirty_cas() || !watches_still_valid(ctx) {
        clear_watches(ctx);
        ctx.client.clear_transaction_state();
        ctx.client.output.write_nil_array();
        return;
    }
    let queue = std::mem::take(&mut ctx.client.multi_queue);
    clear_watches(ctx);
    ctx.client.clear_transaction_state();

    ctx.client.output.write_array_header(queue.len());
    for cmd in queue {
        ctx.client.argv = cmd;
        let name = String::from_utf8_lossy(&ctx.client.argv[0]).to_ascii_uppercase();
        match lookup(&name) {
            Some(spec) => execute(ctx, &spec),
            None => ctx.client.output.write_error(&format!("ERR unknown command '{name}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::config::Config;
    use crate::server::Server;
    use std::net::SocketAddr;

    fn new_ctx(server: &Server, client: &mut Client) -> CommandCtx<'_> {
        CommandCtx { server, client, propagate_override: None }
    }

    #[test]
    fn multi_then_exec_runs_queued_commands() {
        let server = Server::new(Config::default());
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let mut client = Client::new(1, 0, addr, false);

        client.argv = vec![b"MULTI".to_vec()];
        let mut ctx = new_ctx(&server, &mut client);
        multi(&mut ctx);
        assert!(client.in_multi());

        client.argv = vec![b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()];
        let mut ctx = new_ctx(&server, &mut client);
        super::super::handle_command(&mut ctx);
        assert!(client.multi_queue.len() == 1);

        client.argv = vec![b"EXEC".to_vec()];
        let mut ctx = new_ctx(&server, &mut client);
        exec(&mut ctx);
        assert!(!client.in_multi());
    }

    #[test]
    fn unknown_command_while_queueing_aborts_exec() {
        let server = Server::new(Config::default());
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let mut client = Client::new(1, 0, addr, false);

        client.argv = vec![b"MULTI".to_vec()];
        let mut ctx = new_ctx(&server, &mut client);
        multi(&mut ctx);

        client.argv = vec![b"NOTACOMMAND".to_vec()];
        let mut ctx = new_ctx(&server, &mut client);
        super::super::handle_command(&mut ctx);
        assert!(client.dirty_exec());

        client.argv = vec![b"EXEC".to_vec()];
        let mut ctx = new_ctx(&server, &mut client);
        exec(&mut ctx);
        assert!(!client.in_multi());
        assert!(!client.dirty_exec());
    }
}
