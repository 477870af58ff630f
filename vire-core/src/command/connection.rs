//! Connection and server administration commands (spec.md §4.6.1
//! "connection/admin").

use super::{arg_str, arg_upper, cflags, command_table, CommandCtx, CommandSpec};
use crate::client::{Continuation, ContinuationKind};
use crate::resp::shared;

pub fn specs() -> Vec<CommandSpec> {
    vec![
        CommandSpec { name: "PING", arity: -1, flags: cflags::FAST, handler: ping },
        CommandSpec { name: "ECHO", arity: 2, flags: cflags::FAST, handler: echo },
        CommandSpec { name: "SELECT", arity: 2, flags: cflags::FAST, handler: select },
        CommandSpec { name: "AUTH", arity: 2, flags: cflags::FAST, handler: auth },
        CommandSpec { name: "QUIT", arity: 1, flags: cflags::FAST, handler: quit },
        CommandSpec { name: "CLIENT", arity: -2, flags: cflags::ADMIN, handler: client },
        CommandSpec { name: "COMMAND", arity: -1, flags: cflags::FAST, handler: command },
        CommandSpec { name: "INFO", arity: -1, flags: cflags::ADMIN, handler: info },
        CommandSpec { name: "DBSIZE", arity: 1, flags: cflags::READONLY, handler: dbsize },
        CommandSpec { name: "FLUSHDB", arity: -1, flags: cflags::WRITE | cflags::ADMIN, handler: flushdb },
        CommandSpec { name: "FLUSHALL", arity: -1, flags: cflags::WRITE | cflags::ADMIN, handler: flushall },
        CommandSpec { name: "CONFIG", arity: -2, flags: cflags::ADMIN, handler: config },
    ]
}

fn ping(ctx: &mut CommandCtx) {
    if ctx.argv().len() == 2 {
        let msg = ctx.argv()[1].clone();
        ctx.client.output.write_bulk(&msg);
    } else {
        ctx.client.output.write_static(shared::PONG);
    }
}

fn echo(ctx: &mut CommandCtx) {
    let msg = ctx.argv()[1].clone();
    ctx.client.output.write_bulk(&msg);
}

fn select(ctx: &mut CommandCtx) {
    let idx_str = arg_str(ctx.argv(), 1);
    match idx_str.parse::<usize>() {
        Ok(idx) if idx < ctx.server.config.databases => {
            ctx.client.db_index = idx;
            ctx.client.output.write_static(shared::OK);
        }
        Ok(_) => ctx.reply_error("ERR DB index is out of range"),
        Err(_) => ctx.client.output.write_static(shared::NOT_INT_ERR),
    }
}

fn auth(ctx: &mut CommandCtx) {
    let supplied = ctx.argv()[1].clone();
    match &ctx.server.config.requirepass {
        None => ctx.reply_error("ERR Client sent AUTH, but no password is set."),
        Some(expected) => {
            if supplied == expected.as_bytes() {
                ctx.client.authenticated = true;
                ctx.client.output.write_static(shared::OK);
            } else {
                ctx.reply_error("ERR invalid password");
            }
        }
    }
}

fn quit(ctx: &mut CommandCtx) {
    ctx.client.should_close = true;
    ctx.client.output.write_static(shared::OK);
}

fn client(ctx: &mut CommandCtx) {
    let sub = arg_upper(ctx.argv(), 1);
    match sub.as_str() {
        "GETNAME" => ctx.client.output.write_bulk(&ctx.client.name.clone()),
        "SETNAME" if ctx.argv().len() == 3 => {
            ctx.client.name = ctx.argv()[2].clone();
            ctx.client.output.write_static(shared::OK);
        }
        "LIST" => {
            // This worker's own client table isn't enough for a cluster-wide
            // list, so no reply is written here: setting `continuation`
            // hands the client to the worker loop, which walks it through
            // every other worker's client table (spec.md §4.3) before a
            // reply is ever written.
            let steps = ctx.server.config.worker_threads;
            let collected = vec![ctx.client.describe()];
            ctx.client.continuation = Some(Continuation {
                steps_remaining: steps,
                origin_worker: ctx.client.worker_id,
                kind: ContinuationKind::ClientList { collected },
            });
        }
        "KILL" if ctx.argv().len() == 4 && arg_upper(ctx.argv(), 2) == "ID" => {
            let Ok(target_id) = arg_str(ctx.argv(), 3).parse::<u64>() else {
                ctx.client.output.write_static(shared::NOT_INT_ERR);
                return;
            };
            let steps = ctx.server.config.worker_threads;
            ctx.client.continuation = Some(Continuation {
                steps_remaining: steps,
                origin_worker: ctx.client.worker_id,
                kind: ContinuationKind::ClientKill { target_id, killed: false },
            });
        }
        _ => ctx.reply_error("ERR Unknown CLIENT subcommand or wrong number of arguments"),
    }
}

fn command(ctx: &mut CommandCtx) {
    let sub = if ctx.argv().len() > 1 { arg_upper(ctx.argv(), 1) } else { "".to_string() };
    if sub == "COUNT" {
        ctx.client.output.write_integer(command_table().len() as i64);
    } else {
        ctx.client.output.write_array_header(0);
    }
}

fn info(ctx: &mut CommandCtx) {
    let snap = ctx.server.stats.snapshot();
    let text = format!(
        "# Server\r\nuptime_in_seconds:{}\r\n# Clients\r\n# Stats\r\ntotal_connections_received:{}\r\ntotal_commands_processed:{}\r\nexpired_keys:{}\r\nevicted_keys:{}\r\nkeyspace_hits:{}\r\nkeyspace_misses:{}\r\n# Keyspace\r\n",
        ctx.server.uptime_secs(),
        snap.connections_received,
        snap.commands_processed,
        snap.expired_keys,
        snap.evicted_keys,
        snap.keyspace_hits,
        snap.keyspace_misses,
    );
    ctx.client.output.write_bulk(text.as_bytes());
}

fn dbsize(ctx: &mut CommandCtx) {
    let n = ctx.server.keyspace.dbsize(ctx.db());
    ctx.client.output.write_integer(n as i64);
}

fn flushdb(ctx: &mut CommandCtx) {
    ctx.server.keyspace.flush_db(ctx.db());
    ctx.client.output.write_static(shared::OK);
}

fn flushall(ctx: &mut CommandCtx) {
    ctx.server.keyspace.flush_all();
    ctx.client.output.write_static(shared::OK);
}

fn config(ctx: &mut CommandCtx) {
    let sub = arg_upper(ctx.argv(), 1);
    match sub.as_str() {
        "GET" if ctx.argv().len() == 3 => {
            let key = arg_str(ctx.argv(), 2).to_ascii_lowercase();
            let value = match key.as_str() {
                "maxmemory" => Some(ctx.server.config.maxmemory_bytes.to_string()),
                "maxmemory-policy" => Some(ctx.server.config.maxmemory_policy.as_str().to_string()),
                "appendonly" => Some(if ctx.server.config.appendonly { "yes" } else { "no" }.to_string()),
                "databases" => Some(ctx.server.config.databases.to_string()),
                _ => None,
            };
            match value {
                Some(v) => ctx.client.output.write_bulk_array(&[key.into_bytes(), v.into_bytes()]),
                None => ctx.client.output.write_array_header(0),
            }
        }
        "SET" if ctx.argv().len() == 4 => {
            // Most keys are fixed at startup in this server; acknowledge
            // without applying to keep compatibility with clients that
            // probe `CONFIG SET` defensively.
            ctx.client.output.write_static(shared::OK);
        }
        _ => ctx.reply_error("ERR Unknown CONFIG subcommand or wrong number of arguments"),
    }
}
