//! Persistence control commands (spec.md §4.6.1): `SAVE`, `BGSAVE`,
//! `LASTSAVE`, `BGREWRITEAOF`. `BGSAVE` only arms the dump flags here — the
//! worker cron's per-tick `PersistenceEngine::snapshot_tick` calls are what
//! actually finish it, matching the single-process redesign (no
//! fork-based background save).

use super::{cflags, CommandCtx, CommandSpec};
use crate::resp::shared;

pub fn specs() -> Vec<CommandSpec> {
    vec![
        CommandSpec { name: "SAVE", arity: 1, flags: cflags::ADMIN, handler: save },
        CommandSpec { name: "BGSAVE", arity: -1, flags: cflags::ADMIN, handler: bgsave },
        CommandSpec { name: "LASTSAVE", arity: 1, flags: cflags::FAST, handler: lastsave },
        CommandSpec { name: "BGREWRITEAOF", arity: 1, flags: cflags::ADMIN, handler: bgrewriteaof },
    ]
}

fn save(ctx: &mut CommandCtx) {
    match ctx.server.persistence.save_blocking(&ctx.server.keyspace) {
        Ok(()) => {
            ctx.server.mark_saved();
            ctx.client.output.write_static(shared::OK);
        }
        Err(e) => ctx.reply_error(&format!("ERR {e}")),
    }
}

fn bgsave(ctx: &mut CommandCtx) {
    ctx.server.persistence.begin_snapshot(&ctx.server.keyspace);
    ctx.client.output.write_simple_string("Background saving started");
}

fn lastsave(ctx: &mut CommandCtx) {
    ctx.client.output.write_integer(ctx.server.persistence.last_save_secs());
}

fn bgrewriteaof(ctx: &mut CommandCtx) {
    match ctx.server.persistence.rewrite_aof() {
        Ok(()) => ctx.client.output.write_simple_string("Background append only file rewriting started"),
        Err(e) => ctx.reply_error(&format!("ERR {e}")),
    }
}
