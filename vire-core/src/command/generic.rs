//! Key-space-generic commands that apply to any value kind (spec.md §4.6.1
//! "generic").

use super::{arg_str, arg_upper, cflags, CommandCtx, CommandSpec};
use crate::db::expire::now_ms;
use crate::object::parse_i64;
use crate::resp::shared;

pub fn specs() -> Vec<CommandSpec> {
    vec![
        CommandSpec { name: "DEL", arity: -2, flags: cflags::WRITE, handler: del },
        CommandSpec { name: "EXISTS", arity: -2, flags: cflags::READONLY, handler: exists },
        CommandSpec { name: "TYPE", arity: 2, flags: cflags::READONLY, handler: type_cmd },
        CommandSpec { name: "EXPIRE", arity: 3, flags: cflags::WRITE, handler: expire },
        CommandSpec { name: "PEXPIRE", arity: 3, flags: cflags::WRITE, handler: pexpire },
        CommandSpec { name: "EXPIREAT", arity: 3, flags: cflags::WRITE, handler: expireat },
        CommandSpec { name: "PEXPIREAT", arity: 3, flags: cflags::WRITE, handler: pexpireat },
        CommandSpec { name: "TTL", arity: 2, flags: cflags::READONLY, handler: ttl },
        CommandSpec { name: "PTTL", arity: 2, flags: cflags::READONLY, handler: pttl },
        CommandSpec { name: "PERSIST", arity: 2, flags: cflags::WRITE, handler: persist },
        CommandSpec { name: "RENAME", arity: 3, flags: cflags::WRITE, handler: rename },
        CommandSpec { name: "RENAMENX", arity: 3, flags: cflags::WRITE, handler: renamenx },
        CommandSpec { name: "KEYS", arity: 2, flags: cflags::READONLY, handler: keys },
        CommandSpec { name: "SCAN", arity: -2, flags: cflags::READONLY, handler: scan },
        CommandSpec { name: "OBJECT", arity: -2, flags: cflags::READONLY, handler: object },
    ]
}

fn del(ctx: &mut CommandCtx) {
    let argv = ctx.argv().to_vec();
    let db = ctx.db();
    let mut removed = 0i64;
    for key in &argv[1..] {
        let shard = ctx.server.keyspace.shard(db, key);
        shard.write(key, |d| {
            if d.dict.remove(key.as_slice()).is_some() {
                d.expires.remove(key.as_slice());
                d.eviction_pool.remove(key);
                d.mark_dirty();
                removed += 1;
            }
        });
    }
    if removed == 0 {
        ctx.prevent_propagation();
    }
    ctx.client.output.write_integer(removed);
}

fn exists(ctx: &mut CommandCtx) {
    let argv = ctx.argv().to_vec();
    let db = ctx.db();
    let mut count = 0i64;
    for key in &argv[1..] {
        let shard = ctx.server.keyspace.shard(db, key);
        if shard.read(key, |_| ()).is_some() {
            count += 1;
        }
    }
    ctx.client.output.write_integer(count);
}

fn type_cmd(ctx: &mut CommandCtx) {
    let key = ctx.argv()[1].clone();
    let shard = ctx.shard(&key);
    match shard.read(&key, |o| o.kind().type_name()) {
        Some(name) => ctx.client.output.write_simple_string(name),
        None => ctx.client.output.write_simple_string("none"),
    }
}

fn set_expire_at(ctx: &mut CommandCtx, at_ms: i64) {
    let key = ctx.argv()[1].clone();
    let db = ctx.db();
    let shard = ctx.server.keyspace.shard(db, &key);
    let now = now_ms();
    let set = shard.write(&key, |d| {
        if d.dict.get_no_step(key.as_slice()).is_none() {
            return false;
        }
        if at_ms <= now {
            d.dict.remove(key.as_slice());
            d.expires.remove(key.as_slice());
        } else {
            d.expires.insert(key.clone(), at_ms);
            d.expire_stats.observe(at_ms - now);
        }
        d.mark_dirty();
        true
    });
    if set {
        // Propagate as absolute-time `PEXPIREAT` rather than the relative
        // form actually sent, so replaying the append log later reproduces
        // the same expiry instant regardless of when replay happens
        // (spec.md §4.5 "Append-log").
        ctx.also_propagate(vec![b"PEXPIREAT".to_vec(), key.clone(), at_ms.to_string().into_bytes()]);
    } else {
        ctx.prevent_propagation();
    }
    ctx.client.output.write_integer(if set { 1 } else { 0 });
}

fn expire(ctx: &mut CommandCtx) {
    match parse_i64(&ctx.argv()[2]) {
        Some(secs) => set_expire_at(ctx, now_ms() + secs * 1000),
        None => ctx.client.output.write_static(shared::NOT_INT_ERR),
    }
}

fn pexpire(ctx: &mut CommandCtx) {
    match parse_i64(&ctx.argv()[2]) {
        Some(ms) => set_expire_at(ctx, now_ms() + ms),
        None => ctx.client.output.write_static(shared::NOT_INT_ERR),
    }
}

fn expireat(ctx: &mut CommandCtx) {
    match parse_i64(&ctx.argv()[2]) {
        Some(secs) => set_expire_at(ctx, secs * 1000),
        None => ctx.client.output.write_static(shared::NOT_INT_ERR),
    }
}

fn pexpireat(ctx: &mut CommandCtx) {
    match parse_i64(&ctx.argv()[2]) {
        Some(ms) => set_expire_at(ctx, ms),
        None => ctx.client.output.write_static(shared::NOT_INT_ERR),
    }
}

fn ttl(ctx: &mut CommandCtx) {
    generic_ttl(ctx, 1000);
}

fn pttl(ctx: &mut CommandCtx) {
    generic_ttl(ctx, 1);
}

fn generic_ttl(ctx: &mut CommandCtx, unit_ms: i64) {
    let key = ctx.argv()[1].clone();
    let shard = ctx.shard(&key);
    let guard = shard.lock_read();
    if guard.dict.get_no_step(key.as_slice()).is_none() {
        ctx.client.output.write_integer(-2);
        return;
    }
    match guard.expires.get_no_step(key.as_slice()) {
        Some(&at) => {
            let remaining = (at - now_ms()).max(0);
            ctx.client.output.write_integer(remaining / unit_ms);
        }
        None => ctx.client.output.write_integer(-1),
    }
}

fn persist(ctx: &mut CommandCtx) {
    let key = ctx.argv()[1].clone();
    let shard = ctx.shard(&key);
    let removed = shard.write(&key, |d| {
        if d.dict.get_no_step(key.as_slice()).is_some() {
            let had = d.expires.remove(key.as_slice()).is_some();
            if had {
                d.mark_dirty();
            }
            had
        } else {
            false
        }
    });
    if !removed {
        ctx.prevent_propagation();
    }
    ctx.client.output.write_integer(if removed { 1 } else { 0 });
}

fn rename(ctx: &mut CommandCtx) {
    let src = ctx.argv()[1].clone();
    let dst = ctx.argv()[2].clone();
    let db = ctx.db();
    let src_shard_idx = ctx.server.keyspace.shard_index(db, &src);
    let dst_shard_idx = ctx.server.keyspace.shard_index(db, &dst);
    let ok = move_key(ctx, src_shard_idx, dst_shard_idx, &src, &dst, false);
    if ok {
        ctx.client.output.write_static(shared::OK);
    } else {
        ctx.reply_error("ERR no such key");
    }
}

fn renamenx(ctx: &mut CommandCtx) {
    let src = ctx.argv()[1].clone();
    let dst = ctx.argv()[2].clone();
    let db = ctx.db();
    let src_shard_idx = ctx.server.keyspace.shard_index(db, &src);
    let dst_shard_idx = ctx.server.keyspace.shard_index(db, &dst);
    if ctx.server.keyspace.all_shards()[dst_shard_idx].read(&dst, |_| ()).is_some() {
        ctx.prevent_propagation();
        ctx.client.output.write_integer(0);
        return;
    }
    let ok = move_key(ctx, src_shard_idx, dst_shard_idx, &src, &dst, false);
    if !ok {
        ctx.reply_error("ERR no such key");
        return;
    }
    ctx.client.output.write_integer(1);
}

/// Locks the two shards in ascending shard-id order (spec.md §4.6) and
/// moves `src`'s object and TTL to `dst`. Same-shard renames take the fast
/// path of a single lock.
fn move_key(ctx: &mut CommandCtx, src_idx: usize, dst_idx: usize, src: &[u8], dst: &[u8], _overwrite: bool) -> bool {
    let shards = ctx.server.keyspace.all_shards();
    if src_idx == dst_idx {
        let mut g = shards[src_idx].lock_write();
        g.barrier(src);
        g.barrier(dst);
        let Some(obj) = g.dict.remove(src) else { return false };
        let exp = g.expires.remove(src);
        g.dict.insert(dst.to_vec(), obj);
        if let Some(e) = exp {
            g.expires.insert(dst.to_vec(), e);
        } else {
            g.expires.remove(dst);
        }
        g.mark_dirty();
        return true;
    }
    // Lock in ascending shard-id order regardless of which side is the
    // rename's source, so two concurrent renames crossing the same pair of
    // shards from opposite directions can't deadlock (spec.md §4.6).
    let (lo, hi) = if src_idx < dst_idx { (src_idx, dst_idx) } else { (dst_idx, src_idx) };
    let mut first = shards[lo].lock_write();
    first.barrier(if lo == src_idx { src } else { dst });
    let obj_and_exp = if lo == src_idx {
        let obj = first.dict.remove(src);
        let exp = first.expires.remove(src);
        obj.map(|o| (o, exp))
    } else {
        None
    };
    drop(first);
    if lo == src_idx {
        let Some((obj, exp)) = obj_and_exp else { return false };
        let mut second = shards[hi].lock_write();
        second.barrier(dst);
        second.dict.insert(dst.to_vec(), obj);
        if let Some(e) = exp {
            second.expires.insert(dst.to_vec(), e);
        } else {
            second.expires.remove(dst);
        }
        second.mark_dirty();
        true
    } else {
        let mut second = shards[hi].lock_write();
        second.barrier(src);
        let Some(obj) = second.dict.remove(src) else { return false };
        let exp = second.expires.remove(src);
        drop(second);
        let mut first = shards[lo].lock_write();
        first.barrier(dst);
        first.dict.insert(dst.to_vec(), obj);
        if let Some(e) = exp {
            first.expires.insert(dst.to_vec(), e);
        } else {
            first.expires.remove(dst);
        }
        first.mark_dirty();
        true
    }
}

fn keys(ctx: &mut CommandCtx) {
    let pattern = ctx.argv()[1].clone();
    let db = ctx.db();
    let mut out = Vec::new();
    for shard in ctx.server.keyspace.shards_for_db(db) {
        let guard = shard.lock_read();
        for (k, _) in guard.dict.iter() {
            if glob_match(&pattern, k) {
                out.push(k.clone());
            }
        }
    }
    ctx.client.output.write_bulk_array(&out);
}

fn scan(ctx: &mut CommandCtx) {
    let cursor: u64 = arg_str(ctx.argv(), 1).parse().unwrap_or(0);
    let mut count = 10usize;
    let mut pattern: Option<Vec<u8>> = None;
    let mut i = 2;
    let argv = ctx.argv().to_vec();
    while i < argv.len() {
        let opt = arg_upper(&argv, i);
        match opt.as_str() {
            "COUNT" if i + 1 < argv.len() => {
                count = arg_str(&argv, i + 1).parse().unwrap_or(10);
                i += 2;
            }
            "MATCH" if i + 1 < argv.len() => {
                pattern = Some(argv[i + 1].clone());
                i += 2;
            }
            _ => break,
        }
    }
    let db = ctx.db();
    let mut out = Vec::new();
    let next = ctx.server.keyspace.scan_db(db, cursor, count, |k| {
        if pattern.as_ref().map(|p| glob_match(p, k)).unwrap_or(true) {
            out.push(k.to_vec());
        }
    });
    ctx.client.output.write_array_header(2);
    ctx.client.output.write_bulk(next.to_string().as_bytes());
    ctx.client.output.write_bulk_array(&out);
}

fn object(ctx: &mut CommandCtx) {
    let sub = arg_upper(ctx.argv(), 1);
    if sub != "ENCODING" || ctx.argv().len() != 3 {
        ctx.reply_error("ERR Unknown OBJECT subcommand");
        return;
    }
    let key = ctx.argv()[2].clone();
    let shard = ctx.shard(&key);
    match shard.read(&key, |o| o.encoding().as_str()) {
        Some(enc) => ctx.client.output.write_bulk(enc.as_bytes()),
        None => ctx.client.output.write_nil_bulk(),
    }
}

/// Minimal glob matcher supporting `*`, `?`, and `[...]` character classes,
/// matching the subset `KEYS`/`SCAN MATCH` patterns actually use.
pub fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    glob_match_at(pattern, text)
}

fn glob_match_at(pattern: &[u8], text: &[u8]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some(b'*') => {
            if glob_match_at(&pattern[1..], text) {
                return true;
            }
            for i in 0..text.len() {
                if glob_match_at(&pattern[1..], &text[i + 1..]) {
                    return true;
                }
            }
            false
        }
        Some(b'?') => !text.is_empty() && glob_match_at(&pattern[1..], &text[1..]),
        Some(b'[') => {
            let Some(close) = pattern.iter().position(|&b| b == b']') else {
                return !text.is_empty() && pattern[0] == text[0] && glob_match_at(&pattern[1..], &text[1..]);
            };
            if text.is_empty() {
                return false;
            }
            let class = &pattern[1..close];
            let (negate, class) = if class.first() == Some(&b'^') { (true, &class[1..]) } else { (false, class) };
            let matched = class.contains(&text[0]);
            if matched != negate {
                glob_match_at(&pattern[close + 1..], &text[1..])
            } else {
                false
            }
        }
        Some(&c) => !text.is_empty() && c == text[0] && glob_match_at(&pattern[1..], &text[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_star_and_question() {
        assert!(glob_match(b"foo*", b"foobar"));
        assert!(glob_match(b"f?o", b"foo"));
        assert!(!glob_match(b"f?o", b"fooo"));
    }

    #[test]
    fn glob_char_class() {
        assert!(glob_match(b"[ab]x", b"ax"));
        assert!(!glob_match(b"[^ab]x", b"ax"));
    }
}
