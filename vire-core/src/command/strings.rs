//! String commands (spec.md §4.6.1 "strings").

use super::{arg_str, arg_upper, cflags, CommandCtx, CommandSpec};
use crate::db::expire::now_ms;
use crate::object::{parse_i64, Object, Value};
use crate::resp::shared;

pub fn specs() -> Vec<CommandSpec> {
    vec![
        CommandSpec { name: "SET", arity: -3, flags: cflags::WRITE, handler: set },
        CommandSpec { name: "SETEX", arity: 4, flags: cflags::WRITE, handler: setex },
        CommandSpec { name: "PSETEX", arity: 4, flags: cflags::WRITE, handler: psetex },
        CommandSpec { name: "SETNX", arity: 3, flags: cflags::WRITE, handler: setnx },
        CommandSpec { name: "GET", arity: 2, flags: cflags::READONLY | cflags::FAST, handler: get },
        CommandSpec { name: "GETSET", arity: 3, flags: cflags::WRITE, handler: getset },
        CommandSpec { name: "APPEND", arity: 3, flags: cflags::WRITE, handler: append },
        CommandSpec { name: "STRLEN", arity: 2, flags: cflags::READONLY, handler: strlen },
        CommandSpec { name: "INCR", arity: 2, flags: cflags::WRITE | cflags::FAST, handler: incr },
        CommandSpec { name: "DECR", arity: 2, flags: cflags::WRITE | cflags::FAST, handler: decr },
        CommandSpec { name: "INCRBY", arity: 3, flags: cflags::WRITE | cflags::FAST, handler: incrby },
        CommandSpec { name: "DECRBY", arity: 3, flags: cflags::WRITE | cflags::FAST, handler: decrby },
        CommandSpec { name: "MGET", arity: -2, flags: cflags::READONLY, handler: mget },
        CommandSpec { name: "MSET", arity: -3, flags: cflags::WRITE, handler: mset },
        CommandSpec { name: "GETRANGE", arity: 4, flags: cflags::READONLY, handler: getrange },
        CommandSpec { name: "SETRANGE", arity: 4, flags: cflags::WRITE, handler: setrange },
    ]
}

fn as_str_bytes<'a>(obj: &'a Object) -> Result<&'a [u8], ()> {
    match &obj.value {
        Value::Str(s) => Ok(s),
        _ => Err(()),
    }
}

fn set(ctx: &mut CommandCtx) {
    let argv = ctx.argv().to_vec();
    let key = argv[1].clone();
    let val = argv[2].clone();
    let mut nx = false;
    let mut xx = false;
    let mut expire_at: Option<i64> = None;
    let mut i = 3;
    while i < argv.len() {
        match arg_upper(&argv, i).as_str() {
            "NX" => {
                nx = true;
                i += 1;
            }
            "XX" => {
                xx = true;
                i += 1;
            }
            "EX" if i + 1 < argv.len() => {
                let Some(secs) = parse_i64(&argv[i + 1]) else {
                    ctx.client.output.write_static(shared::NOT_INT_ERR);
                    return;
                };
                expire_at = Some(now_ms() + secs * 1000);
                i += 2;
            }
            "PX" if i + 1 < argv.len() => {
                let Some(ms) = parse_i64(&argv[i + 1]) else {
                    ctx.client.output.write_static(shared::NOT_INT_ERR);
                    return;
                };
                expire_at = Some(now_ms() + ms);
                i += 2;
            }
            _ => {
                ctx.client.output.write_static(shared::SYNTAX_ERR);
                return;
            }
        }
    }
    let shard = ctx.shard(&key);
    let did_set = shard.write(&key, |d| {
        let exists = d.dict.get_no_step(key.as_slice()).is_some();
        if (nx && exists) || (xx && !exists) {
            return false;
        }
        d.dict.insert(key.clone(), Object::new(Value::Str(val.clone())));
        match expire_at {
            Some(at) => {
                d.expires.insert(key.clone(), at);
                d.expire_stats.observe(at - now_ms());
            }
            None => {
                d.expires.remove(key.as_slice());
            }
        }
        d.mark_dirty();
        true
    });
    if did_set {
        if let Some(at) = expire_at {
            // Propagate as plain `SET` (the `EX`/`PX` option stripped) plus
            // an absolute-time `PEXPIREAT`, matching the `SETEX` family's
            // translation (spec.md §4.5 "Append-log").
            ctx.also_propagate(vec![b"SET".to_vec(), key.clone(), val]);
            ctx.also_propagate(vec![b"PEXPIREAT".to_vec(), key, at.to_string().into_bytes()]);
        }
        ctx.client.output.write_static(shared::OK);
    } else {
        ctx.prevent_propagation();
        ctx.client.output.write_nil_bulk();
    }
}

fn setex_generic(ctx: &mut CommandCtx, unit_ms: i64) {
    let key = ctx.argv()[1].clone();
    let Some(ttl) = parse_i64(&ctx.argv()[2]) else {
        ctx.client.output.write_static(shared::NOT_INT_ERR);
        return;
    };
    if ttl <= 0 {
        ctx.reply_error("ERR invalid expire time");
        return;
    }
    let val = ctx.argv()[3].clone();
    let at_ms = now_ms() + ttl * unit_ms;
    let shard = ctx.shard(&key);
    shard.write(&key, |d| {
        d.dict.insert(key.clone(), Object::new(Value::Str(val.clone())));
        d.expires.insert(key.clone(), at_ms);
        d.expire_stats.observe(ttl * unit_ms);
        d.mark_dirty();
    });
    // Propagate as `SET` + absolute-time `PEXPIREAT` (spec.md §4.5
    // "Append-log": "`SET`+`PEXPIREAT` for `SETEX`").
    ctx.also_propagate(vec![b"SET".to_vec(), key.clone(), val]);
    ctx.also_propagate(vec![b"PEXPIREAT".to_vec(), key, at_ms.to_string().into_bytes()]);
    ctx.client.output.write_static(shared::OK);
}

fn setex(ctx: &mut CommandCtx) {
    setex_generic(ctx, 1000);
}

fn psetex(ctx: &mut CommandCtx) {
    setex_generic(ctx, 1);
}

fn setnx(ctx: &mut CommandCtx) {
    let key = ctx.argv()[1].clone();
    let val = ctx.argv()[2].clone();
    let shard = ctx.shard(&key);
    let set = shard.write(&key, |d| {
        if d.dict.get_no_step(key.as_slice()).is_some() {
            return false;
        }
        d.dict.insert(key.clone(), Object::new(Value::Str(val.clone())));
        d.mark_dirty();
        true
    });
    if !set {
        ctx.prevent_propagation();
    }
    ctx.client.output.write_integer(if set { 1 } else { 0 });
}

fn get(ctx: &mut CommandCtx) {
    let key = ctx.argv()[1].clone();
    let shard = ctx.shard(&key);
    match shard.read(&key, |o| as_str_bytes(o).map(|s| s.to_vec())) {
        Some(Ok(bytes)) => ctx.client.output.write_bulk(&bytes),
        Some(Err(())) => ctx.client.output.write_static(shared::WRONGTYPE_ERR),
        None => ctx.client.output.write_nil_bulk(),
    }
}

fn getset(ctx: &mut CommandCtx) {
    let key = ctx.argv()[1].clone();
    let val = ctx.argv()[2].clone();
    let shard = ctx.shard(&key);
    let result = shard.write(&key, |d| {
        let prev = d.dict.get_no_step(key.as_slice()).and_then(|o| as_str_bytes(o).ok().map(|s| s.to_vec()));
        if d.dict.get_no_step(key.as_slice()).map(|o| o.kind()) == Some(crate::object::Kind::String) || prev.is_none() && d.dict.get_no_step(key.as_slice()).is_none() {
            d.dict.insert(key.clone(), Object::new(Value::Str(val.clone())));
            d.expires.remove(key.as_slice());
            d.mark_dirty();
            Ok(prev)
        } else {
            Err(())
        }
    });
    match result {
        Ok(Some(bytes)) => ctx.client.output.write_bulk(&bytes),
        Ok(None) => ctx.client.output.write_nil_bulk(),
        Err(()) => ctx.client.output.write_static(shared::WRONGTYPE_ERR),
    }
}

fn append(ctx: &mut CommandCtx) {
    let key = ctx.argv()[1].clone();
    let suffix = ctx.argv()[2].clone();
    let shard = ctx.shard(&key);
    let result = shard.write(&key, |d| {
        match d.dict.get_mut(key.as_slice()) {
            Some(obj) => {
                let Value::Str(s) = &mut obj.value else {
                    return Err(());
                };
                s.extend_from_slice(&suffix);
                let len = s.len();
                d.mark_dirty();
                Ok(len)
            }
            None => {
                d.dict.insert(key.clone(), Object::new(Value::Str(suffix.clone())));
                d.mark_dirty();
                Ok(suffix.len())
            }
        }
    });
    match result {
        Ok(len) => ctx.client.output.write_integer(len as i64),
        Err(()) => ctx.client.output.write_static(shared::WRONGTYPE_ERR),
    }
}

fn strlen(ctx: &mut CommandCtx) {
    let key = ctx.argv()[1].clone();
    let shard = ctx.shard(&key);
    match shard.read(&key, |o| as_str_bytes(o).map(|s| s.len())) {
        Some(Ok(len)) => ctx.client.output.write_integer(len as i64),
        Some(Err(())) => ctx.client.output.write_static(shared::WRONGTYPE_ERR),
        None => ctx.client.output.write_integer(0),
    }
}

fn incr_by(ctx: &mut CommandCtx, delta: i64) {
    let key = ctx.argv()[1].clone();
    let shard = ctx.shard(&key);
    let result = shard.write(&key, |d| {
        let current = match d.dict.get_no_step(key.as_slice()) {
            Some(obj) => match as_str_bytes(obj) {
                Ok(s) => match parse_i64(s) {
                    Some(n) => n,
                    None => return Err("ERR value is not an integer or out of range"),
                },
                Err(()) => return Err("WRONGTYPE Operation against a key holding the wrong kind of value"),
            },
            None => 0,
        };
        let Some(next) = current.checked_add(delta) else {
            return Err("ERR increment or decrement would overflow");
        };
        d.dict.insert(key.clone(), Object::new(Value::Str(next.to_string().into_bytes())));
        d.mark_dirty();
        Ok(next)
    });
    match result {
        Ok(n) => ctx.client.output.write_integer(n),
        Err(msg) => ctx.reply_error(msg),
    }
}

fn incr(ctx: &mut CommandCtx) {
    incr_by(ctx, 1);
}

fn decr(ctx: &mut CommandCtx) {
    incr_by(ctx, -1);
}

fn incrby(ctx: &mut CommandCtx) {
    match parse_i64(&ctx.argv()[2]) {
        Some(n) => incr_by(ctx, n),
        None => ctx.client.output.write_static(shared::NOT_INT_ERR),
    }
}

fn decrby(ctx: &mut CommandCtx) {
    match parse_i64(&ctx.argv()[2]) {
        Some(n) => incr_by(ctx, -n),
        None => ctx.client.output.write_static(shared::NOT_INT_ERR),
    }
}

fn mget(ctx: &mut CommandCtx) {
    let argv = ctx.argv().to_vec();
    let db = ctx.db();
    ctx.client.output.write_array_header(argv.len() - 1);
    for key in &argv[1..] {
        let shard = ctx.server.keyspace.shard(db, key);
        match shard.read(key, |o| as_str_bytes(o).map(|s| s.to_vec())) {
            Some(Ok(bytes)) => ctx.client.output.write_bulk(&bytes),
            _ => ctx.client.output.write_nil_bulk(),
        }
    }
}

fn mset(ctx: &mut CommandCtx) {
    let argv = ctx.argv().to_vec();
    if (argv.len() - 1) % 2 != 0 {
        ctx.client.output.write_static(shared::SYNTAX_ERR);
        return;
    }
    let db = ctx.db();
    let mut i = 1;
    while i < argv.len() {
        let key = argv[i].clone();
        let val = argv[i + 1].clone();
        let shard = ctx.server.keyspace.shard(db, &key);
        shard.write(&key, |d| {
            d.dict.insert(key.clone(), Object::new(Value::Str(val.clone())));
            d.expires.remove(key.as_slice());
            d.mark_dirty();
        });
        i += 2;
    }
    ctx.client.output.write_static(shared::OK);
}

fn normalize_range(len: i64, start: i64, end: i64) -> Option<(usize, usize)> {
    let clamp = |i: i64| -> i64 {
        if i < 0 {
            (len + i).max(0)
        } else {
            i
        }
    };
    let s = clamp(start).min(len);
    let e = clamp(end).min(len - 1);
    if len == 0 || s > e || s >= len {
        None
    } else {
        Some((s as usize, e as usize))
    }
}

fn getrange(ctx: &mut CommandCtx) {
    let key = ctx.argv()[1].clone();
    let (Some(start), Some(end)) = (parse_i64(&ctx.argv()[2]), parse_i64(&ctx.argv()[3])) else {
        ctx.client.output.write_static(shared::NOT_INT_ERR);
        return;
    };
    let shard = ctx.shard(&key);
    let data = shard.read(&key, |o| as_str_bytes(o).map(|s| s.to_vec()));
    match data {
        Some(Ok(bytes)) => match normalize_range(bytes.len() as i64, start, end) {
            Some((s, e)) => ctx.client.output.write_bulk(&bytes[s..=e]),
            None => ctx.client.output.write_bulk(b""),
        },
        Some(Err(())) => ctx.client.output.write_static(shared::WRONGTYPE_ERR),
        None => ctx.client.output.write_bulk(b""),
    }
}

fn setrange(ctx: &mut CommandCtx) {
    let key = ctx.argv()[1].clone();
    let Some(offset) = parse_i64(&ctx.argv()[2]) else {
        ctx.client.output.write_static(shared::NOT_INT_ERR);
        return;
    };
    if offset < 0 {
        ctx.reply_error("ERR offset is out of range");
        return;
    }
    let patch = ctx.argv()[3].clone();
    let shard = ctx.shard(&key);
    let result = shard.write(&key, |d| {
        let mut base = match d.dict.get_no_step(key.as_slice()) {
            Some(obj) => match as_str_bytes(obj) {
                Ok(s) => s.to_vec(),
                Err(()) => return Err(()),
            },
            None => Vec::new(),
        };
        let end = offset as usize + patch.len();
        if base.len() < end {
            base.resize(end, 0);
        }
        base[offset as usize..end].copy_from_slice(&patch);
        let len = base.len();
        d.dict.insert(key.clone(), Object::new(Value::Str(base)));
        d.mark_dirty();
        Ok(len)
    });
    match result {
        Ok(len) => ctx.client.output.write_integer(len as i64),
        Err(()) => ctx.client.output.write_static(shared::WRONGTYPE_ERR),
    }
}

#[cfg(test)]
mod tests {
    use super::normalize_range;

    #[test]
    fn range_clamps_negative_indices() {
        assert_eq!(normalize_range(5, -3, -1), Some((2, 4)));
        assert_eq!(normalize_range(5, 0, -1), Some((0, 4)));
        assert_eq!(normalize_range(0, 0, -1), None);
    }
}
