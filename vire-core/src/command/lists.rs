//! List commands, including the blocking pop variants (spec.md §4.6.1
//! "lists" and "blocking").

use std::collections::VecDeque;

use super::{arg_str, cflags, CommandCtx, CommandSpec};
use crate::object::{parse_i64, Object, Value};
use crate::resp::shared;

pub fn specs() -> Vec<CommandSpec> {
    vec![
        CommandSpec { name: "RPUSH", arity: -3, flags: cflags::WRITE, handler: rpush },
        CommandSpec { name: "LPUSH", arity: -3, flags: cflags::WRITE, handler: lpush },
        CommandSpec { name: "RPOP", arity: -2, flags: cflags::WRITE, handler: rpop },
        CommandSpec { name: "LPOP", arity: -2, flags: cflags::WRITE, handler: lpop },
        CommandSpec { name: "LLEN", arity: 2, flags: cflags::READONLY, handler: llen },
        CommandSpec { name: "LRANGE", arity: 4, flags: cflags::READONLY, handler: lrange },
        CommandSpec { name: "LINDEX", arity: 3, flags: cflags::READONLY, handler: lindex },
        CommandSpec { name: "LSET", arity: 4, flags: cflags::WRITE, handler: lset },
        CommandSpec { name: "LREM", arity: 4, flags: cflags::WRITE, handler: lrem },
        CommandSpec { name: "LTRIM", arity: 4, flags: cflags::WRITE, handler: ltrim },
        CommandSpec { name: "BLPOP", arity: -3, flags: cflags::WRITE | cflags::BLOCKING, handler: blpop },
        CommandSpec { name: "BRPOP", arity: -3, flags: cflags::WRITE | cflags::BLOCKING, handler: brpop },
    ]
}

fn as_list<'a>(obj: &'a Object) -> Result<&'a VecDeque<Vec<u8>>, ()> {
    match &obj.value {
        Value::List(l) => Ok(l),
        _ => Err(()),
    }
}

fn push(ctx: &mut CommandCtx, front: bool) {
    let argv = ctx.argv().to_vec();
    let key = argv[1].clone();
    let items = argv[2..].to_vec();
    let shard = ctx.shard(&key);
    let result = shard.write(&key, |d| {
        let exists = d.dict.get_no_step(key.as_slice()).is_some();
        if !exists {
            d.dict.insert(key.clone(), Object::new(Value::List(VecDeque::new())));
        }
        let obj = d.dict.get_mut(key.as_slice()).unwrap();
        let Value::List(list) = &mut obj.value else {
            return Err(());
        };
        for item in &items {
            if front {
                list.push_front(item.clone());
            } else {
                list.push_back(item.clone());
            }
        }
        let len = list.len();
        d.mark_dirty();
        d.notify_ready(&key);
        Ok(len)
    });
    match result {
        Ok(len) => ctx.client.output.write_integer(len as i64),
        Err(()) => ctx.client.output.write_static(shared::WRONGTYPE_ERR),
    }
}

fn rpush(ctx: &mut CommandCtx) {
    push(ctx, false);
}

fn lpush(ctx: &mut CommandCtx) {
    push(ctx, true);
}

fn pop_n(ctx: &mut CommandCtx, front: bool) {
    let argv = ctx.argv().to_vec();
    let key = argv[1].clone();
    let count: usize = if argv.len() > 2 {
        match arg_str(&argv, 2).parse() {
            Ok(n) => n,
            Err(_) => {
                ctx.client.output.write_static(shared::NOT_INT_ERR);
                return;
            }
        }
    } else {
        1
    };
    let shard = ctx.shard(&key);
    let result = shard.write(&key, |d| {
        let Some(obj) = d.dict.get_mut(key.as_slice()) else { return Ok(Vec::new()) };
        let Value::List(list) = &mut obj.value else { return Err(()) };
        let mut out = Vec::new();
        for _ in 0..count {
            let popped = if front { list.pop_front() } else { list.pop_back() };
            match popped {
                Some(v) => out.push(v),
                None => break,
            }
        }
        let empty = list.is_empty();
        if empty {
            d.dict.remove(key.as_slice());
        }
        if !out.is_empty() {
            d.mark_dirty();
        }
        Ok(out)
    });
    match result {
        Err(()) => ctx.client.output.write_static(shared::WRONGTYPE_ERR),
        Ok(out) if out.is_empty() => {
            ctx.prevent_propagation();
            if argv.len() > 2 {
                ctx.client.output.write_nil_array();
            } else {
                ctx.client.output.write_nil_bulk();
            }
        }
        Ok(out) => {
            if argv.len() > 2 {
                ctx.client.output.write_bulk_array(&out);
            } else {
                ctx.client.output.write_bulk(&out[0]);
            }
        }
    }
}

fn rpop(ctx: &mut CommandCtx) {
    pop_n(ctx, false);
}

fn lpop(ctx: &mut CommandCtx) {
    pop_n(ctx, true);
}

fn llen(ctx: &mut CommandCtx) {
    let key = ctx.argv()[1].clone();
    let shard = ctx.shard(&key);
    match shard.read(&key, |o| as_list(o).map(|l| l.len())) {
        Some(Ok(len)) => ctx.client.output.write_integer(len as i64),
        Some(Err(())) => ctx.client.output.write_static(shared::WRONGTYPE_ERR),
        None => ctx.client.output.write_integer(0),
    }
}

fn norm_index(len: i64, idx: i64) -> i64 {
    if idx < 0 {
        len + idx
    } else {
        idx
    }
}

fn lrange(ctx: &mut CommandCtx) {
    let key = ctx.argv()[1].clone();
    let (Some(start), Some(stop)) = (parse_i64(&ctx.argv()[2]), parse_i64(&ctx.argv()[3])) else {
        ctx.client.output.write_static(shared::NOT_INT_ERR);
        return;
    };
    let shard = ctx.shard(&key);
    let result = shard.read(&key, |o| as_list(o).map(|l| l.iter().cloned().collect::<Vec<_>>()));
    match result {
        Some(Ok(items)) => {
            let len = items.len() as i64;
            let s = norm_index(len, start).max(0);
            let e = norm_index(len, stop).min(len - 1);
            if s > e || len == 0 {
                ctx.client.output.write_array_header(0);
            } else {
                ctx.client.output.write_bulk_array(&items[s as usize..=e as usize]);
            }
        }
        Some(Err(())) => ctx.client.output.write_static(shared::WRONGTYPE_ERR),
        None => ctx.client.output.write_array_header(0),
    }
}

fn lindex(ctx: &mut CommandCtx) {
    let key = ctx.argv()[1].clone();
    let Some(idx) = parse_i64(&ctx.argv()[2]) else {
        ctx.client.output.write_static(shared::NOT_INT_ERR);
        return;
    };
    let shard = ctx.shard(&key);
    let result = shard.read(&key, |o| as_list(o).map(|l| {
        let i = norm_index(l.len() as i64, idx);
        if i < 0 || i as usize >= l.len() {
            None
        } else {
            Some(l[i as usize].clone())
        }
    }));
    match result {
        Some(Ok(Some(v))) => ctx.client.output.write_bulk(&v),
        Some(Ok(None)) | None => ctx.client.output.write_nil_bulk(),
        Some(Err(())) => ctx.client.output.write_static(shared::WRONGTYPE_ERR),
    }
}

fn lset(ctx: &mut CommandCtx) {
    let key = ctx.argv()[1].clone();
    let Some(idx) = parse_i64(&ctx.argv()[2]) else {
        ctx.client.output.write_static(shared::NOT_INT_ERR);
        return;
    };
    let val = ctx.argv()[3].clone();
    let shard = ctx.shard(&key);
    let result = shard.write(&key, |d| {
        let Some(obj) = d.dict.get_mut(key.as_slice()) else { return Err("ERR no such key") };
        let Value::List(list) = &mut obj.value else {
            return Err("WRONGTYPE Operation against a key holding the wrong kind of value");
        };
        let i = norm_index(list.len() as i64, idx);
        if i < 0 || i as usize >= list.len() {
            return Err("ERR index out of range");
        }
        list[i as usize] = val.clone();
        d.mark_dirty();
        Ok(())
    });
    match result {
        Ok(()) => ctx.client.output.write_static(shared::OK),
        Err(msg) => ctx.reply_error(msg),
    }
}

fn lrem(ctx: &mut CommandCtx) {
    let key = ctx.argv()[1].clone();
    let Some(count) = parse_i64(&ctx.argv()[2]) else {
        ctx.client.output.write_static(shared::NOT_INT_ERR);
        return;
    };
    let target = ctx.argv()[3].clone();
    let shard = ctx.shard(&key);
    let result = shard.write(&key, |d| {
        let Some(obj) = d.dict.get_mut(key.as_slice()) else { return Ok(0) };
        let Value::List(list) = &mut obj.value else { return Err(()) };
        let mut removed = 0i64;
        if count >= 0 {
            let limit = if count == 0 { i64::MAX } else { count };
            let mut i = 0;
            while i < list.len() && removed < limit {
                if list[i] == target {
                    list.remove(i);
                    removed += 1;
                } else {
                    i += 1;
                }
            }
        } else {
            let limit = -count;
            let mut i = list.len();
            while i > 0 && removed < limit {
                i -= 1;
                if list[i] == target {
                    list.remove(i);
                    removed += 1;
                }
            }
        }
        if list.is_empty() {
            d.dict.remove(key.as_slice());
        }
        if removed > 0 {
            d.mark_dirty();
        }
        Ok(removed)
    });
    match result {
        Ok(n) => {
            if n == 0 {
                ctx.prevent_propagation();
            }
            ctx.client.output.write_integer(n);
        }
        Err(()) => ctx.client.output.write_static(shared::WRONGTYPE_ERR),
    }
}

fn ltrim(ctx: &mut CommandCtx) {
    let key = ctx.argv()[1].clone();
    let (Some(start), Some(stop)) = (parse_i64(&ctx.argv()[2]), parse_i64(&ctx.argv()[3])) else {
        ctx.client.output.write_static(shared::NOT_INT_ERR);
        return;
    };
    let shard = ctx.shard(&key);
    let result = shard.write(&key, |d| {
        let Some(obj) = d.dict.get_mut(key.as_slice()) else { return Ok(()) };
        let Value::List(list) = &mut obj.value else { return Err(()) };
        let len = list.len() as i64;
        let s = norm_index(len, start).max(0);
        let e = norm_index(len, stop).min(len - 1);
        if s > e || len == 0 {
            list.clear();
        } else {
            let kept: VecDeque<_> = list.iter().skip(s as usize).take((e - s + 1) as usize).cloned().collect();
            *list = kept;
        }
        if list.is_empty() {
            d.dict.remove(key.as_slice());
        }
        d.mark_dirty();
        Ok(())
    });
    match result {
        Ok(()) => ctx.client.output.write_static(shared::OK),
        Err(()) => ctx.client.output.write_static(shared::WRONGTYPE_ERR),
    }
}

/// `BLPOP`/`BRPOP` try the immediate pop path first; if every listed key is
/// empty, `ctx.client.blocked` is set and the worker loop takes over:
/// registering this client against each key in the owning shards'
/// `ShardData::blocking_keys`, and deferring the reply until one of them
/// goes ready (`notify_ready`) or the timeout elapses (spec.md §4.6).
fn blocking_pop(ctx: &mut CommandCtx, front: bool) {
    let argv = ctx.argv().to_vec();
    let keys = &argv[1..argv.len() - 1];
    let db = ctx.db();
    for key in keys {
        let shard = ctx.server.keyspace.shard(db, key);
        let popped = shard.write(key, |d| {
            let Some(obj) = d.dict.get_mut(key.as_slice()) else { return None };
            let Value::List(list) = &mut obj.value else { return None };
            let v = if front { list.pop_front() } else { list.pop_back() };
            if list.is_empty() {
                d.dict.remove(key.as_slice());
            }
            if v.is_some() {
                d.mark_dirty();
            }
            v
        });
        if let Some(v) = popped {
            ctx.client.output.write_bulk_array(&[key.clone(), v]);
            return;
        }
    }
    let Some(timeout) = crate::object::parse_f64(&argv[argv.len() - 1]) else {
        ctx.client.output.write_static(shared::NOT_INT_ERR);
        return;
    };
    if timeout < 0.0 {
        ctx.reply_error("ERR timeout is negative");
        return;
    }
    let deadline_ms = if timeout == 0.0 {
        None
    } else {
        Some(crate::db::expire::now_ms() + (timeout * 1000.0) as i64)
    };
    ctx.prevent_propagation();
    ctx.client.blocked = Some(crate::client::BlockedState { keys: keys.to_vec(), front, deadline_ms });
}

fn blpop(ctx: &mut CommandCtx) {
    blocking_pop(ctx, true);
}

fn brpop(ctx: &mut CommandCtx) {
    blocking_pop(ctx, false);
}
