//! Hash commands (spec.md §4.6.1 "hashes").

use std::collections::HashMap;

use super::{cflags, CommandCtx, CommandSpec};
use crate::object::{parse_i64, Object, Value};
use crate::resp::shared;

pub fn specs() -> Vec<CommandSpec> {
    vec![
        CommandSpec { name: "HSET", arity: -4, flags: cflags::WRITE, handler: hset },
        CommandSpec { name: "HGET", arity: 3, flags: cflags::READONLY, handler: hget },
        CommandSpec { name: "HDEL", arity: -3, flags: cflags::WRITE, handler: hdel },
        CommandSpec { name: "HGETALL", arity: 2, flags: cflags::READONLY, handler: hgetall },
        CommandSpec { name: "HKEYS", arity: 2, flags: cflags::READONLY, handler: hkeys },
        CommandSpec { name: "HVALS", arity: 2, flags: cflags::READONLY, handler: hvals },
        CommandSpec { name: "HLEN", arity: 2, flags: cflags::READONLY, handler: hlen },
        CommandSpec { name: "HEXISTS", arity: 3, flags: cflags::READONLY, handler: hexists },
        CommandSpec { name: "HINCRBY", arity: 4, flags: cflags::WRITE, handler: hincrby },
        CommandSpec { name: "HMGET", arity: -3, flags: cflags::READONLY, handler: hmget },
        CommandSpec { name: "HMSET", arity: -4, flags: cflags::WRITE, handler: hmset },
    ]
}

fn as_hash<'a>(obj: &'a Object) -> Result<&'a HashMap<Vec<u8>, Vec<u8>>, ()> {
    match &obj.value {
        Value::Hash(h) => Ok(h),
        _ => Err(()),
    }
}

fn hset_generic(ctx: &mut CommandCtx, reply_count_new_only: bool) {
    let argv = ctx.argv().to_vec();
    let key = argv[1].clone();
    let pairs = &argv[2..];
    if pairs.len() % 2 != 0 {
        ctx.client.output.write_static(shared::SYNTAX_ERR);
        return;
    }
    let shard = ctx.shard(&key);
    let result = shard.write(&key, |d| {
        let exists = d.dict.get_no_step(key.as_slice()).is_some();
        if !exists {
            d.dict.insert(key.clone(), Object::new(Value::Hash(HashMap::new())));
        }
        let obj = d.dict.get_mut(key.as_slice()).unwrap();
        let Value::Hash(map) = &mut obj.value else {
            return Err(());
        };
        let mut added = 0i64;
        let mut i = 0;
        while i < pairs.len() {
            if map.insert(pairs[i].clone(), pairs[i + 1].clone()).is_none() {
                added += 1;
            }
            i += 2;
        }
        d.mark_dirty();
        Ok(added)
    });
    match result {
        Ok(added) => {
            if reply_count_new_only {
                ctx.client.output.write_integer(added);
            } else {
                ctx.client.output.write_static(shared::OK);
            }
        }
        Err(()) => ctx.client.output.write_static(shared::WRONGTYPE_ERR),
    }
}

fn hset(ctx: &mut CommandCtx) {
    hset_generic(ctx, true);
}

fn hmset(ctx: &mut CommandCtx) {
    hset_generic(ctx, false);
}

fn hget(ctx: &mut CommandCtx) {
    let key = ctx.argv()[1].clone();
    let field = ctx.argv()[2].clone();
    let shard = ctx.shard(&key);
    match shard.read(&key, |o| as_hash(o).map(|h| h.get(&field).cloned())) {
        Some(Ok(Some(v))) => ctx.client.output.write_bulk(&v),
        Some(Ok(None)) | None => ctx.client.output.write_nil_bulk(),
        Some(Err(())) => ctx.client.output.write_static(shared::WRONGTYPE_ERR),
    }
}

fn hdel(ctx: &mut CommandCtx) {
    let argv = ctx.argv().to_vec();
    let key = argv[1].clone();
    let fields = argv[2..].to_vec();
    let shard = ctx.shard(&key);
    let result = shard.write(&key, |d| {
        let Some(obj) = d.dict.get_mut(key.as_slice()) else { return Ok(0) };
        let Value::Hash(map) = &mut obj.value else { return Err(()) };
        let mut removed = 0i64;
        for f in &fields {
            if map.remove(f).is_some() {
                removed += 1;
            }
        }
        if map.is_empty() {
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

fn hgetall(ctx: &mut CommandCtx) {
    let key = ctx.argv()[1].clone();
    let shard = ctx.shard(&key);
    match shard.read(&key, |o| as_hash(o).map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect::<Vec<_>>())) {
        Some(Ok(pairs)) => {
            ctx.client.output.write_array_header(pairs.len() * 2);
            for (k, v) in pairs {
                ctx.client.output.write_bulk(&k);
                ctx.client.output.write_bulk(&v);
            }
        }
        Some(Err(())) => ctx.client.output.write_static(shared::WRONGTYPE_ERR),
        None => ctx.client.output.write_array_header(0),
    }
}

fn hkeys(ctx: &mut CommandCtx) {
    let key = ctx.argv()[1].clone();
    let shard = ctx.shard(&key);
    match shard.read(&key, |o| as_hash(o).map(|h| h.keys().cloned().collect::<Vec<_>>())) {
        Some(Ok(keys)) => ctx.client.output.write_bulk_array(&keys),
        Some(Err(())) => ctx.client.output.write_static(shared::WRONGTYPE_ERR),
        None => ctx.client.output.write_array_header(0),
    }
}

fn hvals(ctx: &mut CommandCtx) {
    let key = ctx.argv()[1].clone();
    let shard = ctx.shard(&key);
    match shard.read(&key, |o| as_hash(o).map(|h| h.values().cloned().collect::<Vec<_>>())) {
        Some(Ok(vals)) => ctx.client.output.write_bulk_array(&vals),
        Some(Err(())) => ctx.client.output.write_static(shared::WRONGTYPE_ERR),
        None => ctx.client.output.write_array_header(0),
    }
}

fn hlen(ctx: &mut CommandCtx) {
    let key = ctx.argv()[1].clone();
    let shard = ctx.shard(&key);
    match shard.read(&key, |o| as_hash(o).map(|h| h.len())) {
        Some(Ok(n)) => ctx.client.output.write_integer(n as i64),
        Some(Err(())) => ctx.client.output.write_static(shared::WRONGTYPE_ERR),
        None => ctx.client.output.write_integer(0),
    }
}

fn hexists(ctx: &mut CommandCtx) {
    let key = ctx.argv()[1].clone();
    let field = ctx.argv()[2].clone();
    let shard = ctx.shard(&key);
    match shard.read(&key, |o| as_hash(o).map(|h| h.contains_key(&field))) {
        Some(Ok(true)) => ctx.client.output.write_integer(1),
        Some(Ok(false)) | None => ctx.client.output.write_integer(0),
        Some(Err(())) => ctx.client.output.write_static(shared::WRONGTYPE_ERR),
    }
}

fn hincrby(ctx: &mut CommandCtx) {
    let key = ctx.argv()[1].clone();
    let field = ctx.argv()[2].clone();
    let Some(delta) = parse_i64(&ctx.argv()[3]) else {
        ctx.client.output.write_static(shared::NOT_INT_ERR);
        return;
    };
    let shard = ctx.shard(&key);
    let result = shard.write(&key, |d| {
        let exists = d.dict.get_no_step(key.as_slice()).is_some();
        if !exists {
            d.dict.insert(key.clone(), Object::new(Value::Hash(HashMap::new())));
        }
        let obj = d.dict.get_mut(key.as_slice()).unwrap();
        let Value::Hash(map) = &mut obj.value else {
            return Err("WRONGTYPE Operation against a key holding the wrong kind of value");
        };
        let current = match map.get(&field) {
            Some(v) => parse_i64(v).ok_or("ERR hash value is not an integer")?,
            None => 0,
        };
        let Some(next) = current.checked_add(delta) else {
            return Err("ERR increment or decrement would overflow");
        };
        map.insert(field.clone(), next.to_string().into_bytes());
        d.mark_dirty();
        Ok(next)
    });
    match result {
        Ok(n) => ctx.client.output.write_integer(n),
        Err(msg) => ctx.reply_error(msg),
    }
}

fn hmget(ctx: &mut CommandCtx) {
    let key = ctx.argv()[1].clone();
    let fields = ctx.argv()[2..].to_vec();
    let shard = ctx.shard(&key);
    let data = shard.read(&key, |o| as_hash(o).map(|h| h.clone()));
    ctx.client.output.write_array_header(fields.len());
    match data {
        Some(Ok(map)) => {
            for f in &fields {
                match map.get(f) {
                    Some(v) => ctx.client.output.write_bulk(v),
                    None => ctx.client.output.write_nil_bulk(),
                }
            }
        }
        _ => {
            for _ in &fields {
                ctx.client.output.write_nil_bulk();
            }
        }
    }
}
