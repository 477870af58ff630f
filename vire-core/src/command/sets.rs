//! Set commands, including the multi-key algebra ops (spec.md §4.6.1
//! "sets"). `SPOP` propagates as `SREM` of the popped members (spec.md
//! §4.6's propagation escape hatch) since the random choice itself isn't
//! deterministic across a replay.

use std::collections::HashSet;

use super::{arg_str, cflags, CommandCtx, CommandSpec};
use crate::object::{Object, Value};
use crate::resp::shared;

pub fn specs() -> Vec<CommandSpec> {
    vec![
        CommandSpec { name: "SADD", arity: -3, flags: cflags::WRITE, handler: sadd },
        CommandSpec { name: "SREM", arity: -3, flags: cflags::WRITE, handler: srem },
        CommandSpec { name: "SMEMBERS", arity: 2, flags: cflags::READONLY, handler: smembers },
        CommandSpec { name: "SISMEMBER", arity: 3, flags: cflags::READONLY, handler: sismember },
        CommandSpec { name: "SCARD", arity: 2, flags: cflags::READONLY, handler: scard },
        CommandSpec { name: "SPOP", arity: -2, flags: cflags::WRITE, handler: spop },
        CommandSpec { name: "SINTER", arity: -2, flags: cflags::READONLY, handler: sinter },
        CommandSpec { name: "SUNION", arity: -2, flags: cflags::READONLY, handler: sunion },
        CommandSpec { name: "SDIFF", arity: -2, flags: cflags::READONLY, handler: sdiff },
        CommandSpec { name: "SINTERSTORE", arity: -3, flags: cflags::WRITE, handler: sinterstore },
        CommandSpec { name: "SUNIONSTORE", arity: -3, flags: cflags::WRITE, handler: sunionstore },
        CommandSpec { name: "SDIFFSTORE", arity: -3, flags: cflags::WRITE, handler: sdiffstore },
    ]
}

fn as_set<'a>(obj: &'a Object) -> Result<&'a HashSet<Vec<u8>>, ()> {
    match &obj.value {
        Value::Set(s) => Ok(s),
        _ => Err(()),
    }
}

fn sadd(ctx: &mut CommandCtx) {
    let argv = ctx.argv().to_vec();
    let key = argv[1].clone();
    let members = argv[2..].to_vec();
    let shard = ctx.shard(&key);
    let result = shard.write(&key, |d| {
        let exists = d.dict.get_no_step(key.as_slice()).is_some();
        if !exists {
            d.dict.insert(key.clone(), Object::new(Value::Set(HashSet::new())));
        }
        let obj = d.dict.get_mut(key.as_slice()).unwrap();
        let Value::Set(set) = &mut obj.value else {
            return Err(());
        };
        let mut added = 0i64;
        for m in &members {
            if set.insert(m.clone()) {
                added += 1;
            }
        }
        if added > 0 {
            d.mark_dirty();
        }
        Ok(added)
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

fn srem(ctx: &mut CommandCtx) {
    let argv = ctx.argv().to_vec();
    let key = argv[1].clone();
    let members = argv[2..].to_vec();
    let shard = ctx.shard(&key);
    let result = shard.write(&key, |d| {
        let Some(obj) = d.dict.get_mut(key.as_slice()) else { return Ok(0) };
        let Value::Set(set) = &mut obj.value else { return Err(()) };
        let mut removed = 0i64;
        for m in &members {
            if set.remove(m) {
                removed += 1;
            }
        }
        if set.is_empty() {
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

fn smembers(ctx: &mut CommandCtx) {
    let key = ctx.argv()[1].clone();
    let shard = ctx.shard(&key);
    match shard.read(&key, |o| as_set(o).map(|s| s.iter().cloned().collect::<Vec<_>>())) {
        Some(Ok(items)) => ctx.client.output.write_bulk_array(&items),
        Some(Err(())) => ctx.client.output.write_static(shared::WRONGTYPE_ERR),
        None => ctx.client.output.write_array_header(0),
    }
}

fn sismember(ctx: &mut CommandCtx) {
    let key = ctx.argv()[1].clone();
    let member = ctx.argv()[2].clone();
    let shard = ctx.shard(&key);
    match shard.read(&key, |o| as_set(o).map(|s| s.contains(&member))) {
        Some(Ok(true)) => ctx.client.output.write_integer(1),
        Some(Ok(false)) | None => ctx.client.output.write_integer(0),
        Some(Err(())) => ctx.client.output.write_static(shared::WRONGTYPE_ERR),
    }
}

fn scard(ctx: &mut CommandCtx) {
    let key = ctx.argv()[1].clone();
    let shard = ctx.shard(&key);
    match shard.read(&key, |o| as_set(o).map(|s| s.len())) {
        Some(Ok(n)) => ctx.client.output.write_integer(n as i64),
        Some(Err(())) => ctx.client.output.write_static(shared::WRONGTYPE_ERR),
        None => ctx.client.output.write_integer(0),
    }
}

fn spop(ctx: &mut CommandCtx) {
    let argv = ctx.argv().to_vec();
    let key = argv[1].clone();
    let count: Option<usize> = if argv.len() > 2 { arg_str(&argv, 2).parse().ok() } else { None };
    let shard = ctx.shard(&key);
    let result = shard.write(&key, |d| {
        let Some(obj) = d.dict.get_mut(key.as_slice()) else { return Ok(Vec::new()) };
        let Value::Set(set) = &mut obj.value else { return Err(()) };
        let n = count.unwrap_or(1).min(set.len());
        let picked: Vec<Vec<u8>> = set.iter().take(n).cloned().collect();
        for m in &picked {
            set.remove(m);
        }
        if set.is_empty() {
            d.dict.remove(key.as_slice());
        }
        if !picked.is_empty() {
            d.mark_dirty();
        }
        Ok(picked)
    });
    match result {
        Err(()) => ctx.client.output.write_static(shared::WRONGTYPE_ERR),
        Ok(picked) if picked.is_empty() => {
            ctx.prevent_propagation();
            if argv.len() > 2 {
                ctx.client.output.write_array_header(0);
            } else {
                ctx.client.output.write_nil_bulk();
            }
        }
        Ok(picked) => {
            let mut srem_cmd = vec![b"SREM".to_vec(), key.clone()];
            srem_cmd.extend(picked.iter().cloned());
            ctx.also_propagate(srem_cmd);
            if argv.len() > 2 {
                ctx.client.output.write_bulk_array(&picked);
            } else {
                ctx.client.output.write_bulk(&picked[0]);
            }
        }
    }
}

fn read_sets(ctx: &CommandCtx, keys: &[Vec<u8>]) -> Result<Vec<HashSet<Vec<u8>>>, ()> {
    let db = ctx.db();
    let mut sets = Vec::with_capacity(keys.len());
    for key in keys {
        let shard = ctx.server.keyspace.shard(db, key);
        let s = shard.read(key, |o| as_set(o).cloned());
        match s {
            Some(Ok(set)) => sets.push(set),
            Some(Err(())) => return Err(()),
            None => sets.push(HashSet::new()),
        }
    }
    Ok(sets)
}

fn set_algebra(ctx: &mut CommandCtx, keys: &[Vec<u8>], op: fn(&[HashSet<Vec<u8>>]) -> HashSet<Vec<u8>>) -> Option<Vec<Vec<u8>>> {
    match read_sets(ctx, keys) {
        Ok(sets) => Some(op(&sets).into_iter().collect()),
        Err(()) => {
            ctx.client.output.write_static(shared::WRONGTYPE_ERR);
            None
        }
    }
}

fn intersect_all(sets: &[HashSet<Vec<u8>>]) -> HashSet<Vec<u8>> {
    let mut it = sets.iter();
    let Some(first) = it.next() else { return HashSet::new() };
    let mut acc = first.clone();
    for s in it {
        acc.retain(|m| s.contains(m));
    }
    acc
}

fn union_all(sets: &[HashSet<Vec<u8>>]) -> HashSet<Vec<u8>> {
    let mut acc = HashSet::new();
    for s in sets {
        acc.extend(s.iter().cloned());
    }
    acc
}

fn diff_all(sets: &[HashSet<Vec<u8>>]) -> HashSet<Vec<u8>> {
    let mut it = sets.iter();
    let Some(first) = it.next() else { return HashSet::new() };
    let mut acc = first.clone();
    for s in it {
        acc.retain(|m| !s.contains(m));
    }
    acc
}

fn sinter(ctx: &mut CommandCtx) {
    let keys = ctx.argv()[1..].to_vec();
    if let Some(out) = set_algebra(ctx, &keys, intersect_all) {
        ctx.client.output.write_bulk_array(&out);
    }
}

fn sunion(ctx: &mut CommandCtx) {
    let keys = ctx.argv()[1..].to_vec();
    if let Some(out) = set_algebra(ctx, &keys, union_all) {
        ctx.client.output.write_bulk_array(&out);
    }
}

fn sdiff(ctx: &mut CommandCtx) {
    let keys = ctx.argv()[1..].to_vec();
    if let Some(out) = set_algebra(ctx, &keys, diff_all) {
        ctx.client.output.write_bulk_array(&out);
    }
}

fn store_result(ctx: &mut CommandCtx, dest: &[u8], members: Vec<Vec<u8>>) {
    let shard = ctx.shard(dest);
    let len = members.len();
    shard.write(dest, |d| {
        if members.is_empty() {
            d.dict.remove(dest);
        } else {
            d.dict.insert(dest.to_vec(), Object::new(Value::Set(members.into_iter().collect())));
        }
        d.mark_dirty();
    });
    ctx.client.output.write_integer(len as i64);
}

fn sinterstore(ctx: &mut CommandCtx) {
    let dest = ctx.argv()[1].clone();
    let keys = ctx.argv()[2..].to_vec();
    if let Some(out) = set_algebra(ctx, &keys, intersect_all) {
        store_result(ctx, &dest, out);
    }
}

fn sunionstore(ctx: &mut CommandCtx) {
    let dest = ctx.argv()[1].clone();
    let keys = ctx.argv()[2..].to_vec();
    if let Some(out) = set_algebra(ctx, &keys, union_all) {
        store_result(ctx, &dest, out);
    }
}

fn sdiffstore(ctx: &mut CommandCtx) {
    let dest = ctx.argv()[1].clone();
    let keys = ctx.argv()[2..].to_vec();
    if let Some(out) = set_algebra(ctx, &keys, diff_all) {
        store_result(ctx, &dest, out);
    }
}
