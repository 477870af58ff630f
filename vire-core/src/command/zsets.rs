//! Sorted-set commands (spec.md §4.6.1 "sorted sets"). `by_member` gives
//! O(1) `ZSCORE`; `by_score` (a `BTreeMap<ScoreKey, ()>`) gives ordered
//! range scans, together standing in for the skiplist + dict pairing real
//! Redis uses for the same two access patterns.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use super::{cflags, CommandCtx, CommandSpec};
use crate::object::{parse_f64, Object, ScoreKey, Value};
use crate::resp::shared;

pub fn specs() -> Vec<CommandSpec> {
    vec![
        CommandSpec { name: "ZADD", arity: -4, flags: cflags::WRITE, handler: zadd },
        CommandSpec { name: "ZREM", arity: -3, flags: cflags::WRITE, handler: zrem },
        CommandSpec { name: "ZSCORE", arity: 3, flags: cflags::READONLY, handler: zscore },
        CommandSpec { name: "ZCARD", arity: 2, flags: cflags::READONLY, handler: zcard },
        CommandSpec { name: "ZRANGE", arity: -4, flags: cflags::READONLY, handler: zrange },
        CommandSpec { name: "ZREVRANGE", arity: -4, flags: cflags::READONLY, handler: zrevrange },
        CommandSpec { name: "ZRANK", arity: 3, flags: cflags::READONLY, handler: zrank },
        CommandSpec { name: "ZINCRBY", arity: 4, flags: cflags::WRITE, handler: zincrby },
        CommandSpec { name: "ZRANGEBYSCORE", arity: -4, flags: cflags::READONLY, handler: zrangebyscore },
    ]
}

fn as_zset<'a>(obj: &'a Object) -> Result<(&'a HashMap<Vec<u8>, f64>, &'a BTreeMap<ScoreKey, ()>), ()> {
    match &obj.value {
        Value::SortedSet { by_member, by_score } => Ok((by_member, by_score)),
        _ => Err(()),
    }
}

fn zset_insert(by_member: &mut HashMap<Vec<u8>, f64>, by_score: &mut BTreeMap<ScoreKey, ()>, member: Vec<u8>, score: f64) -> bool {
    let is_new = match by_member.insert(member.clone(), score) {
        Some(old) => {
            by_score.remove(&ScoreKey { score: old, member: member.clone() });
            false
        }
        None => true,
    };
    by_score.insert(ScoreKey { score, member }, ());
    is_new
}

fn zadd(ctx: &mut CommandCtx) {
    let argv = ctx.argv().to_vec();
    let key = argv[1].clone();
    let rest = &argv[2..];
    if rest.len() % 2 != 0 {
        ctx.client.output.write_static(shared::SYNTAX_ERR);
        return;
    }
    let mut pairs = Vec::new();
    for chunk in rest.chunks(2) {
        let Some(score) = parse_f64(&chunk[0]) else {
            ctx.reply_error("ERR value is not a valid float");
            return;
        };
        pairs.push((score, chunk[1].clone()));
    }
    let shard = ctx.shard(&key);
    let result = shard.write(&key, |d| {
        let exists = d.dict.get_no_step(key.as_slice()).is_some();
        if !exists {
            d.dict.insert(key.clone(), Object::new(Value::SortedSet { by_member: HashMap::new(), by_score: BTreeMap::new() }));
        }
        let obj = d.dict.get_mut(key.as_slice()).unwrap();
        let Value::SortedSet { by_member, by_score } = &mut obj.value else {
            return Err(());
        };
        let mut added = 0i64;
        for (score, member) in pairs {
            if zset_insert(by_member, by_score, member, score) {
                added += 1;
            }
        }
        d.mark_dirty();
        Ok(added)
    });
    match result {
        Ok(n) => ctx.client.output.write_integer(n),
        Err(()) => ctx.client.output.write_static(shared::WRONGTYPE_ERR),
    }
}

fn zrem(ctx: &mut CommandCtx) {
    let argv = ctx.argv().to_vec();
    let key = argv[1].clone();
    let members = argv[2..].to_vec();
    let shard = ctx.shard(&key);
    let result = shard.write(&key, |d| {
        let Some(obj) = d.dict.get_mut(key.as_slice()) else { return Ok(0) };
        let Value::SortedSet { by_member, by_score } = &mut obj.value else { return Err(()) };
        let mut removed = 0i64;
        for m in &members {
            if let Some(score) = by_member.remove(m) {
                by_score.remove(&ScoreKey { score, member: m.clone() });
                removed += 1;
            }
        }
        if by_member.is_empty() {
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

fn zscore(ctx: &mut CommandCtx) {
    let key = ctx.argv()[1].clone();
    let member = ctx.argv()[2].clone();
    let shard = ctx.shard(&key);
    match shard.read(&key, |o| as_zset(o).map(|(bm, _)| bm.get(&member).copied())) {
        Some(Ok(Some(score))) => ctx.client.output.write_double(score),
        Some(Ok(None)) | None => ctx.client.output.write_nil_bulk(),
        Some(Err(())) => ctx.client.output.write_static(shared::WRONGTYPE_ERR),
    }
}

fn zcard(ctx: &mut CommandCtx) {
    let key = ctx.argv()[1].clone();
    let shard = ctx.shard(&key);
    match shard.read(&key, |o| as_zset(o).map(|(bm, _)| bm.len())) {
        Some(Ok(n)) => ctx.client.output.write_integer(n as i64),
        Some(Err(())) => ctx.client.output.write_static(shared::WRONGTYPE_ERR),
        None => ctx.client.output.write_integer(0),
    }
}

fn collect_ordered(ctx: &CommandCtx, key: &[u8]) -> Result<Vec<(Vec<u8>, f64)>, ()> {
    let shard = ctx.shard(key);
    match shard.read(key, |o| as_zset(o).map(|(_, bs)| bs.keys().map(|sk| (sk.member.clone(), sk.score)).collect::<Vec<_>>())) {
        Some(r) => r,
        None => Ok(Vec::new()),
    }
}

fn write_range(ctx: &mut CommandCtx, mut items: Vec<(Vec<u8>, f64)>, start: i64, stop: i64, with_scores: bool) {
    let len = items.len() as i64;
    let norm = |i: i64| if i < 0 { (len + i).max(0) } else { i };
    let s = norm(start).min(len);
    let e = norm(stop).min(len - 1);
    if s > e || len == 0 {
        ctx.client.output.write_array_header(0);
        return;
    }
    items = items[s as usize..=e as usize].to_vec();
    if with_scores {
        ctx.client.output.write_array_header(items.len() * 2);
        for (m, sc) in items {
            ctx.client.output.write_bulk(&m);
            ctx.client.output.write_double(sc);
        }
    } else {
        ctx.client.output.write_bulk_array(&items.into_iter().map(|(m, _)| m).collect::<Vec<_>>());
    }
}

fn zrange(ctx: &mut CommandCtx) {
    let argv = ctx.argv().to_vec();
    let key = argv[1].clone();
    let (Ok(start), Ok(stop)) = (std::str::from_utf8(&argv[2]).unwrap_or("").parse::<i64>(), std::str::from_utf8(&argv[3]).unwrap_or("").parse::<i64>()) else {
        ctx.client.output.write_static(shared::NOT_INT_ERR);
        return;
    };
    let with_scores = argv.len() > 4 && argv[4].eq_ignore_ascii_case(b"WITHSCORES");
    match collect_ordered(ctx, &key) {
        Ok(items) => write_range(ctx, items, start, stop, with_scores),
        Err(()) => ctx.client.output.write_static(shared::WRONGTYPE_ERR),
    }
}

fn zrevrange(ctx: &mut CommandCtx) {
    let argv = ctx.argv().to_vec();
    let key = argv[1].clone();
    let (Ok(start), Ok(stop)) = (std::str::from_utf8(&argv[2]).unwrap_or("").parse::<i64>(), std::str::from_utf8(&argv[3]).unwrap_or("").parse::<i64>()) else {
        ctx.client.output.write_static(shared::NOT_INT_ERR);
        return;
    };
    let with_scores = argv.len() > 4 && argv[4].eq_ignore_ascii_case(b"WITHSCORES");
    match collect_ordered(ctx, &key) {
        Ok(mut items) => {
            items.reverse();
            write_range(ctx, items, start, stop, with_scores)
        }
        Err(()) => ctx.client.output.write_static(shared::WRONGTYPE_ERR),
    }
}

fn zrank(ctx: &mut CommandCtx) {
    let key = ctx.argv()[1].clone();
    let member = ctx.argv()[2].clone();
    match collect_ordered(ctx, &key) {
        Ok(items) => match items.iter().position(|(m, _)| m == &member) {
            Some(idx) => ctx.client.output.write_integer(idx as i64),
            None => ctx.client.output.write_nil_bulk(),
        },
        Err(()) => ctx.client.output.write_static(shared::WRONGTYPE_ERR),
    }
}

fn zincrby(ctx: &mut CommandCtx) {
    let key = ctx.argv()[1].clone();
    let Some(delta) = parse_f64(&ctx.argv()[2]) else {
        ctx.reply_error("ERR value is not a valid float");
        return;
    };
    let member = ctx.argv()[3].clone();
    let shard = ctx.shard(&key);
    let result = shard.write(&key, |d| {
        let exists = d.dict.get_no_step(key.as_slice()).is_some();
        if !exists {
            d.dict.insert(key.clone(), Object::new(Value::SortedSet { by_member: HashMap::new(), by_score: BTreeMap::new() }));
        }
        let obj = d.dict.get_mut(key.as_slice()).unwrap();
        let Value::SortedSet { by_member, by_score } = &mut obj.value else {
            return Err(());
        };
        let new_score = by_member.get(&member).copied().unwrap_or(0.0) + delta;
        zset_insert(by_member, by_score, member.clone(), new_score);
        d.mark_dirty();
        Ok(new_score)
    });
    match result {
        Ok(score) => ctx.client.output.write_double(score),
        Err(()) => ctx.client.output.write_static(shared::WRONGTYPE_ERR),
    }
}

/// Parses a `ZRANGEBYSCORE` bound: `-inf`/`+inf`, `(score` for exclusive,
/// or a bare score for inclusive.
fn parse_score_bound(s: &[u8]) -> Option<Bound<f64>> {
    let text = std::str::from_utf8(s).ok()?;
    if text.eq_ignore_ascii_case("-inf") || text.eq_ignore_ascii_case("+inf") || text.eq_ignore_ascii_case("inf") {
        return Some(Bound::Unbounded);
    }
    if let Some(rest) = text.strip_prefix('(') {
        let v: f64 = rest.parse().ok()?;
        return Some(Bound::Excluded(v));
    }
    let v: f64 = text.parse().ok()?;
    Some(Bound::Included(v))
}

fn zrangebyscore(ctx: &mut CommandCtx) {
    let argv = ctx.argv().to_vec();
    let key = argv[1].clone();
    let Some(min) = parse_score_bound(&argv[2]) else {
        ctx.reply_error("ERR min or max is not a float");
        return;
    };
    let Some(max) = parse_score_bound(&argv[3]) else {
        ctx.reply_error("ERR min or max is not a float");
        return;
    };
    let with_scores = argv.len() > 4 && argv[4].eq_ignore_ascii_case(b"WITHSCORES");
    match collect_ordered(ctx, &key) {
        Ok(items) => {
            let in_min = |score: f64| match min {
                Bound::Unbounded => true,
                Bound::Included(v) => score >= v,
                Bound::Excluded(v) => score > v,
            };
            let in_max = |score: f64| match max {
                Bound::Unbounded => true,
                Bound::Included(v) => score <= v,
                Bound::Excluded(v) => score < v,
            };
            let filtered: Vec<_> = items.into_iter().filter(|(_, s)| in_min(*s) && in_max(*s)).collect();
            let len = filtered.len() as i64;
            write_range(ctx, filtered, 0, len - 1, with_scores);
        }
        Err(()) => ctx.client.output.write_static(shared::WRONGTYPE_ERR),
    }
}
