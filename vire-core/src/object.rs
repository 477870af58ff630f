//! The universal value type stored in a shard's dict.
//!
//! Grounded on the `VersionedEntry<S>` wrapper in
//! `examples/lithair-lithair/lithair-core/src/engine/scc2_engine.rs` (a
//! `version` + `data` pair bumped on every mutation) generalized from "one
//! opaque application state per key" to "one of five Redis-shaped
//! collection kinds per key", and on the encoding-variant language in
//! spec.md §3 ("kind ∈ {string, list, set, hash, sorted-set}; encoding
//! (e.g. int, raw-bytes, packed-list, skiplist+dict, intset, hashtable,
//! quicklist)").

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A value as stored in a shard's dict.
///
/// `version` is bumped by the owning shard's write barrier whenever the
/// persistence engine's dump cursor has passed this key without yet
/// serializing it for the current snapshot pass (spec.md §4.5, "write
/// barriers"). `access_time` backs LRU eviction sampling (spec.md §4.4).
#[derive(Debug, Clone)]
pub struct Object {
    pub value: Value,
    pub version: u64,
    pub access_time_secs: u32,
}

impl Object {
    pub fn new(value: Value) -> Self {
        Self { value, version: 0, access_time_secs: now_secs() }
    }

    pub fn touch(&mut self) {
        self.access_time_secs = now_secs();
    }

    pub fn kind(&self) -> Kind {
        self.value.kind()
    }

    pub fn encoding(&self) -> Encoding {
        self.value.encoding()
    }
}

pub fn now_secs() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as u32
}

/// The five value kinds a key can hold (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    String,
    List,
    Set,
    Hash,
    SortedSet,
}

impl Kind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Kind::String => "string",
            Kind::List => "list",
            Kind::Set => "set",
            Kind::Hash => "hash",
            Kind::SortedSet => "zset",
        }
    }
}

/// Concrete on-heap representation. The "encoding" a key reports to
/// `OBJECT ENCODING` is derived from which variant and, for strings,
/// whether the payload parses as a 64-bit integer.
#[derive(Debug, Clone)]
pub enum Value {
    /// Either a small integer (`Encoding::Int`) or a raw byte string
    /// (`Encoding::Raw`/`Embstr`, distinguished only by length for
    /// reporting purposes — both are plain `Vec<u8>` here).
    Str(Vec<u8>),
    /// Packed for small lists, promoted to a plain deque ("quicklist") once
    /// either the element count or an individual element exceeds the
    /// configured packing thresholds.
    List(VecDeque<Vec<u8>>),
    /// Small sets of integers use `IntSet` bookkeeping; anything else (or
    /// once large) is a `HashTable`-encoded `HashSet`.
    Set(HashSet<Vec<u8>>),
    Hash(HashMap<Vec<u8>, Vec<u8>>),
    /// Sorted by score then member; a `BTreeMap` keyed on `(OrderedF64,
    /// member)` stands in for the skiplist + dict pairing real Redis uses
    /// (skiplist for range scans, dict for O(1) `ZSCORE`) — this structure
    /// gives both for free via an auxiliary score-lookup map.
    SortedSet { by_member: HashMap<Vec<u8>, f64>, by_score: BTreeMap<ScoreKey, ()> },
}

/// Sortable `(score, member)` key for the sorted-set's range index.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreKey {
    pub score: f64,
    pub member: Vec<u8>,
}

impl Eq for ScoreKey {}
impl PartialOrd for ScoreKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ScoreKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score
            .partial_cmp(&other.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| self.member.cmp(&other.member))
    }
}

/// Collection encodings a key can report via `OBJECT ENCODING` (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Int,
    Raw,
    Embstr,
    IntSet,
    PackedList,
    Quicklist,
    HashTable,
    SkipList,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Int => "int",
            Encoding::Raw => "raw",
            Encoding::Embstr => "embstr",
            Encoding::IntSet => "intset",
            Encoding::PackedList => "packed_list",
            Encoding::Quicklist => "quicklist",
            Encoding::HashTable => "hashtable",
            Encoding::SkipList => "skiplist",
        }
    }
}

/// A "big key" per spec.md §4.5's definition: skiplist, hashtable, or
/// multi-node packed-list encodings require chunked dumping instead of a
/// single-tick serialize.
pub const PACKED_LIST_MAX_LEN: usize = 128;
pub const EMBSTR_MAX_LEN: usize = 44;

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Value::Str(_) => Kind::String,
            Value::List(_) => Kind::List,
            Value::Set(_) => Kind::Set,
            Value::Hash(_) => Kind::Hash,
            Value::SortedSet { .. } => Kind::SortedSet,
        }
    }

    pub fn encoding(&self) -> Encoding {
        match self {
            Value::Str(s) => {
                if parse_i64(s).is_some() {
                    Encoding::Int
                } else if s.len() <= EMBSTR_MAX_LEN {
                    Encoding::Embstr
                } else {
                    Encoding::Raw
                }
            }
            Value::List(l) => {
                if l.len() <= PACKED_LIST_MAX_LEN {
                    Encoding::PackedList
                } else {
                    Encoding::Quicklist
                }
            }
            Value::Set(s) => {
                if s.iter().all(|m| parse_i64(m).is_some()) && s.len() <= 512 {
                    Encoding::IntSet
                } else {
                    Encoding::HashTable
                }
            }
            Value::Hash(_) => Encoding::HashTable,
            Value::SortedSet { .. } => Encoding::SkipList,
        }
    }

    /// Is this a "big key" requiring chunked, multi-tick dumping
    /// (spec.md §4.5)?
    pub fn is_big(&self) -> bool {
        matches!(self.encoding(), Encoding::SkipList | Encoding::HashTable | Encoding::Quicklist)
    }
}

/// Parses a byte string as a signed 64-bit integer the way Redis's
/// `string2ll` does: no leading/trailing whitespace, no leading zeros
/// (other than a lone "0"), optional leading '-'. Never panics (spec.md
/// design note: "Dynamic numeric parsing ... never panic on bad input").
pub fn parse_i64(s: &[u8]) -> Option<i64> {
    if s.is_empty() || s.len() > 20 {
        return None;
    }
    let (neg, digits) = match s[0] {
        b'-' => (true, &s[1..]),
        _ => (false, s),
    };
    if digits.is_empty() || digits.len() > 19 {
        return None;
    }
    if digits[0] == b'0' && digits.len() > 1 {
        return None;
    }
    if neg && digits == b"0" {
        return None;
    }
    let mut acc: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return None;
        }
        let d = (b - b'0') as i64;
        acc = acc.checked_mul(10)?.checked_add(d)?;
    }
    if neg {
        acc.checked_neg()
    } else {
        Some(acc)
    }
}

/// Parses a byte string as a finite `f64` the way Redis's `string2d` does,
/// rejecting NaN/garbage trailing bytes.
pub fn parse_f64(s: &[u8]) -> Option<f64> {
    let text = std::str::from_utf8(s).ok()?;
    let v: f64 = text.trim().parse().ok()?;
    if v.is_nan() {
        None
    } else {
        Some(v)
    }
}

/// A reference-counted, read-only shared reply bulk (spec.md §4.1's "shared
/// constant bulks"). Kept separate from `Object` since shared replies are
/// never owned by a shard and never freed.
pub type SharedBulk = Arc<Vec<u8>>;
