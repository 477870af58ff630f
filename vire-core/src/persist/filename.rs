//! Persistence filename grammar (spec.md §4.5/§6): `<kind>_<dbid>_<ishards>_
//! <13-digit-ms-timestamp>_<version>`. Filenames alone carry ordering and
//! lineage — there is no manifest, so `Descriptor::parse` has to be exact.
//!
//! `dbid` here is the shard's global index into the keyspace (`db *
//! internal_shards + shard_in_db`), not the logical database number: the
//! engine snapshots and replays one physical shard per file (the loader
//! "resets the destination shard"), and the logical db a key belongs to is
//! recovered from the shard index plus the recorded `ishards` via
//! `Keyspace::shard_index`'s inverse.

use crate::error::PersistError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Rdb,
    Aof,
    RdbTmp,
}

impl FileKind {
    fn tag(&self) -> &'static str {
        match self {
            FileKind::Rdb => "rdb",
            FileKind::Aof => "aof",
            FileKind::RdbTmp => "rdbtmp",
        }
    }

    fn parse_tag(tag: &str) -> Option<FileKind> {
        match tag {
            "rdb" => Some(FileKind::Rdb),
            "aof" => Some(FileKind::Aof),
            "rdbtmp" => Some(FileKind::RdbTmp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub kind: FileKind,
    pub dbid: usize,
    pub ishards: usize,
    pub timestamp_ms: u64,
    pub version: u64,
}

impl Descriptor {
    pub fn filename(&self) -> String {
        format!(
            "{}_{}_{}_{:013}_{}",
            self.kind.tag(),
            self.dbid,
            self.ishards,
            self.timestamp_ms,
            self.version
        )
    }

    pub fn parse(name: &str) -> Option<Descriptor> {
        let mut parts = name.splitn(5, '_');
        let kind = FileKind::parse_tag(parts.next()?)?;
        let dbid = parts.next()?.parse().ok()?;
        let ishards = parts.next()?.parse().ok()?;
        let ts_str = parts.next()?;
        if ts_str.len() != 13 {
            return None;
        }
        let timestamp_ms = ts_str.parse().ok()?;
        let version = parts.next()?.parse().ok()?;
        Some(Descriptor { kind, dbid, ishards, timestamp_ms, version })
    }

    pub fn try_parse(name: &str) -> Result<Descriptor, PersistError> {
        Descriptor::parse(name).ok_or_else(|| PersistError::BadFilename(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_filename_and_parse() {
        let d = Descriptor { kind: FileKind::Rdb, dbid: 3, ishards: 16, timestamp_ms: 1_732_000_000_123, version: 42 };
        let name = d.filename();
        assert_eq!(Descriptor::parse(&name), Some(d));
    }

    #[test]
    fn rejects_garbage() {
        assert!(Descriptor::parse("not_a_descriptor").is_none());
        assert!(Descriptor::parse("rdb_1_16_123_7").is_none()); // timestamp not 13 digits
    }

    #[test]
    fn every_kind_tag_round_trips() {
        for kind in [FileKind::Rdb, FileKind::Aof, FileKind::RdbTmp] {
            let d = Descriptor { kind, dbid: 0, ishards: 4, timestamp_ms: 1_700_000_000_000, version: 1 };
            assert_eq!(Descriptor::parse(&d.filename()).unwrap().kind, kind);
        }
    }
}
