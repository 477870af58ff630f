//! Configuration file loading.
//!
//! The on-disk grammar is *not* TOML: `original_source/src/vr_conf.c`'s
//! `CONF_TOKEN_*` constants describe an indentation-based format —
//! `[section]` headers, `key: value` pairs, and `- item` list entries,
//! closer to a stripped-down YAML than anything `serde`'s format crates
//! read out of the box. Hand-written here rather than bolted onto `toml`,
//! matching spec.md §4's configuration grammar exactly.

use std::collections::HashMap;
use std::path::Path;

use crate::db::EvictionPolicy;
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendFsync {
    Always,
    EverySec,
    No,
}

impl AppendFsync {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "always" => AppendFsync::Always,
            "everysec" => AppendFsync::EverySec,
            "no" => AppendFsync::No,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub port: u16,
    pub manage_addr: String,
    pub manage_port: u16,
    pub worker_threads: usize,
    pub databases: usize,
    pub internal_shards: usize,
    pub maxmemory_bytes: u64,
    pub maxmemory_policy: EvictionPolicy,
    pub appendonly: bool,
    pub appendfsync: AppendFsync,
    pub aof_load_truncated: bool,
    pub dir: String,
    pub requirepass: Option<String>,
    pub loglevel: String,
    pub logfile: Option<String>,
    pub pidfile: Option<String>,
    pub daemonize: bool,
    pub cron_interval_ms: u64,
    pub tcp_backlog: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port: 6390,
            manage_addr: "127.0.0.1".to_string(),
            manage_port: 6391,
            worker_threads: 4,
            databases: 16,
            internal_shards: 16,
            maxmemory_bytes: 0,
            maxmemory_policy: EvictionPolicy::NoEviction,
            appendonly: false,
            appendfsync: AppendFsync::EverySec,
            aof_load_truncated: true,
            dir: ".".to_string(),
            requirepass: None,
            loglevel: "notice".to_string(),
            logfile: None,
            pidfile: None,
            daemonize: false,
            cron_interval_ms: 100,
            tcp_backlog: 511,
        }
    }
}

/// One decoded line: a new `[section]`, a `key: value` pair (optionally
/// inside a section, giving `section.key`), or a `- item` belonging to the
/// most recently seen list key.
enum Line {
    Section(String),
    KeyValue(String, String),
    ListItem(String),
    Blank,
}

fn classify_line(raw: &str) -> Line {
    let trimmed = raw.trim_end();
    let stripped = trimmed.trim_start();
    if stripped.is_empty() || stripped.starts_with('#') {
        return Line::Blank;
    }
    if stripped.starts_with('[') && stripped.ends_with(']') {
        return Line::Section(stripped[1..stripped.len() - 1].trim().to_string());
    }
    if let Some(rest) = stripped.strip_prefix("- ") {
        return Line::ListItem(rest.trim().to_string());
    }
    if let Some((key, value)) = stripped.split_once(':') {
        return Line::KeyValue(key.trim().to_string(), value.trim().to_string());
    }
    Line::Blank
}

impl Config {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
        Self::parse(&text, &path.display().to_string())
    }

    pub fn parse(text: &str, path: &str) -> Result<Self, ConfigError> {
        let mut cfg = Config::default();
        let mut section = String::new();
        let mut seen_keys: HashMap<String, usize> = HashMap::new();
        let mut last_list_key: Option<String> = None;
        let mut lists: HashMap<String, Vec<String>> = HashMap::new();

        for (lineno, raw) in text.lines().enumerate() {
            let lineno = lineno + 1;
            match classify_line(raw) {
                Line::Blank => {}
                Line::Section(name) => {
                    section = name;
                    last_list_key = None;
                }
                Line::KeyValue(key, value) => {
                    let full_key =
                        if section.is_empty() { key.clone() } else { format!("{section}.{key}") };
                    if let Some(prev_line) = seen_keys.insert(full_key.clone(), lineno) {
                        let _ = prev_line;
                        return Err(ConfigError::DuplicateKey { path: path.to_string(), line: lineno, key: full_key });
                    }
                    last_list_key = None;
                    apply_key(&mut cfg, &full_key, &value, path, lineno)?;
                }
                Line::ListItem(item) => {
                    let key = last_list_key.clone().unwrap_or_else(|| "<root>".to_string());
                    lists.entry(key.clone()).or_default().push(item);
                    last_list_key = Some(key);
                }
            }
        }
        let _ = lists; // list-valued keys (e.g. `save` points) are consumed by higher layers once added.
        Ok(cfg)
    }
}

fn apply_key(cfg: &mut Config, key: &str, value: &str, path: &str, line: usize) -> Result<(), ConfigError> {
    let err = || ConfigError::InvalidValue { key: key.to_string(), value: value.to_string() };
    match key {
        "bind" => cfg.bind_addr = value.to_string(),
        "port" => cfg.port = value.parse().map_err(|_| err())?,
        "manage-addr" => cfg.manage_addr = value.to_string(),
        "manage-port" => cfg.manage_port = value.parse().map_err(|_| err())?,
        "worker-threads" => cfg.worker_threads = value.parse().map_err(|_| err())?,
        "databases" => cfg.databases = value.parse().map_err(|_| err())?,
        "internal-shards" => cfg.internal_shards = value.parse().map_err(|_| err())?,
        "maxmemory" => cfg.maxmemory_bytes = parse_memtoll(value).ok_or_else(err)?,
        "maxmemory-policy" => cfg.maxmemory_policy = EvictionPolicy::parse(value).ok_or_else(err)?,
        "appendonly" => cfg.appendonly = parse_bool(value).ok_or_else(err)?,
        "appendfsync" => cfg.appendfsync = AppendFsync::parse(value).ok_or_else(err)?,
        "aof-load-truncated" => cfg.aof_load_truncated = parse_bool(value).ok_or_else(err)?,
        "dir" => cfg.dir = value.to_string(),
        "requirepass" => cfg.requirepass = if value.is_empty() { None } else { Some(value.to_string()) },
        "loglevel" => cfg.loglevel = value.to_string(),
        "logfile" => cfg.logfile = Some(value.to_string()),
        "pidfile" => cfg.pidfile = Some(value.to_string()),
        "daemonize" => cfg.daemonize = parse_bool(value).ok_or_else(err)?,
        "cron-interval-ms" => cfg.cron_interval_ms = value.parse().map_err(|_| err())?,
        "tcp-backlog" => cfg.tcp_backlog = value.parse().map_err(|_| err())?,
        _ => {
            let _ = (path, line);
            // Unknown keys are tolerated (forward compatibility with newer
            // config files) rather than rejected.
        }
    }
    Ok(())
}

fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "yes" | "true" | "1" => Some(true),
        "no" | "false" | "0" => Some(false),
        _ => None,
    }
}

/// Parses a size like Redis's `memtoll`: a bare number of bytes, or a
/// number followed by a decimal suffix (`k`, `m`, `g` = powers of 1000) or
/// a binary suffix (`kb`, `mb`, `gb` = powers of 1024). Case-insensitive.
pub fn parse_memtoll(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let lower = s.to_ascii_lowercase();
    let suffixes: &[(&str, u64)] = &[
        ("kb", 1024),
        ("mb", 1024 * 1024),
        ("gb", 1024 * 1024 * 1024),
        ("k", 1000),
        ("m", 1_000_000),
        ("g", 1_000_000_000),
    ];
    for (suffix, mult) in suffixes {
        if let Some(num) = lower.strip_suffix(suffix) {
            let n: f64 = num.trim().parse().ok()?;
            return Some((n * *mult as f64) as u64);
        }
    }
    lower.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memtoll_parses_suffixes() {
        assert_eq!(parse_memtoll("100"), Some(100));
        assert_eq!(parse_memtoll("1k"), Some(1000));
        assert_eq!(parse_memtoll("1kb"), Some(1024));
        assert_eq!(parse_memtoll("2gb"), Some(2 * 1024 * 1024 * 1024));
    }

    #[test]
    fn parses_sectioned_config() {
        let text = "[network]\nport: 7000\nbind: 0.0.0.0\n\n[memory]\nmaxmemory: 100mb\nmaxmemory-policy: allkeys-lru\n";
        let cfg = Config::parse(text, "<test>").unwrap();
        assert_eq!(cfg.port, 7000);
        assert_eq!(cfg.bind_addr, "0.0.0.0");
        assert_eq!(cfg.maxmemory_bytes, 100 * 1024 * 1024);
        assert_eq!(cfg.maxmemory_policy, EvictionPolicy::AllKeysLru);
    }

    #[test]
    fn rejects_duplicate_keys() {
        let text = "port: 1\nport: 2\n";
        let err = Config::parse(text, "<test>").unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateKey { .. }));
    }
}
