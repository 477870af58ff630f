//! Crate-wide error types.
//!
//! Each module boundary gets its own `thiserror` enum, mirroring the
//! teacher's `engine::EngineError` rather than its hand-rolled crate-root
//! `Display` impl — one consistent pattern instead of two.

use thiserror::Error;

/// Errors surfaced while parsing or emitting the RESP wire protocol.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Protocol error: invalid multibulk length")]
    InvalidMultibulkLength,
    #[error("Protocol error: invalid bulk length")]
    InvalidBulkLength,
    #[error("Protocol error: expected '$', got something else")]
    ExpectedDollar,
    #[error("Protocol error: unbalanced quotes in request")]
    UnbalancedQuotes,
    #[error("Protocol error: too big inline request")]
    InlineRequestTooBig,
    #[error("Protocol error: too big mbulk count string")]
    MbulkCountTooBig,
    #[error("Protocol error: invalid bulk length")]
    BulkTooBig,
    #[error("out of memory")]
    OutOfMemory,
}

/// Errors surfaced by the persistence engine (RDB + append-log).
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt RDB file: {0}")]
    CorruptRdb(String),
    #[error("unsupported RDB version {0}")]
    UnsupportedVersion(u32),
    #[error("CRC-64 mismatch: expected {expected:016x}, got {actual:016x}")]
    CrcMismatch { expected: u64, actual: u64 },
    #[error("malformed persistence filename: {0}")]
    BadFilename(String),
    #[error("AOF is in an error state and refuses further writes")]
    AofErrorState,
    #[error("fsync failed and durability policy is 'always': {0}")]
    FatalFsync(String),
}

/// Errors surfaced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{path}:{line}: duplicate key '{key}'")]
    DuplicateKey { path: String, line: usize, key: String },
    #[error("{path}:{line}: malformed line: {text}")]
    Malformed { path: String, line: usize, text: String },
    #[error("invalid value for '{key}': {value}")]
    InvalidValue { key: String, value: String },
    #[error("I/O error reading {path}: {source}")]
    Io { path: String, source: std::io::Error },
}

/// Top-level engine error, used by the command dispatcher and worker loop.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Proto(#[from] ProtoError),
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,
    #[error("no such key")]
    NoSuchKey,
    #[error("OOM command not allowed when used memory > 'maxmemory'")]
    Oom,
    #[error("wrong number of arguments for '{0}' command")]
    WrongArity(String),
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("syntax error")]
    Syntax,
    #[error("value is not an integer or out of range")]
    NotAnInteger,
    #[error("increment or decrement would overflow")]
    IncrOverflow,
    #[error("{0}")]
    Other(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
