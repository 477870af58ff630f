//! Shared constant replies (spec.md §4.1: "a connection's reply surface is
//! a 16KiB inline buffer plus an overflow list of owned or shared bulks").
//! These are pre-rendered once and referenced with a `'static` lifetime, so
//! writing e.g. `+OK\r\n` never allocates.

pub const OK: &[u8] = b"+OK\r\n";
pub const PONG: &[u8] = b"+PONG\r\n";
pub const QUEUED: &[u8] = b"+QUEUED\r\n";
pub const NIL_BULK: &[u8] = b"$-1\r\n";
pub const NIL_ARRAY: &[u8] = b"*-1\r\n";
pub const EMPTY_ARRAY: &[u8] = b"*0\r\n";
pub const CZERO: &[u8] = b":0\r\n";
pub const CONE: &[u8] = b":1\r\n";
pub const CMINUS_ONE: &[u8] = b":-1\r\n";
pub const EMPTY_BULK: &[u8] = b"$0\r\n\r\n";
pub const WRONGTYPE_ERR: &[u8] =
    b"-WRONGTYPE Operation against a key holding the wrong kind of value\r\n";
pub const SYNTAX_ERR: &[u8] = b"-ERR syntax error\r\n";
pub const NOT_INT_ERR: &[u8] = b"-ERR value is not an integer or out of range\r\n";
pub const NOAUTH_ERR: &[u8] = b"-NOAUTH Authentication required.\r\n";
pub const EXECABORT_ERR: &[u8] =
    b"-EXECABORT Transaction discarded because of previous errors.\r\n";
