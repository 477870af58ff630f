//! Incremental RESP request parser.
//!
//! Mirrors the two framings real Redis accepts on the same socket:
//! "inline" (a bare line of whitespace-separated, optionally quoted,
//! arguments) and "multibulk" (`*<argc>\r\n` followed by `$<len>\r\n<bytes>\r\n`
//! per argument). The parser is fed bytes as they arrive and keeps its own
//! continuation state (`multibulk_len`, `bulk_len`, the partially-built
//! `argv`) between calls so a request split across several `read(2)`s is
//! decoded exactly once, without re-scanning bytes already consumed from
//! the connection's `ByteBuf` (spec.md §4.1).

use crate::buf::{ByteBuf, BIG_ARG_REBASE_THRESHOLD};
use crate::error::ProtoError;

/// Hard cap on a single inline request (supplemented constant,
/// `original_source/src/vr_proto.h`'s `PROTO_INLINE_MAX_SIZE`).
pub const INLINE_MAX_SIZE: usize = 64 * 1024;
/// Hard cap on the digits accepted for a multibulk argument count.
pub const MBULK_COUNT_MAX_DIGITS: usize = 32;
/// Hard cap on the declared argument count itself.
pub const MBULK_COUNT_MAX: i64 = 1024 * 1024;
/// Hard cap on a single bulk argument's declared length.
pub const BULK_MAX_LEN: i64 = 512 * 1024 * 1024;

pub enum ParseOutcome {
    /// Not enough bytes buffered yet; call `feed` again once more arrive.
    NeedMore,
    /// A complete request was decoded and consumed from the buffer.
    Ready(Vec<Vec<u8>>),
}

#[derive(Default)]
pub struct RequestParser {
    /// `-1` until the `*<argc>\r\n` header of a multibulk request has been
    /// read; `0` once every argument has been collected.
    multibulk_len: i64,
    /// `-1` between arguments (expecting a `$<len>\r\n` header next);
    /// otherwise the number of payload bytes still to read for `argv.last()`.
    bulk_len: i64,
    argv: Vec<Vec<u8>>,
    in_multibulk: bool,
}

impl RequestParser {
    pub fn new() -> Self {
        Self { multibulk_len: -1, bulk_len: -1, argv: Vec::new(), in_multibulk: false }
    }

    /// Attempts to decode one complete request from `buf`, consuming
    /// (`ByteBuf::advance`) exactly the bytes that made it up. Returns
    /// `NeedMore` if the buffered bytes don't yet contain a full request.
    pub fn feed(&mut self, buf: &mut ByteBuf) -> Result<ParseOutcome, ProtoError> {
        loop {
            if buf.is_empty() {
                return Ok(ParseOutcome::NeedMore);
            }
            if !self.in_multibulk && self.argv.is_empty() {
                if buf.as_slice()[0] == b'*' {
                    self.in_multibulk = true;
                } else {
                    return self.feed_inline(buf);
                }
            }
            if self.multibulk_len < 0 {
                match self.read_multibulk_header(buf)? {
                    Some(()) => continue,
                    None => return Ok(ParseOutcome::NeedMore),
                }
            }
            if self.multibulk_len == 0 {
                let argv = std::mem::take(&mut self.argv);
                self.reset();
                return Ok(ParseOutcome::Ready(argv));
            }
            match self.read_one_bulk(buf)? {
                Some(()) => continue,
                None => return Ok(ParseOutcome::NeedMore),
            }
        }
    }

    fn reset(&mut self) {
        self.multibulk_len = -1;
        self.bulk_len = -1;
        self.in_multibulk = false;
    }

    /// Parses the `*<argc>\r\n` line. Returns `Ok(Some(()))` once
    /// `multibulk_len` has been set and the header bytes consumed,
    /// `Ok(None)` if the line hasn't fully arrived yet.
    fn read_multibulk_header(&mut self, buf: &mut ByteBuf) -> Result<Option<()>, ProtoError> {
        let data = buf.as_slice();
        let Some(nl) = find_crlf(data) else {
            if data.len() > INLINE_MAX_SIZE {
                return Err(ProtoError::InvalidMultibulkLength);
            }
            return Ok(None);
        };
        if data[0] != b'*' {
            return Err(ProtoError::InvalidMultibulkLength);
        }
        let line = &data[1..nl];
        if line.len() > MBULK_COUNT_MAX_DIGITS {
            return Err(ProtoError::MbulkCountTooBig);
        }
        let count: i64 =
            parse_ascii_i64(line).ok_or(ProtoError::InvalidMultibulkLength)?;
        if count > MBULK_COUNT_MAX {
            return Err(ProtoError::MbulkCountTooBig);
        }
        let consumed = nl + 2;
        buf.advance(consumed);
        self.multibulk_len = count.max(0);
        self.argv = Vec::with_capacity(self.multibulk_len as usize);
        Ok(Some(()))
    }

    /// Reads one `$<len>\r\n<bytes>\r\n` argument, or continues reading the
    /// payload of one already started. Returns `Ok(Some(()))` once the
    /// argument has been appended to `argv`.
    fn read_one_bulk(&mut self, buf: &mut ByteBuf) -> Result<Option<()>, ProtoError> {
        if self.bulk_len < 0 {
            let data = buf.as_slice();
            let Some(nl) = find_crlf(data) else {
                return Ok(None);
            };
            if data[0] != b'$' {
                return Err(ProtoError::ExpectedDollar);
            }
            let len: i64 =
                parse_ascii_i64(&data[1..nl]).ok_or(ProtoError::InvalidBulkLength)?;
            if len < 0 || len > BULK_MAX_LEN {
                return Err(ProtoError::BulkTooBig);
            }
            buf.advance(nl + 2);
            self.bulk_len = len;
            if len as usize >= BIG_ARG_REBASE_THRESHOLD {
                buf.compact_if_needed(true);
            }
        }
        let need = self.bulk_len as usize + 2;
        let data = buf.as_slice();
        if data.len() < need {
            buf.reserve(need - data.len());
            return Ok(None);
        }
        let arg = data[..self.bulk_len as usize].to_vec();
        buf.advance(need);
        self.argv.push(arg);
        self.multibulk_len -= 1;
        self.bulk_len = -1;
        Ok(Some(()))
    }

    /// Inline framing: a single line, whitespace-separated, honoring single
    /// and double quotes with C-style escapes (mirrors Redis's
    /// `sdssplitargs`).
    fn feed_inline(&mut self, buf: &mut ByteBuf) -> Result<ParseOutcome, ProtoError> {
        let data = buf.as_slice();
        let Some(nl) = data.iter().position(|&b| b == b'\n') else {
            if data.len() > INLINE_MAX_SIZE {
                return Err(ProtoError::InlineRequestTooBig);
            }
            return Ok(ParseOutcome::NeedMore);
        };
        if nl > INLINE_MAX_SIZE {
            return Err(ProtoError::InlineRequestTooBig);
        }
        let mut end = nl;
        if end > 0 && data[end - 1] == b'\r' {
            end -= 1;
        }
        let line = data[..end].to_vec();
        buf.advance(nl + 1);
        let argv = split_args(&line)?;
        Ok(ParseOutcome::Ready(argv))
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.iter().position(|&b| b == b'\n').and_then(|nl| {
        if nl > 0 && data[nl - 1] == b'\r' {
            Some(nl - 1)
        } else {
            None
        }
    })
}

fn parse_ascii_i64(s: &[u8]) -> Option<i64> {
    if s.is_empty() {
        return None;
    }
    std::str::from_utf8(s).ok()?.parse().ok()
}

/// Splits an inline command line into arguments, honoring single quotes and
/// back-ticks (no escapes for either), double quotes (`\n \r \t \a \b` and
/// `\xHH` escapes), and bare whitespace-separated tokens. Returns
/// `UnbalancedQuotes` if a quoted token is never closed.
fn split_args(line: &[u8]) -> Result<Vec<Vec<u8>>, ProtoError> {
    let mut args = Vec::new();
    let mut i = 0;
    while i < line.len() {
        while i < line.len() && line[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= line.len() {
            break;
        }
        let mut current = Vec::new();
        if line[i] == b'"' {
            i += 1;
            let mut closed = false;
            while i < line.len() {
                match line[i] {
                    b'\\' if i + 1 < line.len() => {
                        i += 1;
                        current.push(match line[i] {
                            b'n' => b'\n',
                            b'r' => b'\r',
                            b't' => b'\t',
                            b'a' => 0x07,
                            b'b' => 0x08,
                            b'x' if i + 2 < line.len() => {
                                let hex = &line[i + 1..i + 3];
                                if let Some(byte) = parse_hex_byte(hex) {
                                    i += 2;
                                    byte
                                } else {
                                    line[i]
                                }
                            }
                            other => other,
                        });
                        i += 1;
                    }
                    b'"' => {
                        i += 1;
                        closed = true;
                        break;
                    }
                    b => {
                        current.push(b);
                        i += 1;
                    }
                }
            }
            if !closed {
                return Err(ProtoError::UnbalancedQuotes);
            }
            if i < line.len() && !line[i].is_ascii_whitespace() {
                return Err(ProtoError::UnbalancedQuotes);
            }
        } else if line[i] == b'\'' {
            i += 1;
            let mut closed = false;
            while i < line.len() {
                if line[i] == b'\'' {
                    i += 1;
                    closed = true;
                    break;
                }
                current.push(line[i]);
                i += 1;
            }
            if !closed {
                return Err(ProtoError::UnbalancedQuotes);
            }
        } else if line[i] == b'`' {
            i += 1;
            let mut closed = false;
            while i < line.len() {
                if line[i] == b'`' {
                    i += 1;
                    closed = true;
                    break;
                }
                current.push(line[i]);
                i += 1;
            }
            if !closed {
                return Err(ProtoError::UnbalancedQuotes);
            }
        } else {
            while i < line.len() && !line[i].is_ascii_whitespace() {
                current.push(line[i]);
                i += 1;
            }
        }
        args.push(current);
    }
    Ok(args)
}

fn parse_hex_byte(hex: &[u8]) -> Option<u8> {
    let s = std::str::from_utf8(hex).ok()?;
    u8::from_str_radix(s, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(parser: &mut RequestParser, buf: &mut ByteBuf, chunks: &[&[u8]]) -> Vec<Vec<Vec<u8>>> {
        let mut out = Vec::new();
        for chunk in chunks {
            buf.extend_from_slice(chunk);
            loop {
                match parser.feed(buf).unwrap() {
                    ParseOutcome::Ready(argv) => out.push(argv),
                    ParseOutcome::NeedMore => break,
                }
            }
        }
        out
    }

    #[test]
    fn parses_multibulk_in_one_shot() {
        let mut parser = RequestParser::new();
        let mut buf = ByteBuf::new();
        let reqs = feed_all(&mut parser, &mut buf, &[b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n"]);
        assert_eq!(reqs, vec![vec![b"GET".to_vec(), b"k".to_vec()]]);
    }

    #[test]
    fn parses_multibulk_split_across_reads() {
        let mut parser = RequestParser::new();
        let mut buf = ByteBuf::new();
        let reqs = feed_all(
            &mut parser,
            &mut buf,
            &[b"*2\r\n$3\r\nGE", b"T\r\n$1\r\nk\r", b"\n"],
        );
        assert_eq!(reqs, vec![vec![b"GET".to_vec(), b"k".to_vec()]]);
    }

    #[test]
    fn parses_inline_with_quotes() {
        let mut parser = RequestParser::new();
        let mut buf = ByteBuf::new();
        let reqs = feed_all(&mut parser, &mut buf, &[b"SET foo \"bar baz\"\r\n"]);
        assert_eq!(reqs, vec![vec![b"SET".to_vec(), b"foo".to_vec(), b"bar baz".to_vec()]]);
    }

    #[test]
    fn parses_inline_with_backticks() {
        let mut parser = RequestParser::new();
        let mut buf = ByteBuf::new();
        let reqs = feed_all(&mut parser, &mut buf, &[b"SET foo `bar baz`\r\n"]);
        assert_eq!(reqs, vec![vec![b"SET".to_vec(), b"foo".to_vec(), b"bar baz".to_vec()]]);
    }

    #[test]
    fn rejects_unbalanced_quotes() {
        let mut parser = RequestParser::new();
        let mut buf = ByteBuf::new();
        buf.extend_from_slice(b"SET foo \"bar\r\n");
        let err = parser.feed(&mut buf).unwrap_err();
        assert!(matches!(err, ProtoError::UnbalancedQuotes));
    }

    #[test]
    fn rejects_oversized_mbulk_count() {
        let mut parser = RequestParser::new();
        let mut buf = ByteBuf::new();
        buf.extend_from_slice(b"*99999999\r\n");
        let err = parser.feed(&mut buf).unwrap_err();
        assert!(matches!(err, ProtoError::MbulkCountTooBig));
    }
}
