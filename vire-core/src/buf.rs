//! Growable, length-prefixed byte string used for client I/O buffers.
//!
//! Plays the role of Redis's `sds`: a `Vec<u8>`-backed buffer that knows how
//! to grow geometrically, rebase (drop already-consumed bytes from the
//! front) and reserve extra capacity ahead of a large read. Kept as an
//! explicit type (rather than just using `bytes::BytesMut` everywhere) so
//! the "rebase when a bulk is >= 32KiB" rule in spec.md §4.1 has one place
//! to live and one place to test.

/// Threshold above which the parser rebases the query buffer so the next
/// large bulk starts at offset 0 (spec.md §4.1).
pub const BIG_ARG_REBASE_THRESHOLD: usize = 32 * 1024;

/// Hard ceiling on the query buffer so a client can't grow it without bound
/// (supplemented constant, `original_source/src/vr_client.h`'s
/// `PROTO_MAX_QUERYBUF_LEN`).
pub const MAX_QUERYBUF_LEN: usize = 1024 * 1024 * 1024;

#[derive(Debug, Default)]
pub struct ByteBuf {
    data: Vec<u8>,
    /// Read cursor: bytes before this offset have already been consumed by
    /// the parser but not yet physically dropped.
    consumed: usize,
}

impl ByteBuf {
    pub fn new() -> Self {
        Self { data: Vec::new(), consumed: 0 }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self { data: Vec::with_capacity(cap), consumed: 0 }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() - self.consumed
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes not yet consumed by the parser.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.consumed..]
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Mark `n` bytes as consumed. Physical compaction is deferred to
    /// `compact_if_needed` so repeated small advances don't each cost a memmove.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.consumed + n <= self.data.len());
        self.consumed += n;
        if self.consumed == self.data.len() {
            self.data.clear();
            self.consumed = 0;
        }
    }

    /// Physically drop consumed bytes from the front once the consumed
    /// prefix is large relative to what remains, or unconditionally when
    /// `force` is set (used before a >=32KiB bulk read so it starts at
    /// offset 0, enabling zero-copy object take-over per spec.md §4.1).
    pub fn compact_if_needed(&mut self, force: bool) {
        if self.consumed == 0 {
            return;
        }
        if force || self.consumed > self.data.len() / 2 {
            self.data.drain(..self.consumed);
            self.consumed = 0;
        }
    }

    /// Reserve capacity for at least `extra` more bytes beyond current length.
    pub fn reserve(&mut self, extra: usize) {
        self.data.reserve(extra);
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.consumed = 0;
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_and_compact() {
        let mut b = ByteBuf::new();
        b.extend_from_slice(b"hello world");
        b.advance(6);
        assert_eq!(b.as_slice(), b"world");
        b.compact_if_needed(true);
        assert_eq!(b.as_slice(), b"world");
        assert_eq!(b.capacity() >= 5, true);
    }

    #[test]
    fn advance_to_completion_clears() {
        let mut b = ByteBuf::new();
        b.extend_from_slice(b"abc");
        b.advance(3);
        assert!(b.is_empty());
        assert_eq!(b.capacity(), b.capacity());
    }
}
