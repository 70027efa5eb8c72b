//! Segmented receive buffer.
//!
//! Transport reads land as discrete [`Bytes`] segments; the HTTP/1.x parser
//! scans across them without requiring the bytes to be contiguous. Indexing is
//! by absolute offset from the current unconsumed start.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

#[derive(Debug, Default)]
pub struct RecvBuffer {
    segments: VecDeque<Bytes>,
    len: usize,
}

impl RecvBuffer {
    pub fn new() -> Self {
        Self {
            segments: VecDeque::new(),
            len: 0,
        }
    }

    /// Append a freshly received segment. Empty segments are dropped so that
    /// scans never stall on a zero-length head segment.
    pub fn push(&mut self, segment: Bytes) {
        if segment.is_empty() {
            return;
        }
        self.len += segment.len();
        self.segments.push_back(segment);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Byte at absolute offset `index`, if received.
    pub fn get(&self, index: usize) -> Option<u8> {
        if index >= self.len {
            return None;
        }
        let mut remaining = index;
        for seg in &self.segments {
            if remaining < seg.len() {
                return Some(seg[remaining]);
            }
            remaining -= seg.len();
        }
        None
    }

    /// Two-byte lookahead at `index`, spanning a segment boundary when the
    /// pair straddles one.
    pub fn pair_at(&self, index: usize) -> Option<(u8, u8)> {
        Some((self.get(index)?, self.get(index + 1)?))
    }

    /// First occurrence of `needle` at or after `start`. The scan fast-paths
    /// the segment containing `start` and then continues across the whole
    /// unread remainder, so a match is never missed because it lives in a
    /// later segment.
    pub fn find(&self, start: usize, needle: u8) -> Option<usize> {
        if start >= self.len {
            return None;
        }
        let mut base = 0usize;
        for seg in &self.segments {
            let seg_end = base + seg.len();
            if seg_end > start {
                let from = start.saturating_sub(base);
                if let Some(pos) = seg[from..].iter().position(|&b| b == needle) {
                    return Some(base + from + pos);
                }
            }
            base = seg_end;
        }
        None
    }

    /// Copy of `start..end`. Borrowing a sub-slice of a single segment is
    /// zero-copy; a range straddling segments is assembled.
    pub fn slice(&self, start: usize, end: usize) -> Bytes {
        debug_assert!(start <= end && end <= self.len);
        if start == end {
            return Bytes::new();
        }
        let mut base = 0usize;
        for seg in &self.segments {
            let seg_end = base + seg.len();
            if start >= base && end <= seg_end {
                return seg.slice(start - base..end - base);
            }
            if start < seg_end {
                break;
            }
            base = seg_end;
        }
        // Straddles segments: assemble.
        let mut out = BytesMut::with_capacity(end - start);
        let mut base = 0usize;
        for seg in &self.segments {
            let seg_end = base + seg.len();
            if seg_end > start && base < end {
                let from = start.saturating_sub(base);
                let to = seg.len().min(end - base);
                out.extend_from_slice(&seg[from..to]);
            }
            if seg_end >= end {
                break;
            }
            base = seg_end;
        }
        out.freeze()
    }

    /// Discard `n` bytes from the front.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len);
        let mut remaining = n;
        while remaining > 0 {
            let seg = match self.segments.front_mut() {
                Some(seg) => seg,
                None => break,
            };
            if seg.len() > remaining {
                let _ = seg.split_to(remaining);
                self.len -= remaining;
                return;
            }
            remaining -= seg.len();
            self.len -= seg.len();
            self.segments.pop_front();
        }
    }

    /// Take up to `n` bytes from the front as one contiguous `Bytes`.
    pub fn take(&mut self, n: usize) -> Bytes {
        let n = n.min(self.len);
        let out = self.slice(0, n);
        self.consume(n);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf_of(parts: &[&[u8]]) -> RecvBuffer {
        let mut buf = RecvBuffer::new();
        for p in parts {
            buf.push(Bytes::copy_from_slice(p));
        }
        buf
    }

    #[test]
    fn indexing_spans_segments() {
        let buf = buf_of(&[b"GET ", b"/pa", b"th"]);
        assert_eq!(buf.len(), 9);
        assert_eq!(buf.get(0), Some(b'G'));
        assert_eq!(buf.get(4), Some(b'/'));
        assert_eq!(buf.get(8), Some(b'h'));
        assert_eq!(buf.get(9), None);
    }

    #[test]
    fn find_crosses_segment_boundary() {
        let buf = buf_of(&[b"abc", b"def"]);
        assert_eq!(buf.find(0, b'e'), Some(4));
        assert_eq!(buf.find(5, b'e'), None);
    }

    #[test]
    fn pair_straddling_boundary_is_found() {
        let buf = buf_of(&[b"line\r", b"\nrest"]);
        assert_eq!(buf.pair_at(4), Some((b'\r', b'\n')));
        assert_eq!(buf.pair_at(9), None);
    }

    #[test]
    fn slice_within_one_segment_and_across() {
        let buf = buf_of(&[b"hello ", b"world"]);
        assert_eq!(&buf.slice(0, 5)[..], b"hello");
        assert_eq!(&buf.slice(3, 9)[..], b"lo wor");
    }

    #[test]
    fn consume_across_segments() {
        let mut buf = buf_of(&[b"abc", b"def", b"ghi"]);
        buf.consume(4);
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.get(0), Some(b'e'));
        let taken = buf.take(3);
        assert_eq!(&taken[..], b"efg");
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn empty_segments_are_dropped() {
        let mut buf = RecvBuffer::new();
        buf.push(Bytes::new());
        buf.push(Bytes::copy_from_slice(b"x\r\n"));
        buf.push(Bytes::new());
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.find(0, b'\r'), Some(1));
    }
}
