//! Queued read/write operation packets.
//!
//! A socket services at most one read and one write operation at a time;
//! the rest wait in FIFO queues. A [`QueuedRead::StartTls`] /
//! [`QueuedWrite::StartTls`] marker sits in *both* queues and blocks normal
//! dequeue until each side reaches it, which is what serializes the TLS
//! upgrade against in-flight plaintext operations.

use crate::tcp::tls::TlsOptions;
use std::sync::Arc;
use std::time::Duration;

/// A pending read request.
///
/// Exactly one of `read_length` / `terminator` may be active. With neither,
/// the operation reads all currently available data, bounded by
/// `max_length` when present.
#[derive(Debug)]
pub(crate) struct ReadOp {
    /// Accumulation buffer. Either owned by the operation or supplied by the
    /// caller (in which case `start_offset` preserves the caller's prefix).
    pub buffer: Vec<u8>,
    pub start_offset: usize,
    pub bytes_done: usize,
    pub read_length: Option<usize>,
    pub terminator: Option<Vec<u8>>,
    pub max_length: Option<usize>,
    pub timeout: Option<Duration>,
    pub tag: i64,
}

impl ReadOp {
    pub fn new(
        buffer: Option<Vec<u8>>,
        start_offset: usize,
        read_length: Option<usize>,
        terminator: Option<Vec<u8>>,
        max_length: Option<usize>,
        timeout: Option<Duration>,
        tag: i64,
    ) -> Self {
        let buffer = match buffer {
            Some(buf) => buf,
            None => match read_length {
                Some(len) => vec![0; len],
                None => Vec::new(),
            },
        };
        Self {
            buffer,
            start_offset,
            bytes_done: 0,
            read_length,
            terminator,
            max_length,
            timeout,
            tag,
        }
    }

    /// Space left in the buffer past the bytes already produced.
    pub fn available_buffer_space(&self) -> usize {
        self.buffer
            .len()
            .saturating_sub(self.start_offset + self.bytes_done)
    }

    /// Grows the buffer so `additional` more bytes fit after `bytes_done`.
    pub fn ensure_capacity(&mut self, additional: usize) {
        let needed = self.start_offset + self.bytes_done + additional;
        if self.buffer.len() < needed {
            self.buffer.resize(needed, 0);
        }
    }

    /// Mutable window the next `len` produced bytes should land in.
    pub fn fill_window(&mut self, len: usize) -> &mut [u8] {
        self.ensure_capacity(len);
        let start = self.start_offset + self.bytes_done;
        &mut self.buffer[start..start + len]
    }

    /// Bytes remaining until an exact-length read completes.
    pub fn length_remaining(&self) -> Option<usize> {
        self.read_length.map(|len| len - self.bytes_done)
    }

    /// Bytes remaining before `max_length` is exhausted. `usize::MAX` when
    /// unbounded.
    pub fn max_remaining(&self) -> usize {
        match self.max_length {
            Some(max) => max.saturating_sub(self.bytes_done),
            None => usize::MAX,
        }
    }

    /// How many bytes to request from the transport when the amount
    /// available is unknown. Returns the length and whether the read should
    /// land in the pre-buffer because the operation's own buffer would need
    /// a speculative resize.
    pub fn optimal_read_length(&self, default: usize) -> (usize, bool) {
        if let Some(remaining) = self.length_remaining() {
            if remaining > 0 {
                return (remaining, false);
            }
        }
        let len = default.min(self.max_remaining());
        (len, self.available_buffer_space() < len)
    }

    /// Terminator scan against the pre-buffer, including the case where the
    /// terminator straddles bytes already delivered to this operation and
    /// bytes still in the pre-buffer.
    ///
    /// Returns `(n, found)`: consume `n` pre-buffer bytes; when `found`, the
    /// last of those bytes completes the terminator. When not found, `n` is
    /// clamped to the max-length budget. A found terminator may report
    /// `n` past the budget; the caller decides whether "found exactly at
    /// max length" completes or overflows.
    pub fn read_length_for_term_with_prebuffer(&self, pre: &[u8]) -> (usize, bool) {
        let term = self
            .terminator
            .as_ref()
            .expect("terminator scan on non-terminator read");
        let tl = term.len();
        debug_assert!(!pre.is_empty());

        let max_copy = pre.len().min(self.max_remaining());
        if self.bytes_done + pre.len() < tl {
            // Not enough combined bytes for even one full terminator.
            return (max_copy, false);
        }

        // The terminator may begin inside bytes we already hold, so the scan
        // window is the last (tl - 1) delivered bytes followed by the
        // pre-buffer contents.
        let tail_len = self.bytes_done.min(tl - 1);
        let tail_start = self.start_offset + self.bytes_done - tail_len;
        let mut window = Vec::with_capacity(tail_len + pre.len());
        window.extend_from_slice(&self.buffer[tail_start..tail_start + tail_len]);
        window.extend_from_slice(pre);

        for start in 0..=window.len() - tl {
            if &window[start..start + tl] == term.as_slice() {
                let pre_consumed = start + tl - tail_len;
                if pre_consumed == 0 {
                    // Entirely within delivered bytes; callers scan after
                    // every append, so this cannot happen.
                    continue;
                }
                return (pre_consumed, true);
            }
        }
        (max_copy, false)
    }

    /// After appending `appended` bytes directly into the buffer, scans for
    /// a terminator ending within the new bytes. Returns the number of
    /// excess bytes past the terminator (0 = found flush at the end), or
    /// `None` when no terminator completed.
    pub fn search_terminator_after_append(&self, appended: usize) -> Option<usize> {
        let term = self
            .terminator
            .as_ref()
            .expect("terminator scan on non-terminator read");
        let tl = term.len();
        let total = self.bytes_done;
        debug_assert!(appended <= total);
        if total < tl {
            return None;
        }

        // Earliest window that could end inside the appended region.
        let first = if total - appended >= tl {
            total - appended - tl + 1
        } else {
            0
        };
        let base = self.start_offset;
        for start in first..=total - tl {
            if &self.buffer[base + start..base + start + tl] == term.as_slice() {
                return Some(total - (start + tl));
            }
        }
        None
    }
}

/// A pending write request. Completes only when every byte is accepted.
#[derive(Debug)]
pub(crate) struct WriteOp {
    pub data: Vec<u8>,
    pub bytes_done: usize,
    pub timeout: Option<Duration>,
    pub tag: i64,
}

impl WriteOp {
    pub fn new(data: Vec<u8>, timeout: Option<Duration>, tag: i64) -> Self {
        Self {
            data,
            bytes_done: 0,
            timeout,
            tag,
        }
    }

    pub fn remaining(&self) -> &[u8] {
        &self.data[self.bytes_done..]
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_done == self.data.len()
    }
}

#[derive(Debug)]
pub(crate) enum QueuedRead {
    Data(ReadOp),
    StartTls(Arc<TlsOptions>),
}

#[derive(Debug)]
pub(crate) enum QueuedWrite {
    Data(WriteOp),
    StartTls,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn term_op(term: &[u8], max: Option<usize>) -> ReadOp {
        ReadOp::new(None, 0, None, Some(term.to_vec()), max, None, 0)
    }

    #[test]
    fn optimal_length_prefers_exact_remaining() {
        let mut op = ReadOp::new(None, 0, Some(100), None, None, None, 1);
        op.bytes_done = 40;
        assert_eq!(op.optimal_read_length(4096), (60, false));
    }

    #[test]
    fn optimal_length_clamps_to_max() {
        let op = ReadOp::new(None, 0, None, None, Some(10), None, 1);
        let (len, prebuffer) = op.optimal_read_length(4096);
        assert_eq!(len, 10);
        assert!(prebuffer);
    }

    #[test]
    fn prebuffer_scan_finds_terminator() {
        let op = term_op(b"\r\n", None);
        let (n, found) = op.read_length_for_term_with_prebuffer(b"hello\r\nextra");
        assert!(found);
        assert_eq!(n, 7); // "hello\r\n"
    }

    #[test]
    fn prebuffer_scan_straddling_terminator() {
        let mut op = term_op(b"\r\n", None);
        // "abc\r" already delivered; "\nxyz" waiting in the pre-buffer.
        op.buffer = b"abc\r".to_vec();
        op.bytes_done = 4;
        let (n, found) = op.read_length_for_term_with_prebuffer(b"\nxyz");
        assert!(found);
        assert_eq!(n, 1); // just the "\n"
    }

    #[test]
    fn prebuffer_scan_not_found_clamps_to_max() {
        let mut op = term_op(b"\r\n", Some(6));
        op.bytes_done = 2;
        op.buffer = b"ab".to_vec();
        let (n, found) = op.read_length_for_term_with_prebuffer(b"cdefghij");
        assert!(!found);
        assert_eq!(n, 4); // max 6 minus 2 already done
    }

    #[test]
    fn append_scan_reports_overflow() {
        let mut op = term_op(b"\n", None);
        op.buffer = b"PING\nPO".to_vec();
        op.bytes_done = 7;
        let overflow = op.search_terminator_after_append(7).unwrap();
        assert_eq!(overflow, 2); // "PO" past the terminator
    }

    #[test]
    fn append_scan_flush_at_end() {
        let mut op = term_op(b"\n", None);
        op.buffer = b"PING\n".to_vec();
        op.bytes_done = 5;
        assert_eq!(op.search_terminator_after_append(5), Some(0));
    }

    #[test]
    fn append_scan_misses_absent_terminator() {
        let mut op = term_op(b"\r\n", None);
        op.buffer = b"no newline here".to_vec();
        op.bytes_done = op.buffer.len();
        let n = op.bytes_done;
        assert_eq!(op.search_terminator_after_append(n), None);
    }

    #[test]
    fn caller_buffer_prefix_preserved() {
        let mut op = ReadOp::new(Some(b"HDR:".to_vec()), 4, Some(3), None, None, None, 9);
        op.fill_window(3).copy_from_slice(b"abc");
        op.bytes_done = 3;
        assert_eq!(&op.buffer[..7], b"HDR:abc");
    }
}
