//! Pre-buffer: the intermediate byte holding area between the OS socket and
//! the consumer-requested read buffer.
//!
//! Used whenever the exact amount of available data is unknown (terminator
//! searches, reads issued before an operation is queued, TLS plaintext
//! overshoot). The default [`PreBuffer`] is a growable contiguous buffer with
//! independent read/write cursors; callers may substitute their own
//! implementation (e.g. a ring buffer) behind the [`SocketBuffer`] contract.

/// Byte buffer contract shared by the socket engines.
///
/// Invariants every implementation must uphold:
/// - `available_bytes() + available_space()` equals the current capacity
/// - `did_write(n)` with `n > available_space()` is a programmer error
/// - after `did_read(n)` drains the final unread byte, the buffer compacts
///   so that subsequent writes start from a clean slate
pub trait SocketBuffer {
    /// The unread span: bytes written but not yet consumed.
    fn readable(&self) -> &[u8];

    /// The writable span: space available without growing. Implementations
    /// may relocate unread bytes so that the span's length always equals
    /// `available_space()`.
    fn writable(&mut self) -> &mut [u8];

    /// Number of unread bytes.
    fn available_bytes(&self) -> usize;

    /// Writable space remaining before a grow is required.
    fn available_space(&self) -> usize;

    /// Grows the buffer so at least `capacity` bytes can be written.
    fn ensure_capacity_for_write(&mut self, capacity: usize);

    /// Advances the read cursor after consuming `n` bytes.
    fn did_read(&mut self, n: usize);

    /// Advances the write cursor after producing `n` bytes.
    fn did_write(&mut self, n: usize);

    /// Discards all content and resets both cursors.
    fn reset(&mut self);
}

/// Default contiguous pre-buffer.
///
/// Growth is exact-fit: `ensure_capacity_for_write` extends the buffer by
/// precisely the deficit, never more. Callers that tune
/// `pre_buffer_capacity` rely on there being no over-allocation surprises.
#[derive(Debug)]
pub struct PreBuffer {
    buf: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl PreBuffer {
    /// Creates a pre-buffer with the given initial capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Current total capacity (unread bytes plus writable space).
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl SocketBuffer for PreBuffer {
    fn readable(&self) -> &[u8] {
        &self.buf[self.read_pos..self.write_pos]
    }

    fn writable(&mut self) -> &mut [u8] {
        // Reclaim the consumed zone ahead of read_pos, so the tail slice is
        // exactly `available_space()` long and is never empty while space
        // remains.
        if self.read_pos > 0 {
            self.buf.copy_within(self.read_pos..self.write_pos, 0);
            self.write_pos -= self.read_pos;
            self.read_pos = 0;
        }
        &mut self.buf[self.write_pos..]
    }

    fn available_bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    fn available_space(&self) -> usize {
        self.buf.len() - self.available_bytes()
    }

    fn ensure_capacity_for_write(&mut self, capacity: usize) {
        if capacity <= self.available_space() {
            return;
        }
        // Exact fit: grow by the deficit only. Cursor offsets are preserved
        // because Vec::resize keeps existing content in place.
        let additional = capacity - self.available_space();
        let new_size = self.buf.len() + additional;
        self.buf.resize(new_size, 0);
    }

    fn did_read(&mut self, n: usize) {
        debug_assert!(n <= self.available_bytes());
        self.read_pos += n;
        // Full-drain compaction bounds growth from many small reads.
        if self.read_pos == self.write_pos {
            self.reset();
        }
    }

    fn did_write(&mut self, n: usize) {
        assert!(
            n <= self.available_space(),
            "pre-buffer overflow: wrote {} with {} available",
            n,
            self.available_space()
        );
        self.write_pos += n;
    }

    fn reset(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }
}

impl PreBuffer {
    /// Appends `data`, growing if necessary.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_capacity_for_write(data.len());
        self.compact_for_write(data.len());
        let start = self.write_pos;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.did_write(data.len());
    }

    /// Consumes up to `n` unread bytes into `out`, returning the count moved.
    pub fn drain_into(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.available_bytes());
        out[..n].copy_from_slice(&self.buf[self.read_pos..self.read_pos + n]);
        self.did_read(n);
        n
    }

    // available_space counts the dead zone before read_pos; writable() does
    // not. Slide unread bytes to the front when the tail alone is too small.
    fn compact_for_write(&mut self, needed: usize) {
        if self.buf.len() - self.write_pos >= needed {
            return;
        }
        self.buf.copy_within(self.read_pos..self.write_pos, 0);
        self.write_pos -= self.read_pos;
        self.read_pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursors_start_at_zero() {
        let pb = PreBuffer::with_capacity(16);
        assert_eq!(pb.available_bytes(), 0);
        assert_eq!(pb.available_space(), 16);
    }

    #[test]
    fn invariant_holds_across_operations() {
        let mut pb = PreBuffer::with_capacity(8);
        pb.append(b"abcdef");
        assert_eq!(pb.available_bytes() + pb.available_space(), pb.capacity());
        pb.did_read(3);
        assert_eq!(pb.available_bytes() + pb.available_space(), pb.capacity());
        pb.append(b"ghijklmnop");
        assert_eq!(pb.available_bytes() + pb.available_space(), pb.capacity());
        assert_eq!(pb.readable(), b"defghijklmnop");
    }

    #[test]
    fn exact_fit_growth() {
        let mut pb = PreBuffer::with_capacity(4);
        pb.append(b"ab");
        // 2 available, asking for 5 must grow by exactly 3.
        pb.ensure_capacity_for_write(5);
        assert_eq!(pb.capacity(), 7);
        assert_eq!(pb.available_space(), 5);
        assert_eq!(pb.readable(), b"ab");
    }

    #[test]
    fn full_drain_compacts() {
        let mut pb = PreBuffer::with_capacity(8);
        pb.append(b"xyz");
        pb.did_read(2);
        assert_eq!(pb.readable(), b"z");
        pb.did_read(1);
        // Both cursors reset to zero once drained.
        assert_eq!(pb.available_space(), pb.capacity());
        pb.append(b"ab");
        assert_eq!(pb.readable(), b"ab");
    }

    #[test]
    fn drain_into_partial() {
        let mut pb = PreBuffer::with_capacity(8);
        pb.append(b"hello");
        let mut out = [0u8; 3];
        assert_eq!(pb.drain_into(&mut out), 3);
        assert_eq!(&out, b"hel");
        assert_eq!(pb.readable(), b"lo");
    }

    #[test]
    fn writable_reclaims_consumed_space() {
        let mut pb = PreBuffer::with_capacity(16);
        pb.append(b"0123456789abcdef");
        pb.did_read(4);
        // The tail is exhausted but four consumed bytes are reclaimable; the
        // writable span must never come back empty while space remains.
        assert_eq!(pb.writable().len(), pb.available_space());
        assert_eq!(pb.writable().len(), 4);
        assert_eq!(pb.readable(), b"456789abcdef");
        pb.writable()[..4].copy_from_slice(b"wxyz");
        pb.did_write(4);
        assert_eq!(pb.readable(), b"456789abcdefwxyz");
    }

    #[test]
    #[should_panic]
    fn did_write_past_space_panics() {
        let mut pb = PreBuffer::with_capacity(4);
        pb.did_write(5);
    }
}
