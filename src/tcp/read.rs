//! The read pipeline.
//!
//! One read operation is in flight at a time; data is consumed from the
//! pre-buffer first, then from the transport. Readiness that arrives with no
//! queued read lands in the pre-buffer so edge-triggered notification is
//! never lost.

use super::engine::TcpSocket;
use super::interface::ReadRequest;
use super::ops::{QueuedRead, ReadOp};
use super::tls::TlsSession;
use super::{Progress, SocketFlags, Stream, TcpEvent};
use crate::buffer::SocketBuffer;
use crate::error::Error;
use crate::timer::TimerKind;
use std::io::Read;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

// Outcome of one pass over the current read operation.
#[derive(Debug, Default)]
struct ReadCycle {
    bytes_read: usize,
    socket_eof: bool,
    read_into_prebuffer: bool,
    done: bool,
    maxed_out: bool,
    error: Option<Error>,
}

fn transport_read_into(
    stream: &mut Stream,
    tls: Option<&mut TlsSession>,
    dst: &mut [u8],
) -> Result<usize, Error> {
    match tls {
        Some(session) => session.read(stream, dst),
        None => stream.read(dst).map_err(Error::from),
    }
}

// ============================================================================
// Read Operations
// ============================================================================

impl TcpSocket {
    /// Queues a read that completes with whatever data arrives next.
    pub fn read_data(&mut self, timeout: Option<Duration>, tag: i64) -> Result<(), Error> {
        self.enqueue_read(ReadRequest {
            buffer: None,
            offset: 0,
            read_length: None,
            terminator: None,
            max_length: None,
            timeout,
            tag,
        })
    }

    /// Queues a read of exactly `length` bytes.
    pub fn read_to_length(
        &mut self,
        length: usize,
        timeout: Option<Duration>,
        tag: i64,
    ) -> Result<(), Error> {
        self.enqueue_read(ReadRequest {
            buffer: None,
            offset: 0,
            read_length: Some(length),
            terminator: None,
            max_length: None,
            timeout,
            tag,
        })
    }

    /// Queues a read of exactly `length` bytes into a caller-supplied buffer
    /// starting at `offset`. The completed event returns the buffer with the
    /// prefix before `offset` preserved.
    pub fn read_to_length_with_buffer(
        &mut self,
        buffer: Vec<u8>,
        offset: usize,
        length: usize,
        timeout: Option<Duration>,
        tag: i64,
    ) -> Result<(), Error> {
        self.enqueue_read(ReadRequest {
            buffer: Some(buffer),
            offset,
            read_length: Some(length),
            terminator: None,
            max_length: None,
            timeout,
            tag,
        })
    }

    /// Queues a read that completes when `terminator` is seen. The delivered
    /// data includes the terminator. Exceeding `max_length` without finding
    /// it closes the socket with [`Error::ReadMaxedOut`].
    pub fn read_to_terminator(
        &mut self,
        terminator: Vec<u8>,
        max_length: Option<usize>,
        timeout: Option<Duration>,
        tag: i64,
    ) -> Result<(), Error> {
        self.enqueue_read(ReadRequest {
            buffer: None,
            offset: 0,
            read_length: None,
            terminator: Some(terminator),
            max_length,
            timeout,
            tag,
        })
    }

    /// Terminator read into a caller-supplied buffer, like
    /// [`read_to_length_with_buffer`](Self::read_to_length_with_buffer).
    pub fn read_to_terminator_with_buffer(
        &mut self,
        buffer: Vec<u8>,
        offset: usize,
        terminator: Vec<u8>,
        max_length: Option<usize>,
        timeout: Option<Duration>,
        tag: i64,
    ) -> Result<(), Error> {
        self.enqueue_read(ReadRequest {
            buffer: Some(buffer),
            offset,
            read_length: None,
            terminator: Some(terminator),
            max_length,
            timeout,
            tag,
        })
    }

    /// Answers a [`TcpEvent::ReadTimedOut`] event. `Some(extra)` grants the
    /// paused read more time; `None` or zero closes the socket with
    /// [`Error::ReadTimeout`].
    pub fn extend_read_timeout(&mut self, extra: Option<Duration>) {
        if !self.flags.contains(SocketFlags::READS_PAUSED) {
            return;
        }
        match extra {
            Some(extra) if !extra.is_zero() => {
                debug!(?extra, "Extending read timeout");
                self.flags.remove(SocketFlags::READS_PAUSED);
                self.read_timer =
                    Some(self.timers.arm(TimerKind::ReadTimeout, extra, self.generation));
                self.do_read_data();
            }
            _ => self.close_with_error(Some(Error::ReadTimeout)),
        }
    }

    /// Progress of the in-flight read, if any.
    pub fn read_progress(&self) -> Option<Progress> {
        self.current_read.as_ref().map(|op| Progress {
            tag: op.tag,
            bytes_done: op.bytes_done,
            total: op.read_length,
        })
    }
}

// ============================================================================
// Internal Read Pipeline
// ============================================================================

impl TcpSocket {
    pub(super) fn enqueue_read(&mut self, request: ReadRequest) -> Result<(), Error> {
        if self.flags.contains(SocketFlags::FORBID_READS_WRITES) {
            return Err(Error::NotConnected);
        }
        if let Some(length) = request.read_length {
            if length == 0 {
                return Err(Error::InvalidReadParameter("read length must be positive"));
            }
            if request.terminator.is_some() {
                return Err(Error::InvalidReadParameter(
                    "length and terminator are mutually exclusive",
                ));
            }
        }
        if let Some(terminator) = &request.terminator {
            if terminator.is_empty() {
                return Err(Error::InvalidReadParameter("terminator must not be empty"));
            }
            if let Some(max_length) = request.max_length {
                if terminator.len() > max_length {
                    return Err(Error::TerminatorTooLong {
                        terminator: terminator.len(),
                        max_length,
                    });
                }
            }
        }
        if request.max_length == Some(0) {
            return Err(Error::InvalidReadParameter("max length must be positive"));
        }
        if let Some(buffer) = &request.buffer {
            if request.offset > buffer.len() {
                return Err(Error::InvalidReadParameter("offset exceeds buffer length"));
            }
        }

        trace!(tag = request.tag, "Queuing read");
        self.read_queue.push_back(QueuedRead::Data(ReadOp::new(
            request.buffer,
            request.offset,
            request.read_length,
            request.terminator,
            request.max_length,
            request.timeout,
            request.tag,
        )));
        self.maybe_dequeue_read();
        Ok(())
    }

    pub(super) fn maybe_dequeue_read(&mut self) {
        if self.current_read.is_some()
            || !self.flags.contains(SocketFlags::CONNECTED)
            || self
                .flags
                .intersects(SocketFlags::READS_PAUSED | SocketFlags::STARTING_READ_TLS)
        {
            return;
        }
        match self.read_queue.pop_front() {
            Some(QueuedRead::Data(op)) => {
                if let Some(timeout) = op.timeout {
                    self.read_timer =
                        Some(self.timers.arm(TimerKind::ReadTimeout, timeout, self.generation));
                }
                trace!(tag = op.tag, "Dequeued read");
                self.current_read = Some(op);
                self.do_read_data();
            }
            Some(QueuedRead::StartTls(options)) => {
                self.flags.insert(SocketFlags::STARTING_READ_TLS);
                self.pending_tls = Some(options);
                self.maybe_begin_tls_handshake();
            }
            None => self.maybe_close_deferred(),
        }
    }

    // One full read cycle: pre-buffer first, then the transport, then
    // completion bookkeeping.
    pub(super) fn do_read_data(&mut self) {
        if !self.flags.contains(SocketFlags::CONNECTED)
            || self.flags.contains(SocketFlags::READS_PAUSED)
        {
            return;
        }
        if self.tls.as_ref().is_some_and(TlsSession::is_handshaking) {
            return;
        }

        let Some(mut op) = self.current_read.take() else {
            self.absorb_into_pre_buffer();
            return;
        };

        let mut cycle = ReadCycle {
            socket_eof: self.flags.contains(SocketFlags::HAS_READ_EOF),
            ..ReadCycle::default()
        };

        // Alternate drain and transport passes: a speculative read lands in
        // the pre-buffer and loops back through the drain step so terminator
        // and max-length policy apply in one place.
        loop {
            self.step_drain_pre_buffer(&mut op, &mut cycle);
            if cycle.done || cycle.maxed_out || cycle.socket_eof || cycle.error.is_some() {
                break;
            }
            cycle.read_into_prebuffer = false;
            self.step_read_transport(&mut op, &mut cycle);
            if !cycle.read_into_prebuffer {
                break;
            }
        }
        if cycle.socket_eof {
            self.flags.insert(SocketFlags::HAS_READ_EOF);
        }
        Self::step_reconcile(&op, &mut cycle);
        self.step_finalize(op, cycle);
    }

    // Consumes pre-buffered bytes into the operation, honoring terminator
    // and max-length semantics.
    fn step_drain_pre_buffer(&mut self, op: &mut ReadOp, cycle: &mut ReadCycle) {
        while self.pre_buffer.available_bytes() > 0 && !cycle.done && !cycle.maxed_out {
            if op.terminator.is_some() {
                let (scan, found) =
                    op.read_length_for_term_with_prebuffer(self.pre_buffer.readable());
                let allowed = op.max_remaining();
                if found && scan <= allowed {
                    let moved = self.pre_buffer.drain_into(op.fill_window(scan));
                    debug_assert_eq!(moved, scan);
                    op.bytes_done += scan;
                    cycle.bytes_read += scan;
                    cycle.done = true;
                } else {
                    let take = scan.min(allowed);
                    if take > 0 {
                        let moved = self.pre_buffer.drain_into(op.fill_window(take));
                        debug_assert_eq!(moved, take);
                        op.bytes_done += take;
                        cycle.bytes_read += take;
                    }
                    // `found` here means the terminator completes past the
                    // max-length budget; either way the budget is spent.
                    if found || op.max_remaining() == 0 {
                        cycle.maxed_out = true;
                    }
                    break;
                }
            } else if let Some(remaining) = op.length_remaining() {
                if remaining == 0 {
                    cycle.done = true;
                    break;
                }
                let take = remaining.min(self.pre_buffer.available_bytes());
                let moved = self.pre_buffer.drain_into(op.fill_window(take));
                debug_assert_eq!(moved, take);
                op.bytes_done += take;
                cycle.bytes_read += take;
                if op.length_remaining() == Some(0) {
                    cycle.done = true;
                }
            } else {
                // Read-whatever-arrives, bounded by max_length when present.
                let take = self.pre_buffer.available_bytes().min(op.max_remaining());
                if take > 0 {
                    let moved = self.pre_buffer.drain_into(op.fill_window(take));
                    debug_assert_eq!(moved, take);
                    op.bytes_done += take;
                    cycle.bytes_read += take;
                }
                if op.max_length.is_some() && op.max_remaining() == 0 {
                    cycle.done = true;
                }
                break;
            }
        }
    }

    // Reads from the transport until the operation resolves or the socket
    // would block.
    fn step_read_transport(&mut self, op: &mut ReadOp, cycle: &mut ReadCycle) {
        let secure = self.flags.contains(SocketFlags::IS_SECURE);
        let max_read = self.tunables.max_read_size;
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        let mut tls = if secure { self.tls.as_mut() } else { None };

        while !cycle.done && !cycle.maxed_out {
            let (want, via_prebuffer) = op.optimal_read_length(max_read);
            if want == 0 {
                if op.terminator.is_some() {
                    cycle.maxed_out = true;
                } else {
                    cycle.done = true;
                }
                break;
            }

            if via_prebuffer {
                // Speculative amount with no room in the operation's own
                // buffer: land in the pre-buffer and let the drain pass
                // apply the completion policy.
                self.pre_buffer.ensure_capacity_for_write(want);
                match transport_read_into(
                    stream,
                    tls.as_deref_mut(),
                    &mut self.pre_buffer.writable()[..want],
                ) {
                    Ok(0) => cycle.socket_eof = true,
                    Ok(n) => {
                        self.pre_buffer.did_write(n);
                        cycle.read_into_prebuffer = true;
                    }
                    Err(err) if err.would_block() => {}
                    Err(err) => cycle.error = Some(err),
                }
                break;
            }

            match transport_read_into(stream, tls.as_deref_mut(), op.fill_window(want)) {
                Ok(0) => {
                    cycle.socket_eof = true;
                    break;
                }
                Ok(n) => {
                    op.bytes_done += n;
                    cycle.bytes_read += n;
                    if op.terminator.is_some() {
                        if let Some(overflow) = op.search_terminator_after_append(n) {
                            if overflow > 0 {
                                // Bytes past the terminator belong to the
                                // next operation.
                                let end = op.start_offset + op.bytes_done;
                                self.pre_buffer.append(&op.buffer[end - overflow..end]);
                                op.bytes_done -= overflow;
                                cycle.bytes_read -= overflow;
                            }
                            cycle.done = true;
                            break;
                        }
                        if op.max_remaining() == 0 {
                            cycle.maxed_out = true;
                            break;
                        }
                    } else if op.length_remaining() == Some(0) {
                        cycle.done = true;
                        break;
                    }
                }
                Err(err) if err.would_block() => break,
                Err(err) => {
                    cycle.error = Some(err);
                    break;
                }
            }
        }
    }

    fn step_reconcile(op: &ReadOp, cycle: &mut ReadCycle) {
        if cycle.done || cycle.maxed_out || cycle.error.is_some() {
            return;
        }
        // A read-whatever-arrives completes on any progress at all.
        if op.read_length.is_none() && op.terminator.is_none() && cycle.bytes_read > 0 {
            cycle.done = true;
        }
    }

    fn step_finalize(&mut self, op: ReadOp, cycle: ReadCycle) {
        if let Some(err) = cycle.error {
            self.current_read = Some(op);
            self.close_with_error(Some(err));
            return;
        }
        if cycle.maxed_out {
            warn!(tag = op.tag, "Read reached max length without terminator");
            let max = op.max_length.unwrap_or(op.bytes_done);
            self.current_read = Some(op);
            self.close_with_error(Some(Error::ReadMaxedOut(max)));
            return;
        }
        if cycle.done {
            self.read_timer = None;
            let tag = op.tag;
            let mut data = op.buffer;
            data.truncate(op.start_offset + op.bytes_done);
            debug!(tag, len = data.len(), "Read completed");
            self.events.push(TcpEvent::ReadCompleted { tag, data });
            self.maybe_close_deferred();
            if self.flags.contains(SocketFlags::STARTED) {
                self.maybe_dequeue_read();
                if cycle.socket_eof {
                    self.handle_read_eof();
                }
            }
            return;
        }

        if cycle.bytes_read > 0 {
            self.events.push(TcpEvent::ReadPartial {
                tag: op.tag,
                bytes_done: op.bytes_done,
            });
        }
        self.current_read = Some(op);
        if cycle.socket_eof {
            self.handle_read_eof();
        }
    }

    // Readiness arrived with no queued read: pull a bounded amount into the
    // pre-buffer so the edge-triggered notification is not lost.
    fn absorb_into_pre_buffer(&mut self) {
        if self.flags.contains(SocketFlags::HAS_READ_EOF) {
            return;
        }
        let budget = self.tunables.max_read_size;
        let chunk = self.tunables.pre_buffer_capacity.max(512);
        let secure = self.flags.contains(SocketFlags::IS_SECURE);

        let mut eof = false;
        let mut fatal = None;
        {
            let Some(stream) = self.stream.as_mut() else {
                return;
            };
            let mut tls = if secure { self.tls.as_mut() } else { None };
            let mut total = 0;
            while total < budget {
                if self.pre_buffer.available_space() == 0 {
                    self.pre_buffer.ensure_capacity_for_write(chunk);
                }
                match transport_read_into(stream, tls.as_deref_mut(), self.pre_buffer.writable()) {
                    Ok(0) => {
                        eof = true;
                        break;
                    }
                    Ok(n) => {
                        self.pre_buffer.did_write(n);
                        total += n;
                    }
                    Err(err) if err.would_block() => break,
                    Err(err) => {
                        fatal = Some(err);
                        break;
                    }
                }
            }
            if total > 0 {
                trace!(len = total, "Buffered unsolicited data");
            }
        }

        if let Some(err) = fatal {
            self.close_with_error(Some(err));
            return;
        }
        if eof {
            self.flags.insert(SocketFlags::HAS_READ_EOF);
            self.handle_read_eof();
        }
    }

    // Transport EOF policy. In half-duplex mode a socket that can still
    // write stays open with its read side marked closed; otherwise the
    // socket closes with `ClosedByPeer`. Deferred while the pre-buffer still
    // holds data queued reads could consume.
    pub(super) fn handle_read_eof(&mut self) {
        if !self.flags.contains(SocketFlags::STARTED)
            || self.flags.contains(SocketFlags::READ_STREAM_CLOSED)
        {
            return;
        }
        if self.pre_buffer.available_bytes() > 0 {
            return;
        }
        let writable = self.stream.as_ref().is_some_and(Stream::probe_writable);
        if self.tunables.half_duplex && writable {
            info!("Peer closed its write side; continuing half-duplex");
            self.flags.insert(SocketFlags::READ_STREAM_CLOSED);
            self.events.push(TcpEvent::ReadStreamClosed);
            self.update_interest();
            return;
        }
        self.close_with_error(Some(Error::ClosedByPeer));
    }
}
