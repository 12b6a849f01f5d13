//! The write pipeline.
//!
//! Writes complete only when every byte has been accepted; a partially
//! flushed operation stays current and re-arms writable interest. On a
//! secured socket "accepted" means accepted by the record layer; leftover
//! ciphertext drains on subsequent writable events.

use super::engine::TcpSocket;
use super::ops::{QueuedWrite, WriteOp};
use super::tls::TlsSession;
use super::{Progress, SocketFlags, Stream, TcpEvent};
use crate::error::Error;
use crate::timer::TimerKind;
use std::io::Write;
use std::time::Duration;
use tracing::{debug, trace};

fn transport_write_from(
    stream: &mut Stream,
    tls: Option<&mut TlsSession>,
    src: &[u8],
) -> Result<usize, Error> {
    match tls {
        Some(session) => session.write(stream, src),
        None => stream.write(src).map_err(Error::from),
    }
}

// ============================================================================
// Write Operations
// ============================================================================

impl TcpSocket {
    /// Queues a write of the full contents of `data`. Empty writes are
    /// ignored.
    pub fn write(
        &mut self,
        data: Vec<u8>,
        timeout: Option<Duration>,
        tag: i64,
    ) -> Result<(), Error> {
        if self.flags.contains(SocketFlags::FORBID_READS_WRITES) {
            return Err(Error::NotConnected);
        }
        if data.is_empty() {
            trace!(tag, "Ignoring empty write");
            return Ok(());
        }
        trace!(tag, len = data.len(), "Queuing write");
        self.write_queue
            .push_back(QueuedWrite::Data(WriteOp::new(data, timeout, tag)));
        self.maybe_dequeue_write();
        Ok(())
    }

    /// Answers a [`TcpEvent::WriteTimedOut`] event. `Some(extra)` grants the
    /// paused write more time; `None` or zero closes the socket with
    /// [`Error::WriteTimeout`].
    pub fn extend_write_timeout(&mut self, extra: Option<Duration>) {
        if !self.flags.contains(SocketFlags::WRITES_PAUSED) {
            return;
        }
        match extra {
            Some(extra) if !extra.is_zero() => {
                debug!(?extra, "Extending write timeout");
                self.flags.remove(SocketFlags::WRITES_PAUSED);
                self.write_timer =
                    Some(self.timers.arm(TimerKind::WriteTimeout, extra, self.generation));
                self.do_write_data();
            }
            _ => self.close_with_error(Some(Error::WriteTimeout)),
        }
    }

    /// Progress of the in-flight write, if any.
    pub fn write_progress(&self) -> Option<Progress> {
        self.current_write.as_ref().map(|op| Progress {
            tag: op.tag,
            bytes_done: op.bytes_done,
            total: Some(op.data.len()),
        })
    }
}

// ============================================================================
// Internal Write Pipeline
// ============================================================================

impl TcpSocket {
    pub(super) fn maybe_dequeue_write(&mut self) {
        if self.current_write.is_some()
            || !self.flags.contains(SocketFlags::CONNECTED)
            || self
                .flags
                .intersects(SocketFlags::WRITES_PAUSED | SocketFlags::STARTING_WRITE_TLS)
        {
            return;
        }
        match self.write_queue.pop_front() {
            Some(QueuedWrite::Data(op)) => {
                if let Some(timeout) = op.timeout {
                    self.write_timer =
                        Some(self.timers.arm(TimerKind::WriteTimeout, timeout, self.generation));
                }
                trace!(tag = op.tag, "Dequeued write");
                self.current_write = Some(op);
                self.do_write_data();
            }
            Some(QueuedWrite::StartTls) => {
                self.flags.insert(SocketFlags::STARTING_WRITE_TLS);
                self.maybe_begin_tls_handshake();
            }
            None => self.maybe_close_deferred(),
        }
    }

    pub(super) fn do_write_data(&mut self) {
        if !self.flags.contains(SocketFlags::CONNECTED)
            || self.flags.contains(SocketFlags::WRITES_PAUSED)
        {
            return;
        }
        if self.tls.as_ref().is_some_and(TlsSession::is_handshaking) {
            return;
        }

        let Some(mut op) = self.current_write.take() else {
            // Writable with nothing queued: drain any leftover ciphertext.
            self.flush_tls_backlog();
            return;
        };

        let secure = self.flags.contains(SocketFlags::IS_SECURE);
        let mut wrote = 0;
        let mut error = None;
        {
            let Some(stream) = self.stream.as_mut() else {
                self.current_write = Some(op);
                return;
            };
            let mut tls = if secure { self.tls.as_mut() } else { None };
            while !op.is_complete() {
                match transport_write_from(stream, tls.as_deref_mut(), op.remaining()) {
                    Ok(0) => break,
                    Ok(n) => {
                        op.bytes_done += n;
                        wrote += n;
                    }
                    Err(err) if err.would_block() => break,
                    Err(err) => {
                        error = Some(err);
                        break;
                    }
                }
            }
        }

        if let Some(err) = error {
            self.current_write = Some(op);
            self.close_with_error(Some(err));
            return;
        }
        if op.is_complete() {
            self.write_timer = None;
            debug!(tag = op.tag, len = op.data.len(), "Write completed");
            self.events.push(TcpEvent::WriteCompleted { tag: op.tag });
            self.maybe_close_deferred();
            if self.flags.contains(SocketFlags::STARTED) {
                self.maybe_dequeue_write();
            }
        } else {
            if wrote > 0 {
                self.events.push(TcpEvent::WritePartial {
                    tag: op.tag,
                    bytes_done: op.bytes_done,
                });
            }
            self.current_write = Some(op);
        }
        self.update_interest();
    }

    fn flush_tls_backlog(&mut self) {
        let mut error = None;
        if let (Some(stream), Some(tls)) = (self.stream.as_mut(), self.tls.as_mut()) {
            if let Err(err) = tls.flush_ciphertext(stream) {
                error = Some(err);
            }
        }
        if let Some(err) = error {
            self.close_with_error(Some(err));
            return;
        }
        self.update_interest();
    }
}
