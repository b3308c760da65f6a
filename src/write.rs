//! Buffered non-blocking write side with deferred-write and delayed close.

use std::os::fd::RawFd;

use crate::error::is_retryable;
use crate::{interest, sys, Handler, Multiplexer};

/// Default per-attempt write cap, sized to a pipe buffer.
pub const DEFAULT_WRITE_SIZE: usize = 4096;

type WriteCallback<H> = Box<dyn FnOnce(&mut H, &mut Multiplexer)>;

/// Output-buffer state machine embedded in every writing handler.
///
/// The presence of the pending buffer is the signal that write readiness is
/// being listened for. `more` runs when the buffer empties (and may refill
/// it); `closing` runs once the buffer has drained for good and the
/// underlying close may proceed.
pub struct Writer<H: ?Sized> {
    pending: Option<Vec<u8>>,
    write_size: usize,
    more: Option<WriteCallback<H>>,
    closing: Option<WriteCallback<H>>,
}

impl<H: ?Sized> Writer<H> {
    pub fn new() -> Self {
        Self::with_write_size(DEFAULT_WRITE_SIZE)
    }

    pub fn with_write_size(write_size: usize) -> Self {
        Self {
            pending: None,
            write_size: write_size.max(1),
            more: None,
            closing: None,
        }
    }

    /// Bytes queued but not yet accepted by the descriptor.
    pub fn pending_len(&self) -> usize {
        self.pending.as_ref().map_or(0, Vec::len)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn write_size(&self) -> usize {
        self.write_size
    }

    pub fn set_write_size(&mut self, write_size: usize) {
        self.write_size = write_size.max(1);
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.is_some()
    }

    pub(crate) fn take_more(&mut self) -> Option<WriteCallback<H>> {
        self.more.take()
    }

    pub(crate) fn take_closing(&mut self) -> Option<WriteCallback<H>> {
        self.closing.take()
    }

    pub(crate) fn set_closing(&mut self, closing: WriteCallback<H>) {
        self.closing = Some(closing);
    }
}

impl<H: ?Sized> Default for Writer<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// Capability trait for handlers with a buffered write side.
pub trait WriteSide: Handler + Sized {
    fn writer(&self) -> &Writer<Self>;
    fn writer_mut(&mut self) -> &mut Writer<Self>;

    /// Descriptor the write side operates on; composite handlers override.
    fn write_fd(&self) -> RawFd {
        self.core().fd()
    }

    /// Adjusts write interest on [`write_fd`](WriteSide::write_fd),
    /// mirroring it in the core when they are the same descriptor.
    fn set_write_interest(&mut self, mux: &mut Multiplexer, on: bool) {
        let fd = self.write_fd();
        if fd == self.core().fd() {
            self.core_mut().apply(on, interest().write());
        }
        if let Err(e) = mux.fdset(fd, on, interest().write()) {
            tracing::warn!(handler = %self.core().name(), error = %e, "interest update failed");
        }
    }

    /// Queues `bytes`, writing as much as the descriptor accepts right now.
    ///
    /// At most `write_size` bytes go out per attempt; whatever the
    /// descriptor does not take is buffered and drained on write-readiness
    /// ticks. Retryable failures buffer everything; any other failure logs
    /// and closes the handler.
    fn write(&mut self, mux: &mut Multiplexer, bytes: &[u8]) {
        self.write_impl(mux, bytes, None);
    }

    /// Like [`write`](WriteSide::write), with `more` invoked once the
    /// buffer next empties — the hook for demand-driven refills.
    fn write_then<F>(&mut self, mux: &mut Multiplexer, bytes: &[u8], more: F)
    where
        F: FnOnce(&mut Self, &mut Multiplexer) + 'static,
    {
        self.write_impl(mux, bytes, Some(Box::new(more)));
    }

    #[doc(hidden)]
    fn write_impl(&mut self, mux: &mut Multiplexer, bytes: &[u8], more: Option<WriteCallback<Self>>) {
        if self.writer().has_pending() {
            let writer = self.writer_mut();
            writer.pending.as_mut().unwrap().extend_from_slice(bytes);
            writer.more = more;
            return;
        }

        let fd = self.write_fd();
        let cap = bytes.len().min(self.writer().write_size());
        match sys::write(fd, &bytes[..cap]) {
            Ok(n) if n == bytes.len() => {
                if let Some(more) = more {
                    more(self, mux);
                }
                if !self.writer().has_pending() {
                    if let Some(closing) = self.writer_mut().closing.take() {
                        closing(self, mux);
                    }
                }
            }
            Ok(n) => {
                let writer = self.writer_mut();
                writer.pending = Some(bytes[n..].to_vec());
                writer.more = more;
                self.set_write_interest(mux, true);
            }
            Err(ref e) if is_retryable(e) => {
                let writer = self.writer_mut();
                writer.pending = Some(bytes.to_vec());
                writer.more = more;
                self.set_write_interest(mux, true);
            }
            Err(e) => {
                tracing::warn!(handler = %self.core().name(), error = %e, "write failed");
                self.on_write_error(mux);
            }
        }
    }

    /// Raw writable tick: drains up to `write_size` bytes of the pending
    /// buffer, firing [`on_outbuf_empty`](WriteSide::on_outbuf_empty) when
    /// it empties (or when there was nothing pending at all).
    fn drain(&mut self, mux: &mut Multiplexer) {
        let Some(buf) = self.writer().pending.as_deref() else {
            self.on_outbuf_empty(mux);
            return;
        };
        let fd = self.write_fd();
        let cap = buf.len().min(self.writer().write_size());
        let total = buf.len();
        match sys::write(fd, &buf[..cap]) {
            Ok(n) if n == total => {
                self.writer_mut().pending = None;
                self.on_outbuf_empty(mux);
            }
            Ok(n) => {
                let writer = self.writer_mut();
                writer.pending.as_mut().unwrap().drain(..n);
            }
            Err(ref e) if is_retryable(e) => {}
            Err(e) => {
                tracing::warn!(handler = %self.core().name(), error = %e, "write failed");
                self.on_write_error(mux);
            }
        }
    }

    /// The output buffer just emptied. The default runs the `more` refill
    /// hook, then — if the buffer is still empty — stops listening for
    /// write readiness and fires the delayed-close continuation if armed.
    /// Subclasses override to refill instead.
    fn on_outbuf_empty(&mut self, mux: &mut Multiplexer) {
        if let Some(more) = self.writer_mut().more.take() {
            more(self, mux);
        }
        if !self.writer().has_pending() {
            self.set_write_interest(mux, false);
            if let Some(closing) = self.writer_mut().closing.take() {
                closing(self, mux);
            }
        }
    }

    /// Transient write failure: the default detaches the handler,
    /// discarding whatever was still buffered.
    fn on_write_error(&mut self, mux: &mut Multiplexer) {
        mux.detach(self.core().fd());
    }

    /// Closes the write side, delaying the underlying close until the
    /// pending buffer has drained. Closing twice is a no-op.
    fn close(&mut self, mux: &mut Multiplexer) {
        self.close_then(mux, |_, _| {});
    }

    /// Like [`close`](WriteSide::close); `after` runs exactly once, after
    /// the buffer has drained and the descriptor is closed.
    fn close_then<F>(&mut self, mux: &mut Multiplexer, after: F)
    where
        F: FnOnce(&mut Self, &mut Multiplexer) + 'static,
    {
        if self.core().is_closed() || self.writer().is_closing() {
            return;
        }
        if self.writer().has_pending() {
            self.writer_mut().closing = Some(Box::new(move |h: &mut Self, mux: &mut Multiplexer| {
                h.finish_close(mux);
                after(h, mux);
            }));
        } else {
            self.finish_close(mux);
            after(self, mux);
        }
    }

    /// Performs the actual teardown once no output is pending. The default
    /// detaches from the multiplexer; process-backed handlers override to
    /// reap their child first.
    fn finish_close(&mut self, mux: &mut Multiplexer) {
        self.core_mut().mark_closed();
        mux.detach(self.core().fd());
    }
}
