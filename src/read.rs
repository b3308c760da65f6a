//! Buffered non-blocking read side and its callback combinators.

use std::mem;
use std::os::fd::RawFd;

use crate::error::is_retryable;
use crate::{interest, sys, Handler, Multiplexer};

pub const DEFAULT_READ_SIZE: usize = 32768;

type ReadCallback<H> = Box<dyn FnOnce(&mut H, &mut Multiplexer, Vec<u8>)>;

enum Pending<H: ?Sized> {
    Line(ReadCallback<H>),
    Slurp(ReadCallback<H>),
}

/// Input-buffer state machine embedded in every reading handler.
///
/// Bytes arrive through the non-blocking pump; combinators either consume
/// them synchronously or park a single-shot continuation that the next
/// chunk (or EOF) resumes. Once the EOF bit is set no further reads occur.
pub struct Reader<H: ?Sized> {
    buf: Vec<u8>,
    eof: bool,
    read_size: usize,
    pending: Option<Pending<H>>,
}

impl<H: ?Sized> Reader<H> {
    pub fn new() -> Self {
        Self::with_read_size(DEFAULT_READ_SIZE)
    }

    pub fn with_read_size(read_size: usize) -> Self {
        Self {
            buf: Vec::new(),
            eof: false,
            read_size: read_size.max(1),
            pending: None,
        }
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    pub fn buffer_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn read_size(&self) -> usize {
        self.read_size
    }

    pub fn set_read_size(&mut self, read_size: usize) {
        self.read_size = read_size.max(1);
    }

    pub(crate) fn set_eof(&mut self) {
        self.eof = true;
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Extracts the first complete line, if any.
    ///
    /// Both `LF` and `CRLF` terminate a line; the returned bytes always end
    /// in a single `\n`. A bare `CR` is not a terminator.
    pub(crate) fn take_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        line.push(b'\n');
        Some(line)
    }
}

impl<H: ?Sized> Default for Reader<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// Capability trait for handlers with a buffered read side.
///
/// Provides the non-blocking pump plus the `read_line`/`slurp` combinators.
/// Combinators deliver synchronously when the buffer already satisfies
/// them, otherwise they park a continuation; only one may be in flight —
/// installing a second while one is pending is a bug and panics.
pub trait ReadSide: Handler + Sized {
    fn reader(&self) -> &Reader<Self>;
    fn reader_mut(&mut self) -> &mut Reader<Self>;

    /// Descriptor the read side operates on; composite handlers override.
    fn read_fd(&self) -> RawFd {
        self.core().fd()
    }

    /// Adjusts read interest on [`read_fd`](ReadSide::read_fd), mirroring
    /// it in the core when they are the same descriptor.
    fn set_read_interest(&mut self, mux: &mut Multiplexer, on: bool) {
        let fd = self.read_fd();
        if fd == self.core().fd() {
            self.core_mut().apply(on, interest().read());
        }
        if let Err(e) = mux.fdset(fd, on, interest().read()) {
            tracing::warn!(handler = %self.core().name(), error = %e, "interest update failed");
        }
    }

    /// Raw readable tick: one non-blocking read of up to `read_size` bytes.
    ///
    /// Fresh bytes go through [`on_input`](ReadSide::on_input); a
    /// zero-length read clears read interest, latches EOF, and fires
    /// [`on_eof`](ReadSide::on_eof). Retryable failures wait for the next
    /// tick; anything else logs and closes the handler.
    fn pump(&mut self, mux: &mut Multiplexer) {
        if self.reader().is_eof() {
            return;
        }
        let fd = self.read_fd();
        let want = self.reader().read_size();
        let result = {
            let reader = self.reader_mut();
            sys::read_append(fd, reader.buffer_mut(), want)
        };
        match result {
            Ok(0) => {
                self.set_read_interest(mux, false);
                self.reader_mut().set_eof();
                self.on_eof(mux);
            }
            Ok(_) => self.on_input(mux),
            Err(ref e) if is_retryable(e) => {}
            Err(e) => {
                tracing::warn!(handler = %self.core().name(), error = %e, "read failed");
                self.on_read_error(mux);
            }
        }
    }

    /// Invoked when fresh bytes are in the buffer. The default resumes the
    /// parked combinator continuation, if any.
    fn on_input(&mut self, mux: &mut Multiplexer) {
        resume(self, mux);
    }

    /// Invoked once when EOF is observed. The default resumes the parked
    /// continuation so it can flush the remainder.
    fn on_eof(&mut self, mux: &mut Multiplexer) {
        resume(self, mux);
    }

    /// Transient read failure: the default detaches the handler.
    fn on_read_error(&mut self, mux: &mut Multiplexer) {
        mux.detach(self.core().fd());
    }

    /// Delivers the next line to `cb`.
    ///
    /// Lines are terminated by `LF` or `CRLF` and delivered ending in `\n`.
    /// If EOF is already latched and no terminator is present, the
    /// remaining bytes are delivered as the final (possibly empty,
    /// unterminated) line. Delivery is synchronous when the buffer already
    /// holds a line; otherwise the callback is parked.
    fn read_line<F>(&mut self, mux: &mut Multiplexer, cb: F)
    where
        F: FnOnce(&mut Self, &mut Multiplexer, Vec<u8>) + 'static,
    {
        assert!(
            !self.reader().has_pending(),
            "read combinator already pending on handler `{}`",
            self.core().name()
        );
        if let Some(line) = self.reader_mut().take_line() {
            cb(self, mux, line);
        } else if self.reader().is_eof() {
            let rest = mem::take(self.reader_mut().buffer_mut());
            cb(self, mux, rest);
        } else {
            self.reader_mut().pending = Some(Pending::Line(Box::new(cb)));
        }
    }

    /// Delivers the entire input, once EOF has been observed, to `cb`.
    fn slurp<F>(&mut self, mux: &mut Multiplexer, cb: F)
    where
        F: FnOnce(&mut Self, &mut Multiplexer, Vec<u8>) + 'static,
    {
        assert!(
            !self.reader().has_pending(),
            "read combinator already pending on handler `{}`",
            self.core().name()
        );
        if self.reader().is_eof() {
            let all = mem::take(self.reader_mut().buffer_mut());
            cb(self, mux, all);
        } else {
            self.reader_mut().pending = Some(Pending::Slurp(Box::new(cb)));
        }
    }
}

/// Resumes a parked combinator continuation if the buffer (or EOF) can now
/// satisfy it. Continuations are single-shot: they are taken out before the
/// attempt, and re-parked untouched when not yet satisfiable.
pub(crate) fn resume<H: ReadSide>(handler: &mut H, mux: &mut Multiplexer) {
    let Some(pending) = handler.reader_mut().pending.take() else {
        return;
    };
    match pending {
        Pending::Line(cb) => {
            if let Some(line) = handler.reader_mut().take_line() {
                cb(handler, mux, line);
            } else if handler.reader().is_eof() {
                let rest = mem::take(handler.reader_mut().buffer_mut());
                cb(handler, mux, rest);
            } else {
                handler.reader_mut().pending = Some(Pending::Line(cb));
            }
        }
        Pending::Slurp(cb) => {
            if handler.reader().is_eof() {
                let all = mem::take(handler.reader_mut().buffer_mut());
                cb(handler, mux, all);
            } else {
                handler.reader_mut().pending = Some(Pending::Slurp(cb));
            }
        }
    }
}
