//! Three-pipe child-process handler: the `|-|` and `|=|` open modes.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

use crate::pipe::{bare_pipe, reap, spawn_child, ChildIo};
use crate::read::{ReadSide, Reader};
use crate::write::{WriteSide, Writer};
use crate::{interest, sys, Handler, HandlerCore, Interest, Multiplexer, Result};

type ErrorHook = Box<dyn FnMut(&mut Bundle, &mut Multiplexer)>;

/// One child process presented as a single virtual handler: a write side
/// feeding its stdin, a read side draining its stdout, and optionally a
/// second read side capturing its stderr.
///
/// The bundle registers under its stdout descriptor; the stdin and stderr
/// descriptors enter the handler table as aliases of it, so every readiness
/// tick lands here and is routed by descriptor number.
///
/// Lifecycle: [`close_stdin`](Bundle::close_stdin) signals EOF to the child
/// while stdout keeps draining (the `tee`-style shape); the bundle tears
/// itself down once stdin is closed and both read sides have seen EOF.
/// [`close`](crate::WriteSide::close) runs the full chain — drain stdin,
/// close all three pipes, reap the child — before the user continuation.
pub struct Bundle {
    core: HandlerCore,
    stdout_fd: OwnedFd,
    stdin_fd: Option<OwnedFd>,
    stdin_raw: RawFd,
    stderr_fd: Option<OwnedFd>,
    stderr_raw: Option<RawFd>,
    pid: Pid,
    status: Option<WaitStatus>,
    reader: Reader<Self>,
    writer: Writer<Self>,
    err_buf: Vec<u8>,
    err_eof: bool,
    error_hook: Option<ErrorHook>,
    stdin_closed: bool,
}

impl Bundle {
    /// Spawns `cmd` piped both ways, stderr discarded (`|-|`).
    pub fn spawn(cmd: &str, args: &[&str]) -> Result<Self> {
        Self::spawn_inner(cmd, args, false)
    }

    /// Spawns `cmd` piped both ways with stderr captured (`|=|`).
    pub fn spawn_with_stderr(cmd: &str, args: &[&str]) -> Result<Self> {
        Self::spawn_inner(cmd, args, true)
    }

    fn spawn_inner(cmd: &str, args: &[&str], capture_stderr: bool) -> Result<Self> {
        let (in_rd, in_wr) = bare_pipe()?;
        let (out_rd, out_wr) = bare_pipe()?;
        let (err_rd, err_wr) = if capture_stderr {
            let (r, w) = bare_pipe()?;
            (Some(r), Some(w))
        } else {
            (None, None)
        };

        let mut parent_ends = vec![in_wr.as_raw_fd(), out_rd.as_raw_fd()];
        if let Some(e) = &err_rd {
            parent_ends.push(e.as_raw_fd());
        }
        let pid = spawn_child(
            cmd,
            args,
            ChildIo {
                stdin: Some(in_rd),
                stdout: Some(out_wr),
                stderr: err_wr,
            },
            &parent_ends,
        )?;

        sys::set_nonblocking(in_wr.as_raw_fd())?;
        sys::set_nonblocking(out_rd.as_raw_fd())?;
        if let Some(e) = &err_rd {
            sys::set_nonblocking(e.as_raw_fd())?;
        }

        let stdin_raw = in_wr.as_raw_fd();
        let stderr_raw = err_rd.as_ref().map(AsRawFd::as_raw_fd);
        Ok(Self {
            core: HandlerCore::new(out_rd.as_raw_fd(), format!("bundle:{cmd}")),
            stdout_fd: out_rd,
            stdin_fd: Some(in_wr),
            stdin_raw,
            stderr_fd: err_rd,
            stderr_raw,
            pid,
            status: None,
            reader: Reader::new(),
            writer: Writer::new(),
            err_buf: Vec::new(),
            err_eof: false,
            error_hook: None,
            stdin_closed: false,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn exit_status(&self) -> Option<WaitStatus> {
        self.status
    }

    /// Captured-but-undelivered stderr bytes.
    pub fn stderr_buffer(&self) -> &[u8] {
        &self.err_buf
    }

    pub fn stderr_buffer_mut(&mut self) -> &mut Vec<u8> {
        &mut self.err_buf
    }

    /// Replaces the default stderr sink (which logs complete lines as
    /// warnings) with `hook`, invoked whenever fresh stderr bytes arrive.
    pub fn on_error<F>(&mut self, hook: F)
    where
        F: FnMut(&mut Bundle, &mut Multiplexer) + 'static,
    {
        self.error_hook = Some(Box::new(hook));
    }

    /// Closes the child's stdin once pending output drains, signalling EOF
    /// while stdout (and stderr) keep flowing.
    pub fn close_stdin(&mut self, mux: &mut Multiplexer) {
        if self.stdin_closed {
            return;
        }
        if self.writer.has_pending() {
            self.writer
                .set_closing(Box::new(|h: &mut Self, mux: &mut Multiplexer| {
                    h.finish_stdin_close(mux);
                }));
        } else {
            self.finish_stdin_close(mux);
        }
    }

    fn finish_stdin_close(&mut self, mux: &mut Multiplexer) {
        let _ = mux.fdset(self.stdin_raw, false, Interest::all());
        mux.drop_alias(self.stdin_raw);
        self.stdin_fd = None;
        self.stdin_closed = true;
        self.maybe_teardown(mux);
    }

    fn drain_stderr(&mut self, mux: &mut Multiplexer) {
        let Some(err_fd) = self.stderr_raw else {
            return;
        };
        if self.err_eof {
            return;
        }
        match sys::read_append(err_fd, &mut self.err_buf, self.reader.read_size()) {
            Ok(0) => {
                let _ = mux.fdset(err_fd, false, Interest::all());
                mux.drop_alias(err_fd);
                self.stderr_fd = None;
                self.err_eof = true;
                self.deliver_stderr(mux);
                self.maybe_teardown(mux);
            }
            Ok(_) => self.deliver_stderr(mux),
            Err(ref e) if crate::error::is_retryable(e) => {}
            Err(e) => {
                tracing::warn!(handler = %self.core.name(), error = %e, "stderr read failed");
                let _ = mux.fdset(err_fd, false, Interest::all());
                mux.drop_alias(err_fd);
                self.stderr_fd = None;
                self.err_eof = true;
            }
        }
    }

    fn deliver_stderr(&mut self, mux: &mut Multiplexer) {
        if let Some(mut hook) = self.error_hook.take() {
            hook(self, mux);
            if self.error_hook.is_none() {
                self.error_hook = Some(hook);
            }
            return;
        }
        // Default sink: complete diagnostic lines go to the log.
        while let Some(pos) = self.err_buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.err_buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line);
            tracing::warn!(child = %self.core.name(), "{}", text.trim_end());
        }
        if self.err_eof && !self.err_buf.is_empty() {
            let text = String::from_utf8_lossy(&self.err_buf);
            tracing::warn!(child = %self.core.name(), "{}", text.trim_end());
            self.err_buf.clear();
        }
    }

    fn maybe_teardown(&mut self, mux: &mut Multiplexer) {
        let stderr_done = self.stderr_raw.is_none() || self.err_eof;
        if self.reader.is_eof() && self.stdin_closed && stderr_done && !self.reader.has_pending() {
            if self.status.is_none() {
                self.status = reap(self.pid);
            }
            mux.detach(self.core.fd());
        }
    }
}

impl Handler for Bundle {
    fn core(&self) -> &HandlerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut HandlerCore {
        &mut self.core
    }

    fn on_attach(&mut self, mux: &mut Multiplexer) -> io::Result<()> {
        let stdout = self.core.fd();
        self.core.apply(true, interest().read().except());
        mux.fdset(stdout, true, interest().read().except())?;
        if let Some(err_fd) = self.stderr_raw {
            mux.fdset(err_fd, true, interest().read())?;
        }
        if self.writer.has_pending() {
            mux.fdset(self.stdin_raw, true, interest().write())?;
        }
        Ok(())
    }

    fn on_readable(&mut self, mux: &mut Multiplexer, fd: RawFd) {
        if Some(fd) == self.stderr_raw {
            self.drain_stderr(mux);
        } else {
            self.pump(mux);
        }
    }

    fn on_writable(&mut self, mux: &mut Multiplexer, _fd: RawFd) {
        self.drain(mux);
    }

    fn on_exceptional(&mut self, mux: &mut Multiplexer, fd: RawFd) {
        self.on_readable(mux, fd);
    }

    fn on_detach(&mut self, _mux: &mut Multiplexer) {
        if self.status.is_none() {
            self.status = reap(self.pid);
        }
    }

    fn aux_fds(&self) -> Vec<RawFd> {
        let mut aux = Vec::with_capacity(2);
        if self.stdin_fd.is_some() {
            aux.push(self.stdin_raw);
        }
        if self.stderr_fd.is_some() {
            aux.push(self.stderr_raw.expect("stderr fd without number"));
        }
        aux
    }
}

impl ReadSide for Bundle {
    fn reader(&self) -> &Reader<Self> {
        &self.reader
    }

    fn reader_mut(&mut self) -> &mut Reader<Self> {
        &mut self.reader
    }

    fn read_fd(&self) -> RawFd {
        self.stdout_fd.as_raw_fd()
    }

    fn on_eof(&mut self, mux: &mut Multiplexer) {
        crate::read::resume(self, mux);
        self.maybe_teardown(mux);
    }
}

impl WriteSide for Bundle {
    fn writer(&self) -> &Writer<Self> {
        &self.writer
    }

    fn writer_mut(&mut self) -> &mut Writer<Self> {
        &mut self.writer
    }

    fn write_fd(&self) -> RawFd {
        self.stdin_raw
    }

    fn finish_close(&mut self, mux: &mut Multiplexer) {
        // stdin has drained; tear down all three pipes and reap.
        mux.drop_alias(self.stdin_raw);
        self.stdin_fd = None;
        self.stdin_closed = true;
        if self.status.is_none() {
            self.status = reap(self.pid);
        }
        self.core_mut().mark_closed();
        mux.detach(self.core.fd());
    }
}
