//! Child processes wired to pipes: the `-|` and `|-` open modes.
//!
//! The parent side of each pipe is wrapped in a buffered handler; the child
//! is `fork`+`exec`-ed with its remaining standard descriptors redirected
//! to `/dev/null`. Closing a pipe handler reaps the child without hanging.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execvp, fork, pipe, ForkResult, Pid};

use crate::read::{ReadSide, Reader};
use crate::write::{WriteSide, Writer};
use crate::{interest, sys, Handler, HandlerCore, Multiplexer, Result};

/// Where each standard descriptor of the child points.
pub(crate) struct ChildIo {
    pub stdin: Option<OwnedFd>,
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,
}

/// Creates one bare pipe: `(read end, write end)`, fork deferred to the
/// caller. The [`Bundle`](crate::Bundle) composes three of these around a
/// single fork.
pub(crate) fn bare_pipe() -> Result<(OwnedFd, OwnedFd)> {
    Ok(pipe().map_err(io::Error::from)?)
}

/// Forks and execs `cmd` with `args`, wiring the child's standard
/// descriptors to the given fds (consumed) or `/dev/null`. Descriptors in
/// `parent_ends` are closed in the child so pipe EOFs propagate.
///
/// Everything the child touches after the fork is async-signal-safe; the
/// argv strings are built beforehand.
pub(crate) fn spawn_child(cmd: &str, args: &[&str], io: ChildIo, parent_ends: &[RawFd]) -> Result<Pid> {
    let prog = CString::new(cmd).map_err(invalid_cmd)?;
    let mut argv = vec![CString::new(cmd).map_err(invalid_cmd)?];
    for arg in args {
        argv.push(CString::new(*arg).map_err(invalid_cmd)?);
    }

    match unsafe { fork() }.map_err(io::Error::from)? {
        ForkResult::Parent { child } => {
            // Dropping `io` closes the child's ends in the parent.
            Ok(child)
        }
        ForkResult::Child => {
            unsafe {
                redirect(io.stdin, 0, libc::O_RDONLY);
                redirect(io.stdout, 1, libc::O_WRONLY);
                redirect(io.stderr, 2, libc::O_WRONLY);
                for &fd in parent_ends {
                    libc::close(fd);
                }
            }
            let _ = execvp(&prog, &argv);
            unsafe { libc::_exit(127) }
        }
    }
}

/// Child-side: point `target` (0, 1, or 2) at `fd`, or at `/dev/null`.
unsafe fn redirect(fd: Option<OwnedFd>, target: RawFd, null_mode: libc::c_int) {
    let src = match fd {
        Some(owned) => owned.into_raw_fd(),
        None => libc::open(c"/dev/null".as_ptr(), null_mode),
    };
    if src < 0 {
        libc::_exit(127);
    }
    if src != target {
        if libc::dup2(src, target) < 0 {
            libc::_exit(127);
        }
        libc::close(src);
    }
}

fn invalid_cmd(e: std::ffi::NulError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, e)
}

/// Reaps `pid` without hanging; `None` while the child is still running.
pub(crate) fn reap(pid: Pid) -> Option<WaitStatus> {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => None,
        Ok(status) => Some(status),
        Err(_) => None,
    }
}

/// Reads a child's stdout through the buffered read side (`-|` mode).
///
/// The child's stdin and stderr go to `/dev/null`.
pub struct PipeReader {
    core: HandlerCore,
    fd: OwnedFd,
    pid: Pid,
    status: Option<WaitStatus>,
    reader: Reader<Self>,
}

impl PipeReader {
    pub fn spawn(cmd: &str, args: &[&str]) -> Result<Self> {
        let (rd, wr) = bare_pipe()?;
        let pid = spawn_child(
            cmd,
            args,
            ChildIo {
                stdin: None,
                stdout: Some(wr),
                stderr: None,
            },
            &[rd.as_raw_fd()],
        )?;
        sys::set_nonblocking(rd.as_raw_fd())?;
        let fd_num = rd.as_raw_fd();
        Ok(Self {
            core: HandlerCore::new(fd_num, format!("pipe:{cmd}")),
            fd: rd,
            pid,
            status: None,
            reader: Reader::new(),
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Exit status recorded by the most recent reap, if the child has
    /// already terminated.
    pub fn exit_status(&self) -> Option<WaitStatus> {
        self.status
    }

    /// Reaps the child (no-hang) and detaches, returning the exit status
    /// when the child had already terminated.
    pub fn close(&mut self, mux: &mut Multiplexer) -> Option<WaitStatus> {
        if self.status.is_none() {
            self.status = reap(self.pid);
        }
        mux.detach(self.core.fd());
        self.status
    }
}

impl Handler for PipeReader {
    fn core(&self) -> &HandlerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut HandlerCore {
        &mut self.core
    }

    fn on_readable(&mut self, mux: &mut Multiplexer, _fd: RawFd) {
        self.pump(mux);
    }

    fn on_exceptional(&mut self, mux: &mut Multiplexer, _fd: RawFd) {
        self.pump(mux);
    }

    fn on_detach(&mut self, _mux: &mut Multiplexer) {
        if self.status.is_none() {
            self.status = reap(self.pid);
        }
    }
}

impl ReadSide for PipeReader {
    fn reader(&self) -> &Reader<Self> {
        &self.reader
    }

    fn reader_mut(&mut self) -> &mut Reader<Self> {
        &mut self.reader
    }

    fn read_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn on_eof(&mut self, mux: &mut Multiplexer) {
        crate::read::resume(self, mux);
        if !self.reader.has_pending() {
            self.status = reap(self.pid);
            mux.detach(self.core.fd());
        }
    }
}

/// Feeds a child's stdin through the buffered write side (`|-` mode).
///
/// The child's stdout and stderr go to `/dev/null`. Closing drains the
/// pending buffer first, then closes the pipe (signalling EOF to the
/// child) and reaps without hanging.
pub struct PipeWriter {
    core: HandlerCore,
    fd: Option<OwnedFd>,
    raw: RawFd,
    pid: Pid,
    status: Option<WaitStatus>,
    writer: Writer<Self>,
}

impl PipeWriter {
    pub fn spawn(cmd: &str, args: &[&str]) -> Result<Self> {
        let (rd, wr) = bare_pipe()?;
        let pid = spawn_child(
            cmd,
            args,
            ChildIo {
                stdin: Some(rd),
                stdout: None,
                stderr: None,
            },
            &[wr.as_raw_fd()],
        )?;
        sys::set_nonblocking(wr.as_raw_fd())?;
        let raw = wr.as_raw_fd();
        Ok(Self {
            core: HandlerCore::new(raw, format!("pipe:{cmd}")),
            fd: Some(wr),
            raw,
            pid,
            status: None,
            writer: Writer::new(),
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn exit_status(&self) -> Option<WaitStatus> {
        self.status
    }
}

impl Handler for PipeWriter {
    fn core(&self) -> &HandlerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut HandlerCore {
        &mut self.core
    }

    fn on_attach(&mut self, mux: &mut Multiplexer) -> io::Result<()> {
        if self.writer.has_pending() {
            let fd = self.core.fd();
            self.core.apply(true, interest().write());
            mux.fdset(fd, true, interest().write())?;
        }
        Ok(())
    }

    fn on_writable(&mut self, mux: &mut Multiplexer, _fd: RawFd) {
        self.drain(mux);
    }

    fn on_detach(&mut self, _mux: &mut Multiplexer) {
        if self.status.is_none() {
            self.status = reap(self.pid);
        }
    }
}

impl WriteSide for PipeWriter {
    fn writer(&self) -> &Writer<Self> {
        &self.writer
    }

    fn writer_mut(&mut self) -> &mut Writer<Self> {
        &mut self.writer
    }

    fn write_fd(&self) -> RawFd {
        self.raw
    }

    fn finish_close(&mut self, mux: &mut Multiplexer) {
        // Closing the write end delivers EOF to the child's stdin.
        self.fd = None;
        self.status = reap(self.pid);
        self.core_mut().mark_closed();
        mux.detach(self.core.fd());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_child_reports_bad_argv() {
        let err = spawn_child("bad\0cmd", &[], ChildIo { stdin: None, stdout: None, stderr: None }, &[])
            .unwrap_err();
        assert!(matches!(err, crate::Error::Io(_)));
    }
}
