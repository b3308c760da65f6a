//! Mask-table readiness back-end over `poll(2)`.

use std::io;
use std::os::fd::{BorrowedFd, RawFd};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use rustc_hash::FxHashMap;

use super::{MaskIter, PollOutcome, Reactor, Ready, ReadyKind};
use crate::Interest;

/// Readiness back-end keeping one `poll(2)` event mask per watched
/// descriptor.
///
/// Scales past the `select` fd ceiling; the price is rebuilding the pollfd
/// table on every iteration.
#[derive(Default)]
pub struct PollReactor {
    interest: FxHashMap<RawFd, PollFlags>,
    revents: Vec<(RawFd, PollFlags)>,
}

impl PollReactor {
    pub fn new() -> Self {
        Self::default()
    }

    fn flags_for(which: Interest) -> PollFlags {
        let mut flags = PollFlags::empty();
        if which.is_read() {
            flags |= PollFlags::POLLIN;
        }
        if which.is_write() {
            flags |= PollFlags::POLLOUT;
        }
        if which.is_except() {
            flags |= PollFlags::POLLPRI;
        }
        flags
    }
}

impl Reactor for PollReactor {
    fn set_interest(&mut self, fd: RawFd, on: bool, which: Interest) -> io::Result<()> {
        if fd < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "negative fd"));
        }
        let touched = Self::flags_for(which);
        let mask = self.interest.entry(fd).or_insert_with(PollFlags::empty);
        if on {
            *mask |= touched;
        } else {
            *mask &= !touched;
        }
        if mask.is_empty() {
            self.interest.remove(&fd);
        }
        Ok(())
    }

    fn poll_once(&mut self, wait_seconds: f64) -> io::Result<PollOutcome> {
        let mut fds: Vec<RawFd> = Vec::with_capacity(self.interest.len());
        let mut pollfds: Vec<PollFd> = Vec::with_capacity(self.interest.len());
        for (&fd, &mask) in &self.interest {
            fds.push(fd);
            pollfds.push(PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, mask));
        }

        let millis = (wait_seconds.max(0.0) * 1000.0).ceil();
        let timeout = if millis >= i32::MAX as f64 {
            PollTimeout::MAX
        } else {
            PollTimeout::try_from(millis as i32).unwrap_or(PollTimeout::MAX)
        };

        match poll(&mut pollfds, timeout) {
            Ok(n) => {
                self.revents.clear();
                for (fd, pollfd) in fds.iter().zip(&pollfds) {
                    let revents = pollfd.revents().unwrap_or_else(PollFlags::empty);
                    if !revents.is_empty() {
                        self.revents.push((*fd, revents));
                    }
                }
                Ok(PollOutcome {
                    ready: n.max(0) as usize,
                    time_left: None,
                })
            }
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => {
                self.revents.clear();
                Ok(PollOutcome::default())
            }
            Err(e) => Err(io::Error::from(e)),
        }
    }

    fn ready(&self, kind: ReadyKind) -> Ready<'_> {
        let mask = match kind {
            ReadyKind::Readable => PollFlags::POLLIN | PollFlags::POLLHUP,
            ReadyKind::Writable => PollFlags::POLLOUT,
            ReadyKind::Exceptional => PollFlags::POLLERR | PollFlags::POLLNVAL,
        };
        Ready::Masks(MaskIter::new(&self.revents, mask))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interest;
    use nix::unistd::pipe;
    use std::os::fd::AsRawFd;

    #[test]
    fn pipe_becomes_readable() {
        let (r, w) = pipe().unwrap();
        let mut reactor = PollReactor::new();
        reactor
            .set_interest(r.as_raw_fd(), true, interest().read())
            .unwrap();

        let idle = reactor.poll_once(0.0).unwrap();
        assert_eq!(idle.ready, 0);

        nix::unistd::write(&w, b"x").unwrap();
        let out = reactor.poll_once(1.0).unwrap();
        assert_eq!(out.ready, 1);
        let fds: Vec<_> = reactor.ready(ReadyKind::Readable).collect();
        assert_eq!(fds, vec![r.as_raw_fd()]);
    }

    #[test]
    fn hangup_counts_as_readable() {
        let (r, w) = pipe().unwrap();
        let mut reactor = PollReactor::new();
        reactor
            .set_interest(r.as_raw_fd(), true, interest().read())
            .unwrap();
        drop(w);

        reactor.poll_once(1.0).unwrap();
        let fds: Vec<_> = reactor.ready(ReadyKind::Readable).collect();
        assert_eq!(fds, vec![r.as_raw_fd()]);
    }

    #[test]
    fn empty_mask_drops_table_entry() {
        let (r, _w) = pipe().unwrap();
        let mut reactor = PollReactor::new();
        reactor
            .set_interest(r.as_raw_fd(), true, interest().read().write())
            .unwrap();
        reactor
            .set_interest(r.as_raw_fd(), false, Interest::all())
            .unwrap();
        assert!(reactor.interest.is_empty());
    }
}
