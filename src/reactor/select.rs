//! Bit-vector readiness back-end over `select(2)`.

use std::io;
use std::os::fd::{BorrowedFd, RawFd};

use nix::errno::Errno;
use nix::sys::select::{select, FdSet};
use nix::sys::time::{TimeVal, TimeValLike};

use super::{BitIter, PollOutcome, Reactor, Ready, ReadyKind};
use crate::{Error, Interest};

const READ: usize = 0;
const WRITE: usize = 1;
const EXCEPT: usize = 2;

/// Readiness back-end keeping three bit-vectors indexed by descriptor
/// number, one per watchable condition.
///
/// Interest updates are a single bit flip; the cost is memory proportional
/// to the highest watched descriptor, and the hard `FD_SETSIZE` ceiling of
/// `select(2)` (descriptors at or above it are rejected at registration).
#[derive(Default)]
pub struct SelectReactor {
    interest: [BitVec; 3],
    result: [BitVec; 3],
}

impl SelectReactor {
    pub fn new() -> Self {
        Self::default()
    }

    fn fill_set(&self, kind: usize) -> FdSet<'static> {
        let mut set = FdSet::new();
        for fd in BitIter::new(&self.interest[kind].words) {
            set.insert(unsafe { BorrowedFd::borrow_raw(fd) });
        }
        set
    }

    fn collect_result(&mut self, kind: usize, set: &FdSet<'_>) {
        // Walk the interest bits rather than 0..FD_SETSIZE.
        let candidates: &[u64] = &self.interest[kind].words;
        self.result[kind].clear();
        for (ix, &word) in candidates.iter().enumerate() {
            let mut bits = word;
            while bits != 0 {
                let bit = bits.trailing_zeros();
                bits &= bits - 1;
                let fd = (ix as u32 * 64 + bit) as RawFd;
                if set.contains(unsafe { BorrowedFd::borrow_raw(fd) }) {
                    self.result[kind].set(fd, true);
                }
            }
        }
    }
}

impl Reactor for SelectReactor {
    fn set_interest(&mut self, fd: RawFd, on: bool, which: Interest) -> io::Result<()> {
        if fd < 0 || fd as usize >= libc::FD_SETSIZE {
            let err = Error::FdOutOfRange(fd, libc::FD_SETSIZE as RawFd - 1);
            return Err(io::Error::new(io::ErrorKind::InvalidInput, err.to_string()));
        }
        if which.is_read() {
            self.interest[READ].set(fd, on);
        }
        if which.is_write() {
            self.interest[WRITE].set(fd, on);
        }
        if which.is_except() {
            self.interest[EXCEPT].set(fd, on);
        }
        Ok(())
    }

    fn poll_once(&mut self, wait_seconds: f64) -> io::Result<PollOutcome> {
        let mut rset = self.fill_set(READ);
        let mut wset = self.fill_set(WRITE);
        let mut eset = self.fill_set(EXCEPT);
        let mut tv = TimeVal::microseconds((wait_seconds.max(0.0) * 1e6) as i64);

        let nfds: Option<libc::c_int> = None;
        match select(
            nfds,
            Some(&mut rset),
            Some(&mut wset),
            Some(&mut eset),
            Some(&mut tv),
        ) {
            Ok(n) => {
                self.collect_result(READ, &rset);
                self.collect_result(WRITE, &wset);
                self.collect_result(EXCEPT, &eset);
                // Linux updates the timeval with the unslept remainder.
                let left = tv.num_microseconds() as f64 / 1e6;
                Ok(PollOutcome {
                    ready: n.max(0) as usize,
                    time_left: Some(left.max(0.0)),
                })
            }
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => {
                for r in &mut self.result {
                    r.clear();
                }
                Ok(PollOutcome::default())
            }
            Err(e) => Err(io::Error::from(e)),
        }
    }

    fn ready(&self, kind: ReadyKind) -> Ready<'_> {
        let words = match kind {
            ReadyKind::Readable => &self.result[READ].words,
            ReadyKind::Writable => &self.result[WRITE].words,
            ReadyKind::Exceptional => &self.result[EXCEPT].words,
        };
        Ready::Bits(BitIter::new(words))
    }
}

/// Growable descriptor bit-vector in 64-bit words.
#[derive(Default)]
struct BitVec {
    words: Vec<u64>,
}

impl BitVec {
    fn set(&mut self, fd: RawFd, on: bool) {
        let (word, bit) = (fd as usize / 64, fd as usize % 64);
        if word >= self.words.len() {
            if !on {
                return;
            }
            self.words.resize(word + 1, 0);
        }
        if on {
            self.words[word] |= 1 << bit;
        } else {
            self.words[word] &= !(1 << bit);
        }
    }

    fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
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
        let mut reactor = SelectReactor::new();
        reactor
            .set_interest(r.as_raw_fd(), true, interest().read())
            .unwrap();

        let idle = reactor.poll_once(0.0).unwrap();
        assert_eq!(idle.ready, 0);
        assert_eq!(reactor.ready(ReadyKind::Readable).count(), 0);

        nix::unistd::write(&w, b"x").unwrap();
        let out = reactor.poll_once(1.0).unwrap();
        assert_eq!(out.ready, 1);
        let fds: Vec<_> = reactor.ready(ReadyKind::Readable).collect();
        assert_eq!(fds, vec![r.as_raw_fd()]);
        assert_eq!(reactor.ready(ReadyKind::Writable).count(), 0);
    }

    #[test]
    fn write_end_reports_writable() {
        let (_r, w) = pipe().unwrap();
        let mut reactor = SelectReactor::new();
        reactor
            .set_interest(w.as_raw_fd(), true, interest().write())
            .unwrap();

        let out = reactor.poll_once(1.0).unwrap();
        assert_eq!(out.ready, 1);
        let fds: Vec<_> = reactor.ready(ReadyKind::Writable).collect();
        assert_eq!(fds, vec![w.as_raw_fd()]);
    }

    #[test]
    fn clearing_interest_silences_fd() {
        let (r, w) = pipe().unwrap();
        let mut reactor = SelectReactor::new();
        reactor
            .set_interest(r.as_raw_fd(), true, interest().read())
            .unwrap();
        nix::unistd::write(&w, b"x").unwrap();
        reactor
            .set_interest(r.as_raw_fd(), false, interest().read().write().except())
            .unwrap();

        let out = reactor.poll_once(0.0).unwrap();
        assert_eq!(out.ready, 0);
    }

    #[test]
    fn rejects_fd_beyond_setsize() {
        let mut reactor = SelectReactor::new();
        let err = reactor
            .set_interest(libc::FD_SETSIZE as RawFd, true, interest().read())
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
