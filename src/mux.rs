use std::io;
use std::os::fd::RawFd;

use nix::sys::signal::{signal, SigHandler, Signal};
use rustc_hash::FxHashMap;

use crate::reactor::{poll::PollReactor, select::SelectReactor, PollOutcome, Reactor, ReadyKind};
use crate::{clock, Error, Handler, Interest, Result};

/// Upper bound on one reactor wait when no timer is armed, in seconds.
const LONG_WAIT: f64 = 60.0;
/// Smallest reactor wait; sub-millisecond deadlines are rounded up to this
/// so a timer always gets a full iteration instead of a spin.
const MIN_WAIT: f64 = 0.001;

enum Slot {
    Handler(Box<dyn Handler>),
    /// Secondary descriptor of a composite handler; readiness on it is
    /// routed to the named primary entry.
    Alias(RawFd),
}

struct Handling {
    fd: RawFd,
    detached: bool,
}

/// The event loop: owns the handler table, the timeout table, and a
/// readiness reactor, and dispatches one iteration at a time.
///
/// Construction ignores `SIGPIPE` process-wide so that writes to a dead
/// peer surface as per-call errors instead of killing the process.
///
/// All dispatch is single-threaded and cooperative: handler callbacks run
/// on the loop thread, must not block, and receive the multiplexer by
/// `&mut` to adjust interest, re-arm timers, attach peers, or detach.
pub struct Multiplexer {
    reactor: Box<dyn Reactor>,
    handlers: FxHashMap<RawFd, Slot>,
    timeouts: FxHashMap<RawFd, f64>,
    /// Cached minimum of `timeouts`; `None` either means no timers or a
    /// lazily invalidated cache, recomputed on demand.
    next_timeout: Option<f64>,
    end_loop: bool,
    running: bool,
    handling: Option<Handling>,
}

impl Multiplexer {
    /// Multiplexer over the `poll(2)` back-end.
    pub fn new() -> Result<Self> {
        Self::with_reactor(Box::new(PollReactor::new()))
    }

    /// Multiplexer over the `select(2)` bit-vector back-end.
    pub fn new_select() -> Result<Self> {
        Self::with_reactor(Box::new(SelectReactor::new()))
    }

    pub fn with_reactor(reactor: Box<dyn Reactor>) -> Result<Self> {
        unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }.map_err(io::Error::from)?;
        Ok(Self {
            reactor,
            handlers: FxHashMap::default(),
            timeouts: FxHashMap::default(),
            next_timeout: None,
            end_loop: false,
            running: false,
            handling: None,
        })
    }

    /// Registers `handler`: runs its `on_attach` hook (which sets the
    /// initial interest mask) and inserts it into the handler table under
    /// its descriptor, plus alias entries for any auxiliary descriptors.
    ///
    /// # Errors
    ///
    /// [`Error::DuplicateFd`] if any of the handler's descriptors is
    /// already registered; I/O errors from interest registration.
    pub fn attach<H: Handler>(&mut self, handler: H) -> Result<RawFd> {
        self.attach_boxed(Box::new(handler))
    }

    pub fn attach_boxed(&mut self, mut handler: Box<dyn Handler>) -> Result<RawFd> {
        let fd = handler.core().fd();
        if fd < 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "handler has a negative file descriptor",
            )));
        }
        let aux = handler.aux_fds();
        for cand in std::iter::once(fd).chain(aux.iter().copied()) {
            if self.handlers.contains_key(&cand) {
                return Err(Error::DuplicateFd(cand));
            }
        }

        if let Err(e) = handler.on_attach(self) {
            for cand in std::iter::once(fd).chain(aux.iter().copied()) {
                let _ = self.reactor.set_interest(cand, false, Interest::all());
            }
            return Err(e.into());
        }

        tracing::debug!(fd, name = %handler.core().name(), "handler attached");
        for &a in &aux {
            self.handlers.insert(a, Slot::Alias(fd));
        }
        self.handlers.insert(fd, Slot::Handler(handler));
        Ok(fd)
    }

    /// Removes the handler registered under `fd` (primary or alias):
    /// clears its interest flags, drops its timer, runs `on_detach`, and
    /// closes the descriptor by dropping the handler.
    ///
    /// Detaching the handler currently being dispatched is deferred until
    /// its callback returns; detaching an unknown descriptor is a no-op.
    pub fn detach(&mut self, fd: RawFd) {
        if let Some(h) = &mut self.handling {
            if h.fd == fd {
                h.detached = true;
                return;
            }
        }
        let primary = match self.handlers.get(&fd) {
            Some(Slot::Alias(p)) => *p,
            Some(Slot::Handler(_)) => fd,
            None => return,
        };
        if let Some(h) = &mut self.handling {
            if h.fd == primary {
                h.detached = true;
                return;
            }
        }
        if let Some(Slot::Handler(h)) = self.handlers.remove(&primary) {
            self.finalize_detach(primary, h);
        }
    }

    fn finalize_detach(&mut self, fd: RawFd, mut handler: Box<dyn Handler>) {
        for aux in handler.aux_fds() {
            self.handlers.remove(&aux);
            let _ = self.reactor.set_interest(aux, false, Interest::all());
        }
        let _ = self.reactor.set_interest(fd, false, Interest::all());
        self.remove_timeout(fd);
        handler.core_mut().mark_closed();
        tracing::debug!(fd, name = %handler.core().name(), "handler detached");
        handler.on_detach(self);
    }

    /// Forwards an interest adjustment to the reactor.
    pub fn fdset(&mut self, fd: RawFd, on: bool, which: Interest) -> io::Result<()> {
        self.reactor.set_interest(fd, on, which)
    }

    /// Removes an alias entry once a composite handler has closed the
    /// descriptor behind it, freeing the number for reuse.
    pub(crate) fn drop_alias(&mut self, fd: RawFd) {
        if matches!(self.handlers.get(&fd), Some(Slot::Alias(_))) {
            self.handlers.remove(&fd);
        }
    }

    /// Moves the timer for `fd` from `old` to `new`, maintaining the cached
    /// minimum. `None` (or a non-positive deadline) disarms the timer.
    pub fn change_timeout(&mut self, fd: RawFd, old: Option<f64>, new: Option<f64>) {
        if old.is_some() && old == self.next_timeout {
            // The cached minimum may be moving; recompute lazily.
            self.next_timeout = None;
        }
        match new {
            Some(d) if d > 0.0 => {
                self.timeouts.insert(fd, d);
                match self.next_timeout {
                    Some(nt) if d < nt => self.next_timeout = Some(d),
                    Some(_) => {}
                    // A stale None must stay stale: adopting `d` could cache
                    // a value above the true minimum.
                    None if self.timeouts.len() == 1 => self.next_timeout = Some(d),
                    None => {}
                }
            }
            _ => self.remove_timeout(fd),
        }
    }

    fn remove_timeout(&mut self, fd: RawFd) {
        if let Some(d) = self.timeouts.remove(&fd) {
            if self.next_timeout == Some(d) {
                self.next_timeout = None;
            }
        }
    }

    fn next_deadline(&mut self) -> Option<f64> {
        if self.next_timeout.is_none() && !self.timeouts.is_empty() {
            self.next_timeout = self.timeouts.values().copied().reduce(f64::min);
        }
        self.next_timeout
    }

    /// Requests loop termination at the top of the next iteration.
    pub fn end_loop(&mut self) {
        self.end_loop = true;
    }

    /// Number of registered handlers (aliases not counted).
    pub fn handler_count(&self) -> usize {
        self.handlers
            .values()
            .filter(|s| matches!(s, Slot::Handler(_)))
            .count()
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.handlers.contains_key(&fd)
    }

    /// Runs the loop until no handlers remain or [`end_loop`] is called.
    ///
    /// On exit — normal or reactor failure — every remaining handler is
    /// detached and closed.
    ///
    /// [`end_loop`]: Multiplexer::end_loop
    pub fn run(&mut self) -> Result<()> {
        self.run_with_heartbeat(|_, _, _| {})
    }

    /// Like [`run`](Multiplexer::run), invoking `heartbeat` exactly once
    /// per iteration — before any per-handler dispatch, and also when zero
    /// descriptors were ready — with the multiplexer, the ready count, and
    /// the reactor's residual wait time where the OS reports one.
    pub fn run_with_heartbeat<F>(&mut self, mut heartbeat: F) -> Result<()>
    where
        F: FnMut(&mut Multiplexer, usize, Option<f64>),
    {
        if self.running {
            panic!("Recursive call to Multiplexer::run");
        }
        self.running = true;
        self.end_loop = false;

        let result = loop {
            if self.handlers.is_empty() || self.end_loop {
                break Ok(());
            }

            let wait = match self.next_deadline() {
                Some(t) => (t - clock::now()).max(MIN_WAIT),
                None => LONG_WAIT,
            };

            let PollOutcome { ready, time_left } = match self.reactor.poll_once(wait) {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(error = %e, "reactor wait failed, terminating loop");
                    break Err(Error::Io(e));
                }
            };

            heartbeat(self, ready, time_left);

            for kind in [
                ReadyKind::Readable,
                ReadyKind::Writable,
                ReadyKind::Exceptional,
            ] {
                self.dispatch_kind(kind);
            }
            self.expire_timers();
        };

        self.running = false;
        self.close_all();
        result
    }

    fn dispatch_kind(&mut self, kind: ReadyKind) {
        let ready: Vec<RawFd> = self.reactor.ready(kind).collect();
        for fd in ready {
            let primary = match self.handlers.get(&fd) {
                Some(Slot::Alias(p)) => *p,
                Some(Slot::Handler(_)) => fd,
                None => continue, // closed earlier this iteration
            };
            let Some(Slot::Handler(mut handler)) = self.handlers.remove(&primary) else {
                continue;
            };
            self.handling = Some(Handling {
                fd: primary,
                detached: false,
            });
            match kind {
                ReadyKind::Readable => handler.on_readable(self, fd),
                ReadyKind::Writable => handler.on_writable(self, fd),
                ReadyKind::Exceptional => handler.on_exceptional(self, fd),
            }
            self.finish_dispatch(primary, handler);
        }
    }

    fn finish_dispatch(&mut self, primary: RawFd, handler: Box<dyn Handler>) {
        let handling = self
            .handling
            .take()
            .expect("dispatch finished without a handling record");
        if handling.detached {
            self.finalize_detach(primary, handler);
        } else {
            self.handlers.insert(primary, Slot::Handler(handler));
        }
    }

    fn expire_timers(&mut self) {
        if self.timeouts.is_empty() {
            return;
        }
        let now = clock::now();
        if let Some(nt) = self.next_timeout {
            if now < nt {
                return;
            }
        }

        let mut due: Vec<(RawFd, f64)> = self
            .timeouts
            .iter()
            .filter(|&(_, &d)| d <= now)
            .map(|(&fd, &d)| (fd, d))
            .collect();
        if due.is_empty() {
            return;
        }
        // Earlier deadlines fire first.
        due.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

        for (fd, _) in due {
            if self.timeouts.remove(&fd).is_none() {
                continue;
            }
            let Some(Slot::Handler(mut handler)) = self.handlers.remove(&fd) else {
                continue;
            };
            handler.core_mut().set_deadline(None);
            self.handling = Some(Handling {
                fd,
                detached: false,
            });
            handler.on_timeout(self);
            self.finish_dispatch(fd, handler);
        }
        self.next_timeout = None;
    }

    fn close_all(&mut self) {
        loop {
            let Some(&fd) = self.handlers.keys().next() else {
                break;
            };
            self.detach(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Ready;
    use crate::HandlerCore;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Reactor whose readiness is scripted per iteration, so loop ordering
    /// can be unit-tested without real descriptors.
    struct ScriptedReactor {
        script: Vec<[Vec<RawFd>; 3]>,
        step: usize,
        current: [Vec<RawFd>; 3],
    }

    impl ScriptedReactor {
        fn new(script: Vec<[Vec<RawFd>; 3]>) -> Self {
            Self {
                script,
                step: 0,
                current: Default::default(),
            }
        }
    }

    impl Reactor for ScriptedReactor {
        fn set_interest(&mut self, _fd: RawFd, _on: bool, _which: Interest) -> io::Result<()> {
            Ok(())
        }

        fn poll_once(&mut self, _wait: f64) -> io::Result<PollOutcome> {
            self.current = self.script.get(self.step).cloned().unwrap_or_default();
            self.step += 1;
            let ready = self.current.iter().map(Vec::len).sum();
            Ok(PollOutcome {
                ready,
                time_left: None,
            })
        }

        fn ready(&self, kind: ReadyKind) -> Ready<'_> {
            let ix = match kind {
                ReadyKind::Readable => 0,
                ReadyKind::Writable => 1,
                ReadyKind::Exceptional => 2,
            };
            Ready::Fds(self.current[ix].iter())
        }
    }

    struct Probe {
        core: HandlerCore,
        log: Rc<RefCell<Vec<String>>>,
        detach_on_readable: bool,
    }

    impl Probe {
        fn new(fd: RawFd, log: &Rc<RefCell<Vec<String>>>) -> Self {
            Self {
                core: HandlerCore::new(fd, format!("probe:{fd}")),
                log: Rc::clone(log),
                detach_on_readable: false,
            }
        }
    }

    impl Handler for Probe {
        fn core(&self) -> &HandlerCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut HandlerCore {
            &mut self.core
        }

        fn on_readable(&mut self, mux: &mut Multiplexer, fd: RawFd) {
            self.log.borrow_mut().push(format!("read:{fd}"));
            if self.detach_on_readable {
                mux.detach(self.core.fd());
            }
        }

        fn on_writable(&mut self, _mux: &mut Multiplexer, fd: RawFd) {
            self.log.borrow_mut().push(format!("write:{fd}"));
        }

        fn on_exceptional(&mut self, _mux: &mut Multiplexer, fd: RawFd) {
            self.log.borrow_mut().push(format!("except:{fd}"));
        }

        fn on_timeout(&mut self, mux: &mut Multiplexer) {
            self.log.borrow_mut().push(format!("timeout:{}", self.core.fd()));
            mux.detach(self.core.fd());
        }

        fn on_detach(&mut self, _mux: &mut Multiplexer) {
            self.log.borrow_mut().push(format!("detach:{}", self.core.fd()));
        }
    }

    fn scripted_mux(script: Vec<[Vec<RawFd>; 3]>) -> Multiplexer {
        Multiplexer::with_reactor(Box::new(ScriptedReactor::new(script))).unwrap()
    }

    #[test]
    fn readiness_kinds_dispatch_in_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut mux = scripted_mux(vec![[vec![3], vec![3], vec![3]]]);
        let mut probe = Probe::new(3, &log);
        probe.detach_on_readable = false;
        mux.attach(probe).unwrap();

        let mut iterations = 0;
        mux.run_with_heartbeat(|mux, _, _| {
            iterations += 1;
            if iterations == 2 {
                mux.end_loop();
            }
        })
        .unwrap();

        assert_eq!(
            *log.borrow(),
            vec!["read:3", "write:3", "except:3", "detach:3"]
        );
    }

    #[test]
    fn handler_detached_mid_iteration_is_skipped() {
        let log = Rc::new(RefCell::new(Vec::new()));
        // fd 3 detaches itself in on_readable; its writable readiness in the
        // same iteration must be skipped.
        let mut mux = scripted_mux(vec![[vec![3], vec![3], vec![]]]);
        let mut probe = Probe::new(3, &log);
        probe.detach_on_readable = true;
        mux.attach(probe).unwrap();

        mux.run().unwrap();
        assert_eq!(*log.borrow(), vec!["read:3", "detach:3"]);
    }

    #[test]
    fn heartbeat_fires_on_idle_iterations() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut mux = scripted_mux(vec![[vec![], vec![], vec![]]; 8]);
        mux.attach(Probe::new(4, &log)).unwrap();

        let mut beats = 0;
        mux.run_with_heartbeat(|mux, ready, _| {
            assert_eq!(ready, 0);
            beats += 1;
            if beats == 3 {
                mux.end_loop();
            }
        })
        .unwrap();
        assert_eq!(beats, 3);
    }

    #[test]
    fn earlier_deadline_fires_first() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut mux = scripted_mux(vec![[vec![], vec![], vec![]]; 4]);
        let a = Probe::new(7, &log);
        let b = Probe::new(8, &log);
        mux.attach_boxed(Box::new(b)).unwrap();
        mux.attach_boxed(Box::new(a)).unwrap();

        // Arm b later than a, in reverse insertion order.
        let now = clock::now();
        mux.change_timeout(8, None, Some(now - 0.010));
        mux.change_timeout(7, None, Some(now - 0.050));

        mux.run().unwrap();
        let entries = log.borrow();
        let t7 = entries.iter().position(|e| e == "timeout:7").unwrap();
        let t8 = entries.iter().position(|e| e == "timeout:8").unwrap();
        assert!(t7 < t8);
    }

    #[test]
    fn next_timeout_tracks_minimum() {
        let mut mux = scripted_mux(vec![]);
        mux.change_timeout(1, None, Some(50.0));
        assert_eq!(mux.next_deadline(), Some(50.0));
        mux.change_timeout(2, None, Some(20.0));
        assert_eq!(mux.next_deadline(), Some(20.0));
        // Moving the minimum invalidates, then recomputes.
        mux.change_timeout(2, Some(20.0), Some(80.0));
        assert_eq!(mux.next_deadline(), Some(50.0));
        mux.change_timeout(1, Some(50.0), None);
        assert_eq!(mux.next_deadline(), Some(80.0));
        mux.change_timeout(2, Some(80.0), None);
        assert_eq!(mux.next_deadline(), None);
    }

    #[test]
    fn duplicate_fd_rejected() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut mux = scripted_mux(vec![]);
        mux.attach(Probe::new(9, &log)).unwrap();
        let err = mux.attach(Probe::new(9, &log)).unwrap_err();
        assert!(matches!(err, Error::DuplicateFd(9)));
    }

    #[test]
    fn loop_exit_closes_remaining_handlers() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut mux = scripted_mux(vec![[vec![], vec![], vec![]]; 2]);
        mux.attach(Probe::new(5, &log)).unwrap();
        mux.attach(Probe::new(6, &log)).unwrap();

        mux.run_with_heartbeat(|mux, _, _| mux.end_loop()).unwrap();
        assert_eq!(mux.handler_count(), 0);
        let entries = log.borrow();
        assert!(entries.contains(&"detach:5".to_string()));
        assert!(entries.contains(&"detach:6".to_string()));
    }
}
