use std::os::fd::RawFd;

use crate::{clock, interest, Interest, Multiplexer};

/// Per-handler bookkeeping shared by every concrete handler type.
///
/// Carries the descriptor number, a display name, the TLS bit, a mirror of
/// the interest flags currently set in the reactor, and the armed deadline.
/// The descriptor itself is owned by the concrete handler (a `File`, socket,
/// or `OwnedFd`), which closes it on drop.
#[derive(Debug)]
pub struct HandlerCore {
    fd: RawFd,
    name: String,
    uses_tls: bool,
    interest: Interest,
    deadline: Option<f64>,
    closed: bool,
}

impl HandlerCore {
    pub fn new(fd: RawFd, name: impl Into<String>) -> Self {
        Self {
            fd,
            name: name.into(),
            uses_tls: false,
            interest: interest(),
            deadline: None,
            closed: false,
        }
    }

    pub fn with_tls(mut self, uses_tls: bool) -> Self {
        self.uses_tls = uses_tls;
        self
    }

    pub fn set_tls(&mut self, uses_tls: bool) {
        self.uses_tls = uses_tls;
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn uses_tls(&self) -> bool {
        self.uses_tls
    }

    /// The interest flags this handler believes are set in the reactor.
    pub fn interest(&self) -> Interest {
        self.interest
    }

    pub fn deadline(&self) -> Option<f64> {
        self.deadline
    }

    pub(crate) fn set_deadline(&mut self, deadline: Option<f64>) {
        self.deadline = deadline;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn mark_closed(&mut self) {
        self.closed = true;
    }

    pub(crate) fn apply(&mut self, on: bool, which: Interest) {
        let read = if which.is_read() { on } else { self.interest.is_read() };
        let write = if which.is_write() { on } else { self.interest.is_write() };
        let except = if which.is_except() { on } else { self.interest.is_except() };
        let mut next = interest();
        if read {
            next = next.read();
        }
        if write {
            next = next.write();
        }
        if except {
            next = next.except();
        }
        self.interest = next;
    }
}

/// A user-level object bound to one descriptor, receiving readiness and
/// timeout dispatches from a [`Multiplexer`].
///
/// The raw callbacks default to panics: a handler that never asked for a
/// condition receiving it is a bug, caught loudly rather than ignored.
/// Concrete handlers override exactly the subset they expect.
///
/// Callbacks receive the dispatching multiplexer by `&mut` — the only way a
/// handler reaches the loop — plus the descriptor the readiness was reported
/// for, which composite handlers use to route (see
/// [`Bundle`](crate::Bundle)).
pub trait Handler: 'static {
    fn core(&self) -> &HandlerCore;
    fn core_mut(&mut self) -> &mut HandlerCore;

    /// Called by [`Multiplexer::attach`] before the handler enters the
    /// table; sets the initial interest mask. The default registers read
    /// and exceptional interest, the common shape for stream handlers.
    fn on_attach(&mut self, mux: &mut Multiplexer) -> std::io::Result<()> {
        let fd = self.core().fd();
        self.core_mut().apply(true, interest().read().except());
        mux.fdset(fd, true, interest().read().except())
    }

    fn on_readable(&mut self, _mux: &mut Multiplexer, _fd: RawFd) {
        panic!(
            "handler `{}` received readable readiness it never asked for",
            self.core().name()
        );
    }

    fn on_writable(&mut self, _mux: &mut Multiplexer, _fd: RawFd) {
        panic!(
            "handler `{}` received writable readiness it never asked for",
            self.core().name()
        );
    }

    fn on_exceptional(&mut self, _mux: &mut Multiplexer, _fd: RawFd) {
        panic!(
            "handler `{}` received exceptional readiness it never asked for",
            self.core().name()
        );
    }

    /// Fired once when the armed deadline expires; the entry is cleared
    /// before the call. Graceful timeout behavior requires an override.
    fn on_timeout(&mut self, _mux: &mut Multiplexer) {
        panic!(
            "timeout expired on handler `{}` with no on_timeout override",
            self.core().name()
        );
    }

    /// Called after the handler left the table, before it is dropped.
    fn on_detach(&mut self, _mux: &mut Multiplexer) {}

    /// Additional descriptors this handler answers for; the multiplexer
    /// registers them as aliases of [`fd`](HandlerCore::fd).
    fn aux_fds(&self) -> Vec<RawFd> {
        Vec::new()
    }

    /// Arms, re-arms, or clears the handler's timer.
    ///
    /// A value of zero or less clears the timer. A positive value below the
    /// process start time is relative seconds from now; anything else is an
    /// absolute epoch deadline. Deadlines under a millisecond away still
    /// get at least one loop iteration.
    fn set_timeout(&mut self, mux: &mut Multiplexer, value: f64) {
        let old = self.core().deadline();
        let new = if value <= 0.0 {
            None
        } else if value < clock::process_start() {
            Some(clock::now() + value)
        } else {
            Some(value)
        };
        self.core_mut().set_deadline(new);
        mux.change_timeout(self.core().fd(), old, new);
    }

    /// Clears the handler's timer, if armed.
    fn clear_timeout(&mut self, mux: &mut Multiplexer) {
        self.set_timeout(mux, 0.0);
    }

    /// Adjusts the reactor interest flags for this handler, mirroring them
    /// in its core. Failures are logged and swallowed; interest bookkeeping
    /// is not something a readiness callback can recover from.
    fn fdset(&mut self, mux: &mut Multiplexer, on: bool, which: Interest) {
        let fd = self.core().fd();
        self.core_mut().apply(on, which);
        if let Err(e) = mux.fdset(fd, on, which) {
            tracing::warn!(handler = %self.core().name(), error = %e, "interest update failed");
        }
    }
}

impl dyn Handler {
    pub fn fd(&self) -> RawFd {
        self.core().fd()
    }

    pub fn name(&self) -> &str {
        self.core().name()
    }

    pub fn uses_tls(&self) -> bool {
        self.core().uses_tls()
    }
}
