//! Timer scenarios: a quiet descriptor's deadline fires once, on time, and
//! earlier deadlines fire first.

use std::cell::RefCell;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use fdmux::{Handler, HandlerCore, Multiplexer};

/// A handler over a pipe read end that never sees data; only its timer
/// can tick.
struct IdleProbe {
    core: HandlerCore,
    _fd: OwnedFd,
    fired: Rc<RefCell<Vec<(RawFd, Instant)>>>,
}

impl IdleProbe {
    fn new(fired: &Rc<RefCell<Vec<(RawFd, Instant)>>>) -> (Self, OwnedFd) {
        let (rd, wr) = nix::unistd::pipe().unwrap();
        let probe = Self {
            core: HandlerCore::new(rd.as_raw_fd(), format!("idle:{}", rd.as_raw_fd())),
            _fd: rd,
            fired: Rc::clone(fired),
        };
        (probe, wr)
    }
}

impl Handler for IdleProbe {
    fn core(&self) -> &HandlerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut HandlerCore {
        &mut self.core
    }

    fn on_timeout(&mut self, mux: &mut Multiplexer) {
        self.fired
            .borrow_mut()
            .push((self.core.fd(), Instant::now()));
        mux.detach(self.core.fd());
    }
}

#[test]
fn quiet_descriptor_times_out_once() {
    let mut mux = Multiplexer::new().unwrap();
    let fired = Rc::new(RefCell::new(Vec::new()));
    let (mut probe, _wr) = IdleProbe::new(&fired);

    probe.set_timeout(&mut mux, 0.05);
    let armed_at = Instant::now();
    mux.attach(probe).unwrap();
    mux.run().unwrap();

    let fired = fired.borrow();
    assert_eq!(fired.len(), 1);
    let elapsed = fired[0].1.duration_since(armed_at).as_secs_f64();
    assert!(elapsed >= 0.045, "fired early: {elapsed}");
    assert!(elapsed <= 0.2, "fired late: {elapsed}");
}

#[test]
fn earlier_deadline_fires_first() {
    let mut mux = Multiplexer::new_select().unwrap();
    let fired = Rc::new(RefCell::new(Vec::new()));
    let (first, _w1) = IdleProbe::new(&fired);
    let (second, _w2) = IdleProbe::new(&fired);
    let first_fd = first.core().fd();
    let second_fd = second.core().fd();

    mux.attach(second).unwrap();
    mux.attach(first).unwrap();

    // Both already due when the loop starts; order must follow deadlines,
    // not attach order.
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs_f64();
    mux.change_timeout(second_fd, None, Some(now - 0.010));
    mux.change_timeout(first_fd, None, Some(now - 0.050));

    mux.run().unwrap();

    let fired = fired.borrow();
    assert_eq!(fired.len(), 2);
    assert_eq!(fired[0].0, first_fd);
    assert_eq!(fired[1].0, second_fd);
}

#[test]
fn sub_millisecond_deadline_still_fires() {
    let mut mux = Multiplexer::new().unwrap();
    let fired = Rc::new(RefCell::new(Vec::new()));
    let (mut probe, _wr) = IdleProbe::new(&fired);

    probe.set_timeout(&mut mux, 0.0005);
    mux.attach(probe).unwrap();
    mux.run().unwrap();

    assert_eq!(fired.borrow().len(), 1);
}

#[test]
fn clearing_a_timer_disarms_it() {
    let mut mux = Multiplexer::new().unwrap();
    let fired = Rc::new(RefCell::new(Vec::new()));
    let (mut probe, _wr) = IdleProbe::new(&fired);

    probe.set_timeout(&mut mux, 0.02);
    probe.set_timeout(&mut mux, 0.0);
    mux.attach(probe).unwrap();

    // A metronome entry keeps the loop ticking; its fd has no handler, so
    // its expiries are discarded silently.
    let epoch_now = || {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs_f64()
    };
    let mut last = epoch_now() + 0.01;
    mux.change_timeout(i32::MAX, None, Some(last));

    let started = Instant::now();
    mux.run_with_heartbeat(move |mux, _, _| {
        if started.elapsed().as_secs_f64() > 0.06 {
            mux.end_loop();
        } else {
            let next = epoch_now() + 0.01;
            mux.change_timeout(i32::MAX, Some(last), Some(next));
            last = next;
        }
    })
    .unwrap();

    assert!(fired.borrow().is_empty());
}
