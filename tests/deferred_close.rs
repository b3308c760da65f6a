//! Deferred close: a write handler with a large pending buffer must keep
//! its descriptor open until everything drained, then run the close
//! continuation exactly once.

use std::cell::RefCell;
use std::rc::Rc;

use fdmux::{Multiplexer, PipeWriter, WriteSide};
use nix::sys::wait::waitpid;

const PAYLOAD: usize = 100 * 1024;

#[test]
fn close_waits_for_drain() {
    let dir = tempfile::tempdir().unwrap();
    let count_path = dir.path().join("count.txt");
    let mut mux = Multiplexer::new().unwrap();

    // The child reports how many bytes actually reached it.
    let script = format!("wc -c > '{}'", count_path.display());
    let mut writer = PipeWriter::spawn("sh", &["-c", &script]).unwrap();
    let pid = writer.pid();

    let payload = vec![0x2au8; PAYLOAD];
    writer.write(&mut mux, &payload);
    assert!(
        writer.writer().has_pending(),
        "payload should exceed what one non-blocking write accepts"
    );

    let closed = Rc::new(RefCell::new(0));
    let closed_in = Rc::clone(&closed);
    writer.close_then(&mut mux, move |_, _| *closed_in.borrow_mut() += 1);
    // Still draining: the continuation must not have run yet.
    assert_eq!(*closed.borrow(), 0);

    mux.attach(writer).unwrap();
    mux.run().unwrap();
    assert_eq!(*closed.borrow(), 1);

    let _ = waitpid(pid, None);
    let counted: usize = std::fs::read_to_string(&count_path)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert_eq!(counted, PAYLOAD);
}

#[test]
fn immediate_close_runs_continuation_synchronously() {
    let mut mux = Multiplexer::new().unwrap();
    let mut writer = PipeWriter::spawn("sh", &["-c", "cat > /dev/null"]).unwrap();
    writer.write(&mut mux, b"small\n");

    let closed = Rc::new(RefCell::new(0));
    let closed_in = Rc::clone(&closed);
    writer.close_then(&mut mux, move |_, _| *closed_in.borrow_mut() += 1);
    assert_eq!(*closed.borrow(), 1);

    // Idempotent: the second close must not fire anything.
    let closed_in = Rc::clone(&closed);
    writer.close_then(&mut mux, move |_, _| *closed_in.borrow_mut() += 10);
    assert_eq!(*closed.borrow(), 1);
}
