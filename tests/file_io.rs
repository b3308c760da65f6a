//! File write-then-read scenarios over the `<`, `>`, and `>>` modes.

use std::cell::RefCell;
use std::rc::Rc;

use fdmux::{FileReader, FileWriter, Multiplexer, ReadSide, WriteSide};

fn collect_lines(reader: &mut FileReader, mux: &mut Multiplexer, sink: Rc<RefCell<Vec<Vec<u8>>>>) {
    reader.read_line(mux, move |reader, mux, line| {
        let done = line.is_empty();
        sink.borrow_mut().push(line);
        if !done {
            collect_lines(reader, mux, sink);
        }
    });
}

#[test]
fn write_close_then_slurp() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scratch.txt");
    let mut mux = Multiplexer::new().unwrap();

    let mut writer = FileWriter::create(&path).unwrap();
    writer.write(&mut mux, b"tic\ntac\n");
    let closed = Rc::new(RefCell::new(0));
    let closed_in = Rc::clone(&closed);
    writer.close_then(&mut mux, move |_, _| *closed_in.borrow_mut() += 1);
    assert_eq!(*closed.borrow(), 1);
    drop(writer);

    let slurped = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&slurped);
    let mut reader = FileReader::open(&path).unwrap();
    reader.slurp(&mut mux, move |_, _, data| *sink.borrow_mut() = data);
    mux.attach(reader).unwrap();
    mux.run().unwrap();

    assert_eq!(slurped.borrow().as_slice(), b"tic\ntac\n");
}

#[test]
fn append_then_read_line_by_line() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scratch.txt");
    let mut mux = Multiplexer::new().unwrap();

    let mut writer = FileWriter::create(&path).unwrap();
    writer.write(&mut mux, b"tic\ntac\n");
    writer.close(&mut mux);
    drop(writer);

    let mut appender = FileWriter::append(&path).unwrap();
    appender.write(&mut mux, b"toe\n");
    appender.close(&mut mux);
    drop(appender);

    let lines = Rc::new(RefCell::new(Vec::new()));
    let mut reader = FileReader::open(&path).unwrap();
    collect_lines(&mut reader, &mut mux, Rc::clone(&lines));
    mux.attach(reader).unwrap();
    mux.run().unwrap();

    let lines = lines.borrow();
    assert_eq!(
        lines.as_slice(),
        &[
            b"tic\n".to_vec(),
            b"tac\n".to_vec(),
            b"toe\n".to_vec(),
            Vec::new(),
        ]
    );
}

#[test]
fn exclusive_create_refuses_existing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("already-there.txt");
    std::fs::write(&path, b"x").unwrap();

    let disp = fdmux::WriteDisposition {
        exclusive: true,
        create: true,
        ..Default::default()
    };
    assert!(FileWriter::with_disposition(&path, disp).is_err());
}
