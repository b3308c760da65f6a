//! The TCP echo scenario: listener, per-connection echo handler, client
//! half-close, echoed bytes then EOF on the client side.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::Shutdown;
use std::rc::Rc;
use std::thread;

use fdmux::{Handler, Multiplexer, ReadSide, TcpService, TcpStream, WriteSide};

/// Echo service whose connections end the loop after `quota` of them have
/// come and gone.
fn echo_service(quota: u32) -> (TcpService, Rc<RefCell<u32>>) {
    let served = Rc::new(RefCell::new(0u32));
    let count = Rc::clone(&served);
    let service = TcpService::builder()
        .host("127.0.0.1")
        .port(0)
        .name("echo")
        .conn_factory(move |_mux, sock, _peer| {
            let mut stream = TcpStream::from_std(sock)?;
            stream.set_on_input(|stream, mux| {
                let chunk = std::mem::take(stream.reader_mut().buffer_mut());
                stream.write(mux, &chunk);
            });
            let count = Rc::clone(&count);
            stream.set_on_eof(move |stream, mux| {
                stream.shutdown(mux, Shutdown::Write);
                *count.borrow_mut() += 1;
                if *count.borrow() == quota {
                    mux.end_loop();
                }
            });
            Ok(Box::new(stream) as Box<dyn Handler>)
        })
        .build()
        .unwrap();
    (service, served)
}

#[test]
fn echo_until_half_close() {
    let mut mux = Multiplexer::new().unwrap();
    let (service, _served) = echo_service(1);
    let addr = service.local_addr().unwrap();
    mux.attach(service).unwrap();

    let client = thread::spawn(move || {
        let mut sock = std::net::TcpStream::connect(addr).unwrap();
        sock.write_all(b"hello\n").unwrap();
        sock.shutdown(Shutdown::Write).unwrap();
        let mut echoed = Vec::new();
        sock.read_to_end(&mut echoed).unwrap();
        echoed
    });

    mux.run().unwrap();
    assert_eq!(client.join().unwrap(), b"hello\n");
}

#[test]
fn listener_survives_connection_churn() {
    let mut mux = Multiplexer::new_select().unwrap();
    let (service, served) = echo_service(3);
    let addr = service.local_addr().unwrap();
    mux.attach(service).unwrap();

    let client = thread::spawn(move || {
        for _ in 0..3 {
            let mut sock = std::net::TcpStream::connect(addr).unwrap();
            sock.write_all(b"ping\n").unwrap();
            sock.shutdown(Shutdown::Write).unwrap();
            let mut echoed = Vec::new();
            sock.read_to_end(&mut echoed).unwrap();
            assert_eq!(echoed, b"ping\n");
        }
    });

    mux.run().unwrap();
    client.join().unwrap();
    assert_eq!(*served.borrow(), 3);
}
