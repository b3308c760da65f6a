use std::mem;

use fdmux::{Handler, Multiplexer, ReadSide, TcpService, TcpStream, WriteSide};

fn main() -> fdmux::Result<()> {
    let mut mux = Multiplexer::new()?;

    let mut service = TcpService::builder()
        .host("127.0.0.1")
        .port(7777)
        .name("echo")
        .conn_factory(|_mux, sock, _peer| {
            let mut stream = TcpStream::from_std(sock)?;
            stream.set_on_input(|stream, mux| {
                let chunk = mem::take(stream.reader_mut().buffer_mut());
                stream.write(mux, &chunk);
            });
            Ok(Box::new(stream) as Box<dyn Handler>)
        })
        .build()?;
    service.on_connection(|service, _mux, peer| {
        println!("{}: connection from {peer}", service.hostname());
    });

    println!("echoing on 127.0.0.1:7777");
    mux.attach(service)?;
    mux.run()
}
