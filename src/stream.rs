//! Bidirectional TCP stream handler with half-close support.

use std::net::{self, SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};

use crate::read::{ReadSide, Reader};
use crate::write::{WriteSide, Writer};
use crate::{interest, Handler, HandlerCore, Multiplexer, Result};

type StreamHook = Box<dyn FnMut(&mut TcpStream, &mut Multiplexer)>;

/// A duplex stream handler: buffered read side and buffered write side over
/// one connected socket.
///
/// Initial interest is read plus exceptional; write interest appears only
/// while output is pending. The read and write directions shut down
/// independently ([`shutdown`](TcpStream::shutdown)); the handler closes
/// fully once both are down and nothing is left to drain.
pub struct TcpStream {
    core: HandlerCore,
    sock: net::TcpStream,
    peer: Option<SocketAddr>,
    reader: Reader<Self>,
    writer: Writer<Self>,
    read_down: bool,
    write_down: bool,
    write_down_wanted: bool,
    input_hook: Option<StreamHook>,
    eof_hook: Option<StreamHook>,
}

impl TcpStream {
    /// Connects to `addr` and wraps the socket (the `tcp` open mode).
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let sock = net::TcpStream::connect(addr)?;
        Self::from_std(sock)
    }

    /// Wraps an already-connected socket, e.g. one handed out by a
    /// listener's accept.
    pub fn from_std(sock: net::TcpStream) -> Result<Self> {
        sock.set_nonblocking(true)?;
        let peer = sock.peer_addr().ok();
        let name = match peer {
            Some(addr) => format!("tcp:{addr}"),
            None => "tcp:?".to_string(),
        };
        Ok(Self {
            core: HandlerCore::new(sock.as_raw_fd(), name),
            sock,
            peer,
            reader: Reader::new(),
            writer: Writer::new(),
            read_down: false,
            write_down: false,
            write_down_wanted: false,
            input_hook: None,
            eof_hook: None,
        })
    }

    pub fn set_tls_bit(&mut self, uses_tls: bool) {
        self.core.set_tls(uses_tls);
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn set_read_size(&mut self, read_size: usize) {
        self.reader.set_read_size(read_size);
    }

    pub fn set_write_size(&mut self, write_size: usize) {
        self.writer.set_write_size(write_size);
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.core.set_name(name);
    }

    /// Replaces the default input delivery (combinator continuations) with
    /// `hook`, invoked on every fresh chunk. An echo service, for example,
    /// writes the buffer back and clears it.
    pub fn set_on_input<F>(&mut self, hook: F)
    where
        F: FnMut(&mut TcpStream, &mut Multiplexer) + 'static,
    {
        self.input_hook = Some(Box::new(hook));
    }

    /// Runs `hook` instead of the default close-on-EOF when the peer shuts
    /// its write half.
    pub fn set_on_eof<F>(&mut self, hook: F)
    where
        F: FnMut(&mut TcpStream, &mut Multiplexer) + 'static,
    {
        self.eof_hook = Some(Box::new(hook));
    }

    /// Shuts down one or both directions of the stream.
    ///
    /// Read shutdown is immediate: read interest is cleared and the final
    /// EOF is delivered from whatever input is already buffered. Write
    /// shutdown waits for the pending buffer to drain. Once both
    /// directions are down and nothing is pending, the handler detaches.
    pub fn shutdown(&mut self, mux: &mut Multiplexer, how: net::Shutdown) {
        if matches!(how, net::Shutdown::Read | net::Shutdown::Both) && !self.read_down {
            let _ = self.sock.shutdown(net::Shutdown::Read);
            self.read_down = true;
            self.fdset(mux, false, interest().read());
            self.reader_mut().set_eof();
            crate::read::resume(self, mux);
        }
        if matches!(how, net::Shutdown::Write | net::Shutdown::Both) && !self.write_down {
            self.write_down_wanted = true;
            if !self.writer.has_pending() {
                let _ = self.sock.shutdown(net::Shutdown::Write);
                self.write_down = true;
                self.fdset(mux, false, interest().write());
            }
        }
        self.close_if_drained(mux);
    }

    fn close_if_drained(&mut self, mux: &mut Multiplexer) {
        if self.read_down && self.write_down && !self.writer.has_pending() {
            mux.detach(self.core.fd());
        }
    }
}

impl Handler for TcpStream {
    fn core(&self) -> &HandlerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut HandlerCore {
        &mut self.core
    }

    fn on_readable(&mut self, mux: &mut Multiplexer, _fd: RawFd) {
        if !self.read_down {
            self.pump(mux);
        }
    }

    fn on_writable(&mut self, mux: &mut Multiplexer, _fd: RawFd) {
        self.drain(mux);
    }

    fn on_exceptional(&mut self, mux: &mut Multiplexer, _fd: RawFd) {
        // Out-of-band data folds into the read path.
        tracing::debug!(handler = %self.core.name(), "exceptional condition on stream");
        if !self.read_down {
            self.pump(mux);
        }
    }

    fn on_detach(&mut self, _mux: &mut Multiplexer) {
        if !self.reader.buffer().is_empty() {
            tracing::warn!(
                handler = %self.core.name(),
                bytes = self.reader.buffer().len(),
                "stream closed with unconsumed input"
            );
        }
        if self.writer.has_pending() {
            tracing::warn!(
                handler = %self.core.name(),
                bytes = self.writer.pending_len(),
                "stream closed with undelivered output"
            );
        }
    }
}

impl ReadSide for TcpStream {
    fn reader(&self) -> &Reader<Self> {
        &self.reader
    }

    fn reader_mut(&mut self) -> &mut Reader<Self> {
        &mut self.reader
    }

    fn on_input(&mut self, mux: &mut Multiplexer) {
        if let Some(mut hook) = self.input_hook.take() {
            hook(self, mux);
            if self.input_hook.is_none() {
                self.input_hook = Some(hook);
            }
        } else {
            crate::read::resume(self, mux);
        }
    }

    fn on_eof(&mut self, mux: &mut Multiplexer) {
        self.read_down = true;
        crate::read::resume(self, mux);
        if let Some(mut hook) = self.eof_hook.take() {
            hook(self, mux);
            if self.eof_hook.is_none() {
                self.eof_hook = Some(hook);
            }
            return;
        }
        // Default: answer the peer's half-close by flushing and closing.
        self.shutdown(mux, net::Shutdown::Write);
    }
}

impl WriteSide for TcpStream {
    fn writer(&self) -> &Writer<Self> {
        &self.writer
    }

    fn writer_mut(&mut self) -> &mut Writer<Self> {
        &mut self.writer
    }

    fn on_outbuf_empty(&mut self, mux: &mut Multiplexer) {
        if let Some(more) = self.writer.take_more() {
            more(self, mux);
        }
        if self.writer.has_pending() {
            return;
        }
        self.fdset(mux, false, interest().write());
        if self.write_down_wanted && !self.write_down {
            let _ = self.sock.shutdown(net::Shutdown::Write);
            self.write_down = true;
        }
        if let Some(closing) = self.writer.take_closing() {
            closing(self, mux);
            return;
        }
        self.close_if_drained(mux);
    }
}
