//! TCP listener handler: accepts connections and attaches per-connection
//! handlers built by a user-supplied factory.

use std::io;
use std::net::{self, SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::sys::socket::{
    bind, listen, setsockopt, socket, sockopt, AddressFamily, Backlog, SockFlag, SockType,
    SockaddrIn, SockaddrIn6,
};

use crate::error::is_retryable;
use crate::{interest, Error, Handler, HandlerCore, Multiplexer, Result};

/// Binds a listening socket with explicit `SO_REUSEADDR` and backlog
/// control, which `std::net::TcpListener::bind` does not expose.
fn bind_listener(addr: &SocketAddr, reuse: bool, backlog: i32) -> io::Result<OwnedFd> {
    let family = match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    };
    let sock = socket(family, SockType::Stream, SockFlag::SOCK_CLOEXEC, None)
        .map_err(io::Error::from)?;
    if reuse {
        setsockopt(&sock, sockopt::ReuseAddr, &true).map_err(io::Error::from)?;
    }
    match addr {
        SocketAddr::V4(v4) => bind(sock.as_raw_fd(), &SockaddrIn::from(*v4)),
        SocketAddr::V6(v6) => bind(sock.as_raw_fd(), &SockaddrIn6::from(*v6)),
    }
    .map_err(io::Error::from)?;
    let backlog = Backlog::new(backlog).map_err(io::Error::from)?;
    listen(&sock, backlog).map_err(io::Error::from)?;
    Ok(sock)
}

/// Builds the handler for one accepted connection. Runs with the
/// multiplexer available so the new handler can be configured (combinators
/// installed, timers armed) before it is attached.
pub type ConnFactory =
    Box<dyn FnMut(&mut Multiplexer, net::TcpStream, SocketAddr) -> Result<Box<dyn Handler>>>;

type ConnHook = Box<dyn FnMut(&mut TcpService, &mut Multiplexer, SocketAddr)>;

/// A listening socket handler.
///
/// On read readiness it accepts one connection, hands the socket to the
/// connection factory, attaches the resulting handler, and fires the
/// optional `on_connection` hook. A failed accept is logged and the
/// listener keeps running; only detaching closes it.
pub struct TcpService {
    core: HandlerCore,
    listener: net::TcpListener,
    factory: ConnFactory,
    on_connection: Option<ConnHook>,
    hostname: String,
}

impl TcpService {
    pub fn builder() -> TcpServiceBuilder {
        TcpServiceBuilder::default()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The advertised host name, for banners and logging.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Hook invoked after each accepted connection is attached.
    pub fn on_connection<F>(&mut self, hook: F)
    where
        F: FnMut(&mut TcpService, &mut Multiplexer, SocketAddr) + 'static,
    {
        self.on_connection = Some(Box::new(hook));
    }

    fn accept_one(&mut self, mux: &mut Multiplexer) {
        let (sock, peer) = match self.listener.accept() {
            Ok(pair) => pair,
            Err(ref e) if is_retryable(e) => return,
            Err(e) => {
                tracing::warn!(handler = %self.core.name(), error = %e, "accept failed");
                return;
            }
        };
        if let Err(e) = sock.set_nonblocking(true) {
            tracing::warn!(handler = %self.core.name(), error = %e, "could not unblock client");
            return;
        }
        let handler = match (self.factory)(mux, sock, peer) {
            Ok(handler) => handler,
            Err(e) => {
                tracing::warn!(handler = %self.core.name(), error = %e, "connection factory failed");
                return;
            }
        };
        if let Err(e) = mux.attach_boxed(handler) {
            tracing::warn!(handler = %self.core.name(), error = %e, "could not attach client");
            return;
        }
        tracing::debug!(handler = %self.core.name(), %peer, "connection accepted");
        if let Some(mut hook) = self.on_connection.take() {
            hook(self, mux, peer);
            if self.on_connection.is_none() {
                self.on_connection = Some(hook);
            }
        }
    }
}

impl Handler for TcpService {
    fn core(&self) -> &HandlerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut HandlerCore {
        &mut self.core
    }

    fn on_attach(&mut self, mux: &mut Multiplexer) -> io::Result<()> {
        // Listeners only ever wait for accept readiness.
        let fd = self.core.fd();
        self.core.apply(true, interest().read());
        mux.fdset(fd, true, interest().read())
    }

    fn on_readable(&mut self, mux: &mut Multiplexer, _fd: RawFd) {
        self.accept_one(mux);
    }
}

/// Configuration for a [`TcpService`], consumed by
/// [`build`](TcpServiceBuilder::build).
///
/// The socket-level options (host, port, listen backlog, address reuse,
/// the TLS toggle) pass through to socket construction; the rest configure
/// the handler itself.
pub struct TcpServiceBuilder {
    host: String,
    port: u16,
    listen: i32,
    reuse: bool,
    use_ssl: bool,
    name: Option<String>,
    hostname: Option<String>,
    factory: Option<ConnFactory>,
    socket: Option<net::TcpListener>,
}

impl Default for TcpServiceBuilder {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            listen: 128,
            reuse: true,
            use_ssl: false,
            name: None,
            hostname: None,
            factory: None,
            socket: None,
        }
    }
}

impl TcpServiceBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Listen backlog passed to the OS.
    pub fn listen(mut self, backlog: i32) -> Self {
        self.listen = backlog;
        self
    }

    /// Toggles `SO_REUSEADDR` (on by default).
    pub fn reuse(mut self, reuse: bool) -> Self {
        self.reuse = reuse;
        self
    }

    /// Marks accepted connections as TLS-carrying. The core only records
    /// the bit; transport-level TLS lives outside it.
    pub fn use_ssl(mut self, use_ssl: bool) -> Self {
        self.use_ssl = use_ssl;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Host name advertised to peers; defaults to the bind host.
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Supplies a pre-built listening socket instead of binding one.
    pub fn socket(mut self, listener: net::TcpListener) -> Self {
        self.socket = Some(listener);
        self
    }

    /// The factory constructing a handler per accepted connection.
    pub fn conn_factory<F>(mut self, factory: F) -> Self
    where
        F: FnMut(&mut Multiplexer, net::TcpStream, SocketAddr) -> Result<Box<dyn Handler>> + 'static,
    {
        self.factory = Some(Box::new(factory));
        self
    }

    /// # Errors
    ///
    /// [`Error::MissingOption`] without a connection factory; address
    /// resolution and bind failures as I/O errors.
    pub fn build(self) -> Result<TcpService> {
        let factory = self.factory.ok_or(Error::MissingOption("conn_type"))?;

        let listener = match self.socket {
            Some(listener) => listener,
            None => {
                let addr = (self.host.as_str(), self.port)
                    .to_socket_addrs()?
                    .next()
                    .ok_or_else(|| {
                        io::Error::new(io::ErrorKind::AddrNotAvailable, "host did not resolve")
                    })?;
                let fd = bind_listener(&addr, self.reuse, self.listen)?;
                net::TcpListener::from(fd)
            }
        };
        listener.set_nonblocking(true)?;

        let local = listener.local_addr()?;
        let name = self
            .name
            .unwrap_or_else(|| format!("tcp:{local}"));
        let hostname = self.hostname.unwrap_or(self.host);
        let core = HandlerCore::new(listener.as_raw_fd(), name).with_tls(self.use_ssl);
        Ok(TcpService {
            core,
            listener,
            factory,
            on_connection: None,
            hostname,
        })
    }
}
