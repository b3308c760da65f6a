//! fdmux — a readiness-driven I/O multiplexer.
//!
//! A single-threaded event loop that watches a dynamic set of file
//! descriptors for readable, writable, and exceptional conditions,
//! dispatches to per-descriptor handlers with buffered non-blocking I/O,
//! expires per-handler timeouts, and supervises child processes wired to
//! pipes.
//!
//! Construct a [`Multiplexer`] (choosing the `poll` or `select` back-end),
//! attach handlers, and [`run`](Multiplexer::run):
//!
//! ```no_run
//! use fdmux::{Multiplexer, PipeReader, ReadSide};
//!
//! fn main() -> fdmux::Result<()> {
//!     let mut mux = Multiplexer::new()?;
//!     let mut uptime = PipeReader::spawn("uptime", &[])?;
//!     uptime.slurp(&mut mux, |_, _, out| {
//!         print!("{}", String::from_utf8_lossy(&out));
//!     });
//!     mux.attach(uptime)?;
//!     mux.run()
//! }
//! ```
//!
//! Handlers never block: the only blocking call is the reactor's wait, and
//! every callback runs on the loop thread with the multiplexer borrowed
//! `&mut`. Combinators such as [`read_line`](ReadSide::read_line) deliver
//! synchronously when the buffer already satisfies them and otherwise park
//! a single-shot continuation.

mod bundle;
mod clock;
mod error;
mod file;
mod handler;
mod interest;
mod mux;
mod open;
mod pipe;
pub mod reactor;
mod read;
mod service;
mod stream;
mod sys;
mod write;

pub use crate::bundle::Bundle;
pub use crate::error::{is_retryable, Error, Result};
pub use crate::file::{FileReader, FileWriter, WriteDisposition};
pub use crate::handler::{Handler, HandlerCore};
pub use crate::interest::{interest, Interest};
pub use crate::mux::Multiplexer;
pub use crate::open::{open, Mode, OpenOptions, Opened};
pub use crate::pipe::{PipeReader, PipeWriter};
pub use crate::read::{ReadSide, Reader, DEFAULT_READ_SIZE};
pub use crate::service::{ConnFactory, TcpService, TcpServiceBuilder};
pub use crate::stream::TcpStream;
pub use crate::write::{WriteSide, Writer, DEFAULT_WRITE_SIZE};
