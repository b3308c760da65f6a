use std::io;
use std::os::fd::RawFd;

/// Errors surfaced by handler construction and the main loop.
///
/// I/O failures inside handler callbacks never reach this type: retryable
/// conditions are swallowed and retried on the next readiness tick, anything
/// else logs a warning and closes the offending handler. Only configuration
/// mistakes and a failing reactor propagate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An open-mode token that is not one of the recognized forms.
    #[error("unknown open mode `{0}`")]
    BadMode(String),

    /// A required construction option was not supplied.
    #[error("missing required option `{0}`")]
    MissingOption(&'static str),

    /// A handler was attached for a descriptor that is already registered.
    #[error("file descriptor {0} is already attached")]
    DuplicateFd(RawFd),

    /// A descriptor outside the range the selected reactor can watch.
    #[error("file descriptor {0} exceeds the reactor's limit of {1}")]
    FdOutOfRange(RawFd, RawFd),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Whether an I/O error should be retried on the next readiness tick.
///
/// Covers the interrupted and would-block conditions (`EINTR`, `EAGAIN`);
/// every other error is treated as transient-fatal for the handler.
pub fn is_retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
