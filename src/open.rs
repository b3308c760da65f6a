//! Short-form open modes and the universal front door.
//!
//! A mode token names how the target is opened:
//!
//! | token  | meaning                                             |
//! |--------|-----------------------------------------------------|
//! | `<`    | read an existing file                               |
//! | `>`    | write a file, create, truncate                      |
//! | `>>`   | write a file, create, append                        |
//! | `-\|`  | spawn a command, pipe from its stdout               |
//! | `\|-`  | spawn a command, pipe to its stdin                  |
//! | `\|-\|`| spawn a command, pipe both ways                     |
//! | `\|=\|`| spawn a command, pipe both ways + capture stderr    |
//! | `tcp`  | connect a TCP stream                                |

use std::str::FromStr;

use crate::file::{FileReader, FileWriter, WriteDisposition};
use crate::pipe::{PipeReader, PipeWriter};
use crate::{Bundle, Error, Result, TcpStream};

/// Parsed open-mode token.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Mode {
    Read,
    Write,
    Append,
    PipeRead,
    PipeWrite,
    PipeBoth,
    PipeBothStderr,
    Tcp,
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "<" => Ok(Mode::Read),
            ">" => Ok(Mode::Write),
            ">>" => Ok(Mode::Append),
            "-|" => Ok(Mode::PipeRead),
            "|-" => Ok(Mode::PipeWrite),
            "|-|" => Ok(Mode::PipeBoth),
            "|=|" => Ok(Mode::PipeBothStderr),
            "tcp" => Ok(Mode::Tcp),
            other => Err(Error::BadMode(other.to_string())),
        }
    }
}

impl Mode {
    pub fn is_file(self) -> bool {
        matches!(self, Mode::Read | Mode::Write | Mode::Append)
    }

    pub fn is_pipe(self) -> bool {
        matches!(
            self,
            Mode::PipeRead | Mode::PipeWrite | Mode::PipeBoth | Mode::PipeBothStderr
        )
    }
}

/// Handler options for the front door; the unset ones keep their
/// per-handler defaults.
#[derive(Default)]
pub struct OpenOptions {
    /// Display name override.
    pub name: Option<String>,
    pub read_size: Option<usize>,
    pub write_size: Option<usize>,
    /// `O_EXCL` for file write modes.
    pub exclusive: bool,
    /// Raw open-flag override for file modes.
    pub modeflags: Option<i32>,
}

/// Whatever `open` produced; match on it (or use the accessors) to reach
/// the concrete handler before attaching.
pub enum Opened {
    FileReader(FileReader),
    FileWriter(FileWriter),
    PipeReader(PipeReader),
    PipeWriter(PipeWriter),
    Bundle(Bundle),
    Tcp(TcpStream),
}

impl std::fmt::Debug for Opened {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let variant = match self {
            Opened::FileReader(_) => "FileReader",
            Opened::FileWriter(_) => "FileWriter",
            Opened::PipeReader(_) => "PipeReader",
            Opened::PipeWriter(_) => "PipeWriter",
            Opened::Bundle(_) => "Bundle",
            Opened::Tcp(_) => "Tcp",
        };
        f.debug_tuple(variant).finish()
    }
}

/// Opens `target` according to `mode`.
///
/// For file modes, `target` is a path; for pipe modes, the command to run
/// with `args`; for `tcp`, a `host:port` address.
///
/// # Errors
///
/// [`Error::BadMode`] for an unrecognized token, [`Error::MissingOption`]
/// when a pipe mode has an empty command, plus whatever the underlying
/// open, spawn, or connect reports.
pub fn open(mode: &str, target: &str, args: &[&str], opts: &OpenOptions) -> Result<Opened> {
    let mode: Mode = mode.parse()?;
    if mode.is_pipe() && target.is_empty() {
        return Err(Error::MissingOption("command"));
    }
    if mode.is_file() && target.is_empty() {
        return Err(Error::MissingOption("file"));
    }

    let opened = match mode {
        Mode::Read => {
            let mut h = FileReader::open(target)?;
            if let Some(n) = opts.read_size {
                h.set_read_size(n);
            }
            if let Some(name) = &opts.name {
                h.set_name(name.clone());
            }
            Opened::FileReader(h)
        }
        Mode::Write | Mode::Append => {
            let disp = WriteDisposition {
                append: mode == Mode::Append,
                exclusive: opts.exclusive,
                create: true,
                modeflags: opts.modeflags,
            };
            let mut h = FileWriter::with_disposition(target, disp)?;
            if let Some(n) = opts.write_size {
                h.set_write_size(n);
            }
            if let Some(name) = &opts.name {
                h.set_name(name.clone());
            }
            Opened::FileWriter(h)
        }
        Mode::PipeRead => Opened::PipeReader(PipeReader::spawn(target, args)?),
        Mode::PipeWrite => Opened::PipeWriter(PipeWriter::spawn(target, args)?),
        Mode::PipeBoth => Opened::Bundle(Bundle::spawn(target, args)?),
        Mode::PipeBothStderr => Opened::Bundle(Bundle::spawn_with_stderr(target, args)?),
        Mode::Tcp => {
            let mut h = TcpStream::connect(target)?;
            if let Some(n) = opts.read_size {
                h.set_read_size(n);
            }
            if let Some(n) = opts.write_size {
                h.set_write_size(n);
            }
            if let Some(name) = &opts.name {
                h.set_name(name.clone());
            }
            Opened::Tcp(h)
        }
    };
    Ok(opened)
}
