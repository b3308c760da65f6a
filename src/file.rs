//! Non-blocking file handlers for the `<`, `>`, and `>>` open modes.

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use crate::read::{ReadSide, Reader};
use crate::write::{WriteSide, Writer};
use crate::{interest, Handler, HandlerCore, Multiplexer, Result};

/// How a [`FileWriter`] opens its target.
#[derive(Clone, Copy, Debug, Default)]
pub struct WriteDisposition {
    /// Append instead of truncating.
    pub append: bool,
    /// Fail if the file already exists (`O_EXCL`).
    pub exclusive: bool,
    /// Create the file if absent. On by default for write modes.
    pub create: bool,
    /// Raw open-flag override, OR-ed into the computed flags.
    pub modeflags: Option<i32>,
}

/// Streams an existing file through the buffered read side (`<` mode).
///
/// Regular files always report ready, so the loop drains them in
/// `read_size` chunks until EOF; the handler detaches itself once EOF has
/// been delivered and no combinator is waiting.
pub struct FileReader {
    core: HandlerCore,
    file: File,
    reader: Reader<Self>,
}

impl FileReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::options()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;
        let fd = file.as_raw_fd();
        Ok(Self {
            core: HandlerCore::new(fd, format!("file:{}", path.display())),
            file,
            reader: Reader::new(),
        })
    }

    pub fn set_read_size(&mut self, read_size: usize) {
        self.reader.set_read_size(read_size);
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.core.set_name(name);
    }

    pub fn file(&self) -> &File {
        &self.file
    }
}

impl Handler for FileReader {
    fn core(&self) -> &HandlerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut HandlerCore {
        &mut self.core
    }

    fn on_readable(&mut self, mux: &mut Multiplexer, _fd: RawFd) {
        self.pump(mux);
    }

    fn on_exceptional(&mut self, mux: &mut Multiplexer, _fd: RawFd) {
        self.pump(mux);
    }
}

impl ReadSide for FileReader {
    fn reader(&self) -> &Reader<Self> {
        &self.reader
    }

    fn reader_mut(&mut self) -> &mut Reader<Self> {
        &mut self.reader
    }

    fn on_eof(&mut self, mux: &mut Multiplexer) {
        crate::read::resume(self, mux);
        if !self.reader.has_pending() {
            if !self.reader.buffer().is_empty() {
                tracing::debug!(
                    handler = %self.core.name(),
                    leftover = self.reader.buffer().len(),
                    "closing reader with unconsumed input"
                );
            }
            mux.detach(self.core.fd());
        }
    }
}

/// Writes a file through the buffered write side (`>` and `>>` modes).
pub struct FileWriter {
    core: HandlerCore,
    file: File,
    writer: Writer<Self>,
}

impl FileWriter {
    /// Opens for writing, creating if absent and truncating (`>`).
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_disposition(path, WriteDisposition {
            create: true,
            ..WriteDisposition::default()
        })
    }

    /// Opens for appending, creating if absent (`>>`).
    pub fn append(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_disposition(path, WriteDisposition {
            create: true,
            append: true,
            ..WriteDisposition::default()
        })
    }

    pub fn with_disposition(path: impl AsRef<Path>, disp: WriteDisposition) -> Result<Self> {
        let path = path.as_ref();
        let mut options = File::options();
        options.write(true);
        if disp.append {
            options.append(true);
        } else if !disp.exclusive {
            options.truncate(true);
        }
        if disp.exclusive {
            options.create_new(true);
        } else if disp.create {
            options.create(true);
        }
        options.custom_flags(disp.modeflags.unwrap_or(0) | libc::O_NONBLOCK);
        let file = options.open(path)?;
        let fd = file.as_raw_fd();
        Ok(Self {
            core: HandlerCore::new(fd, format!("file:{}", path.display())),
            file,
            writer: Writer::new(),
        })
    }

    pub fn set_write_size(&mut self, write_size: usize) {
        self.writer.set_write_size(write_size);
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.core.set_name(name);
    }
}

impl Handler for FileWriter {
    fn core(&self) -> &HandlerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut HandlerCore {
        &mut self.core
    }

    fn on_attach(&mut self, mux: &mut Multiplexer) -> io::Result<()> {
        // Write interest is demand-driven; nothing to watch until there is
        // pending output.
        if self.writer.has_pending() {
            let fd = self.core.fd();
            self.core.apply(true, interest().write());
            mux.fdset(fd, true, interest().write())?;
        }
        Ok(())
    }

    fn on_writable(&mut self, mux: &mut Multiplexer, _fd: RawFd) {
        self.drain(mux);
    }
}

impl WriteSide for FileWriter {
    fn writer(&self) -> &Writer<Self> {
        &self.writer
    }

    fn writer_mut(&mut self) -> &mut Writer<Self> {
        &mut self.writer
    }
}
