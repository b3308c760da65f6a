//! Thin raw-fd helpers where the `nix` wrappers do not fit the call site.

use std::io;
use std::os::fd::RawFd;

/// One non-blocking read of up to `want` bytes appended to `buf`.
pub(crate) fn read_append(fd: RawFd, buf: &mut Vec<u8>, want: usize) -> io::Result<usize> {
    let old_len = buf.len();
    buf.resize(old_len + want, 0);
    let ret = unsafe { libc::read(fd, buf[old_len..].as_mut_ptr().cast(), want) };
    if ret < 0 {
        buf.truncate(old_len);
        return Err(io::Error::last_os_error());
    }
    let n = ret as usize;
    buf.truncate(old_len + n);
    Ok(n)
}

/// One non-blocking write of `buf`, returning the number of bytes accepted.
pub(crate) fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let ret = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as usize)
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
