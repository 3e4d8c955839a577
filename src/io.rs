//! Thin async wrapper over an already-connected RFCOMM file descriptor,
//! handed to us by BlueZ's `Profile1.NewConnection`. BlueZ has
//! already negotiated the channel and connected the socket by the time we
//! receive the descriptor, so this only needs read/write/shutdown, not the
//! full socket/listener machinery a client-initiated RFCOMM connection would.

use std::{
    io::{self, Result},
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    pin::Pin,
    task::{ready, Context, Poll},
};

use tokio::io::{unix::AsyncFd, AsyncRead, AsyncWrite, ReadBuf};

/// An adopted, already-connected socket file descriptor.
pub struct Connection {
    fd: AsyncFd<OwnedFd>,
}

impl Connection {
    /// Adopts `fd` as a non-blocking, owned file descriptor.
    ///
    /// # Safety
    /// `fd` must be a valid, open, connected file descriptor not owned or
    /// closed by anything else.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Result<Self> {
        set_nonblocking(fd)?;
        Ok(Self { fd: AsyncFd::new(OwnedFd::from_raw_fd(fd))? })
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn recv(fd: RawFd, buf: &mut ReadBuf<'_>) -> Result<usize> {
    let unfilled = unsafe { buf.unfilled_mut() };
    match unsafe { libc::recv(fd, unfilled.as_mut_ptr() as *mut _, unfilled.len(), 0) } {
        -1 => Err(io::Error::last_os_error()),
        n => {
            let n = n as usize;
            unsafe { buf.assume_init(n) };
            buf.advance(n);
            Ok(n)
        }
    }
}

fn send(fd: RawFd, buf: &[u8]) -> Result<usize> {
    match unsafe { libc::send(fd, buf.as_ptr() as *const _, buf.len(), 0) } {
        -1 => Err(io::Error::last_os_error()),
        n => Ok(n as usize),
    }
}

impl AsyncRead for Connection {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<Result<()>> {
        loop {
            let mut guard = ready!(self.fd.poll_read_ready(cx))?;
            match guard.try_io(|inner| recv(inner.as_raw_fd(), buf)) {
                Ok(result) => return Poll::Ready(result.map(|_| ())),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize>> {
        loop {
            let mut guard = ready!(self.fd.poll_write_ready(cx))?;
            match guard.try_io(|inner| send(inner.as_raw_fd(), buf)) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        let fd = self.fd.get_ref().as_raw_fd();
        if unsafe { libc::shutdown(fd, libc::SHUT_RDWR) } < 0 {
            return Poll::Ready(Err(io::Error::last_os_error()));
        }
        Poll::Ready(Ok(()))
    }
}
