//! Non-blocking read ends of producer pipes
//!
//! A [`PipeEnd`] owns the read side of a child's stdout. The fusion loop
//! reads through a [`PipeSource`] handle while the supervisor keeps the
//! [`PipeEnd`] so it can close the descriptor during shutdown. Once closed,
//! every handle reads as end-of-stream.

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use parking_lot::Mutex;

/// Put a descriptor into non-blocking mode
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl with F_GETFL/F_SETFL only reads and updates the status
    // flags of a descriptor the caller owns.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if flags & libc::O_NONBLOCK != 0 {
            return Ok(());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Create an anonymous pipe, returning `(read, write)`
pub fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    // SAFETY: pipe2 writes two fresh descriptors into the array on success;
    // ownership is taken immediately below.
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both descriptors were just returned by pipe2 and are owned by no one else.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    Ok((read, write))
}

/// Closable, shared read end of a pipe
#[derive(Debug)]
pub struct PipeEnd {
    file: Mutex<Option<File>>,
}

impl PipeEnd {
    /// Take ownership of a read descriptor and switch it to non-blocking mode
    pub fn new(fd: impl Into<OwnedFd>) -> io::Result<Arc<Self>> {
        let fd: OwnedFd = fd.into();
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Arc::new(Self {
            file: Mutex::new(Some(File::from(fd))),
        }))
    }

    /// Reader handle for the fusion loop
    pub fn source(self: &Arc<Self>) -> PipeSource {
        PipeSource { end: Arc::clone(self) }
    }

    /// Close the descriptor. Returns false if it was already closed.
    pub fn close(&self) -> bool {
        self.file.lock().take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.file.lock().is_none()
    }
}

/// Reader over a [`PipeEnd`]
///
/// Empty pipe reads as `WouldBlock`; a closed end or a producer that
/// exited reads as `Ok(0)`.
#[derive(Debug, Clone)]
pub struct PipeSource {
    end: Arc<PipeEnd>,
}

impl PipeSource {
    pub fn end(&self) -> &Arc<PipeEnd> {
        &self.end
    }
}

impl Read for PipeSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let guard = self.end.file.lock();
        match guard.as_ref() {
            Some(file) => {
                let mut file: &File = file;
                file.read(buf)
            }
            None => Ok(0),
        }
    }
}
