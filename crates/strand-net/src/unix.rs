//! Unix-domain socket transport.

use std::fs::File;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use nix::errno::Errno;

use strand_rt::Deadline;

use crate::server::ServerSocket;
use crate::socket::{FdStream, Socket, SocketError};

/// A connected Unix-domain stream socket.
pub struct UnixSock {
    stream: FdStream,
    path: Option<PathBuf>,
}

impl UnixSock {
    pub fn new() -> Self {
        UnixSock {
            stream: FdStream::closed(),
            path: None,
        }
    }

    fn from_std(stream: UnixStream, path: Option<PathBuf>) -> Result<Self, SocketError> {
        stream
            .set_nonblocking(true)
            .map_err(|_| SocketError::Io(Errno::EIO))?;
        Ok(UnixSock {
            stream: FdStream::new(OwnedFd::from(stream)),
            path,
        })
    }

    /// Connect to the socket file at `path`.
    ///
    /// Filesystem connects complete immediately; the deadline only bounds
    /// subsequent operations, so it is unused here.
    pub fn connect(&mut self, path: impl AsRef<Path>, _deadline: Deadline) -> bool {
        if self.is_open() {
            log::warn!("connecting an open socket is not supported");
            return false;
        }
        let path = path.as_ref();
        match UnixStream::connect(path) {
            Ok(stream) => match Self::from_std(stream, Some(path.to_path_buf())) {
                Ok(sock) => {
                    *self = sock;
                    true
                }
                Err(e) => {
                    log::trace!("marking unix socket nonblocking failed: {}", e);
                    false
                }
            },
            Err(e) => {
                log::trace!("connection to {} failed: {}", path.display(), e);
                false
            }
        }
    }

    /// Path of the peer socket file, when known.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl Default for UnixSock {
    fn default() -> Self {
        Self::new()
    }
}

impl Socket for UnixSock {
    fn is_open(&self) -> bool {
        self.stream.is_open()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn send(&mut self, buf: &[u8], deadline: Deadline) -> Result<usize, SocketError> {
        if !self.is_open() {
            log::warn!("writing to a closed socket is not supported");
            return Err(SocketError::NotOpen);
        }
        self.stream.send(buf, deadline)
    }

    fn sendfile(
        &mut self,
        file: &File,
        offset: u64,
        len: usize,
        deadline: Deadline,
    ) -> Result<usize, SocketError> {
        if !self.is_open() {
            return Err(SocketError::NotOpen);
        }
        self.stream.sendfile(file, offset, len, deadline)
    }

    fn flush(&mut self, deadline: Deadline) -> Result<(), SocketError> {
        if !self.is_open() {
            return Err(SocketError::NotOpen);
        }
        self.stream.flush(deadline)
    }

    fn receive(&mut self, buf: &mut [u8], deadline: Deadline) -> Result<usize, SocketError> {
        if !self.is_open() {
            log::warn!("receiving from a closed socket is not supported");
            return Err(SocketError::NotOpen);
        }
        self.stream.receive(buf, deadline)
    }

    fn receive_until(
        &mut self,
        buf: &mut [u8],
        delims: &[u8],
        deadline: Deadline,
    ) -> Result<usize, SocketError> {
        if !self.is_open() {
            return Err(SocketError::NotOpen);
        }
        self.stream.receive_until(buf, delims, deadline)
    }

    fn read(&mut self, buf: &mut [u8], deadline: Deadline) -> Result<usize, SocketError> {
        if !self.is_open() {
            return Err(SocketError::NotOpen);
        }
        self.stream.read_fill(buf, deadline)
    }

    fn set_buffering(&mut self, on: bool, deadline: Deadline) {
        if self.is_open() {
            self.stream.set_buffering(on, deadline);
        }
    }

    fn close(&mut self) {
        self.stream.close();
    }
}

impl Drop for UnixSock {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for UnixSock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnixSock")
            .field("open", &self.is_open())
            .field("path", &self.path)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// UnixServerSock
// ---------------------------------------------------------------------------

/// A listening Unix-domain socket. Removes a stale socket file on listen
/// and its own file on close.
pub struct UnixServerSock {
    listener: Option<UnixListener>,
    path: Option<PathBuf>,
    running: bool,
}

impl UnixServerSock {
    pub fn new() -> Self {
        UnixServerSock {
            listener: None,
            path: None,
            running: false,
        }
    }
}

impl Default for UnixServerSock {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerSocket for UnixServerSock {
    fn listen(&mut self, addr: &str, _backlog: i32) -> bool {
        if self.listener.is_some() {
            log::warn!("server socket already listening");
            return false;
        }
        let path = PathBuf::from(addr);
        // A previous unclean shutdown leaves the socket file behind.
        let _ = std::fs::remove_file(&path);
        match UnixListener::bind(&path) {
            Ok(listener) => {
                if let Err(e) = listener.set_nonblocking(true) {
                    log::error!("marking listener nonblocking failed: {}", e);
                    return false;
                }
                self.listener = Some(listener);
                self.path = Some(path);
                self.running = true;
                true
            }
            Err(e) => {
                log::error!("listening on {} failed: {}", path.display(), e);
                false
            }
        }
    }

    fn accept(&mut self, deadline: Deadline) -> Result<Box<dyn Socket>, SocketError> {
        let listener = self.listener.as_ref().ok_or(SocketError::NotOpen)?;
        loop {
            match listener.accept() {
                Ok((stream, _peer)) => {
                    let sock = UnixSock::from_std(stream, None)?;
                    return Ok(Box::new(sock));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    use std::os::fd::AsRawFd;
                    match strand_rt::fdwait(
                        listener.as_raw_fd(),
                        strand_rt::Direction::Read,
                        deadline,
                    ) {
                        Ok(_) => continue,
                        Err(strand_rt::IoWaitError::Timeout) => return Err(SocketError::Timeout),
                        Err(_) => return Err(SocketError::NotOpen),
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::trace!("accept connection failed: {}", e);
                    return Err(SocketError::Io(
                        e.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO),
                    ));
                }
            }
        }
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn close(&mut self) {
        self.listener = None;
        self.running = false;
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_file(path);
        }
    }

    fn shutdown(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for UnixServerSock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnixServerSock")
            .field("running", &self.running)
            .field("path", &self.path)
            .finish()
    }
}
