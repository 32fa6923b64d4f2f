//! TCP transport.

use std::fs::File;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, OwnedFd};

use nix::errno::Errno;
use nix::sys::socket::{self, AddressFamily, SockFlag, SockType, SockaddrStorage};

use strand_rt::{Deadline, Direction};

use crate::server::ServerSocket;
use crate::socket::{FdStream, Socket, SocketError};

// ---------------------------------------------------------------------------
// TcpSock
// ---------------------------------------------------------------------------

/// A connected TCP stream socket.
pub struct TcpSock {
    stream: FdStream,
    peer: Option<SocketAddr>,
}

impl TcpSock {
    /// An unconnected socket; call [`TcpSock::connect`].
    pub fn new() -> Self {
        TcpSock {
            stream: FdStream::closed(),
            peer: None,
        }
    }

    pub(crate) fn from_fd(fd: OwnedFd, peer: Option<SocketAddr>) -> Self {
        TcpSock {
            stream: FdStream::new(fd),
            peer,
        }
    }

    /// Tear down into the raw fd and peer address (for transport layering).
    pub(crate) fn into_parts(mut self) -> (Option<OwnedFd>, Option<SocketAddr>) {
        (self.stream.take_fd(), self.peer.take())
    }

    /// Connect to `addr` before `deadline`. Returns `true` iff connected.
    ///
    /// Connecting an already-open socket is not supported and fails.
    pub fn connect(&mut self, addr: SocketAddr, deadline: Deadline) -> bool {
        if self.is_open() {
            log::warn!("connecting an open socket is not supported");
            return false;
        }
        match tcp_connect(addr, deadline) {
            Ok(fd) => {
                self.stream = FdStream::new(fd);
                self.peer = Some(addr);
                true
            }
            Err(e) => {
                log::trace!("connection to {} failed: {}", addr, e);
                false
            }
        }
    }
}

impl Default for TcpSock {
    fn default() -> Self {
        Self::new()
    }
}

/// Nonblocking connect driven by the reactor.
fn tcp_connect(addr: SocketAddr, deadline: Deadline) -> Result<OwnedFd, SocketError> {
    let family = match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    };
    let fd = socket::socket(
        family,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(SocketError::from_errno)?;

    let storage = SockaddrStorage::from(addr);
    match socket::connect(fd.as_raw_fd(), &storage) {
        Ok(()) => Ok(fd),
        Err(Errno::EINPROGRESS) => {
            match strand_rt::fdwait(fd.as_raw_fd(), Direction::Write, deadline) {
                Ok(_) => {}
                Err(strand_rt::IoWaitError::Timeout) => return Err(SocketError::Timeout),
                Err(_) => return Err(SocketError::NotOpen),
            }
            // Writability after EINPROGRESS means the connect finished;
            // the verdict is in SO_ERROR.
            let err = socket::getsockopt(&fd, socket::sockopt::SocketError)
                .map_err(SocketError::from_errno)?;
            if err == 0 {
                Ok(fd)
            } else {
                Err(SocketError::from_errno(Errno::from_raw(err)))
            }
        }
        Err(e) => Err(SocketError::from_errno(e)),
    }
}

impl Socket for TcpSock {
    fn is_open(&self) -> bool {
        self.stream.is_open()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
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
            log::warn!("writing to a closed socket is not supported");
            return Err(SocketError::NotOpen);
        }
        self.stream.sendfile(file, offset, len, deadline)
    }

    fn flush(&mut self, deadline: Deadline) -> Result<(), SocketError> {
        if !self.is_open() {
            log::warn!("flushing a closed socket is not supported");
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
        if !self.is_open() {
            log::warn!("setting buffering on a closed socket is not supported");
            return;
        }
        self.stream.set_buffering(on, deadline);
    }

    fn close(&mut self) {
        self.stream.close();
    }
}

impl Drop for TcpSock {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TcpSock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpSock")
            .field("open", &self.is_open())
            .field("peer", &self.peer)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// TcpServerSock
// ---------------------------------------------------------------------------

/// A listening TCP socket.
pub struct TcpServerSock {
    listener: Option<TcpListener>,
    running: bool,
}

impl TcpServerSock {
    pub fn new() -> Self {
        TcpServerSock {
            listener: None,
            running: false,
        }
    }

    /// Local address after a successful `listen`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }
}

impl Default for TcpServerSock {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerSocket for TcpServerSock {
    fn listen(&mut self, addr: &str, _backlog: i32) -> bool {
        if self.listener.is_some() {
            log::warn!("server socket already listening");
            return false;
        }
        match TcpListener::bind(addr) {
            Ok(listener) => {
                if let Err(e) = listener.set_nonblocking(true) {
                    log::error!("marking listener nonblocking failed: {}", e);
                    return false;
                }
                self.listener = Some(listener);
                self.running = true;
                true
            }
            Err(e) => {
                log::error!("listening on {} failed: {}", addr, e);
                false
            }
        }
    }

    fn accept(&mut self, deadline: Deadline) -> Result<Box<dyn Socket>, SocketError> {
        self.accept_tcp(deadline).map(|s| Box::new(s) as Box<dyn Socket>)
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn close(&mut self) {
        self.listener = None;
        self.running = false;
    }

    fn shutdown(&mut self) {
        self.running = false;
        self.listener = None;
    }
}

impl TcpServerSock {
    /// Accept one connection as a concrete [`TcpSock`].
    pub(crate) fn accept_tcp(&mut self, deadline: Deadline) -> Result<TcpSock, SocketError> {
        let listener = self.listener.as_ref().ok_or_else(|| {
            log::warn!("server socket is not listening");
            SocketError::NotOpen
        })?;

        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        log::warn!("accepted socket nonblocking failed: {}", e);
                        return Err(SocketError::Io(Errno::EIO));
                    }
                    let fd = OwnedFd::from(stream);
                    return Ok(TcpSock::from_fd(fd, Some(peer)));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    match strand_rt::fdwait(listener.as_raw_fd(), Direction::Read, deadline) {
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
}

impl std::fmt::Debug for TcpServerSock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServerSock")
            .field("running", &self.running)
            .field("addr", &self.local_addr())
            .finish()
    }
}
