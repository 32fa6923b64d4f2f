//! The uniform socket contract.
//!
//! Every transport (TCP, Unix-domain, TLS) exposes the same byte-oriented,
//! deadline-driven operations. All deadlines are absolute monotonic time;
//! [`Deadline::Inf`] disables the timeout.
//!
//! Error behavior is part of the contract:
//! - transient errors (EAGAIN/EINTR) retry internally under the deadline
//! - a reset or hung-up peer closes the socket; the operation fails
//! - after `close()` no further operation succeeds, and `is_open()`
//!   reflects this monotonically
//! - `close()` is idempotent and flushes buffered writes with a short
//!   deadline first

use std::fmt;
use std::fs::File;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};

use nix::errno::Errno;

use strand_rt::{Deadline, Direction};

/// Deadline used by `close()` to drain buffered writes.
pub const CLOSE_FLUSH_MS: i64 = 500;

/// Write-buffer size above which buffered sends flush eagerly.
pub(crate) const WRITE_BUFFER_FLUSH: usize = 8 * 1024;

// ---------------------------------------------------------------------------
// SocketError
// ---------------------------------------------------------------------------

/// Typed failure of a socket operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketError {
    /// Operation on a closed (or never-opened) socket.
    NotOpen,
    /// The socket is already connected or listening.
    InProgress,
    /// The deadline expired before the operation completed.
    Timeout,
    /// The peer closed or reset the connection; the socket closed itself.
    PeerClosed,
    /// A protocol-level failure (TLS alert, handshake error).
    Protocol,
    /// Any other system error.
    Io(Errno),
}

impl SocketError {
    pub(crate) fn from_errno(e: Errno) -> Self {
        match e {
            Errno::ETIMEDOUT => SocketError::Timeout,
            Errno::ECONNRESET | Errno::EPIPE => SocketError::PeerClosed,
            other => SocketError::Io(other),
        }
    }
}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketError::NotOpen => write!(f, "socket is not open"),
            SocketError::InProgress => write!(f, "socket is already in use"),
            SocketError::Timeout => write!(f, "socket operation timed out"),
            SocketError::PeerClosed => write!(f, "peer closed the connection"),
            SocketError::Protocol => write!(f, "protocol failure"),
            SocketError::Io(errno) => write!(f, "socket error: {}", errno),
        }
    }
}

impl std::error::Error for SocketError {}

// ---------------------------------------------------------------------------
// Socket trait
// ---------------------------------------------------------------------------

/// A connected, bidirectional byte stream.
pub trait Socket: Send {
    /// True until `close()` (or a fatal error) closed the transport.
    fn is_open(&self) -> bool;

    /// Peer address for IP transports, `None` otherwise.
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Send up to `buf.len()` bytes, retrying transient errors under the
    /// deadline. Returns bytes accepted; on a reset peer the socket closes
    /// itself.
    fn send(&mut self, buf: &[u8], deadline: Deadline) -> Result<usize, SocketError>;

    /// Stream `len` bytes of `file` starting at `offset` through the
    /// transport.
    fn sendfile(
        &mut self,
        file: &File,
        offset: u64,
        len: usize,
        deadline: Deadline,
    ) -> Result<usize, SocketError>;

    /// Drain buffered writes.
    fn flush(&mut self, deadline: Deadline) -> Result<(), SocketError>;

    /// Receive at least one byte, up to `buf.len()`.
    fn receive(&mut self, buf: &mut [u8], deadline: Deadline) -> Result<usize, SocketError>;

    /// Receive until any of `delims` is seen (the delimiter is included) or
    /// `buf` fills.
    fn receive_until(
        &mut self,
        buf: &mut [u8],
        delims: &[u8],
        deadline: Deadline,
    ) -> Result<usize, SocketError>;

    /// Best-effort fill of `buf`: reads until the buffer is full, the
    /// deadline expires with nothing read, or the transport would block
    /// after a partial read (which is success).
    fn read(&mut self, buf: &mut [u8], deadline: Deadline) -> Result<usize, SocketError>;

    /// Enable or disable write buffering; disabling flushes first.
    fn set_buffering(&mut self, on: bool, deadline: Deadline);

    /// Flush briefly, then close. Idempotent.
    fn close(&mut self);
}

// ---------------------------------------------------------------------------
// FdStream: shared nonblocking-fd plumbing
// ---------------------------------------------------------------------------

/// Nonblocking fd with deadline-driven retries and a small write buffer.
///
/// The concrete TCP and Unix transports are thin wrappers around this; the
/// TLS transport layers rustls on top of it.
pub(crate) struct FdStream {
    fd: Option<OwnedFd>,
    wbuf: Vec<u8>,
    buffering: bool,
}

impl FdStream {
    pub fn new(fd: OwnedFd) -> Self {
        FdStream {
            fd: Some(fd),
            wbuf: Vec::new(),
            buffering: true,
        }
    }

    pub fn closed() -> Self {
        FdStream {
            fd: None,
            wbuf: Vec::new(),
            buffering: true,
        }
    }

    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    fn fd(&self) -> Result<RawFd, SocketError> {
        self.raw_fd().ok_or(SocketError::NotOpen)
    }

    fn wait(&self, fd: RawFd, dir: Direction, deadline: Deadline) -> Result<(), SocketError> {
        match strand_rt::fdwait(fd, dir, deadline) {
            Ok(events) => {
                if events.contains(strand_rt::IoEvents::ERROR) {
                    return Err(SocketError::Io(Errno::EIO));
                }
                Ok(())
            }
            Err(strand_rt::IoWaitError::Timeout) => Err(SocketError::Timeout),
            Err(_) => Err(SocketError::NotOpen),
        }
    }

    /// Write all of `buf` directly to the fd.
    pub fn write_all(&mut self, buf: &[u8], deadline: Deadline) -> Result<(), SocketError> {
        let fd = self.fd()?;
        let mut remaining = buf;
        while !remaining.is_empty() {
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            match nix::unistd::write(borrowed, remaining) {
                Ok(0) => {
                    self.close_now();
                    return Err(SocketError::PeerClosed);
                }
                Ok(n) => remaining = &remaining[n..],
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => {
                    self.wait(fd, Direction::Write, deadline)?;
                }
                Err(Errno::ECONNRESET) | Err(Errno::EPIPE) => {
                    self.close_now();
                    return Err(SocketError::PeerClosed);
                }
                Err(e) => return Err(SocketError::Io(e)),
            }
        }
        Ok(())
    }

    /// Buffered send: appends, flushing eagerly past the high mark.
    pub fn send(&mut self, buf: &[u8], deadline: Deadline) -> Result<usize, SocketError> {
        if !self.is_open() {
            return Err(SocketError::NotOpen);
        }
        if self.buffering {
            self.wbuf.extend_from_slice(buf);
            if self.wbuf.len() >= WRITE_BUFFER_FLUSH {
                self.flush(deadline)?;
            }
        } else {
            self.write_all(buf, deadline)?;
        }
        Ok(buf.len())
    }

    pub fn flush(&mut self, deadline: Deadline) -> Result<(), SocketError> {
        if self.wbuf.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.wbuf);
        let res = self.write_all(&pending, deadline);
        if res.is_err() {
            // On failure the unsent bytes are gone with the connection.
            log::trace!("flush dropped {} unsent bytes", pending.len());
        }
        res
    }

    /// Read into `buf`; returns 0 only when the peer half-closed.
    fn read_some(&mut self, buf: &mut [u8], deadline: Deadline) -> Result<usize, SocketError> {
        let fd = self.fd()?;
        loop {
            match nix::unistd::read(fd, buf) {
                Ok(0) => {
                    self.close_now();
                    return Err(SocketError::PeerClosed);
                }
                Ok(n) => return Ok(n),
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => {
                    self.wait(fd, Direction::Read, deadline)?;
                }
                Err(Errno::ECONNRESET) => {
                    self.close_now();
                    return Err(SocketError::PeerClosed);
                }
                Err(e) => return Err(SocketError::Io(e)),
            }
        }
    }

    /// Nonblocking read attempt: `Ok(None)` when the transport would block.
    fn try_read(&mut self, buf: &mut [u8]) -> Result<Option<usize>, SocketError> {
        let fd = self.fd()?;
        match nix::unistd::read(fd, buf) {
            Ok(0) => {
                self.close_now();
                Err(SocketError::PeerClosed)
            }
            Ok(n) => Ok(Some(n)),
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => Ok(None),
            Err(Errno::ECONNRESET) => {
                self.close_now();
                Err(SocketError::PeerClosed)
            }
            Err(e) => Err(SocketError::Io(e)),
        }
    }

    pub fn receive(&mut self, buf: &mut [u8], deadline: Deadline) -> Result<usize, SocketError> {
        self.read_some(buf, deadline)
    }

    pub fn receive_until(
        &mut self,
        buf: &mut [u8],
        delims: &[u8],
        deadline: Deadline,
    ) -> Result<usize, SocketError> {
        let mut filled = 0;
        while filled < buf.len() {
            // One byte at a time: bytes past the delimiter belong to the
            // next message and must stay in the transport.
            let n = self.read_some(&mut buf[filled..filled + 1], deadline)?;
            filled += n;
            if delims.contains(&buf[filled - 1]) {
                break;
            }
        }
        Ok(filled)
    }

    pub fn read_fill(&mut self, buf: &mut [u8], deadline: Deadline) -> Result<usize, SocketError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.try_read(&mut buf[filled..]) {
                Ok(Some(n)) => filled += n,
                Ok(None) => {
                    if filled > 0 {
                        // EAGAIN with data is success.
                        return Ok(filled);
                    }
                    let fd = self.fd()?;
                    self.wait(fd, Direction::Read, deadline)?;
                }
                Err(e) => {
                    if filled > 0 {
                        return Ok(filled);
                    }
                    return Err(e);
                }
            }
        }
        Ok(filled)
    }

    pub fn set_buffering(&mut self, on: bool, deadline: Deadline) {
        if !on {
            let _ = self.flush(deadline);
        }
        self.buffering = on;
    }

    pub fn close_now(&mut self) {
        self.fd = None;
        self.wbuf.clear();
    }

    /// Give up ownership of the fd without closing it.
    pub fn take_fd(&mut self) -> Option<OwnedFd> {
        self.wbuf.clear();
        self.fd.take()
    }

    pub fn close(&mut self) {
        if self.is_open() {
            let _ = self.flush(Deadline::after_ms(CLOSE_FLUSH_MS));
            self.fd = None;
        }
    }

    /// OS sendfile from `file` into this stream.
    pub fn sendfile(
        &mut self,
        file: &File,
        offset: u64,
        len: usize,
        deadline: Deadline,
    ) -> Result<usize, SocketError> {
        // Buffered bytes must precede the file contents on the wire.
        self.flush(deadline)?;
        let fd = self.fd()?;
        let mut off = offset as libc::off_t;
        let mut sent = 0;
        while sent < len {
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            match nix::sys::sendfile::sendfile(borrowed, file, Some(&mut off), len - sent) {
                Ok(0) => break,
                Ok(n) => sent += n,
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => {
                    self.wait(fd, Direction::Write, deadline)?;
                }
                Err(Errno::ECONNRESET) | Err(Errno::EPIPE) => {
                    self.close_now();
                    return Err(SocketError::PeerClosed);
                }
                Err(e) => return Err(SocketError::Io(e)),
            }
        }
        Ok(sent)
    }
}

impl fmt::Debug for FdStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdStream")
            .field("fd", &self.raw_fd())
            .field("buffered", &self.wbuf.len())
            .field("buffering", &self.buffering)
            .finish()
    }
}
