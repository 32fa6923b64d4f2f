//! TLS transport over the deadline-driven fd plumbing.
//!
//! rustls drives the handshake implicitly on first read/write through a
//! [`DeadlineIo`] adapter whose blocking `io::Read`/`io::Write` honor the
//! per-operation deadline of the socket contract. Server and client
//! connections share one enum, like the TCP side of the house.

use std::fs::File;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection, StreamOwned};
use rustls_pki_types::ServerName;

use strand_rt::Deadline;

use crate::server::ServerSocket;
use crate::socket::{FdStream, Socket, SocketError};
use crate::tcp::{TcpServerSock, TcpSock};

/// Chunk size for the TLS sendfile fallback.
const SENDFILE_CHUNK: usize = 8 * 1024;

// ---------------------------------------------------------------------------
// DeadlineIo
// ---------------------------------------------------------------------------

/// Blocking-with-deadline `io::Read`/`io::Write` view over an [`FdStream`].
///
/// rustls sees a blocking transport; the deadline for the current socket
/// operation is stashed here before handing control to rustls.
pub(crate) struct DeadlineIo {
    stream: FdStream,
    deadline: Deadline,
}

impl DeadlineIo {
    fn new(fd: OwnedFd) -> Self {
        DeadlineIo {
            stream: FdStream::new(fd),
            deadline: Deadline::Inf,
        }
    }

    fn set_deadline(&mut self, deadline: Deadline) {
        self.deadline = deadline;
    }

    fn to_io_error(e: SocketError) -> std::io::Error {
        let kind = match e {
            SocketError::Timeout => std::io::ErrorKind::TimedOut,
            SocketError::PeerClosed => std::io::ErrorKind::ConnectionReset,
            SocketError::NotOpen => std::io::ErrorKind::NotConnected,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, e.to_string())
    }
}

impl Read for DeadlineIo {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.stream.receive(buf, self.deadline) {
            Ok(n) => Ok(n),
            // EOF: rustls distinguishes clean close_notify from truncation.
            Err(SocketError::PeerClosed) => Ok(0),
            Err(e) => Err(Self::to_io_error(e)),
        }
    }
}

impl Write for DeadlineIo {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.stream
            .write_all(buf, self.deadline)
            .map(|()| buf.len())
            .map_err(Self::to_io_error)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TlsSock
// ---------------------------------------------------------------------------

/// Server or client side of an established TLS stream.
enum TlsStream {
    Server(StreamOwned<ServerConnection, DeadlineIo>),
    Client(StreamOwned<ClientConnection, DeadlineIo>),
}

impl TlsStream {
    fn io(&mut self) -> &mut DeadlineIo {
        match self {
            TlsStream::Server(s) => &mut s.sock,
            TlsStream::Client(s) => &mut s.sock,
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            TlsStream::Server(s) => s.read(buf),
            TlsStream::Client(s) => s.read(buf),
        }
    }

    fn write_all_flush(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            TlsStream::Server(s) => {
                s.write_all(buf)?;
                s.flush()
            }
            TlsStream::Client(s) => {
                s.write_all(buf)?;
                s.flush()
            }
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            TlsStream::Server(s) => s.conn.send_close_notify(),
            TlsStream::Client(s) => s.conn.send_close_notify(),
        }
        let _ = match self {
            TlsStream::Server(s) => s.flush(),
            TlsStream::Client(s) => s.flush(),
        };
    }
}

/// A TLS-protected stream socket.
pub struct TlsSock {
    inner: Option<TlsStream>,
    peer: Option<SocketAddr>,
}

impl TlsSock {
    /// An unconnected socket; call [`TlsSock::connect`].
    pub fn new() -> Self {
        TlsSock {
            inner: None,
            peer: None,
        }
    }

    /// A client config trusting the bundled webpki roots.
    pub fn default_client_config() -> Arc<ClientConfig> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Arc::new(
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    }

    /// Connect to `addr` and start a TLS session for `server_name`.
    ///
    /// The handshake itself completes lazily on the first send or receive,
    /// under that operation's deadline.
    pub fn connect(
        &mut self,
        addr: SocketAddr,
        server_name: &str,
        config: Arc<ClientConfig>,
        deadline: Deadline,
    ) -> bool {
        if self.is_open() {
            log::warn!("connecting an open socket is not supported");
            return false;
        }

        let mut tcp = TcpSock::new();
        if !tcp.connect(addr, deadline) {
            return false;
        }
        let (fd, peer) = tcp.into_parts();
        let Some(fd) = fd else {
            return false;
        };

        let name = match ServerName::try_from(server_name.to_string()) {
            Ok(name) => name,
            Err(e) => {
                log::warn!("invalid TLS server name {}: {}", server_name, e);
                return false;
            }
        };
        let conn = match ClientConnection::new(config, name) {
            Ok(conn) => conn,
            Err(e) => {
                log::warn!("creating TLS client session failed: {}", e);
                return false;
            }
        };

        self.inner = Some(TlsStream::Client(StreamOwned::new(conn, DeadlineIo::new(fd))));
        self.peer = peer;
        true
    }

    /// Wrap an accepted TCP fd in a server-side TLS session.
    pub(crate) fn accepted(fd: OwnedFd, peer: Option<SocketAddr>, config: Arc<ServerConfig>) -> Result<Self, SocketError> {
        let conn = ServerConnection::new(config).map_err(|e| {
            log::warn!("creating TLS server session failed: {}", e);
            SocketError::Protocol
        })?;
        Ok(TlsSock {
            inner: Some(TlsStream::Server(StreamOwned::new(conn, DeadlineIo::new(fd)))),
            peer,
        })
    }

    fn stream(&mut self, deadline: Deadline) -> Result<&mut TlsStream, SocketError> {
        let stream = self.inner.as_mut().ok_or(SocketError::NotOpen)?;
        stream.io().set_deadline(deadline);
        Ok(stream)
    }

    fn map_io_error(&mut self, e: std::io::Error) -> SocketError {
        match e.kind() {
            std::io::ErrorKind::TimedOut => SocketError::Timeout,
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof => {
                self.close_transport();
                SocketError::PeerClosed
            }
            std::io::ErrorKind::InvalidData => {
                self.close_transport();
                SocketError::Protocol
            }
            _ => SocketError::Io(nix::errno::Errno::EIO),
        }
    }

    fn close_transport(&mut self) {
        if let Some(mut stream) = self.inner.take() {
            stream.io().stream.close_now();
        }
    }
}

impl Default for TlsSock {
    fn default() -> Self {
        Self::new()
    }
}

impl Socket for TlsSock {
    fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn send(&mut self, buf: &[u8], deadline: Deadline) -> Result<usize, SocketError> {
        let stream = self.stream(deadline)?;
        match stream.write_all_flush(buf) {
            Ok(()) => Ok(buf.len()),
            Err(e) => Err(self.map_io_error(e)),
        }
    }

    fn sendfile(
        &mut self,
        file: &File,
        offset: u64,
        len: usize,
        deadline: Deadline,
    ) -> Result<usize, SocketError> {
        // No kernel path through TLS: stream the file in chunks.
        use std::os::unix::fs::FileExt;
        let mut chunk = vec![0u8; SENDFILE_CHUNK];
        let mut sent = 0;
        while sent < len {
            let want = (len - sent).min(SENDFILE_CHUNK);
            let n = file
                .read_at(&mut chunk[..want], offset + sent as u64)
                .map_err(|_| SocketError::Io(nix::errno::Errno::EIO))?;
            if n == 0 {
                break;
            }
            self.send(&chunk[..n], deadline)?;
            sent += n;
        }
        Ok(sent)
    }

    fn flush(&mut self, deadline: Deadline) -> Result<(), SocketError> {
        let stream = self.stream(deadline)?;
        let res = match stream {
            TlsStream::Server(s) => s.flush(),
            TlsStream::Client(s) => s.flush(),
        };
        res.map_err(|e| self.map_io_error(e))
    }

    fn receive(&mut self, buf: &mut [u8], deadline: Deadline) -> Result<usize, SocketError> {
        let stream = self.stream(deadline)?;
        match stream.read(buf) {
            Ok(0) => {
                self.close_transport();
                Err(SocketError::PeerClosed)
            }
            Ok(n) => Ok(n),
            Err(e) => Err(self.map_io_error(e)),
        }
    }

    fn receive_until(
        &mut self,
        buf: &mut [u8],
        delims: &[u8],
        deadline: Deadline,
    ) -> Result<usize, SocketError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.receive(&mut buf[filled..filled + 1], deadline)?;
            filled += n;
            if delims.contains(&buf[filled - 1]) {
                break;
            }
        }
        Ok(filled)
    }

    fn read(&mut self, buf: &mut [u8], deadline: Deadline) -> Result<usize, SocketError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.receive(&mut buf[filled..], deadline) {
                Ok(n) => filled += n,
                Err(SocketError::Timeout) if filled > 0 => return Ok(filled),
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

    fn set_buffering(&mut self, _on: bool, _deadline: Deadline) {
        // rustls owns the record buffering on this transport.
    }

    fn close(&mut self) {
        if let Some(stream) = self.inner.as_mut() {
            stream
                .io()
                .set_deadline(Deadline::after_ms(crate::socket::CLOSE_FLUSH_MS));
            stream.send_close_notify();
        }
        self.close_transport();
    }
}

impl Drop for TlsSock {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TlsSock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSock")
            .field("open", &self.is_open())
            .field("peer", &self.peer)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// TlsServerSock
// ---------------------------------------------------------------------------

/// A listening socket producing server-side TLS streams.
pub struct TlsServerSock {
    tcp: TcpServerSock,
    config: Arc<ServerConfig>,
}

impl TlsServerSock {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        TlsServerSock {
            tcp: TcpServerSock::new(),
            config,
        }
    }
}

impl ServerSocket for TlsServerSock {
    fn listen(&mut self, addr: &str, backlog: i32) -> bool {
        self.tcp.listen(addr, backlog)
    }

    fn accept(&mut self, deadline: Deadline) -> Result<Box<dyn Socket>, SocketError> {
        let tcp = self.tcp.accept_tcp(deadline)?;
        let (fd, peer) = tcp.into_parts();
        let fd = fd.ok_or(SocketError::NotOpen)?;
        let sock = TlsSock::accepted(fd, peer, Arc::clone(&self.config))?;
        Ok(Box::new(sock))
    }

    fn is_running(&self) -> bool {
        self.tcp.is_running()
    }

    fn close(&mut self) {
        ServerSocket::close(&mut self.tcp);
    }

    fn shutdown(&mut self) {
        self.tcp.shutdown();
    }
}

impl std::fmt::Debug for TlsServerSock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsServerSock")
            .field("running", &self.is_running())
            .finish()
    }
}
