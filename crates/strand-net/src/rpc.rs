//! Length-prefixed RPC framing.
//!
//! Two receive modes over the socket contract:
//!
//! - *size-prefix on*: an 8-byte little-endian length, then exactly that
//!   many payload bytes read under the receive deadline
//! - *size-prefix off*: best-effort framing — block for at least one byte
//!   under the keep-alive deadline, then iterate short-deadline reads until
//!   the transport runs dry; EAGAIN with data is success
//!
//! Transmit mirrors receive: size (when enabled), body, flush. The
//! best-effort mode is inherently heuristic — its idle timeout is
//! configuration, not framing, and peers that half-close without flushing
//! can truncate a message.

use strand_rt::Deadline;

use crate::socket::{Socket, SocketError};

/// Bytes in the size prefix.
pub const SIZE_PREFIX_LEN: usize = 8;

/// Framer configuration.
#[derive(Debug, Clone)]
pub struct RpcIoConfig {
    /// Use the 8-byte size prefix; off selects best-effort framing.
    pub use_size_prefix: bool,
    /// Deadline for sends, in milliseconds.
    pub send_timeout_ms: i64,
    /// Deadline for payload reads, in milliseconds.
    pub receive_timeout_ms: i64,
    /// Deadline for the first byte of a best-effort receive (and for the
    /// size prefix of a framed one), in milliseconds.
    pub keep_alive_ms: i64,
    /// Cap on a received payload.
    pub max_payload: usize,
}

impl Default for RpcIoConfig {
    fn default() -> Self {
        RpcIoConfig {
            use_size_prefix: true,
            send_timeout_ms: 10_000,
            receive_timeout_ms: 10_000,
            keep_alive_ms: 30_000,
            max_payload: 16 * 1024 * 1024,
        }
    }
}

/// Failure modes of framed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcError {
    /// No (complete) message before the deadline.
    Timeout,
    /// A declared size exceeds the configured cap.
    Oversize(u64),
    /// The transport failed underneath.
    Transport(SocketError),
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcError::Timeout => write!(f, "rpc receive timed out"),
            RpcError::Oversize(n) => write!(f, "rpc payload of {} bytes exceeds cap", n),
            RpcError::Transport(e) => write!(f, "rpc transport failure: {}", e),
        }
    }
}

impl std::error::Error for RpcError {}

impl From<SocketError> for RpcError {
    fn from(e: SocketError) -> Self {
        match e {
            SocketError::Timeout => RpcError::Timeout,
            other => RpcError::Transport(other),
        }
    }
}

/// Length-prefixed (or best-effort) message framer.
#[derive(Debug, Clone)]
pub struct RpcIo {
    config: RpcIoConfig,
}

impl RpcIo {
    pub fn new(config: RpcIoConfig) -> Self {
        RpcIo { config }
    }

    pub fn config(&self) -> &RpcIoConfig {
        &self.config
    }

    /// Receive one message according to the framing mode.
    pub fn receive(&self, sock: &mut dyn Socket) -> Result<Vec<u8>, RpcError> {
        if self.config.use_size_prefix {
            self.sized_receive(sock)
        } else {
            self.best_effort_receive(sock)
        }
    }

    /// Transmit one message: size prefix (when enabled), body, flush.
    pub fn transmit(&self, sock: &mut dyn Socket, payload: &[u8]) -> Result<(), RpcError> {
        let deadline = Deadline::after_ms(self.config.send_timeout_ms);
        if self.config.use_size_prefix {
            let size = (payload.len() as u64).to_le_bytes();
            let sent = sock.send(&size, deadline)?;
            if sent != size.len() {
                log::warn!("sending message size failed");
                return Err(RpcError::Transport(SocketError::PeerClosed));
            }
        }
        let sent = sock.send(payload, deadline)?;
        if sent != payload.len() {
            log::warn!("sending message of {} bytes failed", payload.len());
            return Err(RpcError::Transport(SocketError::PeerClosed));
        }
        sock.flush(deadline)?;
        Ok(())
    }

    fn sized_receive(&self, sock: &mut dyn Socket) -> Result<Vec<u8>, RpcError> {
        let mut size_buf = [0u8; SIZE_PREFIX_LEN];
        read_exact(
            sock,
            &mut size_buf,
            Deadline::after_ms(self.config.keep_alive_ms),
        )?;
        let size = u64::from_le_bytes(size_buf);
        log::trace!("received message size {{size = {}}}", size);
        if size > self.config.max_payload as u64 {
            return Err(RpcError::Oversize(size));
        }

        let mut payload = vec![0u8; size as usize];
        read_exact(
            sock,
            &mut payload,
            Deadline::after_ms(self.config.receive_timeout_ms),
        )?;
        Ok(payload)
    }

    /// Opportunistic read loop: one guaranteed byte, then drain until a
    /// read comes back empty.
    fn best_effort_receive(&self, sock: &mut dyn Socket) -> Result<Vec<u8>, RpcError> {
        let mut buf = vec![0u8; 1024];

        // Wait for at least one byte under the keep-alive deadline.
        let first = sock.receive(
            &mut buf[..1],
            Deadline::after_ms(self.config.keep_alive_ms),
        )?;
        let mut total = first;

        let mut timeout_ms = self.config.receive_timeout_ms;
        loop {
            if total == buf.len() {
                if buf.len() >= self.config.max_payload {
                    return Err(RpcError::Oversize(buf.len() as u64));
                }
                // Ran out of room mid-burst; grow and keep reading with a
                // short deadline.
                buf.resize(buf.len() + 1024, 0);
                timeout_ms = 100;
            }
            match sock.read(&mut buf[total..], Deadline::after_ms(timeout_ms)) {
                Ok(n) => {
                    total += n;
                    if total < buf.len() {
                        // Short read: the transport ran dry.
                        break;
                    }
                }
                Err(SocketError::Timeout) => break,
                Err(e) => {
                    if total > 0 {
                        break;
                    }
                    return Err(e.into());
                }
            }
        }

        buf.truncate(total);
        Ok(buf)
    }
}

impl Default for RpcIo {
    fn default() -> Self {
        Self::new(RpcIoConfig::default())
    }
}

fn read_exact(
    sock: &mut dyn Socket,
    buf: &mut [u8],
    deadline: Deadline,
) -> Result<(), RpcError> {
    let mut filled = 0;
    while filled < buf.len() {
        filled += sock.receive(&mut buf[filled..], deadline)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ServerSocket;
    use crate::tcp::{TcpServerSock, TcpSock};
    use std::sync::Arc;

    fn sock_pair() -> (Box<dyn Socket>, TcpSock) {
        let mut server = TcpServerSock::new();
        assert!(server.listen("127.0.0.1:0", 4));
        let addr = server.local_addr().unwrap();

        let accepted = Arc::new(parking_lot::Mutex::new(None));
        let a2 = Arc::clone(&accepted);
        let acceptor = strand_rt::spawn(move || {
            let sock = server.accept(Deadline::after_ms(2000)).unwrap();
            *a2.lock() = Some(sock);
        });

        let slot = Arc::new(parking_lot::Mutex::new(None));
        let s2 = Arc::clone(&slot);
        strand_rt::spawn(move || {
            let mut sock = TcpSock::new();
            assert!(sock.connect(addr, Deadline::after_ms(2000)));
            *s2.lock() = Some(sock);
        })
        .join();
        acceptor.join();

        let client = slot.lock().take().unwrap();
        let server_sock = accepted.lock().take().unwrap();
        (server_sock, client)
    }

    #[test]
    fn test_sized_roundtrip() {
        strand_rt::init(2);
        let (mut server_side, mut client) = sock_pair();

        let io = RpcIo::default();
        let payload = b"the quick brown fox".to_vec();
        let p2 = payload.clone();

        let io2 = io.clone();
        let sender = strand_rt::spawn(move || {
            io2.transmit(&mut client, &p2).unwrap();
            client.close();
        });

        let got = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let g2 = Arc::clone(&got);
        let io3 = io.clone();
        strand_rt::spawn(move || {
            *g2.lock() = io3.receive(server_side.as_mut()).unwrap();
        })
        .join();
        sender.join();

        assert_eq!(*got.lock(), payload);
    }

    #[test]
    fn test_sized_empty_payload() {
        strand_rt::init(2);
        let (mut server_side, mut client) = sock_pair();

        let io = RpcIo::default();
        let io2 = io.clone();
        let sender = strand_rt::spawn(move || {
            io2.transmit(&mut client, b"").unwrap();
            client.close();
        });

        let got = Arc::new(parking_lot::Mutex::new(vec![1u8]));
        let g2 = Arc::clone(&got);
        strand_rt::spawn(move || {
            *g2.lock() = io.receive(server_side.as_mut()).unwrap();
        })
        .join();
        sender.join();
        assert!(got.lock().is_empty());
    }

    #[test]
    fn test_best_effort_roundtrip() {
        strand_rt::init(2);
        let (mut server_side, mut client) = sock_pair();

        let io = RpcIo::new(RpcIoConfig {
            use_size_prefix: false,
            keep_alive_ms: 2000,
            receive_timeout_ms: 200,
            ..RpcIoConfig::default()
        });
        let payload = vec![0x42u8; 3000];
        let p2 = payload.clone();

        let io2 = io.clone();
        let sender = strand_rt::spawn(move || {
            io2.transmit(&mut client, &p2).unwrap();
            client.close();
        });

        let got = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let g2 = Arc::clone(&got);
        strand_rt::spawn(move || {
            *g2.lock() = io.receive(server_side.as_mut()).unwrap();
        })
        .join();
        sender.join();
        assert_eq!(*got.lock(), payload);
    }

    #[test]
    fn test_oversize_rejected() {
        strand_rt::init(2);
        let (mut server_side, mut client) = sock_pair();

        let io = RpcIo::new(RpcIoConfig {
            max_payload: 16,
            ..RpcIoConfig::default()
        });
        let sender = strand_rt::spawn(move || {
            // Hand-craft an oversize prefix.
            let size = 1024u64.to_le_bytes();
            client.send(&size, Deadline::after_ms(1000)).unwrap();
            client.flush(Deadline::after_ms(1000)).unwrap();
            client.close();
        });

        let res = Arc::new(parking_lot::Mutex::new(None));
        let r2 = Arc::clone(&res);
        strand_rt::spawn(move || {
            *r2.lock() = Some(io.receive(server_side.as_mut()));
        })
        .join();
        sender.join();
        assert_eq!(*res.lock(), Some(Err(RpcError::Oversize(1024))));
    }
}
