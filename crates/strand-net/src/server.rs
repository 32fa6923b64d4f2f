//! Generic bind/listen/accept server loop.
//!
//! A [`Server`] owns a listening socket built from a [`SocketConfig`], a
//! user-supplied connection handler, and the accept pump: accepted sockets
//! are dispatched as tasks on the runtime, which applies its back-pressure
//! water marks to the spawn. Transient accept failures retry; fatal ones
//! stop the loop. `shutdown` closes the listener and waits for in-flight
//! handlers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use rustls::ServerConfig as TlsServerConfig;

use strand_rt::Deadline;

use crate::socket::{Socket, SocketError};
use crate::tcp::TcpServerSock;
use crate::tls::TlsServerSock;
use crate::unix::UnixServerSock;

// ---------------------------------------------------------------------------
// SocketConfig
// ---------------------------------------------------------------------------

/// Transport selection and bind parameters for a server.
#[derive(Clone)]
pub enum SocketConfig {
    /// Plain TCP on `bind_addr:port`.
    Tcp { bind_addr: String, port: u16 },
    /// TLS over TCP with a prepared rustls config.
    Tls {
        bind_addr: String,
        port: u16,
        tls: Arc<TlsServerConfig>,
    },
    /// Unix-domain socket at `path`.
    Unix { path: String },
}

impl SocketConfig {
    /// Address string handed to the transport's `listen`.
    pub fn bind_address(&self) -> String {
        match self {
            SocketConfig::Tcp { bind_addr, port } | SocketConfig::Tls { bind_addr, port, .. } => {
                format!("{}:{}", bind_addr, port)
            }
            SocketConfig::Unix { path } => path.clone(),
        }
    }
}

impl std::fmt::Debug for SocketConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocketConfig::Tcp { .. } => write!(f, "SocketConfig::Tcp({})", self.bind_address()),
            SocketConfig::Tls { .. } => write!(f, "SocketConfig::Tls({})", self.bind_address()),
            SocketConfig::Unix { .. } => write!(f, "SocketConfig::Unix({})", self.bind_address()),
        }
    }
}

/// A bound, listening socket that accepts [`Socket`] connections.
pub trait ServerSocket: Send {
    fn listen(&mut self, addr: &str, backlog: i32) -> bool;
    fn accept(&mut self, deadline: Deadline) -> Result<Box<dyn Socket>, SocketError>;
    fn is_running(&self) -> bool;
    fn close(&mut self);
    fn shutdown(&mut self);
}

/// Build the matching server socket for a config.
pub fn create_adaptor(config: &SocketConfig) -> Box<dyn ServerSocket> {
    match config {
        SocketConfig::Tcp { .. } => Box::new(TcpServerSock::new()),
        SocketConfig::Tls { tls, .. } => Box::new(TlsServerSock::new(Arc::clone(tls))),
        SocketConfig::Unix { .. } => Box::new(UnixServerSock::new()),
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Accept-loop tuning.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen backlog.
    pub backlog: i32,
    /// Deadline applied to each accept so shutdown is observed promptly.
    pub accept_timeout_ms: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            backlog: 127,
            accept_timeout_ms: 500,
        }
    }
}

/// Handles one accepted connection; runs as its own task.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn handle(&self, sock: Box<dyn Socket>);
}

impl<F> ConnectionHandler for F
where
    F: Fn(Box<dyn Socket>) + Send + Sync + 'static,
{
    fn handle(&self, sock: Box<dyn Socket>) {
        self(sock)
    }
}

/// A generic accept-and-dispatch server.
pub struct Server<H: ConnectionHandler> {
    socket_config: SocketConfig,
    config: ServerConfig,
    handler: Arc<H>,
    adaptor: parking_lot::Mutex<Option<Box<dyn ServerSocket>>>,
    running: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
}

impl<H: ConnectionHandler> Server<H> {
    pub fn new(socket_config: SocketConfig, config: ServerConfig, handler: H) -> Arc<Self> {
        Arc::new(Server {
            socket_config,
            config,
            handler: Arc::new(handler),
            adaptor: parking_lot::Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Connections currently inside a handler.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Bind, listen, and pump accepts until [`Server::shutdown`].
    ///
    /// Runs in the calling task; spawn it to serve in the background.
    pub fn run(self: &Arc<Self>) -> Result<(), SocketError> {
        let addr = self.socket_config.bind_address();
        let mut adaptor = create_adaptor(&self.socket_config);
        if !adaptor.listen(&addr, self.config.backlog) {
            log::error!("server failed to listen on {}", addr);
            return Err(SocketError::NotOpen);
        }
        log::info!("server listening on {}", addr);
        self.running.store(true, Ordering::Release);
        *self.adaptor.lock() = Some(adaptor);

        let sched = strand_rt::current_or_panic();
        while self.running.load(Ordering::Acquire) {
            let accepted = {
                let mut guard = self.adaptor.lock();
                let Some(adaptor) = guard.as_mut() else {
                    break;
                };
                adaptor.accept(Deadline::after_ms(self.config.accept_timeout_ms))
            };

            match accepted {
                Ok(sock) => {
                    let handler = Arc::clone(&self.handler);
                    let in_flight = Arc::clone(&self.in_flight);
                    in_flight.fetch_add(1, Ordering::AcqRel);
                    sched.spawn(move || {
                        handler.handle(sock);
                        in_flight.fetch_sub(1, Ordering::AcqRel);
                    });
                }
                // Transient: deadline lapse or interrupted accept.
                Err(SocketError::Timeout) => continue,
                Err(SocketError::Io(nix::errno::Errno::EINTR))
                | Err(SocketError::Io(nix::errno::Errno::EAGAIN)) => continue,
                Err(e) => {
                    if self.running.load(Ordering::Acquire) {
                        log::error!("accept failed, stopping server: {}", e);
                    }
                    break;
                }
            }
        }

        self.running.store(false, Ordering::Release);
        if let Some(mut adaptor) = self.adaptor.lock().take() {
            adaptor.close();
        }
        log::info!("server on {} stopped", addr);
        Ok(())
    }

    /// Close the listening socket and wait for in-flight handlers.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(adaptor) = self.adaptor.lock().as_mut() {
            adaptor.shutdown();
        }
        while self.in_flight.load(Ordering::Acquire) > 0 {
            if strand_rt::stack::in_task_context() {
                strand_rt::yield_now();
            } else {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        }
    }
}

impl<H: ConnectionHandler> std::fmt::Debug for Server<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.socket_config)
            .field("running", &self.is_running())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    use crate::tcp::TcpSock;

    #[test]
    fn test_bind_address_rendering() {
        let tcp = SocketConfig::Tcp {
            bind_addr: "127.0.0.1".into(),
            port: 8080,
        };
        assert_eq!(tcp.bind_address(), "127.0.0.1:8080");
        let unix = SocketConfig::Unix {
            path: "/tmp/test.sock".into(),
        };
        assert_eq!(unix.bind_address(), "/tmp/test.sock");
    }

    #[test]
    fn test_tcp_echo_server() {
        strand_rt::init(2);

        let handled = Arc::new(AtomicU64::new(0));
        let port = free_port();
        let server = Server::new(
            SocketConfig::Tcp {
                bind_addr: "127.0.0.1".into(),
                port,
            },
            ServerConfig::default(),
            {
                let handled = Arc::clone(&handled);
                move |mut sock: Box<dyn Socket>| {
                    let mut buf = [0u8; 64];
                    if let Ok(n) = sock.receive(&mut buf, Deadline::after_ms(2000)) {
                        let _ = sock.send(&buf[..n], Deadline::after_ms(2000));
                        let _ = sock.flush(Deadline::after_ms(2000));
                    }
                    handled.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        let s2 = Arc::clone(&server);
        strand_rt::spawn(move || {
            let _ = s2.run();
        });

        // Wait for the listener to come up.
        for _ in 0..100 {
            if server.is_running() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        let client = strand_rt::spawn(move || {
            let mut sock = TcpSock::new();
            let addr = format!("127.0.0.1:{}", port).parse().unwrap();
            assert!(sock.connect(addr, Deadline::after_ms(2000)));
            sock.send(b"ping", Deadline::after_ms(2000)).unwrap();
            sock.flush(Deadline::after_ms(2000)).unwrap();
            let mut buf = [0u8; 4];
            let n = sock.receive(&mut buf, Deadline::after_ms(2000)).unwrap();
            assert_eq!(&buf[..n], b"ping");
            sock.close();
        });
        client.join();

        server.shutdown();
        assert!(handled.load(Ordering::SeqCst) >= 1);
    }

    /// Bind an ephemeral listener just to learn a free port.
    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }
}
