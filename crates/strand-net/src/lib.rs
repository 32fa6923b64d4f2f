//! Strand network toolkit.
//!
//! Deadline-driven socket abstractions and the protocol plumbing built on
//! them, all suspending through the strand runtime instead of blocking OS
//! threads.
//!
//! ## Modules
//!
//! - [`socket`]: the uniform byte-stream contract every transport obeys
//! - [`tcp`], [`unix`], [`tls`]: the concrete transports
//! - [`server`]: generic bind/listen/accept pump with handler dispatch
//! - [`http`]: streaming request parser with disk offload and form decoding
//! - [`rpc`]: length-prefixed (and best-effort) message framing
//! - [`watch`]: async inotify filesystem events

pub mod http;
pub mod rpc;
pub mod server;
pub mod socket;
pub mod tcp;
pub mod tls;
pub mod unix;
pub mod watch;

pub use http::{
    FormData, HttpConfig, HttpStatus, Method, QueryString, RequestParser, UploadedFile,
};
pub use rpc::{RpcError, RpcIo, RpcIoConfig};
pub use server::{
    create_adaptor, ConnectionHandler, Server, ServerConfig, ServerSocket, SocketConfig,
};
pub use socket::{Socket, SocketError};
pub use tcp::{TcpServerSock, TcpSock};
pub use tls::{TlsServerSock, TlsSock};
pub use unix::{UnixServerSock, UnixSock};
pub use watch::{Event, Events, WatchError, WatchMode, Watcher};
