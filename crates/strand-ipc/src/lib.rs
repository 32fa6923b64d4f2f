//! Strand IPC substrate.
//!
//! A fleet of forked worker processes sharing one mapped table, exchanging
//! length-prefixed messages over pipes with typed handlers, broadcast, and
//! request/gather RPC, serialized by shared-memory ticket locks.
//!
//! ## Modules
//!
//! - [`shm`]: the shared process table (versioned header, named locks,
//!   worker slots with interest bitmaps)
//! - [`lock`]: cross-process FIFO ticket locks
//! - [`frame`]: the 10-byte pipe frame header
//! - [`fleet`]: fork lifecycle, signal funneling, send / broadcast /
//!   get / gather, handler registry
//!
//! ## Message id space
//!
//! Ids 0–63 are reserved for the system; user messages start at
//! [`MSG_USER_BASE`].

pub mod fleet;
pub mod frame;
pub mod lock;
pub mod shm;

pub use fleet::{
    broadcast, gather, get, init, n_active, n_workers, register_cleaner, register_get_handler,
    register_handler, send, send_get_response, spawn, spid, spin_lock, spin_unlock,
    unregister_handler, GetHandler, GetToken, MessageHandler, NWORKERS_SYSTEM,
};
pub use frame::{FrameHeader, FRAME_HEADER_LEN};
pub use lock::{TicketGuard, TicketLock};
pub use shm::{SharedTable, WorkerSlot, SHM_LOCK_COUNT};

// ---------------------------------------------------------------------------
// Reserved message ids
// ---------------------------------------------------------------------------

/// Liveness probe.
pub const MSG_SYS_PING: u8 = 0;
/// Response frame for `get`/`gather` requests.
pub const MSG_GET_RESPONSE: u8 = 1;
/// Statistics request.
pub const MSG_GET_STATS: u8 = 2;
/// Memory info request.
pub const MSG_GET_MEMORY_INFO: u8 = 3;
/// Enables deferred initializers.
pub const MSG_INITIALIZER_ENABLE: u8 = 4;
/// Enables a route fleet-wide.
pub const MSG_ENABLE_ROUTE: u8 = 5;
/// Disables a route fleet-wide.
pub const MSG_DISABLE_ROUTE: u8 = 6;
/// First id available to applications.
pub const MSG_USER_BASE: u8 = 64;

// ---------------------------------------------------------------------------
// Well-known shared lock indices
// ---------------------------------------------------------------------------

pub const SHM_ACCEPT_LOCK: u8 = 0;
pub const SHM_GET_LOCK: u8 = 1;
pub const SHM_GATHER_LOCK: u8 = 2;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure modes of the IPC substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// `init` has not been called in this process group.
    NotInitialized,
    /// `init` was called twice.
    AlreadyInitialized,
    /// `spawn` was called after the strand runtime started; worker threads
    /// do not survive a fork.
    RuntimeActive,
    /// Destination is self, the supervisor where forbidden, or out of range.
    InvalidDestination,
    /// The destination registered no handler for the message id.
    NotSupported,
    /// A deadline expired.
    Timeout,
    /// The shared table failed magic/version validation.
    BadTable,
    /// The peer end of a pipe is gone.
    Closed,
    /// An underlying system call failed.
    System(nix::errno::Errno),
}

impl std::fmt::Display for IpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpcError::NotInitialized => write!(f, "ipc not initialized"),
            IpcError::AlreadyInitialized => write!(f, "ipc supports only one fleet per process"),
            IpcError::RuntimeActive => {
                write!(f, "ipc::spawn must run before the runtime starts")
            }
            IpcError::InvalidDestination => write!(f, "invalid message destination"),
            IpcError::NotSupported => write!(f, "destination does not handle this message"),
            IpcError::Timeout => write!(f, "ipc operation timed out"),
            IpcError::BadTable => write!(f, "shared table magic/version mismatch"),
            IpcError::Closed => write!(f, "peer pipe closed"),
            IpcError::System(errno) => write!(f, "system error: {}", errno),
        }
    }
}

impl std::error::Error for IpcError {}
