//! Suspension-based synchronization primitives for tasks.

pub mod channel;
pub mod conditional;
pub mod event;
pub mod mutex;

pub use channel::{Channel, ChannelError};
pub use conditional::{Conditional, DoubleWaitError, SyncPoint, SyncResult};
pub use event::{AutoResetEvent, ManualResetEvent};
pub use mutex::{AsyncMutex, AsyncMutexGuard};
