//! Shared process table.
//!
//! One anonymous `MAP_SHARED` mapping created by the supervisor before
//! forking, inherited by every worker. Layout is a versioned header, a fixed
//! pool of named ticket locks for application use, then `W + 1` worker
//! slots (slot 0 is the supervisor).
//!
//! Counters are only touched with atomics; per-slot state transitions go
//! through the slot's own ticket lock or single-writer fields (a slot's
//! owner process sets its pid/active, the supervisor clears active on reap).

use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, AtomicU8, Ordering};

use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};

use crate::lock::TicketLock;
use crate::IpcError;

/// Number of named ticket locks available to applications.
pub const SHM_LOCK_COUNT: usize = 64;

/// Words in a worker's 256-bit message-interest bitmap.
const INTEREST_WORDS: usize = 4;

/// Identifies the mapping as a strand process table.
const TABLE_MAGIC: u32 = 0x5354_4E44; // "STND"
/// Bumped whenever the shared layout changes.
const TABLE_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

#[repr(C)]
struct TableHeader {
    magic: AtomicU32,
    version: AtomicU32,
    n_workers: AtomicU32,
    n_active: AtomicU32,
}

/// One worker's slot in the shared table.
#[repr(C)]
pub struct WorkerSlot {
    /// Serializes writers to this worker's pipe.
    pub lock: TicketLock,
    pid: AtomicI32,
    read_fd: AtomicI32,
    write_fd: AtomicI32,
    active: AtomicU8,
    cpu: AtomicU8,
    id: AtomicU8,
    /// 256-bit message-interest bitmap, one bit per message id.
    mask: [AtomicU64; INTEREST_WORDS],
}

impl WorkerSlot {
    pub fn id(&self) -> u8 {
        self.id.load(Ordering::Relaxed)
    }

    pub fn cpu(&self) -> u8 {
        self.cpu.load(Ordering::Relaxed)
    }

    pub fn set_cpu(&self, cpu: u8) {
        self.cpu.store(cpu, Ordering::Relaxed);
    }

    pub fn pid(&self) -> i32 {
        self.pid.load(Ordering::Acquire)
    }

    pub fn set_pid(&self, pid: i32) {
        self.pid.store(pid, Ordering::Release);
    }

    pub fn read_fd(&self) -> i32 {
        self.read_fd.load(Ordering::Acquire)
    }

    pub fn write_fd(&self) -> i32 {
        self.write_fd.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) != 0
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(u8::from(active), Ordering::Release);
    }

    /// Atomically set or clear interest in message `id`. Wait-free: one
    /// atomic OR/AND on a 64-bit word.
    pub fn set_interest(&self, id: u8, enabled: bool) {
        let word = usize::from(id) / 64;
        let bit = 1u64 << (usize::from(id) % 64);
        if enabled {
            self.mask[word].fetch_or(bit, Ordering::AcqRel);
        } else {
            self.mask[word].fetch_and(!bit, Ordering::AcqRel);
        }
    }

    /// True when this worker registered a handler for message `id`.
    pub fn has_interest(&self, id: u8) -> bool {
        let word = usize::from(id) / 64;
        let bit = 1u64 << (usize::from(id) % 64);
        self.mask[word].load(Ordering::Acquire) & bit == bit
    }
}

// ---------------------------------------------------------------------------
// SharedTable
// ---------------------------------------------------------------------------

/// Owner handle over the shared mapping.
///
/// Created once by the supervisor; after `fork`, each process holds the same
/// mapping at the same address and accesses it through its inherited copy of
/// this handle.
pub struct SharedTable {
    base: NonNull<u8>,
    len: usize,
}

// The mapping is shared memory by construction; all access is atomic.
unsafe impl Send for SharedTable {}
unsafe impl Sync for SharedTable {}

impl SharedTable {
    fn layout_len(n_workers: u8) -> usize {
        std::mem::size_of::<TableHeader>()
            + SHM_LOCK_COUNT * std::mem::size_of::<TicketLock>()
            + (usize::from(n_workers) + 1) * std::mem::size_of::<WorkerSlot>()
    }

    /// Map and initialize a table for `n_workers` workers plus supervisor.
    pub fn create(n_workers: u8) -> Result<Self, IpcError> {
        let len = Self::layout_len(n_workers);
        let base = unsafe {
            mmap_anonymous(
                None,
                NonZeroUsize::new(len).expect("table layout is never empty"),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED | MapFlags::MAP_ANONYMOUS,
            )
        }
        .map_err(IpcError::System)?;
        let base = base.cast::<u8>();

        // The mapping is zero-filled; atomics of zero are valid initial
        // state for every field, so only non-zero fields need storing.
        let table = SharedTable { base, len };
        let header = table.header();
        header.magic.store(TABLE_MAGIC, Ordering::Relaxed);
        header.version.store(TABLE_VERSION, Ordering::Relaxed);
        header.n_workers.store(u32::from(n_workers), Ordering::Relaxed);
        header.n_active.store(0, Ordering::Relaxed);

        for i in 0..SHM_LOCK_COUNT {
            table.shared_lock(i as u8).reset(256 + i as u32);
        }
        for w in 0..=n_workers {
            let slot = table.worker(w);
            slot.lock.reset(u32::from(w));
            slot.id.store(w, Ordering::Relaxed);
            slot.read_fd.store(-1, Ordering::Relaxed);
            slot.write_fd.store(-1, Ordering::Relaxed);
        }

        Ok(table)
    }

    fn header(&self) -> &TableHeader {
        // Safety: the mapping starts with a TableHeader and outlives self.
        unsafe { &*(self.base.as_ptr() as *const TableHeader) }
    }

    /// Validate magic and version; a mismatch means a stale or foreign
    /// mapping.
    pub fn verify(&self) -> Result<(), IpcError> {
        let header = self.header();
        if header.magic.load(Ordering::Relaxed) != TABLE_MAGIC
            || header.version.load(Ordering::Relaxed) != TABLE_VERSION
        {
            return Err(IpcError::BadTable);
        }
        Ok(())
    }

    /// Number of worker processes (excluding the supervisor).
    pub fn n_workers(&self) -> u8 {
        self.header().n_workers.load(Ordering::Relaxed) as u8
    }

    /// Number of workers currently running their work loop.
    pub fn n_active(&self) -> u32 {
        self.header().n_active.load(Ordering::Acquire)
    }

    pub fn worker_started(&self) {
        self.header().n_active.fetch_add(1, Ordering::AcqRel);
    }

    pub fn worker_stopped(&self) {
        self.header().n_active.fetch_sub(1, Ordering::AcqRel);
    }

    /// One of the named application ticket locks.
    ///
    /// # Panics
    ///
    /// Panics when `idx >= SHM_LOCK_COUNT`.
    pub fn shared_lock(&self, idx: u8) -> &TicketLock {
        assert!(
            usize::from(idx) < SHM_LOCK_COUNT,
            "shared lock index out of range"
        );
        let offset = std::mem::size_of::<TableHeader>()
            + usize::from(idx) * std::mem::size_of::<TicketLock>();
        // Safety: offset is inside the mapping by layout_len.
        unsafe { &*(self.base.as_ptr().add(offset) as *const TicketLock) }
    }

    /// Worker slot `w` (0 = supervisor).
    ///
    /// # Panics
    ///
    /// Panics when `w > n_workers`.
    pub fn worker(&self, w: u8) -> &WorkerSlot {
        assert!(w <= self.n_workers(), "worker index out of range");
        let offset = std::mem::size_of::<TableHeader>()
            + SHM_LOCK_COUNT * std::mem::size_of::<TicketLock>()
            + usize::from(w) * std::mem::size_of::<WorkerSlot>();
        // Safety: offset is inside the mapping by layout_len.
        unsafe { &*(self.base.as_ptr().add(offset) as *const WorkerSlot) }
    }

    /// Store the pipe fd pair for worker `w` (called before forking).
    pub fn set_worker_pipe(&self, w: u8, read_fd: i32, write_fd: i32) {
        let slot = self.worker(w);
        slot.read_fd.store(read_fd, Ordering::Release);
        slot.write_fd.store(write_fd, Ordering::Release);
    }
}

impl Drop for SharedTable {
    fn drop(&mut self) {
        // Detach this process's view; the kernel frees the memory on last
        // detach.
        let _ = unsafe { munmap(self.base.cast(), self.len) };
    }
}

impl std::fmt::Debug for SharedTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedTable")
            .field("n_workers", &self.n_workers())
            .field("n_active", &self.n_active())
            .field("len", &self.len)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use strand_rt::Deadline;

    #[test]
    fn test_create_and_verify() {
        let table = SharedTable::create(4).unwrap();
        table.verify().unwrap();
        assert_eq!(table.n_workers(), 4);
        assert_eq!(table.n_active(), 0);
    }

    #[test]
    fn test_worker_slots_initialized() {
        let table = SharedTable::create(3).unwrap();
        for w in 0..=3 {
            let slot = table.worker(w);
            assert_eq!(slot.id(), w);
            assert_eq!(slot.read_fd(), -1);
            assert_eq!(slot.write_fd(), -1);
            assert!(!slot.is_active());
            assert!(!slot.has_interest(64));
        }
    }

    #[test]
    fn test_interest_bitmap() {
        let table = SharedTable::create(1).unwrap();
        let slot = table.worker(1);

        for id in [0u8, 63, 64, 127, 128, 255] {
            assert!(!slot.has_interest(id));
            slot.set_interest(id, true);
            assert!(slot.has_interest(id));
        }
        slot.set_interest(64, false);
        assert!(!slot.has_interest(64));
        // Neighbors unaffected.
        assert!(slot.has_interest(63));
        assert!(slot.has_interest(127));
    }

    #[test]
    fn test_shared_locks_armed() {
        let table = SharedTable::create(1).unwrap();
        for i in 0..SHM_LOCK_COUNT as u8 {
            let lock = table.shared_lock(i);
            assert_eq!(lock.id(), 256 + u32::from(i));
            assert!(lock.acquire(Deadline::after_ms(100)));
            lock.release();
        }
    }

    #[test]
    fn test_active_counters() {
        let table = SharedTable::create(2).unwrap();
        table.worker_started();
        table.worker_started();
        assert_eq!(table.n_active(), 2);
        table.worker_stopped();
        assert_eq!(table.n_active(), 1);
    }

    #[test]
    #[should_panic(expected = "worker index out of range")]
    fn test_worker_index_checked() {
        let table = SharedTable::create(1).unwrap();
        let _ = table.worker(2);
    }
}
