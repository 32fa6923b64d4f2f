//! Buffered MPSC/SPMC channel with a terminator sentinel.
//!
//! A channel carries up to `cap` buffered values. `send` suspends while the
//! buffer is full; `receive` suspends while it is empty, optionally bounded
//! by a [`Deadline`]. Publishing the terminator value (or calling
//! [`Channel::terminate`]) signals end-of-stream: every reader drains the
//! remaining buffered values and then observes [`ChannelError::Closed`],
//! once and forever.
//!
//! Handles are cheap clones of one shared queue, so any number of senders
//! and receivers may share a channel; readers observe values in the order
//! they were successfully published.

use parking_lot::Mutex;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::deadline::Deadline;
use crate::scheduler::{current_or_panic, Scheduler};
use crate::task::{WaitToken, WakeReason};

/// Failure modes of channel operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    /// The terminator was published and the buffer is drained.
    Closed,
    /// The receive deadline expired.
    Timeout,
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::Closed => write!(f, "channel closed"),
            ChannelError::Timeout => write!(f, "channel receive timed out"),
        }
    }
}

impl std::error::Error for ChannelError {}

struct ChannelState<T> {
    queue: VecDeque<T>,
    closed: bool,
    recv_waiters: VecDeque<WaitToken>,
    send_waiters: VecDeque<WaitToken>,
}

struct ChannelInner<T> {
    cap: usize,
    terminator: Option<T>,
    state: Mutex<ChannelState<T>>,
}

/// A cloneable handle to a buffered channel of `T`.
pub struct Channel<T> {
    inner: Arc<ChannelInner<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Channel {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send> Channel<T> {
    /// Create a channel buffering up to `cap` values. A capacity of 0 is
    /// treated as 1: a send always has one slot to hand its value through.
    pub fn new(cap: usize) -> Self {
        Self::build(cap, None)
    }

    fn build(cap: usize, terminator: Option<T>) -> Self {
        Channel {
            inner: Arc::new(ChannelInner {
                cap: cap.max(1),
                terminator,
                state: Mutex::new(ChannelState {
                    queue: VecDeque::new(),
                    closed: false,
                    recv_waiters: VecDeque::new(),
                    send_waiters: VecDeque::new(),
                }),
            }),
        }
    }

    /// Number of buffered values.
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once the terminator has been published.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Publish end-of-stream. Idempotent; wakes every parked sender and
    /// receiver.
    pub fn terminate(&self) {
        let sched = current_or_panic();
        let mut st = self.inner.state.lock();
        if st.closed {
            return;
        }
        st.closed = true;
        let mut wake: Vec<WaitToken> = st.recv_waiters.drain(..).collect();
        wake.extend(st.send_waiters.drain(..));
        drop(st);
        for token in wake {
            sched.wake(token, WakeReason::Notified);
        }
    }

    /// Send a value, suspending while the buffer is full.
    ///
    /// Returns `Err(Closed)` once the terminator has been published.
    ///
    /// # Panics
    ///
    /// Panics when it must suspend outside task context.
    pub fn send(&self, value: T) -> Result<(), ChannelError> {
        let sched = current_or_panic();
        let mut slot = Some(value);

        struct NoPark(Result<(), ChannelError>);

        loop {
            let parked = sched.park_current(|token| {
                let mut st = self.inner.state.lock();
                if st.closed {
                    return Err(NoPark(Err(ChannelError::Closed)));
                }
                if st.queue.len() < self.inner.cap {
                    st.queue.push_back(slot.take().expect("send value already consumed"));
                    wake_one(&sched, &mut st.recv_waiters);
                    return Err(NoPark(Ok(())));
                }
                st.send_waiters.push_back(token);
                Ok(())
            });

            match parked {
                Err(NoPark(result)) => return result,
                // Woken: either space was made or the channel closed; retry.
                Ok(_reason) => continue,
            }
        }
    }

    /// Receive one value, suspending while the buffer is empty.
    ///
    /// Buffered values drain before `Closed` is reported. The deadline, when
    /// finite, bounds the suspension.
    pub fn receive(&self, deadline: Deadline) -> Result<T, ChannelError> {
        let sched = current_or_panic();

        enum NoPark<T> {
            Got(T),
            Fail(ChannelError),
        }

        loop {
            let parked = sched.park_current(|token| {
                let mut st = self.inner.state.lock();
                if let Some(v) = st.queue.pop_front() {
                    wake_one(&sched, &mut st.send_waiters);
                    return Err(NoPark::Got(v));
                }
                if st.closed {
                    return Err(NoPark::Fail(ChannelError::Closed));
                }
                if deadline.expired() {
                    return Err(NoPark::Fail(ChannelError::Timeout));
                }
                st.recv_waiters.push_back(token);
                drop(st);
                if let Deadline::At(at) = deadline {
                    sched.reactor().add_timer(at, token);
                }
                Ok(())
            });

            match parked {
                Err(NoPark::Got(v)) => return Ok(v),
                Err(NoPark::Fail(e)) => return Err(e),
                Ok(WakeReason::Timeout) => return Err(ChannelError::Timeout),
                // Notified: value available or channel closed; loop re-checks.
                Ok(_) => continue,
            }
        }
    }

    /// Pop a buffered value without suspending.
    pub fn try_receive(&self) -> Option<T> {
        let mut st = self.inner.state.lock();
        let v = st.queue.pop_front();
        if v.is_some() && !st.send_waiters.is_empty() {
            let sched = current_or_panic();
            wake_one(&sched, &mut st.send_waiters);
        }
        v
    }

    /// Receive up to `n` values before `deadline`.
    ///
    /// Stops early on end-of-stream or timeout; the caller inspects the
    /// returned length to distinguish a full batch from a short one.
    pub fn drain(&self, n: usize, deadline: Deadline) -> Vec<T> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            match self.receive(deadline) {
                Ok(v) => out.push(v),
                Err(_) => break,
            }
        }
        out
    }
}

impl<T: Send + Clone + PartialEq> Channel<T> {
    /// Create a channel whose end-of-stream is signalled by sending `term`.
    pub fn with_terminator(cap: usize, term: T) -> Self {
        Self::build(cap, Some(term))
    }
}

impl<T: Send + PartialEq> Channel<T> {
    /// Send that recognizes the terminator value and closes the stream
    /// instead of delivering it.
    pub fn publish(&self, value: T) -> Result<(), ChannelError> {
        if self
            .inner
            .terminator
            .as_ref()
            .is_some_and(|term| *term == value)
        {
            self.terminate();
            return Ok(());
        }
        self.send(value)
    }
}

/// Wake the first waiter whose park is still live.
fn wake_one(sched: &Arc<Scheduler>, waiters: &mut VecDeque<WaitToken>) {
    while let Some(token) = waiters.pop_front() {
        if sched.wake(token, WakeReason::Notified) {
            return;
        }
        // Stale token (timed out receiver); try the next one.
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("Channel")
            .field("cap", &self.inner.cap)
            .field("len", &st.queue.len())
            .field("closed", &st.closed)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    #[test]
    fn test_send_receive_order() {
        crate::init(2);
        let ch = Channel::new(8);
        let tx = ch.clone();
        crate::spawn(move || {
            for i in 0..5 {
                tx.send(i).unwrap();
            }
        })
        .join();

        let got = std::sync::Arc::new(Mutex::new(Vec::new()));
        let g2 = std::sync::Arc::clone(&got);
        crate::spawn(move || {
            for _ in 0..5 {
                g2.lock().push(ch.receive(Deadline::Inf).unwrap());
            }
        })
        .join();
        assert_eq!(*got.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_receive_timeout() {
        crate::init(2);
        let ch: Channel<u32> = Channel::new(1);
        crate::spawn(move || {
            let res = ch.receive(Deadline::after(Duration::from_millis(30)));
            assert_eq!(res, Err(ChannelError::Timeout));
        })
        .join();
    }

    #[test]
    fn test_terminator_closes_for_all_readers() {
        crate::init(2);
        let ch = Channel::with_terminator(4, -1i64);
        let received = std::sync::Arc::new(AtomicU64::new(0));

        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let ch = ch.clone();
                let received = std::sync::Arc::clone(&received);
                crate::spawn(move || loop {
                    match ch.receive(Deadline::Inf) {
                        Ok(_) => {
                            received.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(ChannelError::Closed) => break,
                        Err(e) => panic!("unexpected channel error: {}", e),
                    }
                })
            })
            .collect();

        let tx = ch.clone();
        crate::spawn(move || {
            for i in 1..=20 {
                tx.publish(i).unwrap();
            }
            tx.publish(-1).unwrap();
        })
        .join();

        for c in consumers {
            c.join();
        }
        assert_eq!(received.load(Ordering::SeqCst), 20);
        assert!(ch.is_closed());
        assert_eq!(ch.send(5), Err(ChannelError::Closed));
    }

    #[test]
    fn test_send_blocks_when_full() {
        crate::init(2);
        let ch = Channel::new(2);
        let sent = std::sync::Arc::new(AtomicU64::new(0));

        let tx = ch.clone();
        let s2 = std::sync::Arc::clone(&sent);
        let producer = crate::spawn(move || {
            for i in 0..4 {
                tx.send(i).unwrap();
                s2.fetch_add(1, Ordering::SeqCst);
            }
        });

        // Buffer holds 2; the third send parks.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(sent.load(Ordering::SeqCst), 2);

        let rx = ch.clone();
        crate::spawn(move || {
            for _ in 0..4 {
                rx.receive(Deadline::Inf).unwrap();
            }
        })
        .join();
        producer.join();
        assert_eq!(sent.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_drain_exact_and_short() {
        crate::init(2);
        let ch = Channel::new(16);
        let tx = ch.clone();
        crate::spawn(move || {
            for i in 0..3 {
                tx.send(i).unwrap();
            }
        })
        .join();

        let c2 = ch.clone();
        crate::spawn(move || {
            let exact = c2.drain(3, Deadline::after(Duration::from_millis(100)));
            assert_eq!(exact, vec![0, 1, 2]);
            // Nothing left: a short drain returns what arrived.
            let short = c2.drain(2, Deadline::after(Duration::from_millis(30)));
            assert!(short.is_empty());
        })
        .join();
    }

    #[test]
    fn test_try_receive() {
        crate::init(2);
        let ch = Channel::new(4);
        let tx = ch.clone();
        crate::spawn(move || {
            assert!(tx.try_receive().is_none());
            tx.send(7).unwrap();
            assert_eq!(tx.try_receive(), Some(7));
        })
        .join();
    }
}
