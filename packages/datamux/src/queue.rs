// Queue and Flag primitives
//
// Queues are bounded channels shared by reference: cloning a queue, or
// assigning one placeholder to another queue, makes both handles refer to
// the same channel. Flags are single-set booleans that threads can wait on.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::message::Message;

pub const DEFAULT_CAPACITY: usize = 1024;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is full")]
    Full,
    #[error("queue timed out")]
    Timeout,
    #[error("queue is not assigned to a channel")]
    Unassigned,
}

struct Channel<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

/// Bounded multi-producer channel handle
pub struct Queue<T = Message> {
    inner: Option<Arc<Channel<T>>>,
    timeout: Option<Duration>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            timeout: self.timeout,
        }
    }
}

impl<T> std::fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("assigned", &self.inner.is_some())
            .field("len", &self.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        Self::bounded(DEFAULT_CAPACITY)
    }

    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = channel::bounded(capacity.max(1));
        Self {
            inner: Some(Arc::new(Channel { tx, rx })),
            timeout: Some(DEFAULT_TIMEOUT),
        }
    }

    /// Placeholder to be assigned before use.
    pub fn empty() -> Self {
        Self {
            inner: None,
            timeout: Some(DEFAULT_TIMEOUT),
        }
    }

    /// Default timeout of [`Queue::get`]; `None` blocks indefinitely.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Point this handle at `other`'s channel.
    pub fn assign(&mut self, other: &Queue<T>) {
        self.inner = other.inner.clone();
    }

    pub fn is_assigned(&self) -> bool {
        self.inner.is_some()
    }

    /// Pointer equality of the underlying channels.
    pub fn same_channel(&self, other: &Queue<T>) -> bool {
        match (&self.inner, &other.inner) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.as_ref().map(|c| c.rx.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn channel(&self) -> Result<&Channel<T>, QueueError> {
        self.inner.as_deref().ok_or(QueueError::Unassigned)
    }

    /// Blocking put; waits while the queue is full.
    pub fn put(&self, item: T) -> Result<(), QueueError> {
        // the channel owns a receiver, so it never disconnects
        self.channel()?
            .tx
            .send(item)
            .map_err(|_| QueueError::Unassigned)
    }

    /// Put, giving the item back if the queue stays full for `timeout`.
    pub fn put_timeout(&self, item: T, timeout: Duration) -> Result<(), (T, QueueError)> {
        let channel = match self.channel() {
            Ok(c) => c,
            Err(e) => return Err((item, e)),
        };
        channel.tx.send_timeout(item, timeout).map_err(|e| match e {
            SendTimeoutError::Timeout(item) => (item, QueueError::Timeout),
            SendTimeoutError::Disconnected(item) => (item, QueueError::Unassigned),
        })
    }

    pub fn put_nowait(&self, item: T) -> Result<(), QueueError> {
        self.channel()?.tx.try_send(item).map_err(|e| match e {
            TrySendError::Full(_) => QueueError::Full,
            TrySendError::Disconnected(_) => QueueError::Unassigned,
        })
    }

    /// Get with the queue's default timeout; `None` on timeout.
    pub fn get(&self) -> Option<T> {
        match self.timeout {
            Some(timeout) => self.get_timeout(timeout),
            None => self.channel().ok()?.rx.recv().ok(),
        }
    }

    pub fn get_timeout(&self, timeout: Duration) -> Option<T> {
        let channel = self.channel().ok()?;
        match channel.rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_get(&self) -> Option<T> {
        self.channel().ok()?.rx.try_recv().ok()
    }
}

struct FlagState {
    set: Mutex<bool>,
    cond: Condvar,
}

/// Single-set shared boolean used for cancellation
#[derive(Clone)]
pub struct Flag {
    state: Arc<FlagState>,
}

/// Non-owning reference to a flag
#[derive(Clone)]
pub struct WeakFlag(Weak<FlagState>);

impl WeakFlag {
    pub fn upgrade(&self) -> Option<Flag> {
        self.0.upgrade().map(|state| Flag { state })
    }
}

impl Default for Flag {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Flag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Flag").field(&self.is_set()).finish()
    }
}

impl Flag {
    pub fn new() -> Self {
        Self {
            state: Arc::new(FlagState {
                set: Mutex::new(false),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn set(&self) {
        let mut set = self.state.set.lock();
        *set = true;
        self.state.cond.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.state.set.lock()
    }

    /// Wait until the flag is set or `timeout` elapses; returns the flag state.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut set = self.state.set.lock();
        match timeout {
            None => {
                while !*set {
                    self.state.cond.wait(&mut set);
                }
                true
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !*set {
                    if self.state.cond.wait_until(&mut set, deadline).timed_out() {
                        break;
                    }
                }
                *set
            }
        }
    }

    pub fn downgrade(&self) -> WeakFlag {
        WeakFlag(Arc::downgrade(&self.state))
    }

    pub fn same_flag(&self, other: &Flag) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_get_times_out() {
        let q: Queue<u32> = Queue::new();
        assert_eq!(q.get_timeout(Duration::from_millis(5)), None);
        q.put(7).unwrap();
        assert_eq!(q.get(), Some(7));
    }

    #[test]
    fn test_put_nowait_full() {
        let q: Queue<u32> = Queue::bounded(1);
        q.put_nowait(1).unwrap();
        assert_eq!(q.put_nowait(2), Err(QueueError::Full));
        let (item, err) = q.put_timeout(3, Duration::from_millis(5)).unwrap_err();
        assert_eq!((item, err), (3, QueueError::Timeout));
    }

    #[test]
    fn test_empty_then_assign_shares_channel() {
        let upstream: Queue<u32> = Queue::new();
        let mut downstream: Queue<u32> = Queue::empty();
        assert!(!downstream.is_assigned());
        assert_eq!(downstream.put_nowait(1), Err(QueueError::Unassigned));
        assert_eq!(downstream.get(), None);

        downstream.assign(&upstream);
        assert!(downstream.same_channel(&upstream));
        upstream.put(5).unwrap();
        assert_eq!(downstream.get(), Some(5));
    }

    #[test]
    fn test_flag_wait() {
        let flag = Flag::new();
        assert!(!flag.wait(Some(Duration::from_millis(5))));

        let remote = flag.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.set();
        });
        assert!(flag.wait(Some(Duration::from_secs(5))));
        handle.join().unwrap();
        assert!(flag.is_set());
    }

    #[test]
    fn test_weak_flag() {
        let flag = Flag::new();
        let weak = flag.downgrade();
        assert!(weak.upgrade().unwrap().same_flag(&flag));
        drop(flag);
        assert!(weak.upgrade().is_none());
    }
}
