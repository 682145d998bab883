// File: src/concurrency/channel.rs
//
// An unbounded, multi-producer multi-consumer channel backed by a mutex and
// a condvar. Grounded on `original_source/backend/concurrency/channel.hh`:
// the same `send`/`receive`/`close` shape, translated from a condvar
// `wait(lock, predicate)` to the Rust equivalent, `Condvar::wait_while`.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

struct Inner<T> {
    queue: VecDeque<T>,
    closed: bool,
}

/// A FIFO queue shared by any number of senders and receivers. `send` after
/// `close` fails rather than panicking; `receive` on a closed, drained
/// channel returns `None` rather than blocking forever.
pub struct Channel<T> {
    state: Mutex<Inner<T>>,
    condvar: Condvar,
}

/// Returned by [`Channel::send`] when the channel has already been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOnClosedChannel;

impl<T> Channel<T> {
    pub fn new() -> Self {
        Channel { state: Mutex::new(Inner { queue: VecDeque::new(), closed: false }), condvar: Condvar::new() }
    }

    pub fn send(&self, value: T) -> Result<(), SendOnClosedChannel> {
        let mut inner = self.state.lock().unwrap();
        if inner.closed {
            return Err(SendOnClosedChannel);
        }
        inner.queue.push_back(value);
        self.condvar.notify_one();
        Ok(())
    }

    /// Blocks until a value is available or the channel is closed and
    /// drained. Returns `None` only in the latter case.
    pub fn receive(&self) -> Option<T> {
        let mut inner = self.state.lock().unwrap();
        loop {
            if let Some(value) = inner.queue.pop_front() {
                return Some(value);
            }
            if inner.closed {
                return None;
            }
            inner = self.condvar.wait(inner).unwrap();
        }
    }

    /// Non-blocking receive, used by the thread pool's worker loop and the
    /// scheduler's `get_next_task` so a worker never parks on an empty
    /// channel when it could instead try stealing work.
    pub fn try_receive(&self) -> Option<T> {
        self.state.lock().unwrap().queue.pop_front()
    }

    pub fn close(&self) {
        let mut inner = self.state.lock().unwrap();
        inner.closed = true;
        self.condvar.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Channel::new()
    }
}
