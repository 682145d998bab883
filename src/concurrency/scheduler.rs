// File: src/concurrency/scheduler.rs
//
// The global fallback queue a thread-pool worker consults once its own
// local queue and work-stealing have both come up empty. Grounded on
// `original_source/backend/concurrency/scheduler.hh` — a thin wrapper over
// one `Channel<Task>`, nothing more.

use std::sync::Arc;

use super::channel::Channel;

/// A unit of work submitted to the pool: a closure with no arguments and no
/// return value (results travel back over a result channel instead, the way
/// the original's `Task = std::function<void()>` relies on capture).
pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub struct Scheduler {
    queue: Arc<Channel<Task>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler { queue: Arc::new(Channel::new()) }
    }

    pub fn submit(&self, task: Task) {
        // The scheduler queue never closes except at shutdown, so a failed
        // send here would only happen after shutdown has already begun;
        // dropping the task in that case matches the original's behavior of
        // becoming a no-op once the channel is closed.
        let _ = self.queue.send(task);
    }

    /// Non-blocking: a worker falls back to this only after failing to find
    /// local or stealable work, so it must not itself block.
    pub fn get_next_task(&self) -> Option<Task> {
        self.queue.try_receive()
    }

    pub fn shutdown(&self) {
        self.queue.close();
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn submitted_task_is_returned_by_get_next_task() {
        let scheduler = Scheduler::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        scheduler.submit(Box::new(move || ran2.store(true, Ordering::SeqCst)));
        let task = scheduler.get_next_task().expect("task should be queued");
        task();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn empty_scheduler_returns_none_without_blocking() {
        let scheduler = Scheduler::new();
        assert!(scheduler.get_next_task().is_none());
    }

    #[test]
    fn shutdown_closes_the_underlying_queue() {
        let scheduler = Scheduler::new();
        scheduler.shutdown();
        assert!(scheduler.queue.is_closed());
    }
}
