// File: src/concurrency/thread_pool.rs
//
// A work-stealing thread pool. Grounded directly on
// `original_source/src/backend/concurrency/thread_pool.cpp`: one deque per
// worker, own work taken FIFO from the front, stolen work taken LIFO from
// the back of a round-robin-selected victim via a non-blocking `try_lock`,
// and a global scheduler queue as the last resort before a bounded condvar
// wait.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::scheduler::{Scheduler, Task};

const STEAL_WAIT: Duration = Duration::from_millis(10);

struct WorkerQueue {
    tasks: Mutex<VecDeque<Task>>,
    condvar: Condvar,
}

impl WorkerQueue {
    fn new() -> Self {
        WorkerQueue { tasks: Mutex::new(VecDeque::new()), condvar: Condvar::new() }
    }
}

/// A work-stealing pool of OS threads sized at construction. Workers run
/// until `stop` is called or the pool is dropped.
pub struct ThreadPool {
    scheduler: Arc<Scheduler>,
    queues: Vec<Arc<WorkerQueue>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_requested: Arc<AtomicBool>,
    active_workers: Arc<AtomicUsize>,
    running: AtomicBool,
    num_threads: usize,
}

impl ThreadPool {
    /// `num_threads == 0` auto-detects via `std::thread::available_parallelism`,
    /// falling back to 2 the way the original falls back when
    /// `hardware_concurrency()` reports zero.
    pub fn new(num_threads: usize, scheduler: Arc<Scheduler>) -> Self {
        let num_threads = if num_threads == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(2)
        } else {
            num_threads
        };
        let queues = (0..num_threads).map(|_| Arc::new(WorkerQueue::new())).collect();
        ThreadPool {
            scheduler,
            queues,
            workers: Mutex::new(Vec::new()),
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            active_workers: Arc::new(AtomicUsize::new(0)),
            running: AtomicBool::new(false),
            num_threads,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.num_threads
    }

    pub fn active_worker_count(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    /// Spawns `num_threads` worker threads. A no-op if the pool is already
    /// running — calling `start` a second time without an intervening `stop`
    /// must not orphan the first batch of workers against the same queues.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_requested.store(false, Ordering::SeqCst);
        let mut workers = self.workers.lock().unwrap();
        workers.clear();
        for worker_id in 0..self.num_threads {
            let queues = self.queues.clone();
            let scheduler = Arc::clone(&self.scheduler);
            let shutdown_requested = Arc::clone(&self.shutdown_requested);
            let active_workers = Arc::clone(&self.active_workers);
            workers.push(thread::spawn(move || {
                worker_loop(worker_id, queues, scheduler, shutdown_requested, active_workers)
            }));
        }
    }

    /// Requests shutdown and wakes every worker; blocks the calling thread
    /// while joining. Callers that need the 5s-then-detach behavior (spec
    /// §4.6) use `stop_with_timeout` on `ConcurrencyRuntime` instead, which
    /// races this against a deadline on a helper thread.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown_requested.store(true, Ordering::SeqCst);
        self.scheduler.shutdown();
        for queue in &self.queues {
            queue.condvar.notify_all();
        }
        let mut workers = self.workers.lock().unwrap();
        for worker in workers.drain(..) {
            let _ = worker.join();
        }
    }

    /// Stops and restarts the pool with a new worker count (spec §10.3,
    /// grounded on `ThreadPool::setWorkerCount` in the original: a resize is
    /// a full stop/reconfigure/start, not a live add-or-remove).
    pub fn set_worker_count(&mut self, count: usize) {
        if count == self.num_threads {
            return;
        }
        self.stop();
        self.num_threads = count;
        self.queues = (0..count).map(|_| Arc::new(WorkerQueue::new())).collect();
        self.start();
    }

    pub fn submit_to_worker(&self, worker_id: usize, task: Task) {
        let worker_id = worker_id % self.num_threads;
        let queue = &self.queues[worker_id];
        queue.tasks.lock().unwrap().push_back(task);
        queue.condvar.notify_one();
    }

    /// Round-robin submission across workers, used when the caller has no
    /// locality preference (e.g. the block executor spreading iterations).
    pub fn submit(&self, task: Task) {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        let worker_id = NEXT.fetch_add(1, Ordering::Relaxed) % self.num_threads;
        self.submit_to_worker(worker_id, task);
    }

    pub fn worker_queue_len(&self, worker_id: usize) -> usize {
        if worker_id >= self.num_threads {
            return 0;
        }
        self.queues[worker_id].tasks.lock().unwrap().len()
    }

    pub fn total_queued_tasks(&self) -> usize {
        (0..self.num_threads).map(|id| self.worker_queue_len(id)).sum()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn try_get_local_task(queue: &WorkerQueue) -> Option<Task> {
    queue.tasks.lock().unwrap().pop_front()
}

/// Round-robin steal attempt starting one past `thief_id`, taking from the
/// back of a victim's queue (LIFO, for cache locality of the victim's own
/// remaining work) via a non-blocking lock so a busy victim never stalls
/// the thief.
fn try_steal_from_others(thief_id: usize, queues: &[Arc<WorkerQueue>]) -> Option<Task> {
    let n = queues.len();
    for offset in 1..n {
        let victim_id = (thief_id + offset) % n;
        if let Ok(mut victim) = queues[victim_id].tasks.try_lock() {
            if let Some(task) = victim.pop_back() {
                return Some(task);
            }
        }
    }
    None
}

fn worker_loop(
    worker_id: usize,
    queues: Vec<Arc<WorkerQueue>>,
    scheduler: Arc<Scheduler>,
    shutdown_requested: Arc<AtomicBool>,
    active_workers: Arc<AtomicUsize>,
) {
    active_workers.fetch_add(1, Ordering::SeqCst);
    let own_queue = &queues[worker_id];

    while !shutdown_requested.load(Ordering::SeqCst) {
        let task = try_get_local_task(own_queue)
            .or_else(|| try_steal_from_others(worker_id, &queues))
            .or_else(|| scheduler.get_next_task());

        match task {
            Some(task) => task(),
            None => {
                let guard = own_queue.tasks.lock().unwrap();
                let _ = own_queue
                    .condvar
                    .wait_timeout_while(guard, STEAL_WAIT, |tasks| {
                        tasks.is_empty() && !shutdown_requested.load(Ordering::SeqCst)
                    })
                    .unwrap();
            }
        }
    }

    active_workers.fetch_sub(1, Ordering::SeqCst);
}
