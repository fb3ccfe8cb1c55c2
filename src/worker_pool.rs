//! Off-thread execution of cancellable blocking operations.
//!
//! The selectors can only park fibers on things the kernel models as
//! events. Blocking operations that have no such representation (DNS
//! lookups, `fsync` on some filesystems, third-party calls) are handed to
//! a small pool of OS threads; the calling fiber blocks cooperatively via
//! the host runtime's scheduler and is unblocked when the operation
//! retires.
//!
//! Cancellation is cooperative: if the blocked fiber is woken before the
//! work completed (an interrupt race, or the fiber being raised on), the
//! pool asks the operation to stop and re-blocks until the worker retires
//! the item.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

/// A blocking operation the pool can execute off-thread.
///
/// `execute` runs on a worker thread, outside any fiber serialization.
/// `cancel` may be called from any thread while `execute` is in flight and
/// must cause it to return promptly.
pub trait BlockingOperation: Send + Sync {
    fn execute(&self);
    fn cancel(&self);
}

/// The blocking interface of the host runtime's fiber scheduler.
///
/// `block` parks the calling fiber on the pool until a matching `unblock`;
/// spurious wakeups are allowed (the pool re-checks completion). `unblock`
/// is called from worker threads.
pub trait Scheduler: Send + Sync + Sized + 'static {
    /// Identifies a parked fiber to this scheduler across threads.
    type Fiber: Clone + Send + Sync + 'static;

    /// The calling fiber's identity.
    fn current(&self) -> Self::Fiber;

    /// Parks the calling fiber on `blocker`.
    fn block(&self, blocker: &WorkerPool<Self>, timeout: Option<Duration>);

    /// Wakes `fiber`, previously parked on `blocker`.
    fn unblock(&self, blocker: &WorkerPool<Self>, fiber: &Self::Fiber);
}

struct Work<S: Scheduler> {
    operation: Arc<dyn BlockingOperation>,
    fiber: S::Fiber,
    // Written under the pool mutex, read by the caller after waking.
    completed: AtomicBool,
}

struct Worker {
    /// This specific worker should exit.
    interrupted: AtomicBool,
    /// The operation currently executing, for cancellation targeting.
    current_operation: Mutex<Option<Arc<dyn BlockingOperation>>>,
}

struct State<S: Scheduler> {
    queue: VecDeque<Arc<Work<S>>>,
    workers: Vec<Arc<Worker>>,
    threads: Vec<thread::JoinHandle<()>>,
    current_worker_count: usize,
    call_count: usize,
    completed_count: usize,
    cancelled_count: usize,
    shutdown: bool,
}

struct Shared<S: Scheduler> {
    scheduler: Arc<S>,
    state: Mutex<State<S>>,
    work_available: Condvar,
    maximum_worker_count: usize,
}

/// A pool of worker threads executing [`BlockingOperation`]s.
///
/// Cloning yields another handle to the same pool. Teardown is explicit
/// via [`WorkerPool::close`]; dropping every handle without closing leaves
/// the workers parked on their condition variable.
pub struct WorkerPool<S: Scheduler> {
    shared: Arc<Shared<S>>,
}

impl<S: Scheduler> Clone for WorkerPool<S> {
    fn clone(&self) -> WorkerPool<S> {
        WorkerPool {
            shared: self.shared.clone(),
        }
    }
}

/// A snapshot of pool counters, keyed by the canonical statistic names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statistics {
    pub current_worker_count: usize,
    pub maximum_worker_count: usize,
    pub call_count: usize,
    pub completed_count: usize,
    pub cancelled_count: usize,
    pub shutdown: bool,
    pub current_queue_size: usize,
}

impl<S: Scheduler> WorkerPool<S> {
    /// Creates a pool with one worker.
    pub fn new(scheduler: Arc<S>) -> io::Result<WorkerPool<S>> {
        WorkerPool::with_worker_count(scheduler, 1)
    }

    /// Creates a pool with up to `maximum_worker_count` workers (minimum
    /// one).
    pub fn with_worker_count(
        scheduler: Arc<S>,
        maximum_worker_count: usize,
    ) -> io::Result<WorkerPool<S>> {
        if maximum_worker_count == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "maximum_worker_count must be greater than zero",
            ));
        }

        let shared = Arc::new(Shared {
            scheduler,
            state: Mutex::new(State {
                queue: VecDeque::new(),
                workers: Vec::new(),
                threads: Vec::new(),
                current_worker_count: 0,
                call_count: 0,
                completed_count: 0,
                cancelled_count: 0,
                shutdown: false,
            }),
            work_available: Condvar::new(),
            maximum_worker_count,
        });

        for index in 0..maximum_worker_count {
            let worker = Arc::new(Worker {
                interrupted: AtomicBool::new(false),
                current_operation: Mutex::new(None),
            });

            let thread = {
                let shared = shared.clone();
                let worker = worker.clone();
                thread::Builder::new()
                    .name(format!("io-event-worker-{}", index))
                    .spawn(move || worker_main(shared, worker))?
            };

            let mut state = shared.state.lock().unwrap();
            state.workers.push(worker);
            state.threads.push(thread);
            state.current_worker_count += 1;
        }

        Ok(WorkerPool { shared })
    }

    /// Executes `operation` on a worker thread, blocking the calling fiber
    /// cooperatively until the work item retires.
    ///
    /// If the fiber is woken early, the operation is cancelled and the
    /// call re-blocks until the worker confirms completion, so the work
    /// item never outlives this frame.
    pub fn call(&self, operation: Arc<dyn BlockingOperation>) -> io::Result<()> {
        let fiber = self.shared.scheduler.current();

        let work = {
            let mut state = self.shared.state.lock().unwrap();
            if state.shutdown {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "worker pool is shut down",
                ));
            }
            state.call_count += 1;

            let work = Arc::new(Work::<S> {
                operation: operation.clone(),
                fiber,
                completed: AtomicBool::new(false),
            });
            state.queue.push_back(work.clone());
            self.shared.work_available.notify_one();
            work
        };

        loop {
            self.shared.scheduler.block(self, None);

            if work.completed.load(Ordering::Acquire) {
                return Ok(());
            }

            // Woken before the worker marked completion: spurious wakeup or
            // an interrupt race. Ask the operation to stop and wait for the
            // worker to retire the item.
            operation.cancel();
            let mut state = self.shared.state.lock().unwrap();
            state.cancelled_count += 1;
        }
    }

    /// A snapshot of the pool counters.
    pub fn statistics(&self) -> Statistics {
        let state = self.shared.state.lock().unwrap();
        Statistics {
            current_worker_count: state.current_worker_count,
            maximum_worker_count: self.shared.maximum_worker_count,
            call_count: state.call_count,
            completed_count: state.completed_count,
            cancelled_count: state.cancelled_count,
            shutdown: state.shutdown,
            current_queue_size: state.queue.len(),
        }
    }

    /// Shuts the pool down and joins every worker thread. Idempotent.
    ///
    /// Workers currently executing an operation have it cancelled so the
    /// join cannot hang on an unbounded call.
    pub fn close(&self) {
        let (threads, workers) = {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
            self.shared.work_available.notify_all();
            (mem::take(&mut state.threads), mem::take(&mut state.workers))
        };

        for worker in &workers {
            worker.interrupted.store(true, Ordering::Release);
            let in_flight = worker.current_operation.lock().unwrap().clone();
            if let Some(operation) = in_flight {
                operation.cancel();
            }
        }

        for thread in threads {
            let _ = thread.join();
        }

        let mut state = self.shared.state.lock().unwrap();
        state.current_worker_count = 0;
    }
}

fn worker_main<S: Scheduler>(shared: Arc<Shared<S>>, worker: Arc<Worker>) {
    loop {
        let work = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if state.shutdown || worker.interrupted.load(Ordering::Acquire) {
                    return;
                }
                if let Some(work) = state.queue.pop_front() {
                    break work;
                }
                state = shared.work_available.wait(state).unwrap();
            }
        };

        // Execute outside the lock and outside any fiber serialization;
        // record the in-flight operation for cancellation targeting.
        *worker.current_operation.lock().unwrap() = Some(work.operation.clone());
        work.operation.execute();
        *worker.current_operation.lock().unwrap() = None;

        {
            let mut state = shared.state.lock().unwrap();
            work.completed.store(true, Ordering::Release);
            state.completed_count += 1;
        }

        let pool = WorkerPool {
            shared: shared.clone(),
        };
        shared.scheduler.unblock(&pool, &work.fiber);
    }
}

impl<S: Scheduler> fmt::Debug for WorkerPool<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("statistics", &self.statistics())
            .finish()
    }
}
