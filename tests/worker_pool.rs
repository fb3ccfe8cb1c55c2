use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use io_event::worker_pool::{BlockingOperation, Scheduler, WorkerPool};

mod util;

/// A scheduler that parks calling threads directly; "fibers" are thread
/// tokens.
struct ThreadScheduler {
    parked: Mutex<HashMap<u64, bool>>,
    signal: Condvar,
}

impl ThreadScheduler {
    fn new() -> Arc<ThreadScheduler> {
        Arc::new(ThreadScheduler {
            parked: Mutex::new(HashMap::new()),
            signal: Condvar::new(),
        })
    }
}

fn thread_token() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static TOKEN: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    TOKEN.with(|token| *token)
}

impl Scheduler for ThreadScheduler {
    type Fiber = u64;

    fn current(&self) -> u64 {
        thread_token()
    }

    fn block(&self, _blocker: &WorkerPool<Self>, _timeout: Option<Duration>) {
        let token = thread_token();
        let mut parked = self.parked.lock().unwrap();
        loop {
            if parked.remove(&token).is_some() {
                return;
            }
            parked = self.signal.wait(parked).unwrap();
        }
    }

    fn unblock(&self, _blocker: &WorkerPool<Self>, fiber: &u64) {
        let mut parked = self.parked.lock().unwrap();
        parked.insert(*fiber, true);
        self.signal.notify_all();
    }
}

/// Spins until `duration` elapses or it is cancelled.
struct Busy {
    duration: Duration,
    cancelled: AtomicBool,
}

impl Busy {
    fn new(duration: Duration) -> Arc<Busy> {
        Arc::new(Busy {
            duration,
            cancelled: AtomicBool::new(false),
        })
    }
}

impl BlockingOperation for Busy {
    fn execute(&self) {
        let start = Instant::now();
        while start.elapsed() < self.duration && !self.cancelled.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

#[test]
fn offloaded_operation_completes() {
    util::init();
    let scheduler = ThreadScheduler::new();
    let pool = WorkerPool::new(scheduler).unwrap();

    let busy = Busy::new(Duration::from_millis(100));
    pool.call(busy.clone()).unwrap();

    let statistics = pool.statistics();
    assert_eq!(statistics.current_worker_count, 1);
    assert_eq!(statistics.maximum_worker_count, 1);
    assert_eq!(statistics.call_count, 1);
    assert_eq!(statistics.completed_count, 1);
    assert_eq!(statistics.cancelled_count, 0);
    assert_eq!(statistics.current_queue_size, 0);
    assert!(!statistics.shutdown);

    pool.close();
}

#[test]
fn early_wakeup_cancels_the_operation() {
    util::init();
    let scheduler = ThreadScheduler::new();
    let pool = WorkerPool::with_worker_count(scheduler.clone(), 1).unwrap();

    let busy = Busy::new(Duration::from_secs(30));

    // Wake the calling fiber before the work can possibly be done; the
    // pool must cancel the operation and wait for the worker to retire it.
    let interrupter = {
        let scheduler = scheduler.clone();
        let pool = pool.clone();
        let fiber = thread_token();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            scheduler.unblock(&pool, &fiber);
        })
    };

    let start = Instant::now();
    pool.call(busy.clone()).unwrap();
    let elapsed = start.elapsed();

    assert!(
        elapsed < Duration::from_secs(10),
        "cancellation did not shorten the call: {:?}",
        elapsed
    );
    assert!(busy.cancelled.load(Ordering::Acquire));

    let statistics = pool.statistics();
    assert_eq!(statistics.call_count, 1);
    assert_eq!(statistics.completed_count, 1);
    assert!(statistics.cancelled_count >= 1);

    interrupter.join().unwrap();
    pool.close();
}

#[test]
fn close_cancels_in_flight_work_and_joins() {
    util::init();
    let scheduler = ThreadScheduler::new();
    let pool = WorkerPool::new(scheduler).unwrap();

    let busy = Busy::new(Duration::from_secs(30));

    let caller = {
        let pool = pool.clone();
        let busy = busy.clone();
        thread::spawn(move || pool.call(busy))
    };

    // Let the worker pick the item up, then tear the pool down.
    thread::sleep(Duration::from_millis(200));
    let start = Instant::now();
    pool.close();
    assert!(start.elapsed() < Duration::from_secs(10));

    // The cancelled operation still retires and unblocks its caller.
    caller.join().unwrap().unwrap();

    let statistics = pool.statistics();
    assert!(statistics.shutdown);
    assert_eq!(statistics.current_worker_count, 0);
    assert_eq!(statistics.completed_count, 1);

    // Double close is a no-op.
    pool.close();
}

#[test]
fn call_after_close_fails() {
    util::init();
    let scheduler = ThreadScheduler::new();
    let pool = WorkerPool::new(scheduler).unwrap();
    pool.close();

    let busy = Busy::new(Duration::from_millis(10));
    let error = pool.call(busy).unwrap_err();
    assert_eq!(error.kind(), io::ErrorKind::Other);
}

#[test]
fn zero_workers_is_an_argument_error() {
    util::init();
    let scheduler = ThreadScheduler::new();
    let error = WorkerPool::with_worker_count(scheduler, 0).unwrap_err();
    assert_eq!(error.kind(), io::ErrorKind::InvalidInput);
}

#[test]
fn workers_process_a_backlog() {
    util::init();
    let scheduler = ThreadScheduler::new();
    let pool = WorkerPool::with_worker_count(scheduler, 2).unwrap();

    let callers: Vec<_> = (0..4)
        .map(|_| {
            let pool = pool.clone();
            thread::spawn(move || pool.call(Busy::new(Duration::from_millis(50))))
        })
        .collect();

    for caller in callers {
        caller.join().unwrap().unwrap();
    }

    let statistics = pool.statistics();
    assert_eq!(statistics.call_count, 4);
    assert_eq!(statistics.completed_count, 4);
    assert_eq!(statistics.current_queue_size, 0);
    assert_eq!(statistics.current_worker_count, 2);

    pool.close();
}
