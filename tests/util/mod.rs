// Not all helpers are used by all tests.
#![allow(dead_code)]

use std::cell::RefCell;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Once};
use std::thread;

use io_event::{Fiber, FiberHandle, Resume};

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}

/// Asserts that the selector's serialization contract holds for test
/// values shared between fiber threads.
///
/// The mailbox protocol below runs exactly one fiber thread at a time and
/// every handover goes through a mutex, so access to the wrapped value is
/// serialized with happens-before edges even though the compiler cannot
/// see it.
pub struct Shared<T>(pub T);

unsafe impl<T> Send for Shared<T> {}
unsafe impl<T> Sync for Shared<T> {}

struct FiberState {
    slot: Mutex<Option<Resume>>,
    signal: Condvar,
    alive: AtomicBool,
    panicked: AtomicBool,
}

impl FiberState {
    fn new() -> FiberState {
        FiberState {
            slot: Mutex::new(None),
            signal: Condvar::new(),
            alive: AtomicBool::new(true),
            panicked: AtomicBool::new(false),
        }
    }
}

fn deliver(state: &FiberState, resume: Resume) {
    let mut slot = state.slot.lock().unwrap();
    *slot = Some(resume);
    state.signal.notify_one();
}

fn wait(state: &FiberState) -> Resume {
    let mut slot = state.slot.lock().unwrap();
    loop {
        if let Some(resume) = slot.take() {
            return resume;
        }
        slot = state.signal.wait(slot).unwrap();
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<FiberState>>> = RefCell::new(None);
}

/// A cooperative fiber backed by a parked OS thread.
///
/// `switch` delivers the resumption to the target's mailbox and parks the
/// calling thread on its own mailbox, so exactly one fiber runs at any
/// moment.
pub struct TestFiber {
    state: Arc<FiberState>,
}

impl TestFiber {
    pub fn panicked(&self) -> bool {
        self.state.panicked.load(Ordering::SeqCst)
    }
}

impl Fiber for TestFiber {
    fn is_alive(&self) -> bool {
        self.state.alive.load(Ordering::SeqCst)
    }

    fn switch(&self, resume: Resume) -> Resume {
        let current = CURRENT
            .with(|current| current.borrow().clone())
            .expect("switch outside any fiber context");
        assert!(
            !Arc::ptr_eq(&current, &self.state),
            "a fiber cannot switch to itself"
        );

        deliver(&self.state, resume);
        wait(&current)
    }
}

/// Registers the calling thread as a fiber (idempotent) and returns its
/// handle. Tests use this for the loop fiber.
pub fn main_fiber() -> Arc<TestFiber> {
    let state = CURRENT.with(|current| {
        let mut current = current.borrow_mut();
        if current.is_none() {
            *current = Some(Arc::new(FiberState::new()));
        }
        current.as_ref().unwrap().clone()
    });
    Arc::new(TestFiber { state })
}

/// The calling thread's own fiber handle; must be inside a fiber context.
pub fn current_fiber() -> FiberHandle {
    let state = CURRENT
        .with(|current| current.borrow().clone())
        .expect("not inside a fiber context");
    Arc::new(TestFiber { state })
}

/// Spawns a fiber that starts parked. The first `switch` to it runs
/// `body`; when `body` returns the fiber dies and control passes to
/// `exit_to`.
pub fn spawn<F>(exit_to: &Arc<TestFiber>, body: F) -> Arc<TestFiber>
where
    F: FnOnce() + Send + 'static,
{
    let state = Arc::new(FiberState::new());
    let fiber = Arc::new(TestFiber {
        state: state.clone(),
    });

    let exit_state = exit_to.state.clone();
    thread::spawn(move || {
        CURRENT.with(|current| *current.borrow_mut() = Some(state.clone()));

        if let Resume::Transfer = wait(&state) {
            if panic::catch_unwind(AssertUnwindSafe(body)).is_err() {
                state.panicked.store(true, Ordering::SeqCst);
            }
        }

        state.alive.store(false, Ordering::SeqCst);
        deliver(&exit_state, Resume::Transfer);
    });

    fiber
}

/// Starts or resumes `fiber` directly (outside the selector's queue).
pub fn switch_to(fiber: &Arc<TestFiber>) {
    let handle: FiberHandle = fiber.clone();
    handle.switch(Resume::Transfer);
}

pub fn handle(fiber: &Arc<TestFiber>) -> FiberHandle {
    fiber.clone()
}

pub fn pipe() -> (OwnedFd, OwnedFd) {
    let mut fds: [RawFd; 2] = [-1, -1];
    let result = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(result, 0, "pipe failed: {}", io::Error::last_os_error());
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

pub fn socketpair() -> (OwnedFd, OwnedFd) {
    let mut fds: [RawFd; 2] = [-1, -1];
    let result =
        unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(
        result,
        0,
        "socketpair failed: {}",
        io::Error::last_os_error()
    );
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

pub fn write_all(fd: &impl AsRawFd, bytes: &[u8]) {
    let result = unsafe {
        libc::write(
            fd.as_raw_fd(),
            bytes.as_ptr() as *const libc::c_void,
            bytes.len(),
        )
    };
    assert_eq!(result, bytes.len() as isize);
}

/// Fills a socket's send buffer until the kernel reports it would block.
pub fn fill_send_buffer(fd: &impl AsRawFd) {
    let chunk = [0u8; 4096];
    loop {
        let result = unsafe {
            libc::send(
                fd.as_raw_fd(),
                chunk.as_ptr() as *const libc::c_void,
                chunk.len(),
                libc::MSG_DONTWAIT,
            )
        };
        if result < 0 {
            let error = io::Error::last_os_error();
            assert_eq!(error.kind(), io::ErrorKind::WouldBlock);
            return;
        }
    }
}

/// Every selector backend available on this platform, for running the
/// same scenario against each.
pub fn selectors(loop_fiber: &Arc<TestFiber>) -> Vec<(&'static str, io_event::Selector)> {
    let mut selectors = Vec::new();

    #[cfg(target_os = "linux")]
    {
        let handle: FiberHandle = loop_fiber.clone();
        match io_event::selector::uring::Selector::new(handle) {
            Ok(selector) => selectors.push(("uring", io_event::Selector::Uring(selector))),
            Err(error) => log::warn!("skipping uring backend: {}", error),
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let handle: FiberHandle = loop_fiber.clone();
        let selector = io_event::selector::epoll::Selector::new(handle).unwrap();
        selectors.push(("epoll", io_event::Selector::Epoll(selector)));
    }

    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly",
    ))]
    {
        let handle: FiberHandle = loop_fiber.clone();
        let selector = io_event::selector::kqueue::Selector::new(handle).unwrap();
        selectors.push(("kqueue", io_event::Selector::KQueue(selector)));
    }

    selectors
}
