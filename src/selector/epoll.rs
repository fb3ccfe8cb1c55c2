//! Readiness-based selector built on Linux `epoll`.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::process::ExitStatus;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use libc::{c_int, pid_t};

use crate::event::Events;
use crate::fiber::{FiberHandle, Resume};
use crate::interrupt::Interrupt;
use crate::list::{Link, List};
use crate::process;
use crate::selector::queue::Queue;
use crate::selector::NonblockGuard;
use crate::table::Table;
use crate::waker::Waker;

const MAX_EVENTS: usize = 64;

/// One fiber waiting for specific events on one descriptor. Lives on the
/// waiting fiber's stack; linked into the descriptor's waiter list only
/// while the fiber is parked.
#[repr(C)]
struct Waiting {
    // Must stay first: list nodes are cast back to `Waiting`.
    link: Link,
    events: Events,
    ready: Cell<Events>,
    fiber: RefCell<Option<FiberHandle>>,
}

impl Waiting {
    fn new(fiber: FiberHandle, events: Events) -> Waiting {
        Waiting {
            link: Link::new(),
            events,
            ready: Cell::new(Events::empty()),
            fiber: RefCell::new(Some(fiber)),
        }
    }

    fn link_ptr(&self) -> *mut Link {
        &self.link as *const Link as *mut Link
    }

    fn cancel(&self) {
        unsafe {
            Link::remove(self.link_ptr());
        }
        self.fiber.replace(None);
    }
}

struct WaitingGuard<'a>(&'a Waiting);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Zero or more fibers waiting for one descriptor.
struct Descriptor {
    list: List,
    /// Union of event masks across all current waiters.
    waiting_events: Cell<Events>,
    /// Mask currently armed with the kernel.
    registered_events: Cell<Events>,
}

impl Default for Descriptor {
    fn default() -> Descriptor {
        Descriptor {
            list: List::new(),
            waiting_events: Cell::new(Events::empty()),
            registered_events: Cell::new(Events::empty()),
        }
    }
}

fn epoll_flags_from_events(events: Events) -> u32 {
    let mut flags = 0;

    if events.is_readable() {
        flags |= libc::EPOLLIN;
    }
    if events.is_priority() {
        flags |= libc::EPOLLPRI;
    }
    if events.is_writable() {
        flags |= libc::EPOLLOUT;
    }

    // Hang-up and error are reported regardless of what was requested.
    flags |= libc::EPOLLHUP;
    flags |= libc::EPOLLERR;

    flags as u32
}

fn events_from_epoll_flags(flags: u32) -> Events {
    let flags = flags as c_int;
    let mut events = Events::empty();

    // A bare EPOLLHUP (common on a child's closed stdout) has no dedicated
    // event, so it is folded into readability to stay observable.
    if flags & (libc::EPOLLIN | libc::EPOLLHUP | libc::EPOLLERR) != 0 {
        events |= Events::READABLE;
    }
    if flags & libc::EPOLLPRI != 0 {
        events |= Events::PRIORITY;
    }
    if flags & libc::EPOLLOUT != 0 {
        events |= Events::WRITABLE;
    }

    events
}

/// An `epoll`-backed selector.
pub struct Selector {
    queue: Queue,
    fd: RefCell<Option<OwnedFd>>,
    blocked: Arc<AtomicBool>,
    idle_duration: Cell<Duration>,
    interrupt: Arc<Interrupt>,
    descriptors: Table<Descriptor>,
}

impl Selector {
    /// Creates a selector driven by `loop_fiber`.
    pub fn new(loop_fiber: FiberHandle) -> io::Result<Selector> {
        let fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        // SAFETY: `epoll_create1(2)` returned a fresh descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let interrupt = Arc::new(Interrupt::open()?);

        // The interrupt is identified by a negative value so dispatch can
        // tell it apart from real descriptors.
        let mut event = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLRDHUP) as u32,
            u64: -1i64 as u64,
        };
        syscall!(epoll_ctl(
            fd.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            interrupt.as_raw_fd(),
            &mut event,
        ))?;

        Ok(Selector {
            queue: Queue::new(loop_fiber),
            fd: RefCell::new(Some(fd)),
            blocked: Arc::new(AtomicBool::new(false)),
            idle_duration: Cell::new(Duration::ZERO),
            interrupt,
            descriptors: Table::new(),
        })
    }

    /// The event loop fiber this selector transfers to on yield.
    pub fn loop_fiber(&self) -> FiberHandle {
        self.queue.loop_fiber().clone()
    }

    /// Real time spent in the most recent blocking kernel wait, in seconds.
    pub fn idle_duration(&self) -> f64 {
        self.idle_duration.get().as_secs_f64()
    }

    /// Transfers control to the loop fiber.
    pub fn transfer(&self) -> Resume {
        self.queue.loop_yield()
    }

    /// Schedules `current` and transfers control to `fiber`.
    pub fn resume(&self, current: &FiberHandle, fiber: &FiberHandle) -> Resume {
        self.queue.resume(current, fiber)
    }

    /// Schedules `current` and raises `error` inside `fiber`.
    pub fn raise(&self, current: &FiberHandle, fiber: &FiberHandle, error: io::Error) -> Resume {
        self.queue.raise(current, fiber, error)
    }

    /// Schedules `current` and yields to the loop fiber.
    pub fn yield_now(&self, current: &FiberHandle) -> Resume {
        self.queue.yield_now(current)
    }

    /// Appends `fiber` to the ready queue.
    pub fn push(&self, fiber: FiberHandle) {
        self.queue.ready_push(fiber);
    }

    /// True if fibers are queued for the next `select`.
    pub fn is_ready(&self) -> bool {
        self.queue.is_ready()
    }

    /// Returns a handle that can wake this selector from another thread.
    pub fn waker(&self) -> Waker {
        Waker::from_interrupt(self.interrupt.clone(), self.blocked.clone())
    }

    /// Wakes the selector if it is blocked in the kernel.
    pub fn wakeup(&self) -> io::Result<bool> {
        self.waker().wake()
    }

    /// Closes the selector. Idempotent.
    pub fn close(&self) {
        self.fd.borrow_mut().take();
    }

    fn fd(&self) -> io::Result<RawFd> {
        self.fd
            .borrow()
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }

    /// Suspends `fiber` until at least one of `events` fires on `fd`.
    ///
    /// Returns the subset that fired, `Ok(None)` if the fiber was resumed
    /// without events (cancelled), or the raised error if another fiber
    /// raised on it.
    pub fn io_wait(
        &self,
        fiber: &FiberHandle,
        fd: RawFd,
        events: Events,
    ) -> io::Result<Option<Events>> {
        let waiting = Waiting::new(fiber.clone(), events);

        match self.register(fd, &waiting) {
            Ok(()) => {}
            Err(error) if error.raw_os_error() == Some(libc::EPERM) => {
                // The descriptor cannot be polled (e.g. a regular file).
                // Report the requested events as ready after one trip
                // through the loop so throughput is preserved.
                self.queue.ready_push(fiber.clone());
                return match self.queue.yield_now(fiber) {
                    Resume::Transfer => Ok(Some(events)),
                    Resume::Raise(error) => Err(error),
                };
            }
            Err(error) => return Err(error),
        }

        let _guard = WaitingGuard(&waiting);
        match self.queue.loop_yield() {
            Resume::Transfer => {
                let ready = waiting.ready.get();
                if ready.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(ready))
                }
            }
            Resume::Raise(error) => Err(error),
        }
    }

    /// Suspends `fiber` until process `pid` exits, then reaps it.
    ///
    /// Returns the exit status, or `Ok(None)` on cancellation. If the
    /// process is already reapable the status is returned immediately.
    pub fn process_wait(
        &self,
        fiber: &FiberHandle,
        pid: pid_t,
        flags: c_int,
    ) -> io::Result<Option<ExitStatus>> {
        let pidfd = process::pidfd_open(pid)?;

        // The pidfd is edge triggered: if the process already exited there
        // will be no event, so check before arming.
        if let Some(status) = process::process_status_wait(pid, flags)? {
            return Ok(Some(status));
        }

        let waiting = Waiting::new(fiber.clone(), Events::READABLE);
        self.register(pidfd.as_raw_fd(), &waiting)?;

        let _guard = WaitingGuard(&waiting);
        match self.queue.loop_yield() {
            Resume::Transfer => {
                if waiting.ready.get().is_empty() {
                    Ok(None)
                } else {
                    process::process_status_wait(pid, flags)
                }
            }
            Resume::Raise(error) => Err(error),
        }
    }

    /// Reads at least `length` bytes from `fd` into `buffer`, waiting for
    /// readability between short reads.
    ///
    /// Returns the total transferred; `Ok(0)` is end-of-file. `length == 0`
    /// performs a single non-blocking read attempt.
    pub fn io_read(
        &self,
        fiber: &FiberHandle,
        fd: RawFd,
        buffer: &mut [u8],
        length: usize,
    ) -> io::Result<usize> {
        let _nonblock = NonblockGuard::new(fd)?;

        let mut offset = 0;
        let mut remaining = length;
        let mut total = 0;

        while offset < buffer.len() {
            let window = buffer.len() - offset;
            match syscall!(read(
                fd,
                buffer[offset..].as_mut_ptr() as *mut libc::c_void,
                window,
            )) {
                Ok(0) => break,
                Ok(result) => {
                    let result = result as usize;
                    total += result;
                    offset += result;
                    if result >= remaining {
                        break;
                    }
                    remaining -= result;
                }
                Err(ref error) if remaining > 0 && try_again(error) => {
                    self.io_wait(fiber, fd, Events::READABLE)?;
                }
                Err(error) => return Err(error),
            }
        }

        Ok(total)
    }

    /// Writes at least `length` bytes from `buffer` to `fd`, waiting for
    /// writability between short writes.
    pub fn io_write(
        &self,
        fiber: &FiberHandle,
        fd: RawFd,
        buffer: &[u8],
        length: usize,
    ) -> io::Result<usize> {
        let _nonblock = NonblockGuard::new(fd)?;

        let mut offset = 0;
        let mut remaining = length;
        let mut total = 0;

        while offset < buffer.len() {
            let window = buffer.len() - offset;
            match syscall!(write(
                fd,
                buffer[offset..].as_ptr() as *const libc::c_void,
                window,
            )) {
                Ok(0) => break,
                Ok(result) => {
                    let result = result as usize;
                    total += result;
                    offset += result;
                    if result >= remaining {
                        break;
                    }
                    remaining -= result;
                }
                Err(ref error) if remaining > 0 && try_again(error) => {
                    self.io_wait(fiber, fd, Events::WRITABLE)?;
                }
                Err(error) => return Err(error),
            }
        }

        Ok(total)
    }

    /// Runs one selector cycle: flush ready fibers, harvest immediately
    /// available events, then (only if completely idle) block for up to
    /// `duration`. Returns the number of kernel events observed.
    ///
    /// `None` blocks indefinitely; `Some(Duration::ZERO)` polls.
    pub fn select(&self, duration: Option<Duration>) -> io::Result<usize> {
        self.idle_duration.set(Duration::ZERO);

        let ready = self.queue.ready_flush();

        let mut events: [libc::epoll_event; MAX_EVENTS] = unsafe { std::mem::zeroed() };

        // Harvest anything already pending without blocking.
        let mut count = self.wait_for_events(&mut events, Some(Duration::ZERO))?;

        // Block only when no ready fibers were processed, the non-blocking
        // harvest was empty, and nothing was pushed meanwhile.
        if ready == 0 && count == 0 && !self.queue.is_ready() && duration != Some(Duration::ZERO) {
            let start = Instant::now();
            self.blocked.store(true, Ordering::Release);
            let result = self.wait_for_events(&mut events, duration);
            self.blocked.store(false, Ordering::Release);
            self.idle_duration.set(start.elapsed());
            count = result?;
        }

        // Interrupt wakeups are bookkeeping, not application events; they
        // do not contribute to the returned count.
        let mut observed = 0;
        for event in events[..count].iter() {
            let identifier = event.u64 as i64;
            if identifier >= 0 {
                observed += 1;
                self.dispatch(identifier as RawFd, events_from_epoll_flags(event.events))?;
            } else {
                self.interrupt.clear()?;
            }
        }

        Ok(observed)
    }

    fn wait_for_events(
        &self,
        events: &mut [libc::epoll_event; MAX_EVENTS],
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let fd = self.fd()?;

        let timespec = timeout.map(|timeout| libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        });
        let timespec = timespec
            .as_ref()
            .map(|timespec| timespec as *const libc::timespec)
            .unwrap_or(ptr::null());

        let result = match syscall!(epoll_pwait2(
            fd,
            events.as_mut_ptr(),
            MAX_EVENTS as c_int,
            timespec,
            ptr::null(),
        )) {
            Err(ref error) if error.raw_os_error() == Some(libc::ENOSYS) => {
                // Pre-5.11 kernel: fall back to millisecond resolution.
                let milliseconds = timeout
                    .map(|timeout| {
                        (timeout.as_secs() * 1000 + u64::from(timeout.subsec_nanos()) / 1_000_000)
                            as c_int
                    })
                    .unwrap_or(-1);
                syscall!(epoll_wait(
                    fd,
                    events.as_mut_ptr(),
                    MAX_EVENTS as c_int,
                    milliseconds,
                ))
            }
            other => other,
        };

        match result {
            Ok(count) => Ok(count as usize),
            Err(ref error) if error.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(error) => Err(error),
        }
    }

    fn register(&self, fd: RawFd, waiting: &Waiting) -> io::Result<()> {
        let state = self.descriptors.lookup(fd as usize)?;
        let state = unsafe { state.as_ref() };

        state
            .waiting_events
            .set(state.waiting_events.get() | waiting.events);

        self.update(fd, state)?;

        // Newest waiters go first; dispatch within one descriptor is LIFO
        // by registration.
        unsafe {
            state.list.prepend(waiting.link_ptr());
        }

        Ok(())
    }

    /// Reconciles the kernel registration with the waiters' union mask.
    fn update(&self, fd: RawFd, state: &Descriptor) -> io::Result<()> {
        let waiting = state.waiting_events.get();
        let registered = state.registered_events.get();

        if registered == waiting {
            return Ok(());
        }

        let epfd = self.fd()?;

        if waiting.is_empty() {
            if !registered.is_empty() {
                let _ = syscall!(epoll_ctl(epfd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()));
                state.registered_events.set(Events::empty());
            }
            return Ok(());
        }

        let mut event = libc::epoll_event {
            events: epoll_flags_from_events(waiting),
            u64: fd as i64 as u64,
        };

        let operation = if registered.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };

        match syscall!(epoll_ctl(epfd, operation, fd, &mut event)) {
            Ok(_) => {}
            Err(error) => {
                // Races with fork/dup: the registration may have vanished
                // (ENOENT after MOD) or survived a descriptor reuse (EEXIST
                // after ADD). Degrade to the other operation.
                let retry = match error.raw_os_error() {
                    Some(libc::ENOENT) => libc::EPOLL_CTL_ADD,
                    Some(libc::EEXIST) => libc::EPOLL_CTL_MOD,
                    _ => return Err(error),
                };
                log::trace!("degraded epoll registration for fd {}: {}", fd, error);
                syscall!(epoll_ctl(epfd, retry, fd, &mut event))?;
            }
        }

        state.registered_events.set(waiting);
        Ok(())
    }

    /// Walks `fd`'s waiter list, resuming every waiter whose mask
    /// intersects `ready_events`, then re-arms from the survivors.
    fn dispatch(&self, fd: RawFd, ready_events: Events) -> io::Result<()> {
        let state = self.descriptors.lookup(fd as usize)?;
        let state = unsafe { state.as_ref() };

        // Survivors re-contribute below; start from a clean slate so the
        // re-arm reflects only waiters that did not match.
        state.waiting_events.set(Events::empty());

        let sentinel = state.list.sentinel();
        let mut node = state.list.front();
        let marker = Link::new();
        let marker_ptr = &marker as *const Link as *mut Link;

        while node != sentinel {
            let fiber = unsafe {
                let waiting = &*(node as *const Waiting);
                let matching = waiting.events & ready_events;

                if matching.is_empty() {
                    state
                        .waiting_events
                        .set(state.waiting_events.get() | waiting.events);
                    None
                } else {
                    let fiber = waiting.fiber.borrow().clone();
                    match fiber {
                        Some(fiber) if fiber.is_alive() => {
                            waiting.ready.set(matching);
                            Some(fiber)
                        }
                        _ => None,
                    }
                }
            };

            if let Some(fiber) = fiber {
                // The resumed fiber unlinks its waiter and may mutate the
                // list arbitrarily; a marker node keeps our position valid.
                unsafe {
                    Link::append(node, marker_ptr);
                }
                self.queue.loop_resume(&fiber);
                node = marker.tail();
                unsafe {
                    Link::pop(marker_ptr);
                }
            } else {
                node = unsafe { (*node).tail() };
            }
        }

        self.update(fd, state)
    }
}

fn try_again(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::WouldBlock
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("epoll::Selector")
            .field("descriptors", &self.descriptors)
            .field("blocked", &self.blocked.load(Ordering::Relaxed))
            .finish()
    }
}
