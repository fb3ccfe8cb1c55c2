//! Readiness-based selector built on BSD `kqueue`, including process-exit
//! events via `EVFILT_PROC`.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::process::ExitStatus;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use libc::{c_int, pid_t};

use crate::event::Events;
use crate::fiber::{FiberHandle, Resume};
use crate::list::{Link, List};
use crate::process;
use crate::selector::queue::Queue;
use crate::selector::NonblockGuard;
use crate::table::Table;
use crate::waker::Waker;

#[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
use crate::interrupt::Interrupt;

const MAX_EVENTS: usize = 64;

/// One fiber waiting for specific events on one identifier (descriptor or
/// pid). Lives on the waiting fiber's stack.
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

/// Zero or more fibers waiting on one identifier.
struct Descriptor {
    list: List,
    /// Union of event masks across all current waiters.
    waiting_events: Cell<Events>,
    /// Mask currently armed with the kernel.
    registered_events: Cell<Events>,
    /// Staging mask populated during event harvest, before dispatch. Events
    /// for one identifier may arrive as several kevents (read and write);
    /// staging coalesces them into a single waiter-list walk.
    ready_events: Cell<Events>,
}

impl Default for Descriptor {
    fn default() -> Descriptor {
        Descriptor {
            list: List::new(),
            waiting_events: Cell::new(Events::empty()),
            registered_events: Cell::new(Events::empty()),
            ready_events: Cell::new(Events::empty()),
        }
    }
}

fn events_from_kevent_filter(filter: i32) -> Events {
    match filter {
        _ if filter == libc::EVFILT_READ as i32 => Events::READABLE,
        _ if filter == libc::EVFILT_WRITE as i32 => Events::WRITABLE,
        _ if filter == libc::EVFILT_PROC as i32 => Events::EXIT,
        _ => Events::empty(),
    }
}

/// Triggers the selector's `EVFILT_USER` event. Safe to call from any
/// thread; used by [`Waker`].
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly",
))]
pub(crate) fn trigger_user_event(kq: RawFd) -> io::Result<()> {
    let mut kevent: libc::kevent = unsafe { mem::zeroed() };
    kevent.filter = libc::EVFILT_USER;
    kevent.flags = libc::EV_ADD | libc::EV_CLEAR;

    syscall!(kevent(kq, &kevent, 1, ptr::null_mut(), 0, ptr::null()))?;

    // Some kernels only honour NOTE_TRIGGER as a separate change.
    kevent.flags = 0;
    kevent.fflags = libc::NOTE_TRIGGER;

    syscall!(kevent(kq, &kevent, 1, ptr::null_mut(), 0, ptr::null()))?;

    Ok(())
}

/// A `kqueue`-backed selector.
pub struct Selector {
    queue: Queue,
    fd: RefCell<Option<OwnedFd>>,
    blocked: Arc<AtomicBool>,
    idle_duration: Cell<Duration>,
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "dragonfly",
    ))]
    waker_fd: Arc<OwnedFd>,
    #[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
    interrupt: Arc<Interrupt>,
    descriptors: Table<Descriptor>,
}

impl Selector {
    /// Creates a selector driven by `loop_fiber`.
    pub fn new(loop_fiber: FiberHandle) -> io::Result<Selector> {
        let fd = syscall!(kqueue())?;
        syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
        // SAFETY: `kqueue(2)` returned a fresh descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "dragonfly",
        ))]
        let waker_fd = {
            let duplicate = syscall!(fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 0))?;
            // SAFETY: `fcntl(F_DUPFD_CLOEXEC)` returned a fresh descriptor.
            Arc::new(unsafe { OwnedFd::from_raw_fd(duplicate) })
        };

        #[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
        let interrupt = {
            let interrupt = Arc::new(Interrupt::open()?);
            let mut kevent: libc::kevent = unsafe { mem::zeroed() };
            kevent.ident = interrupt.as_raw_fd() as _;
            kevent.filter = libc::EVFILT_READ;
            kevent.flags = libc::EV_ADD | libc::EV_CLEAR;
            syscall!(kevent(
                fd.as_raw_fd(),
                &kevent,
                1,
                ptr::null_mut(),
                0,
                ptr::null(),
            ))?;
            interrupt
        };

        Ok(Selector {
            queue: Queue::new(loop_fiber),
            fd: RefCell::new(Some(fd)),
            blocked: Arc::new(AtomicBool::new(false)),
            idle_duration: Cell::new(Duration::ZERO),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "dragonfly",
            ))]
            waker_fd,
            #[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
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
        #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "dragonfly",
        ))]
        {
            Waker::from_kqueue(self.waker_fd.clone(), self.blocked.clone())
        }
        #[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
        {
            Waker::from_interrupt(self.interrupt.clone(), self.blocked.clone())
        }
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
    pub fn io_wait(
        &self,
        fiber: &FiberHandle,
        fd: RawFd,
        events: Events,
    ) -> io::Result<Option<Events>> {
        let waiting = Waiting::new(fiber.clone(), events);
        self.register(fd as usize, &waiting)?;

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
    pub fn process_wait(
        &self,
        fiber: &FiberHandle,
        pid: pid_t,
        flags: c_int,
    ) -> io::Result<Option<ExitStatus>> {
        let waiting = Waiting::new(fiber.clone(), Events::EXIT);

        match self.register(pid as usize, &waiting) {
            Ok(()) => {}
            Err(error) if error.raw_os_error() == Some(libc::ESRCH) => {
                // Registering EVFILT_PROC for a zombie fails with ESRCH on
                // some BSDs even though WNOHANG may not reap it yet.
                process::process_prewait(pid)?;
                return process::process_status_wait(pid, flags);
            }
            Err(error) => return Err(error),
        }

        let _guard = WaitingGuard(&waiting);
        match self.queue.loop_yield() {
            Resume::Transfer => {
                if waiting.ready.get().is_empty() {
                    Ok(None)
                } else {
                    // The exit event can race the status becoming reapable.
                    process::process_prewait(pid)?;
                    process::process_status_wait(pid, flags)
                }
            }
            Resume::Raise(error) => Err(error),
        }
    }

    /// Reads at least `length` bytes from `fd` into `buffer`, waiting for
    /// readability between short reads. `Ok(0)` is end-of-file.
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

    /// Runs one selector cycle; see the crate documentation for the exact
    /// flush/poll/block ordering.
    pub fn select(&self, duration: Option<Duration>) -> io::Result<usize> {
        self.idle_duration.set(Duration::ZERO);

        let ready = self.queue.ready_flush();

        let mut events: [libc::kevent; MAX_EVENTS] = unsafe { mem::zeroed() };

        let mut count = self.wait_for_events(&mut events, Some(Duration::ZERO))?;

        if ready == 0 && count == 0 && !self.queue.is_ready() && duration != Some(Duration::ZERO) {
            let start = Instant::now();
            self.blocked.store(true, Ordering::Release);
            let result = self.wait_for_events(&mut events, duration);
            self.blocked.store(false, Ordering::Release);
            self.idle_duration.set(start.elapsed());
            count = result?;
        }

        // First pass: stage every fired filter into its identifier's mask,
        // so read and write arriving together dispatch as one walk.
        for event in events[..count].iter() {
            let state = event.udata as usize as *const Descriptor;
            if !state.is_null() {
                let state = unsafe { &*state };
                state
                    .ready_events
                    .set(state.ready_events.get() | events_from_kevent_filter(event.filter as i32));
            }
        }

        // Second pass: dispatch each touched identifier once. Wakeup
        // events carry no descriptor state and do not contribute to the
        // returned count.
        let mut observed = 0;
        for event in events[..count].iter() {
            let state = event.udata as usize as *const Descriptor;
            if !state.is_null() {
                observed += 1;
                self.dispatch(event.ident as usize, unsafe { &*state })?;
            } else {
                #[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
                self.interrupt.clear()?;
            }
        }

        Ok(observed)
    }

    fn wait_for_events(
        &self,
        events: &mut [libc::kevent; MAX_EVENTS],
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let fd = self.fd()?;

        let timespec = timeout.map(|timeout| libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as _,
        });
        let timespec = timespec
            .as_ref()
            .map(|timespec| timespec as *const libc::timespec)
            .unwrap_or(ptr::null());

        match syscall!(kevent(
            fd,
            ptr::null(),
            0,
            events.as_mut_ptr(),
            MAX_EVENTS as _,
            timespec,
        )) {
            Ok(count) => Ok(count as usize),
            Err(ref error) if error.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(error) => Err(error),
        }
    }

    fn register(&self, identifier: usize, waiting: &Waiting) -> io::Result<()> {
        let state = self.descriptors.lookup(identifier)?;
        let state = unsafe { state.as_ref() };

        state
            .waiting_events
            .set(state.waiting_events.get() | waiting.events);

        self.update(identifier, state)?;

        unsafe {
            state.list.prepend(waiting.link_ptr());
        }

        Ok(())
    }

    /// Arms one-shot filters for every event in the identifier's union
    /// mask. One-shot filters auto-disarm on fire, so this runs both at
    /// registration and after dispatch.
    fn update(&self, identifier: usize, state: &Descriptor) -> io::Result<()> {
        let waiting = state.waiting_events.get();

        let mut changes: [libc::kevent; 3] = unsafe { mem::zeroed() };
        let mut count = 0;

        if waiting.is_readable() {
            changes[count].ident = identifier as _;
            changes[count].filter = libc::EVFILT_READ;
            changes[count].flags = libc::EV_ADD | libc::EV_ONESHOT;
            changes[count].udata = state as *const Descriptor as _;
            count += 1;
        }

        if waiting.is_writable() {
            changes[count].ident = identifier as _;
            changes[count].filter = libc::EVFILT_WRITE;
            changes[count].flags = libc::EV_ADD | libc::EV_ONESHOT;
            changes[count].udata = state as *const Descriptor as _;
            count += 1;
        }

        if waiting.contains(Events::EXIT) {
            changes[count].ident = identifier as _;
            changes[count].filter = libc::EVFILT_PROC;
            changes[count].flags = libc::EV_ADD | libc::EV_ONESHOT;
            changes[count].fflags = libc::NOTE_EXIT;
            changes[count].udata = state as *const Descriptor as _;
            count += 1;
        }

        if count == 0 {
            return Ok(());
        }

        syscall!(kevent(
            self.fd()?,
            changes.as_ptr(),
            count as _,
            ptr::null_mut(),
            0,
            ptr::null(),
        ))?;

        state.registered_events.set(waiting);
        Ok(())
    }

    /// Walks one identifier's waiter list for its staged ready events, then
    /// re-arms from the survivors.
    fn dispatch(&self, identifier: usize, state: &Descriptor) -> io::Result<()> {
        let ready_events = state.ready_events.get();
        if ready_events.is_empty() {
            // Already dispatched via an earlier kevent for this identifier.
            return Ok(());
        }
        state.ready_events.set(Events::empty());

        // One-shot filters disarmed themselves when they fired.
        state.registered_events.set(Events::from_bits(
            state.registered_events.get().bits() & !ready_events.bits(),
        ));

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

        self.update(identifier, state)
    }
}

fn try_again(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::WouldBlock
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("kqueue::Selector")
            .field("descriptors", &self.descriptors)
            .field("blocked", &self.blocked.load(Ordering::Relaxed))
            .finish()
    }
}
