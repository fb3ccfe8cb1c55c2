//! Selector construction and the backend-common surface.
//!
//! Backend choice is a tagged variant made at construction time:
//! [`Selector::new`] probes the richest backend the running kernel
//! supports and falls back when a probe fails (an `io_uring` built at
//! compile time may still be absent at run time).

use std::io;
use std::os::fd::RawFd;
use std::process::ExitStatus;
use std::time::Duration;

use libc::{c_int, pid_t};

use crate::event::Events;
use crate::fiber::{FiberHandle, Resume};
use crate::waker::Waker;

pub(crate) mod queue;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod epoll;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
))]
pub mod kqueue;

#[cfg(target_os = "linux")]
pub mod uring;

/// Sets `O_NONBLOCK` on `fd` if not already set, returning the prior flags.
pub fn nonblock_set(fd: RawFd) -> io::Result<c_int> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL, 0))?;
    if flags & libc::O_NONBLOCK == 0 {
        syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
    }
    Ok(flags)
}

/// Restores the flag state captured by [`nonblock_set`].
pub fn nonblock_restore(fd: RawFd, flags: c_int) -> io::Result<()> {
    // Only needed when the flag was not set before.
    if flags & libc::O_NONBLOCK == 0 {
        syscall!(fcntl(fd, libc::F_SETFL, flags))?;
    }
    Ok(())
}

/// Runs `f` with `O_NONBLOCK` set on `fd`, restoring the exact prior state
/// afterwards.
pub fn nonblock<R>(fd: RawFd, f: impl FnOnce() -> R) -> io::Result<R> {
    let _guard = NonblockGuard::new(fd)?;
    Ok(f())
}

pub(crate) struct NonblockGuard {
    fd: RawFd,
    flags: c_int,
}

impl NonblockGuard {
    pub(crate) fn new(fd: RawFd) -> io::Result<NonblockGuard> {
        let flags = nonblock_set(fd)?;
        Ok(NonblockGuard { fd, flags })
    }
}

impl Drop for NonblockGuard {
    fn drop(&mut self) {
        let _ = nonblock_restore(self.fd, self.flags);
    }
}

macro_rules! dispatch {
    ($self: expr, $inner: ident => $body: expr) => {
        match $self {
            #[cfg(target_os = "linux")]
            Selector::Uring($inner) => $body,
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Selector::Epoll($inner) => $body,
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly",
            ))]
            Selector::KQueue($inner) => $body,
        }
    };
}

/// An event selector with a backend chosen at construction time.
///
/// All backends implement the same contract; see the individual modules
/// for the kernel mechanics. Methods that schedule the calling fiber take
/// its handle explicitly, as the host runtime owns the notion of "current
/// fiber".
#[derive(Debug)]
pub enum Selector {
    /// Completion-based Linux backend.
    #[cfg(target_os = "linux")]
    Uring(uring::Selector),
    /// Readiness-based Linux backend.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Epoll(epoll::Selector),
    /// Readiness-based BSD backend.
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly",
    ))]
    KQueue(kqueue::Selector),
}

impl Selector {
    /// Creates a selector with the best backend the running kernel
    /// supports.
    pub fn new(loop_fiber: FiberHandle) -> io::Result<Selector> {
        #[cfg(target_os = "linux")]
        {
            match uring::Selector::new(loop_fiber.clone()) {
                Ok(selector) => return Ok(Selector::Uring(selector)),
                Err(error) => {
                    log::warn!("io_uring unavailable, falling back to epoll: {}", error);
                }
            }
        }

        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            epoll::Selector::new(loop_fiber).map(Selector::Epoll)
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
            kqueue::Selector::new(loop_fiber).map(Selector::KQueue)
        }
    }

    /// The event loop fiber this selector transfers to on yield.
    pub fn loop_fiber(&self) -> FiberHandle {
        dispatch!(self, inner => inner.loop_fiber())
    }

    /// Real time spent in the most recent blocking kernel wait, in
    /// seconds. Zeroed at the top of every [`Selector::select`].
    pub fn idle_duration(&self) -> f64 {
        dispatch!(self, inner => inner.idle_duration())
    }

    /// Transfers control to the loop fiber.
    pub fn transfer(&self) -> Resume {
        dispatch!(self, inner => inner.transfer())
    }

    /// Schedules `current` at the head of the ready queue, then transfers
    /// control to `fiber`.
    pub fn resume(&self, current: &FiberHandle, fiber: &FiberHandle) -> Resume {
        dispatch!(self, inner => inner.resume(current, fiber))
    }

    /// Schedules `current`, then raises `error` inside `fiber`.
    pub fn raise(&self, current: &FiberHandle, fiber: &FiberHandle, error: io::Error) -> Resume {
        dispatch!(self, inner => inner.raise(current, fiber, error))
    }

    /// Schedules `current` and yields to the loop fiber.
    pub fn yield_now(&self, current: &FiberHandle) -> Resume {
        dispatch!(self, inner => inner.yield_now(current))
    }

    /// Appends `fiber` to the ready queue for the next cycle.
    pub fn push(&self, fiber: FiberHandle) {
        dispatch!(self, inner => inner.push(fiber))
    }

    /// True if fibers are queued for the next cycle.
    pub fn is_ready(&self) -> bool {
        dispatch!(self, inner => inner.is_ready())
    }

    /// Runs one selector cycle; returns the number of kernel events
    /// observed. `None` blocks indefinitely, `Some(Duration::ZERO)` polls.
    pub fn select(&self, duration: Option<Duration>) -> io::Result<usize> {
        dispatch!(self, inner => inner.select(duration))
    }

    /// Returns a handle that can wake this selector from another thread.
    pub fn waker(&self) -> Waker {
        dispatch!(self, inner => inner.waker())
    }

    /// Wakes the selector if it is blocked in the kernel; returns whether
    /// an interrupt was actually delivered.
    pub fn wakeup(&self) -> io::Result<bool> {
        dispatch!(self, inner => inner.wakeup())
    }

    /// Closes the selector. Idempotent; double-close is a no-op.
    pub fn close(&self) {
        dispatch!(self, inner => inner.close())
    }

    /// Suspends `fiber` until at least one of `events` fires on `fd`.
    pub fn io_wait(
        &self,
        fiber: &FiberHandle,
        fd: RawFd,
        events: Events,
    ) -> io::Result<Option<Events>> {
        dispatch!(self, inner => inner.io_wait(fiber, fd, events))
    }

    /// Suspends `fiber` until process `pid` becomes reapable, then reaps
    /// it without hanging.
    pub fn process_wait(
        &self,
        fiber: &FiberHandle,
        pid: pid_t,
        flags: c_int,
    ) -> io::Result<Option<ExitStatus>> {
        dispatch!(self, inner => inner.process_wait(fiber, pid, flags))
    }

    /// Reads at least `length` bytes from `fd` into `buffer`; `Ok(0)` is
    /// end-of-file.
    pub fn io_read(
        &self,
        fiber: &FiberHandle,
        fd: RawFd,
        buffer: &mut [u8],
        length: usize,
    ) -> io::Result<usize> {
        dispatch!(self, inner => inner.io_read(fiber, fd, buffer, length))
    }

    /// Writes at least `length` bytes from `buffer` to `fd`.
    pub fn io_write(
        &self,
        fiber: &FiberHandle,
        fd: RawFd,
        buffer: &[u8],
        length: usize,
    ) -> io::Result<usize> {
        dispatch!(self, inner => inner.io_write(fiber, fd, buffer, length))
    }

    /// Reads at the explicit file offset `from`. Only the completion-based
    /// backend supports this.
    pub fn io_pread(
        &self,
        fiber: &FiberHandle,
        fd: RawFd,
        buffer: &mut [u8],
        from: u64,
        length: usize,
    ) -> io::Result<usize> {
        match self {
            #[cfg(target_os = "linux")]
            Selector::Uring(inner) => inner.io_pread(fiber, fd, buffer, from, length),
            _ => Err(unsupported()),
        }
    }

    /// Writes at the explicit file offset `from`. Only the completion-based
    /// backend supports this.
    pub fn io_pwrite(
        &self,
        fiber: &FiberHandle,
        fd: RawFd,
        buffer: &[u8],
        from: u64,
        length: usize,
    ) -> io::Result<usize> {
        match self {
            #[cfg(target_os = "linux")]
            Selector::Uring(inner) => inner.io_pwrite(fiber, fd, buffer, from, length),
            _ => Err(unsupported()),
        }
    }

    /// Closes `fd` asynchronously, without waiting for the result. Only
    /// the completion-based backend supports this.
    pub fn io_close(&self, fiber: &FiberHandle, fd: RawFd) -> io::Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            Selector::Uring(inner) => inner.io_close(fiber, fd),
            _ => Err(unsupported()),
        }
    }
}

fn unsupported() -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, "not a completion-based selector")
}
