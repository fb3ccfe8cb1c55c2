//! Cross-thread wakeup handle.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::interrupt::Interrupt;

/// Wakes a selector blocked in its kernel wait from another thread.
///
/// Obtained from a selector via `waker()`; cheap to clone and safe to send
/// across threads. [`Waker::wake`] returns `Ok(true)` iff an interrupt was
/// actually delivered, i.e. the selector was blocked at that moment; after
/// it returns `true`, the pending `select` returns promptly.
#[derive(Clone)]
pub struct Waker {
    blocked: Arc<AtomicBool>,
    kind: Kind,
}

#[derive(Clone)]
enum Kind {
    /// eventfd or self-pipe registered with the selector.
    Interrupt(Arc<Interrupt>),
    /// Duplicated kqueue descriptor; waking triggers an `EVFILT_USER`
    /// event.
    #[cfg(all(
        any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "dragonfly",
        ),
        not(any(target_os = "linux", target_os = "android")),
    ))]
    KQueue(Arc<std::os::fd::OwnedFd>),
}

impl Waker {
    pub(crate) fn from_interrupt(interrupt: Arc<Interrupt>, blocked: Arc<AtomicBool>) -> Waker {
        Waker {
            blocked,
            kind: Kind::Interrupt(interrupt),
        }
    }

    #[cfg(all(
        any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "dragonfly",
        ),
        not(any(target_os = "linux", target_os = "android")),
    ))]
    pub(crate) fn from_kqueue(kq: Arc<std::os::fd::OwnedFd>, blocked: Arc<AtomicBool>) -> Waker {
        Waker {
            blocked,
            kind: Kind::KQueue(kq),
        }
    }

    /// Delivers an interrupt if the selector is blocked.
    pub fn wake(&self) -> io::Result<bool> {
        if !self.blocked.load(Ordering::Acquire) {
            return Ok(false);
        }

        match &self.kind {
            Kind::Interrupt(interrupt) => interrupt.signal()?,
            #[cfg(all(
                any(
                    target_os = "macos",
                    target_os = "ios",
                    target_os = "freebsd",
                    target_os = "dragonfly",
                ),
                not(any(target_os = "linux", target_os = "android")),
            ))]
            Kind::KQueue(kq) => {
                use std::os::fd::AsRawFd;
                crate::selector::kqueue::trigger_user_event(kq.as_raw_fd())?;
            }
        }

        Ok(true)
    }
}

impl fmt::Debug for Waker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waker")
            .field("blocked", &self.blocked.load(Ordering::Relaxed))
            .finish()
    }
}
