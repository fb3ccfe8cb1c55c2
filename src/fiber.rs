//! The fiber transfer shim.
//!
//! The host runtime owns the fiber primitive; the selector only needs to
//! transfer control to a fiber, raise an error inside it, and ask whether it
//! is still alive. This module abstracts exactly that surface.

use std::io;
use std::sync::Arc;

/// The payload delivered through a control transfer.
///
/// A fiber suspended at a transfer point receives a `Resume` when control
/// comes back to it: either a plain transfer, or an error raised by another
/// fiber which the suspension point is expected to propagate.
#[derive(Debug)]
pub enum Resume {
    /// Normal transfer of control.
    Transfer,
    /// An error was raised on the fiber; the operation it was parked in
    /// unwinds and returns this error.
    Raise(io::Error),
}

impl Resume {
    /// Converts the resumption into a result, mapping `Raise` to `Err`.
    pub fn into_result(self) -> io::Result<()> {
        match self {
            Resume::Transfer => Ok(()),
            Resume::Raise(error) => Err(error),
        }
    }
}

/// A handle to a cooperative user-level task.
///
/// Implementations are provided by the host runtime. All fibers sharing a
/// selector run on one OS thread (or under one external lock); `switch` is
/// only ever called from within that serialization domain, but handles are
/// also carried across threads by the worker pool, hence the `Send + Sync`
/// bound.
pub trait Fiber: Send + Sync {
    /// Returns true while the fiber can still receive a transfer.
    fn is_alive(&self) -> bool;

    /// Switches control to this fiber, delivering `resume` to its suspension
    /// point. Returns the payload delivered when control next comes back to
    /// the calling fiber.
    ///
    /// Switching to a dead fiber is a no-op returning [`Resume::Transfer`].
    fn switch(&self, resume: Resume) -> Resume;
}

/// A shared, clonable fiber handle.
pub type FiberHandle = Arc<dyn Fiber>;

/// Transfers control to `fiber` if it is still alive.
///
/// Dead fibers are skipped, mirroring the host runtime contract that
/// operating on a dead fiber returns immediately.
pub(crate) fn transfer(fiber: &FiberHandle) -> Resume {
    if fiber.is_alive() {
        fiber.switch(Resume::Transfer)
    } else {
        Resume::Transfer
    }
}

/// Raises `error` inside `fiber` if it is still alive.
pub(crate) fn raise(fiber: &FiberHandle, error: io::Error) -> Resume {
    if fiber.is_alive() {
        fiber.switch(Resume::Raise(error))
    } else {
        Resume::Transfer
    }
}
