//! Event-driven I/O selectors for cooperative fibers.
//!
//! This crate multiplexes user-level cooperative tasks ("fibers") over
//! operating-system readiness and completion primitives. Three
//! interchangeable selector backends implement a uniform contract:
//!
//! * [`selector::uring`]: completion-based, Linux `io_uring`, with inline
//!   read/write submission.
//! * [`selector::epoll`]: readiness-based, Linux `epoll`.
//! * [`selector::kqueue`]: readiness-based, BSD/macOS `kqueue`, including
//!   process-exit events.
//!
//! A fiber parks itself on the selector with [`Selector::io_wait`] (or
//! `process_wait`, `io_read`, `io_write`) and transfers control to the event
//! loop fiber. The loop fiber drives [`Selector::select`], which drains the
//! ready queue, harvests kernel events, and transfers control back to each
//! woken fiber in turn.
//!
//! The [`worker_pool`] module offloads uncancellable blocking operations
//! onto OS threads while preserving cooperative cancellation semantics.
//!
//! # Threading model
//!
//! A selector and all fibers sharing it run on one OS thread; suspension
//! happens only at explicit transfer points. [`Waker`] and
//! [`worker_pool::WorkerPool`] are the only types intended to cross
//! threads. The selector must outlive every fiber parked on it: waiter
//! records live on the parked fiber's stack and are unlinked when the wait
//! returns or unwinds.

#![cfg(unix)]
#![deny(missing_debug_implementations)]

#[macro_use]
mod macros;

pub mod event;
pub mod fiber;
pub mod process;
pub mod selector;
pub mod worker_pool;

mod interrupt;
mod list;
mod table;
mod waker;

pub use event::Events;
pub use fiber::{Fiber, FiberHandle, Resume};
pub use selector::{nonblock, Selector};
pub use waker::Waker;
pub use worker_pool::WorkerPool;
