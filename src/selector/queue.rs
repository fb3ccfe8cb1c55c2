//! The shared scheduler queue.
//!
//! Holds fibers that the event loop should transfer control to, in
//! cooperation with the loop fiber. Entries are pushed at the head and
//! processed from the tail, so pushes are LIFO but processing is FIFO.
//!
//! An entry is either owned by the queue (`Internal`, heap-allocated by
//! [`Queue::ready_push`] and freed on pop) or by the stack frame of a fiber
//! that scheduled itself (`Fiber`, removed by a drop guard when the frame
//! unwinds, exactly like the original `ensure` clause).

use std::cell::Cell;
use std::fmt;
use std::io;
use std::ptr;

use crate::fiber::{self, FiberHandle, Resume};

#[derive(Copy, Clone, PartialEq, Eq)]
enum Kind {
    Fiber,
    Internal,
}

struct Entry {
    head: Cell<*mut Entry>,
    tail: Cell<*mut Entry>,
    kind: Kind,
    fiber: FiberHandle,
}

impl Entry {
    fn new(kind: Kind, fiber: FiberHandle) -> Entry {
        Entry {
            head: Cell::new(ptr::null_mut()),
            tail: Cell::new(ptr::null_mut()),
            kind,
            fiber,
        }
    }
}

pub(crate) struct Queue {
    loop_fiber: FiberHandle,

    // Push to `waiting` (head), process from `ready` (tail).
    waiting: Cell<*mut Entry>,
    ready: Cell<*mut Entry>,
}

impl Queue {
    pub(crate) fn new(loop_fiber: FiberHandle) -> Queue {
        Queue {
            loop_fiber,
            waiting: Cell::new(ptr::null_mut()),
            ready: Cell::new(ptr::null_mut()),
        }
    }

    pub(crate) fn loop_fiber(&self) -> &FiberHandle {
        &self.loop_fiber
    }

    /// True if any fiber is queued for the next flush.
    pub(crate) fn is_ready(&self) -> bool {
        !self.ready.get().is_null()
    }

    /// Synchronously hands control to `fiber`. Not a scheduling decision:
    /// the current fiber is not queued anywhere.
    pub(crate) fn loop_resume(&self, fiber: &FiberHandle) -> Resume {
        fiber::transfer(fiber)
    }

    /// Synchronously hands control back to the loop fiber.
    pub(crate) fn loop_yield(&self) -> Resume {
        fiber::transfer(&self.loop_fiber)
    }

    /// Schedules `current` at the head of the queue, then transfers control
    /// to `fiber`. The queue entry lives in this stack frame and is removed
    /// when it returns or unwinds.
    pub(crate) fn resume(&self, current: &FiberHandle, fiber: &FiberHandle) -> Resume {
        let mut entry = Entry::new(Kind::Fiber, current.clone());
        let entry = &mut entry as *mut Entry;
        unsafe {
            self.push(entry);
        }
        let _guard = EntryGuard { queue: self, entry };
        fiber::transfer(fiber)
    }

    /// Like [`Queue::resume`], but raises `error` inside `fiber`.
    pub(crate) fn raise(
        &self,
        current: &FiberHandle,
        fiber: &FiberHandle,
        error: io::Error,
    ) -> Resume {
        let mut entry = Entry::new(Kind::Fiber, current.clone());
        let entry = &mut entry as *mut Entry;
        unsafe {
            self.push(entry);
        }
        let _guard = EntryGuard { queue: self, entry };
        fiber::raise(fiber, error)
    }

    /// Schedules `current` and yields to the loop fiber.
    pub(crate) fn yield_now(&self, current: &FiberHandle) -> Resume {
        let loop_fiber = self.loop_fiber.clone();
        self.resume(current, &loop_fiber)
    }

    /// Appends `fiber` to the ready queue; it will be transferred to on the
    /// next flush. The entry is owned by the queue.
    pub(crate) fn ready_push(&self, fiber: FiberHandle) {
        let entry = Box::into_raw(Box::new(Entry::new(Kind::Internal, fiber)));
        unsafe {
            self.push(entry);
        }
    }

    /// Transfers control to each queued fiber once, returning the number of
    /// entries processed.
    ///
    /// A resumed fiber may re-enqueue itself; processing stops once the
    /// entry that was at the head when the flush began has been handled, so
    /// the flush terminates even under constant re-enqueueing.
    pub(crate) fn ready_flush(&self) -> usize {
        let waiting_at_entry = self.waiting.get();
        let mut count = 0;

        while !self.ready.get().is_null() {
            let ready = self.ready.get();
            count += 1;

            let kind = unsafe { (*ready).kind };
            let fiber = unsafe {
                match kind {
                    Kind::Internal => {
                        // Queue-owned: unlink and free before the transfer;
                        // returning from `switch` will not remove it.
                        self.pop(ready);
                        Box::from_raw(ready).fiber
                    }
                    // Stack-owned: the owning fiber's guard removes it when
                    // its frame returns.
                    Kind::Fiber => (*ready).fiber.clone(),
                }
            };

            self.loop_resume(&fiber);

            if ready == waiting_at_entry {
                break;
            }
        }

        count
    }

    unsafe fn push(&self, entry: *mut Entry) {
        debug_assert!((*entry).head.get().is_null());
        debug_assert!((*entry).tail.get().is_null());

        let waiting = self.waiting.get();
        if !waiting.is_null() {
            (*waiting).head.set(entry);
            (*entry).tail.set(waiting);
        } else {
            self.ready.set(entry);
        }
        self.waiting.set(entry);
    }

    unsafe fn pop(&self, entry: *mut Entry) {
        let head = (*entry).head.get();
        let tail = (*entry).tail.get();

        if !head.is_null() {
            (*head).tail.set(tail);
        } else {
            self.waiting.set(tail);
        }

        if !tail.is_null() {
            (*tail).head.set(head);
        } else {
            self.ready.set(head);
        }

        (*entry).head.set(ptr::null_mut());
        (*entry).tail.set(ptr::null_mut());
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        // Free any internal entries still queued. Fiber entries are owned
        // by (still parked) fiber stacks and are not touched.
        let mut entry = self.waiting.get();
        while !entry.is_null() {
            let next = unsafe { (*entry).tail.get() };
            if unsafe { (*entry).kind } == Kind::Internal {
                unsafe {
                    self.pop(entry);
                    drop(Box::from_raw(entry));
                }
            }
            entry = next;
        }
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("ready", &self.is_ready())
            .finish()
    }
}

struct EntryGuard<'a> {
    queue: &'a Queue,
    entry: *mut Entry,
}

impl Drop for EntryGuard<'_> {
    fn drop(&mut self) {
        unsafe {
            self.queue.pop(self.entry);
        }
    }
}
