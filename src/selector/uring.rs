//! Completion-based selector built on Linux `io_uring`, with inline
//! read/write submission.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::process::ExitStatus;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use io_uring::{opcode, squeue, types, IoUring};
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

const URING_ENTRIES: u32 = 64;

/// CQE user-data tag for the interrupt eventfd's poll. Completion records
/// are boxed and aligned, so this value can never collide with one.
const INTERRUPT_DATA: u64 = 1;

/// liburing tags internal timeout completions with `-1`.
const TIMEOUT_DATA: u64 = u64::MAX;

/// Links one in-flight kernel submission to its waiter. Stable address
/// (boxed in the table); recycled through a free list.
#[repr(C)]
struct Completion {
    // Must stay first: free-list nodes are cast back to `Completion`.
    link: Link,
    waiting: Cell<*mut Waiting>,
}

impl Default for Completion {
    fn default() -> Completion {
        Completion {
            link: Link::new(),
            waiting: Cell::new(ptr::null_mut()),
        }
    }
}

/// One fiber waiting for a submission to complete. Lives on the waiting
/// fiber's stack; holds a forward pointer to its completion, nulled
/// symmetrically with the completion's back-pointer on either cancel path.
struct Waiting {
    completion: Cell<*mut Completion>,
    fiber: RefCell<Option<FiberHandle>>,
    result: Cell<i32>,
    // CQE flags ride along with the result; nothing consumes them yet.
    #[allow(dead_code)]
    flags: Cell<u32>,
}

impl Waiting {
    fn new(fiber: FiberHandle) -> Waiting {
        Waiting {
            completion: Cell::new(ptr::null_mut()),
            fiber: RefCell::new(Some(fiber)),
            result: Cell::new(0),
            flags: Cell::new(0),
        }
    }

    /// Detaches the waiting side: both pointers are nulled so neither side
    /// dereferences the other afterwards.
    fn cancel(&self) {
        let completion = self.completion.get();
        if !completion.is_null() {
            unsafe {
                (*completion).waiting.set(ptr::null_mut());
            }
            self.completion.set(ptr::null_mut());
        }
        self.fiber.replace(None);
    }
}

fn poll_flags_from_events(events: Events) -> u32 {
    let mut flags = libc::POLLHUP | libc::POLLERR;

    if events.is_readable() {
        flags |= libc::POLLIN;
    }
    if events.is_priority() {
        flags |= libc::POLLPRI;
    }
    if events.is_writable() {
        flags |= libc::POLLOUT;
    }

    flags as u32
}

fn events_from_poll_flags(flags: u32) -> Events {
    let flags = flags as libc::c_short;
    let mut events = Events::empty();

    // Hang-up and error fold into readability; see the epoll backend.
    if flags & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
        events |= Events::READABLE;
    }
    if flags & libc::POLLPRI != 0 {
        events |= Events::PRIORITY;
    }
    if flags & libc::POLLOUT != 0 {
        events |= Events::WRITABLE;
    }

    events
}

fn try_again_errno(errno: i32) -> bool {
    errno == libc::EAGAIN || errno == libc::EWOULDBLOCK
}

fn busy(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::WouldBlock || error.raw_os_error() == Some(libc::EBUSY)
}

/// Whether process_completions transfers to woken fibers directly (the
/// select path) or defers them to the ready queue (the unwind drain path,
/// where the current fiber must not transfer away).
#[derive(Copy, Clone)]
enum Wake {
    Transfer,
    Defer,
}

/// An `io_uring`-backed selector.
pub struct Selector {
    queue: Queue,
    ring: RefCell<Option<IoUring>>,
    /// Number of prepared submissions not yet handed to the kernel.
    pending: Cell<usize>,
    blocked: Arc<AtomicBool>,
    idle_duration: Cell<Duration>,
    interrupt: Arc<Interrupt>,
    interrupt_armed: Cell<bool>,
    completions: Table<Completion>,
    free_list: List,
}

impl Selector {
    /// Creates a selector driven by `loop_fiber`.
    pub fn new(loop_fiber: FiberHandle) -> io::Result<Selector> {
        let ring = IoUring::new(URING_ENTRIES)?;
        let interrupt = Arc::new(Interrupt::open()?);

        let selector = Selector {
            queue: Queue::new(loop_fiber),
            ring: RefCell::new(Some(ring)),
            pending: Cell::new(0),
            blocked: Arc::new(AtomicBool::new(false)),
            idle_duration: Cell::new(Duration::ZERO),
            interrupt,
            interrupt_armed: Cell::new(false),
            completions: Table::new(),
            free_list: List::new(),
        };

        selector.arm_interrupt()?;
        Ok(selector)
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
        self.ring.borrow_mut().take();
    }

    fn closed() -> io::Error {
        io::Error::from_raw_os_error(libc::EBADF)
    }

    /// Takes a completion record (preferring the free list), linking it to
    /// `waiting`.
    fn acquire(&self, waiting: &Waiting) -> io::Result<()> {
        let completion = match unsafe { self.free_list.pop_front() } {
            Some(node) => node as *mut Completion,
            None => self
                .completions
                .lookup(self.completions.limit())?
                .as_ptr(),
        };

        unsafe {
            (*completion).waiting.set(waiting as *const Waiting as *mut Waiting);
        }
        waiting.completion.set(completion);
        Ok(())
    }

    /// Detaches `completion` from its waiter and returns it to the free
    /// list.
    fn release(&self, completion: *mut Completion) {
        unsafe {
            let waiting = (*completion).waiting.get();
            if !waiting.is_null() {
                (*waiting).completion.set(ptr::null_mut());
                (*completion).waiting.set(ptr::null_mut());
            }
            self.free_list.prepend(completion as *mut Link);
        }
    }

    /// Queues `entry` on the submission ring, draining a full ring through
    /// submit-now (which may yield to the loop) until space is available.
    fn push_entry(&self, current: &FiberHandle, entry: &squeue::Entry) -> io::Result<()> {
        loop {
            let pushed = {
                let mut ring = self.ring.borrow_mut();
                let ring = ring.as_mut().ok_or_else(Selector::closed)?;
                // SAFETY: the parameters referenced by `entry` (buffers,
                // descriptors) outlive the submission: either the operation
                // completes, or the unwind guards cancel it and, for buffer
                // operations, drain the cancellation.
                let result = unsafe { ring.submission().push(entry) };
                result.is_ok()
            };

            if pushed {
                return Ok(());
            }

            self.submit_now(current)?;
        }
    }

    /// Bumps the pending counter; the submission is handed to the kernel by
    /// the next flush or blocking wait.
    fn submit_pending(&self) {
        self.pending.set(self.pending.get() + 1);
    }

    /// Submits pending operations, if any. A busy kernel (`EBUSY` /
    /// `EAGAIN`) is tolerated; the submissions stay queued for later.
    fn submit_flush(&self) -> io::Result<()> {
        if self.pending.get() == 0 {
            return Ok(());
        }

        let result = {
            let ring = self.ring.borrow();
            let ring = ring.as_ref().ok_or_else(Selector::closed)?;
            ring.submitter().submit()
        };

        match result {
            Ok(_) => {
                self.pending.set(0);
                Ok(())
            }
            Err(ref error) if busy(error) => Ok(()),
            Err(error) => Err(error),
        }
    }

    /// Submits immediately, cooperatively yielding to the loop until the
    /// kernel accepts the submissions.
    fn submit_now(&self, current: &FiberHandle) -> io::Result<()> {
        loop {
            let result = {
                let ring = self.ring.borrow();
                let ring = ring.as_ref().ok_or_else(Selector::closed)?;
                ring.submitter().submit()
            };

            match result {
                Ok(_) => {
                    self.pending.set(0);
                    return Ok(());
                }
                Err(ref error) if busy(error) => {
                    // The completion queue is saturated; let the loop drain
                    // it before retrying.
                    self.queue.yield_now(current).into_result()?;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Keeps the interrupt eventfd registered with the ring so a wakeup
    /// write produces a completion even while blocked in the kernel.
    fn arm_interrupt(&self) -> io::Result<()> {
        if self.interrupt_armed.get() {
            return Ok(());
        }

        let entry = opcode::PollAdd::new(
            types::Fd(self.interrupt.as_raw_fd()),
            libc::POLLIN as u32,
        )
        .build()
        .user_data(INTERRUPT_DATA);

        loop {
            let pushed = {
                let mut ring = self.ring.borrow_mut();
                let ring = ring.as_mut().ok_or_else(Selector::closed)?;
                // SAFETY: the poll references no caller memory.
                let result = unsafe { ring.submission().push(&entry) };
                result.is_ok()
            };

            if pushed {
                self.interrupt_armed.set(true);
                self.submit_pending();
                return Ok(());
            }

            // Ring full; submit without yielding (this runs on the loop
            // fiber) and retry, or give up until the next cycle.
            let result = {
                let ring = self.ring.borrow();
                let ring = ring.as_ref().ok_or_else(Selector::closed)?;
                ring.submitter().submit()
            };
            match result {
                Ok(_) => self.pending.set(0),
                Err(ref error) if busy(error) => return Ok(()),
                Err(error) => return Err(error),
            }
        }
    }

    /// Suspends `fiber` until at least one of `events` fires on `fd`,
    /// using `IORING_OP_POLL_ADD`.
    pub fn io_wait(
        &self,
        fiber: &FiberHandle,
        fd: RawFd,
        events: Events,
    ) -> io::Result<Option<Events>> {
        let flags = poll_flags_from_events(events);

        let waiting = Waiting::new(fiber.clone());
        self.acquire(&waiting)?;
        let _guard = PollGuard {
            selector: self,
            waiting: &waiting,
        };

        let entry = opcode::PollAdd::new(types::Fd(fd), flags)
            .build()
            .user_data(waiting.completion.get() as u64);
        self.push_entry(fiber, &entry)?;
        // A waiter is in no hurry; the submission rides along with the next
        // flush.
        self.submit_pending();

        match self.queue.loop_yield() {
            Resume::Raise(error) => Err(error),
            Resume::Transfer => {
                let result = waiting.result.get();
                if result < 0 {
                    Err(io::Error::from_raw_os_error(-result))
                } else if result > 0 {
                    // Poll can report events that were not requested; only
                    // the requested set (plus hang-up/error) leaks through.
                    Ok(Some(events_from_poll_flags(result as u32 & flags)))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Suspends `fiber` until process `pid` exits (via a pidfd poll), then
    /// reaps it.
    pub fn process_wait(
        &self,
        fiber: &FiberHandle,
        pid: pid_t,
        flags: c_int,
    ) -> io::Result<Option<ExitStatus>> {
        let pidfd = process::pidfd_open(pid)?;

        let waiting = Waiting::new(fiber.clone());
        self.acquire(&waiting)?;
        let _guard = PollGuard {
            selector: self,
            waiting: &waiting,
        };

        let poll = (libc::POLLIN | libc::POLLHUP | libc::POLLERR) as u32;
        let entry = opcode::PollAdd::new(types::Fd(pidfd.as_raw_fd()), poll)
            .build()
            .user_data(waiting.completion.get() as u64);
        self.push_entry(fiber, &entry)?;
        self.submit_pending();

        match self.queue.loop_yield() {
            Resume::Raise(error) => Err(error),
            Resume::Transfer => {
                if waiting.result.get() != 0 {
                    process::process_status_wait(pid, flags)
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Reads at least `length` bytes from `fd` into `buffer` through the
    /// ring. `Ok(0)` is end-of-file; `length == 0` performs a single
    /// non-blocking read without touching the ring (the ring would block
    /// until bytes arrive).
    pub fn io_read(
        &self,
        fiber: &FiberHandle,
        fd: RawFd,
        buffer: &mut [u8],
        length: usize,
    ) -> io::Result<usize> {
        if length == 0 {
            let _nonblock = NonblockGuard::new(fd)?;
            let result = syscall!(read(
                fd,
                buffer.as_mut_ptr() as *mut libc::c_void,
                buffer.len(),
            ))?;
            return Ok(result as usize);
        }

        let from = io_seekable(fd);
        self.read_loop(fiber, fd, buffer, length, from, false)
    }

    /// Like [`Selector::io_read`], but reads at the explicit file offset
    /// `from`, advancing it across short reads.
    pub fn io_pread(
        &self,
        fiber: &FiberHandle,
        fd: RawFd,
        buffer: &mut [u8],
        from: u64,
        length: usize,
    ) -> io::Result<usize> {
        self.read_loop(fiber, fd, buffer, length, from, true)
    }

    fn read_loop(
        &self,
        fiber: &FiberHandle,
        fd: RawFd,
        buffer: &mut [u8],
        length: usize,
        mut from: u64,
        advance: bool,
    ) -> io::Result<usize> {
        let mut offset = 0;
        let mut remaining = length;
        let mut total = 0;

        while offset < buffer.len() {
            let window = buffer.len() - offset;
            let entry = opcode::Read::new(
                types::Fd(fd),
                unsafe { buffer.as_mut_ptr().add(offset) },
                window as u32,
            )
            .offset(from as _)
            .build();

            let result = self.io_submit_once(fiber, entry, true)?;

            if result > 0 {
                let result = result as usize;
                total += result;
                offset += result;
                if advance {
                    from += result as u64;
                }
                if result >= remaining {
                    break;
                }
                remaining -= result;
            } else if result == 0 {
                break;
            } else if remaining > 0 && try_again_errno(-result) {
                self.io_wait(fiber, fd, Events::READABLE)?;
            } else {
                return Err(io::Error::from_raw_os_error(-result));
            }
        }

        Ok(total)
    }

    /// Writes at least `length` bytes from `buffer` to `fd` through the
    /// ring.
    pub fn io_write(
        &self,
        fiber: &FiberHandle,
        fd: RawFd,
        buffer: &[u8],
        length: usize,
    ) -> io::Result<usize> {
        let from = io_seekable(fd);
        self.write_loop(fiber, fd, buffer, length, from, false)
    }

    /// Like [`Selector::io_write`], but writes at the explicit file offset
    /// `from`, advancing it across short writes.
    pub fn io_pwrite(
        &self,
        fiber: &FiberHandle,
        fd: RawFd,
        buffer: &[u8],
        from: u64,
        length: usize,
    ) -> io::Result<usize> {
        self.write_loop(fiber, fd, buffer, length, from, true)
    }

    fn write_loop(
        &self,
        fiber: &FiberHandle,
        fd: RawFd,
        buffer: &[u8],
        length: usize,
        mut from: u64,
        advance: bool,
    ) -> io::Result<usize> {
        let mut offset = 0;
        let mut remaining = length;
        let mut total = 0;

        while offset < buffer.len() {
            let window = buffer.len() - offset;
            let entry = opcode::Write::new(
                types::Fd(fd),
                unsafe { buffer.as_ptr().add(offset) },
                window as u32,
            )
            .offset(from as _)
            .build();

            let result = self.io_submit_once(fiber, entry, false)?;

            if result > 0 {
                let result = result as usize;
                total += result;
                offset += result;
                if advance {
                    from += result as u64;
                }
                if result >= remaining {
                    break;
                }
                remaining -= result;
            } else if result == 0 {
                break;
            } else if remaining > 0 && try_again_errno(-result) {
                self.io_wait(fiber, fd, Events::WRITABLE)?;
            } else {
                return Err(io::Error::from_raw_os_error(-result));
            }
        }

        Ok(total)
    }

    /// Submits one buffer operation and parks until its completion arrives.
    /// Returns the raw CQE result (bytes transferred or negated errno).
    fn io_submit_once(
        &self,
        fiber: &FiberHandle,
        entry: squeue::Entry,
        now: bool,
    ) -> io::Result<i32> {
        let waiting = Waiting::new(fiber.clone());
        self.acquire(&waiting)?;
        let _guard = DrainGuard {
            selector: self,
            waiting: &waiting,
        };

        let entry = entry.user_data(waiting.completion.get() as u64);
        self.push_entry(fiber, &entry)?;
        if now {
            self.submit_now(fiber)?;
        } else {
            self.submit_pending();
        }

        self.queue.loop_yield().into_result()?;
        Ok(waiting.result.get())
    }

    /// Submits `IORING_OP_CLOSE` for `fd`, fire-and-forget: the result is
    /// of no practical use, so the caller does not wait for it.
    pub fn io_close(&self, fiber: &FiberHandle, fd: RawFd) -> io::Result<()> {
        let entry = opcode::Close::new(types::Fd(fd)).build().user_data(0);
        self.push_entry(fiber, &entry)?;
        self.submit_now(fiber)
    }

    /// Runs one selector cycle: flush submissions, flush ready fibers,
    /// process completions, then (only if completely idle) block for up to
    /// `duration` and process what arrived.
    pub fn select(&self, duration: Option<Duration>) -> io::Result<usize> {
        self.idle_duration.set(Duration::ZERO);

        self.arm_interrupt()?;
        self.submit_flush()?;

        let ready = self.queue.ready_flush();

        let mut count = self.process_completions(Wake::Transfer);

        if ready == 0 && count == 0 && !self.queue.is_ready() && duration != Some(Duration::ZERO) {
            // The non-blocking pass may have consumed the interrupt's
            // completion; it must be re-armed before going deaf in the
            // kernel.
            self.arm_interrupt()?;
            self.submit_flush()?;

            let start = Instant::now();
            self.blocked.store(true, Ordering::Release);
            let result = self.wait_for_completion(duration);
            self.blocked.store(false, Ordering::Release);
            self.idle_duration.set(start.elapsed());

            if result? {
                count = self.process_completions(Wake::Transfer);
            }
        }

        Ok(count)
    }

    /// Blocks until at least one completion is available or the timeout
    /// expires. `-ETIME` and `-EINTR` count as zero events.
    fn wait_for_completion(&self, duration: Option<Duration>) -> io::Result<bool> {
        let result = {
            let ring = self.ring.borrow();
            let ring = ring.as_ref().ok_or_else(Selector::closed)?;
            match duration {
                None => ring.submitter().submit_and_wait(1),
                Some(duration) => {
                    let timespec = types::Timespec::new()
                        .sec(duration.as_secs())
                        .nsec(duration.subsec_nanos());
                    let args = types::SubmitArgs::new().timespec(&timespec);
                    ring.submitter().submit_with_args(1, &args)
                }
            }
        };

        match result {
            Ok(_) => Ok(true),
            Err(ref error) if error.raw_os_error() == Some(libc::ETIME) => Ok(false),
            Err(ref error) if error.kind() == io::ErrorKind::Interrupted => Ok(false),
            // A saturated completion queue means there is definitely
            // something to process.
            Err(ref error) if busy(error) => Ok(true),
            Err(error) => Err(error),
        }
    }

    /// Drains the completion queue. For each completion still attached to
    /// a waiter: record the result, recycle the record, and wake the
    /// fiber. Cancelled (`user_data == 0`) and timeout completions are
    /// simply consumed.
    fn process_completions(&self, wake: Wake) -> usize {
        let harvested: Vec<(u64, i32, u32)> = {
            let mut ring = self.ring.borrow_mut();
            let ring = match ring.as_mut() {
                Some(ring) => ring,
                None => return 0,
            };
            ring.completion()
                .map(|cqe| (cqe.user_data(), cqe.result(), cqe.flags()))
                .collect()
        };

        let mut completed = 0;

        for (user_data, result, flags) in harvested {
            // Dropped completions (cancelled, fire-and-forget, timeouts)
            // and interrupt wakeups are not application events.
            if user_data == 0 || user_data == TIMEOUT_DATA {
                continue;
            }

            if user_data == INTERRUPT_DATA {
                self.interrupt_armed.set(false);
                let _ = self.interrupt.clear();
                continue;
            }

            completed += 1;

            let completion = user_data as *mut Completion;
            let waiting = unsafe { (*completion).waiting.get() };

            if !waiting.is_null() {
                unsafe {
                    (*waiting).result.set(result);
                    (*waiting).flags.set(flags);
                }
            }

            // Marks the operation complete before the fiber runs.
            self.release(completion);

            if !waiting.is_null() {
                let fiber = unsafe { (*waiting).fiber.borrow().clone() };
                if let Some(fiber) = fiber {
                    match wake {
                        Wake::Transfer => {
                            self.queue.loop_resume(&fiber);
                        }
                        Wake::Defer => {
                            self.queue.ready_push(fiber);
                        }
                    }
                }
            }
        }

        completed
    }

    /// Waits until `waiting`'s completion has been observed, deferring any
    /// foreign completions to the ready queue. Called while unwinding a
    /// cancelled buffer operation: the kernel must be done with the buffer
    /// before the frame that owns it returns.
    fn drain(&self, waiting: &Waiting) -> io::Result<()> {
        while !waiting.completion.get().is_null() {
            let result = {
                let ring = self.ring.borrow();
                let ring = ring.as_ref().ok_or_else(Selector::closed)?;
                ring.submitter().submit_and_wait(1)
            };

            match result {
                Ok(_) => {}
                Err(ref error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(ref error) if busy(error) => {}
                Err(error) => return Err(error),
            }

            self.process_completions(Wake::Defer);
        }

        Ok(())
    }

    /// Submits an asynchronous cancel for `waiting`'s completion. The
    /// cancel itself carries null user-data, so its own completion is
    /// dropped on harvest.
    fn submit_cancel(&self, current: &FiberHandle, waiting: &Waiting) -> io::Result<()> {
        let completion = waiting.completion.get();
        if completion.is_null() {
            return Ok(());
        }

        let entry = opcode::AsyncCancel::new(completion as u64)
            .build()
            .user_data(0);
        self.push_entry(current, &entry)?;
        self.submit_now(current)
    }
}

/// Unwind guard for poll waits: cancellation is fire-and-forget since no
/// caller memory is referenced by the submission.
struct PollGuard<'a> {
    selector: &'a Selector,
    waiting: &'a Waiting,
}

impl Drop for PollGuard<'_> {
    fn drop(&mut self) {
        if !self.waiting.completion.get().is_null() {
            if let Some(fiber) = self.waiting.fiber.borrow().clone() {
                if let Err(error) = self.selector.submit_cancel(&fiber, self.waiting) {
                    log::warn!("failed to cancel in-flight poll: {}", error);
                }
            }
        }
        self.waiting.cancel();
    }
}

/// Unwind guard for buffer operations: cancel, then block until the kernel
/// has given the buffer back.
struct DrainGuard<'a> {
    selector: &'a Selector,
    waiting: &'a Waiting,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if !self.waiting.completion.get().is_null() {
            // Detach the fiber first so the drain below cannot requeue the
            // very fiber that is unwinding.
            let fiber = self.waiting.fiber.borrow_mut().take();
            if let Some(fiber) = fiber {
                let cancelled = self
                    .selector
                    .submit_cancel(&fiber, self.waiting)
                    .and_then(|()| self.selector.drain(self.waiting));
                if let Err(error) = cancelled {
                    log::error!("failed to drain cancelled operation: {}", error);
                }
            }
        }
        self.waiting.cancel();
    }
}

fn io_seekable(fd: RawFd) -> u64 {
    // Streaming descriptors reject explicit offsets; `-1` means "use the
    // file position" for seekable ones.
    if syscall!(lseek(fd, 0, libc::SEEK_CUR)).is_err() {
        0
    } else {
        u64::MAX
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("uring::Selector")
            .field("pending", &self.pending.get())
            .field("completions", &self.completions)
            .field("blocked", &self.blocked.load(Ordering::Relaxed))
            .finish()
    }
}
