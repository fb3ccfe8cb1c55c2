//! A growable table of lazily-allocated elements keyed by small integers.
//!
//! File descriptors and process ids are small non-negative integers, so a
//! sparse vector gives O(1) lookup without hashing. Elements are boxed:
//! their addresses are stable for the lifetime of the entry, which lets the
//! selectors hand out raw pointers to per-descriptor state (kqueue stores
//! them in `udata`, io_uring in completion records).

use std::cell::{Cell, UnsafeCell};
use std::fmt;
use std::io;
use std::mem;
use std::ptr::NonNull;

const DEFAULT_COUNT: usize = 128;
const MAXIMUM_COUNT: usize = usize::MAX / mem::size_of::<usize>();

/// A sparse `index -> Box<T>` table.
///
/// `lookup` grows the table and allocates the element on first reference;
/// `limit` tracks one past the largest index seen and never decreases
/// except through `truncate`. Single-threaded; lookups return raw pointers
/// precisely so that callers can park on the entry across fiber transfers
/// without holding a borrow.
pub(crate) struct Table<T> {
    slots: UnsafeCell<Vec<Option<Box<T>>>>,
    limit: Cell<usize>,
}

impl<T> Table<T> {
    pub(crate) fn new() -> Table<T> {
        let mut slots = Vec::new();
        slots.resize_with(DEFAULT_COUNT, || None);
        Table {
            slots: UnsafeCell::new(slots),
            limit: Cell::new(0),
        }
    }

    /// One past the largest index referenced so far.
    pub(crate) fn limit(&self) -> usize {
        self.limit.get()
    }

    /// Returns the element at `index`, allocating it if necessary.
    ///
    /// The pointer stays valid until `truncate` drops the entry or the
    /// table itself is dropped.
    pub(crate) fn lookup(&self, index: usize) -> io::Result<NonNull<T>>
    where
        T: Default,
    {
        let count = index
            .checked_add(1)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))?;
        if count > MAXIMUM_COUNT {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }

        // No lookup result outlives the boxes themselves, so growing the
        // spine is safe; the single-threaded discipline rules out
        // re-entrant access while this mutable borrow is live.
        let slots = unsafe { &mut *self.slots.get() };

        if count > slots.len() {
            let mut grown = slots.len().max(DEFAULT_COUNT);
            while grown < count {
                if grown > MAXIMUM_COUNT / 2 {
                    grown = MAXIMUM_COUNT;
                    break;
                }
                grown *= 2;
            }
            slots.resize_with(grown, || None);
        }

        let slot = &mut slots[index];
        if slot.is_none() {
            *slot = Some(Box::new(T::default()));
            if count > self.limit.get() {
                self.limit.set(count);
            }
        }

        Ok(unsafe { NonNull::new_unchecked(&mut **slot.as_mut().unwrap()) })
    }

    /// Drops every element at `new_limit` or above.
    ///
    /// Entries hand out stable pointers, so this must only run when no
    /// waiter can still reference the dropped tail.
    #[allow(dead_code)]
    pub(crate) fn truncate(&self, new_limit: usize) {
        if new_limit >= self.limit.get() {
            return;
        }

        let slots = unsafe { &mut *self.slots.get() };
        for slot in slots[new_limit..self.limit.get()].iter_mut() {
            *slot = None;
        }
        self.limit.set(new_limit);
    }

    /// Visits every allocated element in `[0, limit)`.
    pub(crate) fn each(&self, mut f: impl FnMut(&T)) {
        let slots = unsafe { &*self.slots.get() };
        for slot in slots[..self.limit.get()].iter() {
            if let Some(element) = slot {
                f(element);
            }
        }
    }
}

impl<T> fmt::Debug for Table<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut allocated = 0;
        self.each(|_| allocated += 1);
        f.debug_struct("Table")
            .field("limit", &self.limit.get())
            .field("allocated", &allocated)
            .finish()
    }
}
