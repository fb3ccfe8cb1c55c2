//! An intrusive, circular, doubly-linked list with a sentinel node.
//!
//! Nodes embed a [`Link`] as their first field and are linked in place; the
//! list never owns its nodes. Waiter records use this to get O(1) insertion
//! and removal without allocating in the wait path: the node lives on the
//! parked fiber's stack and is unlinked when the wait returns or unwinds.
//!
//! All access is single-threaded (the selector's serialization domain).
//! A linked node must not move until it is popped.

use std::cell::Cell;
use std::fmt;
use std::ptr;

/// The linkage embedded in every node, and the sentinel itself.
///
/// An unlinked node has null pointers. Following `tail` from
/// `sentinel.tail` visits nodes in order: prepended nodes first, appended
/// nodes last, ending back at the sentinel.
#[repr(C)]
pub(crate) struct Link {
    head: Cell<*mut Link>,
    tail: Cell<*mut Link>,
}

impl Link {
    pub(crate) const fn new() -> Link {
        Link {
            head: Cell::new(ptr::null_mut()),
            tail: Cell::new(ptr::null_mut()),
        }
    }

    pub(crate) fn is_linked(&self) -> bool {
        !self.head.get().is_null()
    }

    pub(crate) fn tail(&self) -> *mut Link {
        self.tail.get()
    }

    /// Inserts `node` on the head side of `base`.
    ///
    /// With the sentinel as `base` this is an append (visited last); with a
    /// regular node as `base` it places a marker that is visited just
    /// before `base`, which survives removal of `base` itself.
    pub(crate) unsafe fn append(base: *mut Link, node: *mut Link) {
        debug_assert!(!(*node).is_linked());

        let head = (*base).head.get();
        (*node).tail.set(base);
        (*node).head.set(head);
        (*base).head.set(node);
        (*head).tail.set(node);
    }

    /// Inserts `node` on the tail side of `base` (visited first when `base`
    /// is the sentinel).
    pub(crate) unsafe fn prepend(base: *mut Link, node: *mut Link) {
        debug_assert!(!(*node).is_linked());

        let tail = (*base).tail.get();
        (*node).head.set(base);
        (*node).tail.set(tail);
        (*base).tail.set(node);
        (*tail).head.set(node);
    }

    /// Unlinks `node`, nulling its pointers.
    pub(crate) unsafe fn pop(node: *mut Link) {
        debug_assert!((*node).is_linked());

        let head = (*node).head.get();
        let tail = (*node).tail.get();
        (*head).tail.set(tail);
        (*tail).head.set(head);
        (*node).head.set(ptr::null_mut());
        (*node).tail.set(ptr::null_mut());
    }

    /// Unlinks `node` if it is linked.
    pub(crate) unsafe fn remove(node: *mut Link) {
        if (*node).is_linked() {
            Link::pop(node);
        }
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("linked", &self.is_linked())
            .finish()
    }
}

/// A list head: a sentinel [`Link`].
///
/// The sentinel is self-referential, so it is initialized lazily on first
/// use; an untouched list compares empty.
pub(crate) struct List {
    sentinel: Link,
}

impl List {
    pub(crate) const fn new() -> List {
        List {
            sentinel: Link::new(),
        }
    }

    pub(crate) fn sentinel(&self) -> *mut Link {
        &self.sentinel as *const Link as *mut Link
    }

    fn ensure_init(&self) {
        if self.sentinel.head.get().is_null() {
            let sentinel = self.sentinel();
            self.sentinel.head.set(sentinel);
            self.sentinel.tail.set(sentinel);
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.sentinel.head.get() == self.sentinel.tail.get()
    }

    /// First node in iteration order, or the sentinel when empty.
    pub(crate) fn front(&self) -> *mut Link {
        self.ensure_init();
        self.sentinel.tail.get()
    }

    #[allow(dead_code)] // Not used by every backend.
    pub(crate) unsafe fn append(&self, node: *mut Link) {
        self.ensure_init();
        Link::append(self.sentinel(), node);
    }

    pub(crate) unsafe fn prepend(&self, node: *mut Link) {
        self.ensure_init();
        Link::prepend(self.sentinel(), node);
    }

    /// Unlinks and returns the first node, if any.
    #[allow(dead_code)] // Not used by every backend.
    pub(crate) unsafe fn pop_front(&self) -> Option<*mut Link> {
        if self.is_empty() {
            return None;
        }

        let node = self.front();
        Link::pop(node);
        Some(node)
    }

    /// Walks the list front to back, calling `f` with each node.
    ///
    /// The list must not be modified during the walk; dispatch paths that
    /// mutate mid-walk use an explicit marker node instead.
    pub(crate) unsafe fn for_each(&self, mut f: impl FnMut(*mut Link)) {
        self.ensure_init();
        let sentinel = self.sentinel();
        let mut node = self.sentinel.tail.get();
        while node != sentinel {
            let next = (*node).tail.get();
            f(node);
            node = next;
        }
    }
}

impl fmt::Debug for List {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut length = 0;
        unsafe {
            self.for_each(|_| length += 1);
        }
        f.debug_struct("List").field("length", &length).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{Link, List};

    #[repr(C)]
    struct Item {
        link: Link,
        value: u32,
    }

    impl Item {
        fn new(value: u32) -> Item {
            Item {
                link: Link::new(),
                value,
            }
        }

        fn link(&self) -> *mut Link {
            &self.link as *const Link as *mut Link
        }
    }

    fn collect(list: &List) -> Vec<u32> {
        let mut values = Vec::new();
        unsafe {
            list.for_each(|node| {
                let item = node as *const Item;
                values.push((*item).value);
            });
        }
        values
    }

    #[test]
    fn starts_empty() {
        let list = List::new();
        assert!(list.is_empty());
        assert_eq!(collect(&list), Vec::<u32>::new());
    }

    #[test]
    fn append_is_fifo_prepend_is_lifo() {
        let list = List::new();
        let a = Item::new(1);
        let b = Item::new(2);
        let c = Item::new(3);

        unsafe {
            list.append(a.link());
            list.append(b.link());
            list.prepend(c.link());
        }

        assert_eq!(collect(&list), vec![3, 1, 2]);

        unsafe {
            Link::pop(a.link());
        }
        assert_eq!(collect(&list), vec![3, 2]);
        assert!(!a.link.is_linked());

        unsafe {
            Link::pop(b.link());
            Link::pop(c.link());
        }
        assert!(list.is_empty());
    }

    #[test]
    fn marker_survives_removal_of_its_anchor() {
        let list = List::new();
        let a = Item::new(1);
        let b = Item::new(2);

        unsafe {
            list.append(a.link());
            list.append(b.link());

            // Place a marker just before `a`, then remove `a`; the marker
            // now leads to `b`.
            let marker = Link::new();
            let marker_ptr = &marker as *const Link as *mut Link;
            Link::append(a.link(), marker_ptr);
            Link::pop(a.link());

            let next = marker.tail();
            assert_eq!(next, b.link());
            Link::pop(marker_ptr);
        }

        assert_eq!(collect(&list), vec![2]);
    }

    #[test]
    fn remove_tolerates_unlinked_nodes() {
        let a = Item::new(1);
        unsafe {
            Link::remove(a.link());
        }
        assert!(!a.link.is_linked());
    }
}
