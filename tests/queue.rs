use std::cell::{Cell, RefCell};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use io_event::Resume;

mod util;

use util::{main_fiber, selectors, spawn, switch_to, Shared};

#[test]
fn pushed_fibers_run_in_push_order() {
    util::init();
    let main = main_fiber();

    for (name, selector) in selectors(&main) {
        let selector = Arc::new(Shared(selector));
        let order = Arc::new(Shared(RefCell::new(Vec::new())));

        let first = {
            let order = order.clone();
            spawn(&main, move || order.0.borrow_mut().push(1))
        };
        let second = {
            let order = order.clone();
            spawn(&main, move || order.0.borrow_mut().push(2))
        };

        selector.0.push(util::handle(&first));
        selector.0.push(util::handle(&second));
        assert!(selector.0.is_ready(), "{}", name);

        selector.0.select(Some(Duration::ZERO)).unwrap();

        assert_eq!(*order.0.borrow(), vec![1, 2], "{}", name);
        assert!(!selector.0.is_ready(), "{}", name);
    }
}

#[test]
fn flush_is_bounded_under_re_enqueue() {
    util::init();
    let main = main_fiber();

    for (name, selector) in selectors(&main) {
        let selector = Arc::new(Shared(selector));
        let cycles = Arc::new(Shared(Cell::new(0usize)));

        // A fiber that reschedules itself forever: each cycle must still
        // terminate, bounded by the queue tail observed on entry.
        let fiber = {
            let selector = selector.clone();
            let cycles = cycles.clone();
            spawn(&main, move || loop {
                cycles.0.set(cycles.0.get() + 1);
                selector.0.push(util::current_fiber());
                if let Resume::Raise(_) = selector.0.transfer() {
                    break;
                }
            })
        };

        selector.0.push(util::handle(&fiber));

        for expected in 1..=3usize {
            selector.0.select(Some(Duration::ZERO)).unwrap();
            assert_eq!(cycles.0.get(), expected, "{}", name);
        }

        let main_handle = util::handle(&main);
        let fiber_handle = util::handle(&fiber);
        selector.0.raise(
            &main_handle,
            &fiber_handle,
            io::Error::new(io::ErrorKind::Interrupted, "stop"),
        );
        assert!(!fiber.panicked(), "{}", name);
    }
}

#[test]
fn resume_schedules_the_caller_behind_the_target() {
    util::init();
    let main = main_fiber();

    for (name, selector) in selectors(&main) {
        let selector = Arc::new(Shared(selector));
        let order = Arc::new(Shared(RefCell::new(Vec::new())));

        let target = {
            let order = order.clone();
            spawn(&main, move || order.0.borrow_mut().push("target"))
        };

        let source = {
            let selector = selector.clone();
            let order = order.clone();
            let target_handle = util::handle(&target);
            spawn(&main, move || {
                order.0.borrow_mut().push("source:before");
                // Hands control to the target; the queue brings us back.
                selector.0.resume(&util::current_fiber(), &target_handle);
                order.0.borrow_mut().push("source:after");
            })
        };

        switch_to(&source);
        // The source parked itself on the ready queue when it resumed the
        // target; one cycle brings it back.
        selector.0.select(Some(Duration::ZERO)).unwrap();

        assert_eq!(
            *order.0.borrow(),
            vec!["source:before", "target", "source:after"],
            "{}",
            name
        );
        assert!(!source.panicked());
        assert!(!target.panicked());
    }
}

#[test]
fn yield_now_reaches_the_loop_and_returns() {
    util::init();
    let main = main_fiber();

    for (name, selector) in selectors(&main) {
        let selector = Arc::new(Shared(selector));
        let stages = Arc::new(Shared(Cell::new(0)));

        let fiber = {
            let selector = selector.clone();
            let stages = stages.clone();
            spawn(&main, move || {
                stages.0.set(1);
                selector.0.yield_now(&util::current_fiber());
                stages.0.set(2);
            })
        };

        switch_to(&fiber);
        assert_eq!(stages.0.get(), 1, "{}", name);

        selector.0.select(Some(Duration::ZERO)).unwrap();
        assert_eq!(stages.0.get(), 2, "{}", name);
    }
}
