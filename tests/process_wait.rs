use std::cell::Cell;
use std::io;
use std::process::Command;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use io_event::Selector;

mod util;

use util::{main_fiber, selectors, spawn, switch_to, Shared};

fn run_until(selector: &Selector, done: impl Fn() -> bool) {
    for _ in 0..100 {
        if done() {
            return;
        }
        selector.select(Some(Duration::from_millis(100))).unwrap();
    }
    panic!("selector never produced the expected events");
}

#[test]
fn reaps_exit_status_of_a_running_child() {
    util::init();
    let main = main_fiber();

    for (name, selector) in selectors(&main) {
        let selector = Arc::new(Shared(selector));

        let child = Command::new("/bin/sh")
            .args(["-c", "sleep 0.2; exit 7"])
            .spawn()
            .unwrap();
        let pid = child.id() as libc::pid_t;

        let code = Arc::new(Shared(Cell::new(None)));

        let fiber = {
            let selector = selector.clone();
            let code = code.clone();
            spawn(&main, move || {
                let status = selector
                    .0
                    .process_wait(&util::current_fiber(), pid, 0)
                    .unwrap();
                code.0.set(status.and_then(|status| status.code()));
            })
        };

        switch_to(&fiber);
        run_until(&selector.0, || code.0.get().is_some());

        assert_eq!(code.0.get(), Some(7), "{}", name);
        assert!(!fiber.panicked());
    }
}

#[test]
fn reaps_a_child_that_already_exited() {
    util::init();
    let main = main_fiber();

    for (name, selector) in selectors(&main) {
        let selector = Arc::new(Shared(selector));

        let child = Command::new("/bin/sh")
            .args(["-c", "exit 3"])
            .spawn()
            .unwrap();
        let pid = child.id() as libc::pid_t;

        // Let the child exit before anyone waits on it.
        thread::sleep(Duration::from_millis(300));

        let code = Arc::new(Shared(Cell::new(None)));

        let fiber = {
            let selector = selector.clone();
            let code = code.clone();
            spawn(&main, move || {
                let status = selector
                    .0
                    .process_wait(&util::current_fiber(), pid, 0)
                    .unwrap();
                code.0.set(status.and_then(|status| status.code()));
            })
        };

        switch_to(&fiber);
        run_until(&selector.0, || code.0.get().is_some());

        assert_eq!(code.0.get(), Some(3), "{}", name);
    }
}

#[test]
fn raise_cancels_a_process_wait() {
    util::init();
    let main = main_fiber();

    for (name, selector) in selectors(&main) {
        let selector = Arc::new(Shared(selector));

        let mut child = Command::new("/bin/sh")
            .args(["-c", "sleep 30"])
            .spawn()
            .unwrap();
        let pid = child.id() as libc::pid_t;

        let outcome = Arc::new(Shared(Cell::new(None)));

        let fiber = {
            let selector = selector.clone();
            let outcome = outcome.clone();
            spawn(&main, move || {
                let result = selector.0.process_wait(&util::current_fiber(), pid, 0);
                outcome.0.set(Some(match result {
                    Ok(status) => Ok(status.is_some()),
                    Err(error) => Err(error.kind()),
                }));
            })
        };

        switch_to(&fiber);
        assert!(outcome.0.get().is_none(), "{}", name);

        let main_handle = util::handle(&main);
        let fiber_handle = util::handle(&fiber);
        selector.0.raise(
            &main_handle,
            &fiber_handle,
            io::Error::new(io::ErrorKind::Interrupted, "cancelled"),
        );

        assert_eq!(
            outcome.0.get(),
            Some(Err(io::ErrorKind::Interrupted)),
            "{}",
            name
        );

        child.kill().unwrap();
        child.wait().unwrap();
        assert!(!fiber.panicked());
    }
}
