use std::cell::Cell;
use std::io;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

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
fn pipe_echo() {
    util::init();
    let main = main_fiber();

    for (name, selector) in selectors(&main) {
        let selector = Arc::new(Shared(selector));
        let (reader, writer) = util::pipe();
        let fd = reader.as_raw_fd();

        let result = Arc::new(Shared(Cell::new(None)));
        let bytes = Arc::new(Shared(Cell::new([0u8; 5])));

        let fiber = {
            let selector = selector.clone();
            let result = result.clone();
            let bytes = bytes.clone();
            spawn(&main, move || {
                let mut buffer = [0u8; 16];
                let count = selector
                    .0
                    .io_read(&util::current_fiber(), fd, &mut buffer, 5)
                    .unwrap();
                let mut head = [0u8; 5];
                head.copy_from_slice(&buffer[..5]);
                bytes.0.set(head);
                result.0.set(Some(count));
            })
        };

        switch_to(&fiber);
        util::write_all(&writer, b"hello");
        run_until(&selector.0, || result.0.get().is_some());

        assert_eq!(result.0.get(), Some(5), "{}", name);
        assert_eq!(&bytes.0.get(), b"hello", "{}", name);
        assert!(!fiber.panicked());
    }
}

#[test]
fn read_returns_zero_at_eof() {
    util::init();
    let main = main_fiber();

    for (name, selector) in selectors(&main) {
        let selector = Arc::new(Shared(selector));
        let (reader, writer) = util::pipe();
        let fd = reader.as_raw_fd();

        let result = Arc::new(Shared(Cell::new(None)));

        let fiber = {
            let selector = selector.clone();
            let result = result.clone();
            spawn(&main, move || {
                let mut buffer = [0u8; 16];
                let count = selector
                    .0
                    .io_read(&util::current_fiber(), fd, &mut buffer, 5)
                    .unwrap();
                result.0.set(Some(count));
            })
        };

        switch_to(&fiber);
        drop(writer);
        run_until(&selector.0, || result.0.get().is_some());

        assert_eq!(result.0.get(), Some(0), "{}", name);
    }
}

#[test]
fn zero_length_read_never_blocks() {
    util::init();
    let main = main_fiber();

    for (name, selector) in selectors(&main) {
        let selector = Arc::new(Shared(selector));
        let (reader, writer) = util::pipe();
        let fd = reader.as_raw_fd();

        let outcome = Arc::new(Shared(Cell::new(None)));

        // Nothing buffered: the read reports would-block instead of
        // suspending.
        let fiber = {
            let selector = selector.clone();
            let outcome = outcome.clone();
            spawn(&main, move || {
                let mut buffer = [0u8; 16];
                let result = selector.0.io_read(&util::current_fiber(), fd, &mut buffer, 0);
                outcome.0.set(Some(result.map_err(|error| error.kind())));
            })
        };
        switch_to(&fiber);
        assert_eq!(
            outcome.0.get(),
            Some(Err(io::ErrorKind::WouldBlock)),
            "{}",
            name
        );

        // With bytes buffered it returns whatever is available.
        util::write_all(&writer, b"ab");
        let outcome = Arc::new(Shared(Cell::new(None)));
        let fiber = {
            let selector = selector.clone();
            let outcome = outcome.clone();
            spawn(&main, move || {
                let mut buffer = [0u8; 16];
                let result = selector.0.io_read(&util::current_fiber(), fd, &mut buffer, 0);
                outcome.0.set(Some(result.map_err(|error| error.kind())));
            })
        };
        switch_to(&fiber);
        assert_eq!(outcome.0.get(), Some(Ok(2)), "{}", name);
    }
}

#[test]
fn write_loop_completes_across_a_full_buffer() {
    util::init();
    let main = main_fiber();

    for (name, selector) in selectors(&main) {
        let selector = Arc::new(Shared(selector));
        let (a, b) = util::socketpair();
        let fd = a.as_raw_fd();

        const TOTAL: usize = 256 * 1024;
        let written = Arc::new(Shared(Cell::new(None)));

        let fiber = {
            let selector = selector.clone();
            let written = written.clone();
            spawn(&main, move || {
                let payload = vec![0x5au8; TOTAL];
                let count = selector
                    .0
                    .io_write(&util::current_fiber(), fd, &payload, TOTAL)
                    .unwrap();
                written.0.set(Some(count));
            })
        };

        switch_to(&fiber);

        // Drain the far end until the writer finishes.
        let mut received = 0;
        let mut sink = [0u8; 16384];
        for _ in 0..10_000 {
            if written.0.get().is_some() && received >= TOTAL {
                break;
            }
            let count = unsafe {
                libc::recv(
                    b.as_raw_fd(),
                    sink.as_mut_ptr() as *mut libc::c_void,
                    sink.len(),
                    libc::MSG_DONTWAIT,
                )
            };
            if count > 0 {
                received += count as usize;
            }
            selector.0.select(Some(Duration::from_millis(10))).unwrap();
        }

        assert_eq!(written.0.get(), Some(TOTAL), "{}", name);
        assert_eq!(received, TOTAL, "{}", name);
        assert!(!fiber.panicked());
    }
}

#[cfg(target_os = "linux")]
#[test]
fn uring_pread_pwrite_use_explicit_offsets() {
    use io_event::FiberHandle;
    use std::os::fd::FromRawFd;

    util::init();
    let main = main_fiber();

    let handle: FiberHandle = main.clone();
    let selector = match io_event::selector::uring::Selector::new(handle) {
        Ok(selector) => Arc::new(Shared(selector)),
        Err(error) => {
            log::warn!("skipping uring pread/pwrite test: {}", error);
            return;
        }
    };

    let name = std::ffi::CString::new("io-event-test").unwrap();
    let fd = unsafe { libc::memfd_create(name.as_ptr(), 0) };
    assert!(fd >= 0);
    let file = unsafe { std::os::fd::OwnedFd::from_raw_fd(fd) };

    let done = Arc::new(Shared(Cell::new(false)));

    let fiber = {
        let selector = selector.clone();
        let done = done.clone();
        let fd = file.as_raw_fd();
        spawn(&main, move || {
            let fiber = util::current_fiber();
            let written = selector.0.io_pwrite(&fiber, fd, b"hello", 3, 5).unwrap();
            assert_eq!(written, 5);

            let mut buffer = [0u8; 5];
            let read = selector.0.io_pread(&fiber, fd, &mut buffer, 3, 5).unwrap();
            assert_eq!(read, 5);
            assert_eq!(&buffer, b"hello");

            // The bytes really are at offset 3.
            let mut all = [0u8; 8];
            let read = selector.0.io_pread(&fiber, fd, &mut all, 0, 8).unwrap();
            assert_eq!(read, 8);
            assert_eq!(&all[..3], &[0, 0, 0]);
            assert_eq!(&all[3..], b"hello");

            done.0.set(true);
        })
    };

    switch_to(&fiber);
    for _ in 0..100 {
        if done.0.get() {
            break;
        }
        selector.0.select(Some(Duration::from_millis(100))).unwrap();
    }
    assert!(done.0.get());
    assert!(!fiber.panicked());
}

#[cfg(target_os = "linux")]
#[test]
fn uring_cancelled_read_never_resumes() {
    use io_event::FiberHandle;

    util::init();
    let main = main_fiber();

    let handle: FiberHandle = main.clone();
    let selector = match io_event::selector::uring::Selector::new(handle) {
        Ok(selector) => Arc::new(Shared(io_event::Selector::Uring(selector))),
        Err(error) => {
            log::warn!("skipping uring cancellation test: {}", error);
            return;
        }
    };

    let (reader, writer) = util::pipe();
    let fd = reader.as_raw_fd();

    let outcome = Arc::new(Shared(Cell::new(None)));

    let fiber = {
        let selector = selector.clone();
        let outcome = outcome.clone();
        spawn(&main, move || {
            let mut buffer = [0u8; 16];
            let result = selector.0.io_read(&util::current_fiber(), fd, &mut buffer, 5);
            outcome.0.set(Some(result.map_err(|error| error.kind())));
        })
    };

    // The read parks with a submission in flight.
    switch_to(&fiber);
    assert!(outcome.0.get().is_none());

    let start = Instant::now();
    let main_handle = util::handle(&main);
    let fiber_handle = util::handle(&fiber);
    selector.0.raise(
        &main_handle,
        &fiber_handle,
        io::Error::new(io::ErrorKind::Interrupted, "cancelled"),
    );

    // The unwind submitted a cancel and drained it; the raise comes back
    // promptly, not after any read completes.
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(outcome.0.get(), Some(Err(io::ErrorKind::Interrupted)));

    // Later traffic and further cycles never resume the cancelled fiber.
    util::write_all(&writer, b"hello");
    for _ in 0..3 {
        selector.0.select(Some(Duration::from_millis(10))).unwrap();
    }
    assert!(!fiber.panicked());
}
