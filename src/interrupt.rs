//! Cross-thread interrupt primitive.
//!
//! Wakes a selector blocked in the kernel from another thread. Backed by an
//! `eventfd` where available, a non-blocking close-on-exec self-pipe
//! elsewhere. Saturation is success: if the counter or pipe is full, the
//! other end is certainly going to wake.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

#[cfg(any(target_os = "linux", target_os = "android"))]
#[derive(Debug)]
pub(crate) struct Interrupt {
    fd: OwnedFd,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl Interrupt {
    pub(crate) fn open() -> io::Result<Interrupt> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        // SAFETY: `eventfd(2)` returned a fresh descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Interrupt { fd })
    }

    pub(crate) fn signal(&self) -> io::Result<()> {
        let value: u64 = 1;
        let result = syscall!(write(
            self.fd.as_raw_fd(),
            &value as *const u64 as *const libc::c_void,
            std::mem::size_of::<u64>(),
        ));
        squelch_saturation(result)
    }

    pub(crate) fn clear(&self) -> io::Result<()> {
        let mut value: u64 = 0;
        let result = syscall!(read(
            self.fd.as_raw_fd(),
            &mut value as *mut u64 as *mut libc::c_void,
            std::mem::size_of::<u64>(),
        ));
        squelch_saturation(result)
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl AsRawFd for Interrupt {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
#[derive(Debug)]
pub(crate) struct Interrupt {
    reader: OwnedFd,
    writer: OwnedFd,
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
impl Interrupt {
    pub(crate) fn open() -> io::Result<Interrupt> {
        let mut fds: [RawFd; 2] = [-1, -1];

        #[cfg(not(any(target_os = "macos", target_os = "ios")))]
        syscall!(pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK))?;

        // macOS has no `pipe2(2)`, so the flags are applied separately.
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        {
            syscall!(pipe(fds.as_mut_ptr()))?;
            for fd in &fds {
                syscall!(fcntl(*fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
                syscall!(fcntl(*fd, libc::F_SETFL, libc::O_NONBLOCK))?;
            }
        }

        // SAFETY: `pipe(2)` returned two fresh descriptors.
        let reader = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let writer = unsafe { OwnedFd::from_raw_fd(fds[1]) };
        Ok(Interrupt { reader, writer })
    }

    pub(crate) fn signal(&self) -> io::Result<()> {
        let result = syscall!(write(
            self.writer.as_raw_fd(),
            b".".as_ptr() as *const libc::c_void,
            1,
        ));
        squelch_saturation(result)
    }

    pub(crate) fn clear(&self) -> io::Result<()> {
        let mut buffer = [0u8; 128];
        let result = syscall!(read(
            self.reader.as_raw_fd(),
            buffer.as_mut_ptr() as *mut libc::c_void,
            buffer.len(),
        ));
        squelch_saturation(result)
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
impl AsRawFd for Interrupt {
    fn as_raw_fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }
}

fn squelch_saturation(result: io::Result<isize>) -> io::Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(ref error) if error.kind() == io::ErrorKind::WouldBlock => Ok(()),
        Err(error) => Err(error),
    }
}
