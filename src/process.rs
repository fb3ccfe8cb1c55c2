//! Process status helpers consumed by the selectors.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use libc::{c_int, pid_t};

/// Reaps `pid` without hanging.
///
/// `flags` is OR-ed with `WNOHANG`; returns `Ok(None)` while the process is
/// not yet reapable.
pub fn process_status_wait(pid: pid_t, flags: c_int) -> io::Result<Option<ExitStatus>> {
    let mut status: c_int = 0;
    loop {
        return match syscall!(waitpid(pid, &mut status, flags | libc::WNOHANG)) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(ExitStatus::from_raw(status))),
            Err(ref error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => Err(error),
        };
    }
}

/// Opens a pidfd for `pid`. The descriptor becomes readable when the
/// process exits.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn pidfd_open(pid: pid_t) -> io::Result<std::os::fd::OwnedFd> {
    use std::os::fd::{FromRawFd, OwnedFd, RawFd};

    let fd = syscall!(syscall(libc::SYS_pidfd_open, pid, 0))?;
    // SAFETY: `pidfd_open(2)` returned a fresh descriptor.
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

/// Waits until `pid` is terminated-but-unreaped.
///
/// Some BSD kernels report `EVFILT_PROC`/`NOTE_EXIT` (or fail registration
/// with `ESRCH`) slightly before a `WNOHANG` wait would observe the exit.
/// A hanging `WNOWAIT` wait bridges that gap without consuming the status;
/// `waitid` is used because OpenBSD only supports `WNOWAIT` there.
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
))]
pub(crate) fn process_prewait(pid: pid_t) -> io::Result<()> {
    loop {
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        // This can be interrupted by SIGCHLD.
        return match syscall!(waitid(
            libc::P_PID,
            pid as libc::id_t,
            &mut info,
            libc::WEXITED | libc::WNOWAIT,
        )) {
            Ok(_) => Ok(()),
            Err(ref error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => Err(error),
        };
    }
}

#[cfg(target_os = "dragonfly")]
pub(crate) fn process_prewait(_pid: pid_t) -> io::Result<()> {
    Ok(())
}
