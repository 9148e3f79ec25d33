//! Thin wrapper over epoll and an eventfd used to interrupt a blocked wait.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Token reserved for the wake-up eventfd.
pub(crate) const WAKE_TOKEN: u64 = 0;

pub(crate) struct Poller {
    epfd: OwnedFd,
    waker: OwnedFd,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        // SAFETY: epoll_create1 takes no pointers; a non-negative return is a
        // fresh descriptor owned by nobody else.
        let epfd = unsafe { OwnedFd::from_raw_fd(cvt(libc::epoll_create1(libc::EPOLL_CLOEXEC))?) };
        // SAFETY: as above for eventfd.
        let waker = unsafe {
            OwnedFd::from_raw_fd(cvt(libc::eventfd(
                0,
                libc::EFD_CLOEXEC | libc::EFD_NONBLOCK,
            ))?)
        };

        let poller = Self { epfd, waker };
        poller.add(poller.waker.as_raw_fd(), WAKE_TOKEN, libc::EPOLLIN as u32)?;
        Ok(poller)
    }

    pub(crate) fn add(&self, fd: RawFd, token: u64, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, events)
    }

    pub(crate) fn modify(&self, fd: RawFd, token: u64, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, events)
    }

    /// Remove `fd` from the interest list. A descriptor that is no longer
    /// registered is not an error.
    pub(crate) fn delete(&self, fd: RawFd) -> io::Result<()> {
        // SAFETY: a null event pointer is permitted for EPOLL_CTL_DEL.
        let rc = unsafe {
            libc::epoll_ctl(
                self.epfd.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(err);
            }
        }
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: u64, events: u32) -> io::Result<()> {
        let mut event = libc::epoll_event { events, u64: token };
        // SAFETY: `event` is a valid, writable epoll_event for the call.
        cvt(unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut event) })?;
        Ok(())
    }

    /// Wait for readiness, filling `events`. `None` waits indefinitely.
    ///
    /// An interrupted wait reports zero events.
    pub(crate) fn wait(
        &self,
        events: &mut [libc::epoll_event],
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let timeout_ms = timeout.map_or(-1, timeout_millis);
        let capacity = events.len().min(libc::c_int::MAX as usize) as libc::c_int;

        // SAFETY: `events` is valid for `capacity` writes.
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                events.as_mut_ptr(),
                capacity,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(n as usize)
    }

    /// Make a blocked or future [`wait`](Self::wait) return.
    pub(crate) fn wake(&self) -> io::Result<()> {
        let one = 1u64.to_ne_bytes();
        // SAFETY: writes 8 bytes from a live stack buffer.
        let rc = unsafe {
            libc::write(
                self.waker.as_raw_fd(),
                one.as_ptr().cast::<libc::c_void>(),
                one.len(),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // counter saturated: a wake-up is already pending
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Reset the wake-up counter after it fired.
    pub(crate) fn drain_wake(&self) {
        let mut counter = [0u8; 8];
        // SAFETY: reads at most 8 bytes into a live stack buffer. Failure
        // (nothing pending) leaves the counter as it is.
        unsafe {
            libc::read(
                self.waker.as_raw_fd(),
                counter.as_mut_ptr().cast::<libc::c_void>(),
                counter.len(),
            );
        }
    }
}

pub(crate) fn empty_event() -> libc::epoll_event {
    libc::epoll_event { events: 0, u64: 0 }
}

/// Millisecond timeout for epoll, rounded up so short timers never spin.
fn timeout_millis(timeout: Duration) -> libc::c_int {
    timeout
        .as_nanos()
        .div_ceil(1_000_000)
        .min(libc::c_int::MAX as u128) as libc::c_int
}

pub(crate) fn cvt(rc: libc::c_int) -> io::Result<libc::c_int> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

/// Set or clear `O_NONBLOCK` on `fd`.
pub(crate) fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    // SAFETY: fcntl with F_GETFL/F_SETFL takes no pointers.
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    let updated = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    if updated != flags {
        // SAFETY: as above.
        cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, updated) })?;
    }
    Ok(())
}
