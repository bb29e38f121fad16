#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
mod poll;

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Interest in read-class readiness.
pub(crate) const READABLE: u8 = 0b01;
/// Interest in write-class readiness.
pub(crate) const WRITABLE: u8 = 0b10;

/// One readiness notification.
///
/// Error and hang-up conditions are folded into both directions so the
/// armed operation's own syscall surfaces the failure.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Event {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
}

pub(crate) type Events = Vec<Event>;

/// A level-triggered readiness multiplexer.
///
/// Owned and driven by a single poll thread; registrations are applied
/// from that thread only.
#[derive(Debug)]
pub(crate) enum Selector {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Epoll(epoll::Selector),
    Poll(poll::Selector),
}

impl Selector {
    /// The platform's preferred selector.
    pub(crate) fn new() -> io::Result<Selector> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        return Ok(Selector::Epoll(epoll::Selector::new()?));
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        Selector::new_poll()
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub(crate) fn new_epoll() -> io::Result<Selector> {
        Ok(Selector::Epoll(epoll::Selector::new()?))
    }

    pub(crate) fn new_poll() -> io::Result<Selector> {
        Ok(Selector::Poll(poll::Selector::new()))
    }

    pub(crate) fn register(&mut self, fd: RawFd, interest: u8) -> io::Result<()> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Selector::Epoll(s) => s.register(fd, interest),
            Selector::Poll(s) => s.register(fd, interest),
        }
    }

    pub(crate) fn reregister(&mut self, fd: RawFd, interest: u8) -> io::Result<()> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Selector::Epoll(s) => s.reregister(fd, interest),
            Selector::Poll(s) => s.reregister(fd, interest),
        }
    }

    pub(crate) fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Selector::Epoll(s) => s.deregister(fd),
            Selector::Poll(s) => s.deregister(fd),
        }
    }

    /// Blocks until a registered descriptor is ready or the timeout
    /// elapses, filling `events`.
    pub(crate) fn select(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Selector::Epoll(s) => s.select(events, timeout),
            Selector::Poll(s) => s.select(events, timeout),
        }
    }
}

/// Converts a timeout to whole milliseconds, rounding up so that a
/// sub-millisecond wait does not turn into a busy spin.
fn millis(timeout: Option<Duration>) -> libc::c_int {
    timeout
        .map(|to| {
            to.checked_add(Duration::from_nanos(999_999))
                .unwrap_or(to)
                .as_millis()
                .min(libc::c_int::MAX as u128) as libc::c_int
        })
        .unwrap_or(-1)
}
