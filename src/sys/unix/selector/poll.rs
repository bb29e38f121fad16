use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::{millis, Event, Events, READABLE, WRITABLE};

#[cfg(not(target_os = "haiku"))]
const READ_EVENTS: libc::c_short = libc::POLLIN | libc::POLLPRI;
#[cfg(target_os = "haiku")]
const READ_EVENTS: libc::c_short = libc::POLLIN;

const WRITE_EVENTS: libc::c_short = libc::POLLOUT;

/// `poll(2)` fallback selector.
///
/// Keeps the `pollfd` array and an fd-to-index map in sync; removal
/// swap-removes the array entry and patches the moved descriptor's index.
#[derive(Debug)]
pub(crate) struct Selector {
    poll_fds: Vec<PollFd>,
    index: HashMap<RawFd, usize>,
}

/// Transparent wrapper around `libc::pollfd` so the containing struct can
/// derive `Debug` without libc's `extra_traits` feature.
#[repr(transparent)]
struct PollFd(libc::pollfd);

impl std::fmt::Debug for PollFd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("pollfd")
            .field("fd", &self.0.fd)
            .field("events", &self.0.events)
            .field("revents", &self.0.revents)
            .finish()
    }
}

impl Selector {
    pub(crate) fn new() -> Selector {
        Selector {
            poll_fds: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub(crate) fn register(&mut self, fd: RawFd, interest: u8) -> io::Result<()> {
        if self.index.contains_key(&fd) {
            return Err(io::ErrorKind::AlreadyExists.into());
        }
        self.index.insert(fd, self.poll_fds.len());
        self.poll_fds.push(PollFd(libc::pollfd {
            fd,
            events: interest_to_poll(interest),
            revents: 0,
        }));
        Ok(())
    }

    pub(crate) fn reregister(&mut self, fd: RawFd, interest: u8) -> io::Result<()> {
        let idx = *self.index.get(&fd).ok_or(io::ErrorKind::NotFound)?;
        self.poll_fds[idx].0.events = interest_to_poll(interest);
        Ok(())
    }

    pub(crate) fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        let idx = self.index.remove(&fd).ok_or(io::ErrorKind::NotFound)?;
        self.poll_fds.swap_remove(idx);
        if let Some(moved) = self.poll_fds.get(idx) {
            *self.index.get_mut(&moved.0.fd).expect("moved fd not indexed") = idx;
        }
        Ok(())
    }

    pub(crate) fn select(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        events.clear();

        loop {
            let res = syscall!(poll(
                self.poll_fds.as_mut_ptr() as *mut libc::pollfd,
                self.poll_fds.len() as libc::nfds_t,
                millis(timeout),
            ));
            match res {
                Ok(0) => return Ok(()),
                Ok(_) => break,
                Err(ref err)
                    if err.raw_os_error() == Some(libc::EINTR)
                        || err.raw_os_error() == Some(libc::EAGAIN) =>
                {
                    continue
                }
                Err(err) => return Err(err),
            }
        }

        for poll_fd in &mut self.poll_fds {
            let revents = poll_fd.0.revents;
            poll_fd.0.revents = 0;
            if revents != 0 {
                events.push(Event {
                    fd: poll_fd.0.fd,
                    readable: revents & (READ_EVENTS | libc::POLLHUP | libc::POLLERR) != 0,
                    writable: revents & (WRITE_EVENTS | libc::POLLHUP | libc::POLLERR) != 0,
                });
            }
        }
        Ok(())
    }
}

fn interest_to_poll(interest: u8) -> libc::c_short {
    let mut kind = 0;
    if interest & READABLE != 0 {
        kind |= READ_EVENTS;
    }
    if interest & WRITABLE != 0 {
        kind |= WRITE_EVENTS;
    }
    kind
}
