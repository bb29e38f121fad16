use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};

use super::{millis, Event, Events, READABLE, WRITABLE};

pub(crate) struct Selector {
    ep: OwnedFd,
    buf: Vec<libc::epoll_event>,
}

impl std::fmt::Debug for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selector").field("ep", &self.ep).finish()
    }
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Selector {
            ep,
            buf: Vec::with_capacity(256),
        })
    }

    pub(crate) fn register(&mut self, fd: RawFd, interest: u8) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: fd as u64,
        };
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            fd,
            &mut event
        ))
        .map(|_| ())
    }

    pub(crate) fn reregister(&mut self, fd: RawFd, interest: u8) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: fd as u64,
        };
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_MOD,
            fd,
            &mut event
        ))
        .map(|_| ())
    }

    pub(crate) fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            fd,
            ptr::null_mut()
        ))
        .map(|_| ())
    }

    pub(crate) fn select(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        events.clear();
        self.buf.clear();

        let n = loop {
            match syscall!(epoll_wait(
                self.ep.as_raw_fd(),
                self.buf.as_mut_ptr(),
                self.buf.capacity() as libc::c_int,
                millis(timeout),
            )) {
                Ok(n) => break n as usize,
                Err(ref err) if err.raw_os_error() == Some(libc::EINTR) => continue,
                Err(err) => return Err(err),
            }
        };
        // SAFETY: epoll_wait initialised `n` entries.
        unsafe { self.buf.set_len(n) };

        for ev in &self.buf {
            let bits = ev.events as libc::c_int;
            events.push(Event {
                fd: ev.u64 as RawFd,
                readable: bits & (EPOLLIN | EPOLLPRI | EPOLLRDHUP | EPOLLHUP | EPOLLERR) != 0,
                writable: bits & (EPOLLOUT | EPOLLHUP | EPOLLERR) != 0,
            });
        }
        Ok(())
    }
}

fn interest_to_epoll(interest: u8) -> u32 {
    let mut kind = 0;
    if interest & READABLE != 0 {
        kind |= EPOLLIN | EPOLLRDHUP;
    }
    if interest & WRITABLE != 0 {
        kind |= EPOLLOUT;
    }
    kind as u32
}
