use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

/// Waker backed by a unix pipe.
///
/// The read end is registered with the poll thread's selector; writing a
/// byte makes the selector return so it can pick up newly submitted work.
#[derive(Debug)]
pub(crate) struct Waker {
    sender: File,
    receiver: File,
}

impl Waker {
    pub(crate) fn new() -> io::Result<Waker> {
        let mut fds = [0 as libc::c_int; 2];

        #[cfg(any(target_os = "linux", target_os = "android"))]
        syscall!(pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC))?;

        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            syscall!(pipe(fds.as_mut_ptr()))?;
            for fd in &fds {
                super::net::set_nonblock_cloexec(*fd)?;
            }
        }

        // SAFETY: pipe(2) returned two freshly opened descriptors.
        let receiver = unsafe { File::from_raw_fd(fds[0]) };
        let sender = unsafe { File::from_raw_fd(fds[1]) };
        Ok(Waker { sender, receiver })
    }

    pub(crate) fn wake(&self) -> io::Result<()> {
        match (&self.sender).write(&[1]) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                // The pipe is full; the reader has plenty of wake-ups
                // pending already.
                Ok(())
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => self.wake(),
            Err(err) => Err(err),
        }
    }

    /// Empties accumulated wake-up bytes.
    pub(crate) fn drain(&self) {
        let mut buf = [0; 256];
        loop {
            match (&self.receiver).read(&mut buf) {
                Ok(n) if n > 0 => continue,
                _ => return,
            }
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.receiver.as_raw_fd()
    }
}
