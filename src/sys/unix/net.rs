use std::io;
use std::mem;
use std::os::unix::io::RawFd;

use crate::inet::{Family, InetAddress};

/// A ready-to-use `sockaddr` for one of the two supported families.
///
/// Kept alive by the caller for as long as the kernel may look at the
/// pointer (which matters for ring-submitted connects).
pub(crate) enum RawAddr {
    V4(libc::sockaddr_in),
    V6(libc::sockaddr_in6),
}

impl RawAddr {
    pub(crate) fn new(addr: &InetAddress, port: u16) -> Option<RawAddr> {
        match addr.family() {
            Family::V4 => {
                // SAFETY: all-zero is a valid sockaddr_in.
                let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = port.to_be();
                sin.sin_addr.s_addr = u32::from_ne_bytes(addr.bytes()[..4].try_into().unwrap());
                Some(RawAddr::V4(sin))
            }
            Family::V6 => {
                let mut sin6: libc::sockaddr_in6 = unsafe { mem::zeroed() };
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = port.to_be();
                sin6.sin6_addr.s6_addr = *addr.bytes();
                Some(RawAddr::V6(sin6))
            }
            Family::Unknown => None,
        }
    }

    pub(crate) fn as_ptr(&self) -> *const libc::sockaddr {
        match self {
            RawAddr::V4(sin) => sin as *const _ as *const libc::sockaddr,
            RawAddr::V6(sin6) => sin6 as *const _ as *const libc::sockaddr,
        }
    }

    pub(crate) fn len(&self) -> libc::socklen_t {
        match self {
            RawAddr::V4(_) => mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            RawAddr::V6(_) => mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
        }
    }
}

/// Decodes a kernel-filled `sockaddr_storage`.
pub(crate) fn addr_from_storage(storage: &libc::sockaddr_storage) -> Option<(InetAddress, u16)> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            // SAFETY: the kernel guarantees a sockaddr_in for AF_INET.
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let bytes = sin.sin_addr.s_addr.to_ne_bytes();
            Some((
                InetAddress::from_bytes(Family::V4, &bytes),
                u16::from_be(sin.sin_port),
            ))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Some((
                InetAddress::from_bytes(Family::V6, &sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
            ))
        }
        _ => None,
    }
}

/// Creates a non-blocking, close-on-exec stream socket.
pub(crate) fn new_stream_socket(family: Family) -> io::Result<RawFd> {
    let domain = match family {
        Family::V4 => libc::AF_INET,
        Family::V6 => libc::AF_INET6,
        Family::Unknown => return Err(io::ErrorKind::InvalidInput.into()),
    };

    #[cfg(any(target_os = "linux", target_os = "android"))]
    let fd = syscall!(socket(
        domain,
        libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        0,
    ))?;

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let fd = {
        let fd = syscall!(socket(domain, libc::SOCK_STREAM, 0))?;
        if let Err(err) = set_nonblock_cloexec(fd) {
            let _ = syscall!(close(fd));
            return Err(err);
        }
        fd
    };

    Ok(fd)
}

pub(crate) fn set_nonblock_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
    syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
    let flags = syscall!(fcntl(fd, libc::F_GETFD))?;
    syscall!(fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC))?;
    Ok(())
}

fn set_bool_opt(fd: RawFd, level: libc::c_int, opt: libc::c_int, on: bool) -> io::Result<()> {
    let val: libc::c_int = i32::from(on);
    syscall!(setsockopt(
        fd,
        level,
        opt,
        &val as *const _ as *const libc::c_void,
        mem::size_of::<libc::c_int>() as libc::socklen_t,
    ))
    .map(|_| ())
}

pub(crate) fn set_reuseaddr(fd: RawFd, on: bool) -> io::Result<()> {
    set_bool_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
}

pub(crate) fn set_v6only(fd: RawFd, on: bool) -> io::Result<()> {
    set_bool_opt(fd, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, on)
}

pub(crate) fn bind(fd: RawFd, addr: &InetAddress, port: u16) -> io::Result<()> {
    let raw = RawAddr::new(addr, port).ok_or(io::ErrorKind::InvalidInput)?;
    syscall!(bind(fd, raw.as_ptr(), raw.len())).map(|_| ())
}

pub(crate) fn listen(fd: RawFd, backlog: libc::c_int) -> io::Result<()> {
    syscall!(listen(fd, backlog)).map(|_| ())
}

/// One `accept` step. `WouldBlock` means no connection is queued yet.
pub(crate) fn accept(fd: RawFd) -> io::Result<(RawFd, Option<(InetAddress, u16)>)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    let new_fd = syscall!(accept4(
        fd,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len,
        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
    ))?;

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let new_fd = {
        let new_fd = syscall!(accept(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        ))?;
        if let Err(err) = set_nonblock_cloexec(new_fd) {
            let _ = syscall!(close(new_fd));
            return Err(err);
        }
        new_fd
    };

    Ok((new_fd, addr_from_storage(&storage)))
}

/// Starts a non-blocking connect. `Ok(true)` means the socket connected
/// immediately, `Ok(false)` that the connect is in progress and the
/// socket will become writable when it resolves.
pub(crate) fn connect(fd: RawFd, addr: &InetAddress, port: u16) -> io::Result<bool> {
    let raw = RawAddr::new(addr, port).ok_or(io::ErrorKind::InvalidInput)?;
    match syscall!(connect(fd, raw.as_ptr(), raw.len())) {
        Ok(_) => Ok(true),
        Err(ref err) if err.raw_os_error() == Some(libc::EINPROGRESS) => Ok(false),
        Err(err) => Err(err),
    }
}

/// Retrieves and clears the pending `SO_ERROR` of a socket.
pub(crate) fn take_socket_error(fd: RawFd) -> io::Result<()> {
    let mut val: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    syscall!(getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut val as *mut _ as *mut libc::c_void,
        &mut len,
    ))?;
    if val == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(val))
    }
}

pub(crate) fn local_addr(fd: RawFd) -> io::Result<(InetAddress, u16)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getsockname(
        fd,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len,
    ))?;
    addr_from_storage(&storage).ok_or_else(|| io::ErrorKind::InvalidData.into())
}

pub(crate) fn peer_addr(fd: RawFd) -> io::Result<(InetAddress, u16)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getpeername(
        fd,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len,
    ))?;
    addr_from_storage(&storage).ok_or_else(|| io::ErrorKind::InvalidData.into())
}

pub(crate) fn recv(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = syscall!(recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0))?;
    Ok(n as usize)
}

pub(crate) fn send(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    // MSG_NOSIGNAL turns the SIGPIPE of a dead peer into EPIPE.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let flags = libc::MSG_NOSIGNAL;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let flags = 0;

    let n = syscall!(send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags))?;
    Ok(n as usize)
}

pub(crate) fn shutdown_write(fd: RawFd) -> io::Result<()> {
    syscall!(shutdown(fd, libc::SHUT_WR)).map(|_| ())
}

pub(crate) fn close(fd: RawFd) -> io::Result<()> {
    syscall!(close(fd)).map(|_| ())
}

/// Positioned read with EINTR retry. `Ok(0)` is end of file.
pub(crate) fn pread(fd: RawFd, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    loop {
        match syscall!(pread(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            offset as libc::off_t,
        )) {
            Ok(n) => return Ok(n as usize),
            Err(ref err) if err.raw_os_error() == Some(libc::EINTR) => continue,
            Err(err) => return Err(err),
        }
    }
}

/// Positioned write with EINTR retry.
pub(crate) fn pwrite(fd: RawFd, buf: &[u8], offset: u64) -> io::Result<usize> {
    loop {
        match syscall!(pwrite(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            offset as libc::off_t,
        )) {
            Ok(n) => return Ok(n as usize),
            Err(ref err) if err.raw_os_error() == Some(libc::EINTR) => continue,
            Err(err) => return Err(err),
        }
    }
}

/// Whether an I/O error is the "try again later" of non-blocking I/O.
pub(crate) fn is_would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}
