use std::os::unix::io::RawFd;
use std::sync::{Mutex, OnceLock, Weak};

use log::{trace, warn};

use crate::engine::{next_handle_id, EngineShared};
use crate::error::{Error, ErrorCode};
use crate::inet::{Family, InetAddress};
use crate::sys::net;

/// A stream socket handle usable with
/// [`AioEngine`](crate::AioEngine) socket operations.
///
/// Sockets are created unopened; [`AioSocket::init`] allocates a
/// non-blocking, close-on-exec stream socket of the requested family.
/// Accept targets stay unopened and receive their descriptor when the
/// accept completes. A socket belongs to at most one engine for its
/// whole lifetime.
#[derive(Debug)]
pub struct AioSocket {
    id: u64,
    inner: Mutex<SockInner>,
    owner: OnceLock<Weak<EngineShared>>,
}

#[derive(Debug)]
struct SockInner {
    fd: Option<RawFd>,
    family: Family,
    listening: bool,
    bound: bool,
    peer: Option<(InetAddress, u16)>,
}

impl AioSocket {
    /// Creates an unopened socket handle.
    pub fn new() -> AioSocket {
        AioSocket {
            id: next_handle_id(),
            inner: Mutex::new(SockInner {
                fd: None,
                family: Family::Unknown,
                listening: false,
                bound: false,
                peer: None,
            }),
            owner: OnceLock::new(),
        }
    }

    /// Allocates the underlying socket. Fails with
    /// [`ErrorCode::InvalidArgument`] if the handle is already open.
    pub fn init(&self, family: Family) -> Result<(), Error> {
        const FP: &str = "AioSocket::init";

        if family == Family::Unknown {
            return Err(Error::new(ErrorCode::InvalidArgument, FP));
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.fd.is_some() {
            return Err(Error::new(ErrorCode::InvalidArgument, FP));
        }
        let fd =
            net::new_stream_socket(family).map_err(|e| Error::from_io_error(&e, FP, "socket"))?;
        trace!("initialized socket fd {} ({:?})", fd, family);
        inner.fd = Some(fd);
        inner.family = family;
        Ok(())
    }

    /// Binds the socket to `addr:port`. The address family must match
    /// the socket's family.
    pub fn bind(&self, addr: &InetAddress, port: u16) -> Result<(), Error> {
        const FP: &str = "AioSocket::bind";

        let mut inner = self.inner.lock().unwrap();
        let fd = inner.fd.ok_or(Error::new(ErrorCode::InvalidHandle, FP))?;
        if addr.family() != inner.family {
            return Err(Error::new(ErrorCode::InvalidArgument, FP));
        }
        net::bind(fd, addr, port).map_err(|e| Error::from_io_error(&e, FP, "bind"))?;
        inner.bound = true;
        Ok(())
    }

    /// Starts listening. A `backlog` of zero or less uses the platform
    /// maximum.
    pub fn listen(&self, backlog: i32) -> Result<(), Error> {
        const FP: &str = "AioSocket::listen";

        let mut inner = self.inner.lock().unwrap();
        let fd = inner.fd.ok_or(Error::new(ErrorCode::InvalidHandle, FP))?;
        let backlog = if backlog <= 0 || backlog > libc::SOMAXCONN {
            libc::SOMAXCONN
        } else {
            backlog
        };
        net::listen(fd, backlog).map_err(|e| Error::from_io_error(&e, FP, "listen"))?;
        inner.listening = true;
        Ok(())
    }

    /// Enables or disables `SO_REUSEADDR`.
    pub fn set_reuse_addr(&self, on: bool) -> Result<(), Error> {
        const FP: &str = "AioSocket::set_reuse_addr";
        let inner = self.inner.lock().unwrap();
        let fd = inner.fd.ok_or(Error::new(ErrorCode::InvalidHandle, FP))?;
        net::set_reuseaddr(fd, on).map_err(|e| Error::from_io_error(&e, FP, "setsockopt"))
    }

    /// Restricts an IPv6 socket to IPv6 traffic only, so a v4 listener
    /// can share its port.
    pub fn set_v6_only(&self, on: bool) -> Result<(), Error> {
        const FP: &str = "AioSocket::set_v6_only";
        let inner = self.inner.lock().unwrap();
        let fd = inner.fd.ok_or(Error::new(ErrorCode::InvalidHandle, FP))?;
        net::set_v6only(fd, on).map_err(|e| Error::from_io_error(&e, FP, "setsockopt"))
    }

    /// Immediately shuts down the write side and closes the socket.
    ///
    /// Intended for teardown paths that bypass the engine. Errors are
    /// logged, not reported.
    pub fn hard_close(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(fd) = inner.fd.take() {
            if let Err(err) = net::shutdown_write(fd) {
                // ENOTCONN is routine for sockets that never connected.
                if err.raw_os_error() != Some(libc::ENOTCONN) {
                    warn!("shutdown of socket fd {} failed: {}", fd, err);
                }
            }
            if let Err(err) = net::close(fd) {
                warn!("close of socket fd {} failed: {}", fd, err);
            }
            inner.listening = false;
            inner.bound = false;
            inner.peer = None;
        }
    }

    /// The locally bound address and port.
    pub fn local_address(&self) -> Result<(InetAddress, u16), Error> {
        const FP: &str = "AioSocket::local_address";
        let inner = self.inner.lock().unwrap();
        let fd = inner.fd.ok_or(Error::new(ErrorCode::InvalidHandle, FP))?;
        net::local_addr(fd).map_err(|e| Error::from_io_error(&e, FP, "getsockname"))
    }

    /// The connected peer, once an accept or connect has completed.
    pub fn peer_address(&self) -> Option<(InetAddress, u16)> {
        self.inner.lock().unwrap().peer
    }

    /// The socket's address family; [`Family::Unknown`] until `init`.
    pub fn family(&self) -> Family {
        self.inner.lock().unwrap().family
    }

    /// Whether the handle currently owns a descriptor.
    pub fn is_open(&self) -> bool {
        self.inner.lock().unwrap().fd.is_some()
    }

    /// Whether `listen` succeeded on this socket.
    pub fn is_listening(&self) -> bool {
        self.inner.lock().unwrap().listening
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        self.inner.lock().unwrap().fd
    }

    pub(crate) fn owner(&self) -> &OnceLock<Weak<EngineShared>> {
        &self.owner
    }

    /// Installs the descriptor produced by a completed accept. Closes
    /// `fd` and fails if the handle was opened in the meantime.
    pub(crate) fn adopt(
        &self,
        fd: RawFd,
        family: Family,
        peer: Option<(InetAddress, u16)>,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fd.is_some() {
            let _ = net::close(fd);
            return Err(Error::new(
                ErrorCode::InvalidArgument,
                "AioEngine::socket_accept",
            ));
        }
        inner.fd = Some(fd);
        inner.family = family;
        inner.peer = peer;
        Ok(())
    }

    pub(crate) fn set_peer(&self, peer: (InetAddress, u16)) {
        self.inner.lock().unwrap().peer = Some(peer);
    }

    /// Forgets the descriptor after the engine closed it.
    pub(crate) fn mark_closed(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.fd = None;
        inner.listening = false;
        inner.bound = false;
        inner.peer = None;
    }
}

impl Default for AioSocket {
    fn default() -> AioSocket {
        AioSocket::new()
    }
}

impl Drop for AioSocket {
    fn drop(&mut self) {
        if let Some(fd) = self.inner.get_mut().unwrap().fd.take() {
            trace!("closing socket fd {} on drop", fd);
            let _ = net::close(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_init_fails() {
        let sock = AioSocket::new();
        sock.init(Family::V4).unwrap();
        assert_eq!(
            sock.init(Family::V4).unwrap_err().code(),
            ErrorCode::InvalidArgument
        );
    }

    #[test]
    fn init_unknown_family_fails() {
        let sock = AioSocket::new();
        assert_eq!(
            sock.init(Family::Unknown).unwrap_err().code(),
            ErrorCode::InvalidArgument
        );
    }

    #[test]
    fn bind_family_mismatch_fails() {
        let sock = AioSocket::new();
        sock.init(Family::V4).unwrap();
        let err = sock
            .bind(&InetAddress::loopback(Family::V6), 0)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[test]
    fn bind_listen_reports_local_address() {
        let sock = AioSocket::new();
        sock.init(Family::V4).unwrap();
        sock.set_reuse_addr(true).unwrap();
        sock.bind(&InetAddress::loopback(Family::V4), 0).unwrap();
        sock.listen(0).unwrap();
        assert!(sock.is_listening());

        let (addr, port) = sock.local_address().unwrap();
        assert_eq!(addr, InetAddress::loopback(Family::V4));
        assert_ne!(port, 0);
    }

    #[test]
    fn hard_close_is_idempotent() {
        let sock = AioSocket::new();
        sock.init(Family::V4).unwrap();
        sock.hard_close();
        assert!(!sock.is_open());
        sock.hard_close();
    }
}
