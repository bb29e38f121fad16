//! `io_uring` completion backend.
//!
//! The ring plays the completion port role: submissions push one or two
//! SQEs under a submission lock and return; a single reaper thread blocks
//! in `submit_and_wait`, decodes finished CQEs back into their boxed
//! operation descriptors (the `user_data` field carries the box), and
//! posts the callbacks to the engine's completion port for the workers.
//!
//! Shutdown pushes `AsyncCancel` for every outstanding descriptor plus a
//! sentinel NOP, then joins the reaper once the outstanding set drains;
//! canceled operations complete with `IoCanceled`.

use std::collections::HashSet;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use io_uring::{opcode, squeue, types, IoUring};
use log::{error, trace, warn};

use crate::engine::port::CompletionPort;
use crate::engine::{
    AcceptCallback, AioFile, AioSocket, ConnectCallback, FileDriver, FileIoCallback, SocketDriver,
    SocketReadCallback, SocketWriteCallback, WriteBuf, FP_ACCEPT, FP_CLOSE, FP_CONNECT,
    FP_FILE_READ, FP_FILE_WRITE, FP_READ, FP_SENDFILE, FP_START, FP_WRITE,
};
use crate::error::{Error, ErrorCode};
use crate::inet::InetAddress;
use crate::sys::net;

const RING_ENTRIES: u32 = 256;
const SEND_FILE_BUF_LEN: usize = 2048;

/// The `user_data` of wake-up NOPs, linked timeouts and cancels; CQEs
/// carrying it are not operation completions.
const SENTINEL: u64 = 0;

struct Ring(IoUring);

// SAFETY: the submission queue is only touched under `UringShared::sq`
// and the completion queue only by the reaper thread; the remaining ring
// entry points are thread-safe syscall wrappers.
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

struct SqGate {
    shutdown: bool,
}

struct UringShared {
    ring: Ring,
    sq: Mutex<SqGate>,
    outstanding: Mutex<HashSet<u64>>,
    port: Arc<CompletionPort>,
}

pub(crate) struct UringDriver {
    shared: Arc<UringShared>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

/// Newtype exposing the ring as the engine's socket backend.
pub(crate) struct UringSockets(pub(crate) Arc<UringDriver>);
/// Newtype exposing the ring as the engine's file backend.
pub(crate) struct UringFiles(pub(crate) Arc<UringDriver>);

struct AcceptStorage {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

enum UringOp {
    FileRead {
        file: Arc<AioFile>,
        fd: RawFd,
        pos: u64,
        buf: Vec<u8>,
        cb: FileIoCallback,
    },
    FileWrite {
        file: Arc<AioFile>,
        fd: RawFd,
        pos: u64,
        buf: Vec<u8>,
        cb: FileIoCallback,
    },
    Accept {
        listen: Arc<AioSocket>,
        fd: RawFd,
        target: Arc<AioSocket>,
        storage: Box<AcceptStorage>,
        cb: AcceptCallback,
    },
    Connect {
        sock: Arc<AioSocket>,
        fd: RawFd,
        addr: Box<net::RawAddr>,
        timeout: Option<Box<types::Timespec>>,
        cb: ConnectCallback,
    },
    Recv {
        sock: Arc<AioSocket>,
        fd: RawFd,
        buf: Vec<u8>,
        cb: SocketReadCallback,
    },
    Send {
        sock: Arc<AioSocket>,
        fd: RawFd,
        buf: WriteBuf,
        pos: usize,
        cb: SocketWriteCallback,
    },
    Sendfile {
        sock: Arc<AioSocket>,
        fd: RawFd,
        _file: Arc<AioFile>,
        file_fd: RawFd,
        bounce: Vec<u8>,
        index: usize,
        filled: usize,
        offset: u64,
        end: u64,
        written: usize,
        cb: SocketWriteCallback,
    },
    Close {
        sock: Arc<AioSocket>,
        fd: RawFd,
        cb: ConnectCallback,
    },
}

impl UringOp {
    fn failure_point(&self) -> &'static str {
        match self {
            UringOp::FileRead { .. } => FP_FILE_READ,
            UringOp::FileWrite { .. } => FP_FILE_WRITE,
            UringOp::Accept { .. } => FP_ACCEPT,
            UringOp::Connect { .. } => FP_CONNECT,
            UringOp::Recv { .. } => FP_READ,
            UringOp::Send { .. } => FP_WRITE,
            UringOp::Sendfile { .. } => FP_SENDFILE,
            UringOp::Close { .. } => FP_CLOSE,
        }
    }

    /// Builds the SQEs for this operation; pointers reference fields of
    /// the boxed descriptor, which outlives the kernel's use of them.
    fn entries(&mut self) -> Vec<squeue::Entry> {
        match self {
            UringOp::FileRead { fd, pos, buf, .. } => {
                vec![opcode::Read::new(types::Fd(*fd), buf.as_mut_ptr(), buf.len() as u32)
                    .offset(*pos)
                    .build()]
            }
            UringOp::FileWrite { fd, pos, buf, .. } => {
                vec![opcode::Write::new(types::Fd(*fd), buf.as_ptr(), buf.len() as u32)
                    .offset(*pos)
                    .build()]
            }
            UringOp::Accept { fd, storage, .. } => {
                storage.len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
                vec![opcode::Accept::new(
                    types::Fd(*fd),
                    &mut storage.storage as *mut _ as *mut libc::sockaddr,
                    &mut storage.len,
                )
                .build()]
            }
            UringOp::Connect { fd, addr, timeout, .. } => {
                let connect = opcode::Connect::new(types::Fd(*fd), addr.as_ptr(), addr.len());
                match timeout {
                    Some(ts) => vec![
                        connect.build().flags(squeue::Flags::IO_LINK),
                        opcode::LinkTimeout::new(&**ts).build().user_data(SENTINEL),
                    ],
                    None => vec![connect.build()],
                }
            }
            UringOp::Recv { fd, buf, .. } => {
                vec![opcode::Recv::new(types::Fd(*fd), buf.as_mut_ptr(), buf.len() as u32).build()]
            }
            UringOp::Send { fd, buf, pos, .. } => {
                let remaining = &buf.as_slice()[*pos..];
                vec![
                    opcode::Send::new(types::Fd(*fd), remaining.as_ptr(), remaining.len() as u32)
                        .build(),
                ]
            }
            UringOp::Sendfile {
                fd, bounce, index, filled, ..
            } => {
                let chunk = &bounce[*index..*filled];
                vec![opcode::Send::new(types::Fd(*fd), chunk.as_ptr(), chunk.len() as u32).build()]
            }
            UringOp::Close { fd, .. } => vec![opcode::Close::new(types::Fd(*fd)).build()],
        }
    }

    /// Invokes the callback with a failure; used when a descriptor can
    /// no longer be driven forward.
    fn fail(self, error: Error) {
        match self {
            UringOp::FileRead { file, buf, cb, .. } | UringOp::FileWrite { file, buf, cb, .. } => {
                cb(file, buf, 0, error)
            }
            UringOp::Accept { listen, target, cb, .. } => cb(listen, target, error),
            UringOp::Connect { sock, cb, .. } | UringOp::Close { sock, cb, .. } => cb(sock, error),
            UringOp::Recv { sock, buf, cb, .. } => cb(sock, buf, 0, error),
            UringOp::Send { sock, pos, cb, .. } => cb(sock, pos, error),
            UringOp::Sendfile { sock, written, cb, .. } => cb(sock, written, error),
        }
    }
}

impl UringDriver {
    pub(crate) fn new(port: Arc<CompletionPort>) -> Result<Arc<UringDriver>, Error> {
        let ring = IoUring::new(RING_ENTRIES)
            .map_err(|e| Error::from_io_error(&e, FP_START, "io_uring_setup"))?;

        let shared = Arc::new(UringShared {
            ring: Ring(ring),
            sq: Mutex::new(SqGate { shutdown: false }),
            outstanding: Mutex::new(HashSet::new()),
            port,
        });

        let shared2 = shared.clone();
        let reaper = thread::Builder::new()
            .name("evio-uring".to_string())
            .spawn(move || reap_loop(shared2))
            .map_err(|e| Error::from_io_error(&e, FP_START, "clone"))?;

        Ok(Arc::new(UringDriver {
            shared,
            reaper: Mutex::new(Some(reaper)),
        }))
    }

    fn shutdown_ring(&self) {
        {
            let mut gate = self.shared.sq.lock().unwrap();
            if !gate.shutdown {
                gate.shutdown = true;
                let outstanding: Vec<u64> = {
                    let set = self.shared.outstanding.lock().unwrap();
                    set.iter().copied().collect()
                };
                trace!("canceling {} outstanding ring operations", outstanding.len());
                for ud in outstanding {
                    let entry = opcode::AsyncCancel::new(ud).build().user_data(SENTINEL);
                    if let Err(err) = push_locked(&self.shared.ring.0, &[entry]) {
                        warn!("failed to push cancel: {}", err);
                    }
                }
                let nop = opcode::Nop::new().build().user_data(SENTINEL);
                if let Err(err) = push_locked(&self.shared.ring.0, &[nop]) {
                    warn!("failed to push shutdown nop: {}", err);
                }
                let _ = self.shared.ring.0.submit();
            }
        }
        if let Some(reaper) = self.reaper.lock().unwrap().take() {
            let _ = reaper.join();
        }
    }
}

/// Pushes entries while the caller holds the submission lock, flushing
/// the queue to the kernel when it is full.
fn push_locked(ring: &IoUring, entries: &[squeue::Entry]) -> std::io::Result<()> {
    for _ in 0..2 {
        // SAFETY: the submission lock is held, so this is the only live
        // submission queue handle.
        let ok = unsafe {
            let mut sq = ring.submission_shared();
            if sq.capacity() - sq.len() < entries.len() {
                false
            } else {
                for entry in entries {
                    if sq.push(entry).is_err() {
                        break;
                    }
                }
                true
            }
        };
        if ok {
            return Ok(());
        }
        ring.submit()?;
    }
    Err(std::io::Error::from(std::io::ErrorKind::WouldBlock))
}

/// Registers and submits a boxed descriptor. On failure the descriptor
/// comes back so the caller can fail its callback (or report a
/// synchronous submission error).
fn submit_boxed(
    shared: &Arc<UringShared>,
    mut op: Box<UringOp>,
) -> Result<(), (Box<UringOp>, Error)> {
    let fp = op.failure_point();
    let entries = op.entries();
    let ud = Box::into_raw(op) as u64;
    let entries: Vec<squeue::Entry> = {
        let mut tagged = Vec::with_capacity(entries.len());
        let mut first = true;
        for entry in entries {
            if first {
                tagged.push(entry.user_data(ud));
                first = false;
            } else {
                tagged.push(entry);
            }
        }
        tagged
    };

    shared.outstanding.lock().unwrap().insert(ud);

    let gate = shared.sq.lock().unwrap();
    // SAFETY: `ud` came from Box::into_raw just above and is not yet
    // owned by the kernel.
    let reclaim = |ud: u64| unsafe { Box::from_raw(ud as *mut UringOp) };

    if gate.shutdown {
        shared.outstanding.lock().unwrap().remove(&ud);
        return Err((reclaim(ud), Error::new(ErrorCode::InvalidArgument, fp)));
    }
    if let Err(err) = push_locked(&shared.ring.0, &entries) {
        shared.outstanding.lock().unwrap().remove(&ud);
        return Err((reclaim(ud), Error::from_io_error(&err, fp, "io_uring_enter")));
    }
    drop(gate);

    if let Err(err) = shared.ring.0.submit() {
        // The entries are in the queue; the reaper's next wait submits
        // them. Only log.
        warn!("io_uring submit failed: {}", err);
    }
    Ok(())
}

fn reap_loop(shared: Arc<UringShared>) {
    loop {
        match shared.ring.0.submit_and_wait(1) {
            Ok(_) => {}
            Err(ref err) if err.raw_os_error() == Some(libc::EINTR) => {}
            Err(ref err) if err.raw_os_error() == Some(libc::EBUSY) => {}
            Err(err) => {
                error!("io_uring wait failed: {}", err);
                thread::sleep(Duration::from_millis(10));
            }
        }

        let mut batch: Vec<(u64, i32)> = Vec::new();
        // SAFETY: this thread is the only consumer of the completion
        // queue.
        unsafe {
            let cq = shared.ring.0.completion_shared();
            for cqe in cq {
                batch.push((cqe.user_data(), cqe.result()));
            }
        }

        for (ud, res) in batch {
            if ud == SENTINEL {
                continue;
            }
            handle_cqe(&shared, ud, res);
        }

        if shared.sq.lock().unwrap().shutdown && shared.outstanding.lock().unwrap().is_empty() {
            trace!("ring reaper exiting");
            return;
        }
    }
}

/// Splits a CQE result into transferred bytes and an `Error`.
fn split_result(res: i32, fp: &'static str, syscall: &'static str) -> (usize, Error) {
    if res >= 0 {
        (res as usize, Error::none())
    } else {
        (0, Error::from_errno(-res, fp, syscall))
    }
}

fn handle_cqe(shared: &Arc<UringShared>, ud: u64, res: i32) {
    shared.outstanding.lock().unwrap().remove(&ud);
    // SAFETY: `ud` was produced by Box::into_raw in submit_boxed and the
    // kernel reports each descriptor exactly once.
    let op = unsafe { Box::from_raw(ud as *mut UringOp) };
    let port = shared.port.clone();

    match *op {
        UringOp::FileRead { file, buf, cb, .. } => {
            let (n, err) = split_result(res, FP_FILE_READ, "read");
            port.post_run(move || cb(file, buf, n, err));
        }
        UringOp::FileWrite { file, buf, cb, .. } => {
            let (n, err) = split_result(res, FP_FILE_WRITE, "write");
            port.post_run(move || cb(file, buf, n, err));
        }
        UringOp::Accept {
            listen,
            target,
            storage,
            cb,
            ..
        } => {
            if res < 0 {
                let (_, err) = split_result(res, FP_ACCEPT, "accept");
                port.post_run(move || cb(listen, target, err));
                return;
            }
            let new_fd = res as RawFd;
            // The ring's accept does not inherit non-blocking mode.
            if let Err(err) = net::set_nonblock_cloexec(new_fd) {
                warn!("could not set accepted fd {} non-blocking: {}", new_fd, err);
            }
            let peer = net::addr_from_storage(&storage.storage);
            let family = listen.family();
            let outcome = target.adopt(new_fd, family, peer);
            port.post_run(move || match outcome {
                Ok(()) => cb(listen, target, Error::none()),
                Err(err) => cb(listen, target, err),
            });
        }
        UringOp::Connect { sock, fd, timeout, cb, .. } => {
            let err = if res == 0 {
                if let Ok(peer) = net::peer_addr(fd) {
                    sock.set_peer(peer);
                }
                Error::none()
            } else if -res == libc::ECANCELED && timeout.is_some() {
                Error::new(ErrorCode::TimedOut, FP_CONNECT)
            } else {
                split_result(res, FP_CONNECT, "connect").1
            };
            port.post_run(move || cb(sock, err));
        }
        UringOp::Recv { sock, buf, cb, .. } => {
            let (n, err) = split_result(res, FP_READ, "recv");
            port.post_run(move || cb(sock, buf, n, err));
        }
        UringOp::Send {
            sock,
            fd,
            buf,
            mut pos,
            cb,
        } => {
            if res < 0 {
                let (_, err) = split_result(res, FP_WRITE, "send");
                port.post_run(move || cb(sock, pos, err));
                return;
            }
            pos += res as usize;
            if pos >= buf.len() {
                port.post_run(move || cb(sock, pos, Error::none()));
                return;
            }
            // Partial send: push the remainder.
            let again = Box::new(UringOp::Send { sock, fd, buf, pos, cb });
            if let Err((op, err)) = submit_boxed(shared, again) {
                let err = resubmit_error(err, FP_WRITE);
                port.post_run(move || op.fail(err));
            }
        }
        UringOp::Sendfile {
            sock,
            fd,
            _file,
            file_fd,
            bounce,
            mut index,
            filled,
            offset,
            end,
            mut written,
            cb,
        } => {
            if res < 0 {
                let (_, err) = split_result(res, FP_SENDFILE, "send");
                port.post_run(move || cb(sock, written, err));
                return;
            }
            index += res as usize;
            written += res as usize;
            let op = Box::new(UringOp::Sendfile {
                sock,
                fd,
                _file,
                file_fd,
                bounce,
                index,
                filled,
                offset,
                end,
                written,
                cb,
            });
            // Refill and resubmit on a worker, keeping file reads off
            // the reaper thread.
            let shared2 = shared.clone();
            port.post_run(move || sendfile_step(&shared2, op));
        }
        UringOp::Close { sock, cb, .. } => {
            let (_, err) = split_result(res, FP_CLOSE, "close");
            sock.mark_closed();
            port.post_run(move || cb(sock, err));
        }
    }
}

/// Turns the "submissions are gated" error of a ring that began shutting
/// down into the cancellation the in-flight operation should observe.
fn resubmit_error(err: Error, fp: &'static str) -> Error {
    if err.code() == ErrorCode::InvalidArgument {
        Error::new(ErrorCode::IoCanceled, fp)
    } else {
        err
    }
}

/// Advances the sendfile emulation: refills the bounce buffer from the
/// file if it is drained, completes the operation if the range is done,
/// and otherwise pushes the next send.
fn sendfile_step(shared: &Arc<UringShared>, op: Box<UringOp>) {
    let UringOp::Sendfile {
        sock,
        fd,
        _file,
        file_fd,
        mut bounce,
        mut index,
        mut filled,
        mut offset,
        end,
        written,
        cb,
    } = *op
    else {
        unreachable!("sendfile_step on a non-sendfile descriptor");
    };

    if index == filled {
        if offset == end {
            cb(sock, written, Error::none());
            return;
        }
        let want = (end - offset).min(SEND_FILE_BUF_LEN as u64) as usize;
        match net::pread(file_fd, &mut bounce[..want], offset) {
            // File ended before the requested range.
            Ok(0) => {
                cb(sock, written, Error::none());
                return;
            }
            Ok(n) => {
                filled = n;
                index = 0;
                offset += n as u64;
            }
            Err(err) => {
                cb(sock, written, Error::from_io_error(&err, FP_SENDFILE, "pread"));
                return;
            }
        }
    }

    let op = Box::new(UringOp::Sendfile {
        sock,
        fd,
        _file,
        file_fd,
        bounce,
        index,
        filled,
        offset,
        end,
        written,
        cb,
    });
    if let Err((op, err)) = submit_boxed(shared, op) {
        op.fail(resubmit_error(err, FP_SENDFILE));
    }
}

impl SocketDriver for UringSockets {
    fn accept(
        &self,
        listen: Arc<AioSocket>,
        target: Arc<AioSocket>,
        cb: AcceptCallback,
    ) -> Result<(), Error> {
        let fd = listen
            .raw_fd()
            .ok_or(Error::new(ErrorCode::InvalidHandle, FP_ACCEPT))?;
        let op = Box::new(UringOp::Accept {
            listen,
            fd,
            target,
            storage: Box::new(AcceptStorage {
                storage: unsafe { std::mem::zeroed() },
                len: 0,
            }),
            cb,
        });
        submit_boxed(&self.0.shared, op).map_err(|(_, err)| err)
    }

    fn connect(
        &self,
        sock: Arc<AioSocket>,
        addr: InetAddress,
        port: u16,
        timeout: Option<Duration>,
        cb: ConnectCallback,
    ) -> Result<(), Error> {
        let fd = sock
            .raw_fd()
            .ok_or(Error::new(ErrorCode::InvalidHandle, FP_CONNECT))?;
        let raw = net::RawAddr::new(&addr, port)
            .ok_or(Error::new(ErrorCode::InvalidArgument, FP_CONNECT))?;
        let timeout = timeout.filter(|t| !t.is_zero()).map(|t| {
            Box::new(
                types::Timespec::new()
                    .sec(t.as_secs())
                    .nsec(t.subsec_nanos()),
            )
        });
        let op = Box::new(UringOp::Connect {
            sock,
            fd,
            addr: Box::new(raw),
            timeout,
            cb,
        });
        submit_boxed(&self.0.shared, op).map_err(|(_, err)| err)
    }

    fn read(&self, sock: Arc<AioSocket>, buf: Vec<u8>, cb: SocketReadCallback) -> Result<(), Error> {
        let fd = sock
            .raw_fd()
            .ok_or(Error::new(ErrorCode::InvalidHandle, FP_READ))?;
        let op = Box::new(UringOp::Recv { sock, fd, buf, cb });
        submit_boxed(&self.0.shared, op).map_err(|(_, err)| err)
    }

    fn write(&self, sock: Arc<AioSocket>, buf: WriteBuf, cb: SocketWriteCallback) -> Result<(), Error> {
        let fd = sock
            .raw_fd()
            .ok_or(Error::new(ErrorCode::InvalidHandle, FP_WRITE))?;
        let op = Box::new(UringOp::Send {
            sock,
            fd,
            buf,
            pos: 0,
            cb,
        });
        submit_boxed(&self.0.shared, op).map_err(|(_, err)| err)
    }

    fn sendfile(
        &self,
        sock: Arc<AioSocket>,
        file: Arc<AioFile>,
        pos: u64,
        len: u64,
        cb: SocketWriteCallback,
    ) -> Result<(), Error> {
        let fd = sock
            .raw_fd()
            .ok_or(Error::new(ErrorCode::InvalidHandle, FP_SENDFILE))?;
        let file_fd = file
            .raw_fd()
            .ok_or(Error::new(ErrorCode::InvalidHandle, FP_SENDFILE))?;
        let op = Box::new(UringOp::Sendfile {
            sock,
            fd,
            _file: file,
            file_fd,
            bounce: vec![0; SEND_FILE_BUF_LEN],
            index: 0,
            filled: 0,
            offset: pos,
            end: pos + len,
            written: 0,
            cb,
        });
        // The first step reads from the file, so run it on a worker the
        // same way the self-posted descriptors of the blocking backend
        // are issued.
        let shared = self.0.shared.clone();
        if shared.sq.lock().unwrap().shutdown {
            return Err(Error::new(ErrorCode::InvalidArgument, FP_SENDFILE));
        }
        shared.port.clone().post_run(move || sendfile_step(&shared, op));
        Ok(())
    }

    fn close(&self, sock: Arc<AioSocket>, cb: ConnectCallback) -> Result<(), Error> {
        let fd = sock
            .raw_fd()
            .ok_or(Error::new(ErrorCode::InvalidHandle, FP_CLOSE))?;
        let op = Box::new(UringOp::Close { sock, fd, cb });
        submit_boxed(&self.0.shared, op).map_err(|(_, err)| err)
    }

    fn shutdown(&self) {
        self.0.shutdown_ring();
    }
}

impl FileDriver for UringFiles {
    fn read(
        &self,
        file: Arc<AioFile>,
        pos: u64,
        buf: Vec<u8>,
        cb: FileIoCallback,
    ) -> Result<(), Error> {
        let fd = file
            .raw_fd()
            .ok_or(Error::new(ErrorCode::InvalidHandle, FP_FILE_READ))?;
        let op = Box::new(UringOp::FileRead {
            file,
            fd,
            pos,
            buf,
            cb,
        });
        submit_boxed(&self.0.shared, op).map_err(|(_, err)| err)
    }

    fn write(
        &self,
        file: Arc<AioFile>,
        pos: u64,
        buf: Vec<u8>,
        cb: FileIoCallback,
    ) -> Result<(), Error> {
        let fd = file
            .raw_fd()
            .ok_or(Error::new(ErrorCode::InvalidHandle, FP_FILE_WRITE))?;
        let op = Box::new(UringOp::FileWrite {
            file,
            fd,
            pos,
            buf,
            cb,
        });
        submit_boxed(&self.0.shared, op).map_err(|(_, err)| err)
    }

    fn shutdown(&self) {
        self.0.shutdown_ring();
    }
}
