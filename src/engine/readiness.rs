//! Readiness-poll socket backend.
//!
//! One poll thread owns the selector and a per-descriptor record with one
//! read-class and one write-class operation slot. Submissions fill a slot,
//! mark the descriptor dirty and wake the poll thread through a pipe; the
//! poll thread arms interest, performs one non-blocking syscall step per
//! readiness event, and hands finished operations to the completion port
//! so user callbacks never run on the poll thread.

use std::collections::HashMap;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{error, trace, warn};

use crate::engine::port::CompletionPort;
use crate::engine::{
    AcceptCallback, AioFile, AioSocket, ConnectCallback, SelectorKind, SocketDriver,
    SocketReadCallback, SocketWriteCallback, WriteBuf, FP_ACCEPT, FP_CLOSE, FP_CONNECT, FP_READ,
    FP_SENDFILE, FP_START, FP_WRITE,
};
use crate::error::{Error, ErrorCode};
use crate::inet::InetAddress;
use crate::sys::net;
use crate::sys::selector::{Event, Events, Selector, READABLE, WRITABLE};
use crate::sys::Waker;

/// Bounce buffer size for the sendfile emulation.
const SEND_FILE_BUF_LEN: usize = 2048;

type Finished = Vec<Box<dyn FnOnce() + Send>>;

pub(crate) struct ReadinessDriver {
    shared: Arc<ServiceShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

struct ServiceShared {
    state: Mutex<ServiceState>,
    waker: Waker,
    port: Arc<CompletionPort>,
    shutdown: AtomicBool,
}

struct ServiceState {
    socks: HashMap<RawFd, SockData>,
    dirty: Vec<RawFd>,
}

impl ServiceState {
    fn mark_dirty(&mut self, fd: RawFd) {
        if !self.dirty.contains(&fd) {
            self.dirty.push(fd);
        }
    }
}

struct SockData {
    socket: Arc<AioSocket>,
    /// Interest currently applied to the selector.
    armed: u8,
    registered: bool,
    read_op: Option<ReadOp>,
    write_op: Option<WriteOp>,
    close_cb: Option<ConnectCallback>,
}

impl SockData {
    fn new(socket: Arc<AioSocket>) -> SockData {
        SockData {
            socket,
            armed: 0,
            registered: false,
            read_op: None,
            write_op: None,
            close_cb: None,
        }
    }

    fn interest(&self) -> u8 {
        let mut interest = 0;
        if self.read_op.is_some() {
            interest |= READABLE;
        }
        if self.write_op.is_some() {
            interest |= WRITABLE;
        }
        interest
    }
}

enum ReadOp {
    Accept {
        target: Arc<AioSocket>,
        cb: AcceptCallback,
    },
    Read {
        buf: Vec<u8>,
        cb: SocketReadCallback,
    },
}

enum WriteOp {
    Connect {
        deadline: Option<Instant>,
        cb: ConnectCallback,
    },
    Write {
        buf: WriteBuf,
        pos: usize,
        cb: SocketWriteCallback,
    },
    Sendfile {
        /// Keeps the file's descriptor alive for the whole emulation.
        _file: Arc<AioFile>,
        file_fd: RawFd,
        bounce: Box<[u8; SEND_FILE_BUF_LEN]>,
        filled: usize,
        index: usize,
        offset: u64,
        end: u64,
        written: usize,
        cb: SocketWriteCallback,
    },
}

impl ReadinessDriver {
    pub(crate) fn new(port: Arc<CompletionPort>, kind: SelectorKind) -> Result<ReadinessDriver, Error> {
        let selector = match kind {
            SelectorKind::Default => Selector::new(),
            #[cfg(any(target_os = "linux", target_os = "android"))]
            SelectorKind::Epoll => Selector::new_epoll(),
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            SelectorKind::Epoll => {
                return Err(Error::new(ErrorCode::NotSupported, FP_START));
            }
            SelectorKind::Poll => Selector::new_poll(),
        }
        .map_err(|e| Error::from_io_error(&e, FP_START, "epoll_create1"))?;

        let waker = Waker::new().map_err(|e| Error::from_io_error(&e, FP_START, "pipe"))?;

        let shared = Arc::new(ServiceShared {
            state: Mutex::new(ServiceState {
                socks: HashMap::new(),
                dirty: Vec::new(),
            }),
            waker,
            port,
            shutdown: AtomicBool::new(false),
        });

        let shared2 = shared.clone();
        let thread = thread::Builder::new()
            .name("evio-poll".to_string())
            .spawn(move || poll_loop(shared2, selector))
            .map_err(|e| Error::from_io_error(&e, FP_START, "clone"))?;

        Ok(ReadinessDriver {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Runs `fill` against the descriptor's record under the service
    /// lock, then wakes the poll thread.
    fn submit<F>(&self, sock: &Arc<AioSocket>, fp: &'static str, fill: F) -> Result<(), Error>
    where
        F: FnOnce(&mut SockData) -> Result<(), Error>,
    {
        let fd = sock
            .raw_fd()
            .ok_or(Error::new(ErrorCode::InvalidHandle, fp))?;
        let mut state = self.shared.state.lock().unwrap();
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorCode::InvalidArgument, fp));
        }
        let data = state
            .socks
            .entry(fd)
            .or_insert_with(|| SockData::new(sock.clone()));
        if data.close_cb.is_some() {
            return Err(Error::new(ErrorCode::InvalidArgument, fp));
        }
        fill(data)?;
        state.mark_dirty(fd);
        drop(state);
        if let Err(err) = self.shared.waker.wake() {
            warn!("failed to wake poll thread: {}", err);
        }
        Ok(())
    }
}

impl SocketDriver for ReadinessDriver {
    fn accept(
        &self,
        listen: Arc<AioSocket>,
        target: Arc<AioSocket>,
        cb: AcceptCallback,
    ) -> Result<(), Error> {
        self.submit(&listen, FP_ACCEPT, |data| {
            if data.read_op.is_some() {
                return Err(Error::new(ErrorCode::InvalidArgument, FP_ACCEPT));
            }
            data.read_op = Some(ReadOp::Accept { target, cb });
            Ok(())
        })
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
        self.submit(&sock, FP_CONNECT, move |data| {
            if data.write_op.is_some() {
                return Err(Error::new(ErrorCode::InvalidArgument, FP_CONNECT));
            }
            match net::connect(fd, &addr, port) {
                // Connected immediately or in progress: either way the
                // socket turns writable and SO_ERROR has the verdict.
                Ok(_) => {
                    let deadline = timeout
                        .filter(|t| !t.is_zero())
                        .map(|t| Instant::now() + t);
                    data.write_op = Some(WriteOp::Connect { deadline, cb });
                    Ok(())
                }
                Err(err) => {
                    // The submission itself stands; the failure arrives
                    // through the callback like any other.
                    let error = Error::from_io_error(&err, FP_CONNECT, "connect");
                    data.write_op = Some(WriteOp::Connect {
                        deadline: Some(Instant::now()),
                        cb: Box::new(move |sock, _| cb(sock, error)),
                    });
                    Ok(())
                }
            }
        })
    }

    fn read(&self, sock: Arc<AioSocket>, buf: Vec<u8>, cb: SocketReadCallback) -> Result<(), Error> {
        self.submit(&sock, FP_READ, |data| {
            if data.read_op.is_some() {
                return Err(Error::new(ErrorCode::InvalidArgument, FP_READ));
            }
            data.read_op = Some(ReadOp::Read { buf, cb });
            Ok(())
        })
    }

    fn write(&self, sock: Arc<AioSocket>, buf: WriteBuf, cb: SocketWriteCallback) -> Result<(), Error> {
        self.submit(&sock, FP_WRITE, |data| {
            if data.write_op.is_some() {
                return Err(Error::new(ErrorCode::InvalidArgument, FP_WRITE));
            }
            data.write_op = Some(WriteOp::Write { buf, pos: 0, cb });
            Ok(())
        })
    }

    fn sendfile(
        &self,
        sock: Arc<AioSocket>,
        file: Arc<AioFile>,
        pos: u64,
        len: u64,
        cb: SocketWriteCallback,
    ) -> Result<(), Error> {
        let file_fd = file
            .raw_fd()
            .ok_or(Error::new(ErrorCode::InvalidHandle, FP_SENDFILE))?;
        self.submit(&sock, FP_SENDFILE, move |data| {
            if data.write_op.is_some() {
                return Err(Error::new(ErrorCode::InvalidArgument, FP_SENDFILE));
            }
            data.write_op = Some(WriteOp::Sendfile {
                _file: file,
                file_fd,
                bounce: Box::new([0; SEND_FILE_BUF_LEN]),
                filled: 0,
                index: 0,
                offset: pos,
                end: pos + len,
                written: 0,
                cb,
            });
            Ok(())
        })
    }

    fn close(&self, sock: Arc<AioSocket>, cb: ConnectCallback) -> Result<(), Error> {
        self.submit(&sock, FP_CLOSE, |data| {
            data.close_cb = Some(cb);
            Ok(())
        })
    }

    fn shutdown(&self) {
        {
            let _state = self.shared.state.lock().unwrap();
            self.shared.shutdown.store(true, Ordering::SeqCst);
        }
        if let Err(err) = self.shared.waker.wake() {
            warn!("failed to wake poll thread for shutdown: {}", err);
        }
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}

fn post_finished(port: &CompletionPort, finished: &mut Finished) {
    for f in finished.drain(..) {
        port.post_run(f);
    }
}

fn poll_loop(shared: Arc<ServiceShared>, mut selector: Selector) {
    let waker_fd = shared.waker.as_raw_fd();
    if let Err(err) = selector.register(waker_fd, READABLE) {
        error!("poll thread could not register its waker: {}", err);
        return;
    }

    let mut events = Events::new();
    let mut finished: Finished = Vec::new();

    loop {
        let timeout = {
            let mut state = shared.state.lock().unwrap();
            if shared.shutdown.load(Ordering::SeqCst) {
                cancel_all(&mut state, &mut selector, &mut finished);
                drop(state);
                post_finished(&shared.port, &mut finished);
                trace!("poll thread exiting");
                return;
            }
            apply_dirty(&mut state, &mut selector, &mut finished);
            next_connect_deadline(&state)
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
        };
        post_finished(&shared.port, &mut finished);

        if let Err(err) = selector.select(&mut events, timeout) {
            error!("selector wait failed: {}", err);
            thread::sleep(Duration::from_millis(10));
            continue;
        }

        let mut state = shared.state.lock().unwrap();
        for event in events.iter().copied() {
            if event.fd == waker_fd {
                shared.waker.drain();
                continue;
            }
            handle_event(&mut state, &mut selector, event, &mut finished);
        }
        expire_connects(&mut state, &mut selector, &mut finished);
        drop(state);
        post_finished(&shared.port, &mut finished);
    }
}

/// Applies interest changes and performs pending closes for every
/// descriptor touched since the last pass.
fn apply_dirty(state: &mut ServiceState, selector: &mut Selector, finished: &mut Finished) {
    let dirty = mem::take(&mut state.dirty);
    for fd in dirty {
        if state
            .socks
            .get(&fd)
            .map(|data| data.close_cb.is_some())
            .unwrap_or(false)
        {
            let mut data = state.socks.remove(&fd).unwrap();
            if data.registered {
                let _ = selector.deregister(fd);
            }
            cancel_ops(&mut data, Error::new(ErrorCode::IoCanceled, FP_CLOSE), finished);

            let error = match net::close(fd) {
                Ok(()) => Error::none(),
                Err(err) => Error::from_io_error(&err, FP_CLOSE, "close"),
            };
            data.socket.mark_closed();
            let cb = data.close_cb.take().unwrap();
            let socket = data.socket.clone();
            trace!("closed socket fd {}", fd);
            finished.push(Box::new(move || cb(socket, error)));
            continue;
        }
        if let Some(data) = state.socks.get_mut(&fd) {
            sync_interest(fd, data, selector, finished);
        }
    }
}

/// Brings the selector's registration for `fd` in line with the armed
/// operation slots.
fn sync_interest(fd: RawFd, data: &mut SockData, selector: &mut Selector, finished: &mut Finished) {
    let want = data.interest();
    if want == data.armed && (want != 0) == data.registered {
        return;
    }
    let result = if want == 0 {
        if data.registered {
            data.registered = false;
            selector.deregister(fd)
        } else {
            Ok(())
        }
    } else if data.registered {
        selector.reregister(fd, want)
    } else {
        selector.register(fd, want).map(|()| data.registered = true)
    };
    data.armed = if data.registered { want } else { 0 };

    if let Err(err) = result {
        // Arming failed; the operations can never complete, so fail them.
        warn!("selector update for fd {} failed: {}", fd, err);
        let error = Error::from_io_error(&err, FP_START, "epoll_ctl");
        cancel_ops(data, error, finished);
    }
}

/// Fails every armed operation on the record with `error`.
fn cancel_ops(data: &mut SockData, error: Error, finished: &mut Finished) {
    let socket = data.socket.clone();
    if let Some(op) = data.read_op.take() {
        let socket = socket.clone();
        match op {
            ReadOp::Accept { target, cb } => {
                finished.push(Box::new(move || cb(socket, target, error)));
            }
            ReadOp::Read { buf, cb } => {
                finished.push(Box::new(move || cb(socket, buf, 0, error)));
            }
        }
    }
    if let Some(op) = data.write_op.take() {
        match op {
            WriteOp::Connect { cb, .. } => {
                finished.push(Box::new(move || cb(socket, error)));
            }
            WriteOp::Write { pos, cb, .. } => {
                finished.push(Box::new(move || cb(socket, pos, error)));
            }
            WriteOp::Sendfile { written, cb, .. } => {
                finished.push(Box::new(move || cb(socket, written, error)));
            }
        }
    }
}

fn handle_event(
    state: &mut ServiceState,
    selector: &mut Selector,
    event: Event,
    finished: &mut Finished,
) {
    let Some(data) = state.socks.get_mut(&event.fd) else {
        return;
    };
    if event.readable && data.read_op.is_some() {
        handle_read_ready(event.fd, data, finished);
    }
    if event.writable && data.write_op.is_some() {
        handle_write_ready(event.fd, data, finished);
    }
    sync_interest(event.fd, data, selector, finished);
}

fn handle_read_ready(fd: RawFd, data: &mut SockData, finished: &mut Finished) {
    match data.read_op.take().expect("read slot empty") {
        ReadOp::Accept { target, cb } => match net::accept(fd) {
            Ok((new_fd, peer)) => {
                trace!("accepted fd {} on listener fd {}", new_fd, fd);
                let listener = data.socket.clone();
                let family = listener.family();
                match target.adopt(new_fd, family, peer) {
                    Ok(()) => finished.push(Box::new(move || cb(listener, target, Error::none()))),
                    Err(error) => finished.push(Box::new(move || cb(listener, target, error))),
                }
            }
            Err(ref err) if net::is_would_block(err) => {
                data.read_op = Some(ReadOp::Accept { target, cb });
            }
            Err(err) => {
                let listener = data.socket.clone();
                let error = Error::from_io_error(&err, FP_ACCEPT, "accept");
                finished.push(Box::new(move || cb(listener, target, error)));
            }
        },
        ReadOp::Read { mut buf, cb } => match net::recv(fd, &mut buf) {
            Ok(n) => {
                let socket = data.socket.clone();
                finished.push(Box::new(move || cb(socket, buf, n, Error::none())));
            }
            Err(ref err) if net::is_would_block(err) => {
                data.read_op = Some(ReadOp::Read { buf, cb });
            }
            Err(err) => {
                let socket = data.socket.clone();
                let error = Error::from_io_error(&err, FP_READ, "recv");
                finished.push(Box::new(move || cb(socket, buf, 0, error)));
            }
        },
    }
}

fn handle_write_ready(fd: RawFd, data: &mut SockData, finished: &mut Finished) {
    match data.write_op.take().expect("write slot empty") {
        WriteOp::Connect { cb, .. } => {
            let socket = data.socket.clone();
            match net::take_socket_error(fd) {
                Ok(()) => {
                    if let Ok(peer) = net::peer_addr(fd) {
                        socket.set_peer(peer);
                    }
                    trace!("connect finished on fd {}", fd);
                    finished.push(Box::new(move || cb(socket, Error::none())));
                }
                Err(err) => {
                    let error = Error::from_io_error(&err, FP_CONNECT, "connect");
                    finished.push(Box::new(move || cb(socket, error)));
                }
            }
        }
        WriteOp::Write { buf, mut pos, cb } => loop {
            let remaining = &buf.as_slice()[pos..];
            if remaining.is_empty() {
                let socket = data.socket.clone();
                finished.push(Box::new(move || cb(socket, pos, Error::none())));
                break;
            }
            match net::send(fd, remaining) {
                Ok(n) => pos += n,
                Err(ref err) if net::is_would_block(err) => {
                    data.write_op = Some(WriteOp::Write { buf, pos, cb });
                    break;
                }
                Err(err) => {
                    let socket = data.socket.clone();
                    let error = Error::from_io_error(&err, FP_WRITE, "send");
                    finished.push(Box::new(move || cb(socket, pos, error)));
                    break;
                }
            }
        },
        WriteOp::Sendfile {
            _file,
            file_fd,
            mut bounce,
            mut filled,
            mut index,
            mut offset,
            end,
            mut written,
            cb,
        } => loop {
            if index == filled {
                if offset == end {
                    let socket = data.socket.clone();
                    finished.push(Box::new(move || cb(socket, written, Error::none())));
                    break;
                }
                let want = (end - offset).min(SEND_FILE_BUF_LEN as u64) as usize;
                match net::pread(file_fd, &mut bounce[..want], offset) {
                    // The file ended before the requested range did.
                    Ok(0) => {
                        let socket = data.socket.clone();
                        finished.push(Box::new(move || cb(socket, written, Error::none())));
                        break;
                    }
                    Ok(n) => {
                        filled = n;
                        index = 0;
                        offset += n as u64;
                    }
                    Err(err) => {
                        let socket = data.socket.clone();
                        let error = Error::from_io_error(&err, FP_SENDFILE, "pread");
                        finished.push(Box::new(move || cb(socket, written, error)));
                        break;
                    }
                }
            }
            match net::send(fd, &bounce[index..filled]) {
                Ok(n) => {
                    index += n;
                    written += n;
                }
                Err(ref err) if net::is_would_block(err) => {
                    data.write_op = Some(WriteOp::Sendfile {
                        _file,
                        file_fd,
                        bounce,
                        filled,
                        index,
                        offset,
                        end,
                        written,
                        cb,
                    });
                    break;
                }
                Err(err) => {
                    let socket = data.socket.clone();
                    let error = Error::from_io_error(&err, FP_SENDFILE, "send");
                    finished.push(Box::new(move || cb(socket, written, error)));
                    break;
                }
            }
        },
    }
}

fn next_connect_deadline(state: &ServiceState) -> Option<Instant> {
    state
        .socks
        .values()
        .filter_map(|data| match &data.write_op {
            Some(WriteOp::Connect {
                deadline: Some(deadline),
                ..
            }) => Some(*deadline),
            _ => None,
        })
        .min()
}

fn expire_connects(state: &mut ServiceState, selector: &mut Selector, finished: &mut Finished) {
    let now = Instant::now();
    let expired: Vec<RawFd> = state
        .socks
        .iter()
        .filter_map(|(fd, data)| match &data.write_op {
            Some(WriteOp::Connect {
                deadline: Some(deadline),
                ..
            }) if *deadline <= now => Some(*fd),
            _ => None,
        })
        .collect();

    for fd in expired {
        let data = state.socks.get_mut(&fd).expect("expired fd missing");
        if let Some(WriteOp::Connect { cb, .. }) = data.write_op.take() {
            let socket = data.socket.clone();
            finished.push(Box::new(move || {
                cb(socket, Error::new(ErrorCode::TimedOut, FP_CONNECT))
            }));
        }
        sync_interest(fd, data, selector, finished);
    }
}

/// Shutdown path: every armed operation completes with `IoCanceled`,
/// pending closes still close their socket.
fn cancel_all(state: &mut ServiceState, selector: &mut Selector, finished: &mut Finished) {
    let fds: Vec<RawFd> = state.socks.keys().copied().collect();
    for fd in fds {
        let mut data = state.socks.remove(&fd).expect("fd disappeared");
        if data.registered {
            let _ = selector.deregister(fd);
        }
        cancel_ops(
            &mut data,
            Error::new(ErrorCode::IoCanceled, "AioEngine::shutdown"),
            finished,
        );
        if let Some(cb) = data.close_cb.take() {
            let error = match net::close(fd) {
                Ok(()) => Error::none(),
                Err(err) => Error::from_io_error(&err, FP_CLOSE, "close"),
            };
            data.socket.mark_closed();
            let socket = data.socket.clone();
            finished.push(Box::new(move || cb(socket, error)));
        }
    }
}
