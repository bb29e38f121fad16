//! The asynchronous I/O engine.
//!
//! [`AioEngine`] multiplexes file and socket operations over a pool of
//! worker threads. Submissions validate their arguments synchronously and
//! return immediately; results are delivered to the supplied callback on a
//! worker thread, exactly once per accepted submission — including when an
//! operation is canceled by [`AioEngine::shutdown`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::trace;

mod file;
mod file_blocking;
mod port;
mod readiness;
mod socket;
#[cfg(target_os = "linux")]
mod uring;

pub use self::file::{Access, AioFile, OpenMode};
pub use self::socket::AioSocket;

use self::file_blocking::BlockingFileDriver;
use self::port::{CompletionPort, Task};
use self::readiness::ReadinessDriver;
use crate::error::{Error, ErrorCode};
use crate::inet::{Family, InetAddress};

pub(crate) const FP_START: &str = "AioEngine::start";
pub(crate) const FP_FILE_READ: &str = "AioEngine::file_read";
pub(crate) const FP_FILE_WRITE: &str = "AioEngine::file_write";
pub(crate) const FP_ACCEPT: &str = "AioEngine::socket_accept";
pub(crate) const FP_CONNECT: &str = "AioEngine::socket_connect";
pub(crate) const FP_READ: &str = "AioEngine::socket_read";
pub(crate) const FP_WRITE: &str = "AioEngine::socket_write";
pub(crate) const FP_SENDFILE: &str = "AioEngine::socket_sendfile";
pub(crate) const FP_CLOSE: &str = "AioEngine::socket_close";

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_handle_id() -> u64 {
    NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Completion callback for file reads and writes: the file, the buffer
/// that was lent to the engine, the bytes transferred, and the result.
pub type FileIoCallback = Box<dyn FnOnce(Arc<AioFile>, Vec<u8>, usize, Error) + Send>;
/// Completion callback for socket reads.
pub type SocketReadCallback = Box<dyn FnOnce(Arc<AioSocket>, Vec<u8>, usize, Error) + Send>;
/// Completion callback for socket writes and sendfile.
pub type SocketWriteCallback = Box<dyn FnOnce(Arc<AioSocket>, usize, Error) + Send>;
/// Completion callback for accepts: the listener and the accept target.
pub type AcceptCallback = Box<dyn FnOnce(Arc<AioSocket>, Arc<AioSocket>, Error) + Send>;
/// Completion callback for connects and closes.
pub type ConnectCallback = Box<dyn FnOnce(Arc<AioSocket>, Error) + Send>;

/// Data queued for transmission.
///
/// Distinguishes borrowed static bytes (canned protocol text) from
/// buffers the submitter hands over, so nothing is copied either way.
#[derive(Debug)]
pub enum WriteBuf {
    /// Borrowed bytes with static lifetime.
    Static(&'static [u8]),
    /// An owned buffer, dropped once written.
    Owned(Vec<u8>),
}

impl WriteBuf {
    /// The bytes to transmit.
    pub fn as_slice(&self) -> &[u8] {
        match self {
            WriteBuf::Static(data) => data,
            WriteBuf::Owned(data) => data,
        }
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Whether there is nothing to transmit.
    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }
}

impl From<&'static [u8]> for WriteBuf {
    fn from(data: &'static [u8]) -> WriteBuf {
        WriteBuf::Static(data)
    }
}

impl From<&'static str> for WriteBuf {
    fn from(data: &'static str) -> WriteBuf {
        WriteBuf::Static(data.as_bytes())
    }
}

impl From<Vec<u8>> for WriteBuf {
    fn from(data: Vec<u8>) -> WriteBuf {
        WriteBuf::Owned(data)
    }
}

impl From<String> for WriteBuf {
    fn from(data: String) -> WriteBuf {
        WriteBuf::Owned(data.into_bytes())
    }
}

/// Which mechanism drives socket operations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SocketBackend {
    /// The platform preference (currently the readiness backend).
    #[default]
    Default,
    /// A poll thread over `epoll(7)`/`poll(2)` plus the worker pool.
    ReadinessPoll,
    /// The Linux `io_uring` completion ring.
    CompletionPort,
}

/// Which mechanism drives file operations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FileBackend {
    /// The platform preference (currently the blocking backend).
    #[default]
    Default,
    /// Positioned blocking reads and writes on the worker pool.
    Blocking,
    /// The Linux `io_uring` completion ring.
    NativeAsync,
}

/// Which readiness primitive the readiness backend polls with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SelectorKind {
    /// `epoll(7)` where available, `poll(2)` otherwise.
    #[default]
    Default,
    /// Force `epoll(7)`.
    Epoll,
    /// Force `poll(2)`.
    Poll,
}

/// Engine construction options.
#[derive(Clone, Debug, Default)]
pub struct EngineConfig {
    /// Worker thread count; zero means one per CPU.
    pub worker_threads: usize,
    /// Socket backend selection.
    pub socket_backend: SocketBackend,
    /// File backend selection.
    pub file_backend: FileBackend,
    /// Readiness selector selection.
    pub selector: SelectorKind,
}

const STATE_NONE: usize = 0;
const STATE_STARTED: usize = 1;
const STATE_SHUTDOWN: usize = 2;

/// Backend seam for socket operations.
///
/// Implementations submit the operation and guarantee exactly one
/// callback invocation per accepted submission, including cancellation
/// on shutdown.
pub(crate) trait SocketDriver: Send + Sync {
    fn accept(
        &self,
        listen: Arc<AioSocket>,
        target: Arc<AioSocket>,
        cb: AcceptCallback,
    ) -> Result<(), Error>;
    fn connect(
        &self,
        sock: Arc<AioSocket>,
        addr: InetAddress,
        port: u16,
        timeout: Option<Duration>,
        cb: ConnectCallback,
    ) -> Result<(), Error>;
    fn read(&self, sock: Arc<AioSocket>, buf: Vec<u8>, cb: SocketReadCallback)
        -> Result<(), Error>;
    fn write(
        &self,
        sock: Arc<AioSocket>,
        buf: WriteBuf,
        cb: SocketWriteCallback,
    ) -> Result<(), Error>;
    fn sendfile(
        &self,
        sock: Arc<AioSocket>,
        file: Arc<AioFile>,
        pos: u64,
        len: u64,
        cb: SocketWriteCallback,
    ) -> Result<(), Error>;
    fn close(&self, sock: Arc<AioSocket>, cb: ConnectCallback) -> Result<(), Error>;
    fn shutdown(&self);
}

/// Backend seam for file operations.
pub(crate) trait FileDriver: Send + Sync {
    fn read(
        &self,
        file: Arc<AioFile>,
        pos: u64,
        buf: Vec<u8>,
        cb: FileIoCallback,
    ) -> Result<(), Error>;
    fn write(
        &self,
        file: Arc<AioFile>,
        pos: u64,
        buf: Vec<u8>,
        cb: FileIoCallback,
    ) -> Result<(), Error>;
    fn shutdown(&self);
}

struct Drivers {
    sockets: Box<dyn SocketDriver>,
    files: Box<dyn FileDriver>,
}

enum Handle {
    File(Arc<AioFile>),
    Socket(Arc<AioSocket>),
}

/// State shared between the engine front, its backends and in-flight
/// operations.
pub(crate) struct EngineShared {
    config: EngineConfig,
    state: AtomicUsize,
    pending: AtomicUsize,
    port: Arc<CompletionPort>,
    handles: Mutex<HashMap<u64, Handle>>,
    drivers: OnceLock<Drivers>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl EngineShared {
    fn check_running(&self, fp: &'static str) -> Result<(), Error> {
        if self.state.load(Ordering::SeqCst) != STATE_STARTED {
            return Err(Error::new(ErrorCode::InvalidArgument, fp));
        }
        Ok(())
    }

    fn drivers(&self, fp: &'static str) -> Result<&Drivers, Error> {
        self.drivers
            .get()
            .ok_or(Error::new(ErrorCode::InvalidArgument, fp))
    }

    pub(crate) fn drop_handle(&self, id: u64) {
        self.handles.lock().unwrap().remove(&id);
    }

    fn op_submitted(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    fn op_aborted(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn op_finished(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for EngineShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineShared")
            .field("state", &self.state.load(Ordering::SeqCst))
            .field("pending", &self.pending.load(Ordering::SeqCst))
            .finish()
    }
}

/// The asynchronous I/O engine.
///
/// Cloning yields another front to the same engine. The lifecycle is
/// `new` → [`start`](AioEngine::start) → submissions →
/// [`shutdown`](AioEngine::shutdown); submissions outside the started
/// state fail synchronously. `shutdown` cancels outstanding operations
/// (their callbacks observe [`ErrorCode::IoCanceled`]) and joins every
/// engine thread; it is idempotent and must be called before the engine
/// is dropped if any operation was ever submitted.
#[derive(Clone, Debug)]
pub struct AioEngine {
    shared: Arc<EngineShared>,
}

impl AioEngine {
    /// Creates a stopped engine.
    pub fn new(config: EngineConfig) -> AioEngine {
        AioEngine {
            shared: Arc::new(EngineShared {
                config,
                state: AtomicUsize::new(STATE_NONE),
                pending: AtomicUsize::new(0),
                port: Arc::new(CompletionPort::new()),
                handles: Mutex::new(HashMap::new()),
                drivers: OnceLock::new(),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Starts the engine with `desired_threads` workers (zero falls back
    /// to the configured count, then to one per CPU).
    pub fn start(&self, desired_threads: usize) -> Result<(), Error> {
        let shared = &self.shared;
        if shared
            .state
            .compare_exchange(
                STATE_NONE,
                STATE_STARTED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Err(Error::new(ErrorCode::InvalidArgument, FP_START));
        }

        // Tests may pre-install their own drivers.
        if shared.drivers.get().is_none() {
            match self.build_drivers() {
                Ok(drivers) => {
                    let _ = shared.drivers.set(drivers);
                }
                Err(err) => {
                    shared.state.store(STATE_SHUTDOWN, Ordering::SeqCst);
                    return Err(err);
                }
            }
        }

        let threads = if desired_threads > 0 {
            desired_threads
        } else if shared.config.worker_threads > 0 {
            shared.config.worker_threads
        } else {
            num_cpus::get()
        };
        trace!("starting engine with {} worker threads", threads);

        let mut workers = shared.workers.lock().unwrap();
        for i in 0..threads {
            let port = shared.port.clone();
            let handle = thread::Builder::new()
                .name(format!("evio-worker-{}", i))
                .spawn(move || port.run_worker())
                .map_err(|e| Error::from_io_error(&e, FP_START, "clone"))?;
            workers.push(handle);
        }
        Ok(())
    }

    fn build_drivers(&self) -> Result<Drivers, Error> {
        let shared = &self.shared;
        let socket_backend = match shared.config.socket_backend {
            SocketBackend::Default => SocketBackend::ReadinessPoll,
            other => other,
        };
        let file_backend = match shared.config.file_backend {
            FileBackend::Default => FileBackend::Blocking,
            other => other,
        };

        #[cfg(target_os = "linux")]
        {
            if socket_backend == SocketBackend::CompletionPort
                || file_backend == FileBackend::NativeAsync
            {
                let ring = uring::UringDriver::new(shared.port.clone())?;
                let sockets: Box<dyn SocketDriver> = match socket_backend {
                    SocketBackend::CompletionPort => Box::new(uring::UringSockets(ring.clone())),
                    _ => Box::new(ReadinessDriver::new(
                        shared.port.clone(),
                        shared.config.selector,
                    )?),
                };
                let files: Box<dyn FileDriver> = match file_backend {
                    FileBackend::NativeAsync => Box::new(uring::UringFiles(ring)),
                    _ => Box::new(BlockingFileDriver::new(shared.port.clone())),
                };
                return Ok(Drivers { sockets, files });
            }
        }

        #[cfg(not(target_os = "linux"))]
        {
            if socket_backend == SocketBackend::CompletionPort
                || file_backend == FileBackend::NativeAsync
            {
                return Err(Error::new(ErrorCode::NotSupported, FP_START));
            }
        }

        Ok(Drivers {
            sockets: Box::new(ReadinessDriver::new(
                shared.port.clone(),
                shared.config.selector,
            )?),
            files: Box::new(BlockingFileDriver::new(shared.port.clone())),
        })
    }

    /// Stops the engine: cancels outstanding operations, drains the
    /// completion queue, and joins all engine threads. Idempotent.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        let prev = shared.state.swap(STATE_SHUTDOWN, Ordering::SeqCst);
        if prev != STATE_STARTED {
            return;
        }
        trace!("engine shutting down");

        if let Some(drivers) = shared.drivers.get() {
            drivers.sockets.shutdown();
            drivers.files.shutdown();
        }

        let workers: Vec<_> = shared.workers.lock().unwrap().drain(..).collect();
        for _ in 0..workers.len() {
            shared.port.post(Task::Shutdown);
        }
        for worker in workers {
            let _ = worker.join();
        }

        shared.handles.lock().unwrap().clear();
        debug_assert_eq!(self.pending(), 0);
    }

    /// The number of submitted operations whose callbacks have not yet
    /// finished.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// Whether the engine is in the started state.
    pub fn is_running(&self) -> bool {
        self.shared.state.load(Ordering::SeqCst) == STATE_STARTED
    }

    /// Binds a handle's one-engine-for-life owner slot to this engine.
    fn claim_owner(
        &self,
        owner: &OnceLock<Weak<EngineShared>>,
        fp: &'static str,
    ) -> Result<(), Error> {
        let claimed = owner.get_or_init(|| Arc::downgrade(&self.shared));
        if !Weak::ptr_eq(claimed, &Arc::downgrade(&self.shared)) {
            return Err(Error::new(ErrorCode::InvalidArgument, fp));
        }
        Ok(())
    }

    fn register_file(&self, file: &Arc<AioFile>, fp: &'static str) -> Result<(), Error> {
        if !file.is_open() {
            return Err(Error::new(ErrorCode::InvalidHandle, fp));
        }
        self.claim_owner(file.owner(), fp)?;
        self.shared
            .handles
            .lock()
            .unwrap()
            .entry(file.id())
            .or_insert_with(|| Handle::File(file.clone()));
        Ok(())
    }

    fn register_socket(&self, sock: &Arc<AioSocket>, fp: &'static str) -> Result<(), Error> {
        self.claim_owner(sock.owner(), fp)?;
        self.shared
            .handles
            .lock()
            .unwrap()
            .entry(sock.id())
            .or_insert_with(|| Handle::Socket(sock.clone()));
        Ok(())
    }

    /// Reads up to `buf.len()` bytes from `file` at byte offset `pos`.
    ///
    /// The callback receives the buffer, the bytes transferred (zero at
    /// end of file) and the result.
    pub fn file_read<F>(
        &self,
        file: &Arc<AioFile>,
        pos: u64,
        buf: Vec<u8>,
        callback: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(Arc<AioFile>, Vec<u8>, usize, Error) + Send + 'static,
    {
        let shared = &self.shared;
        shared.check_running(FP_FILE_READ)?;
        self.register_file(file, FP_FILE_READ)?;
        let cb = self.wrap_file_cb(callback);
        shared.op_submitted();
        shared
            .drivers(FP_FILE_READ)?
            .files
            .read(file.clone(), pos, buf, cb)
            .map_err(|err| {
                shared.op_aborted();
                err
            })
    }

    /// Writes `buf` to `file` at byte offset `pos`.
    pub fn file_write<F>(
        &self,
        file: &Arc<AioFile>,
        pos: u64,
        buf: Vec<u8>,
        callback: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(Arc<AioFile>, Vec<u8>, usize, Error) + Send + 'static,
    {
        let shared = &self.shared;
        shared.check_running(FP_FILE_WRITE)?;
        self.register_file(file, FP_FILE_WRITE)?;
        let cb = self.wrap_file_cb(callback);
        shared.op_submitted();
        shared
            .drivers(FP_FILE_WRITE)?
            .files
            .write(file.clone(), pos, buf, cb)
            .map_err(|err| {
                shared.op_aborted();
                err
            })
    }

    /// Accepts one connection on `listen`, installing the new socket in
    /// the unopened `target`.
    pub fn socket_accept<F>(
        &self,
        listen: &Arc<AioSocket>,
        target: &Arc<AioSocket>,
        callback: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(Arc<AioSocket>, Arc<AioSocket>, Error) + Send + 'static,
    {
        let shared = &self.shared;
        shared.check_running(FP_ACCEPT)?;
        if !listen.is_listening() {
            return Err(Error::new(ErrorCode::InvalidArgument, FP_ACCEPT));
        }
        if target.is_open() {
            return Err(Error::new(ErrorCode::InvalidArgument, FP_ACCEPT));
        }
        self.register_socket(listen, FP_ACCEPT)?;
        self.register_socket(target, FP_ACCEPT)?;

        let shared2 = shared.clone();
        let cb: AcceptCallback = Box::new(move |listen, target, err| {
            callback(listen, target, err);
            shared2.op_finished();
        });
        shared.op_submitted();
        shared
            .drivers(FP_ACCEPT)?
            .sockets
            .accept(listen.clone(), target.clone(), cb)
            .map_err(|err| {
                shared.op_aborted();
                err
            })
    }

    /// Connects `sock` to `addr:port`. A `timeout` of `None` leaves the
    /// OS default in place; expired connects complete with
    /// [`ErrorCode::TimedOut`].
    pub fn socket_connect<F>(
        &self,
        sock: &Arc<AioSocket>,
        addr: &InetAddress,
        port: u16,
        timeout: Option<Duration>,
        callback: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(Arc<AioSocket>, Error) + Send + 'static,
    {
        let shared = &self.shared;
        shared.check_running(FP_CONNECT)?;
        if addr.family() == Family::Unknown || addr.family() != sock.family() {
            return Err(Error::new(ErrorCode::InvalidArgument, FP_CONNECT));
        }
        if !sock.is_open() {
            return Err(Error::new(ErrorCode::InvalidHandle, FP_CONNECT));
        }
        self.register_socket(sock, FP_CONNECT)?;

        let cb = self.wrap_connect_cb(callback);
        shared.op_submitted();
        shared
            .drivers(FP_CONNECT)?
            .sockets
            .connect(sock.clone(), *addr, port, timeout, cb)
            .map_err(|err| {
                shared.op_aborted();
                err
            })
    }

    /// Reads up to `buf.len()` bytes from `sock`. Zero transferred bytes
    /// with no error means the peer closed the connection.
    pub fn socket_read<F>(&self, sock: &Arc<AioSocket>, buf: Vec<u8>, callback: F) -> Result<(), Error>
    where
        F: FnOnce(Arc<AioSocket>, Vec<u8>, usize, Error) + Send + 'static,
    {
        let shared = &self.shared;
        shared.check_running(FP_READ)?;
        if !sock.is_open() {
            return Err(Error::new(ErrorCode::InvalidHandle, FP_READ));
        }
        self.register_socket(sock, FP_READ)?;

        let shared2 = shared.clone();
        let cb: SocketReadCallback = Box::new(move |sock, buf, n, err| {
            callback(sock, buf, n, err);
            shared2.op_finished();
        });
        shared.op_submitted();
        shared
            .drivers(FP_READ)?
            .sockets
            .read(sock.clone(), buf, cb)
            .map_err(|err| {
                shared.op_aborted();
                err
            })
    }

    /// Writes all of `buf` to `sock`; the callback fires once the whole
    /// buffer is on the wire (or on the first failure, with the bytes
    /// written so far).
    pub fn socket_write<F>(
        &self,
        sock: &Arc<AioSocket>,
        buf: impl Into<WriteBuf>,
        callback: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(Arc<AioSocket>, usize, Error) + Send + 'static,
    {
        let shared = &self.shared;
        shared.check_running(FP_WRITE)?;
        if !sock.is_open() {
            return Err(Error::new(ErrorCode::InvalidHandle, FP_WRITE));
        }
        self.register_socket(sock, FP_WRITE)?;

        let cb = self.wrap_write_cb(callback);
        shared.op_submitted();
        shared
            .drivers(FP_WRITE)?
            .sockets
            .write(sock.clone(), buf.into(), cb)
            .map_err(|err| {
                shared.op_aborted();
                err
            })
    }

    /// Streams `len` bytes of `file`, starting at `pos`, to `sock`.
    pub fn socket_sendfile<F>(
        &self,
        sock: &Arc<AioSocket>,
        file: &Arc<AioFile>,
        pos: u64,
        len: u64,
        callback: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(Arc<AioSocket>, usize, Error) + Send + 'static,
    {
        let shared = &self.shared;
        shared.check_running(FP_SENDFILE)?;
        if !sock.is_open() {
            return Err(Error::new(ErrorCode::InvalidHandle, FP_SENDFILE));
        }
        self.register_socket(sock, FP_SENDFILE)?;
        self.register_file(file, FP_SENDFILE)?;

        let cb = self.wrap_write_cb(callback);
        shared.op_submitted();
        shared
            .drivers(FP_SENDFILE)?
            .sockets
            .sendfile(sock.clone(), file.clone(), pos, len, cb)
            .map_err(|err| {
                shared.op_aborted();
                err
            })
    }

    /// Closes `sock`, canceling any armed operation on it first.
    pub fn socket_close<F>(&self, sock: &Arc<AioSocket>, callback: F) -> Result<(), Error>
    where
        F: FnOnce(Arc<AioSocket>, Error) + Send + 'static,
    {
        let shared = &self.shared;
        shared.check_running(FP_CLOSE)?;
        if !sock.is_open() {
            return Err(Error::new(ErrorCode::InvalidHandle, FP_CLOSE));
        }
        self.register_socket(sock, FP_CLOSE)?;

        let shared2 = shared.clone();
        let id = sock.id();
        let cb: ConnectCallback = Box::new(move |sock, err| {
            shared2.drop_handle(id);
            callback(sock, err);
            shared2.op_finished();
        });
        shared.op_submitted();
        shared
            .drivers(FP_CLOSE)?
            .sockets
            .close(sock.clone(), cb)
            .map_err(|err| {
                shared.op_aborted();
                err
            })
    }

    fn wrap_file_cb<F>(&self, callback: F) -> FileIoCallback
    where
        F: FnOnce(Arc<AioFile>, Vec<u8>, usize, Error) + Send + 'static,
    {
        let shared = self.shared.clone();
        Box::new(move |file, buf, n, err| {
            callback(file, buf, n, err);
            shared.op_finished();
        })
    }

    fn wrap_connect_cb<F>(&self, callback: F) -> ConnectCallback
    where
        F: FnOnce(Arc<AioSocket>, Error) + Send + 'static,
    {
        let shared = self.shared.clone();
        Box::new(move |sock, err| {
            callback(sock, err);
            shared.op_finished();
        })
    }

    fn wrap_write_cb<F>(&self, callback: F) -> SocketWriteCallback
    where
        F: FnOnce(Arc<AioSocket>, usize, Error) + Send + 'static,
    {
        let shared = self.shared.clone();
        Box::new(move |sock, n, err| {
            callback(sock, n, err);
            shared.op_finished();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// In-memory file backend: completes reads from a fixed pattern and
    /// swallows writes, straight through the completion port.
    struct MockFileDriver {
        port: Arc<CompletionPort>,
        submissions: AtomicUsize,
    }

    impl FileDriver for MockFileDriver {
        fn read(
            &self,
            file: Arc<AioFile>,
            _pos: u64,
            mut buf: Vec<u8>,
            cb: FileIoCallback,
        ) -> Result<(), Error> {
            self.submissions.fetch_add(1, Ordering::SeqCst);
            let n = buf.len().min(4);
            buf[..n].copy_from_slice(&[0xAB; 4][..n]);
            self.port.post_run(move || cb(file, buf, n, Error::none()));
            Ok(())
        }

        fn write(
            &self,
            file: Arc<AioFile>,
            _pos: u64,
            buf: Vec<u8>,
            cb: FileIoCallback,
        ) -> Result<(), Error> {
            self.submissions.fetch_add(1, Ordering::SeqCst);
            let n = buf.len();
            self.port.post_run(move || cb(file, buf, n, Error::none()));
            Ok(())
        }

        fn shutdown(&self) {}
    }

    fn mock_engine() -> AioEngine {
        let engine = AioEngine::new(EngineConfig::default());
        let port = engine.shared.port.clone();
        let _ = engine.shared.drivers.set(Drivers {
            sockets: Box::new(ReadinessDriver::new(port.clone(), SelectorKind::Default).unwrap()),
            files: Box::new(MockFileDriver {
                port,
                submissions: AtomicUsize::new(0),
            }),
        });
        engine.start(1).unwrap();
        engine
    }

    fn open_scratch_file() -> (tempfile::TempDir, Arc<AioFile>) {
        let dir = tempfile::tempdir().unwrap();
        let file = Arc::new(AioFile::new());
        file.open(
            &dir.path().join("scratch"),
            OpenMode::CreateOrOpen,
            Access::ReadWrite,
        )
        .unwrap();
        (dir, file)
    }

    #[test]
    fn submission_requires_started_engine() {
        let engine = AioEngine::new(EngineConfig::default());
        let (_dir, file) = open_scratch_file();
        let err = engine
            .file_read(&file, 0, vec![0; 8], |_, _, _, _| panic!("must not run"))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
        assert_eq!(engine.pending(), 0);
    }

    #[test]
    fn callback_runs_exactly_once_and_pending_drains() {
        let engine = mock_engine();
        let (_dir, file) = open_scratch_file();

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let (tx, rx) = std::sync::mpsc::channel();
        engine
            .file_read(&file, 0, vec![0; 8], move |_file, buf, n, err| {
                assert!(!err.is_set());
                assert_eq!(n, 4);
                assert_eq!(&buf[..4], &[0xAB; 4]);
                hits2.fetch_add(1, Ordering::SeqCst);
                tx.send(()).unwrap();
            })
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        engine.shutdown();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(engine.pending(), 0);
    }

    #[test]
    fn handle_belongs_to_one_engine() {
        let first = mock_engine();
        let second = mock_engine();
        let (_dir, file) = open_scratch_file();

        first
            .file_write(&file, 0, b"x".to_vec(), |_, _, _, _| {})
            .unwrap();
        let err = second
            .file_write(&file, 0, b"x".to_vec(), |_, _, _, _| panic!("must not run"))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        first.shutdown();
        second.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent() {
        let engine = mock_engine();
        engine.shutdown();
        engine.shutdown();
        assert!(!engine.is_running());
    }
}
