//! Blocking file backend.
//!
//! Submissions queue an unissued descriptor on the completion port; the
//! worker that dequeues it performs the positioned read or write inline
//! (retrying interrupts) and then invokes the callback. Descriptors still
//! queued when the engine shuts down complete with `IoCanceled`.

use std::sync::{Arc, Mutex};

use crate::engine::port::CompletionPort;
use crate::engine::{AioFile, FileDriver, FileIoCallback, FP_FILE_READ, FP_FILE_WRITE};
use crate::error::{Error, ErrorCode};
use crate::sys::net;

pub(crate) struct BlockingFileDriver {
    port: Arc<CompletionPort>,
    gate: Arc<Mutex<bool>>,
}

impl BlockingFileDriver {
    pub(crate) fn new(port: Arc<CompletionPort>) -> BlockingFileDriver {
        BlockingFileDriver {
            port,
            gate: Arc::new(Mutex::new(false)),
        }
    }

    fn queue<F>(&self, fp: &'static str, work: F) -> Result<(), Error>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let gate = self.gate.clone();
        // Posting under the gate guarantees no descriptor lands on the
        // queue after shutdown flips it.
        let closed = self.gate.lock().unwrap();
        if *closed {
            return Err(Error::new(ErrorCode::InvalidArgument, fp));
        }
        self.port.post_run(move || {
            let canceled = *gate.lock().unwrap();
            work(canceled);
        });
        Ok(())
    }
}

impl FileDriver for BlockingFileDriver {
    fn read(
        &self,
        file: Arc<AioFile>,
        pos: u64,
        mut buf: Vec<u8>,
        cb: FileIoCallback,
    ) -> Result<(), Error> {
        let fd = file
            .raw_fd()
            .ok_or(Error::new(ErrorCode::InvalidHandle, FP_FILE_READ))?;
        self.queue(FP_FILE_READ, move |canceled| {
            if canceled {
                cb(file, buf, 0, Error::new(ErrorCode::IoCanceled, FP_FILE_READ));
                return;
            }
            match net::pread(fd, &mut buf, pos) {
                Ok(n) => cb(file, buf, n, Error::none()),
                Err(err) => {
                    let error = Error::from_io_error(&err, FP_FILE_READ, "pread");
                    cb(file, buf, 0, error);
                }
            }
        })
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
        self.queue(FP_FILE_WRITE, move |canceled| {
            if canceled {
                cb(file, buf, 0, Error::new(ErrorCode::IoCanceled, FP_FILE_WRITE));
                return;
            }
            match net::pwrite(fd, &buf, pos) {
                Ok(n) => cb(file, buf, n, Error::none()),
                Err(err) => {
                    let error = Error::from_io_error(&err, FP_FILE_WRITE, "pwrite");
                    cb(file, buf, 0, error);
                }
            }
        })
    }

    fn shutdown(&self) {
        *self.gate.lock().unwrap() = true;
    }
}
