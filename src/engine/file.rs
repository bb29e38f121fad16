use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::{Mutex, OnceLock, Weak};

use log::trace;

use crate::engine::{next_handle_id, EngineShared};
use crate::error::{Error, ErrorCode};

/// How [`AioFile::open`] treats an existing (or missing) file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// Create the file; fail if it already exists.
    CreateOnly,
    /// Open the file, creating it if missing.
    CreateOrOpen,
    /// Open the file, creating it if missing and truncating it otherwise.
    CreateOrTruncate,
    /// Open an existing file; fail if it is missing.
    OpenOnly,
    /// Open and truncate an existing file; fail if it is missing.
    TruncateOnly,
}

/// Requested file permissions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    /// Read only.
    Read,
    /// Write only.
    Write,
    /// Read and write.
    ReadWrite,
}

/// A file handle usable with [`AioEngine`](crate::AioEngine) file
/// operations.
///
/// Owns the underlying descriptor, which is closed on drop. A file
/// belongs to at most one engine for its whole lifetime; the first
/// submitted operation registers it and later submissions on a different
/// engine fail.
#[derive(Debug)]
pub struct AioFile {
    id: u64,
    fd: Mutex<Option<RawFd>>,
    owner: OnceLock<Weak<EngineShared>>,
}

impl AioFile {
    /// Creates a closed file handle.
    pub fn new() -> AioFile {
        AioFile {
            id: next_handle_id(),
            fd: Mutex::new(None),
            owner: OnceLock::new(),
        }
    }

    /// Opens `path`, failing with [`ErrorCode::InvalidArgument`] if the
    /// handle is already open.
    pub fn open(&self, path: &Path, mode: OpenMode, access: Access) -> Result<(), Error> {
        const FP: &str = "AioFile::open";

        let mut guard = self.fd.lock().unwrap();
        if guard.is_some() {
            return Err(Error::new(ErrorCode::InvalidArgument, FP));
        }

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| Error::new(ErrorCode::InvalidArgument, FP))?;

        let mut flags = libc::O_CLOEXEC;
        flags |= match access {
            Access::Read => libc::O_RDONLY,
            Access::Write => libc::O_WRONLY,
            Access::ReadWrite => libc::O_RDWR,
        };
        flags |= match mode {
            OpenMode::CreateOnly => libc::O_CREAT | libc::O_EXCL,
            OpenMode::CreateOrOpen => libc::O_CREAT,
            OpenMode::CreateOrTruncate => libc::O_CREAT | libc::O_TRUNC,
            OpenMode::OpenOnly => 0,
            OpenMode::TruncateOnly => libc::O_TRUNC,
        };

        let fd = unsafe { libc::open(c_path.as_ptr(), flags, 0o666 as libc::c_uint) };
        if fd == -1 {
            return Err(Error::last_os_error(FP, "open"));
        }

        trace!("opened file fd {} ({:?})", fd, path);
        *guard = Some(fd);
        Ok(())
    }

    /// Closes the handle. Fails with [`ErrorCode::InvalidHandle`] if it
    /// is not open.
    pub fn close(&self) -> Result<(), Error> {
        const FP: &str = "AioFile::close";
        let fd = self
            .fd
            .lock()
            .unwrap()
            .take()
            .ok_or(Error::new(ErrorCode::InvalidHandle, FP))?;
        if unsafe { libc::close(fd) } == -1 {
            return Err(Error::last_os_error(FP, "close"));
        }
        Ok(())
    }

    /// Whether the handle currently owns a descriptor.
    pub fn is_open(&self) -> bool {
        self.fd.lock().unwrap().is_some()
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        *self.fd.lock().unwrap()
    }

    pub(crate) fn owner(&self) -> &OnceLock<Weak<EngineShared>> {
        &self.owner
    }
}

impl Default for AioFile {
    fn default() -> AioFile {
        AioFile::new()
    }
}

impl Drop for AioFile {
    fn drop(&mut self) {
        if let Some(fd) = self.fd.get_mut().unwrap().take() {
            trace!("closing file fd {} on drop", fd);
            let _ = unsafe { libc::close(fd) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_open_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");

        let file = AioFile::new();
        file.open(&path, OpenMode::CreateOrOpen, Access::ReadWrite)
            .unwrap();
        let err = file
            .open(&path, OpenMode::CreateOrOpen, Access::ReadWrite)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[test]
    fn open_missing_fails() {
        let dir = tempfile::tempdir().unwrap();
        let file = AioFile::new();
        let err = file
            .open(&dir.path().join("missing"), OpenMode::OpenOnly, Access::Read)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::FileNotFound);
        assert!(!file.is_open());
    }

    #[test]
    fn create_only_rejects_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"x").unwrap();

        let file = AioFile::new();
        let err = file
            .open(&path, OpenMode::CreateOnly, Access::Write)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::FileExists);
    }

    #[test]
    fn close_then_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");

        let file = AioFile::new();
        file.open(&path, OpenMode::CreateOrOpen, Access::ReadWrite)
            .unwrap();
        file.close().unwrap();
        assert!(!file.is_open());
        assert_eq!(file.close().unwrap_err().code(), ErrorCode::InvalidHandle);
        file.open(&path, OpenMode::OpenOnly, Access::Read).unwrap();
    }
}
