use std::fmt;

/// Portable classification of a failed operation.
///
/// Native OS error codes are folded into this closed set so that callers
/// never need to inspect platform errno values. Codes without a portable
/// equivalent map to [`ErrorCode::Unknown`]; the raw OS value is still
/// preserved on the [`Error`] that carries the code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, thiserror::Error)]
#[non_exhaustive]
pub enum ErrorCode {
    /// No failure. The code carried by [`Error::none`].
    #[error("")]
    Success,

    // Generic errors
    /// EINVAL, ENOPROTOOPT
    #[error("invalid argument")]
    InvalidArgument,
    /// EBADF, ENOTSOCK
    #[error("invalid handle")]
    InvalidHandle,
    /// ENFILE, EMFILE
    #[error("too many handles")]
    TooManyHandles,
    /// EFAULT
    #[error("bad address")]
    BadAddress,
    /// ENOSYS
    #[error("system call not supported")]
    SystemCallNotSupported,
    /// ENOMEM
    #[error("not enough memory")]
    NotEnoughMemory,
    /// ENOTSUP, EOPNOTSUPP
    #[error("not supported")]
    NotSupported,
    /// EACCES, EPERM, EROFS
    #[error("access denied")]
    AccessDenied,
    /// ETIMEDOUT, ETIME
    #[error("timed out")]
    TimedOut,

    // Generic I/O errors
    /// EPIPE
    #[error("broken pipe")]
    BrokenPipe,
    /// EIO
    #[error("io error")]
    IoError,
    /// ENOLCK
    #[error("no lock available")]
    NoLockAvailable,
    /// ECANCELED, or an operation cancelled by engine shutdown
    #[error("io canceled")]
    IoCanceled,

    // File I/O errors
    /// ENOENT
    #[error("file not found")]
    FileNotFound,
    /// EEXIST
    #[error("file exists")]
    FileExists,
    /// EFBIG
    #[error("file too large")]
    FileTooLarge,
    /// EBUSY, ETXTBSY
    #[error("file in use")]
    FileInUse,
    /// ENAMETOOLONG
    #[error("filename too long")]
    FilenameTooLong,
    /// EISDIR
    #[error("is a directory")]
    IsADirectory,
    /// ENOTDIR
    #[error("not a directory")]
    NotADirectory,
    /// ENOTEMPTY
    #[error("directory not empty")]
    DirectoryNotEmpty,
    /// ESPIPE
    #[error("invalid seek")]
    InvalidSeek,
    /// ENOSPC
    #[error("no space on device")]
    NoSpaceOnDevice,
    /// ENXIO, ENODEV
    #[error("no such device")]
    NoSuchDevice,

    // File link errors
    /// EXDEV
    #[error("cross device link")]
    CrossDeviceLink,
    /// EMLINK
    #[error("too many links")]
    TooManyLinks,
    /// ELOOP
    #[error("too many symbolic link levels")]
    TooManySymbolicLinkLevels,

    // Network errors
    /// ENOBUFS
    #[error("no buffer space")]
    NoBufferSpace,
    /// EAFNOSUPPORT
    #[error("address not supported")]
    AddressNotSupported,
    /// EADDRINUSE
    #[error("address in use")]
    AddressInUse,
    /// EADDRNOTAVAIL
    #[error("address not available")]
    AddressNotAvailable,
    /// EISCONN
    #[error("already connected")]
    AlreadyConnected,
    /// ECONNABORTED
    #[error("connection aborted")]
    ConnectionAborted,
    /// EALREADY
    #[error("connection already in progress")]
    ConnectionAlreadyInProgress,
    /// ECONNREFUSED
    #[error("connection refused")]
    ConnectionRefused,
    /// ECONNRESET
    #[error("connection reset")]
    ConnectionReset,
    /// ESHUTDOWN
    #[error("connection shutdown")]
    ConnectionShutdown,
    /// ENOTCONN
    #[error("not connected")]
    NotConnected,
    /// EHOSTUNREACH
    #[error("host unreachable")]
    HostUnreachable,
    /// ENETDOWN
    #[error("network down")]
    NetworkDown,
    /// ENETRESET
    #[error("network reset")]
    NetworkReset,
    /// ENETUNREACH
    #[error("network unreachable")]
    NetworkUnreachable,
    /// EDESTADDRREQ
    #[error("destination address required")]
    DestinationAddressRequired,
    /// EMSGSIZE
    #[error("message too long")]
    MessageTooLong,
    /// EPROTO, EPROTONOSUPPORT
    #[error("protocol error")]
    ProtocolError,

    // Text errors
    /// EILSEQ
    #[error("illegal byte sequence")]
    IllegalByteSequence,

    /// Any OS code without a portable mapping.
    #[error("unknown")]
    Unknown,
}

/// An error code plus enough context to produce a useful diagnostic.
///
/// Carries the portable [`ErrorCode`], the raw OS error value (zero for
/// library-level failures), the *failure point* naming the call site
/// (for example `"AioEngine::socket_read"`) and the name of the syscall
/// that failed (may be empty for library-level failures).
///
/// `Error` is a plain value: cheap to copy, with [`Error::none`] as the
/// zero state. Completion callbacks always receive an `Error`; check
/// [`Error::is_set`] before treating the operation as failed.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Error {
    code: ErrorCode,
    os_code: i32,
    failure_point: &'static str,
    syscall: &'static str,
}

impl Error {
    /// The "no failure" value.
    pub const fn none() -> Error {
        Error {
            code: ErrorCode::Success,
            os_code: 0,
            failure_point: "",
            syscall: "",
        }
    }

    /// A library-level failure with no OS code behind it.
    pub const fn new(code: ErrorCode, failure_point: &'static str) -> Error {
        Error {
            code,
            os_code: 0,
            failure_point,
            syscall: "",
        }
    }

    /// Translates a raw errno value.
    pub fn from_errno(errno: i32, failure_point: &'static str, syscall: &'static str) -> Error {
        Error {
            code: code_from_errno(errno),
            os_code: errno,
            failure_point,
            syscall,
        }
    }

    /// Translates the errno of the immediately preceding syscall.
    pub fn last_os_error(failure_point: &'static str, syscall: &'static str) -> Error {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        Error::from_errno(errno, failure_point, syscall)
    }

    /// Translates an [`std::io::Error`], falling back to
    /// [`ErrorCode::Unknown`] when it carries no OS code.
    pub fn from_io_error(
        err: &std::io::Error,
        failure_point: &'static str,
        syscall: &'static str,
    ) -> Error {
        match err.raw_os_error() {
            Some(errno) => Error::from_errno(errno, failure_point, syscall),
            None => Error {
                code: ErrorCode::Unknown,
                os_code: 0,
                failure_point,
                syscall,
            },
        }
    }

    /// Whether a real failure is present.
    pub fn is_set(&self) -> bool {
        self.code != ErrorCode::Success
    }

    /// The portable classification of the failure.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// The raw OS error value, or zero for library-level failures.
    pub fn os_code(&self) -> i32 {
        self.os_code
    }

    /// The call site the failure was reported from.
    pub fn failure_point(&self) -> &'static str {
        self.failure_point
    }

    /// The name of the syscall that failed, or `""`.
    pub fn syscall(&self) -> &'static str {
        self.syscall
    }
}

impl Default for Error {
    fn default() -> Error {
        Error::none()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_set() {
            return write!(f, "Error: \"\"");
        }
        write!(f, "Error: \"{}\" from {}", self.code, self.failure_point)?;
        if !self.syscall.is_empty() {
            write!(
                f,
                " calling {}, which failed with: ({}) \"{}\"",
                self.syscall,
                self.os_code,
                crate::sys::error_string(self.os_code)
            )?;
        }
        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("code", &self.code)
            .field("os_code", &self.os_code)
            .field("failure_point", &self.failure_point)
            .field("syscall", &self.syscall)
            .finish()
    }
}

impl std::error::Error for Error {}

/// The errno translation table.
fn code_from_errno(errno: i32) -> ErrorCode {
    match errno {
        0 => ErrorCode::Success,

        // Generic errors
        libc::EINVAL | libc::ENOPROTOOPT => ErrorCode::InvalidArgument,
        libc::EBADF | libc::ENOTSOCK => ErrorCode::InvalidHandle,
        libc::ENFILE | libc::EMFILE => ErrorCode::TooManyHandles,
        libc::EFAULT => ErrorCode::BadAddress,
        libc::ENOSYS => ErrorCode::SystemCallNotSupported,
        libc::ENOMEM => ErrorCode::NotEnoughMemory,
        libc::ENOTSUP => ErrorCode::NotSupported,
        libc::EACCES | libc::EPERM | libc::EROFS => ErrorCode::AccessDenied,
        libc::ETIMEDOUT | libc::ETIME => ErrorCode::TimedOut,

        // Generic I/O errors
        libc::EPIPE => ErrorCode::BrokenPipe,
        libc::EIO => ErrorCode::IoError,
        libc::ENOLCK => ErrorCode::NoLockAvailable,
        libc::ECANCELED => ErrorCode::IoCanceled,

        // File I/O errors
        libc::ENOENT => ErrorCode::FileNotFound,
        libc::EEXIST => ErrorCode::FileExists,
        libc::EFBIG => ErrorCode::FileTooLarge,
        libc::EBUSY | libc::ETXTBSY => ErrorCode::FileInUse,
        libc::ENAMETOOLONG => ErrorCode::FilenameTooLong,
        libc::EISDIR => ErrorCode::IsADirectory,
        libc::ENOTDIR => ErrorCode::NotADirectory,
        libc::ENOTEMPTY => ErrorCode::DirectoryNotEmpty,
        libc::ESPIPE => ErrorCode::InvalidSeek,
        libc::ENOSPC => ErrorCode::NoSpaceOnDevice,
        libc::ENXIO | libc::ENODEV => ErrorCode::NoSuchDevice,

        // File link errors
        libc::EXDEV => ErrorCode::CrossDeviceLink,
        libc::EMLINK => ErrorCode::TooManyLinks,
        libc::ELOOP => ErrorCode::TooManySymbolicLinkLevels,

        // Network errors
        libc::ENOBUFS => ErrorCode::NoBufferSpace,
        libc::EAFNOSUPPORT => ErrorCode::AddressNotSupported,
        libc::EADDRINUSE => ErrorCode::AddressInUse,
        libc::EADDRNOTAVAIL => ErrorCode::AddressNotAvailable,
        libc::EISCONN => ErrorCode::AlreadyConnected,
        libc::ECONNABORTED => ErrorCode::ConnectionAborted,
        libc::EALREADY => ErrorCode::ConnectionAlreadyInProgress,
        libc::ECONNREFUSED => ErrorCode::ConnectionRefused,
        libc::ECONNRESET => ErrorCode::ConnectionReset,
        libc::ESHUTDOWN => ErrorCode::ConnectionShutdown,
        libc::ENOTCONN => ErrorCode::NotConnected,
        libc::EHOSTUNREACH => ErrorCode::HostUnreachable,
        libc::ENETDOWN => ErrorCode::NetworkDown,
        libc::ENETRESET => ErrorCode::NetworkReset,
        libc::ENETUNREACH => ErrorCode::NetworkUnreachable,
        libc::EDESTADDRREQ => ErrorCode::DestinationAddressRequired,
        libc::EMSGSIZE => ErrorCode::MessageTooLong,
        libc::EPROTO | libc::EPROTONOSUPPORT => ErrorCode::ProtocolError,

        // Text errors
        libc::EILSEQ => ErrorCode::IllegalByteSequence,

        _ => ErrorCode::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_is_not_set() {
        let err = Error::none();
        assert!(!err.is_set());
        assert_eq!(err.code(), ErrorCode::Success);
        assert_eq!(err.os_code(), 0);
    }

    #[test]
    fn unset_formats_to_empty_kind() {
        assert_eq!(Error::none().to_string(), "Error: \"\"");
    }

    #[test]
    fn errno_mapping() {
        assert_eq!(
            Error::from_errno(libc::EINVAL, "t", "s").code(),
            ErrorCode::InvalidArgument
        );
        assert_eq!(
            Error::from_errno(libc::ECONNRESET, "t", "s").code(),
            ErrorCode::ConnectionReset
        );
        assert_eq!(
            Error::from_errno(libc::ECANCELED, "t", "s").code(),
            ErrorCode::IoCanceled
        );
        assert_eq!(
            Error::from_errno(libc::ENOENT, "t", "s").code(),
            ErrorCode::FileNotFound
        );
        // An errno nobody maps stays Unknown but keeps the raw value.
        let err = Error::from_errno(4095, "t", "s");
        assert_eq!(err.code(), ErrorCode::Unknown);
        assert_eq!(err.os_code(), 4095);
    }

    #[test]
    fn display_carries_context() {
        let err = Error::from_errno(libc::EPIPE, "AioEngine::socket_write", "send");
        let text = err.to_string();
        assert!(text.contains("broken pipe"), "{}", text);
        assert!(text.contains("AioEngine::socket_write"), "{}", text);
        assert!(text.contains("send"), "{}", text);
        assert!(text.contains(&libc::EPIPE.to_string()), "{}", text);
    }

    #[test]
    fn library_error_omits_syscall_clause() {
        let err = Error::new(ErrorCode::InvalidArgument, "AioSocket::init");
        assert_eq!(
            err.to_string(),
            "Error: \"invalid argument\" from AioSocket::init"
        );
    }
}
