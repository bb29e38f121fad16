/// Helper macro to execute a system call that returns an `io::Result`.
//
// Macro must be defined before any modules that uses them.
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

pub(crate) mod net;
pub(crate) mod selector;

mod waker;
pub(crate) use self::waker::Waker;

use std::ffi::CStr;

/// The OS description of an errno value, for diagnostics.
pub(crate) fn error_string(errno: i32) -> String {
    let mut buf = [0 as libc::c_char; 128];
    unsafe {
        if libc::strerror_r(errno, buf.as_mut_ptr(), buf.len()) != 0 {
            return format!("errno {}", errno);
        }
        CStr::from_ptr(buf.as_ptr()).to_string_lossy().into_owned()
    }
}
