//! Evio — callback-based asynchronous file and socket I/O.
//!
//! Evio multiplexes file and socket operations over a small pool of worker
//! threads. Every public operation on [`AioEngine`] submits the work and
//! returns immediately; when the operation finishes, a user-supplied
//! callback runs on one of the engine's worker threads with the result and
//! a translated [`Error`].
//!
//! Two socket backends are provided, selected by [`EngineConfig`]:
//!
//! * a *readiness* backend built on `epoll(7)` (or `poll(2)`), where a
//!   dedicated poll thread arms non-blocking operations and worker threads
//!   run the completions, and
//! * a *completion* backend built on Linux `io_uring`, where operations are
//!   submitted to the kernel ring and a reaper thread hands finished
//!   completions to the workers.
//!
//! File I/O either runs on the worker pool with positioned blocking reads
//! and writes, or through the same `io_uring` ring.
//!
//! The [`http`] module layers a small HTTP/1.x daemon on top of the engine:
//! one request per connection, line-buffered parsing, automatic
//! `100 Continue`, and a strictly ordered response write queue per session.
//!
//! # Example
//!
//! ```no_run
//! use evio::{AioEngine, EngineConfig};
//! use evio::engine::{AioFile, Access, OpenMode};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), evio::Error> {
//! let engine = AioEngine::new(EngineConfig::default());
//! engine.start(2)?;
//!
//! let file = Arc::new(AioFile::new());
//! file.open("/tmp/greeting".as_ref(), OpenMode::CreateOrTruncate, Access::ReadWrite)?;
//!
//! engine.file_write(&file, 0, b"hello".to_vec(), |_file, _buf, written, err| {
//!     assert!(!err.is_set());
//!     assert_eq!(written, 5);
//! })?;
//!
//! engine.shutdown();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![cfg(unix)]

mod error;
mod inet;
mod sys;

pub mod engine;
pub mod http;

pub use crate::engine::{AioEngine, EngineConfig, WriteBuf};
pub use crate::error::{Error, ErrorCode};
pub use crate::inet::{Family, InetAddress};
