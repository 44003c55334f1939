//! Extra items for talking to the operating system.
//!
//! This crate provides a safe, low-level interface to the file system calls
//! that the file-backed chunk store is built on.
//! The functions in this crate are named after their underlying system calls,
//! and their behavior is identical except for the differences listed below.
//! The exact semantics of each function can be found in their man pages.
//!
//! # Differences with underlying system calls
//!
//! Errors are reported using [`Result`] rather than
//! through `errno` and an arbitrary return value.
//!
//! Paths are accepted as [`Path`] rather than NUL-terminated strings.
//! If an interior NUL is found within the path,
//! the wrapper function fails with `EINVAL`.
//!
//! When a new file descriptor is created by one of the functions,
//! it is created with the `FD_CLOEXEC` bit set (atomically).
//!
//! If the system call fails with `EINTR` (interrupted),
//! the wrapper function automatically retries it.
//! Short reads and writes are retried until the whole buffer is done.
//!
//! [`Result`]: `std::io::Result`
//! [`Path`]: `std::path::Path`

#![warn(missing_docs)]

pub use {
    self::{fcntl::*, sys_stat::*, unistd::*},
    libc::{O_CREAT, O_EXCL, O_RDONLY, O_RDWR, O_TRUNC, off_t},
};

use std::io::{self, ErrorKind::Interrupted};

mod fcntl;
mod sys_stat;
mod unistd;

// Cannot `pub use` as that would also export the stat function.
#[allow(missing_docs, non_camel_case_types)]
pub type stat = libc::stat;

/// Call `f` until it no longer fails with `EINTR`.
fn retry_on_eintr<F, T>(mut f: F) -> io::Result<T>
    where F: FnMut() -> io::Result<T>
{
    loop {
        match f() {
            Err(err) if err.kind() == Interrupted => continue,
            result                                => return result,
        }
    }
}

/// Convert a file offset to `off_t`, failing with `EOVERFLOW`.
fn to_off_t(offset: u64) -> io::Result<off_t>
{
    off_t::try_from(offset)
        .map_err(|_| io::Error::from_raw_os_error(libc::EOVERFLOW))
}
