use {
    crate::{retry_on_eintr, stat},
    std::{
        io,
        mem::MaybeUninit,
        os::unix::io::{AsRawFd, BorrowedFd},
    },
};

/// Call fstat(2) with the given arguments.
pub fn fstat(fd: BorrowedFd) -> io::Result<stat>
{
    let mut statbuf = MaybeUninit::uninit();

    retry_on_eintr(|| {
        // SAFETY: statbuf is large enough for a stat structure.
        let result = unsafe { libc::fstat(fd.as_raw_fd(), statbuf.as_mut_ptr()) };

        if result == -1 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: fstat initialized statbuf.
        Ok(unsafe { statbuf.assume_init() })
    })
}

/// The size in bytes of the file referred to by `fd`.
pub fn file_size(fd: BorrowedFd) -> io::Result<u64>
{
    let statbuf = fstat(fd)?;
    u64::try_from(statbuf.st_size)
        .map_err(|_| io::Error::from_raw_os_error(libc::EOVERFLOW))
}
