use {
    crate::{retry_on_eintr, to_off_t},
    std::{
        io::{self, ErrorKind::UnexpectedEof},
        os::unix::io::{AsRawFd, BorrowedFd},
    },
};

/// Call pread(2) until `buf` is filled.
///
/// Reaching the end of the file before `buf` is filled
/// fails with [`UnexpectedEof`].
pub fn pread(fd: BorrowedFd, mut buf: &mut [u8], mut offset: u64)
    -> io::Result<()>
{
    while !buf.is_empty() {
        let off = to_off_t(offset)?;

        let n = retry_on_eintr(|| {
            // SAFETY: buf is valid for buf.len() bytes.
            let result = unsafe {
                libc::pread(
                    fd.as_raw_fd(),
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                    off,
                )
            };

            if result == -1 {
                return Err(io::Error::last_os_error());
            }

            Ok(result as usize)
        })?;

        if n == 0 {
            return Err(io::Error::from(UnexpectedEof));
        }

        buf = &mut buf[n ..];
        offset += n as u64;
    }

    Ok(())
}

/// Call pwrite(2) until all of `buf` is written.
pub fn pwrite(fd: BorrowedFd, mut buf: &[u8], mut offset: u64)
    -> io::Result<()>
{
    while !buf.is_empty() {
        let off = to_off_t(offset)?;

        let n = retry_on_eintr(|| {
            // SAFETY: buf is valid for buf.len() bytes.
            let result = unsafe {
                libc::pwrite(
                    fd.as_raw_fd(),
                    buf.as_ptr().cast(),
                    buf.len(),
                    off,
                )
            };

            if result == -1 {
                return Err(io::Error::last_os_error());
            }

            Ok(result as usize)
        })?;

        buf = &buf[n ..];
        offset += n as u64;
    }

    Ok(())
}

/// Call ftruncate(2) with the given arguments.
pub fn ftruncate(fd: BorrowedFd, length: u64) -> io::Result<()>
{
    let length = to_off_t(length)?;

    retry_on_eintr(|| {
        // SAFETY: This is always safe.
        let result = unsafe { libc::ftruncate(fd.as_raw_fd(), length) };

        if result == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    })
}

/// Call fsync(2) with the given arguments.
pub fn fsync(fd: BorrowedFd) -> io::Result<()>
{
    retry_on_eintr(|| {
        // SAFETY: This is always safe.
        let result = unsafe { libc::fsync(fd.as_raw_fd()) };

        if result == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    })
}
