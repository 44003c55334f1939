use {
    super::Store,
    os_ext::{O_CREAT, O_EXCL, O_RDWR, file_size, fsync, ftruncate, pread, pwrite},
    parking_lot::Mutex,
    std::{
        io,
        os::unix::io::{AsFd, OwnedFd},
        path::Path,
    },
};

/// Store backed by a file.
///
/// Reads and writes go straight to the file with pread(2) and pwrite(2).
/// Batches are serialized with respect to each other and to resizing,
/// but a concurrent reader may observe a batch half-way.
/// Callers that need more must avoid reading chunks that are being written,
/// which is what chain activity tracking is for.
pub struct FileStore
{
    fd: OwnedFd,

    /// Held while resizing or writing a batch.
    resize: Mutex<()>,
}

impl FileStore
{
    /// Create a new, empty file.
    ///
    /// Fails if the file already exists.
    pub fn create(path: &Path) -> io::Result<Self>
    {
        let fd = os_ext::open(path, O_CREAT | O_EXCL | O_RDWR, 0o644)?;
        Ok(Self{fd, resize: Mutex::new(())})
    }

    /// Open an existing file.
    pub fn open(path: &Path) -> io::Result<Self>
    {
        let fd = os_ext::open(path, O_RDWR, 0)?;
        Ok(Self{fd, resize: Mutex::new(())})
    }
}

impl Store for FileStore
{
    fn len(&self) -> io::Result<u64>
    {
        file_size(self.fd.as_fd())
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>
    {
        pread(self.fd.as_fd(), buf, offset)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()>
    {
        pwrite(self.fd.as_fd(), data, offset)
    }

    fn set_len(&self, len: u64) -> io::Result<()>
    {
        let _guard = self.resize.lock();
        ftruncate(self.fd.as_fd(), len)
    }

    fn write_batch(&self, writes: &[(u64, &[u8])]) -> io::Result<()>
    {
        let _guard = self.resize.lock();
        for &(offset, data) in writes {
            pwrite(self.fd.as_fd(), data, offset)?;
        }
        Ok(())
    }

    fn flush(&self) -> io::Result<()>
    {
        fsync(self.fd.as_fd())
    }
}
