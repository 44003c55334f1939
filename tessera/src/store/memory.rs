use {
    super::Store,
    parking_lot::RwLock,
    std::io::{self, ErrorKind::{Other, UnexpectedEof}},
};

/// Store that keeps its bytes in memory.
///
/// The store may be given a limit,
/// past which growing the store fails.
/// This is useful for testing exhaustion of the backing store.
pub struct MemoryStore
{
    bytes: RwLock<Vec<u8>>,
    limit: Option<u64>,
}

impl MemoryStore
{
    /// Create an empty, unlimited store.
    pub fn new() -> Self
    {
        Self{bytes: RwLock::new(Vec::new()), limit: None}
    }

    /// Create an empty store that cannot grow past `limit` bytes.
    pub fn with_limit(limit: u64) -> Self
    {
        Self{bytes: RwLock::new(Vec::new()), limit: Some(limit)}
    }

    /// Copy of the entire contents of the store.
    pub fn to_vec(&self) -> Vec<u8>
    {
        self.bytes.read().clone()
    }

    fn check_limit(&self, len: u64) -> io::Result<usize>
    {
        if self.limit.map_or(false, |limit| len > limit) {
            return Err(io::Error::new(Other, "Memory store limit exceeded"));
        }
        usize::try_from(len)
            .map_err(|_| io::Error::new(Other, "Memory store too large"))
    }

    fn write_locked(&self, bytes: &mut Vec<u8>, offset: u64, data: &[u8])
        -> io::Result<()>
    {
        let end = self.check_limit(offset + data.len() as u64)?;
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        bytes[offset as usize .. end].copy_from_slice(data);
        Ok(())
    }
}

impl Default for MemoryStore
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl Store for MemoryStore
{
    fn len(&self) -> io::Result<u64>
    {
        Ok(self.bytes.read().len() as u64)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>
    {
        let bytes = self.bytes.read();
        let end = offset.checked_add(buf.len() as u64)
            .filter(|end| *end <= bytes.len() as u64)
            .ok_or_else(|| io::Error::from(UnexpectedEof))?;
        buf.copy_from_slice(&bytes[offset as usize .. end as usize]);
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()>
    {
        let mut bytes = self.bytes.write();
        self.write_locked(&mut bytes, offset, data)
    }

    fn set_len(&self, len: u64) -> io::Result<()>
    {
        let len = self.check_limit(len)?;
        self.bytes.write().resize(len, 0);
        Ok(())
    }

    fn write_batch(&self, writes: &[(u64, &[u8])]) -> io::Result<()>
    {
        // One lock for the whole batch, so readers see all or nothing.
        let mut bytes = self.bytes.write();
        for &(offset, data) in writes {
            self.write_locked(&mut bytes, offset, data)?;
        }
        Ok(())
    }
}
