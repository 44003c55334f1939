//! Byte-addressable backing stores.
//!
//! A store is a flat, growable array of bytes.
//! Chunks tile the store from [`FIRST_CHUNK`] to its end;
//! the bytes before that hold a magic number
//! that identifies the store format.
//! Because no chunk starts at offset zero,
//! zero can serve as the null chunk pointer.

pub use self::{file::*, memory::*};

use std::io::{self, ErrorKind::InvalidData};

mod file;
mod memory;

/// Magic number at the start of every formatted store.
pub const MAGIC: [u8; 8] = *b"TESSERA\x01";

/// Offset of the first chunk in a formatted store.
pub const FIRST_CHUNK: u64 = MAGIC.len() as u64;

/// Random-access byte storage.
///
/// Implementations must be safe to use from multiple threads.
/// Individual calls must be atomic with respect to each other,
/// so that a reader never observes half of a write.
pub trait Store: Send + Sync
{
    /// The number of bytes in the store.
    fn len(&self) -> io::Result<u64>;

    /// Fill `buf` with the bytes at `offset`.
    ///
    /// Reading past the end of the store fails.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Write `data` at `offset`, extending the store if necessary.
    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Grow or truncate the store.
    ///
    /// Bytes added by growing the store are zero.
    fn set_len(&self, len: u64) -> io::Result<()>;

    /// Perform several writes at once.
    ///
    /// Readers must not observe only some of the writes,
    /// if the implementation can provide that.
    fn write_batch(&self, writes: &[(u64, &[u8])]) -> io::Result<()>
    {
        for &(offset, data) in writes {
            self.write_at(offset, data)?;
        }
        Ok(())
    }

    /// Make previous writes durable.
    fn flush(&self) -> io::Result<()>
    {
        Ok(())
    }
}

/// Write the magic number to an empty store.
pub fn format(store: &dyn Store) -> io::Result<()>
{
    if store.len()? != 0 {
        return Err(io::Error::new(InvalidData, "Store is not empty"));
    }
    store.write_at(0, &MAGIC)
}

/// Check that a store starts with the magic number.
pub fn check_magic(store: &dyn Store) -> io::Result<()>
{
    let mut magic = [0; MAGIC.len()];
    store.read_at(0, &mut magic)
        .map_err(|_| io::Error::new(InvalidData, "Store is too short"))?;
    if magic != MAGIC {
        return Err(io::Error::new(InvalidData, "Store has wrong magic number"));
    }
    Ok(())
}

/// Writes that are applied to a store all at once.
///
/// A transaction buffers writes until [`commit`][`Self::commit`],
/// which hands them to [`Store::write_batch`] in one call.
/// Reads through the transaction observe its own pending writes.
/// Dropping a transaction without committing it discards the writes.
pub struct Transaction<'s>
{
    store: &'s dyn Store,
    writes: Vec<(u64, Vec<u8>)>,
}

impl<'s> Transaction<'s>
{
    /// Begin a transaction on a store.
    pub fn new(store: &'s dyn Store) -> Self
    {
        Self{store, writes: Vec::new()}
    }

    /// The store this transaction writes to.
    pub fn store(&self) -> &'s dyn Store
    {
        self.store
    }

    /// Queue a write.
    pub fn write(&mut self, offset: u64, data: impl Into<Vec<u8>>)
    {
        self.writes.push((offset, data.into()));
    }

    /// Read from the store as if the pending writes had been applied.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>
    {
        self.store.read_at(offset, buf)?;

        let end = offset + buf.len() as u64;
        for (at, data) in &self.writes {
            let at_end = at + data.len() as u64;
            if at_end <= offset || end <= *at {
                continue;
            }
            let from = offset.max(*at);
            let to = end.min(at_end);
            let dst = (from - offset) as usize .. (to - offset) as usize;
            let src = (from - at) as usize .. (to - at) as usize;
            buf[dst].copy_from_slice(&data[src]);
        }

        Ok(())
    }

    /// Whether no writes are pending.
    pub fn is_empty(&self) -> bool
    {
        self.writes.is_empty()
    }

    /// Apply all pending writes.
    pub fn commit(self) -> io::Result<()>
    {
        if self.writes.is_empty() {
            return Ok(());
        }
        let batch: Vec<(u64, &[u8])> =
            self.writes.iter()
            .map(|(offset, data)| (*offset, data.as_slice()))
            .collect();
        self.store.write_batch(&batch)
    }
}
