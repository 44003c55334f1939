//! Chunks and their self-describing headers.
//!
//! # Header format
//!
//! ```text
//! byte 0      flags     bit 7     always set
//!                       bit 6     FREE
//!                       bits 3-5  link width code
//!                       bits 0-2  body width code
//! then        capacity  (body width)
//! then        size      (body width)
//! then        link      (link width, zero if there is no link)
//! ```
//!
//! All fields are little endian.
//! The header size follows from the flags byte alone,
//! so a reader needs nothing but the chunk pointer to decode it.

use {
    crate::{
        Result,
        store::{Store, Transaction},
        width::{EncodingError, Width},
    },
    bitflags::bitflags,
    smallvec::SmallVec,
    std::{fmt, io, num::NonZeroU64},
    thiserror::Error,
};

/// The largest possible header size.
pub const MAX_HEADER_SIZE: usize = 1 + 2 * 8 + 8;

/// The smallest extent worth keeping as a separate free chunk.
///
/// Leftovers smaller than this are handed out along with an allocation
/// rather than being split off into a free chunk of their own.
pub const MIN_FREE_EXTENT: u64 = 8;

/// Allocated chunks always have room to record their capacity.
const MIN_BODY_WIDTH: Width = Width::U8;

bitflags!
{
    /// The flag bits of the first header byte.
    ///
    /// The other six bits hold the body and link width codes.
    pub struct ChunkFlags: u8
    {
        /// Set in every header, so that zeroed bytes never parse as one.
        const MARK = 0b1000_0000;

        /// The chunk is on the free list.
        const FREE = 0b0100_0000;
    }
}

/// Address of a chunk within its store.
///
/// Chunk pointers are plain values; they do not keep the chunk alive.
/// Offset zero is never a chunk, so it encodes the absence of a link.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ChunkPtr(NonZeroU64);

impl ChunkPtr
{
    /// Create a chunk pointer, or [`None`] for offset zero.
    pub fn new(offset: u64) -> Option<Self>
    {
        NonZeroU64::new(offset).map(Self)
    }

    /// The offset of the chunk header.
    pub fn get(self) -> u64
    {
        self.0.get()
    }

    /// Offset a pointer by a number of bytes.
    pub fn add(self, bytes: u64) -> Self
    {
        let offset = self.0.checked_add(bytes)
            .expect("Chunk pointer overflows the address space");
        Self(offset)
    }
}

impl fmt::Debug for ChunkPtr
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        write!(f, "*{}", self.get())
    }
}

impl fmt::Display for ChunkPtr
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        write!(f, "*{}", self.get())
    }
}

/// Returned when the bytes at a chunk pointer are not a valid header.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum HeaderError
{
    #[error("No chunk header at {0}")]
    NotAHeader(ChunkPtr),

    #[error("Chunk {ptr} ends at {end}, past the store end at {store_len}")]
    OutOfBounds{ptr: ChunkPtr, end: u64, store_len: u64},

    #[error("Chunk {0} has a size larger than its capacity")]
    SizeExceedsCapacity(ChunkPtr),

    #[error("Chunk {0} links to itself")]
    SelfLink(ChunkPtr),

    #[error("Chain starting at {head} visits {ptr} twice")]
    Cycle{head: ChunkPtr, ptr: ChunkPtr},
}

/// Decoded chunk header.
///
/// A chunk value is a snapshot of the header in the store.
/// The public setters update the snapshot and write it back immediately;
/// the crate-internal `put_*` methods only update the snapshot,
/// so that several changes can be written in one transaction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Chunk
{
    ptr: ChunkPtr,
    free: bool,
    body_width: Width,
    link_width: Width,
    capacity: u64,
    size: u64,
    link: Option<ChunkPtr>,
}

impl Chunk
{
    /// The size of a header with the given widths.
    pub const fn header_size_for(body_width: Width, link_width: Width) -> u64
    {
        1 + 2 * body_width.bytes() + link_width.bytes()
    }

    /// Create an empty chunk with the given widths and capacity.
    ///
    /// The chunk is not written to any store.
    pub fn new(
        ptr:        ChunkPtr,
        body_width: Width,
        link_width: Width,
        capacity:   u64,
    ) -> std::result::Result<Self, EncodingError>
    {
        if !body_width.fits(capacity) {
            return Err(EncodingError{value: capacity, width: body_width});
        }
        Ok(Self{
            ptr, free: false, body_width, link_width,
            capacity, size: 0, link: None,
        })
    }

    /// The smallest empty chunk that holds `capacity` bytes.
    pub fn sized(ptr: ChunkPtr, capacity: u64, link_width: Width) -> Self
    {
        let body_width = Width::fitting(capacity).max(MIN_BODY_WIDTH);
        Self{
            ptr, free: false, body_width, link_width,
            capacity, size: 0, link: None,
        }
    }

    /// The extent of [`sized`][`Self::sized`] for the same arguments.
    pub fn sized_extent(capacity: u64, link_width: Width) -> u64
    {
        let body_width = Width::fitting(capacity).max(MIN_BODY_WIDTH);
        Self::header_size_for(body_width, link_width) + capacity
    }

    /// An empty chunk whose header and body span exactly `extent` bytes.
    ///
    /// The narrowest body width for which this works is chosen.
    /// Returns [`None`] if no body width works,
    /// which is only the case for extents smaller than the header.
    pub fn fitted(ptr: ChunkPtr, extent: u64, link_width: Width)
        -> Option<Self>
    {
        Width::ALL.into_iter().find_map(|body_width| {
            let header_size = Self::header_size_for(body_width, link_width);
            let capacity = extent.checked_sub(header_size)?;
            Self::new(ptr, body_width, link_width, capacity).ok()
        })
    }

    /// A canonical free chunk spanning `extent` bytes.
    pub fn free_with_extent(ptr: ChunkPtr, extent: u64) -> Option<Self>
    {
        let mut chunk = Self::fitted(ptr, extent, Width::Void)?;
        chunk.free = true;
        Some(chunk)
    }

    /// Read and validate the header at `ptr`.
    pub fn read(store: &dyn Store, ptr: ChunkPtr) -> Result<Self>
    {
        let mut buf = [0; MAX_HEADER_SIZE];
        store.read_at(ptr.get(), &mut buf[.. 1])?;
        Self::decode_rest(store, ptr, &mut buf, |offset, buf| {
            store.read_at(offset, buf)
        })
    }

    /// Like [`read`][`Self::read`], but observes pending writes.
    pub fn read_in(tx: &Transaction, ptr: ChunkPtr) -> Result<Self>
    {
        let mut buf = [0; MAX_HEADER_SIZE];
        tx.read_at(ptr.get(), &mut buf[.. 1])?;
        Self::decode_rest(tx.store(), ptr, &mut buf, |offset, buf| {
            tx.read_at(offset, buf)
        })
    }

    fn decode_rest<F>(
        store: &dyn Store,
        ptr: ChunkPtr,
        buf: &mut [u8; MAX_HEADER_SIZE],
        mut read_at: F,
    ) -> Result<Self>
        where F: FnMut(u64, &mut [u8]) -> io::Result<()>
    {
        let flags_byte = buf[0];
        let flags = ChunkFlags::from_bits_truncate(flags_byte);
        if !flags.contains(ChunkFlags::MARK) {
            return Err(HeaderError::NotAHeader(ptr).into());
        }

        let body_width = Width::from_code(flags_byte);
        let link_width = Width::from_code(flags_byte >> 3);
        let header_size = Self::header_size_for(body_width, link_width);
        read_at(ptr.get() + 1, &mut buf[1 .. header_size as usize])?;

        let body = body_width.bytes() as usize;
        let capacity = body_width.decode(&buf[1 ..]);
        let size = body_width.decode(&buf[1 + body ..]);
        let link = ChunkPtr::new(link_width.decode(&buf[1 + 2 * body ..]));

        if size > capacity {
            return Err(HeaderError::SizeExceedsCapacity(ptr).into());
        }
        if link == Some(ptr) {
            return Err(HeaderError::SelfLink(ptr).into());
        }

        let chunk = Self{
            ptr, free: flags.contains(ChunkFlags::FREE),
            body_width, link_width, capacity, size, link,
        };

        let store_len = store.len()?;
        if chunk.end() > store_len {
            let end = chunk.end();
            return Err(HeaderError::OutOfBounds{ptr, end, store_len}.into());
        }

        Ok(chunk)
    }

    /// The bytes of the header.
    pub fn encode(&self) -> SmallVec<[u8; MAX_HEADER_SIZE]>
    {
        const ERR: &str = "Chunk fields always fit their widths";

        let mut flags = ChunkFlags::MARK;
        flags.set(ChunkFlags::FREE, self.free);

        let mut buf = SmallVec::new();
        buf.push(
            flags.bits()
            | self.link_width.code() << 3
            | self.body_width.code()
        );
        self.body_width.encode(self.capacity, &mut buf).expect(ERR);
        self.body_width.encode(self.size, &mut buf).expect(ERR);
        let link = self.link.map_or(0, ChunkPtr::get);
        self.link_width.encode(link, &mut buf).expect(ERR);
        buf
    }

    /// Write the header to the store.
    pub fn sync(&self, store: &dyn Store) -> io::Result<()>
    {
        store.write_at(self.ptr.get(), &self.encode())
    }

    /// Queue a write of the header.
    pub fn sync_in(&self, tx: &mut Transaction)
    {
        tx.write(self.ptr.get(), self.encode().to_vec());
    }

    /* ---------------------------------------------------------------------- */
    /*                                 Getters                                */
    /* ---------------------------------------------------------------------- */

    /// The address of the chunk.
    pub fn ptr(&self) -> ChunkPtr
    {
        self.ptr
    }

    /// Whether the chunk is marked free.
    pub fn is_free(&self) -> bool
    {
        self.free
    }

    /// Width of the capacity and size fields.
    pub fn body_width(&self) -> Width
    {
        self.body_width
    }

    /// Width of the link field.
    pub fn link_width(&self) -> Width
    {
        self.link_width
    }

    /// The number of bytes reserved for the body.
    pub fn capacity(&self) -> u64
    {
        self.capacity
    }

    /// The number of body bytes in use.
    pub fn size(&self) -> u64
    {
        self.size
    }

    /// The continuation of the chain, if any.
    pub fn link(&self) -> Option<ChunkPtr>
    {
        self.link
    }

    /// The size of the header.
    pub fn header_size(&self) -> u64
    {
        Self::header_size_for(self.body_width, self.link_width)
    }

    /// The offset of the first body byte.
    pub fn body_start(&self) -> u64
    {
        self.ptr.get() + self.header_size()
    }

    /// The offset just past the body,
    /// which is where the physically next chunk starts.
    pub fn end(&self) -> u64
    {
        self.body_start() + self.capacity
    }

    /// The number of bytes spanned by header and body.
    pub fn extent(&self) -> u64
    {
        self.header_size() + self.capacity
    }

    /// The largest capacity the body width can describe.
    pub fn max_capacity(&self) -> u64
    {
        self.body_width.max_value()
    }

    /// Whether the chunk is the last chunk in the store.
    pub fn is_tail(&self, store: &dyn Store) -> io::Result<bool>
    {
        Ok(self.end() == store.len()?)
    }

    /// Whether another chunk follows this one physically.
    pub fn is_followed(&self, store: &dyn Store) -> io::Result<bool>
    {
        Ok(self.end() < store.len()?)
    }

    /* ---------------------------------------------------------------------- */
    /*                                 Setters                                */
    /* ---------------------------------------------------------------------- */

    /// Change the capacity and write the header.
    pub fn set_capacity(&mut self, store: &dyn Store, capacity: u64)
        -> Result<()>
    {
        self.put_capacity(capacity)?;
        Ok(self.sync(store)?)
    }

    /// Change the size and write the header.
    pub fn set_size(&mut self, store: &dyn Store, size: u64) -> Result<()>
    {
        self.put_size(size)?;
        Ok(self.sync(store)?)
    }

    /// Change the link and write the header.
    pub fn set_link(&mut self, store: &dyn Store, link: Option<ChunkPtr>)
        -> Result<()>
    {
        self.put_link(link)?;
        Ok(self.sync(store)?)
    }

    /// Change the capacity without writing the header.
    pub(crate) fn put_capacity(&mut self, capacity: u64) -> Result<()>
    {
        if !self.body_width.fits(capacity) {
            let width = self.body_width;
            return Err(EncodingError{value: capacity, width}.into());
        }
        if self.size > capacity {
            return Err(HeaderError::SizeExceedsCapacity(self.ptr).into());
        }
        self.capacity = capacity;
        Ok(())
    }

    /// Change the size without writing the header.
    pub(crate) fn put_size(&mut self, size: u64) -> Result<()>
    {
        if size > self.capacity {
            return Err(HeaderError::SizeExceedsCapacity(self.ptr).into());
        }
        self.size = size;
        Ok(())
    }

    /// Change the link without writing the header.
    pub(crate) fn put_link(&mut self, link: Option<ChunkPtr>) -> Result<()>
    {
        if link == Some(self.ptr) {
            return Err(HeaderError::SelfLink(self.ptr).into());
        }
        let value = link.map_or(0, ChunkPtr::get);
        if !self.link_width.fits(value) {
            let width = self.link_width;
            return Err(EncodingError{value, width}.into());
        }
        self.link = link;
        Ok(())
    }

    /// Change both widths, keeping the extent.
    ///
    /// The capacity absorbs the difference in header size.
    /// Fails if the used bytes would no longer fit
    /// or the new capacity does not fit the new body width.
    /// Returns by how many bytes the header grew.
    pub(crate) fn put_widths(&mut self, body_width: Width, link_width: Width)
        -> Result<u64>
    {
        let extent = self.extent();
        let header_size = Self::header_size_for(body_width, link_width);
        let old_header_size = self.header_size();

        let capacity = extent.checked_sub(header_size)
            .filter(|capacity| *capacity >= self.size)
            .ok_or(HeaderError::SizeExceedsCapacity(self.ptr))?;
        if !body_width.fits(capacity) {
            return Err(EncodingError{value: capacity, width: body_width}.into());
        }
        let link = self.link.map_or(0, ChunkPtr::get);
        if !link_width.fits(link) {
            return Err(EncodingError{value: link, width: link_width}.into());
        }

        self.body_width = body_width;
        self.link_width = link_width;
        self.capacity = capacity;
        Ok(header_size.saturating_sub(old_header_size))
    }

    /// Bring the header into the canonical free form.
    ///
    /// The size and link are cleared, the link field is dropped,
    /// and the narrowest body width is chosen.
    /// The extent does not change; the capacity absorbs the freed header bytes.
    /// Canonical headers keep merges and comparisons deterministic.
    pub fn clear_and_compress_header(&mut self)
    {
        *self = Self::free_with_extent(self.ptr, self.extent())
            .expect("Every chunk extent has a free header");
    }
}
