//! Chains of linked chunks as byte streams.

use {
    crate::{
        Result,
        chunk::{Chunk, ChunkPtr, HeaderError},
        manager::ChunkManager,
        store::{Store, Transaction},
    },
    std::{
        collections::HashSet,
        io::{self, ErrorKind::InvalidInput},
    },
};

/// Walks the chunks of a chain, reading each header on demand.
///
/// Yields an error and stops when a header cannot be read
/// or when a chunk is visited a second time.
pub struct ChainIter<'s>
{
    store: &'s dyn Store,
    head: ChunkPtr,
    next: Option<ChunkPtr>,
    visited: HashSet<ChunkPtr>,
}

impl<'s> ChainIter<'s>
{
    /// Walk the chain starting at `head`.
    pub fn new(store: &'s dyn Store, head: ChunkPtr) -> Self
    {
        Self{store, head, next: Some(head), visited: HashSet::new()}
    }
}

impl<'s> Iterator for ChainIter<'s>
{
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item>
    {
        let ptr = self.next.take()?;
        if !self.visited.insert(ptr) {
            return Some(Err(HeaderError::Cycle{head: self.head, ptr}.into()));
        }
        let chunk = Chunk::read(self.store, ptr);
        if let Ok(chunk) = &chunk {
            self.next = chunk.link();
        }
        Some(chunk)
    }
}

/// The logical byte stream stored in a chain.
///
/// The stream is the concatenation of the used bytes of every member.
/// All operations register the chain as in use for their duration,
/// so the chain cannot be freed from under them.
pub struct Chain<'m>
{
    manager: &'m ChunkManager,
    head: ChunkPtr,
}

impl<'m> Chain<'m>
{
    /// The chain starting at `head`.
    pub fn new(manager: &'m ChunkManager, head: ChunkPtr) -> Self
    {
        Self{manager, head}
    }

    /// The first chunk of the chain.
    pub fn head(&self) -> ChunkPtr
    {
        self.head
    }

    /// The headers of all members, in chain order.
    pub fn members(&self) -> Result<Vec<Chunk>>
    {
        self.manager.with_chain_io(self.head, || {
            self.manager.chain(self.head).collect()
        })
    }

    /// Total capacity of all members.
    pub fn capacity(&self) -> Result<u64>
    {
        Ok(self.members()?.iter().map(Chunk::capacity).sum())
    }

    /// Length of the stream.
    pub fn len(&self) -> Result<u64>
    {
        Ok(self.members()?.iter().map(Chunk::size).sum())
    }

    /// Whether the stream is empty.
    pub fn is_empty(&self) -> Result<bool>
    {
        Ok(self.len()? == 0)
    }

    /// Read the entire stream.
    pub fn read_all(&self) -> Result<Vec<u8>>
    {
        self.manager.with_chain_io(self.head, || self.read_locked())
    }

    fn read_locked(&self) -> Result<Vec<u8>>
    {
        let store = self.manager.store();
        let mut data = Vec::new();
        for member in self.manager.chain(self.head) {
            let member = member?;
            let at = data.len();
            data.resize(at + member.size() as usize, 0);
            store.read_at(member.body_start(), &mut data[at ..])?;
        }
        Ok(data)
    }

    /// Overwrite or extend the stream at `pos`.
    ///
    /// `pos` must not be past the end of the stream.
    /// The chain is grown if the data does not fit.
    /// Afterwards, every member but the last nonempty one is full.
    pub fn write_at(&self, pos: u64, data: &[u8]) -> Result<()>
    {
        self.manager.with_chain_io(self.head, || {
            let mut stream = self.read_locked()?;
            if pos > stream.len() as u64 {
                let message = "Chain write starts past the end of the stream";
                return Err(io::Error::new(InvalidInput, message).into());
            }

            let pos = pos as usize;
            let end = pos + data.len();
            if end > stream.len() {
                stream.resize(end, 0);
            }
            stream[pos .. end].copy_from_slice(data);

            let members = self.manager.chain(self.head)
                .collect::<Result<Vec<_>>>()?;
            let capacity: u64 = members.iter().map(Chunk::capacity).sum();
            if (stream.len() as u64) > capacity {
                let last = members.last().expect("Chains are never empty").ptr();
                let needed = stream.len() as u64 - capacity;
                self.manager.grow(self.head, last, needed)?;
            }

            self.lay_out(&stream, pos)
        })
    }

    /// Distribute `stream` over the members, filling each in turn.
    ///
    /// Members that hold only bytes before `dirty_from` and keep their size
    /// are left alone.
    fn lay_out(&self, stream: &[u8], dirty_from: usize) -> Result<()>
    {
        let store = self.manager.store();
        let mut tx = Transaction::new(store);
        let mut offset = 0;
        let mut dirty = false;

        for member in self.manager.chain(self.head) {
            let mut member = member?;
            let start = offset.min(stream.len());
            let end = (offset + member.capacity() as usize).min(stream.len());
            offset += member.capacity() as usize;

            let size = (end - start) as u64;
            dirty |= size != member.size() || offset > dirty_from;
            if !dirty {
                continue;
            }

            member.put_size(size).expect("Size is limited to the capacity");
            member.sync_in(&mut tx);
            tx.write(member.body_start(), &stream[start .. end]);
        }

        Ok(tx.commit()?)
    }
}

#[cfg(test)]
mod tests
{
    use {
        super::*,
        crate::{Config, Error, MemoryStore, Ticket, Width},
        std::sync::Arc,
    };

    fn manager() -> ChunkManager
    {
        let store = Arc::new(MemoryStore::new());
        ChunkManager::create(store, Config::default()).unwrap()
    }

    fn ptr(offset: u64) -> ChunkPtr
    {
        ChunkPtr::new(offset).unwrap()
    }

    #[test]
    fn iter_detects_cycles()
    {
        let manager = manager();
        let a = manager.allocate(&Ticket::new(4).link_width(Width::U16)).unwrap();
        let mut b = manager.allocate(&Ticket::new(4).link_width(Width::U16))
            .unwrap();
        let mut a2 = a.clone();
        a2.set_link(manager.store(), Some(b.ptr())).unwrap();
        b.set_link(manager.store(), Some(a.ptr())).unwrap();

        let walked: Vec<Result<Chunk>> = manager.chain(a.ptr()).collect();
        assert_eq!(walked.len(), 3);
        assert!(matches!(
            walked[2],
            Err(Error::Header(HeaderError::Cycle{head, ptr}))
                if head == a.ptr() && ptr == a.ptr()
        ));

        // Break the cycle again, so the store is consistent.
        b.set_link(manager.store(), None).unwrap();
    }

    #[test]
    fn iter_stops_at_bad_header()
    {
        let manager = manager();
        let walked: Vec<Result<Chunk>> = manager.chain(ptr(3)).collect();
        assert_eq!(walked.len(), 1);
        assert!(walked[0].is_err());
    }

    #[test]
    fn write_grows_and_reads_back()
    {
        let manager = manager();
        let head = manager.allocate(&Ticket::new(8).link_width(Width::U16))
            .unwrap();
        manager.allocate(&Ticket::new(8)).unwrap();
        let chain = Chain::new(&manager, head.ptr());
        assert!(chain.is_empty().unwrap());

        let data: Vec<u8> = (0 .. 100).collect();
        chain.write_at(0, &data).unwrap();

        assert_eq!(chain.len().unwrap(), 100);
        assert_eq!(chain.read_all().unwrap(), data);
        assert!(chain.members().unwrap().len() >= 2);
        assert_eq!(chain.members().unwrap()[0].size(), 8);
    }

    #[test]
    fn write_overwrites_in_the_middle()
    {
        let manager = manager();
        let head = manager.allocate(&Ticket::new(8).link_width(Width::U16))
            .unwrap();
        let chain = Chain::new(&manager, head.ptr());

        chain.write_at(0, b"hello, world").unwrap();
        chain.write_at(7, b"there").unwrap();
        assert_eq!(chain.read_all().unwrap(), b"hello, there");

        chain.write_at(12, b"!").unwrap();
        assert_eq!(chain.read_all().unwrap(), b"hello, there!");
    }

    #[test]
    fn write_past_end_is_rejected()
    {
        let manager = manager();
        let head = manager.allocate(&Ticket::new(8)).unwrap();
        let chain = Chain::new(&manager, head.ptr());
        assert!(matches!(chain.write_at(1, b"x"), Err(Error::Io(_))));
        assert!(chain.is_empty().unwrap());
    }

    #[test]
    fn head_cannot_be_freed_during_io()
    {
        let manager = manager();
        let head = manager.allocate(&Ticket::new(8)).unwrap();
        manager.with_chain_io(head.ptr(), || {
            let err = manager.free_chain(head.ptr()).unwrap_err();
            assert!(matches!(err, Error::UseWhileFreeing(_)));
        });
        manager.free_chain(head.ptr()).unwrap();
    }
}
