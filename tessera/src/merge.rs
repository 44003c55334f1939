//! Returning chunks to the free list.
//!
//! Freed chunks are first coalesced among themselves,
//! then inserted into the free list one by one,
//! merging with the entries around them.
//! Finally, free space at the end of the store is given back
//! by truncating the store.

use {
    crate::{
        Result,
        chunk::{Chunk, ChunkPtr, MAX_HEADER_SIZE},
        config::PurgeMode,
        free_list::wedge,
        manager::Allocator,
        store::{FIRST_CHUNK, Store, Transaction},
        strategy::carve,
        width::Width,
    },
    log::{debug, trace, warn},
    std::{io, num::NonZeroUsize, thread},
};

/// Zeroes are written in pieces of this size.
const ZERO_BLOCK: usize = 64 * 1024;

impl<'a> Allocator<'a>
{
    /// Free chunks and compact the store tail.
    pub(crate) fn free_batch(&mut self, ptrs: &[ChunkPtr]) -> Result<()>
    {
        self.release(ptrs)?;
        self.compact_tail()
    }

    /// Free chunks without compacting the store tail.
    fn release(&mut self, ptrs: &[ChunkPtr]) -> Result<()>
    {
        let mut ptrs = ptrs.to_vec();
        ptrs.sort_unstable();
        ptrs.dedup();

        let mut chunks = Vec::with_capacity(ptrs.len());
        for ptr in ptrs {
            let chunk = Chunk::read(self.store(), ptr)?;
            if chunk.is_free() {
                warn!("Ignoring free of {ptr}, which is already free");
                continue;
            }
            self.listener().notify_destroyed(ptr);
            chunks.push(chunk);
        }

        if chunks.is_empty() {
            return Ok(());
        }

        debug!("Freeing {} chunks", chunks.len());
        for chunk in self.merge_chunks(chunks)? {
            self.insert_free(chunk)?;
        }
        Ok(())
    }

    /// Coalesce physically adjacent chunks within a sorted batch.
    ///
    /// Every resulting run is written as one canonical free chunk.
    fn merge_chunks(&self, chunks: Vec<Chunk>) -> Result<Vec<Chunk>>
    {
        let mut runs: Vec<(Chunk, Vec<Chunk>)> = Vec::new();
        for chunk in chunks {
            let touches = runs.last().map_or(false, |(first, absorbed)| {
                absorbed.last().unwrap_or(first).end() == chunk.ptr().get()
            });
            if touches {
                runs.last_mut().expect("Touched a run").1.push(chunk);
            } else {
                runs.push((chunk, Vec::new()));
            }
        }

        let mut merged = Vec::with_capacity(runs.len());
        for (first, absorbed) in runs {
            let extent = first.extent()
                + absorbed.iter().map(Chunk::extent).sum::<u64>();
            let free = Chunk::free_with_extent(first.ptr(), extent)
                .expect("Every chunk extent has a free header");

            if !absorbed.is_empty() {
                debug!("Merged {} freed chunks into {}", absorbed.len() + 1,
                       free.ptr());
            }
            for chunk in &absorbed {
                self.purge_header(chunk)?;
            }
            if self.config().purge == PurgeMode::Full {
                zero_fill(
                    self.store(),
                    free.body_start(),
                    free.capacity(),
                    self.config().parallel_purge_threshold,
                )?;
            }

            free.sync(self.store())?;
            merged.push(free);
        }
        Ok(merged)
    }

    /// Zero the header of a chunk that became part of another chunk.
    fn purge_header(&self, chunk: &Chunk) -> io::Result<()>
    {
        if self.config().purge == PurgeMode::Off {
            return Ok(());
        }
        let zeroes = [0; MAX_HEADER_SIZE];
        let header_size = chunk.header_size() as usize;
        self.store().write_at(chunk.ptr().get(), &zeroes[.. header_size])
    }

    /// Insert a canonical free chunk into the free list.
    ///
    /// The chunk is merged with the preceding entry if they touch,
    /// and then with the following entry if they touch.
    /// No further entries need checking,
    /// since entries already in the list never touch each other.
    fn insert_free(&mut self, chunk: Chunk) -> Result<()>
    {
        let store = self.store();
        let index = wedge(&*self.free_list, chunk.ptr().get());
        let mut merged = chunk;
        let mut reuses_previous = false;

        if index > 0 {
            let previous = Chunk::read(store, self.free_list.get(index - 1))?;
            if previous.end() == merged.ptr().get() {
                self.purge_header(&merged)?;
                merged = combine(&previous, &merged);
                reuses_previous = true;
            }
        }

        if index < self.free_list.len() {
            let next = Chunk::read(store, self.free_list.get(index))?;
            if merged.end() == next.ptr().get() {
                self.purge_header(&next)?;
                self.listener().notify_destroyed(next.ptr());
                self.free_list.remove(index);
                merged = combine(&merged, &next);
            }
        }

        if !reuses_previous {
            self.free_list.insert(index, merged.ptr());
        }
        trace!("Free chunk {} now spans {} bytes", merged.ptr(), merged.extent());
        Ok(merged.sync(store)?)
    }

    /// Give back free space at the end of the store.
    ///
    /// Each time the last free chunk is the last chunk,
    /// the store is truncated to where it starts.
    /// If instead a live chunk sits right behind it,
    /// that chunk may be moved to lower addresses first.
    pub(crate) fn compact_tail(&mut self) -> Result<()>
    {
        let store = self.store();
        let config = self.config();
        let mut relocations = 0;
        while let Some(last) = self.free_list.last() {
            let chunk = Chunk::read(store, last)?;
            if chunk.is_tail(store)? {
                self.free_list.remove(self.free_list.len() - 1);
                store.set_len(last.get())?;
                self.listener().notify_destroyed(last);
                debug!("Truncated store to {}", last.get());
                continue;
            }

            if !config.relocate_tail || relocations >= config.max_tail_relocations {
                break;
            }
            if !self.relocate_behind(&chunk)? {
                break;
            }
            relocations += 1;
        }
        Ok(())
    }

    /// Move the chunk following `free` to lower addresses,
    /// if it is the last chunk of the store.
    ///
    /// Only chunks that are linked to by another chunk are moved;
    /// chain heads are referred to from outside the store.
    /// The move waits for chain I/O on other threads to stop.
    /// Returns whether the chunk was moved.
    fn relocate_behind(&mut self, free: &Chunk) -> Result<bool>
    {
        let store = self.store();
        let ptr = ChunkPtr::new(free.end()).expect("Chunks end past zero");
        let tail = Chunk::read(store, ptr)?;
        if tail.is_free() || !tail.is_tail(store)? {
            return Ok(false);
        }

        let Some(referrer) = self.find_referrer(ptr)? else {
            return Ok(false);
        };

        // Keep the capacity, so the chain does not shrink.
        let size = tail.size();
        let fits = |at: ChunkPtr| referrer.link_width().fits(at.get());
        let Some((index, mut chunk, remainder)) =
            self.lowest_fit(tail.capacity(), tail.link_width(), ptr, fits)?
        else {
            return Ok(false);
        };

        let manager = self.manager;
        let timeout = self.config().drain_timeout();
        let moved = manager.activity().with_drain(timeout, || -> Result<()> {
            let mut data = vec![0; size as usize];
            store.read_at(tail.body_start(), &mut data)?;

            const ERR: &str = "Replacement was chosen to fit";
            let mut referrer = Chunk::read(store, referrer.ptr())?;
            chunk.put_size(size).expect(ERR);
            chunk.put_link(tail.link()).expect(ERR);
            referrer.put_link(Some(chunk.ptr())).expect(ERR);

            let mut tx = Transaction::new(store);
            if let Some(remainder) = &remainder {
                remainder.sync_in(&mut tx);
            }
            chunk.sync_in(&mut tx);
            tx.write(chunk.body_start(), data);
            referrer.sync_in(&mut tx);
            tx.commit()?;

            match remainder {
                Some(remainder) => self.free_list.set(index, remainder.ptr()),
                None => { self.free_list.remove(index); },
            }
            Ok(())
        });

        match moved {
            Some(result) => result?,
            None => return Ok(false),
        }

        debug!("Moved {} to {} to shrink the store", ptr, chunk.ptr());
        self.listener().notify_created(&chunk);
        self.release(&[ptr])?;
        Ok(true)
    }

    /// The live chunk whose link is `ptr`, if any.
    fn find_referrer(&self, ptr: ChunkPtr) -> Result<Option<Chunk>>
    {
        let store = self.store();
        let store_len = store.len()?;
        let mut offset = FIRST_CHUNK;
        while offset < store_len {
            let at = ChunkPtr::new(offset).expect("Chunks start past the magic");
            let chunk = Chunk::read(store, at)?;
            if !chunk.is_free() && chunk.link() == Some(ptr) {
                return Ok(Some(chunk));
            }
            offset = chunk.end();
        }
        Ok(None)
    }

    /// Find the lowest free chunk below `limit` that can hold
    /// a chunk of `capacity` bytes at an address accepted by `fits`.
    ///
    /// Returns its index along with the carved chunk and remainder,
    /// which are not yet written.
    fn lowest_fit<F>(
        &self,
        capacity:   u64,
        link_width: Width,
        limit:      ChunkPtr,
        fits:       F,
    ) -> Result<Option<(usize, Chunk, Option<Chunk>)>>
        where F: Fn(ChunkPtr) -> bool
    {
        for index in 0 .. self.free_list.len() {
            let ptr = self.free_list.get(index);
            if ptr >= limit {
                break;
            }
            if !fits(ptr) {
                continue;
            }
            let free = Chunk::read(self.store(), ptr)?;
            if let Some((chunk, remainder)) =
                carve(&free, capacity, link_width, false)
            {
                return Ok(Some((index, chunk, remainder)));
            }
        }
        Ok(None)
    }
}

/// A canonical free chunk spanning two adjacent chunks.
fn combine(first: &Chunk, second: &Chunk) -> Chunk
{
    debug_assert_eq!(first.end(), second.ptr().get());
    Chunk::free_with_extent(first.ptr(), first.extent() + second.extent())
        .expect("Every chunk extent has a free header")
}

/// Write `len` zeroes at `offset`.
///
/// Spans longer than `parallel_threshold` are split between threads.
pub(crate) fn zero_fill(
    store:              &dyn Store,
    offset:             u64,
    len:                u64,
    parallel_threshold: u64,
) -> io::Result<()>
{
    if len <= parallel_threshold {
        return zero_fill_serial(store, offset, len);
    }

    let threads = thread::available_parallelism()
        .map_or(1, NonZeroUsize::get) as u64;
    let part = (len + threads - 1) / threads;
    trace!("Zeroing {len} bytes at {offset} on {threads} threads");

    thread::scope(|s| {
        let handles: Vec<_> = (0 .. threads)
            .map(|i| {
                let start = (i * part).min(len);
                let end = (start + part).min(len);
                s.spawn(move || {
                    zero_fill_serial(store, offset + start, end - start)
                })
            })
            .collect();
        handles.into_iter()
            .map(|handle| handle.join().expect("Zeroing thread panicked"))
            .collect()
    })
}

fn zero_fill_serial(store: &dyn Store, mut offset: u64, mut len: u64)
    -> io::Result<()>
{
    let zeroes = vec![0; ZERO_BLOCK.min(len as usize)];
    while len > 0 {
        let n = zeroes.len().min(len as usize);
        store.write_at(offset, &zeroes[.. n])?;
        offset += n as u64;
        len -= n as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests
{
    use {super::*, crate::store::MemoryStore};

    #[test]
    fn zero_fill_splits_between_threads()
    {
        let store = MemoryStore::new();
        store.write_at(0, &vec![0xFF; 10_000]).unwrap();

        zero_fill(&store, 100, 9_000, 1_000).unwrap();

        let bytes = store.to_vec();
        assert!(bytes[.. 100].iter().all(|b| *b == 0xFF));
        assert!(bytes[100 .. 9_100].iter().all(|b| *b == 0));
        assert!(bytes[9_100 ..].iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn zero_fill_of_nothing_writes_nothing()
    {
        let store = MemoryStore::new();
        zero_fill(&store, 50, 0, 0).unwrap();
        assert_eq!(store.len().unwrap(), 0);
    }
}
