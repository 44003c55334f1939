//! The entry point for allocating, growing, and freeing chunks.

use {
    crate::{
        Error,
        Result,
        activity::ActivityTracker,
        chain::ChainIter,
        chunk::{Chunk, ChunkPtr},
        config::Config,
        free_list::{FreeList, VecFreeList},
        listener::{ChunkListener, NoopListener},
        store::{FIRST_CHUNK, Store, check_magic, format},
        strategy,
        ticket::Ticket,
        verify,
    },
    log::{debug, warn},
    parking_lot::Mutex,
    scope_exit::scope_exit,
    std::sync::{Arc, atomic::{AtomicUsize, Ordering::SeqCst}},
};

/// Allocates chunks in a store and keeps track of free ones.
///
/// All structural changes to the store go through a single lock,
/// which also guards the free list.
/// Frees that arrive while another thread holds the lock
/// are queued and performed by that thread before it releases the lock.
pub struct ChunkManager
{
    store: Arc<dyn Store>,
    config: Config,
    listener: Box<dyn ChunkListener>,

    free_list: Mutex<Box<dyn FreeList>>,

    /// Frees waiting for the free list lock.
    pending: Mutex<Vec<ChunkPtr>>,

    /// Queued frees of chains that were in use when their turn came.
    /// They are retried by every later allocator operation.
    deferred: Mutex<Vec<ChunkPtr>>,

    activity: ActivityTracker,

    /// Number of open defragment mode scopes.
    defragmenting: AtomicUsize,
}

impl ChunkManager
{
    /// Format an empty store and manage it.
    pub fn create(store: Arc<dyn Store>, config: Config) -> Result<Self>
    {
        format(&*store)?;
        Ok(Self::from_parts(store, config, Box::new(VecFreeList::new())))
    }

    /// Manage a store that was formatted before.
    ///
    /// The free list is rebuilt from the headers of the chunks,
    /// which record whether each chunk is free.
    pub fn open(store: Arc<dyn Store>, config: Config) -> Result<Self>
    {
        check_magic(&*store)?;

        let store_len = store.len()?;
        let mut free = Vec::new();
        let mut offset = FIRST_CHUNK;
        while offset < store_len {
            let ptr = ChunkPtr::new(offset).expect("Chunks start past the magic");
            let chunk = Chunk::read(&*store, ptr)?;
            if chunk.is_free() {
                free.push(ptr);
            }
            offset = chunk.end();
        }

        debug!("Opened store of {store_len} bytes with {} free chunks", free.len());
        let free_list = Box::new(VecFreeList::from_unsorted(free));
        Ok(Self::from_parts(store, config, free_list))
    }

    /// Manage a formatted store with a free list that matches it.
    ///
    /// The free list must contain exactly the chunks marked free,
    /// in address order.
    pub fn from_parts(
        store:     Arc<dyn Store>,
        config:    Config,
        free_list: Box<dyn FreeList>,
    ) -> Self
    {
        Self{
            store,
            config,
            listener: Box::new(NoopListener),
            free_list: Mutex::new(free_list),
            pending: Mutex::new(Vec::new()),
            deferred: Mutex::new(Vec::new()),
            activity: ActivityTracker::new(),
            defragmenting: AtomicUsize::new(0),
        }
    }

    /// Send chunk notifications to `listener`.
    pub fn with_listener<L>(mut self, listener: L) -> Self
        where L: ChunkListener + 'static
    {
        self.listener = Box::new(listener);
        self
    }

    /// The managed store.
    pub fn store(&self) -> &dyn Store
    {
        &*self.store
    }

    /// The configuration the manager was created with.
    pub fn config(&self) -> &Config
    {
        &self.config
    }

    /// Per-thread chain activity.
    pub fn activity(&self) -> &ActivityTracker
    {
        &self.activity
    }

    /// Read the header at `ptr`.
    pub fn read_chunk(&self, ptr: ChunkPtr) -> Result<Chunk>
    {
        Chunk::read(&*self.store, ptr)
    }

    /// Walk the chain starting at `head`.
    pub fn chain(&self, head: ChunkPtr) -> ChainIter
    {
        ChainIter::new(&*self.store, head)
    }

    /// Copy of the free list.
    pub fn free_list_snapshot(&self) -> Vec<ChunkPtr>
    {
        self.free_list.lock().to_vec()
    }

    /// Check the structural invariants of the store and free list.
    pub fn check_consistency(&self) -> Result<()>
    {
        let free_list = self.free_list.lock();
        verify::check_store(&*self.store, &**free_list)
    }

    /* ---------------------------------------------------------------------- */
    /*                               Allocation                               */
    /* ---------------------------------------------------------------------- */

    /// Allocate a chunk for a ticket, if any strategy can provide one.
    pub fn try_allocate(&self, ticket: &Ticket) -> Result<Option<Chunk>>
    {
        self.with_allocator(|allocator| strategy::allocate(allocator, ticket))
    }

    /// Allocate a chunk for a ticket.
    pub fn allocate(&self, ticket: &Ticket) -> Result<Chunk>
    {
        self.try_allocate(ticket)?
            .ok_or(Error::OutOfSpace{requested: ticket.bytes()})
    }

    /// Add at least `bytes` of capacity to the chain at `head`.
    ///
    /// Growth starts at `target`, which should be the last chunk
    /// of the chain; later steps continue at whatever is then the last.
    /// Returns the number of bytes of capacity gained.
    pub fn grow(&self, head: ChunkPtr, target: ChunkPtr, bytes: u64)
        -> Result<u64>
    {
        self.with_allocator(|allocator| {
            strategy::grow(allocator, head, target, bytes)
        })
    }

    /// Disable reuse of free chunks while `f` runs.
    ///
    /// Chunks allocated by `f` are appended to the store,
    /// so that a defragmentation pass does not fill the holes
    /// it is about to merge with the chunks it is about to free.
    pub fn with_defragment_mode<F, R>(&self, f: F) -> R
        where F: FnOnce() -> R
    {
        self.defragmenting.fetch_add(1, SeqCst);
        scope_exit! { self.defragmenting.fetch_sub(1, SeqCst); }
        f()
    }

    /// Whether a defragment mode scope is open.
    pub fn is_defragmenting(&self) -> bool
    {
        self.defragmenting.load(SeqCst) != 0
    }

    /* ---------------------------------------------------------------------- */
    /*                                  Freeing                                */
    /* ---------------------------------------------------------------------- */

    /// Free chunks.
    ///
    /// Fails if any of the chunks is the head of a chain
    /// that some thread is doing I/O on, or is already free.
    /// In that case none of the chunks are freed.
    /// Frees that have to wait for the lock are performed later,
    /// but not while their chain is in use.
    pub fn free(&self, ptrs: &[ChunkPtr]) -> Result<()>
    {
        if ptrs.is_empty() {
            return Ok(());
        }

        for &ptr in ptrs {
            if self.activity.is_active(ptr) {
                return Err(Error::UseWhileFreeing(ptr));
            }
            if Chunk::read(&*self.store, ptr)?.is_free() {
                return Err(Error::AlreadyFree(ptr));
            }
        }

        self.pending.lock().extend_from_slice(ptrs);
        self.drain_pending();
        Ok(())
    }

    /// Free every chunk of the chain at `head`.
    pub fn free_chain(&self, head: ChunkPtr) -> Result<()>
    {
        let members = self.chain(head)
            .map(|chunk| chunk.map(|chunk| chunk.ptr()))
            .collect::<Result<Vec<_>>>()?;
        self.free(&members)
    }

    /* ---------------------------------------------------------------------- */
    /*                                Chain I/O                               */
    /* ---------------------------------------------------------------------- */

    /// Mark the chain at `head` as in use while `f` runs.
    ///
    /// Freeing the head fails while `f` runs,
    /// and moving chunks around waits for `f` to return.
    pub fn with_chain_io<F, R>(&self, head: ChunkPtr, f: F) -> R
        where F: FnOnce() -> R
    {
        self.activity.enter(head);
        scope_exit! { self.activity.leave(head); }
        f()
    }

    /* ---------------------------------------------------------------------- */
    /*                                 Locking                                */
    /* ---------------------------------------------------------------------- */

    /// Run `f` with exclusive access to the free list.
    fn with_allocator<F, R>(&self, f: F) -> Result<R>
        where F: FnOnce(&mut Allocator) -> Result<R>
    {
        let result = {
            let mut free_list = self.free_list.lock();
            let mut allocator = Allocator{manager: self, free_list: &mut **free_list};
            let result = f(&mut allocator);
            allocator.free_pending();
            allocator.verify();
            result
        };

        // Frees queued between our last check and unlocking.
        self.drain_pending();
        result
    }

    /// Perform queued frees, unless another thread holds the lock.
    ///
    /// The thread holding the lock checks the queue
    /// after releasing it, so no free is left behind.
    fn drain_pending(&self)
    {
        while !self.pending.lock().is_empty() {
            let Some(mut free_list) = self.free_list.try_lock() else {
                return;
            };
            let mut allocator = Allocator{manager: self, free_list: &mut **free_list};
            allocator.free_pending();
            allocator.verify();
        }
    }
}

/// Exclusive access to the free list, with the manager it belongs to.
///
/// Allocation strategies and the merge engine operate on this,
/// so they can only run while the free list lock is held.
pub(crate) struct Allocator<'a>
{
    pub(crate) manager: &'a ChunkManager,
    pub(crate) free_list: &'a mut dyn FreeList,
}

impl<'a> Allocator<'a>
{
    pub(crate) fn store(&self) -> &'a dyn Store
    {
        &*self.manager.store
    }

    pub(crate) fn config(&self) -> &'a Config
    {
        &self.manager.config
    }

    pub(crate) fn listener(&self) -> &'a dyn ChunkListener
    {
        &*self.manager.listener
    }

    /// Free everything in the queue.
    ///
    /// A chain may have come into use after its free was queued.
    /// Such frees are deferred until a later operation finds it unused.
    /// Errors cannot be reported to the threads that queued the frees,
    /// so they are logged.
    fn free_pending(&mut self)
    {
        let deferred = std::mem::take(&mut *self.manager.deferred.lock());
        self.manager.pending.lock().extend(deferred);

        loop {
            let batch = std::mem::take(&mut *self.manager.pending.lock());
            if batch.is_empty() {
                break;
            }

            let activity = self.manager.activity();
            let (busy, ready): (Vec<ChunkPtr>, Vec<ChunkPtr>) =
                batch.into_iter().partition(|ptr| activity.is_active(*ptr));
            for ptr in &busy {
                warn!("Deferring queued free of {ptr}, which is now in use");
            }
            self.manager.deferred.lock().extend(busy);

            if let Err(err) = self.free_batch(&ready) {
                warn!("Queued free of {} chunks failed: {err}", ready.len());
            }
        }
    }

    /// Panic if the store is in an inconsistent state.
    fn verify(&self)
    {
        if !verify::enabled() {
            return;
        }
        if let Err(err) = verify::check_store(self.store(), &*self.free_list) {
            panic!("Allocator left the store inconsistent: {err}");
        }
    }
}

#[cfg(test)]
mod tests
{
    use {
        super::*,
        crate::{
            chain::Chain,
            chunk::MIN_FREE_EXTENT,
            config::PurgeMode,
            store::{FileStore, MemoryStore},
            width::Width,
        },
        proptest::{self as p, proptest},
        std::{
            io,
            sync::{Barrier, atomic::AtomicU64},
            thread,
        },
    };

    fn manager() -> ChunkManager
    {
        manager_with(Config::default())
    }

    fn manager_with(config: Config) -> ChunkManager
    {
        ChunkManager::create(Arc::new(MemoryStore::new()), config).unwrap()
    }

    fn store_len(manager: &ChunkManager) -> u64
    {
        manager.store().len().unwrap()
    }

    /// Counts how often the store is resized.
    struct CountingStore
    {
        inner: MemoryStore,
        resizes: AtomicU64,
    }

    impl Store for CountingStore
    {
        fn len(&self) -> io::Result<u64>
        {
            self.inner.len()
        }

        fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>
        {
            self.inner.read_at(offset, buf)
        }

        fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()>
        {
            self.inner.write_at(offset, data)
        }

        fn set_len(&self, len: u64) -> io::Result<()>
        {
            self.resizes.fetch_add(1, SeqCst);
            self.inner.set_len(len)
        }
    }

    #[test]
    fn free_adjacent_pair_empties_store()
    {
        let manager = manager();
        let a = manager.allocate(&Ticket::new(10)).unwrap();
        let b = manager.allocate(&Ticket::new(10)).unwrap();
        assert_eq!(a.end(), b.ptr().get());
        assert!(b.is_tail(manager.store()).unwrap());

        manager.free(&[a.ptr()]).unwrap();
        assert_eq!(manager.free_list_snapshot(), [a.ptr()]);

        // B merges with A, and the merged chunk is the tail.
        manager.free(&[b.ptr()]).unwrap();
        assert!(manager.free_list_snapshot().is_empty());
        assert_eq!(store_len(&manager), FIRST_CHUNK);
    }

    #[test]
    fn free_adjacent_pair_before_live_chunk_merges()
    {
        let manager = manager();
        let a = manager.allocate(&Ticket::new(10)).unwrap();
        let b = manager.allocate(&Ticket::new(10)).unwrap();
        let c = manager.allocate(&Ticket::new(10)).unwrap();

        manager.free(&[a.ptr()]).unwrap();
        manager.free(&[b.ptr()]).unwrap();

        assert_eq!(manager.free_list_snapshot(), [a.ptr()]);
        let merged = manager.read_chunk(a.ptr()).unwrap();
        assert!(merged.is_free());
        assert_eq!(merged.end(), c.ptr().get());
        assert_eq!(merged.extent(), a.extent() + b.extent());
    }

    #[test]
    fn free_cascades_into_both_neighbors()
    {
        let manager = manager();
        let chunks: Vec<Chunk> = (0 .. 4)
            .map(|_| manager.allocate(&Ticket::new(20)).unwrap())
            .collect();

        manager.free(&[chunks[0].ptr()]).unwrap();
        manager.free(&[chunks[2].ptr()]).unwrap();
        assert_eq!(manager.free_list_snapshot().len(), 2);

        // Freeing the chunk in between joins all three.
        manager.free(&[chunks[1].ptr()]).unwrap();
        assert_eq!(manager.free_list_snapshot(), [chunks[0].ptr()]);
        let merged = manager.read_chunk(chunks[0].ptr()).unwrap();
        assert_eq!(merged.end(), chunks[3].ptr().get());
    }

    #[test]
    fn freeing_nothing_is_a_no_op()
    {
        let manager = manager();
        manager.allocate(&Ticket::new(10)).unwrap();
        let before = manager.store().len().unwrap();
        manager.free(&[]).unwrap();
        assert_eq!(store_len(&manager), before);
        assert!(manager.free_list_snapshot().is_empty());
    }

    #[test]
    fn double_free_is_rejected()
    {
        let manager = manager();
        let a = manager.allocate(&Ticket::new(10)).unwrap();
        manager.allocate(&Ticket::new(10)).unwrap();
        manager.free(&[a.ptr()]).unwrap();
        let err = manager.free(&[a.ptr()]).unwrap_err();
        assert!(matches!(err, Error::AlreadyFree(ptr) if ptr == a.ptr()));
    }

    #[test]
    fn zero_byte_ticket_leaves_free_list_alone()
    {
        let manager = manager();
        let a = manager.allocate(&Ticket::new(50)).unwrap();
        manager.allocate(&Ticket::new(10)).unwrap();
        manager.free(&[a.ptr()]).unwrap();

        let before = manager.free_list_snapshot();
        let free = manager.read_chunk(a.ptr()).unwrap();
        let chunk = manager.allocate(&Ticket::new(0)).unwrap();

        assert_eq!(chunk.capacity(), 0);
        assert_eq!(manager.free_list_snapshot(), before);
        assert_eq!(manager.read_chunk(a.ptr()).unwrap(), free);
    }

    #[test]
    fn reuse_carves_from_the_end()
    {
        let manager = manager();
        let a = manager.allocate(&Ticket::new(200)).unwrap();
        manager.allocate(&Ticket::new(10)).unwrap();
        manager.free(&[a.ptr()]).unwrap();

        let ticket = Ticket::new(50).link_width(Width::U16);
        let chunk = manager.allocate(&ticket).unwrap();
        let remainder = manager.read_chunk(a.ptr()).unwrap();

        assert_eq!(chunk.capacity(), 50);
        assert_eq!(chunk.end(), a.end());
        assert!(remainder.is_free());
        assert_eq!(remainder.end(), chunk.ptr().get());
        assert_eq!(manager.free_list_snapshot(), [a.ptr()]);
    }

    #[test]
    fn reuse_consumes_small_leftovers()
    {
        let manager = manager();
        let a = manager.allocate(&Ticket::new(20).link_width(Width::U8))
            .unwrap();
        manager.allocate(&Ticket::new(10)).unwrap();
        manager.free(&[a.ptr()]).unwrap();

        // Leaves fewer than MIN_FREE_EXTENT bytes, so the chunk is taken whole.
        let bytes = 20 - (MIN_FREE_EXTENT - 1);
        let chunk = manager.allocate(&Ticket::new(bytes).link_width(Width::U8))
            .unwrap();
        assert_eq!(chunk.ptr(), a.ptr());
        assert_eq!(chunk.extent(), a.extent());
        assert!(chunk.capacity() >= bytes);
        assert!(manager.free_list_snapshot().is_empty());
    }

    #[test]
    fn magnet_picks_nearby_free_chunk()
    {
        let manager = manager();
        let chunks: Vec<Chunk> = (0 .. 6)
            .map(|_| {
                let ticket = Ticket::new(40).link_width(Width::U16);
                manager.allocate(&ticket).unwrap()
            })
            .collect();
        manager.free(&[chunks[0].ptr(), chunks[4].ptr()]).unwrap();

        let near = Ticket::new(40).link_width(Width::U16)
            .magnet(chunks[5].ptr());
        let chunk = manager.allocate(&near).unwrap();
        assert_eq!(chunk.ptr(), chunks[4].ptr());

        let anywhere = Ticket::new(40).link_width(Width::U16);
        let chunk = manager.allocate(&anywhere).unwrap();
        assert_eq!(chunk.ptr(), chunks[0].ptr());
    }

    #[test]
    fn approval_can_veto_reuse()
    {
        let manager = manager();
        let a = manager.allocate(&Ticket::new(40)).unwrap();
        manager.allocate(&Ticket::new(10)).unwrap();
        manager.free(&[a.ptr()]).unwrap();

        let end = store_len(&manager);
        let ticket = Ticket::new(10).approve(move |c| c.ptr().get() >= end);
        let chunk = manager.allocate(&ticket).unwrap();
        assert_eq!(chunk.ptr().get(), end);
        assert_eq!(manager.free_list_snapshot(), [a.ptr()]);
    }

    #[test]
    fn defragment_mode_disables_reuse()
    {
        let manager = manager();
        let a = manager.allocate(&Ticket::new(40)).unwrap();
        manager.allocate(&Ticket::new(10)).unwrap();
        manager.free(&[a.ptr()]).unwrap();

        let end = store_len(&manager);
        let chunk = manager.with_defragment_mode(|| {
            assert!(manager.is_defragmenting());
            manager.allocate(&Ticket::new(10)).unwrap()
        });
        assert!(!manager.is_defragmenting());
        assert_eq!(chunk.ptr().get(), end);
    }

    #[test]
    fn max_store_size_exhausts()
    {
        let config = Config{max_store_size: Some(100), ..Config::default()};
        let manager = manager_with(config);
        let err = manager.allocate(&Ticket::new(200)).unwrap_err();
        assert!(matches!(err, Error::OutOfSpace{requested: 200}));
        assert_eq!(manager.try_allocate(&Ticket::new(200)).unwrap(), None);
        assert_eq!(store_len(&manager), FIRST_CHUNK);
    }

    #[test]
    fn growing_tail_resizes_store_once()
    {
        let store = Arc::new(CountingStore{
            inner: MemoryStore::new(),
            resizes: AtomicU64::new(0),
        });
        let manager = ChunkManager::create(store.clone(), Config::default())
            .unwrap();
        let head = manager.allocate(&Ticket::new(10)).unwrap();
        let resizes = store.resizes.load(SeqCst);

        let room = head.max_capacity() - head.capacity();
        let gained = manager.grow(head.ptr(), head.ptr(), room).unwrap();

        assert_eq!(gained, room);
        assert_eq!(store.resizes.load(SeqCst), resizes + 1);
        let head = manager.read_chunk(head.ptr()).unwrap();
        assert_eq!(head.capacity(), head.max_capacity());
        assert!(head.is_tail(manager.store()).unwrap());
    }

    #[test]
    fn growing_links_new_chunk()
    {
        let manager = manager();
        let head = manager.allocate(&Ticket::new(8).link_width(Width::U16))
            .unwrap();
        let blocker = manager.allocate(&Ticket::new(8)).unwrap();

        let gained = manager.grow(head.ptr(), head.ptr(), 100).unwrap();
        assert!(gained >= 100);

        let grown = manager.read_chunk(head.ptr()).unwrap();
        assert_eq!(grown.capacity(), head.capacity());
        let link = grown.link().unwrap();
        assert!(link.get() >= blocker.end());
        assert!(manager.read_chunk(link).unwrap().capacity() >= 100);
    }

    #[test]
    fn growing_absorbs_following_free_chunk()
    {
        let manager = manager();
        let head = manager.allocate(&Ticket::new(10)).unwrap();
        let next = manager.allocate(&Ticket::new(100)).unwrap();
        manager.allocate(&Ticket::new(10)).unwrap();
        manager.free(&[next.ptr()]).unwrap();

        let gained = manager.grow(head.ptr(), head.ptr(), 30).unwrap();
        assert_eq!(gained, 30);

        let grown = manager.read_chunk(head.ptr()).unwrap();
        assert_eq!(grown.capacity(), 40);
        let remainder = manager.free_list_snapshot();
        assert_eq!(remainder, [ChunkPtr::new(grown.end()).unwrap()]);
    }

    #[test]
    fn growing_void_link_still_succeeds()
    {
        let manager = manager();
        let ticket = Ticket::new(20).link_width(Width::Void);
        let head = manager.allocate(&ticket).unwrap();
        manager.allocate(&Ticket::new(8)).unwrap();

        // Leave room for the wider header.
        let mut chunk = manager.read_chunk(head.ptr()).unwrap();
        chunk.set_size(manager.store(), 5).unwrap();

        let gained = manager.grow(head.ptr(), head.ptr(), 64).unwrap();
        assert!(gained >= 64);

        let grown = manager.read_chunk(head.ptr()).unwrap();
        assert_ne!(grown.link_width(), Width::Void);
        assert!(grown.link().is_some());
        assert_eq!(grown.size(), 5);
    }

    #[test]
    fn growing_full_void_link_chunk_splits_it()
    {
        let manager = manager();
        let ticket = Ticket::new(20).link_width(Width::Void);
        let head = manager.allocate(&ticket).unwrap();
        manager.allocate(&Ticket::new(8)).unwrap();

        let chain = Chain::new(&manager, head.ptr());
        let data: Vec<u8> = (0 .. 20).collect();
        chain.write_at(0, &data).unwrap();
        chain.write_at(20, b"more").unwrap();

        let mut expected = data;
        expected.extend_from_slice(b"more");
        assert_eq!(chain.read_all().unwrap(), expected);

        let grown = manager.read_chunk(head.ptr()).unwrap();
        assert_ne!(grown.link_width(), Width::Void);
        assert!(grown.link().is_some());
        assert_eq!(grown.extent(), head.extent());
        assert!(grown.capacity() < head.capacity());
    }

    #[test]
    fn growing_full_chunk_with_narrow_link_splits_it()
    {
        let manager = manager();
        let head = manager.allocate(&Ticket::new(16).link_width(Width::U8))
            .unwrap();
        manager.allocate(&Ticket::new(300)).unwrap();
        assert!(!Width::U8.fits(store_len(&manager)));

        let chain = Chain::new(&manager, head.ptr());
        chain.write_at(0, &[9; 16]).unwrap();
        let gained = manager.grow(head.ptr(), head.ptr(), 64).unwrap();
        assert!(gained >= 64);

        let grown = manager.read_chunk(head.ptr()).unwrap();
        assert!(grown.link_width() > Width::U8);
        assert!(grown.link().unwrap().get() > 255);
        assert_eq!(chain.read_all().unwrap(), [9; 16]);
        assert!(chain.capacity().unwrap() >= 16 + 64);
    }

    #[test]
    fn growing_does_not_move_data_under_readers()
    {
        let manager = manager();
        let head = manager.allocate(&Ticket::new(16).link_width(Width::U16))
            .unwrap();
        let tail = manager.allocate(&Ticket::new(16).link_width(Width::Void))
            .unwrap();
        let mut linked = head.clone();
        linked.set_link(manager.store(), Some(tail.ptr())).unwrap();
        manager.allocate(&Ticket::new(8)).unwrap();

        let chain = Chain::new(&manager, head.ptr());
        chain.write_at(0, &[5; 32]).unwrap();
        let before = store_len(&manager);

        let barrier = Barrier::new(2);
        let result = thread::scope(|s| {
            s.spawn(|| {
                manager.with_chain_io(head.ptr(), || {
                    barrier.wait();
                    barrier.wait();
                });
            });

            barrier.wait();
            let result = manager.grow(head.ptr(), tail.ptr(), 10);
            barrier.wait();
            result
        });

        // Every strategy left would have to move the chain's bytes.
        assert!(matches!(result, Err(Error::OutOfSpace{requested: 10})));
        let link = manager.read_chunk(head.ptr()).unwrap().link();
        assert_eq!(link, Some(tail.ptr()));
        let unchanged = manager.read_chunk(tail.ptr()).unwrap();
        assert_eq!(unchanged.link_width(), Width::Void);
        assert_eq!(unchanged.extent(), tail.extent());
        assert_eq!(chain.read_all().unwrap(), [5; 32]);
        assert_eq!(store_len(&manager), before);
        assert!(manager.free_list_snapshot().is_empty());
    }

    #[test]
    fn growing_moves_trailing_members()
    {
        let manager = manager();
        let head = manager.allocate(&Ticket::new(16).link_width(Width::U16))
            .unwrap();
        let tail = manager.allocate(&Ticket::new(16).link_width(Width::Void))
            .unwrap();
        let mut linked = head.clone();
        linked.set_link(manager.store(), Some(tail.ptr())).unwrap();
        manager.allocate(&Ticket::new(8)).unwrap();

        let chain = Chain::new(&manager, head.ptr());
        chain.write_at(0, &[7; 32]).unwrap();

        // The tail can neither link nor grow, so it is moved.
        let gained = manager.grow(head.ptr(), tail.ptr(), 10).unwrap();
        assert!(gained >= 10);

        let link = manager.read_chunk(head.ptr()).unwrap().link().unwrap();
        assert_ne!(link, tail.ptr());
        assert_eq!(chain.read_all().unwrap(), [7; 32]);
        assert!(chain.capacity().unwrap() >= 42);
    }

    #[test]
    fn free_while_reading_fails()
    {
        let manager = manager();
        let head = manager.allocate(&Ticket::new(64)).unwrap();
        let chain = Chain::new(&manager, head.ptr());
        chain.write_at(0, b"still here").unwrap();

        let barrier = Barrier::new(2);
        thread::scope(|s| {
            s.spawn(|| {
                manager.with_chain_io(head.ptr(), || {
                    barrier.wait();
                    barrier.wait();
                    assert_eq!(chain.read_all().unwrap(), b"still here");
                });
            });

            barrier.wait();
            let err = manager.free(&[head.ptr()]).unwrap_err();
            assert!(matches!(err, Error::UseWhileFreeing(ptr) if ptr == head.ptr()));
            barrier.wait();
        });

        assert_eq!(chain.read_all().unwrap(), b"still here");
        assert!(!manager.read_chunk(head.ptr()).unwrap().is_free());
    }

    #[test]
    fn concurrent_frees_all_land()
    {
        let manager = manager();
        let chunks: Vec<Chunk> = (0 .. 64)
            .map(|_| manager.allocate(&Ticket::new(24)).unwrap())
            .collect();
        let keep = manager.allocate(&Ticket::new(1)).unwrap();

        thread::scope(|s| {
            for part in chunks.chunks(16) {
                let manager = &manager;
                s.spawn(move || {
                    for chunk in part {
                        manager.free(&[chunk.ptr()]).unwrap();
                    }
                });
            }
        });

        assert_eq!(manager.free_list_snapshot(), [chunks[0].ptr()]);
        let merged = manager.read_chunk(chunks[0].ptr()).unwrap();
        assert_eq!(merged.end(), keep.ptr().get());
    }

    #[test]
    fn tail_chunk_is_moved_out_of_the_way()
    {
        let manager = manager();
        let head = manager.allocate(&Ticket::new(16).link_width(Width::U16))
            .unwrap();
        let hole = manager.allocate(&Ticket::new(200)).unwrap();
        let tail = manager.allocate(&Ticket::new(16)).unwrap();
        let mut linked = head.clone();
        linked.set_link(manager.store(), Some(tail.ptr())).unwrap();

        let chain = Chain::new(&manager, head.ptr());
        chain.write_at(0, &[3; 24]).unwrap();

        manager.free(&[hole.ptr()]).unwrap();

        // The tail moved into the hole and the store shrank.
        let link = manager.read_chunk(head.ptr()).unwrap().link().unwrap();
        assert!(link < tail.ptr());
        assert!(store_len(&manager) < tail.ptr().get());
        assert_eq!(chain.read_all().unwrap(), [3; 24]);
    }

    #[test]
    fn tail_relocation_can_be_disabled()
    {
        let config = Config{relocate_tail: false, ..Config::default()};
        let manager = manager_with(config);
        let head = manager.allocate(&Ticket::new(16).link_width(Width::U16))
            .unwrap();
        let hole = manager.allocate(&Ticket::new(200)).unwrap();
        let tail = manager.allocate(&Ticket::new(16)).unwrap();
        let mut linked = head.clone();
        linked.set_link(manager.store(), Some(tail.ptr())).unwrap();

        manager.free(&[hole.ptr()]).unwrap();

        let link = manager.read_chunk(head.ptr()).unwrap().link();
        assert_eq!(link, Some(tail.ptr()));
        assert_eq!(manager.free_list_snapshot(), [hole.ptr()]);
    }

    #[test]
    fn tail_relocation_is_skipped_during_chain_io()
    {
        let manager = manager();
        let head = manager.allocate(&Ticket::new(16).link_width(Width::U16))
            .unwrap();
        let hole = manager.allocate(&Ticket::new(200)).unwrap();
        let tail = manager.allocate(&Ticket::new(16)).unwrap();
        let mut linked = head.clone();
        linked.set_link(manager.store(), Some(tail.ptr())).unwrap();

        let chain = Chain::new(&manager, head.ptr());
        chain.write_at(0, &[3; 24]).unwrap();

        let barrier = Barrier::new(2);
        thread::scope(|s| {
            s.spawn(|| {
                manager.with_chain_io(head.ptr(), || {
                    barrier.wait();
                    barrier.wait();
                });
            });

            barrier.wait();
            let freed = manager.free(&[hole.ptr()]);
            barrier.wait();
            freed.unwrap();
        });

        let link = manager.read_chunk(head.ptr()).unwrap().link();
        assert_eq!(link, Some(tail.ptr()));
        assert_eq!(store_len(&manager), tail.end());
        assert_eq!(manager.free_list_snapshot(), [hole.ptr()]);
        assert_eq!(chain.read_all().unwrap(), [3; 24]);
    }

    #[test]
    fn queued_free_waits_while_chain_is_in_use()
    {
        let manager = manager();
        let a = manager.allocate(&Ticket::new(10)).unwrap();
        manager.allocate(&Ticket::new(10)).unwrap();

        // Holding the lock makes the free queue up.
        let guard = manager.free_list.lock();
        thread::scope(|s| {
            s.spawn(|| manager.free(&[a.ptr()]).unwrap());
        });
        manager.activity.enter(a.ptr());
        drop(guard);

        manager.drain_pending();
        assert!(!manager.read_chunk(a.ptr()).unwrap().is_free());
        assert!(manager.free_list_snapshot().is_empty());

        // The next operation after the chain is left performs the free.
        manager.activity.leave(a.ptr());
        manager.allocate(&Ticket::new(1)).unwrap();
        assert!(manager.read_chunk(a.ptr()).unwrap().is_free());
        assert_eq!(manager.free_list_snapshot(), [a.ptr()]);
    }

    #[test]
    fn full_purge_zeroes_freed_bodies()
    {
        let config = Config{purge: PurgeMode::Full, ..Config::default()};
        let manager = manager_with(config);
        let a = manager.allocate(&Ticket::new(32)).unwrap();
        manager.allocate(&Ticket::new(8)).unwrap();
        manager.store().write_at(a.body_start(), &[0xAA; 32]).unwrap();

        manager.free(&[a.ptr()]).unwrap();

        let free = manager.read_chunk(a.ptr()).unwrap();
        let mut body = vec![1; free.capacity() as usize];
        manager.store().read_at(free.body_start(), &mut body).unwrap();
        assert!(body.iter().all(|b| *b == 0));
    }

    #[test]
    fn reopen_rebuilds_free_list()
    {
        let path = std::env::temp_dir()
            .join(format!("tessera-reopen-{}", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let (free, kept) = {
            let store = Arc::new(FileStore::create(&path).unwrap());
            let manager = ChunkManager::create(store, Config::default())
                .unwrap();
            let a = manager.allocate(&Ticket::new(30)).unwrap();
            let b = manager.allocate(&Ticket::new(30)).unwrap();
            manager.free(&[a.ptr()]).unwrap();
            manager.store().flush().unwrap();
            (a.ptr(), b)
        };

        let store = Arc::new(FileStore::open(&path).unwrap());
        let manager = ChunkManager::open(store, Config::default()).unwrap();
        assert_eq!(manager.free_list_snapshot(), [free]);
        assert_eq!(manager.read_chunk(kept.ptr()).unwrap(), kept);
        manager.check_consistency().unwrap();

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn open_rejects_unformatted_store()
    {
        let store = Arc::new(MemoryStore::new());
        store.write_at(0, b"garbage!").unwrap();
        assert!(matches!(
            ChunkManager::open(store, Config::default()),
            Err(Error::Io(_)),
        ));
    }

    /// Step of a randomized allocator workout.
    #[derive(Clone, Debug)]
    enum Action
    {
        Allocate(u64),
        Free(usize),
        Grow(usize, u64),
    }

    fn action() -> impl p::strategy::Strategy<Value = Action>
    {
        use p::prelude::*;
        prop_oneof![
            (1u64 .. 300).prop_map(Action::Allocate),
            any::<usize>().prop_map(Action::Free),
            (any::<usize>(), 1u64 .. 300)
                .prop_map(|(i, bytes)| Action::Grow(i, bytes)),
        ]
    }

    proptest!
    {
        #[test]
        fn random_workout_stays_consistent(
            actions in p::collection::vec(action(), 1 .. 60),
        )
        {
            let manager = manager();
            let mut heads: Vec<ChunkPtr> = Vec::new();

            for action in actions {
                match action {
                    Action::Allocate(bytes) => {
                        let chunk = manager.allocate(&Ticket::new(bytes))
                            .unwrap();
                        heads.push(chunk.ptr());
                    },
                    Action::Free(i) if !heads.is_empty() => {
                        let head = heads.swap_remove(i % heads.len());
                        manager.free_chain(head).unwrap();
                    },
                    Action::Grow(i, bytes) if !heads.is_empty() => {
                        let head = heads[i % heads.len()];
                        let last = manager.chain(head)
                            .last().unwrap().unwrap().ptr();
                        let gained = manager.grow(head, last, bytes).unwrap();
                        assert!(gained >= bytes);
                    },
                    _ => { },
                }
                manager.check_consistency().unwrap();
            }

            for head in heads {
                manager.free_chain(head).unwrap();
            }
            assert!(manager.free_list_snapshot().is_empty());
            assert_eq!(store_len(&manager), FIRST_CHUNK);
        }

        #[test]
        fn any_free_order_fully_merges(
            sizes in p::collection::vec(1u64 .. 100, 2 .. 24),
            order in p::collection::vec(any_index(), 24),
        )
        {
            let manager = manager();
            let mut chunks: Vec<ChunkPtr> = sizes.iter()
                .map(|&bytes| manager.allocate(&Ticket::new(bytes)).unwrap().ptr())
                .collect();
            let keep = manager.allocate(&Ticket::new(1)).unwrap();
            let first = chunks[0];

            for index in order {
                if chunks.is_empty() {
                    break;
                }
                let ptr = chunks.swap_remove(index % chunks.len());
                manager.free(&[ptr]).unwrap();
            }
            manager.free(&chunks).unwrap();

            assert_eq!(manager.free_list_snapshot(), [first]);
            let merged = manager.read_chunk(first).unwrap();
            assert_eq!(merged.end(), keep.ptr().get());
        }
    }

    fn any_index() -> impl p::strategy::Strategy<Value = usize>
    {
        p::prelude::any::<usize>()
    }
}
