//! Tracking which chains threads are reading and writing.
//!
//! Each thread that performs I/O on a chain pushes the chain head
//! onto its own stack for the duration of the I/O.
//! Freeing a chunk that is on any stack is refused,
//! and moving chunks around waits until all stacks are empty.
//!
//! Each thread's stack is only ever pushed and popped by that thread,
//! so its lock is uncontended except while a snapshot is being taken.
//! The shared registry lock is taken once per thread, to register it.

use {
    crate::chunk::ChunkPtr,
    log::warn,
    parking_lot::Mutex,
    scope_exit::{ScopeExit, scope_exit},
    smallvec::SmallVec,
    std::{
        cell::RefCell,
        collections::HashMap,
        hint,
        sync::{
            Arc,
            Weak,
            atomic::{AtomicBool, AtomicU64, Ordering::SeqCst, fence},
        },
        thread::{self, ThreadId},
        time::{Duration, Instant},
    },
};

/// Source of tracker identifiers.
static NEXT_TRACKER_ID: AtomicU64 = AtomicU64::new(0);

thread_local!
{
    /// The worker of this thread for each live tracker.
    ///
    /// The weak reference tells whether the tracker still exists,
    /// so that entries for dropped trackers can be pruned.
    static WORKERS: RefCell<SmallVec<[(u64, Weak<()>, Arc<Worker>); 2]>> =
        RefCell::new(SmallVec::new());
}

/// Chain heads a single thread is currently doing I/O on.
#[derive(Default)]
struct Worker
{
    chains: Mutex<SmallVec<[ChunkPtr; 4]>>,
}

/// Registry of per-thread chain activity.
pub struct ActivityTracker
{
    /// Distinguishes trackers in the thread-local worker table.
    id: u64,

    /// Alive for as long as the tracker is.
    alive: Arc<()>,

    /// Workers of all threads that have used this tracker.
    ///
    /// A worker is owned by its thread,
    /// so it disappears from here when the thread exits.
    workers: Mutex<HashMap<ThreadId, Weak<Worker>>>,

    /// Set while a thread waits for chain I/O to stop.
    draining: AtomicBool,

    /// The thread that set [`draining`][`Self::draining`].
    drainer: Mutex<Option<ThreadId>>,
}

impl ActivityTracker
{
    /// Create a tracker with no activity.
    pub fn new() -> Self
    {
        Self{
            id: NEXT_TRACKER_ID.fetch_add(1, SeqCst),
            alive: Arc::new(()),
            workers: Mutex::new(HashMap::new()),
            draining: AtomicBool::new(false),
            drainer: Mutex::new(None),
        }
    }

    /// The worker of the calling thread, registering it if needed.
    fn worker(&self) -> Arc<Worker>
    {
        WORKERS.with(|workers| {
            let mut workers = workers.borrow_mut();
            workers.retain(|(_, alive, _)| alive.strong_count() > 0);

            if let Some((_, _, worker)) =
                workers.iter().find(|(id, _, _)| *id == self.id)
            {
                return worker.clone();
            }

            let worker = Arc::new(Worker::default());
            let mut registry = self.workers.lock();
            registry.retain(|_, worker| worker.strong_count() > 0);
            registry.insert(thread::current().id(), Arc::downgrade(&worker));
            drop(registry);

            workers.push((self.id, Arc::downgrade(&self.alive), worker.clone()));
            worker
        })
    }

    /// Whether the calling thread is the one draining.
    fn is_drainer(&self) -> bool
    {
        *self.drainer.lock() == Some(thread::current().id())
    }

    /// Record that the calling thread starts I/O on the chain at `head`.
    ///
    /// While another thread is draining, this waits for it to finish.
    /// Every call must be paired with a call to [`leave`][`Self::leave`].
    pub fn enter(&self, head: ChunkPtr)
    {
        let worker = self.worker();
        let mut backoff = Backoff::new();
        loop {
            worker.chains.lock().push(head);
            let undo = ScopeExit::new(|| { worker.chains.lock().pop(); });

            // Pairs with the fence in with_drain: either the drainer
            // sees our push, or we see its flag.
            fence(SeqCst);
            if !self.draining.load(SeqCst) || self.is_drainer() {
                undo.dismiss();
                return;
            }

            drop(undo);
            backoff.snooze();
        }
    }

    /// Record that the calling thread finished I/O on the chain at `head`.
    pub fn leave(&self, head: ChunkPtr)
    {
        let worker = self.worker();
        let mut chains = worker.chains.lock();
        let index = chains.iter().rposition(|ptr| *ptr == head)
            .expect("Leaving a chain that was never entered");
        chains.remove(index);
    }

    /// Whether any thread is doing I/O on the chain at `head`.
    pub fn is_active(&self, head: ChunkPtr) -> bool
    {
        self.any_worker(|_, chains| chains.contains(&head))
    }

    /// Whether any thread other than the caller is doing chain I/O.
    fn others_busy(&self) -> bool
    {
        let me = thread::current().id();
        self.any_worker(|id, chains| id != me && !chains.is_empty())
    }

    fn any_worker<F>(&self, mut f: F) -> bool
        where F: FnMut(ThreadId, &[ChunkPtr]) -> bool
    {
        let snapshot: Vec<(ThreadId, Arc<Worker>)> =
            self.workers.lock().iter()
            .filter_map(|(id, worker)| Some((*id, worker.upgrade()?)))
            .collect();
        snapshot.iter().any(|(id, worker)| f(*id, &worker.chains.lock()))
    }

    /// Call `f` once no other thread is doing chain I/O.
    ///
    /// New chain I/O on other threads is held back until `f` returns.
    /// The calling thread's own chain I/O does not count.
    /// A thread that is already draining calls `f` right away.
    /// Returns [`None`] without calling `f`
    /// if another thread is already draining,
    /// or if chain I/O did not stop within `timeout`.
    pub fn with_drain<F, R>(&self, timeout: Duration, f: F) -> Option<R>
        where F: FnOnce() -> R
    {
        if self.is_drainer() {
            return Some(f());
        }
        if self.draining.compare_exchange(false, true, SeqCst, SeqCst).is_err() {
            return None;
        }
        *self.drainer.lock() = Some(thread::current().id());

        scope_exit! {
            *self.drainer.lock() = None;
            self.draining.store(false, SeqCst);
        }

        fence(SeqCst);
        let deadline = Instant::now() + timeout;
        let mut backoff = Backoff::new();
        while self.others_busy() {
            if Instant::now() >= deadline {
                warn!("Chain I/O did not stop within {timeout:?}");
                return None;
            }
            backoff.snooze();
        }

        Some(f())
    }
}

impl Default for ActivityTracker
{
    fn default() -> Self
    {
        Self::new()
    }
}

/// Exponential backoff for busy waiting.
///
/// Spins at first, then yields, then sleeps.
struct Backoff
{
    step: u32,
}

impl Backoff
{
    fn new() -> Self
    {
        Self{step: 0}
    }

    fn snooze(&mut self)
    {
        if self.step < 6 {
            for _ in 0 .. 1 << self.step {
                hint::spin_loop();
            }
        } else if self.step < 10 {
            thread::yield_now();
        } else {
            thread::sleep(Duration::from_micros(50));
        }
        self.step = self.step.saturating_add(1);
    }
}
