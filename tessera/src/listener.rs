use crate::chunk::{Chunk, ChunkPtr};

/// Receives notifications about chunks appearing and disappearing.
///
/// Layers above the allocator cache decoded chunks.
/// They must drop a cached chunk when it is freed, merged away, or moved,
/// and may want to learn about new chunks as they are created.
/// The manager calls these methods while holding the free list lock,
/// so implementations must not call back into the manager.
pub trait ChunkListener: Send + Sync
{
    /// A chunk was allocated.
    fn notify_created(&self, _chunk: &Chunk)
    {
    }

    /// A chunk was freed, merged into another, or moved elsewhere.
    fn notify_destroyed(&self, _ptr: ChunkPtr)
    {
    }
}

/// Listener that ignores all notifications.
pub struct NoopListener;

impl ChunkListener for NoopListener
{
}
