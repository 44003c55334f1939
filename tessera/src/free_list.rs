//! Address-ordered lists of free chunks.

use crate::chunk::ChunkPtr;

/// Sequence of free chunk pointers, sorted by address.
///
/// The allocator keeps the list sorted and ensures
/// that no two entries describe physically adjacent chunks.
/// Implementations need only provide indexed access.
pub trait FreeList: Send
{
    /// The number of entries.
    fn len(&self) -> usize;

    /// The entry at `index`.
    ///
    /// Panics if `index` is out of bounds.
    fn get(&self, index: usize) -> ChunkPtr;

    /// Replace the entry at `index`.
    fn set(&mut self, index: usize, ptr: ChunkPtr);

    /// Insert an entry before `index`.
    fn insert(&mut self, index: usize, ptr: ChunkPtr);

    /// Remove and return the entry at `index`.
    fn remove(&mut self, index: usize) -> ChunkPtr;

    /// Whether the list has no entries.
    fn is_empty(&self) -> bool
    {
        self.len() == 0
    }

    /// The last entry, which has the highest address.
    fn last(&self) -> Option<ChunkPtr>
    {
        self.len().checked_sub(1).map(|index| self.get(index))
    }

    /// The index of the entry whose address is closest to `offset`.
    fn find_closest(&self, offset: u64) -> Option<usize>
    {
        if self.is_empty() {
            return None;
        }
        let index = wedge(self, offset);
        if index == self.len() {
            return Some(index - 1);
        }
        if index == 0 {
            return Some(0);
        }
        let below = offset - self.get(index - 1).get();
        let above = self.get(index).get() - offset;
        Some(if below <= above { index - 1 } else { index })
    }

    /// Copy the entries into a vector.
    fn to_vec(&self) -> Vec<ChunkPtr>
    {
        (0 .. self.len()).map(|index| self.get(index)).collect()
    }
}

/// Find where an entry for `offset` belongs.
///
/// Returns the index of the first entry whose address is not below `offset`.
/// If `offset` is in the list, that is its index;
/// otherwise it is the index at which it must be inserted.
/// Each probe also compares against its successor,
/// which ends the search early when the offset falls between the two.
pub fn wedge<L>(list: &L, offset: u64) -> usize
    where L: FreeList + ?Sized
{
    let mut low = 0;
    let mut high = list.len();
    while low < high {
        let mid = low + (high - low) / 2;
        let at_mid = list.get(mid).get();
        if at_mid >= offset {
            high = mid;
            continue;
        }
        if mid + 1 < list.len() && list.get(mid + 1).get() >= offset {
            return mid + 1;
        }
        low = mid + 1;
    }
    low
}

/// The index of `ptr` in the list, if present.
pub fn find_exact<L>(list: &L, ptr: ChunkPtr) -> Option<usize>
    where L: FreeList + ?Sized
{
    let index = wedge(list, ptr.get());
    (index < list.len() && list.get(index) == ptr).then_some(index)
}

/// Free list kept entirely in memory.
#[derive(Clone, Debug, Default)]
pub struct VecFreeList
{
    entries: Vec<ChunkPtr>,
}

impl VecFreeList
{
    /// Create an empty free list.
    pub fn new() -> Self
    {
        Self{entries: Vec::new()}
    }

    /// Create a free list from entries in any order.
    pub fn from_unsorted(mut entries: Vec<ChunkPtr>) -> Self
    {
        entries.sort_unstable();
        entries.dedup();
        Self{entries}
    }
}

impl FreeList for VecFreeList
{
    fn len(&self) -> usize
    {
        self.entries.len()
    }

    fn get(&self, index: usize) -> ChunkPtr
    {
        self.entries[index]
    }

    fn set(&mut self, index: usize, ptr: ChunkPtr)
    {
        self.entries[index] = ptr;
    }

    fn insert(&mut self, index: usize, ptr: ChunkPtr)
    {
        self.entries.insert(index, ptr);
    }

    fn remove(&mut self, index: usize) -> ChunkPtr
    {
        self.entries.remove(index)
    }
}

/// Visits free list indices outward from a starting point.
///
/// The starting entry comes first,
/// followed by its neighbors before and after it, alternating,
/// further and further away.
/// Once one side runs out, the other side continues alone.
/// Without a starting point, indices are visited in ascending order.
pub struct MagnetIter
{
    len: usize,
    start: usize,
    below: usize,
    above: usize,
    prefer_below: bool,
}

impl MagnetIter
{
    /// Visit the indices of a list of `len` entries, starting at `start`.
    pub fn new(len: usize, start: Option<usize>) -> Self
    {
        let start = start.unwrap_or(0).min(len);
        Self{len, start, below: start, above: start, prefer_below: false}
    }
}

impl Iterator for MagnetIter
{
    type Item = usize;

    fn next(&mut self) -> Option<usize>
    {
        if self.above == self.start && self.above < self.len {
            self.above += 1;
            return Some(self.start);
        }

        let has_below = self.below > 0;
        let has_above = self.above < self.len;
        let take_below = match (has_below, has_above) {
            (false, false) => return None,
            (true, false)  => true,
            (false, true)  => false,
            (true, true)   => self.prefer_below,
        };

        // The side after the start goes second, so alternate from below.
        self.prefer_below = !take_below;
        if take_below {
            self.below -= 1;
            Some(self.below)
        } else {
            self.above += 1;
            Some(self.above - 1)
        }
    }
}
