//! Structural checks of a store and its free list.
//!
//! The allocator runs these after every operation
//! in debug builds and when the `verify` feature is enabled.

use {
    crate::{
        Result,
        chunk::{Chunk, ChunkPtr},
        free_list::FreeList,
        store::{FIRST_CHUNK, Store},
    },
    std::collections::HashSet,
    thiserror::Error,
};

/// A violated structural invariant.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum Inconsistency
{
    #[error("Free chunk {0} is missing from the free list")]
    Unlisted(ChunkPtr),

    #[error("Free list entry {0} is not a free chunk")]
    ListedLive(ChunkPtr),

    #[error("Free list is not sorted at index {0}")]
    Unsorted(usize),

    #[error("Free chunks {0} and {1} are adjacent")]
    Adjacent(ChunkPtr, ChunkPtr),

    #[error("Free chunk {0} is at the end of the store")]
    FreeTail(ChunkPtr),

    #[error("Chunk {ptr} links to {link}, which is not a live chunk")]
    DanglingLink{ptr: ChunkPtr, link: ChunkPtr},
}

/// Whether the allocator checks invariants after each operation.
pub fn enabled() -> bool
{
    cfg!(any(debug_assertions, feature = "verify"))
}

/// Check that the chunks tile the store and agree with the free list.
///
/// Reading the chunks in order from [`FIRST_CHUNK`]
/// must end exactly at the end of the store,
/// which means no chunk overlaps the next.
pub fn check_store(store: &dyn Store, free_list: &dyn FreeList) -> Result<()>
{
    let store_len = store.len()?;
    let mut live = HashSet::new();
    let mut links = Vec::new();
    let mut free = Vec::new();
    let mut previous_free: Option<Chunk> = None;

    let mut offset = FIRST_CHUNK;
    while offset < store_len {
        let ptr = ChunkPtr::new(offset).expect("Chunks start past the magic");
        let chunk = Chunk::read(store, ptr)?;

        if chunk.is_free() {
            if let Some(previous) = &previous_free {
                if previous.end() == offset {
                    return Err(Inconsistency::Adjacent(previous.ptr(), ptr).into());
                }
            }
            free.push(ptr);
            previous_free = Some(chunk.clone());
        } else {
            live.insert(ptr);
            if let Some(link) = chunk.link() {
                links.push((ptr, link));
            }
        }

        if chunk.is_free() && chunk.end() == store_len {
            return Err(Inconsistency::FreeTail(ptr).into());
        }
        offset = chunk.end();
    }

    for (ptr, link) in links {
        if !live.contains(&link) {
            return Err(Inconsistency::DanglingLink{ptr, link}.into());
        }
    }

    for index in 1 .. free_list.len() {
        if free_list.get(index - 1) >= free_list.get(index) {
            return Err(Inconsistency::Unsorted(index).into());
        }
    }

    let listed: HashSet<ChunkPtr> = free_list.to_vec().into_iter().collect();
    if let Some(ptr) = free.iter().find(|ptr| !listed.contains(ptr)) {
        return Err(Inconsistency::Unlisted(*ptr).into());
    }
    let free: HashSet<ChunkPtr> = free.into_iter().collect();
    if let Some(ptr) = listed.iter().find(|ptr| !free.contains(ptr)) {
        return Err(Inconsistency::ListedLive(*ptr).into());
    }

    Ok(())
}
