//! Allocation and growth strategies.
//!
//! Strategies are tried in order until one makes progress.
//! Fresh allocation strategies produce a new chunk, or nothing.
//! Growth strategies add capacity to a chain,
//! and return how many bytes they added; zero means no progress.

use {
    crate::{
        Error,
        Result,
        chain::ChainIter,
        chunk::{Chunk, ChunkPtr, MIN_FREE_EXTENT},
        free_list::{MagnetIter, find_exact},
        manager::Allocator,
        store::{Store, Transaction},
        ticket::Ticket,
        width::Width,
    },
    log::{debug, trace},
};

type Fresh = fn(&mut Allocator<'_>, &Ticket<'_>) -> Result<Option<Chunk>>;

type Grow = fn(&mut Allocator<'_>, ChunkPtr, ChunkPtr, u64) -> Result<u64>;

const FRESH: &[(&str, Fresh)] = &[
    ("reuse-free-chunk", reuse_free_chunk),
    ("append-to-store",  append_to_store),
];

/// Growth strategies that do not move any data.
const GROW_CHEAP: &[(&str, Grow)] = &[
    ("grow-file",            grow_file),
    ("absorb-adjacent-free", absorb_adjacent_free),
    ("simple-link-assign",   simple_link_assign),
];

/// Growth strategies that rearrange data so that more space is available.
const GROW_COSTLY: &[(&str, Grow)] = &[
    ("walk-up-defragment",   walk_up_defragment),
    ("grow-header-in-place", grow_header_in_place),
];

/// Allocate a chunk for a ticket.
pub(crate) fn allocate(alloc: &mut Allocator, ticket: &Ticket)
    -> Result<Option<Chunk>>
{
    for &(name, strategy) in FRESH {
        trace!("Trying {name} for {} bytes", ticket.bytes());
        if let Some(chunk) = strategy(alloc, ticket)? {
            debug!("Allocated {} with capacity {} by {name}",
                   chunk.ptr(), chunk.capacity());
            alloc.listener().notify_created(&chunk);
            return Ok(Some(chunk));
        }
    }
    Ok(None)
}

/// Add at least `bytes` of capacity to the chain at `head`.
pub(crate) fn grow(
    alloc:  &mut Allocator,
    head:   ChunkPtr,
    target: ChunkPtr,
    bytes:  u64,
) -> Result<u64>
{
    let mut gained = 0;
    let mut target = target;
    while gained < bytes {
        let needed = bytes - gained;
        let strategies = GROW_CHEAP.iter().chain(GROW_COSTLY);
        let step = try_grow(alloc, strategies, head, target, needed)?;
        if step == 0 {
            return Err(Error::OutOfSpace{requested: needed});
        }
        gained += step;
        target = last_member(alloc.store(), head)?;
    }
    Ok(gained)
}

/// Try growth strategies until one makes progress.
fn try_grow<'s, I>(
    alloc:      &mut Allocator,
    strategies: I,
    head:       ChunkPtr,
    target:     ChunkPtr,
    bytes:      u64,
) -> Result<u64>
    where I: IntoIterator<Item = &'s (&'static str, Grow)>
{
    for &(name, strategy) in strategies {
        trace!("Trying {name} on {target} for {bytes} bytes");
        let gained = strategy(alloc, head, target, bytes)?;
        if gained > 0 {
            debug!("Grew chain {head} by {gained} bytes by {name}");
            return Ok(gained);
        }
    }
    Ok(0)
}

/// Split a free chunk into an empty live chunk and a free remainder.
///
/// The live chunk holds at least `capacity` bytes and is taken
/// from the end of the free chunk if `from_end` is set,
/// or from its start otherwise.
/// If the remainder would be smaller than [`MIN_FREE_EXTENT`],
/// the live chunk takes the whole free chunk instead.
/// Nothing is written to the store.
pub(crate) fn carve(
    free:       &Chunk,
    capacity:   u64,
    link_width: Width,
    from_end:   bool,
) -> Option<(Chunk, Option<Chunk>)>
{
    let extent = Chunk::sized_extent(capacity, link_width);
    let leftover = free.extent().checked_sub(extent)?;

    if leftover < MIN_FREE_EXTENT {
        let chunk = Chunk::fitted(free.ptr(), free.extent(), link_width)?;
        return (chunk.capacity() >= capacity).then_some((chunk, None));
    }

    let (at, rest) =
        if from_end {
            (free.ptr().add(leftover), free.ptr())
        } else {
            (free.ptr(), free.ptr().add(extent))
        };
    let chunk = Chunk::sized(at, capacity, link_width);
    let remainder = Chunk::free_with_extent(rest, leftover)
        .expect("Leftover has room for a free header");
    Some((chunk, Some(remainder)))
}

/// Link width for new chunks when none is requested.
///
/// Wide enough to address the store after it doubles in size.
fn default_link_width(alloc: &Allocator) -> Result<Width>
{
    match alloc.config().default_link_width {
        Some(width) => Ok(width),
        None => {
            let reach = alloc.store().len()?.saturating_mul(2);
            Ok(Width::fitting(reach).max(Width::U8))
        },
    }
}

fn link_width_for(alloc: &Allocator, ticket: &Ticket) -> Result<Width>
{
    match ticket.forced_link_width() {
        Some(width) => Ok(width),
        None => default_link_width(alloc),
    }
}

fn last_member(store: &dyn Store, head: ChunkPtr) -> Result<ChunkPtr>
{
    let mut last = head;
    for chunk in ChainIter::new(store, head) {
        last = chunk?.ptr();
    }
    Ok(last)
}

fn next_is_free(store: &dyn Store, chunk: &Chunk) -> Result<bool>
{
    if !chunk.is_followed(store)? {
        return Ok(false);
    }
    let next = ChunkPtr::new(chunk.end()).expect("Chunks end past zero");
    Ok(Chunk::read(store, next)?.is_free())
}

/* -------------------------------------------------------------------------- */
/*                              Fresh allocation                              */
/* -------------------------------------------------------------------------- */

/// Take a free chunk, preferring ones near the ticket's magnet.
fn reuse_free_chunk(alloc: &mut Allocator, ticket: &Ticket)
    -> Result<Option<Chunk>>
{
    let bytes = ticket.bytes();
    if bytes == 0 || alloc.manager.is_defragmenting() || alloc.free_list.is_empty() {
        return Ok(None);
    }

    let store = alloc.store();
    let link_width = link_width_for(alloc, ticket)?;
    let start = ticket.magnet_offset()
        .and_then(|offset| alloc.free_list.find_closest(offset));

    for index in MagnetIter::new(alloc.free_list.len(), start) {
        let free = Chunk::read(store, alloc.free_list.get(index))?;
        let Some((chunk, remainder)) = carve(&free, bytes, link_width, true)
        else {
            continue;
        };
        if !ticket.approves(&chunk) {
            continue;
        }

        let mut tx = Transaction::new(store);
        if let Some(remainder) = &remainder {
            remainder.sync_in(&mut tx);
        }
        chunk.sync_in(&mut tx);
        tx.commit()?;

        // A remainder keeps the entry, since it starts where the free chunk did.
        if remainder.is_none() {
            alloc.free_list.remove(index);
        }
        return Ok(Some(chunk));
    }

    Ok(None)
}

/// Put a new chunk at the end of the store.
fn append_to_store(alloc: &mut Allocator, ticket: &Ticket)
    -> Result<Option<Chunk>>
{
    let store = alloc.store();
    let link_width = link_width_for(alloc, ticket)?;
    let ptr = ChunkPtr::new(store.len()?)
        .expect("Formatted stores are not empty");
    let chunk = Chunk::sized(ptr, ticket.bytes(), link_width);

    let too_large = alloc.config().max_store_size
        .map_or(false, |max| chunk.end() > max);
    if too_large || !ticket.approves(&chunk) {
        return Ok(None);
    }

    store.set_len(chunk.end())?;
    chunk.sync(store)?;
    Ok(Some(chunk))
}

/* -------------------------------------------------------------------------- */
/*                                Chain growth                                */
/* -------------------------------------------------------------------------- */

/// Extend the target into newly added store space.
///
/// Only possible when the target is the last chunk in the store.
fn grow_file(
    alloc:  &mut Allocator,
    _head:  ChunkPtr,
    target: ChunkPtr,
    bytes:  u64,
) -> Result<u64>
{
    let store = alloc.store();
    let mut chunk = Chunk::read(store, target)?;
    if !chunk.is_tail(store)? {
        return Ok(0);
    }

    let mut gain = bytes.min(chunk.max_capacity() - chunk.capacity());
    if let Some(max) = alloc.config().max_store_size {
        gain = gain.min(max.saturating_sub(chunk.end()));
    }
    if gain == 0 {
        return Ok(0);
    }

    store.set_len(chunk.end() + gain)?;
    chunk.put_capacity(chunk.capacity() + gain)
        .expect("Gain was limited to what the body width can describe");
    chunk.sync(store)?;
    Ok(gain)
}

/// Extend the target into the free chunk that follows it.
fn absorb_adjacent_free(
    alloc:  &mut Allocator,
    _head:  ChunkPtr,
    target: ChunkPtr,
    bytes:  u64,
) -> Result<u64>
{
    let store = alloc.store();
    let mut chunk = Chunk::read(store, target)?;
    if !next_is_free(store, &chunk)? {
        return Ok(0);
    }

    let next_ptr = ChunkPtr::new(chunk.end()).expect("Chunks end past zero");
    let next = Chunk::read(store, next_ptr)?;
    let index = find_exact(&*alloc.free_list, next_ptr)
        .expect("Free chunks are on the free list");

    let room = chunk.max_capacity() - chunk.capacity();
    let extent = next.extent();
    let whole = extent <= room && extent < bytes.saturating_add(MIN_FREE_EXTENT);
    let gain =
        if whole {
            extent
        } else {
            bytes.min(room).min(extent.saturating_sub(MIN_FREE_EXTENT))
        };
    if gain == 0 {
        return Ok(0);
    }

    chunk.put_capacity(chunk.capacity() + gain)
        .expect("Gain was limited to what the body width can describe");
    let remainder = (!whole).then(|| {
        Chunk::free_with_extent(next_ptr.add(gain), extent - gain)
            .expect("Leftover has room for a free header")
    });

    let mut tx = Transaction::new(store);
    chunk.sync_in(&mut tx);
    if let Some(remainder) = &remainder {
        remainder.sync_in(&mut tx);
    }
    tx.commit()?;

    match remainder {
        Some(remainder) => alloc.free_list.set(index, remainder.ptr()),
        None => { alloc.free_list.remove(index); },
    }
    alloc.listener().notify_destroyed(next_ptr);
    Ok(gain)
}

/// Allocate a new chunk and link the target to it.
fn simple_link_assign(
    alloc:  &mut Allocator,
    _head:  ChunkPtr,
    target: ChunkPtr,
    bytes:  u64,
) -> Result<u64>
{
    let store = alloc.store();
    let mut chunk = Chunk::read(store, target)?;
    let link_width = chunk.link_width();
    if link_width == Width::Void || chunk.link().is_some() {
        return Ok(0);
    }

    let ticket = Ticket::new(bytes)
        .magnet(target)
        .approve(move |candidate| link_width.fits(candidate.ptr().get()));
    let Some(linked) = allocate(alloc, &ticket)? else {
        return Ok(0);
    };

    chunk.put_link(Some(linked.ptr()))
        .expect("Linked chunk was approved for the link width");
    chunk.sync(store)?;
    Ok(linked.capacity())
}

/// Move the trailing members of the chain into one larger chunk.
///
/// The latest member whose predecessor can link to the end of the store
/// is moved, together with all members after it.
/// The replacement is allocated in defragment mode,
/// so it does not take the holes about to be left by the members.
fn walk_up_defragment(
    alloc:   &mut Allocator,
    head:    ChunkPtr,
    _target: ChunkPtr,
    bytes:   u64,
) -> Result<u64>
{
    let store = alloc.store();
    let members = ChainIter::new(store, head).collect::<Result<Vec<_>>>()?;
    let store_len = store.len()?;

    let Some(start) = (1 .. members.len()).rev()
        .find(|&i| members[i - 1].link_width().fits(store_len))
    else {
        return Ok(0);
    };

    let moved = &members[start ..];
    let moved_capacity: u64 = moved.iter().map(Chunk::capacity).sum();
    let mut predecessor = members[start - 1].clone();
    let link_width = predecessor.link_width();

    let ticket = Ticket::new(moved_capacity.saturating_add(bytes))
        .approve(move |candidate| link_width.fits(candidate.ptr().get()));
    let manager = alloc.manager;
    let Some(mut replacement) =
        manager.with_defragment_mode(|| allocate(alloc, &ticket))?
    else {
        return Ok(0);
    };

    // Readers of the chain may be walking the members being moved.
    let timeout = alloc.config().drain_timeout();
    let moved_out = manager.activity().with_drain(timeout, || -> Result<()> {
        let mut data = Vec::new();
        for member in moved {
            let at = data.len();
            data.resize(at + member.size() as usize, 0);
            store.read_at(member.body_start(), &mut data[at ..])?;
        }

        const ERR: &str = "Replacement was sized and approved for the chain";
        replacement.put_size(data.len() as u64).expect(ERR);
        predecessor.put_link(Some(replacement.ptr())).expect(ERR);

        let mut tx = Transaction::new(store);
        replacement.sync_in(&mut tx);
        tx.write(replacement.body_start(), data);
        predecessor.sync_in(&mut tx);
        tx.commit()?;

        let ptrs: Vec<ChunkPtr> = moved.iter().map(Chunk::ptr).collect();
        alloc.free_batch(&ptrs)
    });

    match moved_out {
        Some(result) => result?,
        None => {
            alloc.free_batch(&[replacement.ptr()])?;
            return Ok(0);
        },
    }

    debug!("Moved {} members of chain {head} into {}",
           moved.len(), replacement.ptr());
    Ok(replacement.capacity() - moved_capacity)
}

/// Widen the header fields of the target, then retry the cheap strategies.
///
/// A link field is added or widened if the target has no link
/// and its link field cannot address the end of the store.
/// The body width is widened if the target could grow physically,
/// but its capacity field would overflow.
/// The used bytes move up to make room for the larger header.
/// If they no longer all fit, the target is split instead.
fn grow_header_in_place(
    alloc:  &mut Allocator,
    head:   ChunkPtr,
    target: ChunkPtr,
    bytes:  u64,
) -> Result<u64>
{
    let store = alloc.store();
    let chunk = Chunk::read(store, target)?;
    let store_len = store.len()?;

    let current = (chunk.body_width(), chunk.link_width());
    let (mut body_width, mut link_width) = current;
    if chunk.link().is_none() && !link_width.fits(store_len) {
        link_width = link_width.max(default_link_width(alloc)?);
    }
    if chunk.is_tail(store)? || next_is_free(store, &chunk)? {
        let wanted = chunk.capacity().saturating_add(bytes);
        body_width = body_width.max(Width::fitting(wanted));
    }

    let candidates = [
        (body_width, link_width),
        (current.0, link_width),
        (body_width, current.1),
    ];
    for (i, &(body_width, link_width)) in candidates.iter().enumerate() {
        if (body_width, link_width) == current
            || candidates[.. i].contains(&(body_width, link_width))
        {
            continue;
        }

        let mut widened = chunk.clone();
        let Ok(delta) = widened.put_widths(body_width, link_width) else {
            let gained =
                split_to_widen(alloc, &chunk, body_width, link_width, bytes)?;
            if gained > 0 {
                return Ok(gained);
            }
            continue;
        };

        // The used bytes move, so readers must not be looking at them.
        let manager = alloc.manager;
        let timeout = alloc.config().drain_timeout();
        let rewritten = manager.activity().with_drain(timeout, || -> Result<()> {
            let mut data = vec![0; chunk.size() as usize];
            store.read_at(chunk.body_start(), &mut data)?;
            let mut tx = Transaction::new(store);
            widened.sync_in(&mut tx);
            tx.write(widened.body_start(), data);
            Ok(tx.commit()?)
        });
        match rewritten {
            Some(result) => result?,
            None => return Ok(0),
        }

        trace!("Widened header of {target} to {body_width:?}/{link_width:?}");
        let gained = try_grow(alloc, GROW_CHEAP, head, target, bytes + delta)?;
        return Ok(gained.saturating_sub(delta));
    }

    Ok(0)
}

/// Widen the header of a chunk that is too full to widen in place.
///
/// The chunk keeps as many used bytes as still fit behind the wider header
/// and links to a new chunk that receives the rest,
/// followed by room for `bytes` more.
/// Only possible if the new widths include a link field
/// and the chunk does not link anywhere yet.
fn split_to_widen(
    alloc:      &mut Allocator,
    chunk:      &Chunk,
    body_width: Width,
    link_width: Width,
    bytes:      u64,
) -> Result<u64>
{
    if link_width == Width::Void || chunk.link().is_some() {
        return Ok(0);
    }

    let mut widened = chunk.clone();
    widened.put_size(0).expect("Zero size always fits");
    let Ok(delta) = widened.put_widths(body_width, link_width) else {
        return Ok(0);
    };
    let kept = widened.capacity();
    let Some(spilled) = chunk.size().checked_sub(kept).filter(|n| *n > 0) else {
        return Ok(0);
    };

    let ticket = Ticket::new(bytes.saturating_add(delta))
        .magnet(chunk.ptr())
        .approve(move |candidate| link_width.fits(candidate.ptr().get()));
    let Some(mut linked) = allocate(alloc, &ticket)? else {
        return Ok(0);
    };

    let store = alloc.store();
    let manager = alloc.manager;
    let timeout = alloc.config().drain_timeout();
    let split = manager.activity().with_drain(timeout, || -> Result<()> {
        let mut data = vec![0; chunk.size() as usize];
        store.read_at(chunk.body_start(), &mut data)?;

        const ERR: &str = "Split was sized and approved for the chunk";
        widened.put_size(kept).expect(ERR);
        widened.put_link(Some(linked.ptr())).expect(ERR);
        linked.put_size(spilled).expect(ERR);

        let tail = data.split_off(kept as usize);
        let mut tx = Transaction::new(store);
        widened.sync_in(&mut tx);
        tx.write(widened.body_start(), data);
        linked.sync_in(&mut tx);
        tx.write(linked.body_start(), tail);
        Ok(tx.commit()?)
    });

    match split {
        Some(result) => result?,
        None => {
            alloc.free_batch(&[linked.ptr()])?;
            return Ok(0);
        },
    }

    debug!("Split {} to widen its header, {spilled} bytes moved to {}",
           chunk.ptr(), linked.ptr());
    Ok(linked.capacity().saturating_sub(delta))
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn free_chunk(offset: u64, extent: u64) -> Chunk
    {
        Chunk::free_with_extent(ChunkPtr::new(offset).unwrap(), extent).unwrap()
    }

    #[test]
    fn carve_from_end_keeps_remainder_in_front()
    {
        let free = free_chunk(100, 200);
        let (chunk, remainder) = carve(&free, 50, Width::U16, true).unwrap();
        let remainder = remainder.unwrap();

        assert_eq!(chunk.capacity(), 50);
        assert_eq!(chunk.end(), free.end());
        assert_eq!(remainder.ptr(), free.ptr());
        assert_eq!(remainder.end(), chunk.ptr().get());
        assert!(remainder.is_free());
    }

    #[test]
    fn carve_from_start_keeps_remainder_behind()
    {
        let free = free_chunk(100, 200);
        let (chunk, remainder) = carve(&free, 50, Width::U16, false).unwrap();
        let remainder = remainder.unwrap();

        assert_eq!(chunk.ptr(), free.ptr());
        assert_eq!(remainder.ptr().get(), chunk.end());
        assert_eq!(remainder.end(), free.end());
    }

    #[test]
    fn carve_takes_everything_when_leftover_is_small()
    {
        let wanted = Chunk::sized_extent(50, Width::U8);
        let free = free_chunk(100, wanted + MIN_FREE_EXTENT - 1);
        let (chunk, remainder) = carve(&free, 50, Width::U8, true).unwrap();

        assert!(remainder.is_none());
        assert_eq!(chunk.ptr(), free.ptr());
        assert_eq!(chunk.extent(), free.extent());
        assert!(chunk.capacity() >= 50);
    }

    #[test]
    fn carve_rejects_small_chunks()
    {
        let free = free_chunk(100, 20);
        assert!(carve(&free, 50, Width::U8, true).is_none());
    }

    #[test]
    fn carve_rejects_whole_chunk_that_loses_capacity()
    {
        // 260 bytes hold 255 bytes with one-byte fields,
        // but taken whole they need two-byte fields, leaving 254.
        let free = free_chunk(100, 260);
        assert!(carve(&free, 255, Width::U8, true).is_none());
    }
}
