use crate::{chunk::{Chunk, ChunkPtr}, width::Width};

/// Request for a new chunk.
///
/// A ticket says how many bytes the chunk must hold,
/// and optionally where it should preferably be,
/// which link width it must have,
/// and a predicate that gets the final say over a candidate.
///
/// # Examples
///
/// ```
/// # use tessera::{Ticket, Width};
/// let ticket = Ticket::new(100)
///     .link_width(Width::U16)
///     .approve(|chunk| chunk.ptr().get() < 65_536);
/// assert_eq!(ticket.bytes(), 100);
/// ```
pub struct Ticket<'a>
{
    bytes: u64,
    magnet: Option<u64>,
    link_width: Option<Width>,
    approve: Option<Box<dyn Fn(&Chunk) -> bool + 'a>>,
}

impl<'a> Ticket<'a>
{
    /// Request a chunk of at least `bytes` capacity.
    pub fn new(bytes: u64) -> Self
    {
        Self{bytes, magnet: None, link_width: None, approve: None}
    }

    /// Prefer free chunks close to `ptr`.
    pub fn magnet(mut self, ptr: ChunkPtr) -> Self
    {
        self.magnet = Some(ptr.get());
        self
    }

    /// Force the link width of the new chunk.
    pub fn link_width(mut self, width: Width) -> Self
    {
        self.link_width = Some(width);
        self
    }

    /// Veto candidates for which `f` returns false.
    pub fn approve<F>(mut self, f: F) -> Self
        where F: Fn(&Chunk) -> bool + 'a
    {
        self.approve = Some(Box::new(f));
        self
    }

    /// The requested capacity.
    pub fn bytes(&self) -> u64
    {
        self.bytes
    }

    /// The preferred location.
    pub fn magnet_offset(&self) -> Option<u64>
    {
        self.magnet
    }

    /// The forced link width.
    pub fn forced_link_width(&self) -> Option<Width>
    {
        self.link_width
    }

    /// Whether the ticket accepts the candidate chunk.
    pub fn approves(&self, chunk: &Chunk) -> bool
    {
        self.approve.as_ref().map_or(true, |f| f(chunk))
    }
}
