//! Allocator configuration.

use {
    crate::{Result, width::Width},
    serde::{Deserialize, Serialize},
    std::{io::Read, time::Duration},
};

/// What to do with stale bytes when chunks are freed.
///
/// Freed chunks keep whatever bytes they held.
/// Merged-away headers in particular look like valid headers,
/// which can confuse tools that scan the store.
/// Purging removes them at the cost of extra writes.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PurgeMode
{
    /// Leave freed bytes alone.
    #[default]
    Off,

    /// Zero the headers of chunks that were merged into others.
    Headers,

    /// Zero the entire body of freed chunks.
    Full,
}

/// Tunables for [`ChunkManager`].
///
/// Every field has a default, so a configuration file
/// need only mention the fields it wants to change.
///
/// [`ChunkManager`]: `crate::ChunkManager`
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct Config
{
    /// Hygiene pass applied to freed chunks.
    pub purge: PurgeMode,

    /// Spans longer than this are zero-filled by several threads.
    pub parallel_purge_threshold: u64,

    /// The store is never grown past this many bytes.
    pub max_store_size: Option<u64>,

    /// Whether tail compaction may move live chunks out of the way.
    pub relocate_tail: bool,

    /// Upper bound on chunks moved by a single compaction.
    pub max_tail_relocations: usize,

    /// How long a compaction waits for chain I/O to finish
    /// before giving up on moving a chunk.
    pub drain_timeout_ms: u64,

    /// Link width of new chunks when the ticket does not force one.
    ///
    /// If absent, the width is derived from the size of the store.
    pub default_link_width: Option<Width>,
}

impl Config
{
    /// Parse a configuration from JSON.
    pub fn from_json_str(json: &str) -> Result<Self>
    {
        Ok(serde_json::from_str(json)?)
    }

    /// Parse a configuration from a JSON stream.
    pub fn from_json_reader<R>(reader: R) -> Result<Self>
        where R: Read
    {
        Ok(serde_json::from_reader(reader)?)
    }

    /// [`drain_timeout_ms`][`Self::drain_timeout_ms`] as a duration.
    pub fn drain_timeout(&self) -> Duration
    {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl Default for Config
{
    fn default() -> Self
    {
        Self{
            purge:                    PurgeMode::Off,
            parallel_purge_threshold: 1 << 20,
            max_store_size:           None,
            relocate_tail:            true,
            max_tail_relocations:     16,
            drain_timeout_ms:         50,
            default_link_width:       None,
        }
    }
}
