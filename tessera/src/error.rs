use {
    crate::{
        chunk::{ChunkPtr, HeaderError},
        verify::Inconsistency,
        width::EncodingError,
    },
    std::io,
    thiserror::Error,
};

/// Result of allocator operations.
pub type Result<T> =
    std::result::Result<T, Error>;

/// Allocator error.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum Error
{
    #[error("{0}")]
    Encoding(#[from] EncodingError),

    #[error("{0}")]
    Header(#[from] HeaderError),

    #[error("Chunk {0} is being read or written and cannot be freed")]
    UseWhileFreeing(ChunkPtr),

    #[error("Chunk {0} is already free")]
    AlreadyFree(ChunkPtr),

    #[error("Out of space: no strategy could provide {requested} bytes")]
    OutOfSpace{requested: u64},

    #[error("Store is inconsistent: {0}")]
    Inconsistent(#[from] Inconsistency),

    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("Invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}
