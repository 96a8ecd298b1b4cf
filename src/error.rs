//! Error types for the ladder book.

use crate::command::{LevelIndex, Side};
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T, E = BookError> = std::result::Result<T, E>;

/// Everything that can go wrong between a caller and the store.
#[derive(Debug, Error)]
pub enum BookError {
    /// Update targeted an index with no level
    #[error("no {side} level at index {index}")]
    NotFound { side: Side, index: LevelIndex },

    /// Snapshot requested while one side has no levels in range
    #[error("{side} ladder is empty")]
    EmptyLadder { side: Side },

    /// New would leave a hole in the 1..=len numbering
    #[error("{side} index {index} is out of range for a ladder of {len} levels")]
    IndexOutOfRange {
        side: Side,
        index: LevelIndex,
        len: usize,
    },

    /// The backing store did not become ready in time
    #[error("persistence unavailable on node {node} (tables: {tables:?}): {reason}")]
    PersistenceUnavailable {
        node: String,
        tables: Vec<String>,
        reason: String,
    },

    /// Store access to a table that was never created
    #[error("unknown table `{0}`")]
    UnknownTable(String),

    /// A feed row could not be turned into an instruction
    #[error("invalid instruction: {0}")]
    InvalidInstruction(String),

    /// The writer thread has exited
    #[error("book processor stopped")]
    ProcessorStopped,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl BookError {
    /// True for errors that reject one instruction but leave the book usable
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            BookError::NotFound { .. }
                | BookError::EmptyLadder { .. }
                | BookError::IndexOutOfRange { .. }
                | BookError::InvalidInstruction(_)
        )
    }
}
