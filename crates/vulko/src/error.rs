//! # Soak Errors

use thiserror::Error;
use vulko_memory::MemoryError;

/// Errors that end a soak run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SoakError {
    /// The memory subsystem reported a fault.
    #[error(transparent)]
    Memory(#[from] MemoryError),

    /// A popped value differs from the value that was pushed.
    #[error("stack {stack}: popped {kind} {actual}, but {expected} was pushed")]
    Mismatch {
        /// Label of the stack.
        stack: String,
        /// Which kind of value was popped.
        kind: &'static str,
        /// The pushed value.
        expected: String,
        /// The popped value.
        actual: String,
    },

    /// Heap blocks were still live after the manager was closed.
    #[error("{blocks} heap blocks still live after closing the manager")]
    Leak {
        /// Number of live blocks.
        blocks: usize,
    },

    /// The soak configuration was rejected.
    #[error("invalid soak config: {0}")]
    InvalidConfig(String),
}

/// Result type for soak operations.
pub type SoakResult<T> = Result<T, SoakError>;
