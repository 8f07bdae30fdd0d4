//! # Memory Error Types
//!
//! All errors that can occur in the memory subsystem.
//!
//! Every variant is a discipline error: the caller misused a lease or asked
//! for more than exists. None of them are transient, so none are retried.

use thiserror::Error;

use crate::address::Address;

/// Errors that can occur in the memory subsystem.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// The raw allocator could not provide the requested bytes.
    #[error("couldn't allocate {requested} bytes of memory")]
    AllocationFailure {
        /// Number of bytes requested.
        requested: u64,
    },

    /// Malformed constructor parameters or an out-of-range release.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A read or write touched bytes outside every live block.
    #[error("access of {len} bytes at {address} is outside every allocated block")]
    UnmappedAccess {
        /// First byte of the access.
        address: Address,
        /// Length of the access in bytes.
        len: u64,
    },

    /// A push would move the stack pointer past the bound address.
    #[error("stack pointer is {pointer} and {requested} bytes of data need to be pushed, but the bound address is {bound}")]
    StackOverflow {
        /// Stack pointer before the push.
        pointer: Address,
        /// Bytes requested.
        requested: u64,
        /// Bound address of the stack.
        bound: Address,
    },

    /// A pop would move the stack pointer below the start address.
    #[error("stack pointer is {pointer} and {requested} bytes of data need to be popped, but the start address is {start}")]
    StackUnderflow {
        /// Stack pointer before the pop.
        pointer: Address,
        /// Bytes requested.
        requested: u64,
        /// Start address of the stack.
        start: Address,
    },

    /// A lease or manager was released a second time.
    #[error("{object} at {address} closed more than once")]
    DoubleClose {
        /// Kind of object ("chunk", "virtual stack", "memory manager").
        object: &'static str,
        /// Address identifying the object.
        address: Address,
    },

    /// An operation was attempted on a released object.
    #[error("{object} at {address} has been closed")]
    UseAfterClose {
        /// Kind of object.
        object: &'static str,
        /// Address identifying the object.
        address: Address,
    },

    /// `close_exact` found pushes that were never popped.
    #[error("virtual stack didn't pop all data it pushed: pointer {pointer}, start {start}")]
    UnbalancedStack {
        /// Current stack pointer.
        pointer: Address,
        /// Start address of the stack.
        start: Address,
    },

    /// No fragment is large enough and external memory is disallowed.
    #[error("can't allocate {requested} bytes of memory for {label} (largest fragment is {largest_fragment} bytes)")]
    OutOfMemory {
        /// Bytes requested.
        requested: u64,
        /// Purpose label of the failed claim.
        label: String,
        /// Size of the largest free fragment at the time of the claim.
        largest_fragment: u64,
    },

    /// A manager was closed while claims were still outstanding.
    #[error("attempted to close memory manager with {count} claims left:\n{summary}")]
    ClaimsStillActive {
        /// Number of outstanding claims.
        count: usize,
        /// Claim summary at the time of the failure.
        summary: String,
    },

    /// The free fragments of a manager did not reduce to one full-arena fragment.
    #[error("invalid memory fragments: {reason}\n{summary}")]
    FragmentInvariantViolation {
        /// What was wrong.
        reason: String,
        /// Fragment summary at the time of the failure.
        summary: String,
    },

    /// Invalid configuration file.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for memory operations.
pub type MemoryResult<T> = Result<T, MemoryError>;
