//! # Region Ownership Protocol
//!
//! A region lends sub-ranges of its memory to children (chunks, stacks,
//! sub-managers) and takes them back through a single callback.
//!
//! ```text
//!   MemoryManager ──lends──▶ VirtualStack ──lends──▶ MemoryChunk
//!        ▲                        ▲                      │
//!        └──── free_child ────────┴──── free_child ──────┘
//! ```
//!
//! Children keep a [`Lender`] handle to their region. Regions never keep
//! references to their children, so the graph has no cycles.

use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use crate::address::Address;
use crate::error::MemoryResult;

/// Anything that lends out memory and takes it back by address.
pub trait Region {
    /// Takes back the child lease that starts at `address`.
    ///
    /// # Errors
    ///
    /// Fails if `address` does not identify a child this region lent out,
    /// or if the region itself has already been closed.
    fn free_child(&self, address: Address) -> MemoryResult<()>;
}

/// Handle from a lease to the region it was lent from.
#[derive(Clone)]
pub enum Lender {
    /// A region that can be shared between threads (memory managers).
    Shared(Arc<dyn Region + Send + Sync>),
    /// A region owned by a single thread (virtual stacks).
    Local(Rc<dyn Region>),
}

impl Lender {
    /// Forwards a release to the lending region.
    ///
    /// # Errors
    ///
    /// Propagates the region's error.
    #[inline]
    pub fn free_child(&self, address: Address) -> MemoryResult<()> {
        match self {
            Self::Shared(region) => region.free_child(address),
            Self::Local(region) => region.free_child(address),
        }
    }
}

impl fmt::Debug for Lender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared(_) => f.write_str("Lender::Shared"),
            Self::Local(_) => f.write_str("Lender::Local"),
        }
    }
}
