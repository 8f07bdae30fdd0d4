//! # Vulko Memory
//!
//! Manual memory management for model and texture builders:
//! - Large arenas are claimed once and carved up without touching the heap
//! - Every claim carries a label, so leaks can be traced to their owner
//! - Releases coalesce neighbouring free space immediately
//!
//! ## Building Blocks
//!
//! 1. **[`RawAllocator`]** - the only source of real bytes
//! 2. **[`MemoryManager`]** - best-fit free-list allocator over one arena
//! 3. **[`VirtualStack`]** - bump allocator with strict LIFO release
//! 4. **[`MemoryChunk`]** - a fixed-size lease that is released once
//!
//! Chunks, stacks and sub-managers are leases of the region that created
//! them. Closing a lease gives its range back through [`Region::free_child`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vulko_memory::{MemoryManager, RawAllocator};
//!
//! let heap = Arc::new(RawAllocator::new());
//! let manager = MemoryManager::new(Arc::clone(&heap), 1 << 20, false)?;
//!
//! let mut stack = manager.claim_stack(1000, "vertex staging")?;
//! stack.push_f32(1.0)?;
//! let _ = stack.pop_f32()?;
//! stack.close()?;
//!
//! manager.close()?;
//! assert_eq!(heap.live_blocks(), 0);
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod address;
pub mod chunk;
pub mod config;
pub mod error;
pub mod manager;
pub mod raw;
pub mod region;
pub mod stack;

pub use address::Address;
pub use chunk::MemoryChunk;
pub use config::MemoryConfig;
pub use error::{MemoryError, MemoryResult};
pub use manager::{ClaimRecord, ClaimSummary, Fragment, FragmentSummary, ManagerStats, MemoryManager};
pub use raw::RawAllocator;
pub use region::{Lender, Region};
pub use stack::VirtualStack;
