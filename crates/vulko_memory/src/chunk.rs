//! # Memory Chunk
//!
//! A fixed-size lease of contiguous memory, used for instance to stage
//! texture or vertex data before it is uploaded.

use crate::address::Address;
use crate::error::{MemoryError, MemoryResult};
use crate::region::Lender;

/// A claimed range of memory with single-release semantics.
///
/// The bytes in `address..address + size` belong to the holder of the chunk
/// until [`release`](Self::release) is called. The chunk does not interpret
/// them; reads and writes go through the [`RawAllocator`](crate::RawAllocator).
///
/// Dropping a chunk that was never released releases it.
#[derive(Debug)]
pub struct MemoryChunk {
    lender: Lender,
    address: Address,
    size: u64,
    released: bool,
}

impl MemoryChunk {
    /// Wraps an already-lent range. No memory is allocated here; the caller
    /// guarantees that the range is owned by `lender` and free to use.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidArgument`] if `address` is null.
    pub fn new(lender: Lender, address: Address, size: u64) -> MemoryResult<Self> {
        if address.is_null() {
            return Err(MemoryError::InvalidArgument("address must not be 0".to_string()));
        }
        Ok(Self {
            lender,
            address,
            size,
            released: false,
        })
    }

    /// Returns the first address of the chunk.
    #[inline]
    #[must_use]
    pub const fn address(&self) -> Address {
        self.address
    }

    /// Returns the size in bytes.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Returns one past the last address of the chunk.
    #[inline]
    #[must_use]
    pub const fn end_address(&self) -> Address {
        Address::new(self.address.get().saturating_add(self.size))
    }

    /// Checks whether the chunk has been released.
    #[inline]
    #[must_use]
    pub const fn is_released(&self) -> bool {
        self.released
    }

    /// Gives the memory back to the lender.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::DoubleClose`] if the chunk was already released,
    /// or the lender's error if it refuses the release.
    pub fn release(&mut self) -> MemoryResult<()> {
        if self.released {
            return Err(MemoryError::DoubleClose {
                object: "chunk",
                address: self.address,
            });
        }
        self.released = true;
        self.lender.free_child(self.address)
    }
}

impl Drop for MemoryChunk {
    fn drop(&mut self) {
        if !self.released {
            if let Err(error) = self.release() {
                tracing::warn!("dropping chunk at {} failed to release: {}", self.address, error);
            }
        }
    }
}
