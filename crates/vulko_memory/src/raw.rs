//! # Raw Allocator
//!
//! The only place where real bytes live. Every other component in this crate
//! deals in [`Address`]es and asks the raw allocator to read or write them.
//!
//! ## Layout
//!
//! ```text
//!  0x10000            0x10020                 0x10040
//!  ┌──────────┬──────┬──────────────────┬──────┬─────
//!  │ block A  │guard │     block B      │guard │ ...
//!  └──────────┴──────┴──────────────────┴──────┴─────
//! ```
//!
//! Blocks are handed out from a monotonically growing address space, rounded
//! up to [`BLOCK_ALIGN`] and separated by a guard gap so that no access can run
//! from one block into the next. Addresses are never reused.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

use bytemuck::Pod;
use parking_lot::RwLock;

use crate::address::Address;
use crate::error::{MemoryError, MemoryResult};

/// First address handed out by a fresh allocator.
const FIRST_ADDRESS: u64 = 0x1_0000;

/// Granularity of block placement in the address space.
pub const BLOCK_ALIGN: u64 = 16;

/// Bookkeeping behind the lock.
struct HeapState {
    /// Live blocks keyed by their first address.
    blocks: BTreeMap<Address, Box<[u8]>>,
    /// Next unused address.
    next_address: u64,
    /// Sum of the sizes of all live blocks.
    allocated: u64,
}

/// The raw allocator: allocate, release, fill, copy, and typed get/put.
///
/// # Thread Safety
///
/// The block table is guarded by a `RwLock`; reads of different blocks can
/// proceed in parallel. The allocator never calls back into managers, so it
/// can be used while a manager lock is held.
///
/// # Example
///
/// ```rust,ignore
/// let heap = RawAllocator::new();
/// let address = heap.allocate(64)?;
/// heap.put(address, 1.5f32)?;
/// assert_eq!(heap.get::<f32>(address)?, 1.5);
/// heap.release(address)?;
/// ```
pub struct RawAllocator {
    /// Live blocks and address space cursor.
    state: RwLock<HeapState>,
    /// Cap on the total size of live blocks.
    limit: Option<u64>,
}

impl RawAllocator {
    /// Creates an allocator without a size limit.
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Creates an allocator that refuses to hold more than `limit` live bytes.
    #[must_use]
    pub fn with_limit(limit: u64) -> Self {
        Self::build(Some(limit))
    }

    fn build(limit: Option<u64>) -> Self {
        Self {
            state: RwLock::new(HeapState {
                blocks: BTreeMap::new(),
                next_address: FIRST_ADDRESS,
                allocated: 0,
            }),
            limit,
        }
    }

    /// Returns the configured limit, if any.
    #[inline]
    #[must_use]
    pub const fn limit(&self) -> Option<u64> {
        self.limit
    }

    /// Returns the number of live blocks.
    #[must_use]
    pub fn live_blocks(&self) -> usize {
        self.state.read().blocks.len()
    }

    /// Returns the total size of all live blocks in bytes.
    #[must_use]
    pub fn allocated_bytes(&self) -> u64 {
        self.state.read().allocated
    }

    /// Checks whether `address` is the first byte of a live block.
    #[must_use]
    pub fn is_block_start(&self, address: Address) -> bool {
        self.state.read().blocks.contains_key(&address)
    }

    /// Allocates a zeroed block of `num_bytes` bytes.
    ///
    /// The zeroes are written up front, so the whole block is resident as
    /// soon as this returns. Size manager arenas for the working set rather
    /// than for the worst case.
    ///
    /// Requesting 0 bytes succeeds and yields a unique, non-null address
    /// that can be released like any other block.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::AllocationFailure`] if the limit would be
    /// exceeded, the address space is exhausted, or the platform cannot
    /// reserve the bytes.
    pub fn allocate(&self, num_bytes: u64) -> MemoryResult<Address> {
        let failure = || MemoryError::AllocationFailure { requested: num_bytes };

        if !self.fits_limit(self.state.read().allocated, num_bytes) {
            return Err(failure());
        }

        let len = usize::try_from(num_bytes).map_err(|_| failure())?;
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(len).map_err(|_| failure())?;
        bytes.resize(len, 0u8);

        let span = num_bytes
            .max(1)
            .checked_next_multiple_of(BLOCK_ALIGN)
            .and_then(|rounded| rounded.checked_add(BLOCK_ALIGN))
            .ok_or_else(failure)?;

        let mut state = self.state.write();
        if !self.fits_limit(state.allocated, num_bytes) {
            return Err(failure());
        }
        let next_address = state.next_address.checked_add(span).ok_or_else(failure)?;
        let address = Address::new(state.next_address);
        state.next_address = next_address;
        state.allocated += num_bytes;
        state.blocks.insert(address, bytes.into_boxed_slice());

        tracing::trace!("allocated {} bytes at {}", num_bytes, address);
        Ok(address)
    }

    fn fits_limit(&self, allocated: u64, num_bytes: u64) -> bool {
        match self.limit {
            Some(limit) => allocated
                .checked_add(num_bytes)
                .is_some_and(|total| total <= limit),
            None => true,
        }
    }

    /// Releases the block starting at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidArgument`] if no live block starts there.
    pub fn release(&self, address: Address) -> MemoryResult<()> {
        let mut state = self.state.write();
        let block = state.blocks.remove(&address).ok_or_else(|| {
            MemoryError::InvalidArgument(format!(
                "address {address} is not the start of an allocated block"
            ))
        })?;
        state.allocated -= block.len() as u64;

        tracing::trace!("released {} bytes at {}", block.len(), address);
        Ok(())
    }

    /// Sets `num_bytes` bytes starting at `address` to `value`.
    ///
    /// # Errors
    ///
    /// Fails if `address` is null while `num_bytes > 0`, or if the range is
    /// not inside one live block.
    pub fn fill(&self, address: Address, num_bytes: u64, value: u8) -> MemoryResult<()> {
        if num_bytes == 0 {
            return Ok(());
        }
        reject_null(address)?;
        let mut state = self.state.write();
        Self::slice_mut(&mut state.blocks, address, num_bytes)?.fill(value);
        Ok(())
    }

    /// Copies `num_bytes` bytes from `source` to `dest`. The ranges may overlap.
    ///
    /// # Errors
    ///
    /// Fails if either address is null while `num_bytes > 0`, or if either
    /// range is not inside one live block.
    pub fn copy(&self, source: Address, dest: Address, num_bytes: u64) -> MemoryResult<()> {
        if num_bytes == 0 {
            return Ok(());
        }
        reject_null(source)?;
        reject_null(dest)?;
        let mut state = self.state.write();
        let bytes = Self::slice(&state.blocks, source, num_bytes)?.to_vec();
        Self::slice_mut(&mut state.blocks, dest, num_bytes)?.copy_from_slice(&bytes);
        Ok(())
    }

    /// Writes `data` starting at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::UnmappedAccess`] if the range is not inside one live block.
    pub fn write_bytes(&self, address: Address, data: &[u8]) -> MemoryResult<()> {
        let mut state = self.state.write();
        Self::slice_mut(&mut state.blocks, address, data.len() as u64)?.copy_from_slice(data);
        Ok(())
    }

    /// Reads `num_bytes` bytes starting at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::UnmappedAccess`] if the range is not inside one live block.
    pub fn read_bytes(&self, address: Address, num_bytes: u64) -> MemoryResult<Vec<u8>> {
        let state = self.state.read();
        Ok(Self::slice(&state.blocks, address, num_bytes)?.to_vec())
    }

    /// Stores `value` at `address` in host-native byte layout.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::UnmappedAccess`] if the value does not fit inside one live block.
    #[inline]
    pub fn put<T: Pod>(&self, address: Address, value: T) -> MemoryResult<()> {
        self.write_bytes(address, bytemuck::bytes_of(&value))
    }

    /// Loads a value of type `T` from `address` in host-native byte layout.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::UnmappedAccess`] if the value does not fit inside one live block.
    #[inline]
    pub fn get<T: Pod>(&self, address: Address) -> MemoryResult<T> {
        let state = self.state.read();
        let bytes = Self::slice(&state.blocks, address, std::mem::size_of::<T>() as u64)?;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    fn slice(blocks: &BTreeMap<Address, Box<[u8]>>, address: Address, len: u64) -> MemoryResult<&[u8]> {
        let unmapped = || MemoryError::UnmappedAccess { address, len };
        let (base, block) = blocks.range(..=address).next_back().ok_or_else(unmapped)?;
        let range = span(*base, block.len(), address, len).ok_or_else(unmapped)?;
        Ok(&block[range])
    }

    fn slice_mut(
        blocks: &mut BTreeMap<Address, Box<[u8]>>,
        address: Address,
        len: u64,
    ) -> MemoryResult<&mut [u8]> {
        let unmapped = || MemoryError::UnmappedAccess { address, len };
        let (base, block) = blocks.range_mut(..=address).next_back().ok_or_else(unmapped)?;
        let range = span(*base, block.len(), address, len).ok_or_else(unmapped)?;
        Ok(&mut block[range])
    }
}

/// Index range of `[address, address + len)` inside a block starting at `base`.
fn span(base: Address, block_len: usize, address: Address, len: u64) -> Option<Range<usize>> {
    let start = address.offset_from(base)?;
    let end = start.checked_add(len)?;
    if end > block_len as u64 {
        return None;
    }
    Some(usize::try_from(start).ok()?..usize::try_from(end).ok()?)
}

fn reject_null(address: Address) -> MemoryResult<()> {
    if address.is_null() {
        return Err(MemoryError::InvalidArgument("address must not be 0".to_string()));
    }
    Ok(())
}

impl Default for RawAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RawAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("RawAllocator")
            .field("live_blocks", &state.blocks.len())
            .field("allocated", &state.allocated)
            .field("limit", &self.limit)
            .finish()
    }
}
