//! # Memory Manager
//!
//! A best-fit free-list allocator over one large, pre-allocated arena.
//!
//! ## Design
//!
//! ```text
//!   base                                                   base + capacity
//!   ┌─────────┬──────────┬───────────────┬─────────┬───────────────────┐
//!   │ claim A │ fragment │    claim B    │ claim C │     fragment      │
//!   └─────────┴──────────┴───────────────┴─────────┴───────────────────┘
//! ```
//!
//! - Claims take the front of the smallest fragment that fits
//! - Releases merge the freed range with free neighbours
//! - Claims and fragments together always cover the whole arena
//!
//! When no fragment fits, the manager may go to the raw allocator instead.
//! Those external claims are not tracked in the arena bookkeeping; they are
//! recognised at release time by lying outside the arena.
//!
//! ## Thread Safety
//!
//! All bookkeeping sits behind one mutex, so a manager can be shared between
//! threads by reference. Sub-managers have their own mutex and only call into
//! their parent when they are closed.

mod fragments;
mod summary;

pub use fragments::Fragment;
pub use summary::{ClaimRecord, ClaimSummary, FragmentSummary, ManagerStats};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::address::Address;
use crate::chunk::MemoryChunk;
use crate::error::{MemoryError, MemoryResult};
use crate::raw::RawAllocator;
use crate::region::{Lender, Region};
use crate::stack::VirtualStack;
use fragments::FragmentIndex;
use summary::ClaimEntry;

/// Bookkeeping behind the manager lock.
struct ManagerState {
    /// Outstanding claims inside the arena, keyed by address.
    claims: BTreeMap<Address, ClaimEntry>,
    /// Free ranges of the arena.
    fragments: FragmentIndex,
    /// Live claims served by the raw allocator.
    external_claims: usize,
    /// Whether the arena was given back.
    closed: bool,
}

impl ManagerState {
    fn claim_summary(&self) -> ClaimSummary {
        ClaimSummary::capture(self.claims.iter())
    }

    fn fragment_summary(&self) -> FragmentSummary {
        FragmentSummary {
            by_size: self.fragments.iter_by_size_descending().collect(),
            by_address: self.fragments.iter_by_address().collect(),
        }
    }
}

/// State shared between a manager and the leases it handed out.
struct ManagerInner {
    heap: Arc<RawAllocator>,
    /// Where the arena came from; `None` means straight from the heap.
    parent: Option<Arc<dyn Region + Send + Sync>>,
    base: Address,
    capacity: u64,
    allow_external: bool,
    state: Mutex<ManagerState>,
}

impl ManagerInner {
    fn end(&self) -> Address {
        Address::new(self.base.get() + self.capacity)
    }

    fn contains(&self, address: Address) -> bool {
        address >= self.base && address < self.end()
    }

    fn closed_error(&self) -> MemoryError {
        MemoryError::UseAfterClose {
            object: "memory manager",
            address: self.base,
        }
    }

    /// The best-fit claim shared by chunks, stacks and sub-managers.
    fn claim(&self, size: u64, label: &str) -> MemoryResult<Address> {
        if size == 0 {
            return Err(MemoryError::InvalidArgument(format!(
                "claim for {label} must be at least 1 byte"
            )));
        }

        let mut state = self.state.lock();
        if state.closed {
            return Err(self.closed_error());
        }

        let Some(fragment) = state.fragments.best_fit(size) else {
            if !self.allow_external {
                return Err(MemoryError::OutOfMemory {
                    requested: size,
                    label: label.to_string(),
                    largest_fragment: state.fragments.largest().map_or(0, |largest| largest.size),
                });
            }
            tracing::warn!(
                "went outside of manager memory at {} to allocate {} bytes for {}",
                self.base,
                size,
                label
            );
            let address = self.heap.allocate(size)?;
            state.external_claims += 1;
            return Ok(address);
        };

        let address = state.fragments.take_front(fragment, size);
        state.claims.insert(
            address,
            ClaimEntry {
                size,
                claimed_at: Instant::now(),
                label: label.to_string(),
            },
        );
        tracing::debug!("claimed {} bytes at {} for {}", size, address, label);
        Ok(address)
    }

    /// Hands the arena back to wherever it came from.
    fn release_arena(&self) -> MemoryResult<()> {
        match &self.parent {
            Some(parent) => parent.free_child(self.base),
            None => self.heap.release(self.base),
        }
    }
}

impl Region for ManagerInner {
    fn free_child(&self, address: Address) -> MemoryResult<()> {
        if !self.contains(address) {
            if !self.allow_external {
                // Without external memory this address can't have come from us.
                return Err(MemoryError::InvalidArgument(format!(
                    "attempted to free out of bounds memory address {address} of memory manager with address {} and capacity {}",
                    self.base, self.capacity
                )));
            }
            self.heap.release(address)?;
            let mut state = self.state.lock();
            state.external_claims = state.external_claims.saturating_sub(1);
            tracing::debug!("released external claim at {}", address);
            return Ok(());
        }

        let mut state = self.state.lock();
        if state.closed {
            return Err(self.closed_error());
        }
        let claim = state.claims.remove(&address).ok_or_else(|| {
            MemoryError::InvalidArgument(format!("there is no current claim with address {address}"))
        })?;
        let merged = state.fragments.give_back(Fragment::new(address, claim.size));
        tracing::debug!(
            "released {} bytes at {} ({}), free fragment is now {} bytes at {}",
            claim.size,
            address,
            claim.label,
            merged.size,
            merged.address
        );
        Ok(())
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        let (closed, leftover) = {
            let state = self.state.get_mut();
            (state.closed, state.claims.len())
        };
        if closed {
            return;
        }
        if leftover > 0 {
            tracing::warn!(
                "memory manager at {} dropped without close with {} claims left",
                self.base,
                leftover
            );
        }
        self.state.get_mut().closed = true;
        if let Err(error) = self.release_arena() {
            tracing::warn!("memory manager at {} failed to release its arena: {}", self.base, error);
        }
    }
}

/// A best-fit allocator over a pre-allocated arena.
///
/// # Example
///
/// ```rust,ignore
/// let heap = Arc::new(RawAllocator::new());
/// let manager = MemoryManager::new(heap, 64 * 1024 * 1024, false)?;
///
/// let mut vertices = manager.claim_chunk(4096, "snake vertices")?;
/// let mut scratch = manager.claim_stack(1000, "texture scratch")?;
/// // ... fill and upload ...
/// scratch.close()?;
/// vertices.release()?;
///
/// manager.close()?;
/// ```
pub struct MemoryManager {
    inner: Arc<ManagerInner>,
}

impl MemoryManager {
    /// Allocates an arena of `capacity` bytes from `heap` and manages it.
    ///
    /// With `allow_external`, claims that fit no fragment are served by the
    /// heap directly instead of failing.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidArgument`] for a zero capacity, or
    /// [`MemoryError::AllocationFailure`] if the heap can't provide the arena.
    pub fn new(heap: Arc<RawAllocator>, capacity: u64, allow_external: bool) -> MemoryResult<Self> {
        if capacity == 0 {
            return Err(MemoryError::InvalidArgument(
                "memory manager capacity must be at least 1 byte".to_string(),
            ));
        }
        let base = heap.allocate(capacity)?;
        tracing::info!("memory manager created at {} with {} bytes", base, capacity);
        Ok(Self::over(heap, None, base, capacity, allow_external))
    }

    fn over(
        heap: Arc<RawAllocator>,
        parent: Option<Arc<dyn Region + Send + Sync>>,
        base: Address,
        capacity: u64,
        allow_external: bool,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                heap,
                parent,
                base,
                capacity,
                allow_external,
                state: Mutex::new(ManagerState {
                    claims: BTreeMap::new(),
                    fragments: FragmentIndex::with_fragment(Fragment::new(base, capacity)),
                    external_claims: 0,
                    closed: false,
                }),
            }),
        }
    }

    /// Returns the first address of the arena.
    #[inline]
    #[must_use]
    pub fn base_address(&self) -> Address {
        self.inner.base
    }

    /// Returns the arena size in bytes.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.inner.capacity
    }

    /// Checks whether claims may fall back to the raw allocator.
    #[inline]
    #[must_use]
    pub fn allows_external(&self) -> bool {
        self.inner.allow_external
    }

    /// Returns the allocator that backs the arena.
    #[inline]
    #[must_use]
    pub fn heap(&self) -> &Arc<RawAllocator> {
        &self.inner.heap
    }

    /// Checks whether the manager has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Returns a handle through which leases give their memory back to this manager.
    ///
    /// Used to wrap claimed ranges in lease types of your own.
    #[must_use]
    pub fn as_lender(&self) -> Lender {
        Lender::Shared(self.inner.clone())
    }

    /// Claims `size` bytes as a chunk.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::OutOfMemory`] if nothing fits and external
    /// memory is disallowed, [`MemoryError::AllocationFailure`] if the
    /// external fallback fails, [`MemoryError::InvalidArgument`] for a zero
    /// size, or [`MemoryError::UseAfterClose`] on a closed manager.
    pub fn claim_chunk(&self, size: u64, label: &str) -> MemoryResult<MemoryChunk> {
        let address = self.inner.claim(size, label)?;
        MemoryChunk::new(self.as_lender(), address, size)
    }

    /// Claims `size` bytes as a virtual stack.
    ///
    /// # Errors
    ///
    /// See [`claim_chunk`](Self::claim_chunk).
    pub fn claim_stack(&self, size: u64, label: &str) -> MemoryResult<VirtualStack> {
        let address = self.inner.claim(size, label)?;
        VirtualStack::new(self.as_lender(), Arc::clone(&self.inner.heap), address, size)
    }

    /// Claims `size` bytes and manages them as a nested manager.
    ///
    /// The sub-manager inherits the external-memory setting and gives its
    /// arena back to this manager when it is closed.
    ///
    /// # Errors
    ///
    /// See [`claim_chunk`](Self::claim_chunk).
    pub fn claim_sub_manager(&self, size: u64, label: &str) -> MemoryResult<MemoryManager> {
        let address = self.inner.claim(size, label)?;
        let parent: Arc<dyn Region + Send + Sync> = self.inner.clone();
        tracing::info!("sub-manager for {} created at {} with {} bytes", label, address, size);
        Ok(Self::over(
            Arc::clone(&self.inner.heap),
            Some(parent),
            address,
            size,
            self.inner.allow_external,
        ))
    }

    /// Claims a stack, runs `f` on it, and closes it again.
    ///
    /// The stack is closed even when `f` fails; `f`'s error wins over a
    /// failing close.
    ///
    /// # Errors
    ///
    /// Fails if the claim, `f`, or the close fails.
    pub fn with_stack<R>(
        &self,
        size: u64,
        label: &str,
        f: impl FnOnce(&mut VirtualStack) -> MemoryResult<R>,
    ) -> MemoryResult<R> {
        let mut stack = self.claim_stack(size, label)?;
        let outcome = f(&mut stack);
        let closed = if stack.is_closed() { Ok(()) } else { stack.close() };
        let value = outcome?;
        closed.map(|()| value)
    }

    /// Snapshot of all outstanding claims.
    #[must_use]
    pub fn summarize_claims(&self) -> ClaimSummary {
        self.inner.state.lock().claim_summary()
    }

    /// Snapshot of all free fragments.
    #[must_use]
    pub fn summarize_fragments(&self) -> FragmentSummary {
        self.inner.state.lock().fragment_summary()
    }

    /// Writes the claim summary to standard output.
    pub fn print_claims(&self) {
        println!("{}", self.summarize_claims());
    }

    /// Writes the fragment summary to standard output.
    pub fn print_fragments(&self) {
        println!("{}", self.summarize_fragments());
    }

    /// Current occupancy figures.
    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        let state = self.inner.state.lock();
        ManagerStats {
            capacity: self.inner.capacity,
            claimed_bytes: state.claims.values().map(|claim| claim.size).sum(),
            free_bytes: state.fragments.free_bytes(),
            claim_count: state.claims.len(),
            fragment_count: state.fragments.len(),
            largest_fragment: state.fragments.largest().map_or(0, |largest| largest.size),
            external_claims: state.external_claims,
        }
    }

    /// Checks that claims and fragments tile the arena without gaps or overlaps.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::FragmentInvariantViolation`] describing the
    /// first gap or overlap.
    pub fn audit(&self) -> MemoryResult<()> {
        let state = self.inner.state.lock();
        let mut ranges: Vec<(Address, u64)> = state
            .claims
            .iter()
            .map(|(&address, claim)| (address, claim.size))
            .chain(state.fragments.iter_by_address().map(|f| (f.address, f.size)))
            .collect();
        ranges.sort_unstable();

        let mut cursor = self.inner.base;
        for (address, size) in ranges {
            if address != cursor {
                return Err(MemoryError::FragmentInvariantViolation {
                    reason: format!("expected a claim or fragment at {cursor}, found one at {address}"),
                    summary: format!("{}{}", state.claim_summary(), state.fragment_summary()),
                });
            }
            cursor = Address::new(address.get() + size);
        }
        if cursor != self.inner.end() {
            return Err(MemoryError::FragmentInvariantViolation {
                reason: format!("arena ends at {}, but coverage ends at {cursor}", self.inner.end()),
                summary: format!("{}{}", state.claim_summary(), state.fragment_summary()),
            });
        }
        Ok(())
    }

    /// Verifies that every claim was released and gives the arena back.
    ///
    /// A failed close leaves the manager open.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::ClaimsStillActive`] or
    /// [`MemoryError::FragmentInvariantViolation`] (both carry the summary
    /// that is also logged), [`MemoryError::DoubleClose`] if already closed,
    /// or the error of giving the arena back.
    pub fn close(&self) -> MemoryResult<()> {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(MemoryError::DoubleClose {
                    object: "memory manager",
                    address: self.inner.base,
                });
            }
            if !state.claims.is_empty() {
                let summary = state.claim_summary().to_string();
                tracing::error!(
                    "attempted to close memory manager at {} with claims left:\n{}",
                    self.inner.base,
                    summary
                );
                return Err(MemoryError::ClaimsStillActive {
                    count: state.claims.len(),
                    summary,
                });
            }
            check_single_fragment(&state, self.inner.base, self.inner.capacity)?;
            state.closed = true;
        }
        self.inner.release_arena()?;
        tracing::info!("memory manager at {} closed", self.inner.base);
        Ok(())
    }
}

/// The close-time fragment invariant: one fragment spanning the whole arena.
fn check_single_fragment(state: &ManagerState, base: Address, capacity: u64) -> MemoryResult<()> {
    let violation = |reason: String| {
        let summary = state.fragment_summary().to_string();
        tracing::error!("invalid memory fragments at {}: {}\n{}", base, reason, summary);
        MemoryError::FragmentInvariantViolation { reason, summary }
    };
    let mut fragments = state.fragments.iter_by_address();
    let (Some(only), None) = (fragments.next(), fragments.next()) else {
        return Err(violation(format!(
            "invalid number of remaining memory fragments: {}",
            state.fragments.len()
        )));
    };
    if only.size != capacity {
        return Err(violation(format!(
            "size of memory fragment should be {capacity}, but is {}",
            only.size
        )));
    }
    if only.address != base {
        return Err(violation(format!(
            "address of memory fragment should be {base}, but is {}",
            only.address
        )));
    }
    Ok(())
}

impl Region for MemoryManager {
    /// Takes back the claim starting at `address` and merges it into the free space.
    fn free_child(&self, address: Address) -> MemoryResult<()> {
        self.inner.free_child(address)
    }
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("base", &self.inner.base)
            .field("capacity", &self.inner.capacity)
            .field("allow_external", &self.inner.allow_external)
            .field("stats", &self.stats())
            .finish()
    }
}
