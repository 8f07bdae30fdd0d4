//! # Virtual Stack
//!
//! A stack-discipline sub-allocator carved out of a parent region.
//!
//! ```text
//!  start_address          stack_pointer              bound_address
//!  ┌──────────────────────┬──────────────────────────┐
//!  │ pushed data (in use) │        free space        │
//!  └──────────────────────┴──────────────────────────┘
//! ```
//!
//! Pushing reserves bytes at the stack pointer, popping gives them back. A
//! stack is a [`Region`] too: chunks and child stacks can be pushed onto it,
//! and releasing them rewinds the stack pointer to where they started.
//!
//! ## Thread Safety
//!
//! A virtual stack has a single owner. It is neither `Send` nor `Sync`, since
//! rewinding to an address is only meaningful in one strict order.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;

use bytemuck::Pod;

use crate::address::Address;
use crate::chunk::MemoryChunk;
use crate::error::{MemoryError, MemoryResult};
use crate::raw::RawAllocator;
use crate::region::{Lender, Region};

/// State shared between a stack and the leases pushed onto it.
struct StackInner {
    /// Region this stack was lent from.
    lender: Lender,
    /// Lowest address of the stack.
    start: Address,
    /// One past the highest address of the stack.
    bound: Address,
    /// Next free address.
    pointer: Cell<Address>,
    /// Whether the stack was given back to its lender.
    closed: Cell<bool>,
}

impl StackInner {
    fn ensure_open(&self) -> MemoryResult<()> {
        if self.closed.get() {
            return Err(MemoryError::UseAfterClose {
                object: "virtual stack",
                address: self.start,
            });
        }
        Ok(())
    }
}

impl Region for StackInner {
    /// Rewinds the stack pointer to `address`.
    ///
    /// Whether `address` really is the start of an earlier push is not
    /// checked: children must be released in the reverse order of their
    /// claims.
    fn free_child(&self, address: Address) -> MemoryResult<()> {
        self.ensure_open()?;
        if address < self.start {
            return Err(MemoryError::InvalidArgument(format!(
                "child address {address} is smaller than the start address {}",
                self.start
            )));
        }
        let pointer = self.pointer.get();
        if address > pointer {
            return Err(MemoryError::InvalidArgument(format!(
                "child address {address} is larger than the stack pointer {pointer}"
            )));
        }
        self.pointer.set(address);
        tracing::trace!("stack at {} rewound to {}", self.start, address);
        Ok(())
    }
}

/// A stack-discipline sub-allocator.
///
/// # Example
///
/// ```rust,ignore
/// let mut stack = manager.claim_stack(1000, "vertex scratch")?;
/// stack.push_i8(120)?;
/// stack.push_i32(2_000_000_000)?;
/// assert_eq!(stack.pop_i32()?, 2_000_000_000);
/// assert_eq!(stack.pop_i8()?, 120);
/// stack.close_exact()?;
/// ```
pub struct VirtualStack {
    inner: Rc<StackInner>,
    heap: Arc<RawAllocator>,
}

/// Generates the typed push/pop pairs.
macro_rules! typed_stack_ops {
    ($($push:ident, $pop:ident, $ty:ty;)*) => {
        $(
            #[doc = concat!("Pushes a `", stringify!($ty), "`.")]
            ///
            /// # Errors
            ///
            /// See [`push_value`](Self::push_value).
            #[inline]
            pub fn $push(&mut self, value: $ty) -> MemoryResult<()> {
                self.push_value(value)
            }

            #[doc = concat!("Pops a `", stringify!($ty), "`.")]
            ///
            /// # Errors
            ///
            /// See [`pop_value`](Self::pop_value).
            #[inline]
            pub fn $pop(&mut self) -> MemoryResult<$ty> {
                self.pop_value()
            }
        )*
    };
}

impl VirtualStack {
    /// Wraps an already-lent range as a stack. No memory is allocated here.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidArgument`] if `start` is null or the
    /// range runs past the end of the address space.
    pub fn new(lender: Lender, heap: Arc<RawAllocator>, start: Address, capacity: u64) -> MemoryResult<Self> {
        if start.is_null() {
            return Err(MemoryError::InvalidArgument("start address must not be 0".to_string()));
        }
        let bound = start.checked_add(capacity).ok_or_else(|| {
            MemoryError::InvalidArgument(format!(
                "stack of {capacity} bytes at {start} exceeds the address space"
            ))
        })?;
        Ok(Self {
            inner: Rc::new(StackInner {
                lender,
                start,
                bound,
                pointer: Cell::new(start),
                closed: Cell::new(false),
            }),
            heap,
        })
    }

    /// Returns the lowest address of the stack.
    #[inline]
    #[must_use]
    pub fn start_address(&self) -> Address {
        self.inner.start
    }

    /// Returns one past the highest address of the stack.
    #[inline]
    #[must_use]
    pub fn bound_address(&self) -> Address {
        self.inner.bound
    }

    /// Returns the next free address.
    #[inline]
    #[must_use]
    pub fn stack_pointer(&self) -> Address {
        self.inner.pointer.get()
    }

    /// Returns the capacity in bytes.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.inner.bound.get() - self.inner.start.get()
    }

    /// Returns the number of pushed bytes.
    #[inline]
    #[must_use]
    pub fn used(&self) -> u64 {
        self.stack_pointer().get() - self.inner.start.get()
    }

    /// Returns the number of bytes that can still be pushed.
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.inner.bound.get() - self.stack_pointer().get()
    }

    /// Checks whether the stack has been closed.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Returns the allocator that backs the stack's bytes.
    #[inline]
    #[must_use]
    pub fn heap(&self) -> &Arc<RawAllocator> {
        &self.heap
    }

    /// Reserves `num_bytes` bytes and returns the address of the reservation.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::StackOverflow`] if the bytes don't fit, or
    /// [`MemoryError::UseAfterClose`] on a closed stack.
    pub fn push(&mut self, num_bytes: u64) -> MemoryResult<Address> {
        self.inner.ensure_open()?;
        let pointer = self.inner.pointer.get();
        let bound = self.inner.bound;
        let next = pointer
            .checked_add(num_bytes)
            .filter(|next| *next <= bound)
            .ok_or(MemoryError::StackOverflow {
                pointer,
                requested: num_bytes,
                bound,
            })?;
        self.inner.pointer.set(next);
        Ok(pointer)
    }

    /// Gives back the last `num_bytes` pushed bytes and returns the new stack pointer.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::StackUnderflow`] if fewer bytes were pushed, or
    /// [`MemoryError::UseAfterClose`] on a closed stack.
    pub fn pop(&mut self, num_bytes: u64) -> MemoryResult<Address> {
        self.inner.ensure_open()?;
        let pointer = self.inner.pointer.get();
        let start = self.inner.start;
        let next = pointer
            .checked_sub(num_bytes)
            .filter(|next| *next >= start)
            .ok_or(MemoryError::StackUnderflow {
                pointer,
                requested: num_bytes,
                start,
            })?;
        self.inner.pointer.set(next);
        Ok(next)
    }

    /// Pushes a plain value in host-native byte layout.
    ///
    /// # Errors
    ///
    /// Fails like [`push`](Self::push), or with [`MemoryError::UnmappedAccess`]
    /// if the stack's range is not backed by the heap. The push is undone on
    /// a failed write.
    pub fn push_value<T: Pod>(&mut self, value: T) -> MemoryResult<()> {
        let address = self.push(std::mem::size_of::<T>() as u64)?;
        if let Err(error) = self.heap.put(address, value) {
            self.inner.pointer.set(address);
            return Err(error);
        }
        Ok(())
    }

    /// Pops a plain value in host-native byte layout.
    ///
    /// # Errors
    ///
    /// Fails like [`pop`](Self::pop), or with [`MemoryError::UnmappedAccess`]
    /// if the stack's range is not backed by the heap.
    pub fn pop_value<T: Pod>(&mut self) -> MemoryResult<T> {
        let address = self.pop(std::mem::size_of::<T>() as u64)?;
        self.heap.get(address)
    }

    typed_stack_ops! {
        push_i8, pop_i8, i8;
        push_u8, pop_u8, u8;
        push_i16, pop_i16, i16;
        push_u16, pop_u16, u16;
        push_i32, pop_i32, i32;
        push_u32, pop_u32, u32;
        push_f32, pop_f32, f32;
        push_i64, pop_i64, i64;
        push_u64, pop_u64, u64;
        push_f64, pop_f64, f64;
    }

    /// Returns a handle through which leases rewind this stack.
    #[must_use]
    pub fn as_lender(&self) -> Lender {
        Lender::Local(self.inner.clone())
    }

    /// Pushes `num_bytes` bytes and hands them out as a chunk owned by this stack.
    ///
    /// # Errors
    ///
    /// Fails like [`push`](Self::push).
    pub fn push_for_chunk(&mut self, num_bytes: u64) -> MemoryResult<MemoryChunk> {
        let address = self.push(num_bytes)?;
        MemoryChunk::new(self.as_lender(), address, num_bytes)
    }

    /// Pushes `num_bytes` bytes and hands them out as a nested stack.
    ///
    /// # Errors
    ///
    /// Fails like [`push`](Self::push).
    pub fn push_for_child_stack(&mut self, num_bytes: u64) -> MemoryResult<VirtualStack> {
        let address = self.push(num_bytes)?;
        VirtualStack::new(self.as_lender(), Arc::clone(&self.heap), address, num_bytes)
    }

    /// Hands out all remaining space as a nested stack.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::UseAfterClose`] on a closed stack.
    pub fn push_remaining_for_child_stack(&mut self) -> MemoryResult<VirtualStack> {
        self.push_for_child_stack(self.remaining())
    }

    /// Gives the whole range back to the lender, whatever is still pushed.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::DoubleClose`] if the stack was already closed,
    /// or the lender's error.
    pub fn close(&mut self) -> MemoryResult<()> {
        if self.inner.closed.get() {
            return Err(MemoryError::DoubleClose {
                object: "virtual stack",
                address: self.inner.start,
            });
        }
        self.inner.closed.set(true);
        self.inner.lender.free_child(self.inner.start)
    }

    /// Like [`close`](Self::close), but only if every push was popped.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::UnbalancedStack`] when pushed data remains; the
    /// stack stays open in that case.
    pub fn close_exact(&mut self) -> MemoryResult<()> {
        if !self.inner.closed.get() {
            let pointer = self.inner.pointer.get();
            if pointer != self.inner.start {
                return Err(MemoryError::UnbalancedStack {
                    pointer,
                    start: self.inner.start,
                });
            }
        }
        self.close()
    }
}

impl Region for VirtualStack {
    /// Rewinds the stack pointer to `address`.
    fn free_child(&self, address: Address) -> MemoryResult<()> {
        self.inner.free_child(address)
    }
}

impl Drop for VirtualStack {
    fn drop(&mut self) {
        if !self.inner.closed.get() {
            if let Err(error) = self.close() {
                tracing::warn!("dropping virtual stack at {} failed to close: {}", self.inner.start, error);
            }
        }
    }
}

impl std::fmt::Debug for VirtualStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualStack")
            .field("start", &self.inner.start)
            .field("bound", &self.inner.bound)
            .field("pointer", &self.inner.pointer.get())
            .field("closed", &self.inner.closed.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::testing::recording_lender;

    fn heap_stack(capacity: u64) -> (Arc<RawAllocator>, Address, VirtualStack) {
        let heap = Arc::new(RawAllocator::new());
        let address = heap.allocate(capacity).unwrap();
        let (_, lender) = recording_lender();
        let stack = VirtualStack::new(lender, Arc::clone(&heap), address, capacity).unwrap();
        (heap, address, stack)
    }

    fn check_good_constructor(start: u64, capacity: u64) {
        let (_, lender) = recording_lender();
        let stack = VirtualStack::new(lender, Arc::new(RawAllocator::new()), Address::new(start), capacity).unwrap();
        assert_eq!(stack.start_address(), Address::new(start));
        assert_eq!(stack.bound_address(), Address::new(start + capacity));
        assert_eq!(stack.stack_pointer(), Address::new(start));
        assert_eq!(stack.capacity(), capacity);
    }

    fn check_bad_constructor(start: u64, capacity: u64) {
        let (_, lender) = recording_lender();
        assert!(matches!(
            VirtualStack::new(lender, Arc::new(RawAllocator::new()), Address::new(start), capacity),
            Err(MemoryError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_constructor() {
        // Edge cases
        check_good_constructor(1, 10);
        check_good_constructor(123, 0);
        check_good_constructor(321, 1);
        check_good_constructor(u64::MAX - 10, 10);
        // Normal cases
        check_good_constructor(83473, 347);
        // Bad cases
        check_bad_constructor(0, 1234);
        check_bad_constructor(u64::MAX - 10, 11);
    }

    #[test]
    fn test_close() {
        let (region, lender) = recording_lender();
        let mut stack = VirtualStack::new(lender, Arc::new(RawAllocator::new()), Address::new(123), 100).unwrap();
        assert!(!stack.is_closed());
        assert_eq!(region.last_freed(), None);

        stack.close().unwrap();
        assert!(stack.is_closed());
        assert_eq!(region.last_freed(), Some(Address::new(123)));

        assert_eq!(
            stack.close(),
            Err(MemoryError::DoubleClose { object: "virtual stack", address: Address::new(123) })
        );
        assert_eq!(
            stack.close_exact(),
            Err(MemoryError::DoubleClose { object: "virtual stack", address: Address::new(123) })
        );
        assert_eq!(region.freed_count(), 1);
    }

    #[test]
    fn test_close_exact() {
        let heap = Arc::new(RawAllocator::new());
        let address = heap.allocate(4).unwrap();
        let (region, lender) = recording_lender();
        let mut stack = VirtualStack::new(lender, Arc::clone(&heap), address, 4).unwrap();

        stack.push_i32(12).unwrap();
        assert_eq!(
            stack.close_exact(),
            Err(MemoryError::UnbalancedStack {
                pointer: address.checked_add(4).unwrap(),
                start: address,
            })
        );
        // The close was aborted before any action was taken
        assert_eq!(region.last_freed(), None);
        assert!(!stack.is_closed());

        assert_eq!(stack.pop_i32().unwrap(), 12);
        stack.close_exact().unwrap();
        assert!(stack.is_closed());
        assert_eq!(region.last_freed(), Some(address));

        heap.release(address).unwrap();
    }

    #[test]
    fn test_overflow_and_underflow() {
        let (_heap, address, mut stack) = heap_stack(10);
        assert_eq!(stack.push(6).unwrap(), address);
        assert_eq!(
            stack.push(5),
            Err(MemoryError::StackOverflow {
                pointer: address.checked_add(6).unwrap(),
                requested: 5,
                bound: address.checked_add(10).unwrap(),
            })
        );
        // A failed push leaves the pointer untouched
        assert_eq!(stack.used(), 6);
        assert_eq!(stack.push(4).unwrap(), address.checked_add(6).unwrap());
        assert_eq!(stack.remaining(), 0);
        assert!(matches!(stack.push(u64::MAX), Err(MemoryError::StackOverflow { .. })));

        assert_eq!(stack.pop(4).unwrap(), address.checked_add(6).unwrap());
        assert_eq!(
            stack.pop(7),
            Err(MemoryError::StackUnderflow {
                pointer: address.checked_add(6).unwrap(),
                requested: 7,
                start: address,
            })
        );
        assert_eq!(stack.pop(6).unwrap(), address);
        stack.close_exact().unwrap();
    }

    #[test]
    fn test_use_after_close() {
        let (_heap, address, mut stack) = heap_stack(16);
        stack.close().unwrap();
        let closed = MemoryError::UseAfterClose { object: "virtual stack", address };
        assert_eq!(stack.push(1), Err(closed.clone()));
        assert_eq!(stack.pop(0), Err(closed.clone()));
        assert_eq!(stack.pop_u8(), Err(closed.clone()));
        assert!(matches!(stack.push_for_chunk(1), Err(MemoryError::UseAfterClose { .. })));
        assert!(matches!(stack.push_remaining_for_child_stack(), Err(MemoryError::UseAfterClose { .. })));
        assert_eq!(stack.inner.free_child(address), Err(closed));
    }

    #[test]
    fn test_primitives() {
        let (_heap, _address, mut stack) = heap_stack(64);
        stack.push_i8(120).unwrap();
        stack.push_i32(2_000_000_000).unwrap();
        stack.push_u16(0xBEEF).unwrap();
        stack.push_f64(std::f64::consts::PI).unwrap();
        stack.push_f32(f32::from_bits(0x7FC0_1234)).unwrap();
        stack.push_i64(i64::MIN).unwrap();
        assert_eq!(stack.used(), 1 + 4 + 2 + 8 + 4 + 8);

        assert_eq!(stack.pop_i64().unwrap(), i64::MIN);
        assert_eq!(stack.pop_f32().unwrap().to_bits(), 0x7FC0_1234);
        assert_eq!(stack.pop_f64().unwrap().to_bits(), std::f64::consts::PI.to_bits());
        assert_eq!(stack.pop_u16().unwrap(), 0xBEEF);
        assert_eq!(stack.pop_i32().unwrap(), 2_000_000_000);
        assert_eq!(stack.pop_i8().unwrap(), 120);
        stack.close_exact().unwrap();
    }

    #[test]
    fn test_failed_write_undoes_push() {
        // Addresses without backing bytes: pushes work, typed writes don't.
        let (_, lender) = recording_lender();
        let mut stack = VirtualStack::new(lender, Arc::new(RawAllocator::new()), Address::new(8), 16).unwrap();
        assert!(matches!(stack.push_u32(1), Err(MemoryError::UnmappedAccess { .. })));
        assert_eq!(stack.used(), 0);
    }

    #[test]
    fn test_free_child_bounds() {
        let (_heap, address, mut stack) = heap_stack(32);
        stack.push(16).unwrap();
        assert!(matches!(
            stack.inner.free_child(address.checked_sub(1).unwrap()),
            Err(MemoryError::InvalidArgument(_))
        ));
        assert!(matches!(
            stack.inner.free_child(address.checked_add(17).unwrap()),
            Err(MemoryError::InvalidArgument(_))
        ));
        stack.inner.free_child(address.checked_add(4).unwrap()).unwrap();
        assert_eq!(stack.used(), 4);
    }

    #[test]
    fn test_chunks_and_child_stacks() {
        let (_heap, address, mut stack) = heap_stack(100);
        stack.push_u32(7).unwrap();

        let mut chunk = stack.push_for_chunk(16).unwrap();
        assert_eq!(chunk.address(), address.checked_add(4).unwrap());
        assert_eq!(stack.used(), 20);
        chunk.release().unwrap();
        assert_eq!(stack.used(), 4);

        let mut child = stack.push_remaining_for_child_stack().unwrap();
        assert_eq!(child.start_address(), address.checked_add(4).unwrap());
        assert_eq!(child.capacity(), 96);
        assert_eq!(stack.remaining(), 0);

        let mut grandchild = child.push_for_child_stack(10).unwrap();
        grandchild.push_u64(99).unwrap();
        assert_eq!(grandchild.pop_u64().unwrap(), 99);
        grandchild.close_exact().unwrap();
        assert_eq!(child.used(), 0);

        child.close().unwrap();
        assert_eq!(stack.used(), 4);
        assert_eq!(stack.pop_u32().unwrap(), 7);
        stack.close_exact().unwrap();
    }

    #[test]
    fn test_drop_closes() {
        let (_heap, address, mut stack) = heap_stack(64);
        {
            let _chunk = stack.push_for_chunk(8).unwrap();
            let mut child = stack.push_for_child_stack(8).unwrap();
            child.push_u8(1).unwrap();
            // child is dropped first, then the chunk
        }
        assert_eq!(stack.stack_pointer(), address);

        let (region, lender) = recording_lender();
        {
            let _scoped = VirtualStack::new(lender, Arc::new(RawAllocator::new()), Address::new(42), 8).unwrap();
        }
        assert_eq!(region.last_freed(), Some(Address::new(42)));
    }
}
