//! Property-based tests for the memory manager and virtual stacks.
//!
//! Uses proptest to drive random claim/release and push/pop sequences and
//! checks that the bookkeeping invariants hold after every step.

use std::sync::Arc;

use proptest::prelude::*;
use vulko_memory::{MemoryChunk, MemoryError, MemoryManager, RawAllocator};

const ARENA: u64 = 4096;

/// One step of a random manager workload.
#[derive(Clone, Debug)]
enum Step {
    /// Claim a chunk of the given size.
    Claim(u64),
    /// Release the live chunk at `index % live.len()`.
    Release(usize),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => (1u64..=600).prop_map(Step::Claim),
        2 => any::<usize>().prop_map(Step::Release),
    ]
}

/// A value pushed onto a stack, kept as its exact bits.
#[derive(Clone, Copy, Debug)]
enum Value {
    I8(i8),
    U16(u16),
    I32(i32),
    F32(u32),
    I64(i64),
    F64(u64),
    Jump(u64),
}

fn value() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i8>().prop_map(Value::I8),
        any::<u16>().prop_map(Value::U16),
        any::<i32>().prop_map(Value::I32),
        any::<u32>().prop_map(Value::F32),
        any::<i64>().prop_map(Value::I64),
        any::<u64>().prop_map(Value::F64),
        (0u64..64).prop_map(Value::Jump),
    ]
}

proptest! {
    /// Claims and fragments tile the arena after every claim and release,
    /// and releasing everything leaves one fragment spanning the arena.
    #[test]
    fn arena_is_conserved(steps in prop::collection::vec(step(), 1..80)) {
        let heap = Arc::new(RawAllocator::new());
        let manager = MemoryManager::new(Arc::clone(&heap), ARENA, false).unwrap();
        let mut live: Vec<MemoryChunk> = Vec::new();

        for step in steps {
            match step {
                Step::Claim(size) => match manager.claim_chunk(size, "random") {
                    Ok(chunk) => live.push(chunk),
                    Err(MemoryError::OutOfMemory { largest_fragment, .. }) => {
                        prop_assert!(largest_fragment < size);
                    }
                    Err(error) => return Err(TestCaseError::fail(error.to_string())),
                },
                Step::Release(index) => {
                    if !live.is_empty() {
                        let mut chunk = live.swap_remove(index % live.len());
                        chunk.release().unwrap();
                    }
                }
            }

            manager.audit().unwrap();
            let claims = manager.summarize_claims();
            let fragments = manager.summarize_fragments();
            prop_assert_eq!(claims.total_bytes() + fragments.total_bytes(), ARENA);
            prop_assert_eq!(claims.len(), live.len());

            // No two fragments are adjacent once coalescing has run.
            for pair in fragments.by_address.windows(2) {
                prop_assert!(pair[0].end() < pair[1].address);
            }
        }

        for mut chunk in live.drain(..) {
            chunk.release().unwrap();
        }
        prop_assert_eq!(manager.summarize_fragments().len(), 1);
        manager.close().unwrap();
        prop_assert_eq!(heap.live_blocks(), 0);
    }

    /// Values pop back in reverse order with identical bits, and the stack
    /// ends where it started.
    #[test]
    fn stack_is_lifo(values in prop::collection::vec(value(), 0..200)) {
        let manager = MemoryManager::new(Arc::new(RawAllocator::new()), 64 * 1024, false).unwrap();
        let mut stack = manager.claim_stack(16 * 1024, "lifo").unwrap();
        let start = stack.stack_pointer();
        let mut jumps = Vec::new();

        for value in &values {
            match *value {
                Value::I8(v) => stack.push_i8(v).unwrap(),
                Value::U16(v) => stack.push_u16(v).unwrap(),
                Value::I32(v) => stack.push_i32(v).unwrap(),
                Value::F32(bits) => stack.push_f32(f32::from_bits(bits)).unwrap(),
                Value::I64(v) => stack.push_i64(v).unwrap(),
                Value::F64(bits) => stack.push_f64(f64::from_bits(bits)).unwrap(),
                Value::Jump(n) => jumps.push(stack.push(n).unwrap()),
            }
        }

        for value in values.iter().rev() {
            match *value {
                Value::I8(v) => prop_assert_eq!(stack.pop_i8().unwrap(), v),
                Value::U16(v) => prop_assert_eq!(stack.pop_u16().unwrap(), v),
                Value::I32(v) => prop_assert_eq!(stack.pop_i32().unwrap(), v),
                Value::F32(bits) => prop_assert_eq!(stack.pop_f32().unwrap().to_bits(), bits),
                Value::I64(v) => prop_assert_eq!(stack.pop_i64().unwrap(), v),
                Value::F64(bits) => prop_assert_eq!(stack.pop_f64().unwrap().to_bits(), bits),
                Value::Jump(n) => {
                    let expected = jumps.pop().unwrap();
                    prop_assert_eq!(stack.pop(n).unwrap(), expected);
                }
            }
        }

        prop_assert_eq!(stack.stack_pointer(), start);
        stack.close_exact().unwrap();
        manager.close().unwrap();
    }

    /// Pushing past the bound or popping below the start fails and leaves
    /// the stack pointer untouched.
    #[test]
    fn stack_bounds_are_enforced(capacity in 1u64..512, pushed in 0u64..512, extra in 1u64..64) {
        let manager = MemoryManager::new(Arc::new(RawAllocator::new()), 1024, false).unwrap();
        let mut stack = manager.claim_stack(capacity, "bounds").unwrap();
        let pushed = pushed.min(capacity);
        stack.push(pushed).unwrap();
        let pointer = stack.stack_pointer();

        let overflow = stack.push(capacity - pushed + extra);
        prop_assert!(
            matches!(overflow, Err(MemoryError::StackOverflow { .. })),
            "expected overflow, got {:?}",
            overflow
        );
        prop_assert_eq!(stack.stack_pointer(), pointer);

        let underflow = stack.pop(pushed + extra);
        prop_assert!(
            matches!(underflow, Err(MemoryError::StackUnderflow { .. })),
            "expected underflow, got {:?}",
            underflow
        );
        prop_assert_eq!(stack.stack_pointer(), pointer);

        stack.pop(pushed).unwrap();
        stack.close_exact().unwrap();
        manager.close().unwrap();
    }
}
