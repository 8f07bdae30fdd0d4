//! # Soak Driver
//!
//! One run goes through four phases:
//!
//! 1. Create the manager (no external memory) and warm it up with a tiny stack
//! 2. Sanity check: push a byte and an int, pop them back
//! 3. Claim all stacks up front, then pick them in random order, fill each
//!    with random values and raw jumps, pop everything back and close it
//! 4. Close the manager and check that the heap is empty again
//!
//! Floats are generated from random bit patterns (NaNs included) and
//! compared bit for bit.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use vulko_memory::{Address, MemoryManager, RawAllocator, VirtualStack};

use crate::config::{SoakConfig, MAX_JUMP};
use crate::error::{SoakError, SoakResult};

/// Byte pushed by the sanity check.
const CHECK_BYTE: i8 = 120;
/// Int pushed by the sanity check.
const CHECK_INT: i32 = 2_000_000_000;

/// Outcome of a successful soak run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SoakReport {
    /// Number of stacks exercised.
    pub stacks: usize,
    /// Number of values pushed and popped, jumps included.
    pub values: u64,
    /// Bytes pushed over all stacks.
    pub bytes_pushed: u64,
    /// Time to create the manager and claim the warm-up stack.
    pub warmup: Duration,
    /// Time to claim all stacks.
    pub claim_time: Duration,
    /// Total time spent pushing and popping.
    pub push_pop_time: Duration,
}

impl SoakReport {
    /// Average push and pop time per stack.
    #[must_use]
    pub fn average_push_pop(&self) -> Duration {
        u32::try_from(self.stacks)
            .ok()
            .filter(|&stacks| stacks > 0)
            .map_or(Duration::ZERO, |stacks| self.push_pop_time / stacks)
    }
}

impl fmt::Display for SoakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Claiming memory took {:?}", self.warmup)?;
        writeln!(f, "Claiming {} stacks took {:?}", self.stacks, self.claim_time)?;
        writeln!(f, "Pushed and popped {} values ({} bytes)", self.values, self.bytes_pushed)?;
        write!(f, "Pushing and popping took {:?} per stack on average", self.average_push_pop())
    }
}

/// Random values for one stack, one vector per primitive type.
struct Frame {
    bytes: Vec<i8>,
    shorts: Vec<i16>,
    chars: Vec<u16>,
    ints: Vec<i32>,
    floats: Vec<u32>,
    longs: Vec<i64>,
    doubles: Vec<u64>,
    jumps: Vec<u64>,
}

impl Frame {
    fn random(rng: &mut StdRng, count: usize) -> Self {
        Self {
            bytes: (0..count).map(|_| rng.gen()).collect(),
            shorts: (0..count).map(|_| rng.gen()).collect(),
            chars: (0..count).map(|_| rng.gen()).collect(),
            ints: (0..count).map(|_| rng.gen()).collect(),
            floats: (0..count).map(|_| rng.gen()).collect(),
            longs: (0..count).map(|_| rng.gen()).collect(),
            doubles: (0..count).map(|_| rng.gen()).collect(),
            jumps: (0..count).map(|_| rng.gen_range(0..MAX_JUMP)).collect(),
        }
    }

    fn values(&self) -> u64 {
        8 * self.bytes.len() as u64
    }

    fn bytes(&self) -> u64 {
        let primitives = self.bytes.len() as u64 * (1 + 2 + 2 + 4 + 4 + 8 + 8);
        primitives + self.jumps.iter().sum::<u64>()
    }

    /// Pushes every value; returns the address of each jump.
    fn push(&self, stack: &mut VirtualStack) -> SoakResult<Vec<Address>> {
        for &value in &self.bytes {
            stack.push_i8(value)?;
        }
        for &value in &self.shorts {
            stack.push_i16(value)?;
        }
        let mut jump_addresses = Vec::with_capacity(self.jumps.len());
        for &jump in &self.jumps {
            jump_addresses.push(stack.push(jump)?);
        }
        for &value in &self.chars {
            stack.push_u16(value)?;
        }
        for &value in &self.ints {
            stack.push_i32(value)?;
        }
        for &bits in &self.floats {
            stack.push_f32(f32::from_bits(bits))?;
        }
        for &value in &self.longs {
            stack.push_i64(value)?;
        }
        for &bits in &self.doubles {
            stack.push_f64(f64::from_bits(bits))?;
        }
        Ok(jump_addresses)
    }

    /// Pops everything in reverse push order and compares it.
    fn pop_and_verify(&self, stack: &mut VirtualStack, label: &str, jump_addresses: &[Address]) -> SoakResult<()> {
        for &bits in self.doubles.iter().rev() {
            verify(label, "f64 bits", bits, stack.pop_f64()?.to_bits())?;
        }
        for &value in self.longs.iter().rev() {
            verify(label, "i64", value, stack.pop_i64()?)?;
        }
        for &bits in self.floats.iter().rev() {
            verify(label, "f32 bits", bits, stack.pop_f32()?.to_bits())?;
        }
        for &value in self.ints.iter().rev() {
            verify(label, "i32", value, stack.pop_i32()?)?;
        }
        for &value in self.chars.iter().rev() {
            verify(label, "u16", value, stack.pop_u16()?)?;
        }
        for (&jump, &address) in self.jumps.iter().zip(jump_addresses).rev() {
            verify(label, "jump address", address, stack.pop(jump)?)?;
        }
        for &value in self.shorts.iter().rev() {
            verify(label, "i16", value, stack.pop_i16()?)?;
        }
        for &value in self.bytes.iter().rev() {
            verify(label, "i8", value, stack.pop_i8()?)?;
        }
        Ok(())
    }
}

fn verify<T: PartialEq + fmt::Display>(stack: &str, kind: &'static str, expected: T, actual: T) -> SoakResult<()> {
    if expected == actual {
        return Ok(());
    }
    Err(SoakError::Mismatch {
        stack: stack.to_string(),
        kind,
        expected: expected.to_string(),
        actual: actual.to_string(),
    })
}

/// Pushes a byte and an int on a small stack and pops them back.
fn sanity_check(manager: &MemoryManager) -> SoakResult<()> {
    let label = "test stack";
    let mut stack = manager.claim_stack(1000, label)?;
    stack.push_i8(CHECK_BYTE)?;
    stack.push_i32(CHECK_INT)?;
    tracing::debug!("{}", manager.summarize_claims());
    tracing::debug!("{}", manager.summarize_fragments());
    verify(label, "i32", CHECK_INT, stack.pop_i32()?)?;
    verify(label, "i8", CHECK_BYTE, stack.pop_i8()?)?;
    stack.close_exact()?;
    Ok(())
}

/// Runs one soak pass.
///
/// # Errors
///
/// Returns [`SoakError::InvalidConfig`] for an invalid `config`,
/// [`SoakError::Memory`] for any fault of the memory subsystem (including a
/// manager that doesn't close cleanly), [`SoakError::Mismatch`] if a popped
/// value differs from the pushed one, and [`SoakError::Leak`] if heap blocks
/// survive the run.
pub fn run(config: &SoakConfig) -> SoakResult<SoakReport> {
    config.validate()?;
    let mut rng = StdRng::seed_from_u64(config.seed);
    let heap = Arc::new(RawAllocator::new());

    tracing::info!("allocating {} bytes", config.arena_capacity);
    let started = Instant::now();
    let manager = MemoryManager::new(Arc::clone(&heap), config.arena_capacity, false)?;
    manager.claim_stack(10, "force init")?.close()?;
    let warmup = started.elapsed();

    sanity_check(&manager)?;
    tracing::info!("sanity check passed");

    let started = Instant::now();
    let mut stacks = Vec::with_capacity(config.stacks);
    for index in 0..config.stacks {
        let size = config.min_stack_size + rng.gen_range(0..config.min_stack_size);
        let label = format!("test stack {index}");
        stacks.push((manager.claim_stack(size, &label)?, label));
    }
    let claim_time = started.elapsed();
    tracing::info!("claimed {} stacks in {:?}", config.stacks, claim_time);

    let mut push_pop_time = Duration::ZERO;
    let mut values = 0;
    let mut bytes_pushed = 0;
    while !stacks.is_empty() {
        let (mut stack, label) = stacks.swap_remove(rng.gen_range(0..stacks.len()));
        let frame = Frame::random(&mut rng, config.primitives);

        let started = Instant::now();
        let jump_addresses = frame.push(&mut stack)?;
        frame.pop_and_verify(&mut stack, &label, &jump_addresses)?;
        push_pop_time += started.elapsed();

        stack.close_exact()?;
        values += frame.values();
        bytes_pushed += frame.bytes();
    }

    tracing::debug!("{}", manager.summarize_fragments());
    manager.close()?;
    drop(manager);

    let blocks = heap.live_blocks();
    if blocks > 0 {
        return Err(SoakError::Leak { blocks });
    }
    tracing::info!("closed manager");

    Ok(SoakReport {
        stacks: config.stacks,
        values,
        bytes_pushed,
        warmup,
        claim_time,
        push_pop_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_stack(heap: &Arc<RawAllocator>, capacity: u64) -> (MemoryManager, VirtualStack) {
        let manager = MemoryManager::new(Arc::clone(heap), capacity * 2, false).unwrap();
        let stack = manager.claim_stack(capacity, "frame").unwrap();
        (manager, stack)
    }

    #[test]
    fn test_frame_round_trip() {
        let heap = Arc::new(RawAllocator::new());
        let (_manager, mut stack) = small_stack(&heap, 4096);
        let mut rng = StdRng::seed_from_u64(3);
        let frame = Frame::random(&mut rng, 20);

        let jumps = frame.push(&mut stack).unwrap();
        assert_eq!(stack.used(), frame.bytes());
        frame.pop_and_verify(&mut stack, "frame", &jumps).unwrap();
        assert_eq!(stack.used(), 0);
        assert_eq!(frame.values(), 160);
    }

    #[test]
    fn test_frame_detects_corruption() {
        let heap = Arc::new(RawAllocator::new());
        let (_manager, mut stack) = small_stack(&heap, 4096);
        let mut rng = StdRng::seed_from_u64(11);
        let mut frame = Frame::random(&mut rng, 4);
        frame.doubles = vec![1, 2, 3, 4];

        let jumps = frame.push(&mut stack).unwrap();
        // Overwrite the last double on the stack.
        let last = stack.stack_pointer().checked_sub(8).unwrap();
        heap.put(last, f64::from_bits(99)).unwrap();

        let error = frame.pop_and_verify(&mut stack, "frame", &jumps).unwrap_err();
        assert_eq!(
            error,
            SoakError::Mismatch {
                stack: "frame".to_string(),
                kind: "f64 bits",
                expected: "4".to_string(),
                actual: "99".to_string(),
            }
        );
    }

    #[test]
    fn test_average_push_pop() {
        let report = SoakReport {
            stacks: 4,
            values: 0,
            bytes_pushed: 0,
            warmup: Duration::ZERO,
            claim_time: Duration::ZERO,
            push_pop_time: Duration::from_micros(400),
        };
        assert_eq!(report.average_push_pop(), Duration::from_micros(100));
        let empty = SoakReport { stacks: 0, ..report };
        assert_eq!(empty.average_push_pop(), Duration::ZERO);
    }
}
