//! # Manager Diagnostics
//!
//! Snapshots of a manager's claims and fragments for leak and fragmentation
//! inspection. The text format is for humans; tests look at the fields.

use std::fmt;
use std::time::{Duration, Instant};

use crate::address::Address;
use crate::manager::fragments::Fragment;

/// Bookkeeping for one outstanding claim.
#[derive(Clone, Debug)]
pub(crate) struct ClaimEntry {
    pub(crate) size: u64,
    pub(crate) claimed_at: Instant,
    pub(crate) label: String,
}

/// One outstanding claim, as seen by [`ClaimSummary`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClaimRecord {
    /// Purpose label given when claiming.
    pub label: String,
    /// First address of the claim.
    pub address: Address,
    /// Size in bytes.
    pub size: u64,
    /// Time since the claim was made.
    pub age: Duration,
}

/// All outstanding claims of a manager, in address order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClaimSummary {
    /// The claims.
    pub claims: Vec<ClaimRecord>,
}

impl ClaimSummary {
    pub(crate) fn capture<'a>(entries: impl Iterator<Item = (&'a Address, &'a ClaimEntry)>) -> Self {
        let now = Instant::now();
        Self {
            claims: entries
                .map(|(&address, entry)| ClaimRecord {
                    label: entry.label.clone(),
                    address,
                    size: entry.size,
                    age: now.saturating_duration_since(entry.claimed_at),
                })
                .collect(),
        }
    }

    /// Number of claims.
    #[must_use]
    pub fn len(&self) -> usize {
        self.claims.len()
    }

    /// Checks whether there are no claims.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    /// Sum of all claim sizes.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.claims.iter().map(|claim| claim.size).sum()
    }

    /// Finds the claim with the given label.
    #[must_use]
    pub fn find(&self, label: &str) -> Option<&ClaimRecord> {
        self.claims.iter().find(|claim| claim.label == label)
    }
}

impl fmt::Display for ClaimSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Current memory claims:")?;
        for claim in &self.claims {
            writeln!(
                f,
                "Claim {} has {} bytes at {} (held for {:?})",
                claim.label, claim.size, claim.address, claim.age
            )?;
        }
        Ok(())
    }
}

/// All free fragments of a manager.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FragmentSummary {
    /// Fragments from largest to smallest.
    pub by_size: Vec<Fragment>,
    /// Fragments from lowest to highest address.
    pub by_address: Vec<Fragment>,
}

impl FragmentSummary {
    /// Number of fragments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    /// Checks whether there are no free fragments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    /// Sum of all fragment sizes.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.by_address.iter().map(|fragment| fragment.size).sum()
    }
}

impl fmt::Display for FragmentSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Current memory fragments sorted by size:")?;
        for fragment in &self.by_size {
            writeln!(f, "Fragment of size {} at {}", fragment.size, fragment.address)?;
        }
        writeln!(f, "Current memory fragments sorted by address:")?;
        for fragment in &self.by_address {
            writeln!(f, "Fragment of size {} at {}", fragment.size, fragment.address)?;
        }
        Ok(())
    }
}

/// Occupancy figures of a manager.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ManagerStats {
    /// Arena size in bytes.
    pub capacity: u64,
    /// Bytes held by claims inside the arena.
    pub claimed_bytes: u64,
    /// Bytes in free fragments.
    pub free_bytes: u64,
    /// Number of claims inside the arena.
    pub claim_count: usize,
    /// Number of free fragments.
    pub fragment_count: usize,
    /// Size of the largest free fragment.
    pub largest_fragment: u64,
    /// Live claims that were served by the raw allocator.
    pub external_claims: usize,
}
