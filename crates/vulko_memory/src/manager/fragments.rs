//! # Free Fragment Index
//!
//! Free ranges of a manager's arena, indexed twice:
//!
//! - by `(size, address)` for the best-fit search
//! - by `address` for finding the neighbours of a freed range
//!
//! Keys are immutable snapshots. Changing a fragment means removing its old
//! keys from both indexes and inserting the new ones.

use std::collections::{BTreeMap, BTreeSet};

use crate::address::Address;

/// A free, contiguous range of a manager's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fragment {
    /// First address of the range.
    pub address: Address,
    /// Size of the range in bytes.
    pub size: u64,
}

impl Fragment {
    /// Creates a fragment.
    #[inline]
    #[must_use]
    pub const fn new(address: Address, size: u64) -> Self {
        Self { address, size }
    }

    /// One past the last address of the fragment, saturating at the top of
    /// the address space.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> Address {
        Address::new(self.address.get().saturating_add(self.size))
    }
}

/// Both fragment indexes, kept in lockstep.
#[derive(Debug, Default)]
pub(crate) struct FragmentIndex {
    by_size: BTreeSet<(u64, Address)>,
    by_address: BTreeMap<Address, u64>,
}

impl FragmentIndex {
    /// Creates an index holding one fragment.
    pub(crate) fn with_fragment(fragment: Fragment) -> Self {
        let mut index = Self::default();
        index.insert(fragment);
        index
    }

    pub(crate) fn len(&self) -> usize {
        self.by_address.len()
    }

    fn insert(&mut self, fragment: Fragment) {
        self.by_size.insert((fragment.size, fragment.address));
        self.by_address.insert(fragment.address, fragment.size);
    }

    fn remove(&mut self, fragment: Fragment) {
        self.by_size.remove(&(fragment.size, fragment.address));
        self.by_address.remove(&fragment.address);
    }

    /// Smallest fragment of at least `size` bytes; equal sizes go to the lowest address.
    pub(crate) fn best_fit(&self, size: u64) -> Option<Fragment> {
        self.by_size
            .range((size, Address::NULL)..)
            .next()
            .map(|&(size, address)| Fragment::new(address, size))
    }

    /// Largest fragment, if any.
    pub(crate) fn largest(&self) -> Option<Fragment> {
        self.by_size
            .last()
            .map(|&(size, address)| Fragment::new(address, size))
    }

    /// Total number of free bytes.
    pub(crate) fn free_bytes(&self) -> u64 {
        self.by_address.values().sum()
    }

    /// Cuts `size` bytes off the front of `fragment` and returns their address.
    ///
    /// `fragment` must be in the index and at least `size` bytes large.
    pub(crate) fn take_front(&mut self, fragment: Fragment, size: u64) -> Address {
        debug_assert!(fragment.size >= size);
        self.remove(fragment);
        if fragment.size > size {
            // The rest still lies between the same neighbours.
            self.insert(Fragment::new(Address::new(fragment.address.get() + size), fragment.size - size));
        }
        fragment.address
    }

    /// Returns `freed` to the index, merging it with adjacent fragments.
    ///
    /// Returns the fragment that now contains `freed`.
    pub(crate) fn give_back(&mut self, freed: Fragment) -> Fragment {
        let before = self
            .by_address
            .range(..freed.address)
            .next_back()
            .map(|(&address, &size)| Fragment::new(address, size))
            .filter(|before| before.end() == freed.address);
        let after = self
            .by_address
            .range(freed.address..)
            .next()
            .map(|(&address, &size)| Fragment::new(address, size))
            .filter(|after| freed.end() == after.address);

        let merged = match (before, after) {
            // Both neighbours are still claimed
            (None, None) => freed,
            (Some(before), None) => {
                self.remove(before);
                Fragment::new(before.address, before.size + freed.size)
            }
            (None, Some(after)) => {
                self.remove(after);
                Fragment::new(freed.address, freed.size + after.size)
            }
            (Some(before), Some(after)) => {
                self.remove(before);
                self.remove(after);
                Fragment::new(before.address, before.size + freed.size + after.size)
            }
        };
        self.insert(merged);
        merged
    }

    /// Fragments in ascending address order.
    pub(crate) fn iter_by_address(&self) -> impl Iterator<Item = Fragment> + '_ {
        self.by_address
            .iter()
            .map(|(&address, &size)| Fragment::new(address, size))
    }

    /// Fragments in descending size order.
    pub(crate) fn iter_by_size_descending(&self) -> impl Iterator<Item = Fragment> + '_ {
        self.by_size
            .iter()
            .rev()
            .map(|&(size, address)| Fragment::new(address, size))
    }
}
