//! # Addresses
//!
//! Memory handed out by this crate is identified by opaque integer handles
//! instead of pointers. Only the [`RawAllocator`](crate::RawAllocator) knows
//! which bytes live behind an address.

use std::fmt;

/// An opaque memory address.
///
/// Addresses are plain integers. Arithmetic on them is checked; nothing in
/// this crate ever turns an `Address` into a pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Address(u64);

impl Address {
    /// The null address. Never returned by an allocation.
    pub const NULL: Self = Self(0);

    /// Creates an address from its raw value.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Checks if this is the null address.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns `self + bytes`, or `None` on overflow.
    #[inline]
    #[must_use]
    pub const fn checked_add(self, bytes: u64) -> Option<Self> {
        match self.0.checked_add(bytes) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }

    /// Returns `self - bytes`, or `None` on underflow.
    #[inline]
    #[must_use]
    pub const fn checked_sub(self, bytes: u64) -> Option<Self> {
        match self.0.checked_sub(bytes) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }

    /// Number of bytes from `origin` up to `self`, or `None` if `self` lies below `origin`.
    #[inline]
    #[must_use]
    pub const fn offset_from(self, origin: Self) -> Option<u64> {
        self.0.checked_sub(origin.0)
    }
}

impl Default for Address {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for Address {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null() {
        assert!(Address::NULL.is_null());
        assert!(Address::default().is_null());
        assert!(!Address::new(1).is_null());
    }

    #[test]
    fn test_checked_arithmetic() {
        let address = Address::new(100);
        assert_eq!(address.checked_add(28), Some(Address::new(128)));
        assert_eq!(address.checked_sub(100), Some(Address::NULL));
        assert_eq!(address.checked_sub(101), None);
        assert_eq!(Address::new(u64::MAX).checked_add(1), None);
        assert_eq!(Address::new(150).offset_from(address), Some(50));
        assert_eq!(address.offset_from(Address::new(150)), None);
    }

    #[test]
    fn test_display_is_hex() {
        assert_eq!(Address::new(255).to_string(), "0xff");
    }
}
