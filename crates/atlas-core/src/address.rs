// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Atlas Project Contributors

//! Virtual address newtype shared by the allocator, collections, and snapshot crates.

use std::fmt;
use std::ops::{Add, Sub};

/// A virtual memory address, either in this process or in a remote target.
///
/// Kept as a bare `u64` newtype (not a pointer) because the snapshot and
/// process crates routinely hold addresses that belong to a *different*
/// process's address space, where dereferencing the bit pattern locally
/// would be unsound.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Address(u64);

impl Address {
    /// The null address.
    pub const NULL: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Interprets this address as a local pointer.
    ///
    /// # Safety
    /// Caller must ensure the address is valid in the local process's address
    /// space and satisfies `T`'s alignment and provenance requirements.
    #[inline]
    #[must_use]
    pub const unsafe fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Interprets this address as a local mutable pointer.
    ///
    /// # Safety
    /// See [`Address::as_ptr`].
    #[inline]
    #[must_use]
    pub const unsafe fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    #[inline]
    #[must_use]
    pub const fn offset(self, delta: u64) -> Self {
        Self(self.0.wrapping_add(delta))
    }

    #[inline]
    #[must_use]
    pub const fn offset_signed(self, delta: i64) -> Self {
        Self(self.0.wrapping_add_signed(delta))
    }

    /// Distance from `other` to `self`; wraps on underflow the same way the
    /// source's pointer-difference arithmetic does.
    #[inline]
    #[must_use]
    pub const fn diff(self, other: Self) -> u64 {
        self.0.wrapping_sub(other.0)
    }

    /// Rounds up to the next multiple of `alignment`.
    ///
    /// Returns `None` if `alignment` isn't a power of two.
    #[inline]
    #[must_use]
    pub const fn align_up(self, alignment: u64) -> Option<Self> {
        if !alignment.is_power_of_two() {
            return None;
        }
        let mask = alignment - 1;
        Some(Self(self.0.wrapping_add(mask) & !mask))
    }

    #[inline]
    #[must_use]
    pub const fn align_down(self, alignment: u64) -> Option<Self> {
        if !alignment.is_power_of_two() {
            return None;
        }
        let mask = alignment - 1;
        Some(Self(self.0 & !mask))
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned(self, alignment: u64) -> bool {
        alignment.is_power_of_two() && (self.0 & (alignment - 1)) == 0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:#x})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for Address {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Address> for u64 {
    fn from(value: Address) -> Self {
        value.0
    }
}

impl Add<u64> for Address {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        self.offset(rhs)
    }
}

impl Sub<u64> for Address {
    type Output = Self;

    fn sub(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_sub(rhs))
    }
}
