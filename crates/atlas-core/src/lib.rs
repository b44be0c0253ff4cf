// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Atlas Project Contributors

//! Shared primitive types used across the Atlas workspace.
//!
//! A small, dependency-light crate of newtypes and trait seams that every
//! other crate in the workspace depends on, so that no two crates invent
//! their own incompatible `Address`.
//!
//! # Modules
//!
//! - [`address`]: a page- and granule-aware virtual address newtype.
//! - [`uuid`]: a 16-byte UUID used for image and shared-cache identity.
//! - [`error`]: the crate-wide [`Error`] family and [`Result`] alias.
//! - [`node_source`]: the [`NodeSource`] trait seam that lets `atlas-collections`'s
//!   B+Tree stay agnostic of whether node storage comes from the process-global
//!   allocator or a self-hosted magazine.

pub mod address;
pub mod error;
pub mod node_source;
pub mod uuid;

#[cfg(test)]
mod address_test;
#[cfg(test)]
mod uuid_test;

pub use address::Address;
pub use error::{Error, Result};
pub use node_source::NodeSource;
pub use uuid::Uuid;
