// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Atlas Project Contributors

//! The crate-wide error family (of the design).
//!
//! `OutOfMemory` is conspicuously absent as a variant: VM-layer failures are
//! fatal at the call site (`atlas-alloc`'s VM primitives `panic!` directly)
//! rather than returned, matching the source's "fatal, not `Result`-wrapped"
//! propagation policy. Every other kind here is recoverable.

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// The crate-wide error family.
///
/// Every variant maps to one of the six recoverable error kinds in the
/// design's error-handling section; `OutOfMemory` is deliberately not a
/// variant (see module docs).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed cache file, bad magic, wrong platform, mapping mismatch, CRC
    /// failure, or PVLE underflow.
    #[error("invalid data: {reason}")]
    Invalid { reason: &'static str },

    /// A read from the target process returned inconsistent data; the caller
    /// retries once at the same address before giving up.
    #[error("target process mutated underfoot at {address:#x}")]
    TargetMutation { address: u64 },

    /// A file or VM syscall was denied.
    #[error("permission denied: {0}")]
    Permission(String),

    /// A file could not be found; `atlas-process` falls back to VM-walk
    /// synthesis when this is returned while reading a target's dyld-info.
    #[error("not found: {0}")]
    NotFound(String),

    /// A notification message arrived with an unexpected size or id.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// An underlying OS call failed in a way not covered by the kinds above.
    #[error("system call failed: {0}")]
    System(#[from] std::io::Error),

    /// A generic failure, used where the source only distinguishes
    /// "succeeded" from "failed" without a specific error kind (e.g.
    /// `Process::get_snapshot`'s final deserialize failure).
    #[error("{0}")]
    Generic(String),
}

impl Error {
    #[must_use]
    pub fn invalid(reason: &'static str) -> Self {
        Self::Invalid { reason }
    }

    #[must_use]
    pub fn permission(message: impl Into<String>) -> Self {
        Self::Permission(message.into())
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    #[must_use]
    pub fn generic(message: impl Into<String>) -> Self {
        Self::Generic(message.into())
    }
}
