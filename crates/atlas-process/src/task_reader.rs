// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Atlas Project Contributors

//! [`TaskReader`]: the target-task interface `Process` is built against
//! (steps 1-2, region walk, notification registration), grounded on
//! `ProcessAtlas.cpp`'s direct `task_info`/
//! `mach_vm_region`/`mach_vm_read_overwrite`/`task_dyld_process_info_notify_register`
//! calls.
//!
//! Rust rework: the source reaches for these mach syscalls inline inside
//! `Process::getSnapshot`/`synthesizeSnapshot`/`setupNotifications`. Here
//! they're behind a trait so the retry/diff/dispatch logic in [`crate::process`]
//! is host-testable against a mock, the same separation
//! `rust-minidump-minidump-writer` draws between its crash-context reader and
//! its module-list walker.

use atlas_core::Result;

/// One readable+executable VM region of the target, as produced by a
/// region-walk (`synthesize_snapshot`, "for each executable-readable
/// region").
pub struct ExecutableRegion<'a> {
    pub address: u64,
    pub content: &'a [u8],
}

/// One event delivered by a [`NotificationChannel`] ("Notification
/// registration").
pub enum NotificationEvent {
    /// `DYLD_REMOTE_EVENT_ATLAS_CHANGED`: re-acquire the snapshot and diff.
    AtlasChanged,
    /// Any other documented dyld-process-info event id: dispatch as-is.
    Other(u32),
    /// `MACH_NOTIFY_NO_SENDERS`, already validated as having come from the
    /// kernel: tear the channel down.
    NoSenders,
}

/// A live registration with the target's dyld-info notify endpoint. Yields
/// one [`NotificationEvent`] per call to [`NotificationChannel::recv`] until
/// the channel is torn down, at which point `recv` returns `Ok(None)`.
pub trait NotificationChannel: Send {
    fn recv(&mut self) -> Result<Option<NotificationEvent>>;
}

/// The target-task interface `Process` needs: reading out-of-process memory,
/// locating the compact-info buffer, walking VM regions, and registering for
/// dyld-info notifications.
pub trait TaskReader: Send + Sync {
    /// The out-of-process address and declared byte size of the current
    /// compact-info buffer (steps 1-2): already demultiplexed from the
    /// `dyld_all_image_infos` 32/64-bit format and with pointer-tag bits
    /// cleared from the address. `size == 0` means dyld has not published
    /// compact info yet, and the caller should fall back to
    /// [`crate::process::Process::synthesize_snapshot`].
    fn compact_info_region(&self) -> Result<(u64, u64)>;

    /// Reads `size` bytes from the target's address space starting at
    /// `address`.
    fn read(&self, address: u64, size: u64) -> Result<Vec<u8>>;

    /// Invokes `f` for every readable+executable VM region of the target, in
    /// ascending address order, passing its content already read. Stops
    /// early if `f` returns `false`.
    fn for_each_executable_region(&self, f: &mut dyn FnMut(ExecutableRegion<'_>) -> bool) -> Result<()>;

    /// Resolves the file path backing the region starting at `address`
    /// (macOS: `proc_regionfilename`).
    fn path_for_region(&self, address: u64) -> Option<String>;

    /// Registers for dyld-process-info notifications on the target task,
    /// returning a channel that yields events until torn down.
    fn register_notifications(&self) -> Result<Box<dyn NotificationChannel>>;
}
