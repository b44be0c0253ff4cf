// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Atlas Project Contributors

//! Out-of-process snapshot acquisition and dyld change notifications.
//!
//! [`Process`] is the sole public entry point: it acquires a
//! [`atlas_snapshot::ProcessSnapshot`] from a target task (synthesizing one
//! by VM-region walk when dyld hasn't published compact info yet) and
//! delivers load/unload notifications to registered [`Queue`]s. The target
//! task itself is reached through the [`task_reader::TaskReader`] trait,
//! letting every retry/diff/dispatch rule be exercised host-side against a
//! mock — only [`mach_task_reader::MachTaskReader`] (macOS only) talks to a
//! real mach task port.
//!
//! # Modules
//!
//! - [`task_reader`]: the [`task_reader::TaskReader`] trait and its
//!   notification-channel counterpart.
//! - [`mach_task_reader`]: `cfg(target_os = "macos")`'s real implementation,
//!   built on `mach2` and `libc`.
//! - [`queue`]: [`Queue`], the dedicated-thread stand-in for a dispatch queue.
//! - [`process`]: [`Process`] itself.

pub mod process;
pub mod queue;
pub mod task_reader;

#[cfg(target_os = "macos")]
pub mod mach_task_reader;

pub use process::{AtlasImageEvent, Process, ProcessState};
pub use queue::Queue;
pub use task_reader::{ExecutableRegion, NotificationChannel, NotificationEvent, TaskReader};

#[cfg(target_os = "macos")]
pub use mach_task_reader::{task_reader_for_pid, MachTaskReader};
