// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Atlas Project Contributors

//! [`MachTaskReader`]: the real `cfg(target_os = "macos")` backend for
//! [`crate::task_reader::TaskReader`].
//!
//! Grounded on `ProcessAtlas.cpp`'s
//! `Process::getSnapshot`/`synthesizeSnapshot`/`setupNotifications`/
//! `handleNotifications`: `task_info(TASK_DYLD_INFO)` to find the compact-info
//! pointer, `mach_vm_region`/`mach_vm_read_overwrite` to walk and read
//! executable-readable regions, and a receive port registered with
//! `task_dyld_process_info_notify_register` whose messages are demultiplexed
//! by `msgh_id & 0xFFFFF000 == DYLD_PROCESS_EVENT_ID_BASE`.
//!
//! `task_dyld_process_info_notify_register`/`_deregister` are real exported
//! `libSystem` symbols not wrapped by `mach2` (the source itself resolves
//! them with `dlsym` to tolerate older libSystems that lack the
//! deregister half); this module instead binds them directly with
//! `extern "C"`, the same pattern `atlas-fs::file_manager::platform` uses for
//! `fsgetpath`/`openbyid_np`. `proc_regionfilename` (libproc, not `libc`) gets
//! the same treatment.

use std::sync::Arc;

use atlas_core::{Error, Result};
use mach2::kern_return::KERN_SUCCESS;
use mach2::mach_types::task_name_t;
use mach2::message::{mach_msg, mach_msg_header_t, MACH_MSGH_BITS_COMPLEX, MACH_MSG_TIMEOUT_NONE, MACH_RCV_MSG, MACH_SEND_MSG};
use mach2::port::{mach_port_t, MACH_PORT_NULL};
use mach2::task::task_info;
use mach2::task_info::{task_dyld_info, TASK_DYLD_INFO};
use mach2::traps::mach_task_self;
use mach2::vm::{mach_vm_read_overwrite, mach_vm_region};
use mach2::vm_prot::{VM_PROT_EXECUTE, VM_PROT_READ};
use mach2::vm_region::{vm_region_basic_info_64, VM_REGION_BASIC_INFO_64};
use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t};

use crate::task_reader::{ExecutableRegion, NotificationChannel, NotificationEvent, TaskReader};

/// Masks off the high pointer-authentication/TBI byte `compact_dyld_image_info_addr`
/// can carry on arm64e, mirroring the source's `& 0x00ff'ffff'ffff'ffff`.
const POINTER_TAG_MASK: u64 = 0x00ff_ffff_ffff_ffff;

/// `dyld_process_info_internal.h`'s 64-bit `dyld_all_image_infos` layout,
/// truncated to the fields this crate reads. `task_dyld_info.all_image_info_size`
/// is always large enough to cover these on a modern dyld; this struct is
/// read out of a copy of the full remote buffer, never indexed past it.
///
/// The leading-field layout (`version` through `dyld_path`) is taken from the
/// long-public `dyld_all_image_infos` header; the trailing reserved span and
/// `compact_dyld_image_info_{addr,size}` offset are inferred from
/// `ProcessAtlas.cpp` reading them off `&remoteBuffer[0]` with no other field
/// access in between, not verified against a header that isn't otherwise
/// available here.
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)] // only `compact_dyld_image_info_{addr,size}` are read; the rest exist for layout fidelity.
struct AllImageInfos64 {
    version: u32,
    info_array_count: u32,
    info_array: u64,
    notification: u64,
    process_detached_from_shared_region: u8,
    lib_system_initialized: u8,
    pad: [u8; 6],
    dyld_image_load_address: u64,
    jit_info: u64,
    dyld_version: u64,
    error_message: u64,
    termination_flags: u64,
    core_symbolication_shm_page: u64,
    system_order_flag: u64,
    unique_process_id: u64,
    shared_cache_slide: u64,
    shared_cache_uuid: [u8; 16],
    shared_cache_base_address: u64,
    info_array_change_timestamp: u64,
    dyld_path: u64,
    notify_mach_ports: [u32; 8],
    reserved: [u64; 9],
    compact_dyld_image_info_addr: u64,
    compact_dyld_image_info_size: u64,
}

/// A real target-task handle backed by a mach task port.
pub struct MachTaskReader {
    task: mach_port_t,
    pid: libc::pid_t,
}

impl MachTaskReader {
    /// Wraps an already-acquired send right to `task`, identified by `pid`
    /// (needed separately because `proc_regionfilename` takes a pid, not a
    /// port).
    #[must_use]
    pub fn new(task: mach_port_t, pid: libc::pid_t) -> Self {
        Self { task, pid }
    }
}

impl TaskReader for MachTaskReader {
    fn compact_info_region(&self) -> Result<(u64, u64)> {
        let mut info: task_dyld_info = unsafe { std::mem::zeroed() };
        let mut count = (std::mem::size_of::<task_dyld_info>() / std::mem::size_of::<mach2::vm_types::natural_t>()) as u32;
        // SAFETY: `info`/`count` are correctly sized for `TASK_DYLD_INFO`.
        let kr = unsafe { task_info(self.task, TASK_DYLD_INFO, std::ptr::addr_of_mut!(info).cast(), &mut count) };
        if kr != KERN_SUCCESS {
            return Err(Error::permission(format!("task_info(TASK_DYLD_INFO) failed: {kr}")));
        }
        if info.all_image_info_addr == 0 {
            return Ok((0, 0)); // dyld has not yet published anything; fall back to synthesis.
        }
        let remote = self.read(info.all_image_info_addr, info.all_image_info_size)?;
        if remote.len() < std::mem::size_of::<AllImageInfos64>() {
            return Ok((0, 0));
        }
        let images: AllImageInfos64 = unsafe { std::ptr::read_unaligned(remote.as_ptr().cast()) };
        let address = images.compact_dyld_image_info_addr & POINTER_TAG_MASK;
        Ok((address, images.compact_dyld_image_info_size))
    }

    fn read(&self, address: u64, size: u64) -> Result<Vec<u8>> {
        let mut buffer = vec![0_u8; usize::try_from(size).map_err(|_| Error::invalid("process: region size overflow"))?];
        let mut read_size: mach_vm_size_t = 0;
        // SAFETY: `buffer` has capacity for exactly `size` bytes; the kernel
        // only ever writes within that range.
        let kr = unsafe { mach_vm_read_overwrite(self.task, address, size, buffer.as_mut_ptr() as mach_vm_address_t, &mut read_size) };
        if kr != KERN_SUCCESS {
            return Err(Error::TargetMutation { address });
        }
        buffer.truncate(read_size as usize);
        Ok(buffer)
    }

    fn for_each_executable_region(&self, f: &mut dyn FnMut(ExecutableRegion<'_>) -> bool) -> Result<()> {
        let mut address: mach_vm_address_t = 0;
        loop {
            let mut size: mach_vm_size_t = 0;
            let mut info: vm_region_basic_info_64 = unsafe { std::mem::zeroed() };
            let mut info_count = (std::mem::size_of::<vm_region_basic_info_64>() / std::mem::size_of::<mach2::vm_types::natural_t>()) as u32;
            let mut object_name: mach_port_t = MACH_PORT_NULL;
            // SAFETY: `info`/`info_count` match `VM_REGION_BASIC_INFO_64`'s layout.
            let kr = unsafe { mach_vm_region(self.task, &mut address, &mut size, VM_REGION_BASIC_INFO_64, std::ptr::addr_of_mut!(info).cast(), &mut info_count, &mut object_name) };
            if kr != KERN_SUCCESS {
                break; // no more regions.
            }
            if info.protection != (VM_PROT_READ | VM_PROT_EXECUTE) {
                address += size;
                continue;
            }
            let Ok(content) = self.read(address, size) else {
                address += size;
                continue;
            };
            if !f(ExecutableRegion { address, content: &content }) {
                break;
            }
            address += size;
        }
        Ok(())
    }

    fn path_for_region(&self, address: u64) -> Option<String> {
        platform::proc_regionfilename(self.pid, address)
    }

    fn register_notifications(&self) -> Result<Box<dyn NotificationChannel>> {
        platform::register(self.task).map(|channel| Box::new(channel) as Box<dyn NotificationChannel>)
    }
}

mod platform {
    use super::{mach_port_t, Error, Result};
    use mach2::kern_return::KERN_SUCCESS;
    use mach2::mach_port::{mach_port_allocate, mach_port_deallocate, mach_port_insert_right, mach_port_request_notification};
    use mach2::message::MACH_MSG_TYPE_MAKE_SEND;
    use mach2::notify::MACH_NOTIFY_NO_SENDERS;
    use mach2::port::MACH_PORT_RIGHT_RECEIVE;
    use mach2::traps::mach_task_self;

    /// `task_dyld_process_info_notify_register`/`_deregister` are exported by
    /// `libSystem` for dyld's own use but not wrapped by `mach2`.
    extern "C" {
        fn task_dyld_process_info_notify_register(target_task: mach_port_t, notify: mach_port_t) -> i32;
        fn task_dyld_process_info_notify_deregister(target_task: mach_port_t, notify: mach_port_t) -> i32;
        fn proc_regionfilename(pid: libc::pid_t, address: u64, buffer: *mut libc::c_char, buffersize: u32) -> i32;
    }

    pub(super) fn proc_regionfilename(pid: libc::pid_t, address: u64) -> Option<String> {
        let mut buf = vec![0_u8; libc::PATH_MAX as usize];
        // SAFETY: `buf` is sized `PATH_MAX`; the call only ever writes within it.
        let len = unsafe { self::proc_regionfilename(pid, address, buf.as_mut_ptr().cast(), buf.len() as u32) };
        if len <= 0 {
            return None;
        }
        buf.truncate(len as usize);
        String::from_utf8(buf).ok()
    }

    pub(super) struct MachNotificationChannel {
        task: mach_port_t,
        port: mach_port_t,
    }

    /// Allocates a receive port, arms `MACH_NOTIFY_NO_SENDERS` on it, and
    /// registers it with the target's dyld-info notify endpoint
    /// (`Process::setupNotifications`).
    pub(super) fn register(task: mach_port_t) -> Result<MachNotificationChannel> {
        let me = unsafe { mach_task_self() };
        let mut port: mach_port_t = 0;
        // SAFETY: `port` is a local out-parameter.
        let kr = unsafe { mach_port_allocate(me, MACH_PORT_RIGHT_RECEIVE, &mut port) };
        if kr != KERN_SUCCESS {
            return Err(Error::permission(format!("mach_port_allocate failed: {kr}")));
        }
        // SAFETY: `port` was just allocated as a receive right above.
        let kr = unsafe { mach_port_insert_right(me, port, port, MACH_MSG_TYPE_MAKE_SEND) };
        if kr != KERN_SUCCESS {
            unsafe { mach_port_deallocate(me, port) };
            return Err(Error::permission(format!("mach_port_insert_right failed: {kr}")));
        }
        let mut previous: mach_port_t = 0;
        // SAFETY: `port` holds both the receive right and the send-once right
        // the no-senders notification is delivered to.
        let kr = unsafe { mach_port_request_notification(me, port, MACH_NOTIFY_NO_SENDERS, 1, port, mach2::message::MACH_MSG_TYPE_MAKE_SEND_ONCE, &mut previous) };
        if kr != KERN_SUCCESS {
            unsafe { mach_port_deallocate(me, port) };
            return Err(Error::permission(format!("mach_port_request_notification failed: {kr}")));
        }
        // SAFETY: `task`/`port` are valid mach ports; the callee is a
        // genuine exported libSystem symbol with this signature.
        let kr = unsafe { task_dyld_process_info_notify_register(task, port) };
        if kr != KERN_SUCCESS {
            unsafe { mach_port_deallocate(me, port) };
            return Err(Error::permission(format!("task_dyld_process_info_notify_register failed: {kr}")));
        }
        Ok(MachNotificationChannel { task, port })
    }

    impl Drop for MachNotificationChannel {
        fn drop(&mut self) {
            // SAFETY: `task`/`port` are still valid; deregistering twice is
            // tolerated by the kernel (returns an error, ignored here).
            unsafe {
                let _ = task_dyld_process_info_notify_deregister(self.task, self.port);
                mach_port_deallocate(mach_task_self(), self.port);
            }
        }
    }

    impl super::NotificationChannel for MachNotificationChannel {
        fn recv(&mut self) -> Result<Option<super::NotificationEvent>> {
            super::recv_one(self.port)
        }
    }
}

/// The event-id mask and base the source demultiplexes dyld-process-info
/// messages with ("Notification ID base").
const DYLD_PROCESS_EVENT_ID_MASK: u32 = 0xFFFF_F000;
const DYLD_PROCESS_EVENT_ID_BASE: u32 = 0x4859_4000;
const DYLD_REMOTE_EVENT_ATLAS_CHANGED: u32 = 0;
const MACH_NOTIFY_NO_SENDERS_ID: u32 = mach2::notify::MACH_NOTIFY_NO_SENDERS;
const MAX_NOTIFY_MESSAGE_SIZE: usize = 256;

/// Blocks for exactly one message on `port`, demultiplexes it, and
/// acknowledges `DYLD_PROCESS_EVENT_ID_BASE`-range messages with a fixed
/// reply header (`Process::handleNotifications`).
fn recv_one(port: mach_port_t) -> Result<Option<NotificationEvent>> {
    let mut buffer = [0_u8; MAX_NOTIFY_MESSAGE_SIZE];
    let header = buffer.as_mut_ptr().cast::<mach_msg_header_t>();
    // SAFETY: `buffer` outlives the call and is large enough for any message
    // this endpoint sends (enforced by the kernel via `msgh_size`).
    let kr = unsafe {
        mach_msg(
            header,
            MACH_RCV_MSG,
            0,
            buffer.len() as u32,
            port,
            MACH_MSG_TIMEOUT_NONE,
            MACH_PORT_NULL,
        )
    };
    if kr != KERN_SUCCESS {
        return Ok(None);
    }
    // SAFETY: `mach_msg` filled in a valid header on success.
    let header = unsafe { &*header };
    if header.msgh_bits & MACH_MSGH_BITS_COMPLEX != 0 {
        return Err(Error::protocol("process: unexpected complex notification message"));
    }
    if header.msgh_id == MACH_NOTIFY_NO_SENDERS_ID {
        return Ok(Some(NotificationEvent::NoSenders));
    }
    if header.msgh_id & DYLD_PROCESS_EVENT_ID_MASK != DYLD_PROCESS_EVENT_ID_BASE {
        return Ok(Some(NotificationEvent::Other(header.msgh_id)));
    }
    let event_code = header.msgh_id & !DYLD_PROCESS_EVENT_ID_MASK;
    reply_to(header)?;
    if event_code == DYLD_REMOTE_EVENT_ATLAS_CHANGED {
        Ok(Some(NotificationEvent::AtlasChanged))
    } else {
        Ok(Some(NotificationEvent::Other(event_code)))
    }
}

/// Sends the fixed-size acknowledgement reply every dyld-info message expects
/// (`Process::handleNotifications`'s `replyHeader`).
fn reply_to(received: &mach_msg_header_t) -> Result<()> {
    let mut reply = mach_msg_header_t {
        msgh_bits: received.msgh_bits & mach2::message::MACH_MSGH_BITS_REMOTE_MASK,
        msgh_size: std::mem::size_of::<mach_msg_header_t>() as u32,
        msgh_remote_port: received.msgh_remote_port,
        msgh_local_port: MACH_PORT_NULL,
        msgh_voucher_port: 0,
        msgh_id: 0,
    };
    // SAFETY: `reply` is a stack-local, correctly sized send-only header.
    let kr = unsafe { mach_msg(&mut reply, MACH_SEND_MSG, reply.msgh_size, 0, MACH_PORT_NULL, MACH_MSG_TIMEOUT_NONE, MACH_PORT_NULL) };
    if kr != KERN_SUCCESS {
        return Err(Error::protocol("process: failed to acknowledge dyld notification"));
    }
    Ok(())
}

/// Acquires a send right to `pid`'s task port and wraps it.
///
/// Requires the calling process to hold `task_for_pid` entitlement/privilege;
/// failure is surfaced as [`Error::Permission`], matching the "file or VM
/// syscall denied; surfaced verbatim".
pub fn task_reader_for_pid(pid: libc::pid_t) -> Result<Arc<dyn TaskReader>> {
    let mut task: task_name_t = 0;
    // SAFETY: `task` is a local out-parameter; `task_for_pid` only writes to it.
    let kr = unsafe { mach2::traps::task_for_pid(mach_task_self(), pid, &mut task) };
    if kr != KERN_SUCCESS {
        return Err(Error::permission(format!("task_for_pid({pid}) failed: {kr}")));
    }
    Ok(Arc::new(MachTaskReader::new(task, pid)))
}
