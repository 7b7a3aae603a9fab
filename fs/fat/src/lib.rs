// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! FAT12/16/32 partition driver: mounts a [`BlockDevice`] whose sector 0 is
//! a FAT boot sector and exposes [`fatkit_fs::Driver`] over it.
//!
//! Module layout mirrors the component breakdown of spec.md §2: [`boot`]
//! (geometry), [`cache`] (sector cache), [`fat`] (cluster-chain engine),
//! [`dirent`]/[`dir`] (directory entries and traversal), [`file`] (the
//! per-open-file state machine). This module wires them into [`FatFs`].

pub mod boot;
pub mod cache;
pub mod dir;
pub mod dirent;
pub mod fat;
pub mod file;

use fatkit_err::{Error, FsError, Result};
use fatkit_fs::{BlockDevice, Clock, DefaultClock, Driver, LookupOutcome, OpenFlags, SeekMode};

use boot::Geometry;
use cache::SectorCache;
use dirent::Attributes;
use fat::FatTableState;
use file::FileState;

/// Attributes a plain `delete_file` call is permitted to remove. Excludes
/// `VOLUME_ID`: the volume-label pseudo-entry is not a file and is not
/// meant to be unlinked through this path.
const DELETABLE: Attributes = Attributes::READ_ONLY
    .union(Attributes::HIDDEN)
    .union(Attributes::SYSTEM)
    .union(Attributes::DIRECTORY)
    .union(Attributes::ARCHIVE);

/// A mounted FAT12/16/32 partition: owns the block device, the derived
/// geometry, the sector cache, the FAT engine's cached free-count state,
/// an injected [`Clock`], and a fixed-size pool of open-file slots.
///
/// Per spec.md §5's resource budget, `cache_size` must be at least
/// `max_open_files + 1` (one lock for the FAT engine, one per open file).
pub struct FatFs<D: BlockDevice, C: Clock = DefaultClock> {
    device: D,
    geometry: Geometry,
    cache: SectorCache,
    fat: FatTableState,
    clock: C,
    slots: Vec<Option<FileState>>,
}

/// Mounts `device` with the default (FAT-epoch) clock. There is no
/// partition-table entry for a bare image mounted this way, so FAT width is
/// decided entirely from the boot sector (see `boot::select_width`).
pub fn mount<D: BlockDevice>(device: D, cache_size: usize, max_open_files: usize) -> Result<FatFs<D, DefaultClock>> {
    FatFs::mount_with_clock(device, DefaultClock, cache_size, max_open_files, None)
}

impl<D: BlockDevice, C: Clock> FatFs<D, C> {
    /// Mounts `device`, per spec.md §4.5: reads sector 0, derives geometry,
    /// and invalidates the free-cluster count (lazily recomputed on first
    /// query).
    ///
    /// `partition_kind` is the MBR partition-table entry's type when this
    /// partition was discovered via one (`attach_mbr_partitions` always
    /// passes `Some`); it overrides the boot sector's own FAT-width signal
    /// per spec.md §4.5 step 3. A bare FAT image with no partition table
    /// passes `None`.
    pub fn mount_with_clock(
        device: D,
        clock: C,
        cache_size: usize,
        max_open_files: usize,
        partition_kind: Option<fatkit_fs::PartitionKind>,
    ) -> Result<Self> {
        assert!(
            cache_size >= max_open_files + 1,
            "cache_size ({cache_size}) must be >= max_open_files + 1 ({}); see spec.md §5's resource budget",
            max_open_files + 1
        );

        let mut cache = SectorCache::new(cache_size);
        let boot_sector = cache.lock_read(&device, 0)?;
        let geometry = boot::parse_boot_sector(&boot_sector, partition_kind)?;
        // The boot sector read above was only ever needed once; reset so
        // it doesn't occupy a cache slot other callers could use.
        cache.reset();

        Ok(Self {
            device,
            geometry,
            cache,
            fat: FatTableState::new(),
            clock,
            slots: (0..max_open_files).map(|_| None).collect(),
        })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Flushes the cache and hands the block device back to the caller.
    ///
    /// On a FAT32 volume, also refreshes the FSInfo free-cluster hint
    /// (best-effort, errors ignored): this stack never trusts that hint
    /// for its own correctness (see `boot::parse_boot_sector`'s callers),
    /// but leaves a plausible value for whatever mounts the volume next.
    pub fn unmount(mut self) -> Result<D> {
        self.cache.flush(&self.device)?;
        if let Some(fsinfo_sector) = self.geometry.fsinfo_sector {
            if let Ok(free) = self.fat.number_of_free_entries(&self.device, &mut self.cache, &self.geometry) {
                let sector = boot::build_fsinfo_sector(free);
                let _ = self.device.write_sector(fsinfo_sector, &sector);
            }
        }
        Ok(self.device)
    }
}

/// Reads `device`'s MBR (sector 0), mounts one [`FatFs`] per recognized
/// FAT12/16/32 partition-table entry, and registers each with `volumes`
/// under `\<device.driver_id()>\<partition slot>\`.
///
/// Grounded on spec.md §2's Volume Manager, which "owns MBR parsing... to
/// build the initial set of `PartitionDevice`s at attach time", and on
/// `original_source/partdefs.cpp`'s partition-type table. `device` is
/// wrapped in an `Rc` so every mounted partition can read/write the same
/// physical disk through its own `PartitionDevice` (see
/// `fatkit_fs::BlockDevice for Rc<D>`); a disk with a single FAT partition
/// pays one extra pointer indirection per sector access in exchange for
/// not special-casing the single-partition case here.
///
/// Returns the number of partitions mounted. A present partition-table slot
/// whose type byte is not one of the recognized FAT types fails the whole
/// scan with `UnknownPartitionType`, per spec.md §7's error taxonomy.
pub fn attach_mbr_partitions<D, C>(
    volumes: &mut fatkit_fs::VolumeManager,
    device: D,
    clock: C,
    cache_size: usize,
    max_open_files: usize,
) -> Result<usize>
where
    D: BlockDevice + 'static,
    C: Clock + Clone + 'static,
{
    use fatkit_err::FatError;
    use fatkit_fs::{Mbr, SECTOR_SIZE};
    use std::rc::Rc;

    let device = Rc::new(device);
    let driver_id = device.driver_id().to_owned();

    let mut sector = [0u8; SECTOR_SIZE];
    device.read_sector(0, &mut sector)?;
    let mbr = Mbr::from_sector(&sector).ok_or_else(|| {
        log::error!("device {driver_id:?} has no valid MBR signature at sector 0");
        Error::Fat(FatError::UnknownPartitionType)
    })?;

    let entries: Vec<(u8, u32, fatkit_fs::PartitionKind)> = mbr
        .present_partitions()
        .map(|(slot, entry)| {
            let kind = entry.kind();
            if !kind.is_fat() {
                log::error!("partition slot {slot} on {driver_id:?} has an unrecognized type byte");
                return Err(Error::Fat(FatError::UnknownPartitionType));
            }
            Ok((slot, entry.lba_start.get(), kind))
        })
        .collect::<Result<_>>()?;

    let mut mounted = 0usize;
    for (slot, lba_start, kind) in entries {
        let partition = fatkit_fs::PartitionDevice::new(Rc::clone(&device), lba_start);
        let fs = FatFs::mount_with_clock(partition, clock.clone(), cache_size, max_open_files, Some(kind)).map_err(|err| {
            log::error!("failed to mount partition slot {slot} on {driver_id:?}: {err}");
            err
        })?;
        volumes.attach(driver_id.clone(), slot, Box::new(fs));
        mounted += 1;
    }
    Ok(mounted)
}

fn slot_mut(slots: &mut [Option<FileState>], handle: u32) -> Result<&mut FileState> {
    slots
        .get_mut(handle as usize)
        .and_then(Option::as_mut)
        .ok_or(Error::Fs(FsError::AlreadyClosed))
}

impl<D: BlockDevice, C: Clock> Driver for FatFs<D, C> {
    fn open_file(&mut self, path: &str, flags: OpenFlags) -> Result<u32> {
        let slot_index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(Error::Fs(FsError::OutOfFileHandles))?;
        let state = file::open(&self.device, &mut self.cache, &mut self.fat, &self.geometry, &self.clock, path, flags)?;
        self.slots[slot_index] = Some(state);
        Ok(slot_index as u32)
    }

    fn close_file(&mut self, handle: u32) -> Result<()> {
        let slot = self.slots.get_mut(handle as usize).ok_or(Error::Fs(FsError::AlreadyClosed))?;
        let mut state = slot.take().ok_or(Error::Fs(FsError::AlreadyClosed))?;
        state.flush(&self.device, &mut self.cache, &self.geometry, &self.clock)
    }

    fn read_file(&mut self, handle: u32, buffer: &mut [u8]) -> Result<usize> {
        let state = slot_mut(&mut self.slots, handle)?;
        state.read(&self.device, &mut self.cache, &mut self.fat, &self.geometry, buffer)
    }

    fn write_file(&mut self, handle: u32, buffer: &[u8]) -> Result<usize> {
        let state = slot_mut(&mut self.slots, handle)?;
        state.write(&self.device, &mut self.cache, &mut self.fat, &self.geometry, buffer)
    }

    fn seek_file(&mut self, handle: u32, mode: SeekMode) -> Result<u32> {
        let state = slot_mut(&mut self.slots, handle)?;
        state.seek(&self.device, &mut self.cache, &mut self.fat, &self.geometry, mode)
    }

    fn tell_file(&mut self, handle: u32) -> Result<u32> {
        Ok(slot_mut(&mut self.slots, handle)?.position())
    }

    fn flush_file(&mut self, handle: u32) -> Result<()> {
        let state = slot_mut(&mut self.slots, handle)?;
        state.flush(&self.device, &mut self.cache, &self.geometry, &self.clock)
    }

    fn file_size(&mut self, handle: u32) -> Result<u32> {
        Ok(slot_mut(&mut self.slots, handle)?.size())
    }

    fn create_directory(&mut self, path: &str) -> Result<()> {
        dir::create_directory(&self.device, &mut self.cache, &mut self.fat, &self.geometry, &self.clock, path)
    }

    fn delete_file(&mut self, path: &str) -> Result<()> {
        dir::delete_file(&self.device, &mut self.cache, &mut self.fat, &self.geometry, path, DELETABLE)
    }

    fn flush(&mut self) -> Result<()> {
        self.cache.flush(&self.device)
    }

    /// Free cluster count (spec.md §4.2's `number_of_free_entries`); the
    /// `Driver` trait names this `free_sectors` for parity with the
    /// donor's sentinel-returning surface, but FAT accounts in clusters.
    fn free_sectors(&mut self) -> Result<u32> {
        self.fat.number_of_free_entries(&self.device, &mut self.cache, &self.geometry)
    }
}
