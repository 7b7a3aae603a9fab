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

//! Directory traversal and mutation: path lookup, entry creation and
//! deletion, and timestamp/size updates. Grounded on
//! `original_source/uFS_FAT.cpp`'s `LookupEntry`, `OpenFile`, and
//! `RemoveFile`-adjacent helpers.

use zerocopy::{FromBytes, IntoBytes};

use fatkit_err::{Error, FsError, Result};
use fatkit_fs::{BlockDevice, Clock, LookupOutcome};

use crate::boot::{Geometry, FIXED_ROOT, NULL_CLUSTER};
use crate::cache::SectorCache;
use crate::dirent::{compare_dos_filename, Attributes, DirEntry, DirEntryAddress};
use crate::fat::FatTableState;

const ENTRIES_PER_SECTOR: usize = 512 / 32;

pub struct LookupResult {
    pub outcome: LookupOutcome,
    pub entry: Option<DirEntry>,
    pub entry_address: Option<DirEntryAddress>,
    pub empty_address: Option<DirEntryAddress>,
    /// Cluster of the directory the leaf segment was scanned in (`FIXED_ROOT`
    /// for the FAT12/16 root). Used to stamp a new subdirectory's `..` entry.
    pub containing_cluster: u32,
}

enum ScanOutcome {
    Match { entry: DirEntry, address: DirEntryAddress },
    NoMatch { empty_address: Option<DirEntryAddress> },
}

fn directory_sector_count(geometry: &Geometry, cluster: u32) -> u32 {
    if cluster == FIXED_ROOT {
        geometry.fixed_root_sector_count()
    } else {
        geometry.sectors_per_cluster
    }
}

fn directory_sector_lba(geometry: &Geometry, cluster: u32, sector_offset: u32) -> u32 {
    if cluster == FIXED_ROOT {
        geometry.fixed_root_start_sector() + sector_offset
    } else {
        geometry.cluster_to_sector(cluster) + sector_offset
    }
}

/// Scans a single directory (fixed root, or the cluster chain rooted at
/// `dir_cluster`) for `name`. When `is_leaf` and no empty slot has been
/// found by the time the chain runs out, extends the directory by one
/// cluster (fixed root is never extended: it has no chain to grow).
fn scan_directory<D: BlockDevice>(
    device: &D,
    cache: &mut SectorCache,
    fat: &mut FatTableState,
    geometry: &Geometry,
    dir_cluster: u32,
    name: &str,
    is_leaf: bool,
) -> Result<ScanOutcome> {
    scan_directory_inner(device, cache, fat, geometry, dir_cluster, Some(name), is_leaf)
}

fn scan_directory_inner<D: BlockDevice>(
    device: &D,
    cache: &mut SectorCache,
    fat: &mut FatTableState,
    geometry: &Geometry,
    dir_cluster: u32,
    name: Option<&str>,
    is_leaf: bool,
) -> Result<ScanOutcome> {
    let mut cluster = dir_cluster;
    let mut empty_address = None;

    loop {
        let sector_count = directory_sector_count(geometry, cluster);
        let mut terminated = false;

        for sector_offset in 0..sector_count {
            let lba = directory_sector_lba(geometry, cluster, sector_offset);
            let sector = cache.lock_read(device, lba)?;

            for index in 0..ENTRIES_PER_SECTOR {
                let raw = &sector[index * 32..index * 32 + 32];
                let entry = DirEntry::read_from_bytes(raw).expect("32-byte slice always parses");
                let address = DirEntryAddress {
                    cluster,
                    sector_offset,
                    index_in_sector: index as u8,
                };

                if entry.is_end_of_directory() {
                    if is_leaf && empty_address.is_none() {
                        empty_address = Some(address);
                    }
                    terminated = true;
                    break;
                }
                if entry.name[0] == crate::dirent::ENTRY_DELETED {
                    if is_leaf && empty_address.is_none() {
                        empty_address = Some(address);
                    }
                    continue;
                }
                if entry.is_lfn() || entry.attributes().contains(Attributes::VOLUME_ID) {
                    continue;
                }
                if let Some(name) = name {
                    if compare_dos_filename(&entry, name) {
                        return Ok(ScanOutcome::Match { entry, address });
                    }
                }
            }
            if terminated {
                break;
            }
        }
        if terminated {
            break;
        }
        if cluster == FIXED_ROOT {
            break;
        }

        let next = fat.get_entry(device, cache, geometry, cluster)?;
        if geometry.width.is_eof_value(next) {
            if is_leaf && empty_address.is_none() {
                let new_cluster = fat.add_directory_cluster(device, cache, geometry, cluster, 0)?;
                empty_address = Some(DirEntryAddress {
                    cluster: new_cluster,
                    sector_offset: 0,
                    index_in_sector: 0,
                });
            }
            break;
        }
        cluster = next;
    }

    Ok(ScanOutcome::NoMatch { empty_address })
}

/// Traverses `path` (`seg1\seg2\...\leaf`), descending through directory
/// segments. Returns `Match`/`Empty`/`NotFound` for the leaf segment.
pub fn lookup_entry<D: BlockDevice>(
    device: &D,
    cache: &mut SectorCache,
    fat: &mut FatTableState,
    geometry: &Geometry,
    path: &str,
) -> Result<LookupResult> {
    let segments: Vec<&str> = path.split('\\').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return Err(Error::Fs(FsError::IllegalFilename));
    }

    let mut dir_cluster = geometry.root_dir_cluster;
    for (i, segment) in segments.iter().enumerate() {
        let is_leaf = i == segments.len() - 1;
        if is_leaf {
            return Ok(match scan_directory(device, cache, fat, geometry, dir_cluster, segment, true)? {
                ScanOutcome::Match { entry, address } => LookupResult {
                    outcome: LookupOutcome::Match,
                    entry: Some(entry),
                    entry_address: Some(address),
                    empty_address: None,
                    containing_cluster: dir_cluster,
                },
                ScanOutcome::NoMatch { empty_address } => LookupResult {
                    outcome: if empty_address.is_some() { LookupOutcome::Empty } else { LookupOutcome::NotFound },
                    entry: None,
                    entry_address: None,
                    empty_address,
                    containing_cluster: dir_cluster,
                },
            });
        }

        match scan_directory(device, cache, fat, geometry, dir_cluster, segment, false)? {
            ScanOutcome::Match { entry, .. } => {
                if !entry.attributes().contains(Attributes::DIRECTORY) {
                    return Err(Error::Fs(FsError::NotADirectory));
                }
                dir_cluster = entry.start_cluster();
            }
            ScanOutcome::NoMatch { .. } => {
                return Ok(LookupResult {
                    outcome: LookupOutcome::NotFound,
                    entry: None,
                    entry_address: None,
                    empty_address: None,
                    containing_cluster: dir_cluster,
                });
            }
        }
    }
    unreachable!("non-empty segments always returns from the loop above")
}

fn write_entry<D: BlockDevice>(device: &D, cache: &mut SectorCache, geometry: &Geometry, address: &DirEntryAddress, entry: &DirEntry) -> Result<()> {
    let lba = directory_sector_lba(geometry, address.cluster, address.sector_offset);
    let handle = cache.lock(device, lba, true, true)?;
    let buf = cache.get_mut(handle)?;
    let offset = address.index_in_sector as usize * 32;
    buf[offset..offset + 32].copy_from_slice(entry.as_bytes());
    cache.unlock(device, handle)
}

fn read_entry<D: BlockDevice>(device: &D, cache: &mut SectorCache, geometry: &Geometry, address: &DirEntryAddress) -> Result<DirEntry> {
    let lba = directory_sector_lba(geometry, address.cluster, address.sector_offset);
    let sector = cache.lock_read(device, lba)?;
    let offset = address.index_in_sector as usize * 32;
    Ok(DirEntry::read_from_bytes(&sector[offset..offset + 32]).expect("32-byte slice always parses"))
}

/// `lookup_entry` → on `Empty`, allocates a directory cluster and writes a
/// fresh `DIRECTORY` entry into the empty slot. Fails `FileOrDirExists` on
/// `Match`.
pub fn create_directory<D: BlockDevice, C: Clock>(
    device: &D,
    cache: &mut SectorCache,
    fat: &mut FatTableState,
    geometry: &Geometry,
    clock: &C,
    path: &str,
) -> Result<()> {
    let lookup = lookup_entry(device, cache, fat, geometry, path)?;
    match lookup.outcome {
        LookupOutcome::Match => Err(Error::Fs(FsError::FileOrDirExists)),
        LookupOutcome::NotFound => Err(Error::Fs(FsError::FileNotFound)),
        LookupOutcome::Empty => {
            let address = lookup.empty_address.expect("Empty outcome always carries an address");
            let parent_for_dotdot = if lookup.containing_cluster == FIXED_ROOT { 0 } else { lookup.containing_cluster };
            let new_cluster = fat.add_directory_cluster(device, cache, geometry, 0, parent_for_dotdot)?;

            let (name, _) = split_leaf(path)?;
            let packed = crate::dirent::set_dos_filename(name).ok_or(Error::Fs(FsError::IllegalFilename))?;
            let now = clock.now();
            let mut entry = DirEntry::EMPTY;
            entry.name.copy_from_slice(&packed[..8]);
            entry.ext.copy_from_slice(&packed[8..]);
            entry.attributes = Attributes::DIRECTORY.bits();
            entry.set_start_cluster(new_cluster);
            stamp_created(&mut entry, &now);

            write_entry(device, cache, geometry, &address, &entry)
        }
    }
}

fn split_leaf(path: &str) -> Result<(&str, &str)> {
    let trimmed = path.trim_start_matches('\\');
    match trimmed.rsplit_once('\\') {
        Some((parent, leaf)) => Ok((leaf, parent)),
        None => Ok((trimmed, "")),
    }
}

fn stamp_created(entry: &mut DirEntry, now: &fatkit_fs::Timestamp) {
    let (time, date) = pack_timestamp(now);
    entry.create_time_tenth = now.centisecond;
    entry.create_time = time;
    entry.create_date = date;
    entry.last_access_date = date;
    entry.last_mod_time = time;
    entry.last_mod_date = date;
}

fn pack_timestamp(ts: &fatkit_fs::Timestamp) -> (zerocopy::little_endian::U16, zerocopy::little_endian::U16) {
    let time = ((ts.hour as u16) << 11) | ((ts.minute as u16) << 5) | (ts.second as u16 / 2);
    let year_offset = ts.year.saturating_sub(1980).min(127);
    let date = (year_offset << 9) | (((ts.month as u16) + 1) << 5) | (ts.day as u16 + 1);
    (zerocopy::little_endian::U16::new(time), zerocopy::little_endian::U16::new(date))
}

/// Deletes the file or empty directory at `path`. Rejects attributes not
/// present in `allowed_attributes` (e.g. refusing to delete a directory
/// unless `DIRECTORY` is permitted) and refuses a non-empty directory.
pub fn delete_file<D: BlockDevice>(
    device: &D,
    cache: &mut SectorCache,
    fat: &mut FatTableState,
    geometry: &Geometry,
    path: &str,
    allowed_attributes: Attributes,
) -> Result<()> {
    let lookup = lookup_entry(device, cache, fat, geometry, path)?;
    if lookup.outcome != LookupOutcome::Match {
        return Err(Error::Fs(FsError::FileNotFound));
    }
    let mut entry = lookup.entry.expect("Match outcome always carries an entry");
    let address = lookup.entry_address.expect("Match outcome always carries an address");

    let attrs = entry.attributes();
    if !(attrs - allowed_attributes).is_empty() {
        return Err(Error::Fs(FsError::WrongAttributes));
    }

    if attrs.contains(Attributes::DIRECTORY) && !directory_is_empty(device, cache, fat, geometry, entry.start_cluster())? {
        return Err(Error::Fs(FsError::DirectoryNotEmpty));
    }

    let start_cluster = entry.start_cluster();
    entry.mark_deleted();
    write_entry(device, cache, geometry, &address, &entry)?;

    if start_cluster != NULL_CLUSTER {
        fat.unlink_chain(device, cache, geometry, start_cluster)?;
    }
    Ok(())
}

fn directory_is_empty<D: BlockDevice>(
    device: &D,
    cache: &mut SectorCache,
    fat: &mut FatTableState,
    geometry: &Geometry,
    dir_cluster: u32,
) -> Result<bool> {
    let mut cluster = dir_cluster;
    loop {
        let sector_count = directory_sector_count(geometry, cluster);
        for sector_offset in 0..sector_count {
            let lba = directory_sector_lba(geometry, cluster, sector_offset);
            let sector = cache.lock_read(device, lba)?;
            for index in 0..ENTRIES_PER_SECTOR {
                let raw = &sector[index * 32..index * 32 + 32];
                let entry = DirEntry::read_from_bytes(raw).expect("32-byte slice always parses");
                if entry.is_end_of_directory() {
                    return Ok(true);
                }
                if entry.name[0] == crate::dirent::ENTRY_DELETED {
                    continue;
                }
                if entry.name == *b".       " || entry.name == *b"..      " {
                    continue;
                }
                return Ok(false);
            }
        }
        if cluster == FIXED_ROOT {
            return Ok(true);
        }
        let next = fat.get_entry(device, cache, geometry, cluster)?;
        if geometry.width.is_eof_value(next) {
            return Ok(true);
        }
        cluster = next;
    }
}

/// Patches `start_cluster`/`file_size` into the directory entry at
/// `address`, sets `ARCHIVE`, and stamps the access timestamp.
pub fn update_directory_entry<D: BlockDevice, C: Clock>(
    device: &D,
    cache: &mut SectorCache,
    geometry: &Geometry,
    clock: &C,
    address: &DirEntryAddress,
    new_start: u32,
    new_size: u32,
) -> Result<()> {
    let mut entry = read_entry(device, cache, geometry, address)?;
    entry.set_start_cluster(new_start);
    entry.file_size = zerocopy::little_endian::U32::new(new_size);
    entry.attributes |= Attributes::ARCHIVE.bits();
    let now = clock.now();
    let (_, date) = pack_timestamp(&now);
    entry.last_access_date = date;
    write_entry(device, cache, geometry, address, &entry)
}

/// Composes a fresh directory entry for a newly created file.
pub fn compose_file_entry<C: Clock>(name: &str, attributes: Attributes, clock: &C) -> Result<DirEntry> {
    let packed = crate::dirent::set_dos_filename(name).ok_or(Error::Fs(FsError::IllegalFilename))?;
    let mut entry = DirEntry::EMPTY;
    entry.name.copy_from_slice(&packed[..8]);
    entry.ext.copy_from_slice(&packed[8..]);
    entry.attributes = attributes.bits();
    let now = clock.now();
    stamp_created(&mut entry, &now);
    Ok(entry)
}

pub(crate) fn write_new_entry<D: BlockDevice>(
    device: &D,
    cache: &mut SectorCache,
    geometry: &Geometry,
    address: &DirEntryAddress,
    entry: &DirEntry,
) -> Result<()> {
    write_entry(device, cache, geometry, address, entry)
}

pub(crate) fn leaf_name(path: &str) -> Result<&str> {
    let (name, _) = split_leaf(path)?;
    if name.is_empty() {
        return Err(Error::Fs(FsError::IllegalFilename));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fatkit_ds_mem::DataStorageServer;
    use fatkit_fs::{ByteAddressed, DefaultClock};

    use crate::fat::FatWidth;

    /// A one-sector (16-entry) fixed root directory backed by 16 data
    /// clusters, matching the shape a real FAT16 volume would have.
    fn fixture() -> (ByteAddressed<DataStorageServer>, Geometry) {
        let geometry = Geometry {
            width: FatWidth::Fat16,
            sectors_per_cluster: 1,
            sector_to_cluster_shift: 0,
            reserved_sectors: 1,
            fat_copies: 1,
            sectors_per_fat: 4,
            root_dir_entries: 16,
            root_dir_cluster: FIXED_ROOT,
            first_data_sector: 1 + 4 + 1,
            total_sectors: 1 + 4 + 1 + 16,
            total_clusters: 16,
            fsinfo_sector: None,
        };
        let device = ByteAddressed::new(DataStorageServer::new(geometry.total_sectors as usize * 512), "FAT");
        (device, geometry)
    }

    #[test]
    fn lookup_in_empty_root_reports_empty_slot() {
        let (device, geometry) = fixture();
        let mut cache = SectorCache::new(4);
        let mut fat = FatTableState::new();

        let result = lookup_entry(&device, &mut cache, &mut fat, &geometry, r"missing.txt").unwrap();
        assert_eq!(result.outcome, LookupOutcome::Empty);
        let address = result.empty_address.unwrap();
        assert_eq!(address.cluster, FIXED_ROOT);
        assert_eq!(address.sector_offset, 0);
        assert_eq!(address.index_in_sector, 0);
    }

    #[test]
    fn create_directory_then_lookup_finds_it() {
        let (device, geometry) = fixture();
        let mut cache = SectorCache::new(4);
        let mut fat = FatTableState::new();
        let clock = DefaultClock;

        create_directory(&device, &mut cache, &mut fat, &geometry, &clock, r"sub").unwrap();

        let result = lookup_entry(&device, &mut cache, &mut fat, &geometry, r"sub").unwrap();
        assert_eq!(result.outcome, LookupOutcome::Match);
        let entry = result.entry.unwrap();
        assert!(entry.attributes().contains(Attributes::DIRECTORY));
        assert_ne!(entry.start_cluster(), NULL_CLUSTER);
    }

    #[test]
    fn create_directory_twice_reports_already_exists() {
        let (device, geometry) = fixture();
        let mut cache = SectorCache::new(4);
        let mut fat = FatTableState::new();
        let clock = DefaultClock;

        create_directory(&device, &mut cache, &mut fat, &geometry, &clock, r"sub").unwrap();
        assert!(matches!(
            create_directory(&device, &mut cache, &mut fat, &geometry, &clock, r"sub"),
            Err(Error::Fs(FsError::FileOrDirExists))
        ));
    }

    #[test]
    fn delete_file_rejects_wrong_attributes() {
        let (device, geometry) = fixture();
        let mut cache = SectorCache::new(4);
        let mut fat = FatTableState::new();
        let clock = DefaultClock;

        create_directory(&device, &mut cache, &mut fat, &geometry, &clock, r"sub").unwrap();
        assert!(matches!(
            delete_file(&device, &mut cache, &mut fat, &geometry, r"sub", Attributes::empty()),
            Err(Error::Fs(FsError::WrongAttributes))
        ));
    }

    #[test]
    fn delete_empty_directory_then_lookup_no_longer_matches() {
        let (device, geometry) = fixture();
        let mut cache = SectorCache::new(4);
        let mut fat = FatTableState::new();
        let clock = DefaultClock;

        create_directory(&device, &mut cache, &mut fat, &geometry, &clock, r"sub").unwrap();
        delete_file(&device, &mut cache, &mut fat, &geometry, r"sub", Attributes::DIRECTORY).unwrap();

        let result = lookup_entry(&device, &mut cache, &mut fat, &geometry, r"sub").unwrap();
        assert_ne!(result.outcome, LookupOutcome::Match);
    }

    #[test]
    fn lookup_through_missing_parent_segment_is_not_found() {
        let (device, geometry) = fixture();
        let mut cache = SectorCache::new(4);
        let mut fat = FatTableState::new();

        let result = lookup_entry(&device, &mut cache, &mut fat, &geometry, r"nope\leaf.txt").unwrap();
        assert_eq!(result.outcome, LookupOutcome::NotFound);
    }

    #[test]
    fn lookup_descending_through_a_file_is_not_a_directory() {
        let (device, geometry) = fixture();
        let mut cache = SectorCache::new(4);
        let mut fat = FatTableState::new();
        let clock = DefaultClock;

        let entry = compose_file_entry("a.txt", Attributes::ARCHIVE, &clock).unwrap();
        let lookup = lookup_entry(&device, &mut cache, &mut fat, &geometry, r"a.txt").unwrap();
        write_new_entry(&device, &mut cache, &geometry, &lookup.empty_address.unwrap(), &entry).unwrap();

        assert!(matches!(
            lookup_entry(&device, &mut cache, &mut fat, &geometry, r"a.txt\b.txt"),
            Err(Error::Fs(FsError::NotADirectory))
        ));
    }
}
