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

//! Cluster-chain engine: reads/writes FAT entries across the three bit
//! widths, and implements chain traversal, allocation, and unlinking.
//!
//! Grounded on `original_source/uFS_FAT.cpp`'s `FatEntry12`/`FatEntry16`/
//! `FatEntry32`, `AddClusters`, `UnlinkChain`, and `GetEofClusterNr`.

use fatkit_err::{Error, FatError, Result};
use fatkit_fs::BlockDevice;

use crate::boot::{Geometry, FIRST_VALID_CLUSTER, NULL_CLUSTER};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatWidth {
    Fat12,
    Fat16,
    Fat32,
}

impl FatWidth {
    pub fn bad_cluster(self) -> u32 {
        match self {
            FatWidth::Fat12 => 0x0FF7,
            FatWidth::Fat16 => 0xFFF7,
            FatWidth::Fat32 => 0x0FFFFFF7,
        }
    }

    pub fn end_of_chain(self) -> u32 {
        match self {
            FatWidth::Fat12 => 0x0FFF,
            FatWidth::Fat16 => 0xFFFF,
            FatWidth::Fat32 => 0x0FFFFFFF,
        }
    }

    pub fn is_eof_value(self, value: u32) -> bool {
        value >= self.bad_cluster()
    }
}

/// Owned FAT-engine state threaded through `FatFs`'s methods. Does not hold
/// the cache or device itself (both live on `FatFs`) to avoid splitting
/// `&mut self` across two owners for what is conceptually one object.
pub struct FatTableState {
    pub free_clusters: Option<u32>,
}

impl FatTableState {
    pub fn new() -> Self {
        Self { free_clusters: None }
    }
}

impl Default for FatTableState {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn valid_cluster_index(geometry: &Geometry, value: u32) -> bool {
    value >= FIRST_VALID_CLUSTER && value < FIRST_VALID_CLUSTER + geometry.total_clusters
}

/// Sector and byte offset within that sector for the FAT entry of `cluster`
/// under `width`, per spec.md §4.2's addressing formulas. For FAT12, an
/// entry may straddle two sectors; `straddles` reports that case.
pub(crate) struct FatEntryAddress {
    pub sector: u32,
    pub byte_offset: usize,
    pub straddles: bool,
}

pub(crate) fn fat_entry_address(width: FatWidth, cluster: u32) -> FatEntryAddress {
    match width {
        FatWidth::Fat12 => {
            let nibble_index = 3 * cluster;
            let byte_index = nibble_index >> 1;
            let sector = byte_index >> 9;
            let byte_offset = (byte_index & 0x1FF) as usize;
            FatEntryAddress {
                sector,
                byte_offset,
                straddles: byte_offset == 511,
            }
        }
        FatWidth::Fat16 => FatEntryAddress {
            sector: cluster >> 8,
            byte_offset: ((cluster & 0xFF) * 2) as usize,
            straddles: false,
        },
        FatWidth::Fat32 => FatEntryAddress {
            sector: cluster >> 7,
            byte_offset: ((cluster & 0x7F) * 4) as usize,
            straddles: false,
        },
    }
}

fn decode_fat12(cluster: u32, low: u8, high: u8) -> u32 {
    let packed = ((high as u32) << 8) | low as u32;
    if cluster & 1 == 0 {
        packed & 0x0FFF
    } else {
        packed >> 4
    }
}

fn encode_fat12(cluster: u32, value: u32, low: u8, high: u8) -> (u8, u8) {
    if cluster & 1 == 0 {
        let packed = ((high as u32) << 8 & 0xF000) | (value & 0x0FFF);
        (packed as u8, (packed >> 8) as u8)
    } else {
        let packed = ((value & 0x0FFF) << 4) | (low as u32 & 0x000F);
        (packed as u8, (packed >> 8) as u8)
    }
}

impl FatTableState {
    /// Reads the FAT entry for `cluster`, issuing one or two sector reads
    /// through `cache` as needed (FAT12 straddling).
    pub fn get_entry<D: BlockDevice>(
        &self,
        device: &D,
        cache: &mut crate::cache::SectorCache,
        geometry: &Geometry,
        cluster: u32,
    ) -> Result<u32> {
        let addr = fat_entry_address(geometry.width, cluster);
        let lba = geometry.fat_start_sector() + addr.sector;
        let sector = cache.lock_read(device, lba)?;

        let value = match geometry.width {
            FatWidth::Fat12 => {
                let low = sector[addr.byte_offset];
                let high = if addr.straddles {
                    let next = cache.lock_read(device, lba + 1)?;
                    next[0]
                } else {
                    sector[addr.byte_offset + 1]
                };
                decode_fat12(cluster, low, high)
            }
            FatWidth::Fat16 => u16::from_le_bytes([sector[addr.byte_offset], sector[addr.byte_offset + 1]]) as u32,
            FatWidth::Fat32 => {
                u32::from_le_bytes([
                    sector[addr.byte_offset],
                    sector[addr.byte_offset + 1],
                    sector[addr.byte_offset + 2],
                    sector[addr.byte_offset + 3],
                ]) & 0x0FFFFFFF
            }
        };
        Ok(value)
    }

    /// Writes `value` into the FAT entry for `cluster`. When `count` is set
    /// and the free-cluster count is cached, adjusts it by the delta
    /// implied by the old/new entry values.
    pub fn set_entry<D: BlockDevice>(
        &mut self,
        device: &D,
        cache: &mut crate::cache::SectorCache,
        geometry: &Geometry,
        cluster: u32,
        value: u32,
        count: bool,
    ) -> Result<()> {
        let addr = fat_entry_address(geometry.width, cluster);
        let lba = geometry.fat_start_sector() + addr.sector;

        let was_free = if count {
            Some(self.get_entry(device, cache, geometry, cluster)? == NULL_CLUSTER)
        } else {
            None
        };

        let handle = cache.lock(device, lba, true, true)?;
        match geometry.width {
            FatWidth::Fat12 => {
                // For an even cluster the preserved nibble lives in the top
                // half of the *next* cluster's low byte; when the entry
                // straddles a sector boundary that byte lives in the next
                // sector and must be read from there, not assumed zero.
                let current_high = if addr.straddles {
                    cache.lock_read(device, lba + 1)?[0]
                } else {
                    cache.get(handle)?[addr.byte_offset + 1]
                };
                let buf = cache.get_mut(handle)?;
                let low = buf[addr.byte_offset];
                let (new_low, new_high) = encode_fat12(cluster, value, low, current_high);
                buf[addr.byte_offset] = new_low;
                if !addr.straddles {
                    buf[addr.byte_offset + 1] = new_high;
                }
                cache.unlock(device, handle)?;
                if addr.straddles {
                    let next_handle = cache.lock(device, lba + 1, true, true)?;
                    cache.get_mut(next_handle)?[0] = new_high;
                    cache.unlock(device, next_handle)?;
                }
            }
            FatWidth::Fat16 => {
                let buf = cache.get_mut(handle)?;
                let bytes = (value as u16).to_le_bytes();
                buf[addr.byte_offset] = bytes[0];
                buf[addr.byte_offset + 1] = bytes[1];
                cache.unlock(device, handle)?;
            }
            FatWidth::Fat32 => {
                let buf = cache.get_mut(handle)?;
                let preserved_high = u32::from_le_bytes([
                    buf[addr.byte_offset],
                    buf[addr.byte_offset + 1],
                    buf[addr.byte_offset + 2],
                    buf[addr.byte_offset + 3],
                ]) & 0xF0000000;
                let bytes = ((value & 0x0FFFFFFF) | preserved_high).to_le_bytes();
                buf[addr.byte_offset..addr.byte_offset + 4].copy_from_slice(&bytes);
                cache.unlock(device, handle)?;
            }
        }

        if let Some(was_free) = was_free {
            if let Some(free) = self.free_clusters.as_mut() {
                let is_free_now = value == NULL_CLUSTER;
                if was_free && !is_free_now {
                    *free -= 1;
                } else if !was_free && is_free_now {
                    *free += 1;
                }
            }
        }
        Ok(())
    }

    /// Walks the chain from `start` until an end-of-chain value is
    /// observed, returning the tail cluster. Errors if a bad-cluster
    /// marker appears mid-chain.
    pub fn get_eof<D: BlockDevice>(
        &self,
        device: &D,
        cache: &mut crate::cache::SectorCache,
        geometry: &Geometry,
        start: u32,
    ) -> Result<u32> {
        let mut current = start;
        loop {
            let next = self.get_entry(device, cache, geometry, current)?;
            if next == geometry.width.bad_cluster() {
                log::error!("bad-cluster marker found mid-chain at {current}");
                return Err(Error::Fat(FatError::CorruptFat));
            }
            if geometry.width.is_eof_value(next) {
                return Ok(current);
            }
            if !valid_cluster_index(geometry, next) {
                log::error!("invalid cluster {next} mid-chain from {start}");
                return Err(Error::Fat(FatError::CorruptFat));
            }
            current = next;
        }
    }

    /// Frees every cluster in the chain starting at `start`.
    pub fn unlink_chain<D: BlockDevice>(
        &mut self,
        device: &D,
        cache: &mut crate::cache::SectorCache,
        geometry: &Geometry,
        start: u32,
    ) -> Result<()> {
        let mut current = start;
        loop {
            let next = self.get_entry(device, cache, geometry, current)?;
            self.set_entry(device, cache, geometry, current, NULL_CLUSTER, true)?;
            if geometry.width.is_eof_value(next) {
                if next == geometry.width.bad_cluster() {
                    log::error!("bad-cluster marker found while unlinking chain at {current}");
                    return Err(Error::Fat(FatError::CorruptFat));
                }
                return Ok(());
            }
            if !valid_cluster_index(geometry, next) {
                log::error!("invalid cluster {next} while unlinking chain from {start}");
                return Err(Error::Fat(FatError::CorruptFat));
            }
            current = next;
        }
    }

    /// Extends the chain starting at `start` (or starts a new chain, when
    /// `start == 0`) by `count` clusters, searching forward from
    /// `search_from`. Returns the first cluster of the newly added
    /// segment.
    ///
    /// Preserves the donor's crash-unsafe write ordering: each new slot is
    /// written EOF *before* the predecessor's link is updated to point at
    /// it, rather than the other way around.
    pub fn add_clusters<D: BlockDevice>(
        &mut self,
        device: &D,
        cache: &mut crate::cache::SectorCache,
        geometry: &Geometry,
        start: u32,
        count: u32,
        search_from: u32,
    ) -> Result<u32> {
        if count == 0 {
            return Err(Error::Fat(FatError::InvalidCluster));
        }

        let is_new_chain = start == NULL_CLUSTER;
        let original_tail = if is_new_chain {
            None
        } else {
            Some(self.get_eof(device, cache, geometry, start)?)
        };
        let mut predecessor = original_tail;

        let max_cluster = FIRST_VALID_CLUSTER + geometry.total_clusters;
        let mut cursor = if search_from < FIRST_VALID_CLUSTER || search_from >= max_cluster {
            FIRST_VALID_CLUSTER
        } else {
            search_from
        };
        let scan_start = cursor;

        let mut first_new = None;
        let mut allocated = Vec::with_capacity(count as usize);

        let result: Result<()> = (|| {
            for _ in 0..count {
                let found = loop {
                    let entry = self.get_entry(device, cache, geometry, cursor)?;
                    if entry == NULL_CLUSTER {
                        break cursor;
                    }
                    cursor = if cursor + 1 >= max_cluster { FIRST_VALID_CLUSTER } else { cursor + 1 };
                    if cursor == scan_start {
                        log::warn!("disk full while allocating clusters (start={start}, count={count})");
                        return Err(Error::Fat(FatError::DiskFull));
                    }
                };

                self.set_entry(device, cache, geometry, found, geometry.width.end_of_chain(), true)?;
                if let Some(prev) = predecessor {
                    self.set_entry(device, cache, geometry, prev, found, false)?;
                }
                predecessor = Some(found);
                first_new.get_or_insert(found);
                allocated.push(found);
                cursor = if found + 1 >= max_cluster { FIRST_VALID_CLUSTER } else { found + 1 };
            }
            Ok(())
        })();

        if let Err(err) = result {
            for cluster in &allocated {
                let _ = self.set_entry(device, cache, geometry, *cluster, NULL_CLUSTER, true);
            }
            // Re-terminate the chain at its pre-call tail; the segment
            // added by this call (if any) was just freed above.
            if let Some(tail) = original_tail {
                let _ = self.set_entry(device, cache, geometry, tail, geometry.width.end_of_chain(), false);
            }
            return Err(err);
        }

        Ok(first_new.expect("count > 0 guarantees at least one allocation"))
    }

    /// Extends a directory's cluster chain by exactly one cluster, zeroing
    /// every sector of it. If `tail_cluster == 0` this is the directory's
    /// first cluster and `.`/`..` are written into its first two slots.
    pub fn add_directory_cluster<D: BlockDevice>(
        &mut self,
        device: &D,
        cache: &mut crate::cache::SectorCache,
        geometry: &Geometry,
        tail_cluster: u32,
        parent_cluster: u32,
    ) -> Result<u32> {
        let new_cluster = self.add_clusters(device, cache, geometry, tail_cluster, 1, FIRST_VALID_CLUSTER)?;

        let first_sector = geometry.cluster_to_sector(new_cluster);
        for i in 0..geometry.sectors_per_cluster {
            let handle = cache.lock(device, first_sector + i, true, false)?;
            cache.get_mut(handle)?.fill(0);
            cache.unlock(device, handle)?;
        }

        if tail_cluster == NULL_CLUSTER {
            use crate::dirent::DirEntry;
            let handle = cache.lock(device, first_sector, true, false)?;
            let buf = cache.get_mut(handle)?;

            let mut dot = DirEntry::EMPTY;
            dot.name = *b".       ";
            dot.attributes = crate::dirent::Attributes::DIRECTORY.bits();
            dot.set_start_cluster(new_cluster);
            buf[0..32].copy_from_slice(dot.as_bytes());

            let mut dotdot = DirEntry::EMPTY;
            dotdot.name = *b"..      ";
            dotdot.attributes = crate::dirent::Attributes::DIRECTORY.bits();
            dotdot.set_start_cluster(parent_cluster);
            buf[32..64].copy_from_slice(dotdot.as_bytes());

            cache.unlock(device, handle)?;
        }

        Ok(new_cluster)
    }

    /// Computes the additional cluster count implied by growing a file
    /// from `current_size` by `delta` bytes, and extends `start`
    /// accordingly (allocating a fresh chain when `start == 0`).
    pub fn grow<D: BlockDevice>(
        &mut self,
        device: &D,
        cache: &mut crate::cache::SectorCache,
        geometry: &Geometry,
        start: u32,
        current_size: u32,
        delta: u32,
        search_from: u32,
    ) -> Result<u32> {
        let new_size = current_size as u64 + delta as u64;
        let cluster_bytes = geometry.cluster_bytes() as u64;
        let current_clusters = if current_size == 0 { 0 } else { (current_size as u64).div_ceil(cluster_bytes) };
        let new_clusters = new_size.div_ceil(cluster_bytes);
        let additional = new_clusters - current_clusters;
        if additional == 0 {
            return Ok(start);
        }
        let first_new = self.add_clusters(device, cache, geometry, start, additional as u32, search_from)?;
        Ok(if start == NULL_CLUSTER { first_new } else { start })
    }

    /// Returns the cached free-cluster count, recomputing it by a full
    /// linear scan of the first FAT copy if it is not yet known.
    pub fn number_of_free_entries<D: BlockDevice>(
        &mut self,
        device: &D,
        cache: &mut crate::cache::SectorCache,
        geometry: &Geometry,
    ) -> Result<u32> {
        if let Some(free) = self.free_clusters {
            return Ok(free);
        }
        let mut free = 0u32;
        for cluster in FIRST_VALID_CLUSTER..(FIRST_VALID_CLUSTER + geometry.total_clusters) {
            if self.get_entry(device, cache, geometry, cluster)? == NULL_CLUSTER {
                free += 1;
            }
        }
        self.free_clusters = Some(free);
        Ok(free)
    }

    /// Mirrors `FatManager::BackupFat()` in the original driver, which
    /// begins with an unconditional early return before its copy loop.
    /// Documented no-op: see DESIGN.md.
    pub fn backup_fat(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use fatkit_ds_mem::DataStorageServer;
    use fatkit_fs::ByteAddressed;

    fn geometry(width: FatWidth, total_clusters: u32) -> Geometry {
        Geometry {
            width,
            sectors_per_cluster: 1,
            sector_to_cluster_shift: 0,
            reserved_sectors: 1,
            fat_copies: 1,
            sectors_per_fat: 4,
            root_dir_entries: 0,
            root_dir_cluster: 2,
            first_data_sector: 1 + 4,
            total_sectors: 1 + 4 + total_clusters,
            total_clusters,
            fsinfo_sector: None,
        }
    }

    fn device(sectors: usize) -> ByteAddressed<DataStorageServer> {
        ByteAddressed::new(DataStorageServer::new(sectors * 512), "FAT")
    }

    #[test]
    fn fat16_entry_round_trips() {
        let dev = device(64);
        let mut cache = crate::cache::SectorCache::new(4);
        let geo = geometry(FatWidth::Fat16, 100);
        let mut fat = FatTableState::new();

        fat.set_entry(&dev, &mut cache, &geo, 5, 0xFFFF, false).unwrap();
        assert_eq!(fat.get_entry(&dev, &mut cache, &geo, 5).unwrap(), 0xFFFF);
    }

    #[test]
    fn fat12_entry_straddles_sector_boundary() {
        let dev = device(16);
        let mut cache = crate::cache::SectorCache::new(4);
        // cluster 341 has nibble_index = 1023, byte_index = 511: the low
        // byte lives in sector 0, the high nibble in sector 1.
        let geo = geometry(FatWidth::Fat12, 4000);
        let mut fat = FatTableState::new();

        fat.set_entry(&dev, &mut cache, &geo, 341, 0x0ABC, false).unwrap();
        assert_eq!(fat.get_entry(&dev, &mut cache, &geo, 341).unwrap(), 0x0ABC);
    }

    #[test]
    fn fat12_even_cluster_straddle_preserves_neighbor_nibble() {
        let dev = device(16);
        let mut cache = crate::cache::SectorCache::new(4);
        // cluster 682 is even and straddles: its low byte is the last byte
        // of sector 1, its high byte (preserved nibble belongs to cluster
        // 683) is the first byte of sector 2.
        let geo = geometry(FatWidth::Fat12, 4000);
        let mut fat = FatTableState::new();

        fat.set_entry(&dev, &mut cache, &geo, 683, 0x0DEF, false).unwrap();
        fat.set_entry(&dev, &mut cache, &geo, 682, 0x0ABC, false).unwrap();

        assert_eq!(fat.get_entry(&dev, &mut cache, &geo, 682).unwrap(), 0x0ABC);
        assert_eq!(fat.get_entry(&dev, &mut cache, &geo, 683).unwrap(), 0x0DEF);
    }

    #[test]
    fn add_clusters_links_chain_in_order() {
        let dev = device(64);
        let mut cache = crate::cache::SectorCache::new(4);
        let geo = geometry(FatWidth::Fat16, 100);
        let mut fat = FatTableState::new();

        let first = fat.add_clusters(&dev, &mut cache, &geo, 0, 3, FIRST_VALID_CLUSTER).unwrap();
        let second = fat.get_entry(&dev, &mut cache, &geo, first).unwrap();
        let third = fat.get_entry(&dev, &mut cache, &geo, second).unwrap();
        let tail = fat.get_entry(&dev, &mut cache, &geo, third).unwrap();
        assert!(geo.width.is_eof_value(tail));
    }

    #[test]
    fn unlink_chain_frees_every_cluster() {
        let dev = device(64);
        let mut cache = crate::cache::SectorCache::new(4);
        let geo = geometry(FatWidth::Fat16, 100);
        let mut fat = FatTableState::new();

        let first = fat.add_clusters(&dev, &mut cache, &geo, 0, 3, FIRST_VALID_CLUSTER).unwrap();
        fat.unlink_chain(&dev, &mut cache, &geo, first).unwrap();
        assert_eq!(fat.get_entry(&dev, &mut cache, &geo, first).unwrap(), 0);
    }

    #[test]
    fn disk_full_reports_when_scan_wraps() {
        let dev = device(16);
        let mut cache = crate::cache::SectorCache::new(4);
        let geo = geometry(FatWidth::Fat16, 2);
        let mut fat = FatTableState::new();

        let err = fat.add_clusters(&dev, &mut cache, &geo, 0, 3, FIRST_VALID_CLUSTER).unwrap_err();
        assert!(matches!(err, Error::Fat(FatError::DiskFull)));
    }
}
