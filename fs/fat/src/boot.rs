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

//! On-disk boot sector layouts (the BIOS Parameter Block) for FAT12/16 and
//! FAT32, plus the derived in-memory [`Geometry`] the rest of the driver
//! operates on.

use fatkit_err::{Error, FatError, Result};
use fatkit_fs::PartitionKind;
use zerocopy::{
    little_endian::{U16, U32},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

use crate::fat::FatWidth;

pub const SIGNATURE_FAT16: u16 = 0xAA55;
pub const SIGNATURE_FAT32: u32 = 0xAA550000;
pub const SIGNATURE_FSINFO_LEAD: u32 = 0x41615252;
pub const SIGNATURE_FSINFO_STRUCT: u32 = 0x61417272;

/// Fields shared by every boot sector variant, occupying the first 36
/// bytes. FAT12/16 and FAT32 boot sectors diverge only past this point.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct BootSectorCommon {
    pub jump_instruction: [u8; 3],
    pub oem_name: [u8; 8],
    pub bytes_per_sector: U16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: U16,
    pub num_fats: u8,
    pub root_entry_count: U16,
    pub total_sectors16: U16,
    pub media_descriptor: u8,
    pub fat_size16: U16,
    pub sectors_per_track: U16,
    pub num_heads: U16,
    pub hidden_sectors: U32,
    pub total_sectors32: U32,
}

/// Full 512-byte FAT12/16 boot sector.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct BootSectorFat1216 {
    pub common: BootSectorCommon,
    pub drive_number: u8,
    pub reserved1: u8,
    pub ext_signature: u8,
    pub volume_id: U32,
    pub volume_label: [u8; 11],
    pub fs_type: [u8; 8],
    pub boot_code: [u8; 448],
    pub signature: U16,
}

/// Full 512-byte FAT32 boot sector.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct BootSectorFat32 {
    pub common: BootSectorCommon,
    pub fat_size32: U32,
    pub ext_flags: U16,
    pub fs_version: U16,
    pub root_cluster: U32,
    pub fsinfo_sector: U16,
    pub backup_boot_sector: U16,
    pub reserved: [u8; 12],
    pub drive_number: u8,
    pub reserved1: u8,
    pub ext_signature: u8,
    pub volume_id: U32,
    pub volume_label: [u8; 11],
    pub fs_type: [u8; 8],
    pub boot_code: [u8; 418],
    pub signature: U32,
}

const _: () = assert!(core::mem::size_of::<BootSectorFat1216>() == 512);
const _: () = assert!(core::mem::size_of::<BootSectorFat32>() == 512);

/// FAT32 FSInfo sector (conventionally boot-relative sector 1). Treated as
/// advisory only: this stack never trusts the cached counters for
/// correctness, per §4.5 of the design notes.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FsInfoSector {
    pub lead_signature: U32,
    pub reserved1: [u8; 480],
    pub struct_signature: U32,
    pub free_cluster_count: U32,
    pub next_free_cluster: U32,
    pub reserved2: [u8; 12],
    pub trail_signature: U32,
}

const _: () = assert!(core::mem::size_of::<FsInfoSector>() == 512);

/// Logical sentinel for the FAT12/16 fixed root directory (spec.md's
/// `FIXED_ROOT`, logical −1). No real cluster index ever equals this.
pub const FIXED_ROOT: u32 = u32::MAX;
pub const NULL_CLUSTER: u32 = 0;
pub const FIRST_VALID_CLUSTER: u32 = 2;

/// Geometry derived from the boot sector: everything the FAT table, the
/// directory engine, and the file state machine need to turn a cluster or
/// byte offset into an absolute sector.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    pub width: FatWidth,
    pub sectors_per_cluster: u32,
    pub sector_to_cluster_shift: u8,
    pub reserved_sectors: u32,
    pub fat_copies: u32,
    pub sectors_per_fat: u32,
    pub root_dir_entries: u32,
    pub root_dir_cluster: u32,
    pub first_data_sector: u32,
    pub total_sectors: u32,
    pub total_clusters: u32,
    pub fsinfo_sector: Option<u32>,
}

impl Geometry {
    pub fn cluster_bytes(&self) -> u32 {
        self.sectors_per_cluster * 512
    }

    pub fn fat_start_sector(&self) -> u32 {
        self.reserved_sectors
    }

    /// Absolute sector where the FAT12/16 fixed root directory begins.
    pub fn fixed_root_start_sector(&self) -> u32 {
        self.reserved_sectors + self.fat_copies * self.sectors_per_fat
    }

    pub fn fixed_root_sector_count(&self) -> u32 {
        (self.root_dir_entries * 32).div_ceil(512)
    }

    /// First sector belonging to `cluster` (cluster indices are 1-based,
    /// with 0 and 1 reserved; the first valid index is 2).
    pub fn cluster_to_sector(&self, cluster: u32) -> u32 {
        self.first_data_sector + (cluster - FIRST_VALID_CLUSTER) * self.sectors_per_cluster
    }
}

/// Value FAT32 uses in the FSInfo sector to mean "hint unknown, rescan".
pub const FSINFO_UNKNOWN: u32 = 0xFFFFFFFF;

/// Builds a FAT32 FSInfo sector advertising `free_clusters`. The next-free
/// hint is always written as [`FSINFO_UNKNOWN`]: this stack does not track
/// an allocation cursor, so offering a stale one would be worse than
/// telling the next mounter to rescan.
pub fn build_fsinfo_sector(free_clusters: u32) -> [u8; 512] {
    let info = FsInfoSector {
        lead_signature: SIGNATURE_FSINFO_LEAD.into(),
        reserved1: [0u8; 480],
        struct_signature: SIGNATURE_FSINFO_STRUCT.into(),
        free_cluster_count: free_clusters.into(),
        next_free_cluster: FSINFO_UNKNOWN.into(),
        reserved2: [0u8; 12],
        trail_signature: SIGNATURE_FAT32.into(),
    };
    let mut sector = [0u8; 512];
    sector.copy_from_slice(info.as_bytes());
    sector
}

fn is_power_of_two(value: u32) -> bool {
    value != 0 && value & (value - 1) == 0
}

/// Maps a recognized MBR partition type byte to the FAT width it implies,
/// mirroring `original_source/uFS_FAT.cpp`'s `MountSW`, which determines FAT
/// width exclusively via a `switch` on `cPartitionType` (`PT_FAT12` → 12,
/// `PT_FAT16*` → 16, `PT_FAT32*` → 32). Returns `None` for partition types
/// `MountSW` doesn't recognize as FAT.
fn width_from_partition_kind(kind: PartitionKind) -> Option<FatWidth> {
    match kind {
        PartitionKind::Fat12 => Some(FatWidth::Fat12),
        PartitionKind::Fat16Small | PartitionKind::Fat16 | PartitionKind::Fat16Lba => Some(FatWidth::Fat16),
        PartitionKind::Fat32 | PartitionKind::Fat32Lba => Some(FatWidth::Fat32),
        PartitionKind::Extended | PartitionKind::Other(_) => None,
    }
}

/// Picks FAT width. Per spec.md §4.5 step 3, the partition-table entry's
/// type takes precedence over the boot sector when present, reproducing
/// `original_source/uFS_FAT.cpp`'s `MountSW`, which decides width solely
/// from `cPartitionType`. When no partition-table entry is available (a
/// bare FAT image mounted without an MBR), this falls back to the boot
/// sector's ASCII `fs_type` field, and then to the standard Microsoft
/// cluster-count thresholds (`< 4085` → FAT12, `< 65525` → FAT16, else
/// FAT32) when that field is absent or ambiguous — a fallback of this
/// stack's own devising for the no-partition-info case; neither the ASCII
/// tag nor the thresholds appear anywhere in `MountSW` itself.
pub fn select_width(partition_kind: Option<PartitionKind>, fs_type: &[u8; 8], total_clusters: u32) -> FatWidth {
    if let Some(width) = partition_kind.and_then(width_from_partition_kind) {
        return width;
    }
    let trimmed = fs_type
        .iter()
        .rposition(|&b| b != b' ')
        .map(|end| &fs_type[..=end])
        .unwrap_or(&fs_type[..0]);
    match trimmed {
        b"FAT12" => return FatWidth::Fat12,
        b"FAT16" => return FatWidth::Fat16,
        b"FAT32" => return FatWidth::Fat32,
        _ => {}
    }
    if total_clusters < 4085 {
        FatWidth::Fat12
    } else if total_clusters < 65525 {
        FatWidth::Fat16
    } else {
        FatWidth::Fat32
    }
}

/// Parses sector 0 of a partition into [`Geometry`], per spec.md §4.5.
///
/// `partition_kind` is the MBR partition-table entry's type, when this
/// partition was discovered through one (see `attach_mbr_partitions`); it
/// overrides the boot sector's own FAT-width signal per step 3. Pass `None`
/// when mounting a bare FAT image with no partition table.
pub fn parse_boot_sector(sector: &[u8; 512], partition_kind: Option<PartitionKind>) -> Result<Geometry> {
    let common = BootSectorCommon::read_from_bytes(&sector[..core::mem::size_of::<BootSectorCommon>()])
        .map_err(|_| Error::Fat(FatError::UnsupportedSectorSize))?;

    if common.bytes_per_sector.get() != 512 {
        log::error!("bytes per sector {} unsupported", common.bytes_per_sector.get());
        return Err(Error::Fat(FatError::UnsupportedSectorSize));
    }
    let sectors_per_cluster = common.sectors_per_cluster as u32;
    if !is_power_of_two(sectors_per_cluster) {
        log::error!("sectors per cluster {sectors_per_cluster} is not a power of two");
        return Err(Error::Fat(FatError::UnsupportedSectorSize));
    }
    let sector_to_cluster_shift = sectors_per_cluster.ilog2() as u8;

    let is_fat32 = common.fat_size16.get() == 0;
    let (sectors_per_fat, root_dir_entries, root_dir_cluster, fs_type, fsinfo_sector, signature_ok) =
        if is_fat32 {
            let boot = BootSectorFat32::read_from_bytes(sector).map_err(|_| Error::Fat(FatError::UnsupportedSectorSize))?;
            (
                boot.fat_size32.get(),
                0u32,
                boot.root_cluster.get(),
                boot.fs_type,
                Some(boot.fsinfo_sector.get() as u32),
                boot.signature.get() == SIGNATURE_FAT32,
            )
        } else {
            let boot = BootSectorFat1216::read_from_bytes(sector).map_err(|_| Error::Fat(FatError::UnsupportedSectorSize))?;
            (
                common.fat_size16.get() as u32,
                common.root_entry_count.get() as u32,
                FIXED_ROOT,
                boot.fs_type,
                None,
                boot.signature.get() == SIGNATURE_FAT16,
            )
        };

    if !signature_ok {
        log::error!("boot sector signature mismatch");
        return Err(Error::Fat(FatError::UnsupportedSectorSize));
    }

    let fat_copies = common.num_fats as u32;
    if fat_copies == 0 {
        log::error!("number of FATs must be at least 1");
        return Err(Error::Fat(FatError::UnsupportedSectorSize));
    }
    let reserved_sectors = common.reserved_sectors.get() as u32;
    let total_sectors = if common.total_sectors16.get() != 0 {
        common.total_sectors16.get() as u32
    } else {
        common.total_sectors32.get()
    };

    let root_dir_sectors = (root_dir_entries * 32).div_ceil(512);
    let first_data_sector = reserved_sectors + fat_copies * sectors_per_fat + root_dir_sectors;
    let data_sectors = total_sectors.saturating_sub(first_data_sector);
    let total_clusters = data_sectors / sectors_per_cluster;

    let width = select_width(partition_kind, &fs_type, total_clusters);
    if is_fat32 != (width == FatWidth::Fat32) {
        log::warn!("FAT width heuristic disagrees with on-disk layout; trusting layout");
    }
    let width = if is_fat32 { FatWidth::Fat32 } else if width == FatWidth::Fat32 { FatWidth::Fat16 } else { width };

    Ok(Geometry {
        width,
        sectors_per_cluster,
        sector_to_cluster_shift,
        reserved_sectors,
        fat_copies,
        sectors_per_fat,
        root_dir_entries,
        root_dir_cluster,
        first_data_sector,
        total_sectors,
        total_clusters,
        fsinfo_sector,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fat1216_sector(
        sectors_per_cluster: u8,
        reserved_sectors: u16,
        num_fats: u8,
        root_entry_count: u16,
        fat_size16: u16,
        total_sectors: u32,
        fs_type: &[u8; 8],
    ) -> [u8; 512] {
        let mut sector = [0u8; 512];
        sector[11..13].copy_from_slice(&512u16.to_le_bytes());
        sector[13] = sectors_per_cluster;
        sector[14..16].copy_from_slice(&reserved_sectors.to_le_bytes());
        sector[16] = num_fats;
        sector[17..19].copy_from_slice(&root_entry_count.to_le_bytes());
        sector[19..21].copy_from_slice(&0u16.to_le_bytes());
        sector[22..24].copy_from_slice(&fat_size16.to_le_bytes());
        sector[32..36].copy_from_slice(&total_sectors.to_le_bytes());
        sector[54..62].copy_from_slice(fs_type);
        sector[510..512].copy_from_slice(&SIGNATURE_FAT16.to_le_bytes());
        sector
    }

    #[test]
    fn select_width_trusts_fs_type_label() {
        assert_eq!(select_width(None, b"FAT12   ", 999_999), FatWidth::Fat12);
        assert_eq!(select_width(None, b"FAT16   ", 1), FatWidth::Fat16);
        assert_eq!(select_width(None, b"FAT32   ", 1), FatWidth::Fat32);
    }

    #[test]
    fn select_width_falls_back_to_cluster_count_thresholds() {
        assert_eq!(select_width(None, b"        ", 100), FatWidth::Fat12);
        assert_eq!(select_width(None, b"        ", 5000), FatWidth::Fat16);
        assert_eq!(select_width(None, b"        ", 70000), FatWidth::Fat32);
    }

    #[test]
    fn select_width_prefers_partition_table_type_over_label_and_thresholds() {
        // A misleading ASCII label and a cluster count deep in FAT16
        // territory must both lose to a FAT12 partition-table type.
        assert_eq!(select_width(Some(PartitionKind::Fat12), b"FAT32   ", 50_000), FatWidth::Fat12);
        assert_eq!(select_width(Some(PartitionKind::Fat16), b"        ", 100), FatWidth::Fat16);
        assert_eq!(select_width(Some(PartitionKind::Fat32Lba), b"        ", 100), FatWidth::Fat32);
        // An unrecognized or extended partition type carries no signal.
        assert_eq!(select_width(Some(PartitionKind::Other(0x83)), b"FAT16   ", 1), FatWidth::Fat16);
    }

    #[test]
    fn parse_boot_sector_reads_fat16_geometry() {
        let sector = fat1216_sector(8, 1, 2, 256, 4, 1 + 2 * 4 + 16 + 64 * 8, b"FAT16   ");
        let geo = parse_boot_sector(&sector, None).unwrap();

        assert_eq!(geo.width, FatWidth::Fat16);
        assert_eq!(geo.sectors_per_cluster, 8);
        assert_eq!(geo.sector_to_cluster_shift, 3);
        assert_eq!(geo.reserved_sectors, 1);
        assert_eq!(geo.fat_copies, 2);
        assert_eq!(geo.sectors_per_fat, 4);
        assert_eq!(geo.root_dir_entries, 256);
        assert_eq!(geo.root_dir_cluster, FIXED_ROOT);
        assert_eq!(geo.first_data_sector, 1 + 2 * 4 + 16);
        assert_eq!(geo.total_clusters, 64);
    }

    #[test]
    fn parse_boot_sector_prefers_partition_table_type_over_fs_type_label() {
        // Label and cluster count both say FAT16; the partition-table type
        // must win per spec.md §4.5 step 3.
        let sector = fat1216_sector(8, 1, 2, 256, 4, 1 + 2 * 4 + 16 + 64 * 8, b"FAT16   ");
        let geo = parse_boot_sector(&sector, Some(PartitionKind::Fat12)).unwrap();
        assert_eq!(geo.width, FatWidth::Fat12);
    }

    #[test]
    fn parse_boot_sector_rejects_bad_signature() {
        let mut sector = fat1216_sector(8, 1, 2, 256, 4, 200, b"FAT16   ");
        sector[510..512].copy_from_slice(&0u16.to_le_bytes());
        assert!(matches!(
            parse_boot_sector(&sector, None),
            Err(Error::Fat(FatError::UnsupportedSectorSize))
        ));
    }

    #[test]
    fn parse_boot_sector_rejects_non_power_of_two_cluster_size() {
        let sector = fat1216_sector(3, 1, 2, 512, 4, 200, b"FAT16   ");
        assert!(matches!(
            parse_boot_sector(&sector, None),
            Err(Error::Fat(FatError::UnsupportedSectorSize))
        ));
    }

    #[test]
    fn parse_boot_sector_rejects_zero_fats() {
        let sector = fat1216_sector(8, 1, 0, 512, 4, 200, b"FAT16   ");
        assert!(matches!(
            parse_boot_sector(&sector, None),
            Err(Error::Fat(FatError::UnsupportedSectorSize))
        ));
    }

    #[test]
    fn parse_boot_sector_reads_fat32_geometry() {
        let mut sector = [0u8; 512];
        sector[11..13].copy_from_slice(&512u16.to_le_bytes());
        sector[13] = 8; // sectors_per_cluster
        sector[14..16].copy_from_slice(&32u16.to_le_bytes()); // reserved_sectors
        sector[16] = 2; // num_fats
        sector[17..19].copy_from_slice(&0u16.to_le_bytes()); // root_entry_count = 0 for FAT32
        sector[19..21].copy_from_slice(&0u16.to_le_bytes()); // total_sectors16 = 0
        sector[22..24].copy_from_slice(&0u16.to_le_bytes()); // fat_size16 = 0 selects FAT32
        let fat_size32: u32 = 100;
        sector[36..40].copy_from_slice(&fat_size32.to_le_bytes());
        let root_cluster: u32 = 2;
        sector[44..48].copy_from_slice(&root_cluster.to_le_bytes());
        let total_sectors: u32 = 32 + 2 * 100 + 10_000 * 8;
        sector[32..36].copy_from_slice(&total_sectors.to_le_bytes());
        sector[82..90].copy_from_slice(b"FAT32   ");
        sector[508..512].copy_from_slice(&SIGNATURE_FAT32.to_le_bytes());

        let geo = parse_boot_sector(&sector, None).unwrap();
        assert_eq!(geo.width, FatWidth::Fat32);
        assert_eq!(geo.root_dir_cluster, 2);
        assert_eq!(geo.root_dir_entries, 0);
        assert_eq!(geo.sectors_per_fat, 100);
        assert_eq!(geo.first_data_sector, 32 + 2 * 100);
        assert_eq!(geo.total_clusters, 10_000);
    }
}
