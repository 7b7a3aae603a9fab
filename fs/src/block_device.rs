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

use fatkit_ds::DataStorage;
use fatkit_err::Result;

/// The only sector size this stack supports.
pub const SECTOR_SIZE: usize = 512;

/// Raw sector-addressed storage, the host-facing half of the FAT HAL.
///
/// Generalizes [`fatkit_ds::DataStorage`]'s byte addressing to the LBA
/// addressing FAT geometry is expressed in.
pub trait BlockDevice {
    fn read_sector(&self, lba: u32, buffer: &mut [u8; SECTOR_SIZE]) -> Result<()>;

    fn write_sector(&self, lba: u32, buffer: &[u8; SECTOR_SIZE]) -> Result<()>;

    fn sector_size(&self) -> u16 {
        SECTOR_SIZE as u16
    }

    /// One of `"ATA"`, `"FAT"`, `"FAT32"`; used by [`crate::VolumeManager`] for
    /// path routing.
    fn driver_id(&self) -> &str;
}

/// Adapts a byte-addressed [`DataStorage`] into a sector-addressed
/// [`BlockDevice`], so host backends written against the data-storage
/// interface (e.g. `fatkit_ds_std::DataStorageServer`) keep working
/// unchanged underneath the FAT stack.
pub struct ByteAddressed<DS> {
    storage: DS,
    driver_id: String,
}

impl<DS: DataStorage> ByteAddressed<DS> {
    pub fn new(storage: DS, driver_id: impl Into<String>) -> Self {
        Self {
            storage,
            driver_id: driver_id.into(),
        }
    }

    pub fn into_inner(self) -> DS {
        self.storage
    }
}

impl<DS: DataStorage> BlockDevice for ByteAddressed<DS> {
    fn read_sector(&self, lba: u32, buffer: &mut [u8; SECTOR_SIZE]) -> Result<()> {
        self.storage.read(lba as u64 * SECTOR_SIZE as u64, buffer)
    }

    fn write_sector(&self, lba: u32, buffer: &[u8; SECTOR_SIZE]) -> Result<()> {
        self.storage.write(lba as u64 * SECTOR_SIZE as u64, buffer)
    }

    fn driver_id(&self) -> &str {
        &self.driver_id
    }
}

/// Translates partition-relative LBAs to absolute ones.
///
/// This is the thin adapter `VolumeManager` hands to each mounted FAT
/// driver so the driver never has to know where on the underlying device
/// its partition begins. `D` is held by value rather than by reference so
/// a single physical device can back several `PartitionDevice`s at once by
/// instantiating `D = Rc<Underlying>` (see `BlockDevice for Rc<D>` below);
/// a caller with exactly one partition can just as well instantiate
/// `D = Underlying` directly and pay no indirection.
pub struct PartitionDevice<D: BlockDevice> {
    device: D,
    lba_start: u32,
}

impl<D: BlockDevice> PartitionDevice<D> {
    pub fn new(device: D, lba_start: u32) -> Self {
        Self { device, lba_start }
    }

    pub fn lba_start(&self) -> u32 {
        self.lba_start
    }
}

impl<D: BlockDevice> BlockDevice for PartitionDevice<D> {
    fn read_sector(&self, lba: u32, buffer: &mut [u8; SECTOR_SIZE]) -> Result<()> {
        self.device.read_sector(self.lba_start + lba, buffer)
    }

    fn write_sector(&self, lba: u32, buffer: &[u8; SECTOR_SIZE]) -> Result<()> {
        self.device.write_sector(self.lba_start + lba, buffer)
    }

    fn driver_id(&self) -> &str {
        self.device.driver_id()
    }
}

/// Lets several `PartitionDevice`s share one physical device: the MBR path
/// in `fatkit_fs_fat` mounts one `FatFs` per recognized partition entry, all
/// reading/writing through the same underlying disk.
impl<D: BlockDevice + ?Sized> BlockDevice for std::rc::Rc<D> {
    fn read_sector(&self, lba: u32, buffer: &mut [u8; SECTOR_SIZE]) -> Result<()> {
        (**self).read_sector(lba, buffer)
    }

    fn write_sector(&self, lba: u32, buffer: &[u8; SECTOR_SIZE]) -> Result<()> {
        (**self).write_sector(lba, buffer)
    }

    fn driver_id(&self) -> &str {
        (**self).driver_id()
    }
}
