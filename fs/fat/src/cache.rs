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

//! Fixed-size, write-through sector cache. Callers lock a sector to mutate
//! it in place and unlock to flush; LRU among unlocked entries picks the
//! eviction victim.
//!
//! The donor hands out raw pointers into cache slots; Rust's borrow
//! checker cannot express a pointer into a cache slot that outlives the
//! borrow of the cache. This rendition hands out an owned snapshot for
//! read-only locks and a `Copy` [`CacheHandle`] (entry index + generation)
//! for writable locks, redeemed through [`SectorCache::get_mut`] /
//! [`SectorCache::unlock`].

use fatkit_err::{Error, FatError, Result};
use fatkit_fs::{BlockDevice, SECTOR_SIZE};

pub const DEFAULT_CACHE_SIZE: usize = 4;

struct CacheEntry {
    lba: Option<u32>,
    buffer: [u8; SECTOR_SIZE],
    writable: bool,
    lock_count: u16,
    last_access: u32,
    generation: u32,
}

impl CacheEntry {
    fn empty() -> Self {
        Self {
            lba: None,
            buffer: [0u8; SECTOR_SIZE],
            writable: false,
            lock_count: 0,
            last_access: 0,
            generation: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheHandle {
    index: usize,
    generation: u32,
}

pub struct SectorCache {
    entries: Vec<CacheEntry>,
    now: u32,
}

impl SectorCache {
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "sector cache must hold at least one entry");
        SectorCache {
            entries: (0..size).map(|_| CacheEntry::empty()).collect(),
            now: 0,
        }
    }

    fn entry_mut(&mut self, handle: CacheHandle) -> Result<&mut CacheEntry> {
        let entry = &mut self.entries[handle.index];
        if entry.generation != handle.generation {
            log::error!("stale cache handle at slot {}", handle.index);
            return Err(Error::Fat(FatError::CorruptFat));
        }
        Ok(entry)
    }

    /// Locks `lba` for read-only access and returns a snapshot of its
    /// contents. Does not consume a permanent slot: the returned buffer is
    /// owned, so there is nothing further to unlock.
    pub fn lock_read<D: BlockDevice>(&mut self, device: &D, lba: u32) -> Result<[u8; SECTOR_SIZE]> {
        let handle = self.lock(device, lba, false, true)?;
        let snapshot = self.entries[handle.index].buffer;
        self.unlock_no_writeback(handle);
        Ok(snapshot)
    }

    /// Locks `lba`, optionally preloading its current contents, and
    /// returns a handle redeemable via [`Self::get_mut`] / [`Self::unlock`].
    pub fn lock<D: BlockDevice>(&mut self, device: &D, lba: u32, writable: bool, preload: bool) -> Result<CacheHandle> {
        if let Some(index) = self.entries.iter().position(|e| e.lba == Some(lba)) {
            let entry = &mut self.entries[index];
            entry.writable |= writable;
            entry.lock_count += 1;
            return Ok(CacheHandle {
                index,
                generation: entry.generation,
            });
        }

        let victim = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.lock_count == 0)
            .max_by_key(|(_, e)| self.now.wrapping_sub(e.last_access))
            .map(|(index, _)| index);

        let Some(index) = victim else {
            debug_assert!(false, "sector cache exhausted: no free entry to evict");
            log::error!("sector cache exhausted (size={})", self.entries.len());
            return Err(Error::Fat(FatError::CorruptFat));
        };

        let mut buffer = [0u8; SECTOR_SIZE];
        if preload {
            device.read_sector(lba, &mut buffer)?;
        }

        let entry = &mut self.entries[index];
        entry.lba = Some(lba);
        entry.buffer = buffer;
        entry.writable = writable;
        entry.lock_count = 1;
        entry.generation = entry.generation.wrapping_add(1);
        Ok(CacheHandle {
            index,
            generation: entry.generation,
        })
    }

    pub fn get(&self, handle: CacheHandle) -> Result<&[u8; SECTOR_SIZE]> {
        let entry = &self.entries[handle.index];
        if entry.generation != handle.generation {
            return Err(Error::Fat(FatError::CorruptFat));
        }
        Ok(&entry.buffer)
    }

    pub fn get_mut(&mut self, handle: CacheHandle) -> Result<&mut [u8; SECTOR_SIZE]> {
        let entry = self.entry_mut(handle)?;
        Ok(&mut entry.buffer)
    }

    /// Writes back through `device` if the entry is still marked writable,
    /// then releases the lock. The entry is considered unlocked even if
    /// the write fails.
    pub fn unlock<D: BlockDevice>(&mut self, device: &D, handle: CacheHandle) -> Result<()> {
        let entry = self.entry_mut(handle)?;
        let result = if entry.writable {
            let lba = entry.lba.expect("locked entry always has an lba");
            device.write_sector(lba, &entry.buffer)
        } else {
            Ok(())
        };
        entry.writable = false;
        entry.lock_count = entry.lock_count.saturating_sub(1);
        self.now = self.now.wrapping_add(1);
        entry.last_access = self.now;
        result
    }

    fn unlock_no_writeback(&mut self, handle: CacheHandle) {
        if let Ok(entry) = self.entry_mut(handle) {
            entry.writable = false;
            entry.lock_count = entry.lock_count.saturating_sub(1);
            self.now = self.now.wrapping_add(1);
            entry.last_access = self.now;
        }
    }

    /// Writes back every entry still marked writable (mount-time
    /// `flush`/unmount). Returns the last error encountered, if any, after
    /// attempting every entry.
    pub fn flush<D: BlockDevice>(&mut self, device: &D) -> Result<()> {
        let mut last_err = None;
        for entry in &mut self.entries {
            if entry.writable {
                let lba = entry.lba.expect("writable entry always has an lba");
                if let Err(err) = device.write_sector(lba, &entry.buffer) {
                    last_err = Some(err);
                } else {
                    entry.writable = false;
                }
            }
        }
        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Invalidates every entry without writing back (mount-time `reset`).
    pub fn reset(&mut self) {
        for entry in &mut self.entries {
            entry.lba = None;
            entry.writable = false;
            entry.lock_count = 0;
            entry.generation = entry.generation.wrapping_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fatkit_ds_mem::DataStorageServer;
    use fatkit_fs::ByteAddressed;

    fn device(sectors: usize) -> ByteAddressed<DataStorageServer> {
        ByteAddressed::new(DataStorageServer::new(sectors * SECTOR_SIZE), "FAT")
    }

    #[test]
    fn write_through_persists_on_unlock() {
        let dev = device(4);
        let mut cache = SectorCache::new(2);
        let handle = cache.lock(&dev, 0, true, true).unwrap();
        cache.get_mut(handle).unwrap()[0] = 0x42;
        cache.unlock(&dev, handle).unwrap();

        let snapshot = cache.lock_read(&dev, 0).unwrap();
        assert_eq!(snapshot[0], 0x42);
    }

    #[test]
    fn lru_evicts_oldest_unlocked_entry() {
        let dev = device(8);
        let mut cache = SectorCache::new(2);
        let a = cache.lock(&dev, 0, false, true).unwrap();
        cache.unlock(&dev, a).unwrap();
        let b = cache.lock(&dev, 1, false, true).unwrap();
        cache.unlock(&dev, b).unwrap();
        // Both slots are now unlocked; slot for lba 0 is older and should
        // be the one evicted when a third distinct lba is locked.
        let c = cache.lock(&dev, 2, false, true).unwrap();
        assert!(cache.get(c).is_ok());
        assert_eq!(cache.entries.iter().filter(|e| e.lba == Some(1)).count(), 1);
    }

    #[test]
    fn hit_is_sticky_for_writable() {
        let dev = device(4);
        let mut cache = SectorCache::new(2);
        let a = cache.lock(&dev, 0, false, true).unwrap();
        let b = cache.lock(&dev, 0, true, false).unwrap();
        assert_eq!(a, b);
        cache.unlock(&dev, b).unwrap();
    }
}
