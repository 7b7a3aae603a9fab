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

//! Routes path-prefixed requests (`\<driver_id>\<volume_index>\<path>`) to
//! the partition driver that owns them, and aggregates volume enumeration
//! and flush/free-space queries across all mounted drivers.

use fatkit_err::{Error, FsError, Result};

use crate::driver::Driver;

struct MountedVolume {
    driver_id: String,
    volume_index: u8,
    driver: Box<dyn Driver>,
}

/// Owns the list of mounted partition drivers. Mutated only by
/// `attach`/`detach`; in the single-threaded contract the rest of the stack
/// assumes, a plain `&mut` borrow through this manager gives the exclusivity
/// the donor's advisory driver lock provided.
#[derive(Default)]
pub struct VolumeManager {
    volumes: Vec<MountedVolume>,
}

impl VolumeManager {
    pub fn new() -> Self {
        Self { volumes: Vec::new() }
    }

    /// Registers a mounted driver under `\<driver_id>\<volume_index>\`.
    pub fn attach(&mut self, driver_id: impl Into<String>, volume_index: u8, driver: Box<dyn Driver>) {
        self.volumes.push(MountedVolume {
            driver_id: driver_id.into(),
            volume_index,
            driver,
        });
    }

    /// Unmounts the driver at `\<driver_id>\<volume_index>\`, flushing it
    /// first. Returns the flush result; the driver is removed regardless.
    pub fn detach(&mut self, driver_id: &str, volume_index: u8) -> Result<()> {
        let position = self
            .volumes
            .iter()
            .position(|v| v.driver_id == driver_id && v.volume_index == volume_index)
            .ok_or(Error::Fs(FsError::FileNotFound))?;
        let mut volume = self.volumes.remove(position);
        volume.driver.flush()
    }

    /// Splits `\<driver_id>\<volume_index>\<rest>` and resolves the matching
    /// mounted driver, returning it together with the remaining path.
    pub fn resolve<'a>(&mut self, path: &'a str) -> Result<(&mut dyn Driver, &'a str)> {
        let (driver_id, volume_index, rest) = parse_routed_path(path)?;
        let volume = self
            .volumes
            .iter_mut()
            .find(|v| v.driver_id == driver_id && v.volume_index == volume_index)
            .ok_or(Error::Fs(FsError::FileNotFound))?;
        Ok((volume.driver.as_mut(), rest))
    }

    /// Flushes every mounted driver. Matches the donor's `Flush()`, whose
    /// final branch falls through without an explicit `return`: the
    /// intended behavior, preserved here, is "OK if every driver flushed
    /// cleanly, else the last error encountered".
    pub fn flush(&mut self) -> Result<()> {
        let mut last_err = None;
        for volume in &mut self.volumes {
            if let Err(err) = volume.driver.flush() {
                last_err = Some(err);
            }
        }
        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Resolves `\<driver_id>\<volume_index>\...` and returns that volume's
    /// free-cluster count. Grounded on the donor's
    /// `DeviceIoManager::GetNrOfFreeSectors`, which routes a path to its
    /// owning driver and delegates rather than aggregating across mounts.
    pub fn free_sectors(&mut self, path: &str) -> Result<u32> {
        let (driver, _) = self.resolve(path)?;
        driver.free_sectors()
    }

    /// Number of currently mounted volumes.
    pub fn volume_count(&self) -> usize {
        self.volumes.len()
    }

    pub fn iter_volume_ids(&self) -> impl Iterator<Item = (&str, u8)> + '_ {
        self.volumes.iter().map(|v| (v.driver_id.as_str(), v.volume_index))
    }
}

/// Parses `\<driver_id>\<volume_index>\<rest>`, where `volume_index` is a
/// single ASCII digit.
fn parse_routed_path(path: &str) -> Result<(&str, u8, &str)> {
    let trimmed = path.strip_prefix('\\').unwrap_or(path);
    let mut parts = trimmed.splitn(3, '\\');
    let driver_id = parts.next().filter(|s| !s.is_empty());
    let volume_index = parts.next().filter(|s| !s.is_empty());
    let rest = parts.next().unwrap_or("");

    let (Some(driver_id), Some(volume_index)) = (driver_id, volume_index) else {
        return Err(Error::Fs(FsError::IllegalFilename));
    };
    if volume_index.len() != 1 || !volume_index.as_bytes()[0].is_ascii_digit() {
        return Err(Error::Fs(FsError::IllegalFilename));
    }
    let volume_index = volume_index.as_bytes()[0] - b'0';
    Ok((driver_id, volume_index, rest))
}
