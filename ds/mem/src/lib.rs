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

use std::cell::RefCell;

use fatkit_ds::DataStorage;
use fatkit_err::{Error, IoError, Result};

/// A [`DataStorage`] backed by a growable in-memory buffer.
///
/// Stands in for the original C++ test harness's `VirtualDisk`: a disk image
/// that lives entirely in memory so round-trip tests don't touch the
/// filesystem.
pub struct DataStorageServer {
    data: RefCell<Vec<u8>>,
}

impl DataStorageServer {
    pub fn new(size: usize) -> Self {
        Self {
            data: RefCell::new(vec![0u8; size]),
        }
    }

    pub fn len(&self) -> usize {
        self.data.borrow().len()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data.into_inner()
    }
}

impl DataStorage for DataStorageServer {
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        let data = self.data.borrow();
        let start = offset as usize;
        let end = start + buffer.len();
        let slice = data.get(start..end).ok_or_else(|| {
            log::error!("read out of bounds: offset={offset} len={}", buffer.len());
            Error::Io(IoError::CannotReadSector)
        })?;
        buffer.copy_from_slice(slice);
        Ok(())
    }

    fn write(&self, offset: u64, buffer: &[u8]) -> Result<()> {
        let mut data = self.data.borrow_mut();
        let start = offset as usize;
        let end = start + buffer.len();
        let slice = data.get_mut(start..end).ok_or_else(|| {
            log::error!("write out of bounds: offset={offset} len={}", buffer.len());
            Error::Io(IoError::CannotWriteSector)
        })?;
        slice.copy_from_slice(buffer);
        Ok(())
    }
}
