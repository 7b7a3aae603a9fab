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

use std::{fs::OpenOptions, os::unix::fs::FileExt, path::Path};

use fatkit_ds::DataStorage;
use fatkit_err::{Error, IoError, Result};

/// A [`DataStorage`] backed by a regular file, opened for shared read/write.
pub struct DataStorageServer {
    file: std::fs::File,
}

impl DataStorageServer {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| {
                log::error!("failed to open backing file: {err}");
                Error::Io(IoError::CannotReadSector)
            })?;
        Ok(Self { file })
    }
}

impl DataStorage for DataStorageServer {
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buffer, offset).map_err(|err| {
            log::error!("read at offset {offset} failed: {err}");
            Error::Io(IoError::CannotReadSector)
        })
    }

    fn write(&self, offset: u64, buffer: &[u8]) -> Result<()> {
        self.file.write_all_at(buffer, offset).map_err(|err| {
            log::error!("write at offset {offset} failed: {err}");
            Error::Io(IoError::CannotWriteSector)
        })
    }
}
