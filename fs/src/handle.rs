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

//! An ergonomic handle over a [`Driver`]'s raw `u32` file handles, grounded
//! on `original_source/uFS.h`'s `DeviceIoFile`: once an operation on a file
//! fails, every later operation through that same handle short-circuits and
//! returns the same error without touching the driver again, until the
//! caller explicitly clears it.

use crate::driver::{Driver, OpenFlags, SeekMode};
use fatkit_err::{Error, Result};

/// Wraps a `Driver`'s raw handle with spec.md §7's sticky error-status
/// contract: "the file's cumulative error status is remembered and blocks
/// further operations until explicitly cleared".
pub struct FileHandle<'d> {
    driver: &'d mut dyn Driver,
    handle: u32,
    last_error: Option<Error>,
    closed: bool,
}

impl<'d> FileHandle<'d> {
    /// Opens `path` under `flags` and wraps the resulting handle.
    pub fn open(driver: &'d mut dyn Driver, path: &str, flags: OpenFlags) -> Result<Self> {
        let handle = driver.open_file(path, flags)?;
        Ok(Self {
            driver,
            handle,
            last_error: None,
            closed: false,
        })
    }

    /// The last error recorded by a gated operation, if any. Mirrors
    /// `DeviceIoFile::GetErrorStatus`.
    pub fn error_status(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    /// Clears the sticky error, returning whatever it was. Mirrors
    /// `DeviceIoFile::ClearErrorStatus`.
    pub fn clear_error_status(&mut self) -> Option<Error> {
        self.last_error.take()
    }

    pub fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        self.gate(|driver, handle| driver.read_file(handle, buffer))
    }

    pub fn write(&mut self, buffer: &[u8]) -> Result<usize> {
        self.gate(|driver, handle| driver.write_file(handle, buffer))
    }

    pub fn seek(&mut self, mode: SeekMode) -> Result<u32> {
        self.gate(|driver, handle| driver.seek_file(handle, mode))
    }

    pub fn tell(&mut self) -> Result<u32> {
        self.gate(|driver, handle| driver.tell_file(handle))
    }

    pub fn flush(&mut self) -> Result<()> {
        self.gate(|driver, handle| driver.flush_file(handle))
    }

    pub fn file_size(&mut self) -> Result<u32> {
        self.gate(|driver, handle| driver.file_size(handle))
    }

    /// Flushes and closes the underlying handle regardless of any sticky
    /// error: per `DeviceIoFile::Close`, a file "must close in any case".
    /// Returns the sticky error if one was already recorded, else whichever
    /// of flush/close failed first.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        let flush_result = self.driver.flush_file(self.handle);
        let close_result = self.driver.close_file(self.handle);
        match self.last_error.take() {
            Some(err) => Err(err),
            None => flush_result.and(close_result),
        }
    }

    /// If already in the sticky-error state, returns that error without
    /// calling the driver; otherwise runs `op` and records+returns any new
    /// error.
    fn gate<T>(&mut self, op: impl FnOnce(&mut dyn Driver, u32) -> Result<T>) -> Result<T> {
        if let Some(err) = &self.last_error {
            return Err(err.clone());
        }
        match op(&mut *self.driver, self.handle) {
            Ok(value) => Ok(value),
            Err(err) => {
                self.last_error = Some(err.clone());
                Err(err)
            }
        }
    }
}

/// Best-effort flush+close on drop, matching `~DeviceIoFile()`'s "must close
/// the file" destructor contract for a handle the caller never explicitly
/// closed. Errors here have no one left to report to, so they're discarded.
impl Drop for FileHandle<'_> {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.driver.flush_file(self.handle);
            let _ = self.driver.close_file(self.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fatkit_err::FsError;
    use std::cell::Cell;

    /// A driver stub whose `read_file` fails once `fail_after` successful
    /// calls have happened, so tests can observe the gate without a real
    /// FAT volume.
    struct FlakyDriver {
        reads: Cell<u32>,
        fail_after: u32,
        closed: Cell<bool>,
    }

    impl Driver for FlakyDriver {
        fn open_file(&mut self, _path: &str, _flags: OpenFlags) -> Result<u32> {
            Ok(0)
        }
        fn close_file(&mut self, _handle: u32) -> Result<()> {
            self.closed.set(true);
            Ok(())
        }
        fn read_file(&mut self, _handle: u32, _buffer: &mut [u8]) -> Result<usize> {
            let count = self.reads.get();
            self.reads.set(count + 1);
            if count >= self.fail_after {
                Err(Error::Fs(FsError::InvalidFilePos))
            } else {
                Ok(0)
            }
        }
        fn write_file(&mut self, _handle: u32, _buffer: &[u8]) -> Result<usize> {
            Ok(0)
        }
        fn seek_file(&mut self, _handle: u32, _mode: SeekMode) -> Result<u32> {
            Ok(0)
        }
        fn tell_file(&mut self, _handle: u32) -> Result<u32> {
            Ok(0)
        }
        fn flush_file(&mut self, _handle: u32) -> Result<()> {
            Ok(())
        }
        fn file_size(&mut self, _handle: u32) -> Result<u32> {
            Ok(0)
        }
        fn create_directory(&mut self, _path: &str) -> Result<()> {
            Ok(())
        }
        fn delete_file(&mut self, _path: &str) -> Result<()> {
            Ok(())
        }
        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
        fn free_sectors(&mut self) -> Result<u32> {
            Ok(0)
        }
    }

    #[test]
    fn error_is_sticky_until_cleared() {
        let mut driver = FlakyDriver {
            reads: Cell::new(0),
            fail_after: 1,
            closed: Cell::new(false),
        };
        let mut file = FileHandle::open(&mut driver, "a.txt", OpenFlags::empty()).unwrap();

        let mut buf = [0u8; 1];
        assert!(file.read(&mut buf).is_ok());
        assert!(file.read(&mut buf).is_err());
        assert_eq!(file.error_status(), Some(&Error::Fs(FsError::InvalidFilePos)));

        // Sticky: a further call returns the same error without reaching
        // the driver (reads count would otherwise keep climbing).
        assert!(file.read(&mut buf).is_err());
        assert_eq!(driver.reads.get(), 2);

        assert!(file.clear_error_status().is_some());
        assert!(file.error_status().is_none());
    }

    #[test]
    fn close_flushes_and_closes_even_with_sticky_error() {
        let mut driver = FlakyDriver {
            reads: Cell::new(0),
            fail_after: 0,
            closed: Cell::new(false),
        };
        let mut file = FileHandle::open(&mut driver, "a.txt", OpenFlags::empty()).unwrap();
        let mut buf = [0u8; 1];
        assert!(file.read(&mut buf).is_err());

        assert!(matches!(file.close(), Err(Error::Fs(FsError::InvalidFilePos))));
        assert!(driver.closed.get());
    }

    #[test]
    fn dropping_without_close_still_closes_the_driver_handle() {
        let mut driver = FlakyDriver {
            reads: Cell::new(0),
            fail_after: 10,
            closed: Cell::new(false),
        };
        {
            let _file = FileHandle::open(&mut driver, "a.txt", OpenFlags::empty()).unwrap();
        }
        assert!(driver.closed.get());
    }
}
