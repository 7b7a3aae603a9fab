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

use fatkit_err::Result;

bitflags::bitflags! {
    /// Bit-OR combinable flags accepted by [`Driver::open_file`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Permit writes.
        const WRITABLE = 0x01;
        /// Truncate on open. Implies `WRITABLE`.
        const RESET = 0x02;
        /// Create the file if it does not exist.
        const CREATE = 0x04;
    }
}

/// `Begin`/`Current`/`End`-relative seek, mirroring the donor's `seekMode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    Begin(u32),
    Current(i64),
    /// A non-negative offset subtracted from `file_size`.
    End(u32),
}

/// Outcome of a directory-entry lookup, replacing the donor's sentinel
/// integer return (`IO_MATCH_ENTRY`/`IO_EMPTY_ENTRY`/`IO_FILE_NOT_FOUND`)
/// with a Rust-native enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOutcome {
    Match,
    Empty,
    NotFound,
}

/// The capability set a mounted partition driver (FAT12/16/32, or any other
/// file system this stack grows to support) exposes to [`crate::VolumeManager`].
///
/// A `u32` handle identifies an open file within a single driver; drivers
/// hand these out from a fixed-size pool and reject operations against a
/// handle whose slot has since been released.
pub trait Driver {
    fn open_file(&mut self, path: &str, flags: OpenFlags) -> Result<u32>;

    fn close_file(&mut self, handle: u32) -> Result<()>;

    fn read_file(&mut self, handle: u32, buffer: &mut [u8]) -> Result<usize>;

    fn write_file(&mut self, handle: u32, buffer: &[u8]) -> Result<usize>;

    fn seek_file(&mut self, handle: u32, mode: SeekMode) -> Result<u32>;

    fn tell_file(&mut self, handle: u32) -> Result<u32>;

    fn flush_file(&mut self, handle: u32) -> Result<()>;

    fn file_size(&mut self, handle: u32) -> Result<u32>;

    fn create_directory(&mut self, path: &str) -> Result<()>;

    fn delete_file(&mut self, path: &str) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    fn free_sectors(&mut self) -> Result<u32>;
}
