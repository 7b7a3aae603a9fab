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

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Not implemented")]
    Unimplemented,
    #[error("IO: {0}")]
    Io(IoError),
    #[error("FS: {0}")]
    Fs(FsError),
    #[error("FAT: {0}")]
    Fat(FatError),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IoError {
    #[error("Read-only")]
    ReadOnly,
    #[error("Cannot read sector")]
    CannotReadSector,
    #[error("Cannot write sector")]
    CannotWriteSector,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("Inconsistent")]
    Inconsistent,
    #[error("Index")]
    Index,
    #[error("File not found")]
    FileNotFound,
    #[error("File or directory already exists")]
    FileOrDirExists,
    #[error("File already open")]
    FileOpen,
    #[error("File already closed")]
    AlreadyClosed,
    #[error("Invalid file position")]
    InvalidFilePos,
    #[error("Cannot open file")]
    CannotOpen,
    #[error("Cannot write file")]
    CannotWriteFile,
    #[error("Out of file handles")]
    OutOfFileHandles,
    #[error("Illegal filename")]
    IllegalFilename,
    #[error("Wrong attributes")]
    WrongAttributes,
    #[error("Not a directory")]
    NotADirectory,
    #[error("Directory not empty")]
    DirectoryNotEmpty,
}

/// Structural errors. Unlike [`FsError`], these render the mount they occurred
/// on unusable: the on-disk invariants the rest of the stack relies on no
/// longer hold.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FatError {
    #[error("Disk full")]
    DiskFull,
    #[error("Corrupt FAT")]
    CorruptFat,
    #[error("Invalid cluster")]
    InvalidCluster,
    #[error("Unsupported sector size")]
    UnsupportedSectorSize,
    #[error("Unknown partition type")]
    UnknownPartitionType,
}

pub type Result<T> = core::result::Result<T, Error>;
