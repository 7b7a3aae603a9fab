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

pub use fatkit_err::{Error, Result};

/// Byte-addressed storage backend.
///
/// This is the host-facing half of the stack's HAL: a file, a memory-mapped
/// region, a RAM disk. [`fatkit_fs::BlockDevice`](../fatkit_fs/trait.BlockDevice.html)
/// is built on top of it for callers that need sector addressing instead.
pub trait DataStorage {
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()>;
    fn write(&self, offset: u64, buffer: &[u8]) -> Result<()>;
}
