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

pub use fatkit_err::*;

mod block_device;
mod clock;
mod driver;
mod handle;
mod mbr;
mod volume;

pub use block_device::{ByteAddressed, PartitionDevice, BlockDevice, SECTOR_SIZE};
pub use clock::{Clock, DefaultClock, Timestamp};
pub use driver::{Driver, LookupOutcome, OpenFlags, SeekMode};
pub use handle::FileHandle;
pub use mbr::{ChsAddress, Mbr, PartitionKind, PartitionTableEntry, MBR_SIGNATURE};
pub use volume::VolumeManager;
