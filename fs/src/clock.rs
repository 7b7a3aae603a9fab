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

/// A directory-entry timestamp, decomposed the way DOS stores it:
/// `month`/`day` are zero-based, `year` is an absolute calendar year (not an
/// offset from 1980).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub centisecond: u8,
}

/// Injected time source for stamping directory entries on create/write.
pub trait Clock {
    fn now(&self) -> Timestamp;
}

/// Returns the FAT epoch, matching the donor's fallback clock.
#[derive(Debug, Clone, Copy)]
pub struct DefaultClock;

impl Clock for DefaultClock {
    fn now(&self) -> Timestamp {
        Timestamp {
            year: 1980,
            month: 0,
            day: 0,
            hour: 0,
            minute: 0,
            second: 0,
            centisecond: 0,
        }
    }
}
