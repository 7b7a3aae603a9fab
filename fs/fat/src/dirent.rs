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

//! The 32-byte on-disk directory entry, its attribute bitfield, and 8.3
//! short-filename canonicalization, grounded on
//! `original_source/fatdefs.cpp`'s `SetDosFilename`/`GetDosFilename`/
//! `CompareDosFilename`.

use zerocopy::{little_endian::U16, little_endian::U32, FromBytes, Immutable, IntoBytes, KnownLayout};

/// First-byte sentinels for [`DirEntry::name`].
pub const ENTRY_FREE_END: u8 = 0x00;
pub const ENTRY_DELETED: u8 = 0xE5;
/// On-disk stand-in for a first byte that is literally `0xE5`.
pub const ENTRY_ESCAPED_E5: u8 = 0x05;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Attributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN = 0x02;
        const SYSTEM = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE = 0x20;
    }
}

/// The four low bits set together (and no others) mark an LFN entry; this
/// is not a flag combination a normal short entry ever carries.
pub const LFN_ATTR: u8 = 0x0F;

pub fn is_lfn_attr(raw: u8) -> bool {
    raw == LFN_ATTR
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct DirEntry {
    pub name: [u8; 8],
    pub ext: [u8; 3],
    pub attributes: u8,
    pub reserved_nt: u8,
    pub create_time_tenth: u8,
    pub create_time: U16,
    pub create_date: U16,
    pub last_access_date: U16,
    pub start_cluster_hi: U16,
    pub last_mod_time: U16,
    pub last_mod_date: U16,
    pub start_cluster_lo: U16,
    pub file_size: U32,
}

const _: () = assert!(core::mem::size_of::<DirEntry>() == 32);

impl DirEntry {
    pub const EMPTY: DirEntry = DirEntry {
        name: [0; 8],
        ext: [0; 3],
        attributes: 0,
        reserved_nt: 0,
        create_time_tenth: 0,
        create_time: U16::ZERO,
        create_date: U16::ZERO,
        last_access_date: U16::ZERO,
        start_cluster_hi: U16::ZERO,
        last_mod_time: U16::ZERO,
        last_mod_date: U16::ZERO,
        start_cluster_lo: U16::ZERO,
        file_size: U32::ZERO,
    };

    pub fn attributes(&self) -> Attributes {
        Attributes::from_bits_truncate(self.attributes)
    }

    pub fn is_lfn(&self) -> bool {
        is_lfn_attr(self.attributes)
    }

    pub fn is_free(&self) -> bool {
        self.name[0] == ENTRY_FREE_END || self.name[0] == ENTRY_DELETED
    }

    pub fn is_end_of_directory(&self) -> bool {
        self.name[0] == ENTRY_FREE_END
    }

    pub fn start_cluster(&self) -> u32 {
        ((self.start_cluster_hi.get() as u32) << 16) | self.start_cluster_lo.get() as u32
    }

    pub fn set_start_cluster(&mut self, cluster: u32) {
        self.start_cluster_hi = U16::new((cluster >> 16) as u16);
        self.start_cluster_lo = U16::new(cluster as u16);
    }

    pub fn mark_deleted(&mut self) {
        self.name[0] = ENTRY_DELETED;
        self.set_start_cluster(0);
        self.file_size = U32::new(0);
    }
}

/// The alternate 32-byte interpretation used by LFN entries. Long names are
/// out of scope here; this struct exists only so traversal can recognize
/// and skip these slots without misreading them as short entries.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct LongNameDirEntry {
    pub order: u8,
    pub name1: [U16; 5],
    pub attributes: u8,
    pub entry_type: u8,
    pub checksum: u8,
    pub name2: [U16; 6],
    pub start_cluster_lo: U16,
    pub name3: [U16; 2],
}

const _: () = assert!(core::mem::size_of::<LongNameDirEntry>() == 32);

/// Address of a directory entry: `FIXED_ROOT` (see `boot::FIXED_ROOT`) as
/// `cluster` denotes the FAT12/16 fixed root, in which case `sector_offset`
/// is an absolute sector count rather than cluster-relative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntryAddress {
    pub cluster: u32,
    pub sector_offset: u32,
    pub index_in_sector: u8,
}

const SPECIAL_DOS_CHARS: &[u8] = b"-+=;,&$%_@[]{}~'`!#()\x96";

fn is_valid_dos_char(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || SPECIAL_DOS_CHARS.contains(&byte)
}

const RESERVED_DOS_FILENAMES: &[&str] = &[
    "NUL", "COM1", "COM2", "COM3", "COM4", "LPT1", "LPT2", "LPT3", "PRN",
];

fn is_reserved_dos_filename(base: &str) -> bool {
    RESERVED_DOS_FILENAMES
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(base))
}

/// Canonicalizes `input` (e.g. `"readme.txt"`) into the packed 11-byte
/// on-disk form (8 name bytes + 3 extension bytes, space-padded,
/// uppercased). Returns `None` for anything that does not fit an 8.3 name.
pub fn set_dos_filename(input: &str) -> Option<[u8; 11]> {
    let (base, ext) = match input.split_once('.') {
        Some((base, ext)) => (base, ext),
        None => (input, ""),
    };
    if base.is_empty() || is_reserved_dos_filename(base) {
        return None;
    }
    if base.len() > 8 || ext.len() > 3 {
        return None;
    }

    let mut packed = [b' '; 11];
    for (i, byte) in base.bytes().enumerate() {
        let upper = byte.to_ascii_uppercase();
        if !is_valid_dos_char(upper) {
            return None;
        }
        packed[i] = upper;
    }
    for (i, byte) in ext.bytes().enumerate() {
        let upper = byte.to_ascii_uppercase();
        if !is_valid_dos_char(upper) {
            return None;
        }
        packed[8 + i] = upper;
    }
    Some(packed)
}

/// Inverse of [`set_dos_filename`]: reconstructs a display name from a
/// directory entry's raw `name`/`ext` fields.
pub fn get_dos_filename(name: &[u8; 8], ext: &[u8; 3]) -> String {
    let mut first = name[0];
    if first == ENTRY_ESCAPED_E5 {
        first = ENTRY_DELETED;
    }
    let base_end = name[1..].iter().position(|&b| b == b' ').map(|p| p + 1).unwrap_or(8);
    let mut out = String::with_capacity(12);
    out.push(first as char);
    for &byte in &name[1..base_end] {
        out.push(byte as char);
    }
    let ext_end = ext.iter().position(|&b| b == b' ').unwrap_or(3);
    if ext_end > 0 {
        out.push('.');
        for &byte in &ext[..ext_end] {
            out.push(byte as char);
        }
    }
    out
}

/// Compares a directory entry's packed name against `name`, case- and
/// trailing-space-insensitively. Deleted entries never match.
pub fn compare_dos_filename(entry: &DirEntry, name: &str) -> bool {
    if entry.name[0] == ENTRY_DELETED {
        return false;
    }
    let Some(packed) = set_dos_filename(name) else {
        return false;
    };
    if entry.name[0] == ENTRY_ESCAPED_E5 && packed[0] != ENTRY_DELETED {
        return false;
    }
    entry.name == packed[..8] && entry.ext == packed[8..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_simple_name() {
        assert_eq!(set_dos_filename("a.txt").unwrap(), *b"A       TXT");
    }

    #[test]
    fn rejects_reserved_name() {
        assert!(set_dos_filename("nul.txt").is_none());
        assert!(set_dos_filename("com1").is_none());
    }

    #[test]
    fn accepts_special_dos_chars_including_backtick() {
        assert!(set_dos_filename("a`b.txt").is_some());
        for &ch in SPECIAL_DOS_CHARS {
            assert!(is_valid_dos_char(ch), "{ch:#04x} should be a valid DOS char");
        }
    }

    #[test]
    fn rejects_overlong_components() {
        assert!(set_dos_filename("toolongname.txt").is_none());
        assert!(set_dos_filename("a.toolong").is_none());
    }

    #[test]
    fn canonicalize_is_idempotent() {
        let packed = set_dos_filename("README.TXT").unwrap();
        let rendered = get_dos_filename(&packed[..8].try_into().unwrap(), &packed[8..].try_into().unwrap());
        assert_eq!(set_dos_filename(&rendered).unwrap(), packed);
    }

    #[test]
    fn compares_ignoring_case() {
        let mut entry = DirEntry::EMPTY;
        entry.name = *b"README  ";
        entry.ext = *b"TXT";
        assert!(compare_dos_filename(&entry, "readme.txt"));
        assert!(!compare_dos_filename(&entry, "readme.md"));
    }

    #[test]
    fn deleted_entry_never_matches() {
        let mut entry = DirEntry::EMPTY;
        entry.name = *b"README  ";
        entry.ext = *b"TXT";
        entry.name[0] = ENTRY_DELETED;
        assert!(!compare_dos_filename(&entry, "readme.txt"));
    }
}
