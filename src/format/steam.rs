//! Structures shared by Steam's cache files (GCF) and non-cache files (NCF):
//! the file header, the directory, the directory map, and the checksum tables.
//!
//! The directory is a flat array of entries linked into a tree by index:
//! each folder names its first child, and each child names its next sibling.
//! Entry 0 is the root.

use std::borrow::Cow;
use std::collections::HashSet;
use std::io::Read;

use log::*;

use crate::arch::usize;
use crate::checksum::{read_chunk, SteamChecksum, CHUNK_SIZE};
use crate::format::record::*;
use crate::mapping::Mapping;
use crate::package::{Attribute, Validation};
use crate::result::*;
use crate::tree::{DirectoryTree, FileEntry};

pub const CACHE_HEADER_SIZE: u64 = 44;
const DIRECTORY_HEADER_SIZE: u64 = 56;
const DIRECTORY_ENTRY_SIZE: u64 = 28;
const DIRECTORY_MAP_HEADER_SIZE: u64 = 8;
const CHECKSUM_HEADER_SIZE: u64 = 8;
const CHECKSUM_MAP_HEADER_SIZE: u64 = 16;
const CHECKSUM_MAP_ENTRY_SIZE: u64 = 8;

// Directory entry flags
pub const FLAG_FILE: u32 = 0x4000;
pub const FLAG_ENCRYPTED: u32 = 0x100;
pub const FLAG_BACKUP_LOCAL: u32 = 0x40;
pub const FLAG_COPY_LOCAL: u32 = 0xa;
pub const FLAG_NO_OVERWRITE: u32 = 0x1;

/// Marks an item without checksums, or the end of a sibling list
pub const NO_INDEX: u32 = 0xffff_ffff;

/// The header at the very start of GCF and NCF files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHeader {
    pub major_version: u32,
    pub minor_version: u32,
    pub cache_id: u32,
    pub last_version_played: u32,
    pub file_size: u32,
    pub block_size: u32,
    pub block_count: u32,
}

impl CacheHeader {
    /// Reads the header, checking its major version and that the file is as big as it says.
    pub fn parse(mapping: &Mapping, format: &'static str, major_version: u32) -> PakResult<Self> {
        let header = mapping.map_record("cache file header", 0, CACHE_HEADER_SIZE)?;
        let mut fields = &header[..];
        let dummy0 = read_u32(&mut fields);
        let major = read_u32(&mut fields);
        if dummy0 != 1 || major != major_version {
            return Err(FormatError::InvalidSignature {
                format,
                found: describe_signature(&header[..8]),
            }
            .into());
        }
        let minor_version = read_u32(&mut fields);
        let cache_id = read_u32(&mut fields);
        let last_version_played = read_u32(&mut fields);
        let _dummy1 = read_u32(&mut fields);
        let _dummy2 = read_u32(&mut fields);
        let file_size = read_u32(&mut fields);
        let block_size = read_u32(&mut fields);
        let block_count = read_u32(&mut fields);

        if u64::from(file_size) != mapping.len() {
            warn!(
                "{} header claims the file is {} bytes, but it's {}",
                format,
                file_size,
                mapping.len()
            );
        }

        let header = Self {
            major_version: major,
            minor_version,
            cache_id,
            last_version_played,
            file_size,
            block_size,
            block_count,
        };
        trace!("{:?}", header);
        Ok(header)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name_offset: u32,
    pub item_size: u32,
    pub checksum_index: u32,
    pub flags: u32,
    pub parent_index: u32,
    pub next_index: u32,
    pub first_index: u32,
}

impl DirectoryEntry {
    fn parse(mut entry: &[u8]) -> Self {
        Self {
            name_offset: read_u32(&mut entry),
            item_size: read_u32(&mut entry),
            checksum_index: read_u32(&mut entry),
            flags: read_u32(&mut entry),
            parent_index: read_u32(&mut entry),
            next_index: read_u32(&mut entry),
            first_index: read_u32(&mut entry),
        }
    }

    pub fn is_file(&self) -> bool {
        self.flags & FLAG_FILE != 0
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }
}

/// The directory: entries, their names, and a few counts from its header
#[derive(Debug)]
pub struct SteamDirectory {
    pub cache_id: u32,
    pub last_version_played: u32,
    pub file_count: u32,
    pub entries: Vec<DirectoryEntry>,
    names: Vec<u8>,
}

impl SteamDirectory {
    /// Reads the directory at `offset`, returning it and the offset just past it.
    pub fn parse(mapping: &Mapping, offset: u64) -> PakResult<(Self, u64)> {
        let header = mapping.map_record("directory header", offset, DIRECTORY_HEADER_SIZE)?;
        let mut fields = &header[..];
        let _dummy0 = read_u32(&mut fields);
        let cache_id = read_u32(&mut fields);
        let last_version_played = read_u32(&mut fields);
        let item_count = read_u32(&mut fields);
        let file_count = read_u32(&mut fields);
        let _dummy1 = read_u32(&mut fields);
        let directory_size = read_u32(&mut fields);
        let name_size = read_u32(&mut fields);
        let info1_count = read_u32(&mut fields);
        let copy_count = read_u32(&mut fields);
        let local_count = read_u32(&mut fields);
        drop(header);

        // The header, the entries, their names, then five tables of u32s:
        // info1, info2 (one per item), copy, and local.
        let items = u64::from(item_count);
        let accounted = DIRECTORY_HEADER_SIZE
            + items * DIRECTORY_ENTRY_SIZE
            + u64::from(name_size)
            + 4 * (u64::from(info1_count) + items + u64::from(copy_count) + u64::from(local_count));
        if accounted > u64::from(directory_size) {
            return Err(malformed(format!(
                "Directory of {} items needs {} bytes, but claims to be {}",
                item_count, accounted, directory_size
            )));
        }
        if item_count == 0 {
            return Err(malformed("Directory has no root"));
        }

        let directory = mapping.map_record("directory", offset, u64::from(directory_size))?;
        let mut contents = &directory[DIRECTORY_HEADER_SIZE as usize..];
        let entries: Vec<DirectoryEntry> = read_bytes(&mut contents, usize(items * DIRECTORY_ENTRY_SIZE)?)
            .chunks_exact(DIRECTORY_ENTRY_SIZE as usize)
            .map(DirectoryEntry::parse)
            .collect();
        let names = read_bytes(&mut contents, usize(name_size)?).to_vec();

        for (i, entry) in entries.iter().enumerate() {
            if entry.name_offset >= name_size && i != 0 {
                return Err(malformed(format!(
                    "Directory entry {} names offset {} of a {}-byte name table",
                    i, entry.name_offset, name_size
                )));
            }
        }
        let stored_files = entries.iter().filter(|e| e.is_file()).count();
        if stored_files != file_count as usize {
            warn!(
                "Directory header counts {} files, but {} entries are files",
                file_count, stored_files
            );
        }
        debug!("Directory has {} items ({} files)", item_count, stored_files);

        Ok((
            Self {
                cache_id,
                last_version_played,
                file_count,
                entries,
                names,
            },
            offset + u64::from(directory_size),
        ))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, index: u32) -> PakResult<&DirectoryEntry> {
        self.entries.get(index as usize).ok_or_else(|| {
            malformed(format!(
                "Directory index {} is past the end of {} entries",
                index,
                self.entries.len()
            ))
        })
    }

    pub fn name(&self, index: u32) -> Cow<'_, str> {
        match self.entries.get(index as usize) {
            Some(entry) => c_str(self.names.get(entry.name_offset as usize..).unwrap_or_default()),
            None => Cow::Borrowed(""),
        }
    }

    /// The item's path from the root, following parent indices.
    pub fn path(&self, index: u32) -> PakResult<String> {
        let mut segments = Vec::new();
        let mut at = index;
        while at != 0 {
            if segments.len() > self.entries.len() {
                return Err(malformed(format!("Directory entry {} is its own ancestor", index)));
            }
            segments.push(self.name(at));
            at = self.entry(at)?.parent_index;
        }
        segments.reverse();
        Ok(segments.join("/"))
    }

    /// Walks the directory from the root, adding every item to `tree`.
    pub fn build_tree(&self, tree: &mut DirectoryTree) -> PakResult<()> {
        let mut visited = HashSet::new();
        visited.insert(0u32);
        let mut folders = vec![(0u32, tree.root())];

        while let Some((index, folder)) = folders.pop() {
            let mut child = self.entry(index)?.first_index;
            while child != 0 && child != NO_INDEX {
                if !visited.insert(child) {
                    warn!("Directory entry {} is linked twice; ignoring the second", child);
                    break;
                }
                let entry = self.entry(child)?;
                let name = self.name(child);
                if entry.is_file() {
                    tree.add_file(folder, &name, FileEntry::new(child));
                } else {
                    let subfolder = tree.add_folder(folder, &name);
                    folders.push((child, subfolder));
                }
                child = entry.next_index;
            }
        }
        Ok(())
    }

    pub fn item_attributes(&self, index: u32) -> PakResult<Vec<Attribute>> {
        let entry = self.entry(index)?;
        Ok(vec![
            Attribute::boolean("Encrypted", entry.is_encrypted()),
            Attribute::boolean("Copy Locally", entry.flags & FLAG_COPY_LOCAL == FLAG_COPY_LOCAL),
            Attribute::boolean("Overwrite Local Copy", entry.flags & FLAG_NO_OVERWRITE == 0),
            Attribute::boolean("Backup Local Copy", entry.flags & FLAG_BACKUP_LOCAL != 0),
            Attribute::hex("Flags", entry.flags),
        ])
    }
}

/// Reads the table after the directory that holds one u32 per item:
/// the first block entry for GCF, unknown for NCF.
pub fn parse_directory_map(mapping: &Mapping, offset: u64, item_count: usize) -> PakResult<(Vec<u32>, u64)> {
    let length = DIRECTORY_MAP_HEADER_SIZE + item_count as u64 * 4;
    let map = mapping.map_record("directory map", offset, length)?;
    let values = map[DIRECTORY_MAP_HEADER_SIZE as usize..]
        .chunks_exact(4)
        .map(|mut v| read_u32(&mut v))
        .collect();
    Ok((values, offset + length))
}

/// Per-item checksums of each 32 KiB chunk
#[derive(Debug, Default)]
pub struct ChecksumTables {
    /// (checksum count, first checksum index) per checksum index
    map: Vec<(u32, u32)>,
    checksums: Vec<u32>,
}

impl ChecksumTables {
    /// Reads the checksum section at `offset`, returning it and the offset just past it.
    pub fn parse(mapping: &Mapping, offset: u64) -> PakResult<(Self, u64)> {
        let header = mapping.map_record("checksum header", offset, CHECKSUM_HEADER_SIZE)?;
        let mut fields = &header[..];
        let _dummy0 = read_u32(&mut fields);
        let checksum_size = u64::from(read_u32(&mut fields));
        drop(header);

        let start = offset + CHECKSUM_HEADER_SIZE;
        let section = mapping.map_record("checksums", start, checksum_size)?;
        check_len(&section, CHECKSUM_MAP_HEADER_SIZE as usize, "checksum map header")?;
        let mut contents = &section[..];
        let _format_code = read_u32(&mut contents);
        let _dummy1 = read_u32(&mut contents);
        let item_count = u64::from(read_u32(&mut contents));
        let checksum_count = u64::from(read_u32(&mut contents));

        let accounted =
            CHECKSUM_MAP_HEADER_SIZE + item_count * CHECKSUM_MAP_ENTRY_SIZE + checksum_count * 4;
        if accounted > checksum_size {
            return Err(malformed(format!(
                "{} checksum entries and {} checksums don't fit in {} bytes",
                item_count, checksum_count, checksum_size
            )));
        }

        let map = read_bytes(&mut contents, usize(item_count * CHECKSUM_MAP_ENTRY_SIZE)?)
            .chunks_exact(CHECKSUM_MAP_ENTRY_SIZE as usize)
            .map(|mut e| (read_u32(&mut e), read_u32(&mut e)))
            .collect();
        let checksums = read_bytes(&mut contents, usize(checksum_count * 4)?)
            .chunks_exact(4)
            .map(|mut c| read_u32(&mut c))
            .collect();
        // What's left is the section's signature, which we don't check.

        Ok((Self { map, checksums }, start + checksum_size))
    }

    /// Checks `size` bytes from `reader` against the checksums at `checksum_index`.
    pub fn validate<R: Read>(&self, checksum_index: u32, mut reader: R, size: u64) -> PakResult<Validation> {
        if checksum_index == NO_INDEX {
            return Ok(Validation::AssumedOk);
        }
        let (count, first) = match self.map.get(checksum_index as usize) {
            Some(entry) => *entry,
            None => {
                debug!("Checksum index {} has no checksums", checksum_index);
                return Ok(Validation::Corrupt);
            }
        };

        let mut chunk = vec![0u8; CHUNK_SIZE];
        let mut total = 0u64;
        for k in 0u32.. {
            let n = read_chunk(&mut reader, &mut chunk)?;
            if n == 0 {
                break;
            }
            let expected = if k < count {
                self.checksums.get(first as usize + k as usize)
            } else {
                None
            };
            match expected {
                Some(expected) if *expected == SteamChecksum::of(&chunk[..n]) => {}
                _ => {
                    debug!("Chunk {} doesn't match checksum {}", k, first as u64 + k as u64);
                    return Ok(Validation::Corrupt);
                }
            }
            total += n as u64;
        }
        if total < size {
            debug!("Expected {} bytes, but only found {}", size, total);
            return Ok(Validation::Corrupt);
        }
        Ok(Validation::Ok)
    }
}

/// Helpers for building cache files in tests
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// An item in a test directory. Files have contents; folders don't.
    pub struct TestItem<'a> {
        pub name: &'a str,
        pub parent: u32,
        pub contents: Option<&'a [u8]>,
    }

    pub fn header(major: u32, minor: u32, block_size: u32, block_count: u32) -> Vec<u8> {
        let mut header = Vec::new();
        for v in [1, major, minor, 42, 7, 0, 0, 0, block_size, block_count, 0] {
            header.extend_from_slice(&v.to_le_bytes());
        }
        header
    }

    /// Fixes up the header's file size once the whole file is built.
    pub fn set_file_size(file: &mut [u8]) {
        let len = file.len() as u32;
        file[28..32].copy_from_slice(&len.to_le_bytes());
    }

    /// Builds a directory. Item 0 is the root and is added automatically;
    /// `items` are numbered from 1.
    pub fn directory(items: &[TestItem]) -> Vec<u8> {
        let count = items.len() as u32 + 1;
        let mut names = vec![0u8];
        let mut name_offsets = vec![0u32];
        for item in items {
            name_offsets.push(names.len() as u32);
            names.extend_from_slice(item.name.as_bytes());
            names.push(0);
        }

        let children = |parent: u32| -> Vec<u32> {
            items
                .iter()
                .enumerate()
                .filter(|(_, item)| item.parent == parent)
                .map(|(i, _)| i as u32 + 1)
                .collect()
        };
        let mut entries = Vec::new();
        let mut checksum_index = 0;
        for index in 0..count {
            let item = if index == 0 { None } else { Some(&items[index as usize - 1]) };
            let siblings = children(item.map(|i| i.parent).unwrap_or(NO_INDEX));
            let next = siblings
                .iter()
                .position(|s| *s == index)
                .and_then(|p| siblings.get(p + 1))
                .copied()
                .unwrap_or(0);
            let (size, checksum, flags, first) = match item.and_then(|i| i.contents) {
                Some(contents) => {
                    checksum_index += 1;
                    (contents.len() as u32, checksum_index - 1, FLAG_FILE, 0)
                }
                None => (0, NO_INDEX, 0, children(index).first().copied().unwrap_or(0)),
            };
            let parent = item.map(|i| i.parent).unwrap_or(NO_INDEX);
            for v in [name_offsets[index as usize], size, checksum, flags, parent, next, first] {
                entries.extend_from_slice(&v.to_le_bytes());
            }
        }

        let file_count = items.iter().filter(|i| i.contents.is_some()).count() as u32;
        let size = DIRECTORY_HEADER_SIZE as u32 + entries.len() as u32 + names.len() as u32 + count * 4;
        let mut directory = Vec::new();
        for v in [4, 42, 7, count, file_count, 0x8000, size, names.len() as u32, 0, 0, 0, 0, 0, 0] {
            directory.extend_from_slice(&v.to_le_bytes());
        }
        directory.extend_from_slice(&entries);
        directory.extend_from_slice(&names);
        directory.extend_from_slice(&vec![0u8; count as usize * 4]); // info2
        directory
    }

    /// Builds the directory map with the given values.
    pub fn directory_map(values: &[u32]) -> Vec<u8> {
        let mut map = vec![0u8; DIRECTORY_MAP_HEADER_SIZE as usize];
        for v in values {
            map.extend_from_slice(&v.to_le_bytes());
        }
        map
    }

    /// Builds the checksum section for the files (in order) of `items`.
    pub fn checksums(items: &[TestItem]) -> Vec<u8> {
        let mut map = Vec::new();
        let mut checksums = Vec::new();
        for contents in items.iter().filter_map(|i| i.contents) {
            let chunks: Vec<&[u8]> = contents.chunks(CHUNK_SIZE).collect();
            map.extend_from_slice(&(chunks.len() as u32).to_le_bytes());
            map.extend_from_slice(&(checksums.len() as u32 / 4).to_le_bytes());
            for chunk in chunks {
                checksums.extend_from_slice(&SteamChecksum::of(chunk).to_le_bytes());
            }
        }
        let item_count = map.len() as u32 / 8;
        let checksum_count = checksums.len() as u32 / 4;
        let signature = [0u8; 128];
        let size = 16 + map.len() + checksums.len() + signature.len();

        let mut section = Vec::new();
        section.extend_from_slice(&1u32.to_le_bytes());
        section.extend_from_slice(&(size as u32).to_le_bytes());
        for v in [0x14893721, 1, item_count, checksum_count] {
            section.extend_from_slice(&v.to_le_bytes());
        }
        section.extend_from_slice(&map);
        section.extend_from_slice(&checksums);
        section.extend_from_slice(&signature);
        section
    }
}
