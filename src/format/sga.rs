//! Relic's SGA archives (Dawn of War, Company of Heroes).
//!
//! An SGA is split into sections (one per top-level alias, such as `data`),
//! each owning a range of folders, and each folder owning ranges of subfolders
//! and files. Every major version lays these records out a little differently,
//! so [`Version`] knows the record sizes and how wide the counts are,
//! and parsing turns them all into the same owned records.

use log::*;

use crate::checksum::{Checksum, Crc32, Md5};
use crate::format::record::*;
use crate::format::{digest_stream, record_for, Format, OpenContext};
use crate::mapping::Mapping;
use crate::package::{Attribute, Validation};
use crate::result::*;
use crate::stream::Stream;
use crate::tree::{DirectoryTree, FileEntry, ItemId};

const SIGNATURE: &[u8; 8] = b"_ARCHIVE";

/// Salts the header digest of version 4 and 5 archives.
const HEADER_KEY: &[u8] = b"DFC9AF62-FC1B-4180-BC27-E1FB3B8F6BE7";

/// Version 4 and 5 archives put a name and CRC in front of each file's data.
const FILE_HEADER_SIZE: u64 = 260;

const STORED: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    V4,
    V5,
    V6,
    V7,
}

impl Version {
    fn from_major(major: u16) -> Option<Self> {
        match major {
            4 => Some(Version::V4),
            5 => Some(Version::V5),
            6 => Some(Version::V6),
            7 => Some(Version::V7),
            _ => None,
        }
    }

    fn major(self) -> u16 {
        match self {
            Version::V4 => 4,
            Version::V5 => 5,
            Version::V6 => 6,
            Version::V7 => 7,
        }
    }

    /// Versions 4 and 5 carry MD5s in the header and a header before each file.
    fn has_digests(self) -> bool {
        matches!(self, Version::V4 | Version::V5)
    }

    fn header_size(self) -> u64 {
        if self.has_digests() {
            184
        } else {
            152
        }
    }

    /// Version 4 counts with u16s, everything after with u32s.
    fn count_size(self) -> usize {
        match self {
            Version::V4 => 2,
            _ => 4,
        }
    }

    fn read_count(self, input: &mut &[u8]) -> u32 {
        match self {
            Version::V4 => u32::from(read_u16(input)),
            _ => read_u32(input),
        }
    }

    fn directory_header_size(self) -> usize {
        let base = 4 * 4 + 4 * self.count_size();
        match self {
            // Hash table offset, block size
            Version::V7 => base + 8,
            _ => base,
        }
    }

    fn section_size(self) -> usize {
        64 + 64 + 5 * self.count_size()
    }

    fn folder_size(self) -> usize {
        4 + 4 * self.count_size()
    }

    fn file_size(self) -> usize {
        match self {
            Version::V4 | Version::V5 => 22,
            Version::V6 => 26,
            Version::V7 => 30,
        }
    }
}

#[derive(Debug)]
struct Header {
    version: Version,
    minor: u16,
    name: String,
    header_md5: Option<[u8; 16]>,
    /// Length of the directory, which follows the header
    header_length: u32,
    file_data_offset: u32,
}

impl Header {
    fn parse(mapping: &Mapping) -> PakResult<Self> {
        let prefix = mapping.map_record("SGA header", 0, 12)?;
        let mut fields = &prefix[..];
        let signature = read_array::<8>(&mut fields);
        if &signature != SIGNATURE {
            return Err(FormatError::InvalidSignature {
                format: "SGA",
                found: describe_signature(&signature),
            }
            .into());
        }
        let major = read_u16(&mut fields);
        let minor = read_u16(&mut fields);
        let version = Version::from_major(major).ok_or(FormatError::UnsupportedVersion {
            format: "SGA",
            version: u32::from(major),
        })?;
        drop(prefix);

        let header = mapping.map_record("SGA header", 0, version.header_size())?;
        let mut fields = &header[12..];
        let mut header_md5 = None;
        if version.has_digests() {
            let _file_md5 = read_array::<16>(&mut fields);
        }
        let name = c_wstr(read_bytes(&mut fields, 128));
        if version.has_digests() {
            header_md5 = Some(read_array::<16>(&mut fields));
        }
        let header_length = read_u32(&mut fields);
        let file_data_offset = read_u32(&mut fields);
        Ok(Self {
            version,
            minor,
            name,
            header_md5,
            header_length,
            file_data_offset,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Section {
    alias: String,
    name: String,
    folder_start: u32,
    folder_end: u32,
    file_start: u32,
    file_end: u32,
    folder_root: u32,
}

impl Section {
    fn parse(version: Version, mut record: &[u8]) -> Self {
        let alias = c_str(read_bytes(&mut record, 64)).into_owned();
        let name = c_str(read_bytes(&mut record, 64)).into_owned();
        Self {
            alias,
            name,
            folder_start: version.read_count(&mut record),
            folder_end: version.read_count(&mut record),
            file_start: version.read_count(&mut record),
            file_end: version.read_count(&mut record),
            folder_root: version.read_count(&mut record),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Folder {
    name_offset: u32,
    folder_start: u32,
    folder_end: u32,
    file_start: u32,
    file_end: u32,
}

impl Folder {
    fn parse(version: Version, mut record: &[u8]) -> Self {
        Self {
            name_offset: read_u32(&mut record),
            folder_start: version.read_count(&mut record),
            folder_end: version.read_count(&mut record),
            file_start: version.read_count(&mut record),
            file_end: version.read_count(&mut record),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct File {
    name_offset: u32,
    /// Relative to the header's file data offset
    offset: u32,
    size_on_disk: u32,
    size: u32,
    modified: u32,
    kind: u8,
    /// Stored in the record for version 6 and up
    crc: Option<u32>,
}

impl File {
    fn parse(version: Version, mut record: &[u8]) -> Self {
        let name_offset = read_u32(&mut record);
        let offset = read_u32(&mut record);
        let size_on_disk = read_u32(&mut record);
        let size = read_u32(&mut record);
        let modified = read_u32(&mut record);
        let _dummy = read_u8(&mut record);
        let kind = read_u8(&mut record);
        let crc = match version {
            Version::V6 | Version::V7 => Some(read_u32(&mut record)),
            _ => None,
        };
        // Version 7's hash offset points into a table we don't use.
        Self {
            name_offset,
            offset,
            size_on_disk,
            size,
            modified,
            kind,
            crc,
        }
    }
}

/// Slices `count` records of `record_size` bytes at `offset` in the directory.
fn table<'d>(
    directory: &'d [u8],
    offset: u32,
    count: u32,
    record_size: usize,
    what: &'static str,
) -> PakResult<&'d [u8]> {
    let start = offset as usize;
    let length = (count as usize).saturating_mul(record_size);
    let end = start.saturating_add(length);
    directory.get(start..end).ok_or_else(|| {
        MappingError::TooSmall {
            what,
            needed: end as u64,
            available: directory.len() as u64,
        }
        .into()
    })
}

#[derive(Debug)]
pub struct SgaFile {
    header: Header,
    sections: Vec<Section>,
    folders: Vec<Folder>,
    files: Vec<File>,
    strings: Vec<u8>,
}

impl SgaFile {
    fn name(&self, offset: u32) -> PakResult<String> {
        self.strings
            .get(offset as usize..)
            .map(|s| c_str(s).into_owned())
            .ok_or_else(|| malformed(format!("SGA name at {} is past the string table", offset)))
    }

    fn data_offset(&self, file: &File) -> u64 {
        u64::from(self.header.file_data_offset) + u64::from(file.offset)
    }

    /// The CRC from the record, or from the header in front of the data for older versions.
    fn crc(&self, mapping: &Mapping, file: &File) -> PakResult<u32> {
        if let Some(crc) = file.crc {
            return Ok(crc);
        }
        let header_offset = self
            .data_offset(file)
            .checked_sub(FILE_HEADER_SIZE)
            .ok_or(ExtractionError::InvalidDataOffset {
                offset: self.data_offset(file),
            })?;
        let header = mapping
            .map(header_offset, FILE_HEADER_SIZE)
            .map_err(|_| ExtractionError::InvalidDataOffset {
                offset: header_offset,
            })?;
        let mut crc = &header[256..];
        Ok(read_u32(&mut crc))
    }

    fn section_of(&self, id: u32) -> Option<&Section> {
        self.sections
            .iter()
            .find(|s| (s.file_start..s.file_end).contains(&id))
    }

    /// Adds the folder at `index` and everything under it to `tree`.
    ///
    /// Each folder and file record is added at most once, even when ranges
    /// overlap or point back at earlier folders.
    fn add_folders(
        &self,
        tree: &mut DirectoryTree,
        walk: &mut FolderWalk,
        parent: ItemId,
        index: u32,
    ) -> PakResult<()> {
        if !walk.claim_folder(index) {
            return Ok(());
        }
        let mut pending = vec![(parent, index)];
        while let Some((parent, index)) = pending.pop() {
            let folder = self
                .folders
                .get(index as usize)
                .ok_or_else(|| malformed(format!("No SGA folder {}", index)))?;
            if folder.folder_end as usize > self.folders.len() {
                return Err(malformed(format!(
                    "SGA folder {} lists folders up to {} of {}",
                    index,
                    folder.folder_end,
                    self.folders.len()
                )));
            }
            if folder.file_end as usize > self.files.len() {
                return Err(malformed(format!(
                    "SGA folder {} lists files up to {} of {}",
                    index,
                    folder.file_end,
                    self.files.len()
                )));
            }

            // Folder names are full paths from the section root; we just want the last part.
            let full_name = self.name(folder.name_offset)?;
            let name = match full_name.rfind('\\') {
                Some(separator) => &full_name[separator + 1..],
                None => &full_name[..],
            };
            let current = if name.is_empty() {
                parent
            } else {
                tree.add_folder(parent, name)
            };

            for id in folder.file_start..folder.file_end {
                if !walk.claim_file(id) {
                    continue;
                }
                let name = self.name(self.files[id as usize].name_offset)?;
                tree.add_file(current, &name, FileEntry::new(id));
            }
            // Reversed so subfolders come off the stack in order.
            for child in (folder.folder_start..folder.folder_end).rev() {
                if walk.claim_folder(child) {
                    pending.push((current, child));
                }
            }
        }
        Ok(())
    }
}

/// Which folder and file records a tree walk has already used
struct FolderWalk {
    folders: Vec<bool>,
    files: Vec<bool>,
}

impl FolderWalk {
    fn new(sga: &SgaFile) -> Self {
        Self {
            folders: vec![false; sga.folders.len()],
            files: vec![false; sga.files.len()],
        }
    }

    /// True the first time it's called for a folder that exists.
    /// Missing folders are claimed too, so the walk can report them.
    fn claim_folder(&mut self, index: u32) -> bool {
        match self.folders.get_mut(index as usize) {
            Some(seen) => !std::mem::replace(seen, true),
            None => true,
        }
    }

    fn claim_file(&mut self, id: u32) -> bool {
        match self.files.get_mut(id as usize) {
            Some(seen) => !std::mem::replace(seen, true),
            None => false,
        }
    }
}

impl Format for SgaFile {
    fn map_data_structures(mapping: &Mapping, _context: &OpenContext) -> PakResult<Self> {
        let header = Header::parse(mapping)?;
        let version = header.version;
        trace!("{:?}", header);

        let directory = mapping.map_record(
            "SGA directory",
            version.header_size(),
            u64::from(header.header_length),
        )?;
        check_len(
            &directory,
            version.directory_header_size(),
            "SGA directory header",
        )?;
        let mut fields = &directory[..];
        let section_offset = read_u32(&mut fields);
        let section_count = version.read_count(&mut fields);
        let folder_offset = read_u32(&mut fields);
        let folder_count = version.read_count(&mut fields);
        let file_offset = read_u32(&mut fields);
        let file_count = version.read_count(&mut fields);
        let string_table_offset = read_u32(&mut fields);
        let _string_count = version.read_count(&mut fields);
        if version == Version::V7 {
            let hash_table_offset = read_u32(&mut fields);
            let block_size = read_u32(&mut fields);
            trace!(
                "Hash table at {}, block size {}",
                hash_table_offset,
                block_size
            );
        }

        let sections = table(
            &directory,
            section_offset,
            section_count,
            version.section_size(),
            "SGA sections",
        )?
        .chunks_exact(version.section_size())
        .map(|r| Section::parse(version, r))
        .collect::<Vec<_>>();
        let folders = table(
            &directory,
            folder_offset,
            folder_count,
            version.folder_size(),
            "SGA folders",
        )?
        .chunks_exact(version.folder_size())
        .map(|r| Folder::parse(version, r))
        .collect::<Vec<_>>();
        let files = table(
            &directory,
            file_offset,
            file_count,
            version.file_size(),
            "SGA files",
        )?
        .chunks_exact(version.file_size())
        .map(|r| File::parse(version, r))
        .collect::<Vec<_>>();
        let strings = directory
            .get(string_table_offset as usize..)
            .ok_or_else(|| malformed("SGA string table is past the end of the directory"))?
            .to_vec();

        debug!(
            "SGA version {}.{}: {} sections, {} folders, {} files",
            version.major(),
            header.minor,
            sections.len(),
            folders.len(),
            files.len()
        );
        Ok(Self {
            header,
            sections,
            folders,
            files,
            strings,
        })
    }

    fn create_root(&self, _mapping: &Mapping, tree: &mut DirectoryTree) -> PakResult<()> {
        let root = tree.root();
        let mut walk = FolderWalk::new(self);
        for section in &self.sections {
            let folder = tree.add_folder(root, &section.alias);
            self.add_folders(tree, &mut walk, folder, section.folder_root)?;
        }
        Ok(())
    }

    fn package_attributes(&self) -> Vec<Attribute> {
        vec![
            Attribute::unsigned("Version", self.header.version.major()),
            Attribute::string("Name", self.header.name.clone()),
        ]
    }

    fn item_attributes(&self, mapping: &Mapping, entry: &FileEntry) -> PakResult<Vec<Attribute>> {
        let file = record_for(&self.files, entry)?;
        let mut attributes = Vec::new();
        if let Some(section) = self.section_of(entry.id) {
            attributes.push(Attribute::string("Section Alias", section.alias.clone()));
            attributes.push(Attribute::string("Section Name", section.name.clone()));
        }
        if let Some(modified) = format_unix_time(file.modified) {
            attributes.push(Attribute::string("Modified", modified));
        }
        attributes.push(Attribute::unsigned("Type", file.kind));
        match self.crc(mapping, file) {
            Ok(crc) => attributes.push(Attribute::hex("CRC", crc)),
            Err(e) => debug!("No CRC for item {}: {}", entry.id, e),
        }
        Ok(attributes)
    }

    fn size(&self, _mapping: &Mapping, entry: &FileEntry) -> PakResult<u64> {
        Ok(u64::from(record_for(&self.files, entry)?.size))
    }

    fn size_on_disk(&self, _mapping: &Mapping, entry: &FileEntry) -> PakResult<u64> {
        Ok(u64::from(record_for(&self.files, entry)?.size_on_disk))
    }

    fn create_stream<'a>(
        &'a self,
        mapping: &'a Mapping,
        entry: &FileEntry,
    ) -> PakResult<Stream<'a>> {
        let file = record_for(&self.files, entry)?;
        if file.kind != STORED {
            return Err(ExtractionError::UnsupportedCompression(u32::from(file.kind)).into());
        }
        let offset = self.data_offset(file);
        let view = mapping
            .map(offset, u64::from(file.size_on_disk))
            .map_err(|_| ExtractionError::InvalidDataOffset { offset })?;
        Ok(Stream::from_view(view))
    }

    fn validate(&self, mapping: &Mapping, entry: &FileEntry) -> PakResult<Validation> {
        let file = record_for(&self.files, entry)?;
        if file.kind != STORED {
            return Ok(Validation::AssumedOk);
        }
        let (expected, stream) = match self
            .crc(mapping, file)
            .and_then(|crc| Ok((crc, self.create_stream(mapping, entry)?)))
        {
            Ok(found) => found,
            Err(PakError::Extraction(e)) => {
                debug!("Can't read item {}: {}", entry.id, e);
                return Ok(Validation::Corrupt);
            }
            Err(e) => return Err(e),
        };
        Ok(if digest_stream(stream, Crc32::new())? == expected {
            Validation::Ok
        } else {
            Validation::Corrupt
        })
    }

    fn validate_package(&self, mapping: &Mapping) -> PakResult<Validation> {
        let expected = match self.header.header_md5 {
            Some(md5) => md5,
            None => return Ok(Validation::AssumedOk),
        };
        let directory = mapping.map(
            self.header.version.header_size(),
            u64::from(self.header.header_length),
        )?;
        let mut md5 = Md5::new();
        md5.update(HEADER_KEY);
        md5.update(&directory);
        Ok(if md5.finalize() == expected {
            Validation::Ok
        } else {
            Validation::Corrupt
        })
    }
}
