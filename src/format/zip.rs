//! Zip archives.
//!
//! Rather than searching backwards for the end of central directory record,
//! we walk the archive from the front: every section starts with a signature,
//! and every section's length can be worked out from its fixed-size header.
//! We skip local headers (and the data after them) and central directory
//! records until we land on the end record, which tells us where the central
//! directory is. Anything else at a section boundary means we're lost.
//!
//! Each item's central directory record is kept verbatim as its
//! [`FileEntry::data`]; every query about the item decodes it from there.
//!
//! Only stored (uncompressed) items can be extracted.
//!
//! Most comments quote the ZIP format notes, [`APPNOTE.TXT`].
//!
//! [`APPNOTE.TXT`]: https://pkware.cachefly.net/webdocs/APPNOTE/APPNOTE-6.3.6.TXT

use std::borrow::Cow;

use chrono::{NaiveDate, NaiveDateTime};
use codepage_437::*;
use log::*;

use crate::checksum::Crc32;
use crate::format::record::*;
use crate::format::{digest_stream, Format, OpenContext};
use crate::mapping::{Mapping, View};
use crate::package::{Attribute, Validation};
use crate::result::*;
use crate::stream::Stream;
use crate::tree::{DirectoryTree, FileEntry, ItemId};

// Magic numbers denoting the sections of a ZIP archive

/// Local file header magic number
const LOCAL_FILE_HEADER_MAGIC: u32 = 0x04034b50;
/// Central directory magic number
const CENTRAL_DIRECTORY_MAGIC: u32 = 0x02014b50;
/// End of central directory magic number
const EOCDR_MAGIC: u32 = 0x06054b50;
/// Data descriptor magic number (optional, but everyone writes it)
const DATA_DESCRIPTOR_MAGIC: u32 = 0x08074b50;

const LOCAL_FILE_HEADER_SIZE: u64 = 30;
const CENTRAL_DIRECTORY_ENTRY_SIZE: usize = 46;
const EOCDR_SIZE: u64 = 22;
const DATA_DESCRIPTOR_SIZE: u64 = 16;

/// Data from the End of central directory record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndOfCentralDirectory {
    pub disk_number: u16,
    pub disk_with_central_directory: u16,
    pub entries_on_this_disk: u16,
    pub entries: u16,
    pub central_directory_size: u32,
    pub central_directory_offset: u32,
    pub comment: Vec<u8>,
}

impl EndOfCentralDirectory {
    fn parse(mut eocdr: &[u8], comment: &[u8]) -> Self {
        // 4.3.16  End of central directory record:
        //
        // end of central dir signature    4 bytes  (0x06054b50)
        // number of this disk             2 bytes
        // number of the disk with the
        // start of the central directory  2 bytes
        // total number of entries in
        // the central dir on this disk    2 bytes
        // total number of entries in
        // the central dir                 2 bytes
        // size of the central directory   4 bytes
        // offset of start of central
        // directory with respect to
        // the starting disk number        4 bytes
        // zipfile comment length          2 bytes
        eocdr = &eocdr[4..];
        let disk_number = read_u16(&mut eocdr);
        let disk_with_central_directory = read_u16(&mut eocdr);
        let entries_on_this_disk = read_u16(&mut eocdr);
        let entries = read_u16(&mut eocdr);
        let central_directory_size = read_u32(&mut eocdr);
        let central_directory_offset = read_u32(&mut eocdr);
        Self {
            disk_number,
            disk_with_central_directory,
            entries_on_this_disk,
            entries,
            central_directory_size,
            central_directory_offset,
            comment: comment.to_vec(),
        }
    }
}

/// Data from a central directory entry
///
/// Each of these records contains information about a file or folder
/// stored in the ZIP archive.
#[derive(Debug)]
pub struct CentralDirectoryEntry<'a> {
    pub source_version: u16,
    pub minimum_extract_version: u16,
    pub flags: u16,
    pub compression_method: u16,
    pub last_modified_time: u16,
    pub last_modified_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub disk_number: u16,
    pub internal_file_attributes: u16,
    pub external_file_attributes: u32,
    pub header_offset: u32,
    pub path: &'a [u8],
    pub extra_field: &'a [u8],
    pub file_comment: &'a [u8],
}

impl<'a> CentralDirectoryEntry<'a> {
    /// The full size of the record starting at the front of `entry`,
    /// from its fixed-size header.
    fn size_in_file(entry: &[u8]) -> PakResult<usize> {
        check_len(entry, CENTRAL_DIRECTORY_ENTRY_SIZE, "central directory entry")?;
        let mut lengths = &entry[28..34];
        let path_length = usize::from(read_u16(&mut lengths));
        let extra_field_length = usize::from(read_u16(&mut lengths));
        let file_comment_length = usize::from(read_u16(&mut lengths));
        Ok(CENTRAL_DIRECTORY_ENTRY_SIZE + path_length + extra_field_length + file_comment_length)
    }

    pub fn parse(mut entry: &'a [u8]) -> PakResult<Self> {
        // 4.3.12  Central directory structure:
        //
        //   central file header signature   4 bytes  (0x02014b50)
        //   version made by                 2 bytes
        //   version needed to extract       2 bytes
        //   general purpose bit flag        2 bytes
        //   compression method              2 bytes
        //   last mod file time              2 bytes
        //   last mod file date              2 bytes
        //   crc-32                          4 bytes
        //   compressed size                 4 bytes
        //   uncompressed size               4 bytes
        //   file name length                2 bytes
        //   extra field length              2 bytes
        //   file comment length             2 bytes
        //   disk number start               2 bytes
        //   internal file attributes        2 bytes
        //   external file attributes        4 bytes
        //   relative offset of local header 4 bytes
        //
        //   file name (variable size)
        //   extra field (variable size)
        //   file comment (variable size)
        let size = Self::size_in_file(entry)?;
        check_len(entry, size, "central directory entry")?;
        if read_u32(&mut entry) != CENTRAL_DIRECTORY_MAGIC {
            return Err(malformed("Invalid central directory entry"));
        }
        let source_version = read_u16(&mut entry);
        let minimum_extract_version = read_u16(&mut entry);
        let flags = read_u16(&mut entry);
        let compression_method = read_u16(&mut entry);
        let last_modified_time = read_u16(&mut entry);
        let last_modified_date = read_u16(&mut entry);
        let crc32 = read_u32(&mut entry);
        let compressed_size = read_u32(&mut entry);
        let uncompressed_size = read_u32(&mut entry);
        let path_length = usize::from(read_u16(&mut entry));
        let extra_field_length = usize::from(read_u16(&mut entry));
        let file_comment_length = usize::from(read_u16(&mut entry));
        let disk_number = read_u16(&mut entry);
        let internal_file_attributes = read_u16(&mut entry);
        let external_file_attributes = read_u32(&mut entry);
        let header_offset = read_u32(&mut entry);
        let path = read_bytes(&mut entry, path_length);
        let extra_field = read_bytes(&mut entry, extra_field_length);
        let file_comment = read_bytes(&mut entry, file_comment_length);

        Ok(Self {
            source_version,
            minimum_extract_version,
            flags,
            compression_method,
            last_modified_time,
            last_modified_date,
            crc32,
            compressed_size,
            uncompressed_size,
            disk_number,
            internal_file_attributes,
            external_file_attributes,
            header_offset,
            path,
            extra_field,
            file_comment,
        })
    }

    pub fn path(&self) -> PakResult<Cow<'a, str>> {
        decode_text(self.path, self.flags)
    }

    pub fn is_encrypted(&self) -> bool {
        // Bit 0: If set, indicates that the file is encrypted
        self.flags & 1 != 0
    }

    fn has_data_descriptor(&self) -> bool {
        // Bit 3: If this bit is set, the fields crc-32, compressed
        //        size and uncompressed size are set to zero in the
        //        local header.  The correct values are put in the
        //        data descriptor immediately following the compressed data.
        self.flags & (1 << 3) != 0
    }

    pub fn last_modified(&self) -> Option<NaiveDateTime> {
        parse_msdos(self.last_modified_time, self.last_modified_date)
    }
}

/// Data from a local file header
///
/// Each file's contents are preceded by this header.
#[derive(Debug)]
struct LocalFileHeader {
    flags: u16,
    compression_method: u16,
    crc32: u32,
    compressed_size: u32,
    uncompressed_size: u32,
    path_length: u16,
    extra_field_length: u16,
}

impl LocalFileHeader {
    fn parse(mut header: &[u8]) -> Self {
        // 4.3.7  Local file header:
        //
        // local file header signature     4 bytes  (0x04034b50)
        // version needed to extract       2 bytes
        // general purpose bit flag        2 bytes
        // compression method              2 bytes
        // last mod file time              2 bytes
        // last mod file date              2 bytes
        // crc-32                          4 bytes
        // compressed size                 4 bytes
        // uncompressed size               4 bytes
        // file name length                2 bytes
        // extra field length              2 bytes
        header = &header[6..];
        let flags = read_u16(&mut header);
        let compression_method = read_u16(&mut header);
        header = &header[4..];
        let crc32 = read_u32(&mut header);
        let compressed_size = read_u32(&mut header);
        let uncompressed_size = read_u32(&mut header);
        let path_length = read_u16(&mut header);
        let extra_field_length = read_u16(&mut header);
        Self {
            flags,
            compression_method,
            crc32,
            compressed_size,
            uncompressed_size,
            path_length,
            extra_field_length,
        }
    }

    fn size_in_file(&self) -> u64 {
        LOCAL_FILE_HEADER_SIZE + u64::from(self.path_length) + u64::from(self.extra_field_length)
    }
}

/// Decodes a name or comment: UTF-8 if the flags say so, CP437 otherwise.
fn decode_text(bytes: &[u8], flags: u16) -> PakResult<Cow<'_, str>> {
    // Bit 11: Language encoding flag (EFS).  If this bit is set,
    //         the filename and comment fields for this file
    //         MUST be encoded using UTF-8. (see APPENDIX D)
    if flags & (1 << 11) != 0 {
        std::str::from_utf8(bytes)
            .map(Cow::Borrowed)
            .map_err(|e| malformed(format!("Invalid UTF-8 name: {}", e)))
    } else {
        Ok(Cow::borrow_from_cp437(bytes, &CP437_CONTROL))
    }
}

fn parse_msdos(time: u16, date: u16) -> Option<NaiveDateTime> {
    let seconds = (0b0000_0000_0001_1111 & time) as u32 * 2; // MSDOS uses 2-second precision
    let minutes = (0b0000_0111_1110_0000 & time) as u32 >> 5;
    let hours = (0b1111_1000_0000_0000 & time) as u32 >> 11;

    let days = (0b0000_0000_0001_1111 & date) as u32;
    let months = (0b0000_0001_1110_0000 & date) as u32 >> 5;
    // MSDOS uses years since 1980; Always interpreted as a positive value
    let years = ((0b1111_1110_0000_0000 & date) >> 9) as i32 + 1980;

    NaiveDate::from_ymd_opt(years, months, days)?.and_hms_opt(hours, minutes, seconds)
}

/// Maps `[offset, offset + size)` of the archive occupying `region` (base and length),
/// failing if it runs past the end of the region even when the mapping goes on.
fn map_in_region<'m>(
    mapping: &'m Mapping,
    what: &'static str,
    (base, length): (u64, u64),
    offset: u64,
    size: u64,
) -> PakResult<View<'m>> {
    let end = offset.saturating_add(size);
    if end > length {
        return Err(MappingError::TooSmall {
            what,
            needed: base.saturating_add(end),
            available: base + length,
        }
        .into());
    }
    Ok(mapping.map(base + offset, size)?)
}

/// The central directory of a Zip archive found somewhere in a mapping:
/// either a whole file, or a region of one (a Source map's pakfile lump).
#[derive(Debug)]
pub struct ZipDirectory {
    /// Where the archive starts in the mapping. Every offset it stores is relative to this.
    base: u64,
    end: EndOfCentralDirectory,
    /// Each central directory entry, verbatim
    entries: Vec<Vec<u8>>,
}

impl ZipDirectory {
    /// Walks the sections of the archive in `[base, base + length)`
    /// until we find the end of central directory record,
    /// then reads the central directory it points to.
    pub fn scan(mapping: &Mapping, base: u64, length: u64) -> PakResult<Self> {
        let end = Self::find_end(mapping, base, length)?;
        trace!("{:?}", end);

        let directory = map_in_region(
            mapping,
            "ZIP central directory",
            (base, length),
            u64::from(end.central_directory_offset),
            u64::from(end.central_directory_size),
        )?;
        let mut remaining = &directory[..];
        let mut entries = Vec::with_capacity(usize::from(end.entries));
        for _ in 0..end.entries {
            let size = CentralDirectoryEntry::size_in_file(remaining)?;
            check_len(remaining, size, "central directory entry")?;
            let entry = read_bytes(&mut remaining, size);
            // Make sure it's sane now so we don't have to worry about it later.
            CentralDirectoryEntry::parse(entry)?;
            entries.push(entry.to_vec());
        }
        if !remaining.is_empty() {
            warn!(
                "{} bytes after the last ZIP central directory entry",
                remaining.len()
            );
        }
        debug!("ZIP central directory has {} entries", entries.len());

        Ok(Self { base, end, entries })
    }

    fn find_end(mapping: &Mapping, base: u64, length: u64) -> PakResult<EndOfCentralDirectory> {
        let mut offset = 0u64;
        loop {
            if offset + 4 > length {
                return Err(MappingError::TooSmall {
                    what: "ZIP end of central directory record",
                    needed: base + offset + 4,
                    available: base + length,
                }
                .into());
            }
            let at = base + offset;
            let signature = {
                let tag = mapping.map(at, 4)?;
                read_u32(&mut &tag[..])
            };
            match signature {
                LOCAL_FILE_HEADER_MAGIC => {
                    let header = map_in_region(
                        mapping,
                        "ZIP local file header",
                        (base, length),
                        offset,
                        LOCAL_FILE_HEADER_SIZE,
                    )?;
                    let local = LocalFileHeader::parse(&header);
                    trace!("Local file header at {}: {:?}", at, local);
                    offset += local.size_in_file() + u64::from(local.compressed_size);
                }
                CENTRAL_DIRECTORY_MAGIC => {
                    let header = map_in_region(
                        mapping,
                        "ZIP central directory entry",
                        (base, length),
                        offset,
                        CENTRAL_DIRECTORY_ENTRY_SIZE as u64,
                    )?;
                    offset += CentralDirectoryEntry::size_in_file(&header)? as u64;
                }
                DATA_DESCRIPTOR_MAGIC => {
                    offset += DATA_DESCRIPTOR_SIZE;
                }
                EOCDR_MAGIC => {
                    let header = map_in_region(
                        mapping,
                        "ZIP end of central directory record",
                        (base, length),
                        offset,
                        EOCDR_SIZE,
                    )?;
                    let comment_length = u64::from(read_u16(&mut &header[20..]));
                    let comment = map_in_region(
                        mapping,
                        "ZIP comment",
                        (base, length),
                        offset + EOCDR_SIZE,
                        comment_length,
                    )?;
                    return Ok(EndOfCentralDirectory::parse(&header, &comment));
                }
                signature => {
                    return Err(FormatError::UnknownSection {
                        offset: at,
                        signature,
                    }
                    .into())
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Adds each entry under `folder`, numbering them from `first_id`.
    pub fn add_to_tree(&self, tree: &mut DirectoryTree, folder: ItemId, first_id: u32) -> PakResult<()> {
        for (i, raw) in self.entries.iter().enumerate() {
            let entry = CentralDirectoryEntry::parse(raw)?;
            let path = entry.path()?;
            // Folders end in a separator; add_path() creates them and no file.
            tree.add_path(folder, &path, FileEntry::with_data(first_id + i as u32, raw.clone()));
        }
        Ok(())
    }

    pub fn attributes(&self) -> Vec<Attribute> {
        vec![
            Attribute::unsigned("Disk", self.end.disk_number),
            Attribute::string("Comment", decode_text(&self.end.comment, 0).unwrap_or_default()),
        ]
    }

    pub fn entry_attributes(&self, entry: &FileEntry) -> PakResult<Vec<Attribute>> {
        let cde = parse_entry(entry)?;
        let mut attributes = vec![
            Attribute::unsigned("Create Version", cde.source_version),
            Attribute::unsigned("Extract Version", cde.minimum_extract_version),
            Attribute::hex("Flags", cde.flags),
            Attribute::unsigned("Compression Method", cde.compression_method),
            Attribute::hex("CRC", cde.crc32),
            Attribute::unsigned("Disk", cde.disk_number),
            Attribute::string("Comment", decode_text(cde.file_comment, cde.flags)?),
        ];
        if let Some(modified) = cde.last_modified() {
            attributes.push(Attribute::string(
                "Modified",
                modified.format("%Y-%m-%d %H:%M:%S").to_string(),
            ));
        }
        Ok(attributes)
    }

    pub fn entry_size(&self, entry: &FileEntry) -> PakResult<u64> {
        Ok(u64::from(parse_entry(entry)?.uncompressed_size))
    }

    pub fn entry_size_on_disk(&self, entry: &FileEntry) -> PakResult<u64> {
        Ok(u64::from(parse_entry(entry)?.compressed_size))
    }

    /// Checks we can read the entry out: stored, unencrypted, and on this disk.
    fn check_extractable(&self, cde: &CentralDirectoryEntry) -> Result<(), ExtractionError> {
        if cde.disk_number != self.end.disk_number {
            return Err(ExtractionError::DiskSpanning {
                disk: cde.disk_number,
                this_disk: self.end.disk_number,
            });
        }
        if cde.is_encrypted() {
            return Err(ExtractionError::Encrypted);
        }
        if cde.compression_method != 0 {
            return Err(ExtractionError::UnsupportedCompression(u32::from(
                cde.compression_method,
            )));
        }
        Ok(())
    }

    pub fn entry_stream<'a>(&self, mapping: &'a Mapping, entry: &FileEntry) -> PakResult<Stream<'a>> {
        let cde = parse_entry(entry)?;
        self.check_extractable(&cde)?;

        let header_offset = self.base + u64::from(cde.header_offset);
        let bad_offset = || ExtractionError::InvalidDataOffset {
            offset: header_offset,
        };
        let local = {
            let header = mapping
                .map(header_offset, LOCAL_FILE_HEADER_SIZE)
                .map_err(|_| bad_offset())?;
            if read_u32(&mut &header[..]) != LOCAL_FILE_HEADER_MAGIC {
                debug!("No local file header at {}", header_offset);
                return Err(bad_offset().into());
            }
            LocalFileHeader::parse(&header)
        };

        if cfg!(feature = "check-local-metadata") {
            let mismatch = local.flags != cde.flags
                || local.compression_method != cde.compression_method
                || (!cde.has_data_descriptor()
                    && (local.crc32 != cde.crc32
                        || local.compressed_size != cde.compressed_size
                        || local.uncompressed_size != cde.uncompressed_size));
            if mismatch {
                debug!("Local header {:?} doesn't match {:?}", local, cde);
                return Err(ExtractionError::LocalHeaderMismatch.into());
            }
        }

        let data_offset = header_offset + local.size_in_file();
        let view = mapping
            .map(data_offset, u64::from(cde.compressed_size))
            .map_err(|_| ExtractionError::InvalidDataOffset {
                offset: data_offset,
            })?;
        Ok(Stream::from_view(view))
    }

    pub fn validate_entry(&self, mapping: &Mapping, entry: &FileEntry) -> PakResult<Validation> {
        let cde = parse_entry(entry)?;
        if let Err(e) = self.check_extractable(&cde) {
            debug!("Not validating {}: {}", cde.path()?, e);
            return Ok(Validation::AssumedOk);
        }
        let stream = match self.entry_stream(mapping, entry) {
            Ok(s) => s,
            Err(PakError::Extraction(_)) => return Ok(Validation::Corrupt),
            Err(e) => return Err(e),
        };
        let crc = digest_stream(stream, Crc32::new())?;
        Ok(if crc == cde.crc32 {
            Validation::Ok
        } else {
            Validation::Corrupt
        })
    }
}

fn parse_entry(entry: &FileEntry) -> PakResult<CentralDirectoryEntry<'_>> {
    let raw = entry
        .data
        .as_deref()
        .ok_or_else(|| malformed(format!("ZIP item {} has no directory entry", entry.id)))?;
    CentralDirectoryEntry::parse(raw)
}

#[derive(Debug)]
pub struct ZipFile {
    directory: ZipDirectory,
}

impl Format for ZipFile {
    fn map_data_structures(mapping: &Mapping, _context: &OpenContext) -> PakResult<Self> {
        let directory = ZipDirectory::scan(mapping, 0, mapping.len())?;
        Ok(Self { directory })
    }

    fn create_root(&self, _mapping: &Mapping, tree: &mut DirectoryTree) -> PakResult<()> {
        let root = tree.root();
        self.directory.add_to_tree(tree, root, 0)
    }

    fn package_attributes(&self) -> Vec<Attribute> {
        self.directory.attributes()
    }

    fn item_attributes(&self, _mapping: &Mapping, entry: &FileEntry) -> PakResult<Vec<Attribute>> {
        self.directory.entry_attributes(entry)
    }

    fn size(&self, _mapping: &Mapping, entry: &FileEntry) -> PakResult<u64> {
        self.directory.entry_size(entry)
    }

    fn size_on_disk(&self, _mapping: &Mapping, entry: &FileEntry) -> PakResult<u64> {
        self.directory.entry_size_on_disk(entry)
    }

    fn create_stream<'a>(
        &'a self,
        mapping: &'a Mapping,
        entry: &FileEntry,
    ) -> PakResult<Stream<'a>> {
        self.directory.entry_stream(mapping, entry)
    }

    fn validate(&self, mapping: &Mapping, entry: &FileEntry) -> PakResult<Validation> {
        self.directory.validate_entry(mapping, entry)
    }
}

/// One file to put in a test archive
#[cfg(test)]
pub(crate) struct TestEntry<'a> {
    pub path: &'a str,
    pub contents: &'a [u8],
    pub method: u16,
    pub crc: Option<u32>,
}

#[cfg(test)]
impl<'a> TestEntry<'a> {
    pub fn stored(path: &'a str, contents: &'a [u8]) -> Self {
        Self {
            path,
            contents,
            method: 0,
            crc: None,
        }
    }
}

/// Builds a Zip archive for tests. Contents are written as-is,
/// whatever compression method the entry claims.
#[cfg(test)]
pub(crate) fn build(entries: &[TestEntry]) -> Vec<u8> {
    let mut zip = Vec::new();
    let mut directory = Vec::new();
    for entry in entries {
        let crc = entry.crc.unwrap_or_else(|| crc32fast::hash(entry.contents));
        let offset = zip.len() as u32;
        let size = entry.contents.len() as u32;

        let mut common = Vec::new();
        common.extend_from_slice(&0u16.to_le_bytes()); // flags
        common.extend_from_slice(&entry.method.to_le_bytes());
        common.extend_from_slice(&0x6000u16.to_le_bytes()); // 12:00
        common.extend_from_slice(&0x5021u16.to_le_bytes()); // 2020-01-01
        common.extend_from_slice(&crc.to_le_bytes());
        common.extend_from_slice(&size.to_le_bytes());
        common.extend_from_slice(&size.to_le_bytes());
        common.extend_from_slice(&(entry.path.len() as u16).to_le_bytes());
        common.extend_from_slice(&0u16.to_le_bytes()); // extra

        zip.extend_from_slice(&LOCAL_FILE_HEADER_MAGIC.to_le_bytes());
        zip.extend_from_slice(&20u16.to_le_bytes());
        zip.extend_from_slice(&common);
        zip.extend_from_slice(entry.path.as_bytes());
        zip.extend_from_slice(entry.contents);

        directory.extend_from_slice(&CENTRAL_DIRECTORY_MAGIC.to_le_bytes());
        directory.extend_from_slice(&20u16.to_le_bytes());
        directory.extend_from_slice(&20u16.to_le_bytes());
        directory.extend_from_slice(&common);
        directory.extend_from_slice(&0u16.to_le_bytes()); // comment
        directory.extend_from_slice(&0u16.to_le_bytes()); // disk
        directory.extend_from_slice(&0u16.to_le_bytes());
        directory.extend_from_slice(&0u32.to_le_bytes());
        directory.extend_from_slice(&offset.to_le_bytes());
        directory.extend_from_slice(entry.path.as_bytes());
    }
    let directory_offset = zip.len() as u32;
    zip.extend_from_slice(&directory);
    zip.extend_from_slice(&EOCDR_MAGIC.to_le_bytes());
    zip.extend_from_slice(&0u16.to_le_bytes());
    zip.extend_from_slice(&0u16.to_le_bytes());
    zip.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    zip.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    zip.extend_from_slice(&(directory.len() as u32).to_le_bytes());
    zip.extend_from_slice(&directory_offset.to_le_bytes());
    zip.extend_from_slice(&0u16.to_le_bytes());
    zip
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::package::{find_attribute, AttributeValue, Package, PackageOptions, PackageType};

    #[test]
    fn one_file() -> PakResult<()> {
        let mut package = Package::new(PackageType::Zip);
        package.open_bytes(build(&[TestEntry {
            crc: Some(0xdeadbeef),
            ..TestEntry::stored("docs/readme.txt", b"hello")
        }]))?;
        let tree = package.tree()?;
        assert_eq!(tree.file_count(), 1);

        let readme = package.lookup("docs/readme.txt")?;
        let attributes = package.item_attributes(readme)?;
        assert_eq!(
            find_attribute(&attributes, "Compression Method"),
            Some(&AttributeValue::Unsigned {
                value: 0,
                hexadecimal: false
            })
        );
        assert_eq!(
            find_attribute(&attributes, "CRC"),
            Some(&AttributeValue::Unsigned {
                value: 0xdeadbeef,
                hexadecimal: true
            })
        );
        assert_eq!(
            find_attribute(&attributes, "Modified"),
            Some(&AttributeValue::String("2020-01-01 12:00:00".to_owned()))
        );
        assert_eq!(package.create_stream(readme)?.to_vec()?, b"hello");
        // We lied about the CRC.
        assert_eq!(package.validate(readme)?, Validation::Corrupt);
        Ok(())
    }

    #[test]
    fn unknown_section() {
        let mut bytes = build(&[TestEntry::stored("a.txt", b"abc")]);
        // After the local header and its data, where the central directory should be
        let at = 30 + 5 + 3;
        bytes.splice(at..at, b"JUNK".iter().copied());

        let mapping = Mapping::from_bytes(bytes);
        let views = mapping.view_counter();
        let mut package = Package::new(PackageType::Zip);
        match package.open_mapping(mapping, PackageOptions::default()) {
            Err(PakError::Format(FormatError::UnknownSection { offset, signature })) => {
                assert_eq!(offset, at as u64);
                assert_eq!(signature, u32::from_le_bytes(*b"JUNK"));
            }
            other => panic!("Expected an unknown section, got {:?}", other),
        }
        assert!(!package.is_open());
        assert_eq!(views.mapped(), 0);
    }

    #[test]
    fn compressed_items() -> PakResult<()> {
        let mut package = Package::new(PackageType::Zip);
        package.open_bytes(build(&[
            TestEntry {
                method: 8,
                ..TestEntry::stored("deflated.bin", b"not really deflated")
            },
            TestEntry::stored("stored.bin", b"stored"),
        ]))?;
        let deflated = package.lookup("deflated.bin")?;
        match package.create_stream(deflated) {
            Err(e @ PakError::Extraction(ExtractionError::UnsupportedCompression(8))) => {
                assert!(e.is_item_local())
            }
            other => panic!("Expected unsupported compression, got {:?}", other),
        }
        assert_eq!(package.validate(deflated)?, Validation::AssumedOk);

        let stored = package.lookup("stored.bin")?;
        assert_eq!(package.validate(stored)?, Validation::Ok);
        assert_eq!(package.validate(package.root()?)?, Validation::Ok);
        Ok(())
    }

    #[test]
    fn bad_local_header_offset() -> PakResult<()> {
        let mut bytes = build(&[TestEntry::stored("a.txt", b"abc")]);
        // Point the central directory entry one byte past its local header.
        let directory_offset = 30 + 5 + 3;
        let header_offset_field = directory_offset + 42;
        bytes[header_offset_field..header_offset_field + 4].copy_from_slice(&1u32.to_le_bytes());

        let mut package = Package::new(PackageType::Zip);
        package.open_bytes(bytes)?;
        let a = package.lookup("a.txt")?;
        match package.create_stream(a) {
            Err(PakError::Extraction(ExtractionError::InvalidDataOffset { offset })) => {
                assert_eq!(offset, 1)
            }
            other => panic!("Expected an invalid data offset, got {:?}", other),
        }
        assert_eq!(package.validate(a)?, Validation::Corrupt);
        Ok(())
    }

    #[test]
    fn headers_stay_inside_the_region() {
        // An archive embedded at 16, with the mapping running on past it
        let archive = build(&[TestEntry::stored("a.txt", b"abc")]);
        let mut bytes = vec![0; 16];
        bytes.extend_from_slice(&archive);
        let mapping = Mapping::from_bytes(bytes);

        // The region ends partway through the local file header.
        match ZipDirectory::scan(&mapping, 16, 20) {
            Err(PakError::Mapping(MappingError::TooSmall {
                what,
                needed,
                available,
            })) => {
                assert_eq!(what, "ZIP local file header");
                assert_eq!(needed, 16 + 30);
                assert_eq!(available, 16 + 20);
            }
            other => panic!("Expected a truncated local header, got {:?}", other),
        }

        // The region ends partway through the central directory entry.
        let directory_offset = 30 + 5 + 3;
        match ZipDirectory::scan(&mapping, 16, directory_offset + 10) {
            Err(PakError::Mapping(MappingError::TooSmall {
                what,
                needed,
                available,
            })) => {
                assert_eq!(what, "ZIP central directory entry");
                assert_eq!(needed, 16 + directory_offset + 46);
                assert_eq!(available, 16 + directory_offset + 10);
            }
            other => panic!("Expected a truncated directory entry, got {:?}", other),
        }

        assert!(ZipDirectory::scan(&mapping, 16, archive.len() as u64).is_ok());
    }

    #[test]
    fn empty_archive() -> PakResult<()> {
        let mut package = Package::new(PackageType::None);
        package.open_bytes(build(&[]))?;
        assert_eq!(package.package_type(), PackageType::Zip);
        assert_eq!(package.tree()?.file_count(), 0);
        Ok(())
    }

    #[test]
    fn msdos_dates() {
        assert_eq!(
            parse_msdos(0x6000, 0x5021).map(|d| d.to_string()),
            Some("2020-01-01 12:00:00".to_owned())
        );
        // Month zero
        assert_eq!(parse_msdos(0, 0), None);
    }
}
