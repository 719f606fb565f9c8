//! Valve packs (VPK), versions 1 and 2.
//!
//! The directory is a tree of NUL-terminated strings nested three deep:
//! extension, then folder path, then file name, each level ending with an empty
//! string. After each name comes its entry record, then any preload bytes.
//!
//! Big packs are split: `pak01_dir.vpk` holds the directory and some data,
//! and the rest lives in `pak01_000.vpk`, `pak01_001.vpk`, and so on.

use camino::Utf8PathBuf;
use log::*;
use memchr::memchr;

use crate::checksum::{Checksum, Crc32, Md5};
use crate::format::record::*;
use crate::format::{digest_stream, record_for, Format, OpenContext};
use crate::mapping::Mapping;
use crate::package::{Attribute, Validation};
use crate::result::*;
use crate::stream::{Segment, Stream};
use crate::tree::{DirectoryTree, FileEntry};

const SIGNATURE: u32 = 0x55aa1234;
const V1_HEADER_SIZE: u64 = 12;
const V2_HEADER_SIZE: u64 = 28;
const ENTRY_SIZE: usize = 18;
const ENTRY_TERMINATOR: u16 = 0xffff;

/// The archive index of data stored in the directory file, after the tree
const DIRECTORY_ARCHIVE: u16 = 0x7fff;

/// Tree MD5, archive MD5 section MD5, whole file MD5
const OTHER_MD5_SIZE: u32 = 48;

/// Stands in for an empty extension or folder path in the tree
const BLANK: &str = " ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    version: u32,
    tree_length: u32,
    // Version 2 only:
    file_data_length: u32,
    archive_md5_length: u32,
    other_md5_length: u32,
    signature_length: u32,
}

impl Header {
    fn size(&self) -> u64 {
        if self.version == 1 {
            V1_HEADER_SIZE
        } else {
            V2_HEADER_SIZE
        }
    }

    fn parse(mapping: &Mapping) -> PakResult<Self> {
        let prefix = mapping.map_record("VPK header", 0, V1_HEADER_SIZE)?;
        let mut fields = &prefix[..];
        let signature = read_u32(&mut fields);
        if signature != SIGNATURE {
            return Err(FormatError::InvalidSignature {
                format: "VPK",
                found: describe_signature(&prefix[..4]),
            }
            .into());
        }
        let version = read_u32(&mut fields);
        let tree_length = read_u32(&mut fields);
        let mut header = Self {
            version,
            tree_length,
            file_data_length: 0,
            archive_md5_length: 0,
            other_md5_length: 0,
            signature_length: 0,
        };
        match version {
            1 => {}
            2 => {
                let rest = mapping.map_record(
                    "VPK header",
                    V1_HEADER_SIZE,
                    V2_HEADER_SIZE - V1_HEADER_SIZE,
                )?;
                let mut fields = &rest[..];
                header.file_data_length = read_u32(&mut fields);
                header.archive_md5_length = read_u32(&mut fields);
                header.other_md5_length = read_u32(&mut fields);
                header.signature_length = read_u32(&mut fields);
            }
            version => {
                return Err(FormatError::UnsupportedVersion {
                    format: "VPK",
                    version,
                }
                .into())
            }
        }
        Ok(header)
    }

    /// Where data for the directory file's own entries starts
    fn data_offset(&self) -> u64 {
        self.size() + u64::from(self.tree_length)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    crc: u32,
    archive: u16,
    offset: u32,
    length: u32,
    preload: Vec<u8>,
}

impl Entry {
    fn parse(input: &mut &[u8]) -> PakResult<Self> {
        check_len(input, ENTRY_SIZE, "VPK directory entry")?;
        let crc = read_u32(input);
        let preload_length = usize::from(read_u16(input));
        let archive = read_u16(input);
        let offset = read_u32(input);
        let length = read_u32(input);
        let terminator = read_u16(input);
        if terminator != ENTRY_TERMINATOR {
            return Err(malformed(format!(
                "VPK entry ends in {:#06x}, not {:#06x}",
                terminator, ENTRY_TERMINATOR
            )));
        }
        check_len(input, preload_length, "VPK preload data")?;
        let preload = read_bytes(input, preload_length).to_vec();
        Ok(Self {
            crc,
            archive,
            offset,
            length,
            preload,
        })
    }

    fn size(&self) -> u64 {
        self.preload.len() as u64 + u64::from(self.length)
    }
}

/// Splits a NUL-terminated string off the front of the tree.
fn read_name(input: &mut &[u8]) -> PakResult<String> {
    let nul = memchr(0, input).ok_or_else(|| malformed("Unterminated name in VPK directory tree"))?;
    let name = String::from_utf8_lossy(&input[..nul]).into_owned();
    *input = &input[nul + 1..];
    Ok(name)
}

/// Puts a tree triple back together into a path.
fn join_path(extension: &str, folder: &str, name: &str) -> String {
    let mut path = String::new();
    if folder != BLANK && !folder.is_empty() {
        path.push_str(folder);
        path.push('/');
    }
    path.push_str(name);
    if extension != BLANK && !extension.is_empty() {
        path.push('.');
        path.push_str(extension);
    }
    path
}

#[derive(Debug)]
struct Item {
    path: String,
    entry: Entry,
}

/// One of the numbered archives beside a split pack's directory file
#[derive(Debug)]
struct Archive {
    path: Utf8PathBuf,
    /// `None` if it couldn't be opened
    mapping: Option<Mapping>,
}

#[derive(Debug)]
pub struct VpkFile {
    header: Header,
    items: Vec<Item>,
    archives: Vec<Archive>,
}

impl VpkFile {
    fn parse_tree(mut tree: &[u8]) -> PakResult<Vec<Item>> {
        let mut items = Vec::new();
        loop {
            let extension = read_name(&mut tree)?;
            if extension.is_empty() {
                break;
            }
            loop {
                let folder = read_name(&mut tree)?;
                if folder.is_empty() {
                    break;
                }
                loop {
                    let name = read_name(&mut tree)?;
                    if name.is_empty() {
                        break;
                    }
                    let entry = Entry::parse(&mut tree)?;
                    let path = join_path(&extension, &folder, &name);
                    trace!("{}: {:?}", path, entry);
                    items.push(Item { path, entry });
                }
            }
        }
        if !tree.is_empty() {
            warn!("{} bytes after the VPK directory tree", tree.len());
        }
        Ok(items)
    }

    /// Maps the numbered archives the items refer to.
    /// Packs that aren't split (or weren't opened from a file) have none.
    fn open_archives(items: &[Item], context: &OpenContext) -> Vec<Archive> {
        let count = items
            .iter()
            .map(|i| i.entry.archive)
            .filter(|&a| a != DIRECTORY_ARCHIVE)
            .max()
            .map_or(0, |a| usize::from(a) + 1);
        if count == 0 {
            return Vec::new();
        }

        let prefix = context
            .path
            .map(|p| p.as_str())
            .and_then(|p| p.strip_suffix("dir.vpk"))
            .filter(|p| p.ends_with('_'));
        let prefix = match prefix {
            Some(p) => p,
            None => {
                warn!(
                    "Items are stored in {} other archives, but this isn't a *_dir.vpk file",
                    count
                );
                return (0..count)
                    .map(|i| Archive {
                        path: Utf8PathBuf::from(format!("{:03}.vpk", i)),
                        mapping: None,
                    })
                    .collect();
            }
        };

        (0..count)
            .map(|i| {
                let path = Utf8PathBuf::from(format!("{}{:03}.vpk", prefix, i));
                let mapping = match Mapping::open(&path, context.options.mode) {
                    Ok(m) => Some(m),
                    Err(e) => {
                        warn!("Couldn't open {}: {}", path, e);
                        None
                    }
                };
                Archive { path, mapping }
            })
            .collect()
    }

    fn md5_of(mapping: &Mapping, offset: u64, length: u64) -> PakResult<[u8; 16]> {
        let view = mapping.map(offset, length)?;
        let mut md5 = Md5::new();
        md5.update(&view);
        Ok(md5.finalize())
    }
}

impl Format for VpkFile {
    fn map_data_structures(mapping: &Mapping, context: &OpenContext) -> PakResult<Self> {
        let header = Header::parse(mapping)?;
        trace!("{:?}", header);
        let items = {
            let tree = mapping.map_record(
                "VPK directory tree",
                header.size(),
                u64::from(header.tree_length),
            )?;
            Self::parse_tree(&tree)?
        };
        let archives = Self::open_archives(&items, context);
        debug!(
            "VPK version {}: {} items, {} archives",
            header.version,
            items.len(),
            archives.len()
        );
        Ok(Self {
            header,
            items,
            archives,
        })
    }

    fn create_root(&self, _mapping: &Mapping, tree: &mut DirectoryTree) -> PakResult<()> {
        let root = tree.root();
        for (id, item) in self.items.iter().enumerate() {
            tree.add_path(root, &item.path, FileEntry::new(id as u32));
        }
        Ok(())
    }

    fn package_attributes(&self) -> Vec<Attribute> {
        vec![
            Attribute::unsigned("Version", self.header.version),
            Attribute::unsigned("Archives", self.archives.len() as u64),
        ]
    }

    fn item_attributes(&self, _mapping: &Mapping, entry: &FileEntry) -> PakResult<Vec<Attribute>> {
        let item = record_for(&self.items, entry)?;
        Ok(vec![
            Attribute::unsigned("Preload Bytes", item.entry.preload.len() as u64),
            Attribute::unsigned("Archive", item.entry.archive),
            Attribute::hex("CRC", item.entry.crc),
        ])
    }

    fn size(&self, _mapping: &Mapping, entry: &FileEntry) -> PakResult<u64> {
        Ok(record_for(&self.items, entry)?.entry.size())
    }

    fn create_stream<'a>(
        &'a self,
        mapping: &'a Mapping,
        entry: &FileEntry,
    ) -> PakResult<Stream<'a>> {
        let item = record_for(&self.items, entry)?;
        let (source, base) = match item.entry.archive {
            DIRECTORY_ARCHIVE => (mapping, self.header.data_offset()),
            index => {
                let archive = self.archives.get(usize::from(index)).ok_or_else(|| {
                    malformed(format!("{} is in missing archive {}", item.path, index))
                })?;
                let mapping = archive
                    .mapping
                    .as_ref()
                    .ok_or_else(|| ExtractionError::MissingData(archive.path.to_string()))?;
                (mapping, 0)
            }
        };

        let mut segments = Vec::with_capacity(2);
        if !item.entry.preload.is_empty() {
            segments.push(Segment::Borrowed(&item.entry.preload[..]));
        }
        if item.entry.length > 0 {
            let offset = base + u64::from(item.entry.offset);
            let view = source
                .map(offset, u64::from(item.entry.length))
                .map_err(|_| ExtractionError::InvalidDataOffset { offset })?;
            segments.push(Segment::Mapped(view));
        }
        Ok(Stream::from_segments(segments))
    }

    fn validate(&self, mapping: &Mapping, entry: &FileEntry) -> PakResult<Validation> {
        let item = record_for(&self.items, entry)?;
        let stream = match self.create_stream(mapping, entry) {
            Ok(s) => s,
            Err(PakError::Extraction(e)) => {
                debug!("Can't read {}: {}", item.path, e);
                return Ok(Validation::Corrupt);
            }
            Err(e) => return Err(e),
        };
        Ok(if digest_stream(stream, Crc32::new())? == item.entry.crc {
            Validation::Ok
        } else {
            Validation::Corrupt
        })
    }

    /// Version 2 packs end with MD5s of the tree and of the archive MD5 section.
    fn validate_package(&self, mapping: &Mapping) -> PakResult<Validation> {
        let header = &self.header;
        if header.version != 2 || header.other_md5_length < OTHER_MD5_SIZE {
            return Ok(Validation::AssumedOk);
        }
        let archive_md5_offset = header.data_offset() + u64::from(header.file_data_length);
        let other_md5_offset = archive_md5_offset + u64::from(header.archive_md5_length);
        let (tree_md5, archive_md5_md5) = {
            let other = mapping.map_record(
                "VPK MD5 section",
                other_md5_offset,
                u64::from(OTHER_MD5_SIZE),
            )?;
            let mut fields = &other[..];
            (read_array::<16>(&mut fields), read_array::<16>(&mut fields))
        };

        let tree = Self::md5_of(mapping, header.size(), u64::from(header.tree_length))?;
        let archive_md5s = Self::md5_of(
            mapping,
            archive_md5_offset,
            u64::from(header.archive_md5_length),
        )?;
        if tree != tree_md5 {
            debug!("VPK tree MD5 mismatch");
            return Ok(Validation::Corrupt);
        }
        if archive_md5s != archive_md5_md5 {
            debug!("VPK archive MD5 section MD5 mismatch");
            return Ok(Validation::Corrupt);
        }
        trace!("{} signature bytes (not checked)", header.signature_length);
        Ok(Validation::Ok)
    }
}
