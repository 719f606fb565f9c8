//! Xbox Zip packs (XZP), from the Xbox port of Half-Life 2.
//!
//! Entries are keyed by a CRC of their name. Names themselves are optional:
//! when the pack carries directory items we use them, and otherwise
//! entries are listed by their CRC in hex.

use std::collections::HashMap;

use log::*;

use crate::format::record::*;
use crate::format::{record_for, Format, OpenContext};
use crate::mapping::Mapping;
use crate::package::Attribute;
use crate::result::*;
use crate::stream::Stream;
use crate::tree::{DirectoryTree, FileEntry};

const SIGNATURE: &[u8; 4] = b"piZx";
const FOOTER_SIGNATURE: &[u8; 4] = b"tFzX";
const VERSION: u32 = 6;
const HEADER_SIZE: u64 = 36;
const FOOTER_SIZE: u64 = 8;
const ENTRY_SIZE: usize = 12;
const ITEM_SIZE: usize = 12;
const NO_PRELOAD: u16 = 0xffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    preload_entry_count: u32,
    entry_count: u32,
    preload_bytes: u32,
    header_length: u32,
    item_count: u32,
    item_offset: u32,
    item_length: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    name_crc: u32,
    length: u32,
    offset: u32,
}

impl Entry {
    fn parse(mut record: &[u8]) -> Self {
        Self {
            name_crc: read_u32(&mut record),
            length: read_u32(&mut record),
            offset: read_u32(&mut record),
        }
    }
}

#[derive(Debug)]
struct Item {
    entry: Entry,
    name: Option<String>,
    created: Option<u32>,
    /// Length of the entry's preload copy, if it has one
    preload: u32,
}

#[derive(Debug)]
pub struct XzpFile {
    header: Header,
    items: Vec<Item>,
}

impl XzpFile {
    fn parse_header(mapping: &Mapping) -> PakResult<Header> {
        let header = mapping.map_record("XZP header", 0, HEADER_SIZE)?;
        let mut fields = &header[..];
        let signature = read_array::<4>(&mut fields);
        if &signature != SIGNATURE {
            return Err(FormatError::InvalidSignature {
                format: "XZP",
                found: describe_signature(&signature),
            }
            .into());
        }
        let version = read_u32(&mut fields);
        if version != VERSION {
            return Err(FormatError::UnsupportedVersion {
                format: "XZP",
                version,
            }
            .into());
        }
        Ok(Header {
            preload_entry_count: read_u32(&mut fields),
            entry_count: read_u32(&mut fields),
            preload_bytes: read_u32(&mut fields),
            header_length: read_u32(&mut fields),
            item_count: read_u32(&mut fields),
            item_offset: read_u32(&mut fields),
            item_length: read_u32(&mut fields),
        })
    }

    fn check_footer(mapping: &Mapping) -> PakResult<()> {
        let at = mapping.len().checked_sub(FOOTER_SIZE).ok_or(MappingError::TooSmall {
            what: "XZP footer",
            needed: HEADER_SIZE + FOOTER_SIZE,
            available: mapping.len(),
        })?;
        let footer = mapping.map_record("XZP footer", at, FOOTER_SIZE)?;
        let mut fields = &footer[..];
        let file_length = read_u32(&mut fields);
        let signature = read_array::<4>(&mut fields);
        if &signature != FOOTER_SIGNATURE {
            return Err(FormatError::InvalidSignature {
                format: "XZP footer",
                found: describe_signature(&signature),
            }
            .into());
        }
        if u64::from(file_length) != mapping.len() {
            return Err(malformed(format!(
                "XZP footer says the file is {} bytes, but it's {}",
                file_length,
                mapping.len()
            )));
        }
        Ok(())
    }

    /// Reads the preload entries and which entry each belongs to,
    /// returning each entry's preload length.
    fn parse_preload(mapping: &Mapping, header: &Header) -> PakResult<Vec<u32>> {
        let mut lengths = vec![0; header.entry_count as usize];
        if header.preload_bytes == 0 || header.preload_entry_count == 0 {
            return Ok(lengths);
        }
        let entries_offset =
            u64::from(header.header_length) + u64::from(header.entry_count) * ENTRY_SIZE as u64;
        let preload_entries: Vec<Entry> = mapping
            .map_record(
                "XZP preload entries",
                entries_offset,
                u64::from(header.preload_entry_count) * ENTRY_SIZE as u64,
            )?
            .chunks_exact(ENTRY_SIZE)
            .map(Entry::parse)
            .collect();

        let map_offset =
            entries_offset + u64::from(header.preload_entry_count) * ENTRY_SIZE as u64;
        let preload_map = mapping.map_record(
            "XZP preload map",
            map_offset,
            u64::from(header.entry_count) * 2,
        )?;
        for (length, index) in lengths.iter_mut().zip(preload_map.chunks_exact(2)) {
            let index = u16::from_le_bytes([index[0], index[1]]);
            if index == NO_PRELOAD {
                continue;
            }
            match preload_entries.get(usize::from(index)) {
                Some(preload) => *length = preload.length,
                None => warn!("XZP preload index {} is out of range", index),
            }
        }
        Ok(lengths)
    }

    /// Reads the optional directory items, keyed by name CRC.
    fn parse_names(mapping: &Mapping, header: &Header) -> PakResult<HashMap<u32, (String, u32)>> {
        let mut names = HashMap::new();
        if header.item_count == 0 {
            return Ok(names);
        }
        let region = mapping.map_record(
            "XZP directory items",
            u64::from(header.item_offset),
            u64::from(header.item_length),
        )?;
        check_len(
            &region,
            header.item_count as usize * ITEM_SIZE,
            "XZP directory items",
        )?;
        for mut record in region.chunks_exact(ITEM_SIZE).take(header.item_count as usize) {
            let name_crc = read_u32(&mut record);
            let name_offset = read_u32(&mut record);
            let created = read_u32(&mut record);
            // Name offsets are from the start of the file.
            let name = name_offset
                .checked_sub(header.item_offset)
                .and_then(|relative| region.get(relative as usize..))
                .map(|bytes| c_str(bytes).into_owned())
                .ok_or_else(|| {
                    malformed(format!(
                        "XZP name at {} is outside the directory items",
                        name_offset
                    ))
                })?;
            trace!("{:08x}: {} ({})", name_crc, name, created);
            names.insert(name_crc, (name, created));
        }
        Ok(names)
    }
}

impl Format for XzpFile {
    fn map_data_structures(mapping: &Mapping, _context: &OpenContext) -> PakResult<Self> {
        let header = Self::parse_header(mapping)?;
        trace!("{:?}", header);
        Self::check_footer(mapping)?;

        let entries: Vec<Entry> = mapping
            .map_record(
                "XZP directory entries",
                u64::from(header.header_length),
                u64::from(header.entry_count) * ENTRY_SIZE as u64,
            )?
            .chunks_exact(ENTRY_SIZE)
            .map(Entry::parse)
            .collect();
        let preload = Self::parse_preload(mapping, &header)?;
        let mut names = Self::parse_names(mapping, &header)?;

        let items: Vec<Item> = entries
            .into_iter()
            .zip(preload)
            .map(|(entry, preload)| {
                let (name, created) = match names.remove(&entry.name_crc) {
                    Some((name, created)) => (Some(name), Some(created)),
                    None => (None, None),
                };
                Item {
                    entry,
                    name,
                    created,
                    preload,
                }
            })
            .collect();
        debug!(
            "XZP has {} entries, {} named",
            items.len(),
            items.iter().filter(|i| i.name.is_some()).count()
        );
        Ok(Self { header, items })
    }

    fn create_root(&self, _mapping: &Mapping, tree: &mut DirectoryTree) -> PakResult<()> {
        let root = tree.root();
        for (id, item) in self.items.iter().enumerate() {
            let entry = FileEntry::new(id as u32);
            match &item.name {
                Some(name) => {
                    tree.add_path(root, name, entry);
                }
                None => {
                    tree.add_file(root, &format!("{:08x}", item.entry.name_crc), entry);
                }
            }
        }
        Ok(())
    }

    fn package_attributes(&self) -> Vec<Attribute> {
        vec![
            Attribute::unsigned("Version", VERSION),
            Attribute::unsigned("Preload Bytes", self.header.preload_bytes),
        ]
    }

    fn item_attributes(&self, _mapping: &Mapping, entry: &FileEntry) -> PakResult<Vec<Attribute>> {
        let item = record_for(&self.items, entry)?;
        let mut attributes = Vec::new();
        if let Some(created) = item.created.and_then(format_unix_time) {
            attributes.push(Attribute::string("Created", created));
        }
        attributes.push(Attribute::unsigned("Preload Bytes", item.preload));
        Ok(attributes)
    }

    fn size(&self, _mapping: &Mapping, entry: &FileEntry) -> PakResult<u64> {
        Ok(u64::from(record_for(&self.items, entry)?.entry.length))
    }

    fn create_stream<'a>(
        &'a self,
        mapping: &'a Mapping,
        entry: &FileEntry,
    ) -> PakResult<Stream<'a>> {
        let item = record_for(&self.items, entry)?;
        let offset = u64::from(item.entry.offset);
        let view = mapping
            .map(offset, u64::from(item.entry.length))
            .map_err(|_| ExtractionError::InvalidDataOffset { offset })?;
        Ok(Stream::from_view(view))
    }
}
