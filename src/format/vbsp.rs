//! Source engine maps.
//!
//! Every lump is listed as a raw file under `lumps/`, the entities lump is also
//! listed as a text file, and the pakfile lump (a Zip archive of the map's
//! custom content) is opened up and listed alongside them.
//!
//! Item IDs: `0..64` are lumps, 64 is the entities, and the pakfile's entries follow.

use log::*;

use crate::format::record::*;
use crate::format::zip::ZipDirectory;
use crate::format::{Format, OpenContext};
use crate::mapping::Mapping;
use crate::package::{Attribute, Validation};
use crate::result::*;
use crate::stream::Stream;
use crate::tree::{DirectoryTree, FileEntry};

const SIGNATURE: &[u8; 4] = b"VBSP";
const SUPPORTED_VERSIONS: std::ops::RangeInclusive<u32> = 19..=21;
const LUMP_COUNT: u32 = 64;
const LUMP_SIZE: usize = 16;
const HEADER_SIZE: u64 = 4 + 4 + LUMP_COUNT as u64 * LUMP_SIZE as u64 + 4;

const ENTITIES_LUMP: u32 = 0;
const PAKFILE_LUMP: u32 = 40;

const ENTITIES_ID: u32 = LUMP_COUNT;
const FIRST_PAKFILE_ID: u32 = LUMP_COUNT + 1;

/// Zip's method number for LZMA, which is what compressed lumps use
const LZMA: u32 = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Lump {
    offset: u32,
    length: u32,
    version: u32,
    /// Nonzero for LZMA-compressed lumps, in which case it's the uncompressed length
    four_cc: u32,
}

impl Lump {
    fn parse(mut lump: &[u8]) -> Self {
        Self {
            offset: read_u32(&mut lump),
            length: read_u32(&mut lump),
            version: read_u32(&mut lump),
            four_cc: read_u32(&mut lump),
        }
    }

    fn is_compressed(&self) -> bool {
        self.four_cc != 0
    }

    fn size(&self) -> u32 {
        if self.is_compressed() {
            self.four_cc
        } else {
            self.length
        }
    }
}

#[derive(Debug)]
pub struct VbspFile {
    version: u32,
    map_revision: u32,
    lumps: Vec<Lump>,
    pakfile: Option<ZipDirectory>,
    map_name: String,
}

impl VbspFile {
    fn lump(&self, id: u32) -> PakResult<&Lump> {
        self.lumps
            .get(id as usize)
            .ok_or_else(|| malformed(format!("No VBSP lump {}", id)))
    }

    fn pakfile(&self) -> PakResult<&ZipDirectory> {
        self.pakfile
            .as_ref()
            .ok_or_else(|| malformed("VBSP has no pakfile"))
    }

    fn lump_stream<'a>(&self, mapping: &'a Mapping, lump: &Lump, trim: u32) -> PakResult<Stream<'a>> {
        if lump.is_compressed() {
            return Err(ExtractionError::UnsupportedCompression(LZMA).into());
        }
        let view = mapping.map(u64::from(lump.offset), u64::from(lump.length.saturating_sub(trim)))?;
        Ok(Stream::from_view(view))
    }
}

impl Format for VbspFile {
    fn map_data_structures(mapping: &Mapping, context: &OpenContext) -> PakResult<Self> {
        let header = mapping.map_record("VBSP header", 0, HEADER_SIZE)?;
        let mut fields = &header[..];
        let signature = read_array::<4>(&mut fields);
        if &signature != SIGNATURE {
            return Err(FormatError::InvalidSignature {
                format: "VBSP",
                found: describe_signature(&signature),
            }
            .into());
        }
        let version = read_u32(&mut fields);
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(FormatError::UnsupportedVersion {
                format: "VBSP",
                version,
            }
            .into());
        }
        let lumps: Vec<Lump> = read_bytes(&mut fields, LUMP_COUNT as usize * LUMP_SIZE)
            .chunks_exact(LUMP_SIZE)
            .map(Lump::parse)
            .collect();
        let map_revision = read_u32(&mut fields);
        drop(header);

        for (i, lump) in lumps.iter().enumerate() {
            let end = u64::from(lump.offset) + u64::from(lump.length);
            if end > mapping.len() {
                return Err(MappingError::TooSmall {
                    what: "VBSP lump",
                    needed: end,
                    available: mapping.len(),
                }
                .into());
            }
            if lump.length > 0 {
                trace!("Lump {}: {:?}", i, lump);
            }
        }

        let pak = lumps[PAKFILE_LUMP as usize];
        let pakfile = if pak.length == 0 {
            None
        } else if pak.is_compressed() {
            warn!("Pakfile lump is compressed; its contents won't be listed");
            None
        } else {
            Some(ZipDirectory::scan(
                mapping,
                u64::from(pak.offset),
                u64::from(pak.length),
            )?)
        };

        debug!(
            "VBSP version {} revision {}, {} pakfile entries",
            version,
            map_revision,
            pakfile.as_ref().map_or(0, |p| p.len())
        );
        Ok(Self {
            version,
            map_revision,
            lumps,
            pakfile,
            map_name: context.stem().unwrap_or("entities").to_owned(),
        })
    }

    fn create_root(&self, _mapping: &Mapping, tree: &mut DirectoryTree) -> PakResult<()> {
        let root = tree.root();
        if self.lumps[ENTITIES_LUMP as usize].length > 0 {
            let name = format!("{}.ent", self.map_name);
            tree.add_file(root, &name, FileEntry::new(ENTITIES_ID));
        }

        let folder = tree.add_folder(root, "lumps");
        for (id, lump) in self.lumps.iter().enumerate() {
            if lump.length > 0 {
                let name = format!("lump_l_{}.lmp", id);
                tree.add_file(folder, &name, FileEntry::new(id as u32));
            }
        }

        if let Some(pakfile) = &self.pakfile {
            pakfile.add_to_tree(tree, root, FIRST_PAKFILE_ID)?;
        }
        Ok(())
    }

    fn package_attributes(&self) -> Vec<Attribute> {
        vec![
            Attribute::unsigned("Version", self.version),
            Attribute::unsigned("Map Revision", self.map_revision),
        ]
    }

    fn item_attributes(&self, _mapping: &Mapping, entry: &FileEntry) -> PakResult<Vec<Attribute>> {
        match entry.id {
            ENTITIES_ID => Ok(Vec::new()),
            id if id < LUMP_COUNT => {
                let lump = self.lump(id)?;
                Ok(vec![
                    Attribute::unsigned("Version", lump.version),
                    Attribute::hex("Four CC", lump.four_cc),
                ])
            }
            _ => self.pakfile()?.entry_attributes(entry),
        }
    }

    fn size(&self, _mapping: &Mapping, entry: &FileEntry) -> PakResult<u64> {
        match entry.id {
            ENTITIES_ID => {
                let lump = self.lump(ENTITIES_LUMP)?;
                Ok(u64::from(lump.size().saturating_sub(1)))
            }
            id if id < LUMP_COUNT => Ok(u64::from(self.lump(id)?.size())),
            _ => self.pakfile()?.entry_size(entry),
        }
    }

    fn size_on_disk(&self, mapping: &Mapping, entry: &FileEntry) -> PakResult<u64> {
        match entry.id {
            id if id < LUMP_COUNT => Ok(u64::from(self.lump(id)?.length)),
            ENTITIES_ID => self.size(mapping, entry),
            _ => self.pakfile()?.entry_size_on_disk(entry),
        }
    }

    fn create_stream<'a>(
        &'a self,
        mapping: &'a Mapping,
        entry: &FileEntry,
    ) -> PakResult<Stream<'a>> {
        match entry.id {
            // Drop the entities' NUL terminator.
            ENTITIES_ID => self.lump_stream(mapping, self.lump(ENTITIES_LUMP)?, 1),
            id if id < LUMP_COUNT => self.lump_stream(mapping, self.lump(id)?, 0),
            _ => self.pakfile()?.entry_stream(mapping, entry),
        }
    }

    fn validate(&self, mapping: &Mapping, entry: &FileEntry) -> PakResult<Validation> {
        if entry.id <= ENTITIES_ID {
            return Ok(Validation::AssumedOk);
        }
        self.pakfile()?.validate_entry(mapping, entry)
    }
}
