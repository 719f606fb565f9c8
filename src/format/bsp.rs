//! Half-Life (GoldSrc) maps.
//!
//! We don't care about the geometry, just what's worth pulling out:
//! the entities lump (as a text file) and each texture embedded in the map
//! (as a bitmap, see [`image`](crate::format::image)).

use log::*;

use crate::format::image::{ImageLayout, MipTexture};
use crate::format::record::*;
use crate::format::{Format, OpenContext};
use crate::mapping::Mapping;
use crate::package::Attribute;
use crate::result::*;
use crate::stream::Stream;
use crate::tree::{DirectoryTree, FileEntry};

const VERSION: u32 = 30;
const LUMP_COUNT: usize = 15;
const HEADER_SIZE: u64 = 4 + LUMP_COUNT as u64 * 8;

const ENTITIES_LUMP: usize = 0;
const TEXTURES_LUMP: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Lump {
    offset: u32,
    length: u32,
}

impl Lump {
    fn start(&self) -> u64 {
        u64::from(self.offset)
    }

    fn end(&self) -> u64 {
        u64::from(self.offset) + u64::from(self.length)
    }
}

/// A texture stored in the map
#[derive(Debug)]
struct Texture {
    header: MipTexture,
    /// Where the texture header is in the file
    offset: u64,
    /// How many bytes from `offset` to the end of the texture lump
    record_length: u64,
    layout: ImageLayout,
}

#[derive(Debug)]
pub struct BspFile {
    lumps: [Lump; LUMP_COUNT],
    textures: Vec<Texture>,
    entities_name: String,
}

impl BspFile {
    fn entities(&self) -> Lump {
        self.lumps[ENTITIES_LUMP]
    }

    /// Entities come after all the textures.
    fn entities_id(&self) -> u32 {
        self.textures.len() as u32
    }

    fn texture(&self, entry: &FileEntry) -> Option<&Texture> {
        self.textures.get(entry.id as usize)
    }

    fn unknown_id(entry: &FileEntry) -> PakError {
        malformed(format!("No BSP item with ID {}", entry.id))
    }

    fn parse_textures(mapping: &Mapping, lump: Lump) -> PakResult<Vec<Texture>> {
        if lump.length == 0 {
            return Ok(Vec::new());
        }
        let textures = mapping.map_record("BSP texture lump", lump.start(), u64::from(lump.length))?;
        let mut header = &textures[..];
        check_len(header, 4, "BSP texture lump")?;
        let count = read_u32(&mut header) as usize;
        check_len(header, count.saturating_mul(4), "BSP texture offsets")?;

        let mut parsed = Vec::new();
        for i in 0..count {
            let offset = read_i32(&mut header);
            if offset < 0 {
                debug!("Texture {} has no data", i);
                continue;
            }
            let record = textures.get(offset as usize..).ok_or_else(|| {
                malformed(format!(
                    "Texture {} at {} is past the end of the {}-byte texture lump",
                    i, offset, lump.length
                ))
            })?;
            let texture = MipTexture::parse(record)?;
            if texture.is_external() {
                debug!("Texture {} ({}) lives in a WAD", i, texture.name);
                continue;
            }
            let layout = texture.layout(record)?;
            trace!("{:?} {:?}", texture, layout);
            parsed.push(Texture {
                header: texture,
                offset: lump.start() + offset as u64,
                record_length: record.len() as u64,
                layout,
            });
        }
        debug!("{} of {} textures are stored in the map", parsed.len(), count);
        Ok(parsed)
    }
}

impl Format for BspFile {
    fn map_data_structures(mapping: &Mapping, context: &OpenContext) -> PakResult<Self> {
        let header = mapping.map_record("BSP header", 0, HEADER_SIZE)?;
        let mut fields = &header[..];
        let version = read_u32(&mut fields);
        if version != VERSION {
            return Err(FormatError::UnsupportedVersion {
                format: "BSP",
                version,
            }
            .into());
        }
        let mut lumps = [Lump::default(); LUMP_COUNT];
        for lump in &mut lumps {
            lump.offset = read_u32(&mut fields);
            lump.length = read_u32(&mut fields);
            if lump.end() > mapping.len() {
                return Err(MappingError::TooSmall {
                    what: "BSP lump",
                    needed: lump.end(),
                    available: mapping.len(),
                }
                .into());
            }
        }
        drop(header);

        let textures = Self::parse_textures(mapping, lumps[TEXTURES_LUMP])?;
        let entities_name = format!("{}.ent", context.stem().unwrap_or("entities"));
        Ok(Self {
            lumps,
            textures,
            entities_name,
        })
    }

    fn create_root(&self, _mapping: &Mapping, tree: &mut DirectoryTree) -> PakResult<()> {
        let root = tree.root();
        if self.entities().length > 0 {
            tree.add_file(root, &self.entities_name, FileEntry::new(self.entities_id()));
        }
        for (id, texture) in self.textures.iter().enumerate() {
            let name = format!("{}.bmp", texture.header.name);
            tree.add_file(root, &name, FileEntry::new(id as u32));
        }
        Ok(())
    }

    fn package_attributes(&self) -> Vec<Attribute> {
        vec![Attribute::unsigned("Version", VERSION)]
    }

    fn item_attributes(&self, _mapping: &Mapping, entry: &FileEntry) -> PakResult<Vec<Attribute>> {
        Ok(match self.texture(entry) {
            Some(texture) => vec![
                Attribute::unsigned("Width", texture.layout.width),
                Attribute::unsigned("Height", texture.layout.height),
                Attribute::unsigned("Palette Entries", texture.layout.palette_entries),
            ],
            None => Vec::new(),
        })
    }

    fn size(&self, _mapping: &Mapping, entry: &FileEntry) -> PakResult<u64> {
        match self.texture(entry) {
            Some(texture) => Ok(texture.layout.bitmap_size()),
            // Drop the entities' NUL terminator.
            None if entry.id == self.entities_id() => {
                Ok(u64::from(self.entities().length.saturating_sub(1)))
            }
            None => Err(Self::unknown_id(entry)),
        }
    }

    fn size_on_disk(&self, mapping: &Mapping, entry: &FileEntry) -> PakResult<u64> {
        match self.texture(entry) {
            // The pixels and palette, as stored
            Some(texture) => Ok(texture.layout.palette_offset
                + u64::from(texture.layout.palette_entries) * 3),
            None => self.size(mapping, entry),
        }
    }

    fn create_stream<'a>(
        &'a self,
        mapping: &'a Mapping,
        entry: &FileEntry,
    ) -> PakResult<Stream<'a>> {
        match self.texture(entry) {
            Some(texture) => {
                let record = mapping.map(texture.offset, texture.record_length)?;
                Ok(Stream::from_buffer(texture.layout.to_bitmap(&record)?))
            }
            None if entry.id == self.entities_id() => {
                let lump = self.entities();
                let view = mapping.map(lump.start(), u64::from(lump.length.saturating_sub(1)))?;
                Ok(Stream::from_view(view))
            }
            None => Err(Self::unknown_id(entry)),
        }
    }
}

/// Builds a map with the given entities and texture records, for tests.
#[cfg(test)]
pub(crate) fn build(entities: &[u8], textures: &[Vec<u8>]) -> Vec<u8> {
    let entities_offset = HEADER_SIZE as u32;
    let mut lump = Vec::new();
    lump.extend_from_slice(&(textures.len() as u32).to_le_bytes());
    let mut offset = 4 + 4 * textures.len();
    for texture in textures {
        lump.extend_from_slice(&(offset as u32).to_le_bytes());
        offset += texture.len();
    }
    for texture in textures {
        lump.extend_from_slice(texture);
    }
    let textures_offset = entities_offset + entities.len() as u32;

    let mut bsp = Vec::new();
    bsp.extend_from_slice(&VERSION.to_le_bytes());
    for i in 0..LUMP_COUNT {
        let (offset, length) = match i {
            ENTITIES_LUMP => (entities_offset, entities.len() as u32),
            TEXTURES_LUMP => (textures_offset, lump.len() as u32),
            _ => (0, 0),
        };
        bsp.extend_from_slice(&offset.to_le_bytes());
        bsp.extend_from_slice(&length.to_le_bytes());
    }
    bsp.extend_from_slice(entities);
    bsp.extend_from_slice(&lump);
    bsp
}
