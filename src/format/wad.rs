//! Half-Life texture packages (WAD3).
//!
//! A WAD is a list of named lumps. Pictures, mip textures, and fonts are
//! paletted images, which we present as bitmaps; anything else is passed
//! through as-is.

use log::*;

use crate::format::image::{self, ImageLayout, MipTexture};
use crate::format::record::*;
use crate::format::{record_for, Format, OpenContext};
use crate::mapping::Mapping;
use crate::package::Attribute;
use crate::result::*;
use crate::stream::Stream;
use crate::tree::{DirectoryTree, FileEntry};

const SIGNATURE: &[u8; 4] = b"WAD3";
const HEADER_SIZE: u64 = 12;
const LUMP_SIZE: u64 = 32;

const TYPE_PICTURE: u8 = 0x42;
const TYPE_MIP_TEXTURE: u8 = 0x43;
const TYPE_FONT: u8 = 0x46;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WadLump {
    pub offset: u32,
    pub disk_length: u32,
    pub length: u32,
    pub kind: u8,
    pub compression: u8,
    pub name: String,
}

impl WadLump {
    fn parse(mut lump: &[u8]) -> Self {
        let offset = read_u32(&mut lump);
        let disk_length = read_u32(&mut lump);
        let length = read_u32(&mut lump);
        let kind = read_u8(&mut lump);
        let compression = read_u8(&mut lump);
        let _padding = read_u16(&mut lump);
        let name = c_str(read_bytes(&mut lump, 16)).into_owned();
        Self {
            offset,
            disk_length,
            length,
            kind,
            compression,
            name,
        }
    }

    fn is_image(&self) -> bool {
        matches!(self.kind, TYPE_PICTURE | TYPE_MIP_TEXTURE | TYPE_FONT)
    }
}

#[derive(Debug)]
struct Item {
    lump: WadLump,
    /// For uncompressed images, where the pixels and palette are
    layout: Option<ImageLayout>,
    mipmaps: u32,
}

#[derive(Debug)]
pub struct WadFile {
    items: Vec<Item>,
}

impl WadFile {
    fn locate_image(lump: &WadLump, bytes: &[u8]) -> PakResult<(ImageLayout, u32)> {
        match lump.kind {
            TYPE_MIP_TEXTURE => {
                let texture = MipTexture::parse(bytes)?;
                let mipmaps = texture.offsets.iter().filter(|o| **o != 0).count() as u32;
                Ok((texture.layout(bytes)?, mipmaps))
            }
            TYPE_FONT => Ok((image::font_layout(bytes)?, 0)),
            _ => Ok((image::picture_layout(bytes)?, 0)),
        }
    }
}

impl Format for WadFile {
    fn map_data_structures(mapping: &Mapping, _context: &OpenContext) -> PakResult<Self> {
        let header = mapping.map_record("WAD header", 0, HEADER_SIZE)?;
        let mut fields = &header[..];
        let signature = read_array::<4>(&mut fields);
        if &signature != SIGNATURE {
            return Err(FormatError::InvalidSignature {
                format: "WAD",
                found: describe_signature(&signature),
            }
            .into());
        }
        let lump_count = read_u32(&mut fields);
        let lump_offset = read_u32(&mut fields);
        drop(header);

        let directory = mapping.map_record(
            "WAD lump directory",
            u64::from(lump_offset),
            u64::from(lump_count) * LUMP_SIZE,
        )?;
        let mut items = Vec::with_capacity(lump_count as usize);
        for lump in directory.chunks_exact(LUMP_SIZE as usize).map(WadLump::parse) {
            trace!("{:?}", lump);
            let (layout, mipmaps) = if lump.is_image() && lump.compression == 0 {
                let bytes = mapping.map_record(
                    "WAD lump",
                    u64::from(lump.offset),
                    u64::from(lump.disk_length),
                )?;
                let (layout, mipmaps) = Self::locate_image(&lump, &bytes)?;
                (Some(layout), mipmaps)
            } else {
                (None, 0)
            };
            items.push(Item {
                lump,
                layout,
                mipmaps,
            });
        }
        debug!("WAD has {} lumps", items.len());
        Ok(Self { items })
    }

    fn create_root(&self, _mapping: &Mapping, tree: &mut DirectoryTree) -> PakResult<()> {
        let root = tree.root();
        for (id, item) in self.items.iter().enumerate() {
            let extension = if item.lump.is_image() { "bmp" } else { "lmp" };
            let name = format!("{}.{}", item.lump.name, extension);
            tree.add_file(root, &name, FileEntry::new(id as u32));
        }
        Ok(())
    }

    fn package_attributes(&self) -> Vec<Attribute> {
        vec![Attribute::unsigned("Version", 3u32)]
    }

    fn item_attributes(&self, _mapping: &Mapping, entry: &FileEntry) -> PakResult<Vec<Attribute>> {
        let item = record_for(&self.items, entry)?;
        let mut attributes = Vec::new();
        if let Some(layout) = &item.layout {
            attributes.push(Attribute::unsigned("Width", layout.width));
            attributes.push(Attribute::unsigned("Height", layout.height));
            attributes.push(Attribute::unsigned("Palette Entries", layout.palette_entries));
            attributes.push(Attribute::unsigned("Mipmaps", item.mipmaps));
        }
        attributes.push(Attribute::boolean("Compressed", item.lump.compression != 0));
        attributes.push(Attribute::hex("Type", item.lump.kind));
        Ok(attributes)
    }

    fn size(&self, _mapping: &Mapping, entry: &FileEntry) -> PakResult<u64> {
        let item = record_for(&self.items, entry)?;
        Ok(match &item.layout {
            Some(layout) => layout.bitmap_size(),
            None => u64::from(item.lump.length),
        })
    }

    fn size_on_disk(&self, _mapping: &Mapping, entry: &FileEntry) -> PakResult<u64> {
        Ok(u64::from(record_for(&self.items, entry)?.lump.disk_length))
    }

    fn create_stream<'a>(
        &'a self,
        mapping: &'a Mapping,
        entry: &FileEntry,
    ) -> PakResult<Stream<'a>> {
        let item = record_for(&self.items, entry)?;
        if item.lump.compression != 0 {
            return Err(ExtractionError::UnsupportedCompression(u32::from(item.lump.compression)).into());
        }
        let view = mapping.map(u64::from(item.lump.offset), u64::from(item.lump.disk_length))?;
        match &item.layout {
            Some(layout) => Ok(Stream::from_buffer(layout.to_bitmap(&view)?)),
            None => Ok(Stream::from_view(view)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::format::image::test_texture;
    use crate::package::{find_attribute, AttributeValue, Package, PackageType};

    /// (name, type, compression, contents)
    fn build(lumps: &[(&str, u8, u8, Vec<u8>)]) -> Vec<u8> {
        let mut data = Vec::new();
        let mut directory = Vec::new();
        for (name, kind, compression, contents) in lumps {
            let offset = HEADER_SIZE as u32 + data.len() as u32;
            data.extend_from_slice(contents);
            directory.extend_from_slice(&offset.to_le_bytes());
            directory.extend_from_slice(&(contents.len() as u32).to_le_bytes());
            directory.extend_from_slice(&(contents.len() as u32).to_le_bytes());
            directory.extend_from_slice(&[*kind, *compression, 0, 0]);
            let mut name_field = [0u8; 16];
            name_field[..name.len()].copy_from_slice(name.as_bytes());
            directory.extend_from_slice(&name_field);
        }
        let mut wad = Vec::new();
        wad.extend_from_slice(SIGNATURE);
        wad.extend_from_slice(&(lumps.len() as u32).to_le_bytes());
        wad.extend_from_slice(&(HEADER_SIZE as u32 + data.len() as u32).to_le_bytes());
        wad.extend_from_slice(&data);
        wad.extend_from_slice(&directory);
        wad
    }

    #[test]
    fn lumps() -> PakResult<()> {
        let gray = [[9, 9, 9]; 4];
        let mut picture = Vec::new();
        picture.extend_from_slice(&2u32.to_le_bytes());
        picture.extend_from_slice(&2u32.to_le_bytes());
        picture.extend_from_slice(&[0, 1, 2, 3]);
        picture.extend_from_slice(&1u16.to_le_bytes());
        picture.extend_from_slice(&[1, 2, 3]);

        let wad = build(&[
            ("brick", TYPE_MIP_TEXTURE, 0, test_texture("brick", 2, 2, &gray)),
            ("logo", TYPE_PICTURE, 0, picture),
            ("palette", 0x40, 0, vec![1, 2, 3]),
            ("squashed", TYPE_MIP_TEXTURE, 1, vec![0; 8]),
        ]);
        let mut package = Package::new(PackageType::Wad);
        package.open_bytes(wad)?;
        assert_eq!(package.tree()?.file_count(), 4);

        let brick = package.lookup("brick.bmp")?;
        assert_eq!(package.size(brick)?, 14 + 40 + 16 + 4);
        let attributes = package.item_attributes(brick)?;
        assert_eq!(
            find_attribute(&attributes, "Mipmaps"),
            Some(&AttributeValue::Unsigned {
                value: 1,
                hexadecimal: false
            })
        );

        let logo = package.lookup("logo.bmp")?;
        let bitmap = package.create_stream(logo)?.to_vec()?;
        assert_eq!(&bitmap[54..58], &[3, 2, 1, 0]);
        assert_eq!(&bitmap[58..], &[2, 3, 0, 1]);

        let raw = package.lookup("palette.lmp")?;
        assert_eq!(package.create_stream(raw)?.to_vec()?, vec![1, 2, 3]);

        let squashed = package.lookup("squashed.bmp")?;
        assert_eq!(package.size(squashed)?, 8);
        assert!(matches!(
            package.create_stream(squashed),
            Err(PakError::Extraction(ExtractionError::UnsupportedCompression(1)))
        ));
        Ok(())
    }

    #[test]
    fn wad2_is_not_wad3() {
        let mut wad = build(&[]);
        wad[3] = b'2';
        let mut package = Package::new(PackageType::Wad);
        assert!(matches!(
            package.open_bytes(wad),
            Err(PakError::Format(FormatError::InvalidSignature { .. }))
        ));
    }
}
