//! Builders for small packages of each kind, written out byte by byte.

#![allow(dead_code)]

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// A Quake PAK with its directory right after the header.
/// `directory_padding` bytes of junk follow the last whole record.
pub fn pak(files: &[(&str, &[u8])], directory_padding: usize) -> Vec<u8> {
    let directory_length = files.len() * 64 + directory_padding;
    let mut directory = Vec::new();
    let mut data = Vec::new();
    for (name, contents) in files {
        let offset = 12 + directory_length + data.len();
        let mut name_field = [0u8; 56];
        name_field[..name.len()].copy_from_slice(name.as_bytes());
        directory.extend_from_slice(&name_field);
        put_u32(&mut directory, offset as u32);
        put_u32(&mut directory, contents.len() as u32);
        data.extend_from_slice(contents);
    }
    directory.resize(directory_length, 0xcc);

    let mut pak = b"PACK".to_vec();
    put_u32(&mut pak, 12);
    put_u32(&mut pak, directory_length as u32);
    pak.extend_from_slice(&directory);
    pak.extend_from_slice(&data);
    pak
}

pub struct ZipEntry<'a> {
    pub path: &'a str,
    pub contents: &'a [u8],
    /// Written as-is, whatever the contents really are
    pub method: u16,
    /// Defaults to the contents' real CRC
    pub crc: Option<u32>,
}

impl<'a> ZipEntry<'a> {
    pub fn stored(path: &'a str, contents: &'a [u8]) -> Self {
        Self {
            path,
            contents,
            method: 0,
            crc: None,
        }
    }
}

pub const ZIP_LOCAL_HEADER_SIZE: usize = 30;

pub fn zip(entries: &[ZipEntry]) -> Vec<u8> {
    let mut zip = Vec::new();
    let mut directory = Vec::new();
    for entry in entries {
        let crc = entry.crc.unwrap_or_else(|| crc32fast::hash(entry.contents));
        let offset = zip.len() as u32;
        let size = entry.contents.len() as u32;

        let mut common = Vec::new();
        put_u16(&mut common, 0); // flags
        put_u16(&mut common, entry.method);
        put_u16(&mut common, 0x6000); // 12:00
        put_u16(&mut common, 0x5021); // 2020-01-01
        put_u32(&mut common, crc);
        put_u32(&mut common, size);
        put_u32(&mut common, size);
        put_u16(&mut common, entry.path.len() as u16);
        put_u16(&mut common, 0); // extra field

        put_u32(&mut zip, 0x04034b50);
        put_u16(&mut zip, 20);
        zip.extend_from_slice(&common);
        zip.extend_from_slice(entry.path.as_bytes());
        zip.extend_from_slice(entry.contents);

        put_u32(&mut directory, 0x02014b50);
        put_u16(&mut directory, 20);
        put_u16(&mut directory, 20);
        directory.extend_from_slice(&common);
        put_u16(&mut directory, 0); // comment
        put_u16(&mut directory, 0); // disk
        put_u16(&mut directory, 0);
        put_u32(&mut directory, 0);
        put_u32(&mut directory, offset);
        directory.extend_from_slice(entry.path.as_bytes());
    }
    let directory_offset = zip.len() as u32;
    zip.extend_from_slice(&directory);
    put_u32(&mut zip, 0x06054b50);
    put_u16(&mut zip, 0);
    put_u16(&mut zip, 0);
    put_u16(&mut zip, entries.len() as u16);
    put_u16(&mut zip, entries.len() as u16);
    put_u32(&mut zip, directory.len() as u32);
    put_u32(&mut zip, directory_offset);
    put_u16(&mut zip, 0);
    zip
}

/// A mip texture record with all four mip levels.
/// Mip 0's pixels are their row number; the palette is a gray ramp.
pub fn mip_texture(name: &str, width: u32, height: u32) -> Vec<u8> {
    let mut texture = Vec::new();
    let mut name_field = [0u8; 16];
    name_field[..name.len()].copy_from_slice(name.as_bytes());
    texture.extend_from_slice(&name_field);
    put_u32(&mut texture, width);
    put_u32(&mut texture, height);

    let mut offset = 40;
    for level in 0..4 {
        put_u32(&mut texture, offset);
        offset += (width >> level) * (height >> level);
    }
    for y in 0..height {
        for _ in 0..width {
            texture.push(y as u8);
        }
    }
    for level in 1..4 {
        let pixels = (width >> level) * (height >> level);
        texture.extend(std::iter::repeat(0).take(pixels as usize));
    }
    put_u16(&mut texture, 256);
    for i in 0..=255u8 {
        texture.extend_from_slice(&[i, i, i]);
    }
    // Padding some tools write after the palette
    texture.extend_from_slice(&[0, 0]);
    texture
}

/// A GoldSrc (version 30) map with the given entities and textures.
pub fn bsp(entities: &[u8], textures: &[Vec<u8>]) -> Vec<u8> {
    let header_size = 4 + 15 * 8;
    let mut lump = Vec::new();
    put_u32(&mut lump, textures.len() as u32);
    let mut offset = 4 + 4 * textures.len();
    for texture in textures {
        put_u32(&mut lump, offset as u32);
        offset += texture.len();
    }
    for texture in textures {
        lump.extend_from_slice(texture);
    }

    let entities_offset = header_size as u32;
    let textures_offset = entities_offset + entities.len() as u32;
    let mut bsp = Vec::new();
    put_u32(&mut bsp, 30);
    for i in 0..15 {
        let (offset, length) = match i {
            0 => (entities_offset, entities.len() as u32),
            2 => (textures_offset, lump.len() as u32),
            _ => (0, 0),
        };
        put_u32(&mut bsp, offset);
        put_u32(&mut bsp, length);
    }
    bsp.extend_from_slice(entities);
    bsp.extend_from_slice(&lump);
    bsp
}
