//! Paletted images (BSP and WAD textures, pictures, and fonts),
//! and the bitmap files we turn them into.
//!
//! GoldSrc images are 8-bit pixel indices followed by a u16 palette size and
//! that many RGB triplets. Nothing reads that, so we present each one as a
//! Windows bitmap instead: a file header, an info header, a BGR0 palette,
//! and the pixel rows bottom-up.

use crate::arch::usize;
use crate::format::record::*;
use crate::result::*;

const FILE_HEADER_SIZE: u64 = 14;
const INFO_HEADER_SIZE: u64 = 40;

/// Mip texture header: name, width, height, and four mip level offsets
pub const MIPTEX_HEADER_SIZE: usize = 16 + 4 + 4 + 4 * 4;

/// Font header: width, height, row count, row height, and 256 (offset, width) pairs
const FONT_HEADER_SIZE: usize = 4 * 4 + 256 * 4;

/// A mip texture's header, as found in BSP texture lumps and WAD files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MipTexture {
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Offset of each mip level from the start of the header
    pub offsets: [u32; 4],
}

impl MipTexture {
    pub fn parse(mut bytes: &[u8]) -> PakResult<Self> {
        check_len(bytes, MIPTEX_HEADER_SIZE, "mip texture header")?;
        let name = c_str(read_bytes(&mut bytes, 16)).into_owned();
        let width = read_u32(&mut bytes);
        let height = read_u32(&mut bytes);
        let mut offsets = [0u32; 4];
        for offset in &mut offsets {
            *offset = read_u32(&mut bytes);
        }
        Ok(Self {
            name,
            width,
            height,
            offsets,
        })
    }

    /// Textures whose pixels live in a separate WAD store no mip levels.
    pub fn is_external(&self) -> bool {
        self.offsets[0] == 0
    }

    /// Where the palette size lives, relative to the header.
    ///
    /// GoldSrc tools write all four mip levels, each a quarter the size of the last,
    /// and the palette follows mip 3. We don't decode the smaller levels,
    /// but their sizes still decide where the palette is.
    /// Textures that only store mip 0 (the rest of the offsets are zero)
    /// put the palette straight after its pixels.
    fn palette_offset(&self) -> u64 {
        let (w, h) = (u64::from(self.width), u64::from(self.height));
        if self.offsets[3] != 0 {
            u64::from(self.offsets[3]) + (w / 8) * (h / 8)
        } else {
            u64::from(self.offsets[0]) + w * h
        }
    }

    /// Finds the image within `texture`, which starts at this header.
    pub fn layout(&self, texture: &[u8]) -> PakResult<ImageLayout> {
        ImageLayout::locate(
            texture,
            self.width,
            self.height,
            u64::from(self.offsets[0]),
            self.palette_offset(),
        )
    }
}

/// Where a paletted image's pieces are, relative to the start of some record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLayout {
    pub width: u32,
    pub height: u32,
    pub pixel_offset: u64,
    pub palette_entries: u16,
    /// Offset of the first RGB triplet (just past the palette size)
    pub palette_offset: u64,
}

impl ImageLayout {
    /// Reads the palette size at `palette_size_offset` and checks that the pixels
    /// and palette all fit in `record`.
    fn locate(
        record: &[u8],
        width: u32,
        height: u32,
        pixel_offset: u64,
        palette_size_offset: u64,
    ) -> PakResult<Self> {
        let palette_entries = u16_at(record, usize(palette_size_offset)?).ok_or_else(|| {
            malformed(format!(
                "Palette size at {} is past the end of a {}-byte image record",
                palette_size_offset,
                record.len()
            ))
        })?;
        let layout = Self {
            width,
            height,
            pixel_offset,
            palette_entries,
            palette_offset: palette_size_offset + 2,
        };

        let pixels_end = pixel_offset + layout.pixel_count();
        let palette_end = layout.palette_offset + u64::from(palette_entries) * 3;
        if pixels_end > record.len() as u64 || palette_end > record.len() as u64 {
            return Err(malformed(format!(
                "{}x{} image with {} palette entries doesn't fit in its {}-byte record",
                width,
                height,
                palette_entries,
                record.len()
            )));
        }
        Ok(layout)
    }

    fn pixel_count(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// The size of the bitmap file [`ImageLayout::to_bitmap()`] produces.
    pub fn bitmap_size(&self) -> u64 {
        FILE_HEADER_SIZE
            + INFO_HEADER_SIZE
            + u64::from(self.palette_entries) * 4
            + self.pixel_count()
    }

    /// Builds a bitmap file from the image in `record`.
    pub fn to_bitmap(&self, record: &[u8]) -> PakResult<Vec<u8>> {
        let palette_size = u32::from(self.palette_entries) * 4;
        let pixel_count = self.pixel_count();
        let image_size = u32::try_from(pixel_count)
            .map_err(|_| malformed(format!("{}x{} image is too large", self.width, self.height)))?;
        let data_offset = (FILE_HEADER_SIZE + INFO_HEADER_SIZE) as u32 + palette_size;

        let mut bitmap = Vec::with_capacity(usize(self.bitmap_size())?);

        // BITMAPFILEHEADER
        bitmap.extend_from_slice(b"BM");
        bitmap.extend_from_slice(&(data_offset + image_size).to_le_bytes());
        bitmap.extend_from_slice(&[0; 4]);
        bitmap.extend_from_slice(&data_offset.to_le_bytes());

        // BITMAPINFOHEADER
        bitmap.extend_from_slice(&(INFO_HEADER_SIZE as u32).to_le_bytes());
        bitmap.extend_from_slice(&self.width.to_le_bytes());
        bitmap.extend_from_slice(&self.height.to_le_bytes());
        bitmap.extend_from_slice(&1u16.to_le_bytes()); // planes
        bitmap.extend_from_slice(&8u16.to_le_bytes()); // bits per pixel
        bitmap.extend_from_slice(&0u32.to_le_bytes()); // uncompressed
        bitmap.extend_from_slice(&image_size.to_le_bytes());
        bitmap.extend_from_slice(&[0; 8]); // pixels per meter
        bitmap.extend_from_slice(&u32::from(self.palette_entries).to_le_bytes());
        bitmap.extend_from_slice(&0u32.to_le_bytes());

        let palette_start = usize(self.palette_offset)?;
        let palette_end = palette_start + usize::from(self.palette_entries) * 3;
        for rgb in record[palette_start..palette_end].chunks_exact(3) {
            bitmap.extend_from_slice(&[rgb[2], rgb[1], rgb[0], 0]);
        }

        let pixel_start = usize(self.pixel_offset)?;
        let pixels = &record[pixel_start..pixel_start + usize(pixel_count)?];
        let width = usize(self.width)?;
        if width > 0 {
            for row in pixels.chunks_exact(width).rev() {
                bitmap.extend_from_slice(row);
            }
        }

        debug_assert_eq!(bitmap.len() as u64, self.bitmap_size());
        Ok(bitmap)
    }
}

/// Finds the image in a WAD picture lump (width, height, pixels, palette).
pub fn picture_layout(lump: &[u8]) -> PakResult<ImageLayout> {
    check_len(lump, 8, "picture header")?;
    let mut header = lump;
    let width = read_u32(&mut header);
    let height = read_u32(&mut header);
    let pixels = u64::from(width) * u64::from(height);
    ImageLayout::locate(lump, width, height, 8, 8 + pixels)
}

/// Finds the image in a WAD font lump.
pub fn font_layout(lump: &[u8]) -> PakResult<ImageLayout> {
    check_len(lump, FONT_HEADER_SIZE, "font header")?;
    let mut header = lump;
    let width = read_u32(&mut header);
    let height = read_u32(&mut header);
    let pixels = u64::from(width) * u64::from(height);
    let start = FONT_HEADER_SIZE as u64;
    ImageLayout::locate(lump, width, height, start, start + pixels)
}

/// Builds a mip texture record for tests: header, mip 0 pixels, palette.
#[cfg(test)]
pub(crate) fn test_texture(name: &str, width: u32, height: u32, palette: &[[u8; 3]]) -> Vec<u8> {
    let mut texture = Vec::new();
    let mut name_field = [0u8; 16];
    name_field[..name.len()].copy_from_slice(name.as_bytes());
    texture.extend_from_slice(&name_field);
    texture.extend_from_slice(&width.to_le_bytes());
    texture.extend_from_slice(&height.to_le_bytes());
    texture.extend_from_slice(&(MIPTEX_HEADER_SIZE as u32).to_le_bytes());
    texture.extend_from_slice(&[0; 12]);
    for i in 0..width * height {
        texture.push(i as u8);
    }
    texture.extend_from_slice(&(palette.len() as u16).to_le_bytes());
    for rgb in palette {
        texture.extend_from_slice(rgb);
    }
    texture
}
