//! Steam game cache files.
//!
//! A GCF's data lives in fixed-size blocks after all of its tables.
//! Each file is a chain of block entries, each of which covers some run of the
//! file's data and names the first data block holding it.
//! The fragmentation map then links each data block to the next.
//!
//! ```text
//! header
//! block entry header, block entries
//! fragmentation map header, fragmentation map
//! block entry map header, block entry map     (minor version < 6)
//! directory
//! directory map                               (minor version >= 5)
//! checksums
//! data block header
//! data blocks
//! ```

use std::cmp;

use log::*;

use crate::format::record::*;
use crate::format::steam::*;
use crate::format::{Format, OpenContext};
use crate::mapping::Mapping;
use crate::package::{Attribute, Validation};
use crate::result::*;
use crate::stream::{Segment, Stream};
use crate::tree::{DirectoryTree, FileEntry};

const BLOCK_ENTRY_HEADER_SIZE: u64 = 32;
const BLOCK_ENTRY_SIZE: u64 = 28;
const FRAGMENTATION_MAP_HEADER_SIZE: u64 = 16;
const BLOCK_ENTRY_MAP_HEADER_SIZE: u64 = 20;
const BLOCK_ENTRY_MAP_ENTRY_SIZE: u64 = 8;

const SUPPORTED_VERSIONS: &[u32] = &[3, 5, 6];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEntry {
    pub entry_flags: u32,
    pub file_data_offset: u32,
    pub file_data_size: u32,
    pub first_data_block_index: u32,
    pub next_block_entry_index: u32,
    pub previous_block_entry_index: u32,
    pub directory_index: u32,
}

impl BlockEntry {
    fn parse(mut entry: &[u8]) -> Self {
        Self {
            entry_flags: read_u32(&mut entry),
            file_data_offset: read_u32(&mut entry),
            file_data_size: read_u32(&mut entry),
            first_data_block_index: read_u32(&mut entry),
            next_block_entry_index: read_u32(&mut entry),
            previous_block_entry_index: read_u32(&mut entry),
            directory_index: read_u32(&mut entry),
        }
    }

    fn is_used(&self) -> bool {
        self.entry_flags != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DataBlockHeader {
    last_version_played: Option<u32>,
    block_count: u32,
    block_size: u32,
    first_block_offset: u32,
    blocks_used: u32,
}

impl DataBlockHeader {
    fn size_in_file(minor_version: u32) -> u64 {
        if minor_version < 5 {
            20
        } else {
            24
        }
    }

    fn parse(mut header: &[u8], minor_version: u32) -> Self {
        let last_version_played = if minor_version < 5 {
            None
        } else {
            Some(read_u32(&mut header))
        };
        let block_count = read_u32(&mut header);
        let block_size = read_u32(&mut header);
        let first_block_offset = read_u32(&mut header);
        let blocks_used = read_u32(&mut header);
        Self {
            last_version_played,
            block_count,
            block_size,
            first_block_offset,
            blocks_used,
        }
    }
}

/// A run of an item's data: `length` bytes at the start of data block `block`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockRun {
    block: u32,
    length: u64,
}

#[derive(Debug)]
pub struct GcfFile {
    header: CacheHeader,
    blocks_used: u32,
    block_entries: Vec<BlockEntry>,
    fragmentation_map: Vec<u32>,
    /// Marks the end of a chain in the fragmentation map
    terminator: u32,
    directory: SteamDirectory,
    /// First block entry of each directory item
    directory_map: Vec<u32>,
    checksums: ChecksumTables,
    data: DataBlockHeader,
}

impl GcfFile {
    /// Reads the block entries and fragmentation map that start at `offset`.
    fn parse_blocks(
        mapping: &Mapping,
        offset: u64,
    ) -> PakResult<(u32, Vec<BlockEntry>, Vec<u32>, u32, u64)> {
        let header = mapping.map_record("block entry header", offset, BLOCK_ENTRY_HEADER_SIZE)?;
        let mut fields = &header[..];
        let block_count = read_u32(&mut fields);
        let blocks_used = read_u32(&mut fields);
        drop(header);
        let offset = offset + BLOCK_ENTRY_HEADER_SIZE;

        let length = u64::from(block_count) * BLOCK_ENTRY_SIZE;
        let entries = mapping.map_record("block entries", offset, length)?;
        let block_entries: Vec<BlockEntry> = entries
            .chunks_exact(BLOCK_ENTRY_SIZE as usize)
            .map(BlockEntry::parse)
            .collect();
        drop(entries);
        let offset = offset + length;

        let header =
            mapping.map_record("fragmentation map header", offset, FRAGMENTATION_MAP_HEADER_SIZE)?;
        let mut fields = &header[..];
        let data_block_count = read_u32(&mut fields);
        let _first_unused_entry = read_u32(&mut fields);
        let terminator = if read_u32(&mut fields) == 0 {
            0xffff
        } else {
            0xffff_ffff
        };
        drop(header);
        let offset = offset + FRAGMENTATION_MAP_HEADER_SIZE;

        let length = u64::from(data_block_count) * 4;
        let map = mapping.map_record("fragmentation map", offset, length)?;
        let fragmentation_map = map.chunks_exact(4).map(|mut n| read_u32(&mut n)).collect();

        Ok((blocks_used, block_entries, fragmentation_map, terminator, offset + length))
    }

    /// Reads the block entry map (a linked list through all block entries)
    /// that older versions have, returning block entry indices in list order.
    fn parse_block_entry_map(mapping: &Mapping, offset: u64) -> PakResult<(Vec<u32>, u64)> {
        let header = mapping.map_record("block entry map header", offset, BLOCK_ENTRY_MAP_HEADER_SIZE)?;
        let mut fields = &header[..];
        let block_count = read_u32(&mut fields);
        let first = read_u32(&mut fields);
        drop(header);
        let offset = offset + BLOCK_ENTRY_MAP_HEADER_SIZE;

        let length = u64::from(block_count) * BLOCK_ENTRY_MAP_ENTRY_SIZE;
        let map = mapping.map_record("block entry map", offset, length)?;
        let next: Vec<u32> = map
            .chunks_exact(BLOCK_ENTRY_MAP_ENTRY_SIZE as usize)
            .map(|mut e| {
                let _previous = read_u32(&mut e);
                read_u32(&mut e)
            })
            .collect();

        let mut order = Vec::with_capacity(next.len());
        let mut at = first;
        while (at as usize) < next.len() && order.len() < next.len() {
            order.push(at);
            at = next[at as usize];
        }
        Ok((order, offset + length))
    }

    /// Older versions don't store each item's first block entry;
    /// it's the first used block entry for that item in block entry map order.
    fn rebuild_directory_map(block_entries: &[BlockEntry], order: &[u32], item_count: usize) -> Vec<u32> {
        let none = block_entries.len() as u32;
        let mut map = vec![none; item_count];
        for &b in order {
            let entry = match block_entries.get(b as usize) {
                Some(e) if e.is_used() => e,
                _ => continue,
            };
            if let Some(first) = map.get_mut(entry.directory_index as usize) {
                if *first == none {
                    *first = b;
                }
            }
        }
        map
    }

    /// Follows an item's block entries and data blocks.
    fn runs(&self, index: u32) -> PakResult<Vec<BlockRun>> {
        let item = self.directory.entry(index)?;
        let block_size = u64::from(self.data.block_size);
        let mut remaining = u64::from(item.item_size);
        let mut runs = Vec::new();

        let mut block_entry = self.directory_map.get(index as usize).copied().unwrap_or(u32::MAX);
        let mut entries_seen = 0;
        while remaining > 0 && (block_entry as usize) < self.block_entries.len() {
            entries_seen += 1;
            if entries_seen > self.block_entries.len() {
                return Err(malformed(format!("Block entries for item {} loop", index)));
            }
            let entry = &self.block_entries[block_entry as usize];
            let mut entry_remaining = cmp::min(u64::from(entry.file_data_size), remaining);
            let mut block = entry.first_data_block_index;
            while entry_remaining > 0
                && block != self.terminator
                && (block as usize) < self.fragmentation_map.len()
            {
                if runs.len() > self.fragmentation_map.len() {
                    return Err(malformed(format!("Data blocks for item {} loop", index)));
                }
                let length = cmp::min(block_size, entry_remaining);
                runs.push(BlockRun { block, length });
                entry_remaining -= length;
                remaining -= length;
                block = self.fragmentation_map[block as usize];
            }
            block_entry = entry.next_block_entry_index;
        }
        if remaining > 0 {
            debug!("Item {} is missing its last {} bytes", index, remaining);
        }
        Ok(runs)
    }

    fn block_offset(&self, block: u32) -> u64 {
        u64::from(self.data.first_block_offset) + u64::from(block) * u64::from(self.data.block_size)
    }

    /// How scattered an item's data blocks are, as a percentage of block transitions
    /// that aren't to the next block over
    fn fragmentation(runs: &[BlockRun]) -> f32 {
        if runs.len() < 2 {
            return 0.0;
        }
        let fragmented = runs
            .windows(2)
            .filter(|pair| pair[1].block != pair[0].block.wrapping_add(1))
            .count();
        fragmented as f32 / (runs.len() - 1) as f32 * 100.0
    }
}

impl Format for GcfFile {
    fn map_data_structures(mapping: &Mapping, _context: &OpenContext) -> PakResult<Self> {
        let header = CacheHeader::parse(mapping, "GCF", 1)?;
        if !SUPPORTED_VERSIONS.contains(&header.minor_version) {
            return Err(FormatError::UnsupportedVersion {
                format: "GCF",
                version: header.minor_version,
            }
            .into());
        }
        let minor = header.minor_version;

        let (blocks_used, block_entries, fragmentation_map, terminator, offset) =
            Self::parse_blocks(mapping, CACHE_HEADER_SIZE)?;

        let (block_entry_order, offset) = if minor < 6 {
            let (order, offset) = Self::parse_block_entry_map(mapping, offset)?;
            (Some(order), offset)
        } else {
            (None, offset)
        };

        let (directory, offset) = SteamDirectory::parse(mapping, offset)?;

        let (directory_map, offset) = if minor >= 5 {
            parse_directory_map(mapping, offset, directory.len())?
        } else {
            let order = block_entry_order.unwrap_or_default();
            let map = Self::rebuild_directory_map(&block_entries, &order, directory.len());
            (map, offset)
        };

        let (checksums, offset) = ChecksumTables::parse(mapping, offset)?;

        let data_header_size = DataBlockHeader::size_in_file(minor);
        let data = {
            let header = mapping.map_record("data block header", offset, data_header_size)?;
            DataBlockHeader::parse(&header, minor)
        };
        trace!("{:?}", data);

        if data.block_count as usize != fragmentation_map.len() {
            return Err(malformed(format!(
                "Data block header counts {} blocks, but the fragmentation map has {}",
                data.block_count,
                fragmentation_map.len()
            )));
        }
        let data_end = u64::from(data.first_block_offset)
            + u64::from(data.block_count) * u64::from(data.block_size);
        if data_end > mapping.len() {
            return Err(MappingError::TooSmall {
                what: "GCF data blocks",
                needed: data_end,
                available: mapping.len(),
            }
            .into());
        }

        debug!(
            "GCF 1.{} with {} block entries and {} data blocks of {} bytes",
            minor,
            block_entries.len(),
            data.block_count,
            data.block_size
        );
        Ok(Self {
            header,
            blocks_used,
            block_entries,
            fragmentation_map,
            terminator,
            directory,
            directory_map,
            checksums,
            data,
        })
    }

    fn create_root(&self, _mapping: &Mapping, tree: &mut DirectoryTree) -> PakResult<()> {
        self.directory.build_tree(tree)
    }

    fn package_attributes(&self) -> Vec<Attribute> {
        let mut attributes = vec![
            Attribute::unsigned("Version", self.header.minor_version),
            Attribute::unsigned("Cache ID", self.header.cache_id),
            Attribute::unsigned("Allocated Blocks", self.data.block_count),
            Attribute::unsigned("Used Blocks", self.data.blocks_used),
            Attribute::unsigned("Block Length", self.data.block_size),
        ];
        let last_version_played = self
            .data
            .last_version_played
            .unwrap_or(self.header.last_version_played);
        attributes.push(Attribute::unsigned("Last Version Played", last_version_played));
        if self.blocks_used != self.data.blocks_used {
            debug!(
                "Block entry header says {} blocks are used; data block header says {}",
                self.blocks_used, self.data.blocks_used
            );
        }
        attributes
    }

    fn item_attributes(&self, _mapping: &Mapping, entry: &FileEntry) -> PakResult<Vec<Attribute>> {
        let mut attributes = self.directory.item_attributes(entry.id)?;
        let runs = self.runs(entry.id)?;
        attributes.push(Attribute::float("Fragmentation", Self::fragmentation(&runs)));
        Ok(attributes)
    }

    fn size(&self, _mapping: &Mapping, entry: &FileEntry) -> PakResult<u64> {
        Ok(u64::from(self.directory.entry(entry.id)?.item_size))
    }

    fn size_on_disk(&self, _mapping: &Mapping, entry: &FileEntry) -> PakResult<u64> {
        Ok(self.runs(entry.id)?.len() as u64 * u64::from(self.data.block_size))
    }

    fn create_stream<'a>(
        &'a self,
        mapping: &'a Mapping,
        entry: &FileEntry,
    ) -> PakResult<Stream<'a>> {
        let item = self.directory.entry(entry.id)?;
        if item.is_encrypted() {
            return Err(ExtractionError::Encrypted.into());
        }
        let runs = self.runs(entry.id)?;
        let found: u64 = runs.iter().map(|r| r.length).sum();
        if found < u64::from(item.item_size) {
            return Err(ExtractionError::MissingData(format!(
                "only {} of {} bytes are in data blocks",
                found, item.item_size
            ))
            .into());
        }
        let segments = runs
            .iter()
            .map(|run| -> PakResult<Segment<'a>> {
                Ok(Segment::Mapped(
                    mapping.map(self.block_offset(run.block), run.length)?,
                ))
            })
            .collect::<PakResult<Vec<_>>>()?;
        Ok(Stream::from_segments(segments))
    }

    fn validate(&self, mapping: &Mapping, entry: &FileEntry) -> PakResult<Validation> {
        let item = self.directory.entry(entry.id)?;
        if item.is_encrypted() || item.checksum_index == NO_INDEX {
            return Ok(Validation::AssumedOk);
        }
        let stream = match self.create_stream(mapping, entry) {
            Ok(s) => s,
            Err(PakError::Extraction(e)) => {
                debug!("Can't read item {}: {}", entry.id, e);
                return Ok(Validation::Corrupt);
            }
            Err(e) => return Err(e),
        };
        self.checksums
            .validate(item.checksum_index, stream, u64::from(item.item_size))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::format::steam::testing::*;

    pub const BLOCK_SIZE: u32 = 8;

    /// Builds a minor version 6 GCF with `items`, one block entry per non-empty file.
    pub fn build(items: &[TestItem]) -> Vec<u8> {
        let mut blocks: Vec<Vec<u8>> = Vec::new();
        // (directory index, size, blocks in file order)
        let mut files = Vec::new();
        for (i, item) in items.iter().enumerate() {
            let contents = match item.contents {
                Some(c) if !c.is_empty() => c,
                _ => continue,
            };
            let mut chain = Vec::new();
            for chunk in contents.chunks(BLOCK_SIZE as usize) {
                let mut block = chunk.to_vec();
                block.resize(BLOCK_SIZE as usize, 0);
                chain.push(blocks.len());
                blocks.push(block);
            }
            files.push((i as u32 + 1, contents.len() as u32, chain));
        }

        // Blocks are written in reverse, so every multi-block file is fragmented.
        let block_count = blocks.len() as u32;
        let position = |b: usize| block_count - 1 - b as u32;
        let mut fragmentation_map = vec![0xffffu32; blocks.len()];
        for (_, _, chain) in &files {
            for pair in chain.windows(2) {
                fragmentation_map[position(pair[0]) as usize] = position(pair[1]);
            }
        }

        let entry_count = files.len() as u32;
        let mut file = header(1, 6, BLOCK_SIZE, block_count);
        for v in [entry_count, entry_count, 0, 0, 0, 0, 0, 0] {
            file.extend_from_slice(&v.to_le_bytes());
        }
        for (directory_index, size, chain) in &files {
            let first = position(chain[0]);
            for v in [0x8000, 0, *size, first, entry_count, entry_count, *directory_index] {
                file.extend_from_slice(&v.to_le_bytes());
            }
        }
        // A zero terminator field means chains end with 0xffff.
        for v in [block_count, 0, 0, 0] {
            file.extend_from_slice(&v.to_le_bytes());
        }
        for v in &fragmentation_map {
            file.extend_from_slice(&v.to_le_bytes());
        }
        file.extend_from_slice(&directory(items));

        let mut map = vec![entry_count; items.len() + 1];
        for (e, (directory_index, _, _)) in files.iter().enumerate() {
            map[*directory_index as usize] = e as u32;
        }
        file.extend_from_slice(&directory_map(&map));
        file.extend_from_slice(&checksums(items));

        let first_block_offset = file.len() as u32 + 24;
        for v in [7, block_count, BLOCK_SIZE, first_block_offset, block_count, 0] {
            file.extend_from_slice(&v.to_le_bytes());
        }
        for block in blocks.iter().rev() {
            file.extend_from_slice(block);
        }
        set_file_size(&mut file);
        file
    }
}
