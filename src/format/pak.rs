//! Quake packages: a header pointing at an array of fixed-size records,
//! each a path, an offset, and a length.

use log::*;

use crate::format::record::*;
use crate::format::{record_for, Format, OpenContext};
use crate::mapping::Mapping;
use crate::result::*;
use crate::stream::Stream;
use crate::tree::{DirectoryTree, FileEntry};

const SIGNATURE: &[u8; 4] = b"PACK";
const HEADER_SIZE: usize = 12;
const RECORD_SIZE: u64 = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PakRecord {
    pub name: String,
    pub offset: u32,
    pub length: u32,
}

impl PakRecord {
    fn parse(mut record: &[u8]) -> Self {
        // name       56 bytes
        // offset      4 bytes
        // length      4 bytes
        let name = c_str(read_bytes(&mut record, 56)).into_owned();
        let offset = read_u32(&mut record);
        let length = read_u32(&mut record);
        Self {
            name,
            offset,
            length,
        }
    }
}

#[derive(Debug)]
pub struct PakFile {
    records: Vec<PakRecord>,
}

impl Format for PakFile {
    fn map_data_structures(mapping: &Mapping, _context: &OpenContext) -> PakResult<Self> {
        let header = mapping.map_record("PAK header", 0, HEADER_SIZE as u64)?;
        let mut fields = &header[..];
        let signature = read_array::<4>(&mut fields);
        if &signature != SIGNATURE {
            return Err(FormatError::InvalidSignature {
                format: "PAK",
                found: describe_signature(&signature),
            }
            .into());
        }
        let directory_offset = read_u32(&mut fields);
        let directory_length = read_u32(&mut fields);
        drop(header);

        if u64::from(directory_length) % RECORD_SIZE != 0 {
            warn!(
                "PAK directory length {} isn't a multiple of {}; ignoring the remainder",
                directory_length, RECORD_SIZE
            );
        }
        let count = u64::from(directory_length) / RECORD_SIZE;
        let directory = mapping.map_record(
            "PAK directory",
            u64::from(directory_offset),
            count * RECORD_SIZE,
        )?;

        let records: Vec<PakRecord> = directory
            .chunks_exact(RECORD_SIZE as usize)
            .map(PakRecord::parse)
            .collect();
        for record in &records {
            trace!("{:?}", record);
        }
        debug!("PAK directory has {} records", records.len());
        Ok(Self { records })
    }

    fn create_root(&self, _mapping: &Mapping, tree: &mut DirectoryTree) -> PakResult<()> {
        let root = tree.root();
        for (id, record) in self.records.iter().enumerate() {
            tree.add_path(root, &record.name, FileEntry::new(id as u32));
        }
        Ok(())
    }

    fn size(&self, _mapping: &Mapping, entry: &FileEntry) -> PakResult<u64> {
        Ok(u64::from(record_for(&self.records, entry)?.length))
    }

    fn create_stream<'a>(
        &'a self,
        mapping: &'a Mapping,
        entry: &FileEntry,
    ) -> PakResult<Stream<'a>> {
        let record = record_for(&self.records, entry)?;
        let view = mapping.map(u64::from(record.offset), u64::from(record.length))?;
        Ok(Stream::from_view(view))
    }
}

/// Builds a PAK from `(path, contents)` pairs, for tests.
#[cfg(test)]
pub(crate) fn build(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut data = Vec::new();
    let mut directory = Vec::new();
    for (path, contents) in files {
        let offset = HEADER_SIZE + data.len();
        data.extend_from_slice(contents);
        let mut name = [0u8; 56];
        name[..path.len()].copy_from_slice(path.as_bytes());
        directory.extend_from_slice(&name);
        directory.extend_from_slice(&(offset as u32).to_le_bytes());
        directory.extend_from_slice(&(contents.len() as u32).to_le_bytes());
    }
    let mut pak = Vec::new();
    pak.extend_from_slice(SIGNATURE);
    pak.extend_from_slice(&((HEADER_SIZE + data.len()) as u32).to_le_bytes());
    pak.extend_from_slice(&(directory.len() as u32).to_le_bytes());
    pak.extend_from_slice(&data);
    pak.extend_from_slice(&directory);
    pak
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::package::{Package, PackageType, Validation};

    #[test]
    fn two_records() -> PakResult<()> {
        let mut package = Package::new(PackageType::Pak);
        package.open_bytes(build(&[
            ("maps\\e1m1.bsp", b"first"),
            ("sound/misc/hit.wav", b"second!"),
        ]))?;

        let tree = package.tree()?;
        assert_eq!(tree.file_count(), 2);
        let map = package.lookup("maps/e1m1.bsp")?;
        assert_eq!(package.size(map)?, 5);
        assert_eq!(package.size_on_disk(map)?, 5);
        assert_eq!(package.create_stream(map)?.to_vec()?, b"first");

        let sound = package.lookup("sound")?;
        assert_eq!(package.size(sound)?, 7);
        assert_eq!(package.validate(sound)?, Validation::AssumedOk);
        Ok(())
    }

    #[test]
    fn wrong_signature() {
        let mut bytes = build(&[]);
        bytes[..4].copy_from_slice(b"KCAP");
        let mut package = Package::new(PackageType::Pak);
        assert!(matches!(
            package.open_bytes(bytes),
            Err(PakError::Format(FormatError::InvalidSignature { .. }))
        ));
    }

    #[test]
    fn directory_past_the_end() {
        let mut bytes = build(&[("a", b"a")]);
        let len = bytes.len();
        bytes.truncate(len - 1);
        let mut package = Package::new(PackageType::Pak);
        assert!(matches!(
            package.open_bytes(bytes),
            Err(PakError::Mapping(MappingError::TooSmall { .. }))
        ));
        assert!(!package.is_open());
    }
}
