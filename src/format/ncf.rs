//! Steam non-cache files.
//!
//! An NCF is a GCF without the data: the same header, directory, and checksums,
//! but each item's contents live in an ordinary file under some root folder
//! (usually the game's install directory).

use camino::{Utf8Component, Utf8PathBuf};
use log::*;

use crate::format::steam::*;
use crate::format::{Format, OpenContext};
use crate::mapping::Mapping;
use crate::package::{Attribute, OpenMode, Validation};
use crate::result::*;
use crate::stream::Stream;
use crate::tree::{DirectoryTree, FileEntry};

#[derive(Debug)]
pub struct NcfFile {
    header: CacheHeader,
    directory: SteamDirectory,
    checksums: ChecksumTables,
    root_path: Option<Utf8PathBuf>,
    mode: OpenMode,
}

impl NcfFile {
    /// Where an item's contents should be on disk.
    fn item_path(&self, index: u32) -> PakResult<Utf8PathBuf> {
        let root = self.root_path.as_ref().ok_or_else(|| {
            ExtractionError::MissingData("no root path to find NCF items in".to_owned())
        })?;
        let relative = Utf8PathBuf::from(self.directory.path(index)?);
        // Names come from the package; they can't climb out of the root.
        if !relative
            .components()
            .all(|c| matches!(c, Utf8Component::Normal(_)))
        {
            return Err(ExtractionError::MissingData(format!(
                "{} isn't a path under the root",
                relative
            ))
            .into());
        }
        Ok(root.join(relative))
    }

    /// Maps an item's file, or explains why we couldn't.
    fn map_item(&self, index: u32) -> PakResult<Mapping> {
        let path = self.item_path(index)?;
        match Mapping::open(&path, self.mode) {
            Ok(m) => Ok(m),
            Err(e) => {
                debug!("Can't map {}: {}", path, e);
                Err(ExtractionError::MissingData(path.into_string()).into())
            }
        }
    }
}

impl Format for NcfFile {
    fn map_data_structures(mapping: &Mapping, context: &OpenContext) -> PakResult<Self> {
        let header = CacheHeader::parse(mapping, "NCF", 2)?;
        if header.minor_version != 1 {
            return Err(FormatError::UnsupportedVersion {
                format: "NCF",
                version: header.minor_version,
            }
            .into());
        }

        let (directory, offset) = SteamDirectory::parse(mapping, CACHE_HEADER_SIZE)?;
        // One u32 per item whose meaning nobody has worked out
        let (_unknown, offset) = parse_directory_map(mapping, offset, directory.len())?;
        let (checksums, _) = ChecksumTables::parse(mapping, offset)?;

        let root_path = context.options.root_path.clone();
        if root_path.is_none() {
            info!("No root path given; NCF items can be listed but not read");
        }
        Ok(Self {
            header,
            directory,
            checksums,
            root_path,
            mode: context.options.mode,
        })
    }

    fn create_root(&self, _mapping: &Mapping, tree: &mut DirectoryTree) -> PakResult<()> {
        self.directory.build_tree(tree)
    }

    fn package_attributes(&self) -> Vec<Attribute> {
        vec![
            Attribute::unsigned("Version", self.header.minor_version),
            Attribute::unsigned("Cache ID", self.header.cache_id),
            Attribute::unsigned("Last Version Played", self.header.last_version_played),
        ]
    }

    fn item_attributes(&self, _mapping: &Mapping, entry: &FileEntry) -> PakResult<Vec<Attribute>> {
        self.directory.item_attributes(entry.id)
    }

    fn size(&self, _mapping: &Mapping, entry: &FileEntry) -> PakResult<u64> {
        Ok(u64::from(self.directory.entry(entry.id)?.item_size))
    }

    fn size_on_disk(&self, _mapping: &Mapping, entry: &FileEntry) -> PakResult<u64> {
        let on_disk = self
            .item_path(entry.id)
            .ok()
            .and_then(|path| path.metadata().ok())
            .map_or(0, |m| m.len());
        Ok(on_disk)
    }

    fn create_stream<'a>(
        &'a self,
        _mapping: &'a Mapping,
        entry: &FileEntry,
    ) -> PakResult<Stream<'a>> {
        let item = self.directory.entry(entry.id)?;
        if item.is_encrypted() {
            return Err(ExtractionError::Encrypted.into());
        }
        let mapping = self.map_item(entry.id)?;
        if mapping.len() != u64::from(item.item_size) {
            warn!(
                "{} is {} bytes, but the NCF says it should be {}",
                self.directory.path(entry.id)?,
                mapping.len(),
                item.item_size
            );
        }
        Ok(Stream::from_mapping(mapping))
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
    use crate::format::steam::testing::*;

    /// Builds an NCF listing `items`.
    pub fn build(items: &[TestItem]) -> Vec<u8> {
        let mut file = header(2, 1, 0, 0);
        file.extend_from_slice(&directory(items));
        file.extend_from_slice(&directory_map(&vec![0; items.len() + 1]));
        file.extend_from_slice(&checksums(items));
        set_file_size(&mut file);
        file
    }
}

#[cfg(test)]
mod test {
    use super::testing::*;
    use super::*;
    use crate::format::steam::testing::TestItem;
    use crate::package::{Package, PackageOptions, PackageType};

    fn items() -> Vec<TestItem<'static>> {
        vec![
            TestItem {
                name: "cfg",
                parent: 0,
                contents: None,
            },
            TestItem {
                name: "config.cfg",
                parent: 1,
                contents: Some(b"bind w +forward"),
            },
            TestItem {
                name: "missing.txt",
                parent: 0,
                contents: Some(b"nowhere"),
            },
        ]
    }

    #[test]
    fn items_on_disk() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        std::fs::create_dir(root.path().join("cfg"))?;
        std::fs::write(root.path().join("cfg/config.cfg"), b"bind w +forward")?;
        let root_path = Utf8PathBuf::from_path_buf(root.path().to_owned())
            .map_err(|p| anyhow::anyhow!("Non-UTF-8 temp dir {}", p.display()))?;

        let mut package = Package::new(PackageType::Ncf);
        package.open_mapping(
            Mapping::from_bytes(build(&items())),
            PackageOptions {
                root_path: Some(root_path),
                ..Default::default()
            },
        )?;

        let config = package.lookup("cfg/config.cfg")?;
        assert_eq!(package.size(config)?, 15);
        assert_eq!(package.size_on_disk(config)?, 15);
        assert_eq!(package.create_stream(config)?.to_vec()?, b"bind w +forward");
        assert_eq!(package.validate(config)?, Validation::Ok);

        let missing = package.lookup("missing.txt")?;
        assert!(matches!(
            package.create_stream(missing),
            Err(PakError::Extraction(ExtractionError::MissingData(_)))
        ));
        assert_eq!(package.size_on_disk(missing)?, 0);
        assert_eq!(package.validate(missing)?, Validation::Corrupt);
        assert_eq!(package.validate(package.root()?)?, Validation::Corrupt);
        Ok(())
    }

    #[test]
    fn names_stay_under_the_root() -> anyhow::Result<()> {
        let outside = tempfile::tempdir()?;
        std::fs::write(outside.path().join("secret.txt"), b"keep out")?;
        std::fs::create_dir(outside.path().join("game"))?;
        let root_path = Utf8PathBuf::from_path_buf(outside.path().join("game"))
            .map_err(|p| anyhow::anyhow!("Non-UTF-8 temp dir {}", p.display()))?;

        let items = [
            TestItem {
                name: "..",
                parent: 0,
                contents: None,
            },
            TestItem {
                name: "secret.txt",
                parent: 1,
                contents: Some(b"keep out"),
            },
        ];
        let mut package = Package::new(PackageType::Ncf);
        package.open_mapping(
            Mapping::from_bytes(build(&items)),
            PackageOptions {
                root_path: Some(root_path),
                ..Default::default()
            },
        )?;

        let tree = package.tree()?;
        let secret = tree
            .files()
            .find(|f| f.name() == "secret.txt")
            .map(|f| f.id())
            .expect("secret.txt wasn't listed");
        assert!(matches!(
            package.create_stream(secret),
            Err(PakError::Extraction(ExtractionError::MissingData(_)))
        ));
        assert_eq!(package.size_on_disk(secret)?, 0);
        assert_eq!(package.validate(secret)?, Validation::Corrupt);
        Ok(())
    }

    #[test]
    fn no_root_path() -> PakResult<()> {
        let mut package = Package::new(PackageType::None);
        package.open_bytes(build(&items()))?;
        assert_eq!(package.package_type(), PackageType::Ncf);
        let config = package.lookup("cfg/config.cfg")?;
        assert!(matches!(
            package.create_stream(config),
            Err(PakError::Extraction(ExtractionError::MissingData(_)))
        ));
        Ok(())
    }
}
