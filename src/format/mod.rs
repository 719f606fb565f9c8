//! The format decoders, and the trait they all implement.
//!
//! Each decoder turns a [`Mapping`] into owned header records when a package
//! opens ([`Format::map_data_structures()`]), builds the package's tree from
//! them ([`Format::create_root()`]), and then answers queries about the files
//! in that tree by the [`FileEntry`] each one was given.
//! Decoders hold no views between calls; dropping one is closing it.

use camino::Utf8Path;

use crate::mapping::Mapping;
use crate::package::{Attribute, PackageOptions, PackageType, Validation};
use crate::result::*;
use crate::stream::Stream;
use crate::tree::{DirectoryTree, FileEntry};

pub mod record;

pub mod image;
pub mod steam;

pub mod bsp;
pub mod gcf;
pub mod ncf;
pub mod pak;
pub mod sga;
pub mod vbsp;
pub mod vpk;
pub mod wad;
pub mod xzp;
pub mod zip;

/// What a decoder knows about where its package came from
#[derive(Debug, Clone, Copy)]
pub struct OpenContext<'a> {
    /// The package's path, if it was opened from a file.
    /// Some formats name things after it or find sibling files next to it.
    pub path: Option<&'a Utf8Path>,
    pub options: &'a PackageOptions,
}

impl OpenContext<'_> {
    /// The package's file name without its extension, if it has one.
    pub fn stem(&self) -> Option<&str> {
        self.path.and_then(Utf8Path::file_stem)
    }
}

/// The contract every format decoder implements
pub trait Format: Sized {
    /// Maps and decodes the package's headers, checking signatures, versions,
    /// and that each section fits where the headers say it is.
    fn map_data_structures(mapping: &Mapping, context: &OpenContext) -> PakResult<Self>;

    /// Adds every item in the package to `tree`.
    fn create_root(&self, mapping: &Mapping, tree: &mut DirectoryTree) -> PakResult<()>;

    fn package_attributes(&self) -> Vec<Attribute> {
        Vec::new()
    }

    fn item_attributes(&self, _mapping: &Mapping, _entry: &FileEntry) -> PakResult<Vec<Attribute>> {
        Ok(Vec::new())
    }

    /// The size of the item's contents, as its stream would produce them.
    fn size(&self, mapping: &Mapping, entry: &FileEntry) -> PakResult<u64>;

    /// How many bytes the item takes up in the package.
    fn size_on_disk(&self, mapping: &Mapping, entry: &FileEntry) -> PakResult<u64> {
        self.size(mapping, entry)
    }

    fn create_stream<'a>(&'a self, mapping: &'a Mapping, entry: &FileEntry)
        -> PakResult<Stream<'a>>;

    /// Checks the item against whatever checksum the format stores.
    fn validate(&self, _mapping: &Mapping, _entry: &FileEntry) -> PakResult<Validation> {
        Ok(Validation::AssumedOk)
    }

    /// Checks package-wide digests, for formats that have them.
    fn validate_package(&self, _mapping: &Mapping) -> PakResult<Validation> {
        Ok(Validation::AssumedOk)
    }
}

/// One decoder per package type
pub enum Decoder {
    Bsp(bsp::BspFile),
    Gcf(gcf::GcfFile),
    Ncf(ncf::NcfFile),
    Pak(pak::PakFile),
    Sga(sga::SgaFile),
    Vbsp(vbsp::VbspFile),
    Vpk(vpk::VpkFile),
    Wad(wad::WadFile),
    Xzp(xzp::XzpFile),
    Zip(zip::ZipFile),
}

macro_rules! dispatch {
    ($decoder:expr, $d:ident => $body:expr) => {
        match $decoder {
            Decoder::Bsp($d) => $body,
            Decoder::Gcf($d) => $body,
            Decoder::Ncf($d) => $body,
            Decoder::Pak($d) => $body,
            Decoder::Sga($d) => $body,
            Decoder::Vbsp($d) => $body,
            Decoder::Vpk($d) => $body,
            Decoder::Wad($d) => $body,
            Decoder::Xzp($d) => $body,
            Decoder::Zip($d) => $body,
        }
    };
}

impl Decoder {
    pub fn map_data_structures(
        package_type: PackageType,
        mapping: &Mapping,
        context: &OpenContext,
    ) -> PakResult<Self> {
        Ok(match package_type {
            PackageType::Bsp => Decoder::Bsp(Format::map_data_structures(mapping, context)?),
            PackageType::Gcf => Decoder::Gcf(Format::map_data_structures(mapping, context)?),
            PackageType::Ncf => Decoder::Ncf(Format::map_data_structures(mapping, context)?),
            PackageType::Pak => Decoder::Pak(Format::map_data_structures(mapping, context)?),
            PackageType::Sga => Decoder::Sga(Format::map_data_structures(mapping, context)?),
            PackageType::Vbsp => Decoder::Vbsp(Format::map_data_structures(mapping, context)?),
            PackageType::Vpk => Decoder::Vpk(Format::map_data_structures(mapping, context)?),
            PackageType::Wad => Decoder::Wad(Format::map_data_structures(mapping, context)?),
            PackageType::Xzp => Decoder::Xzp(Format::map_data_structures(mapping, context)?),
            PackageType::Zip => Decoder::Zip(Format::map_data_structures(mapping, context)?),
            PackageType::None => return Err(PakError::UnknownPackageType),
        })
    }

    pub fn create_root(&self, mapping: &Mapping, tree: &mut DirectoryTree) -> PakResult<()> {
        dispatch!(self, d => d.create_root(mapping, tree))
    }

    pub fn package_attributes(&self) -> Vec<Attribute> {
        dispatch!(self, d => d.package_attributes())
    }

    pub fn item_attributes(&self, mapping: &Mapping, entry: &FileEntry) -> PakResult<Vec<Attribute>> {
        dispatch!(self, d => d.item_attributes(mapping, entry))
    }

    pub fn size(&self, mapping: &Mapping, entry: &FileEntry) -> PakResult<u64> {
        dispatch!(self, d => d.size(mapping, entry))
    }

    pub fn size_on_disk(&self, mapping: &Mapping, entry: &FileEntry) -> PakResult<u64> {
        dispatch!(self, d => d.size_on_disk(mapping, entry))
    }

    pub fn create_stream<'a>(
        &'a self,
        mapping: &'a Mapping,
        entry: &FileEntry,
    ) -> PakResult<Stream<'a>> {
        dispatch!(self, d => d.create_stream(mapping, entry))
    }

    pub fn validate(&self, mapping: &Mapping, entry: &FileEntry) -> PakResult<Validation> {
        dispatch!(self, d => d.validate(mapping, entry))
    }

    pub fn validate_package(&self, mapping: &Mapping) -> PakResult<Validation> {
        dispatch!(self, d => d.validate_package(mapping))
    }
}

/// Looks up a decoder's record for the given entry,
/// failing if the tree handed us an ID we never gave out.
pub(crate) fn record_for<'r, T>(records: &'r [T], entry: &FileEntry) -> PakResult<&'r T> {
    records.get(entry.id as usize).ok_or_else(|| {
        malformed(format!(
            "Item ID {} is past the end of {} directory records",
            entry.id,
            records.len()
        ))
    })
}

/// Checksums everything a stream produces.
pub(crate) fn digest_stream<C: crate::checksum::Checksum>(
    stream: Stream,
    checksum: C,
) -> PakResult<C::Digest> {
    Ok(crate::checksum::digest_reader(stream, checksum)?)
}
