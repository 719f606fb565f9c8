//! Error types and the related `Result<T>`
//!
//! Errors fall into three families, matching when they can happen:
//!
//! - [`MappingError`]: the source couldn't be read, or was too small for
//!   what we needed from it. Fatal to opening a package.
//! - [`FormatError`]: the bytes aren't the package type we were told they are,
//!   or its bookkeeping doesn't add up. Also fatal to opening a package.
//! - [`ExtractionError`]: one item can't be read out. The package stays open
//!   and every other item is still usable.

use camino::Utf8PathBuf;
use thiserror::Error;

pub type PakResult<T> = Result<T, PakError>;

#[derive(Debug, Error)]
pub enum PakError {
    /// An error from underlying I/O while reading a stream
    #[error("I/O Error")]
    Io(#[from] std::io::Error),

    /// The package's bytes couldn't be mapped
    #[error("Mapping error: {0}")]
    Mapping(#[from] MappingError),

    /// The package contained invalid data for its format
    #[error("Invalid package: {0}")]
    Format(#[from] FormatError),

    /// A single item couldn't be extracted
    #[error("Can't extract item: {0}")]
    Extraction(#[from] ExtractionError),

    /// The package hasn't been opened (or has been closed)
    #[error("Package isn't open")]
    NotOpen,

    /// A file operation was attempted on a folder
    #[error("Item is a folder, expected a file")]
    NotAFile,

    /// A file wasn't found at the provided path
    #[error("No item in the package with the path {0}")]
    NoSuchFile(Utf8PathBuf),

    /// An item ID that doesn't belong to the open package's tree
    #[error("No item {0} in the package")]
    NoSuchItem(crate::tree::ItemId),

    /// A user-provided path (not one from a package) was invalid.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// The first bytes of the source didn't match any package type we know.
    #[error("Unknown package type")]
    UnknownPackageType,

    /// A cast from a 64-bit int to a usize failed while mapping the file,
    /// probably on a 32-bit system.
    #[error("Package too large for address space")]
    InsufficientAddressSpace,
}

#[derive(Debug, Error)]
pub enum MappingError {
    /// The source couldn't be opened, sized, or read
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A view was requested past the end of the source
    #[error("Can't map {length} bytes at offset {offset} of a {size} byte source")]
    OutOfBounds { offset: u64, length: u64, size: u64 },

    /// The source is too small to hold a mandatory structure
    #[error("{what} needs {needed} bytes, but only {available} are available")]
    TooSmall {
        what: &'static str,
        needed: u64,
        available: u64,
    },
}

#[derive(Debug, Error)]
pub enum FormatError {
    /// Magic number mismatch
    #[error("Invalid {format} signature {found}")]
    InvalidSignature {
        format: &'static str,
        found: String,
    },

    /// A version outside the known-good set for the format
    #[error("Unsupported {format} version {version}")]
    UnsupportedVersion { format: &'static str, version: u32 },

    /// While scanning ZIP sections, a tag we don't know
    #[error("Unknown section signature {signature:#010x} at offset {offset}")]
    UnknownSection { offset: u64, signature: u32 },

    /// Sizes, counts, or offsets that don't add up
    #[error("{0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Compression method {0} not supported")]
    UnsupportedCompression(u32),

    #[error("Item resides on disk {disk}, but this is disk {this_disk}")]
    DiskSpanning { disk: u16, this_disk: u16 },

    /// The item's data offset doesn't point at its local header
    #[error("Invalid file data offset {offset}")]
    InvalidDataOffset { offset: u64 },

    #[error("Central directory entry doesn't match local file header")]
    LocalHeaderMismatch,

    #[error("Item is encrypted")]
    Encrypted,

    /// Some or all of the item's bytes aren't present
    #[error("Missing data: {0}")]
    MissingData(String),
}

impl PakError {
    /// True if this error only affects one item,
    /// and the package it came from is still usable.
    pub fn is_item_local(&self) -> bool {
        matches!(self, PakError::Extraction(_))
    }
}

/// Shorthand for the ubiquitous "this count/offset is nonsense" error.
pub(crate) fn malformed<S: Into<String>>(message: S) -> PakError {
    PakError::Format(FormatError::Malformed(message.into()))
}
