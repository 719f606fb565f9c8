//! pakfs reads the containers games ship their data in
//! (Half-Life and Source maps, Steam caches, Quake PAKs, Relic SGAs, VPKs,
//! WADs, XZPs, and plain old Zip archives) and presents each one the same way:
//! a tree of folders and files you can list, inspect, read, and validate.
//!
//! ```no_run
//! # use std::fs::{self, File};
//! # use std::io;
//! # use pakfs::*;
//! let package = Package::open_path("half-life.gcf", OpenMode::READ)?;
//! let tree = package.tree()?;
//!
//! // Look up a file by its path...
//! let liblist = package.lookup("valve/liblist.gam")?;
//! println!("{} bytes", package.size(liblist)?);
//! for attribute in package.item_attributes(liblist)? {
//!     println!("{}", attribute);
//! }
//!
//! // ...or walk the whole thing and copy it out.
//! for file in tree.files() {
//!     let path = tree.path(file.id());
//!     if let Some(parent) = path.parent() {
//!         fs::create_dir_all(parent)?;
//!     }
//!     let mut stream = package.create_stream(file.id())?;
//!     io::copy(&mut stream, &mut File::create(&path)?)?;
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Packages are memory-mapped by default, and nothing is copied out of them
//! until you ask: opening a package decodes its directory and nothing else,
//! and most streams read straight from the mapping. A few kinds of items have
//! no contiguous bytes to point at, so their streams are stitched together
//! (Steam cache blocks, VPK preload data) or synthesized (textures in maps
//! and WADs become bitmaps).
//!
//! An open [`Package`] can be shared between threads; streams and validation
//! only ever read from it.
//!
//! Only what's stored uncompressed can be read out. Compressed items are listed
//! with their sizes and attributes, but asking for their contents fails with
//! [`ExtractionError::UnsupportedCompression`].

pub mod checksum;
pub mod format;
pub mod mapping;
pub mod package;
pub mod result;
pub mod stream;
pub mod tree;

mod arch;

pub use mapping::{Mapping, View, ViewCounter};
pub use package::{
    find_attribute, Attribute, AttributeValue, OpenMode, Package, PackageOptions, PackageState,
    PackageType, Validation,
};
pub use result::*;
pub use stream::Stream;
pub use tree::{DirectoryItem, DirectoryTree, FileEntry, ItemId};
