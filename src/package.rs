//! Opening packages and asking them questions.
//!
//! A [`Package`] goes `Closed` → `Opening` → `Open` → `Closed`.
//! Opening maps the source, has the format's decoder read and check its
//! headers, then builds the [`DirectoryTree`]. Any failure along the way
//! leaves the package closed, with nothing mapped.
//!
//! While open, a package answers questions about the items in its tree:
//! sizes, attributes, streams of their contents, and whether those contents
//! match the checksums the package stores.

use std::fmt;
use std::fs::File;
use std::io::Read;

use camino::{Utf8Path, Utf8PathBuf};
use log::*;

use crate::format::{Decoder, OpenContext};
use crate::mapping::Mapping;
use crate::result::*;
use crate::stream::Stream;
use crate::tree::{DirectoryTree, ItemId};

/// The kinds of package we know how to read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageType {
    /// Not a package we recognize
    None,
    /// Half-Life (GoldSrc) map
    Bsp,
    /// Steam game cache file
    Gcf,
    /// Steam non-cache file
    Ncf,
    /// Quake package
    Pak,
    /// Relic Entertainment archive (Company of Heroes, Dawn of War)
    Sga,
    /// Source engine map
    Vbsp,
    /// Valve package (Source engine)
    Vpk,
    /// Half-Life texture package
    Wad,
    /// Xbox package
    Xzp,
    /// Zip archive
    Zip,
}

/// How many leading bytes [`PackageType::from_prefix()`] wants to see
pub const SNIFF_LENGTH: usize = 16;

/// Signatures found at the very start of each package type
const SIGNATURES: &[(PackageType, &[u8])] = &[
    (PackageType::Bsp, &[0x1e, 0x00, 0x00, 0x00]),
    (PackageType::Gcf, &[0x01, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00]),
    (PackageType::Ncf, &[0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]),
    (PackageType::Pak, b"PACK"),
    (PackageType::Sga, b"_ARCHIVE"),
    (PackageType::Vbsp, b"VBSP"),
    (PackageType::Vpk, &[0x34, 0x12, 0xaa, 0x55]),
    (PackageType::Wad, b"WAD3"),
    (PackageType::Xzp, b"piZx"),
    (PackageType::Zip, &[b'P', b'K', 0x03, 0x04]),
    // An empty Zip archive is nothing but its end record.
    (PackageType::Zip, &[b'P', b'K', 0x05, 0x06]),
];

impl PackageType {
    /// Guesses a package's type from its first [`SNIFF_LENGTH`] bytes.
    ///
    /// Returns `PackageType::None` rather than guessing when nothing matches.
    pub fn from_prefix(prefix: &[u8]) -> Self {
        SIGNATURES
            .iter()
            .find(|(_, signature)| prefix.starts_with(signature))
            .map(|(package_type, _)| *package_type)
            .unwrap_or(PackageType::None)
    }

    /// Reads the start of the given file and guesses its type.
    pub fn detect<P: AsRef<Utf8Path>>(path: P) -> PakResult<Self> {
        let mut file = File::open(path.as_ref()).map_err(MappingError::Io)?;
        let mut prefix = Vec::with_capacity(SNIFF_LENGTH);
        file.by_ref()
            .take(SNIFF_LENGTH as u64)
            .read_to_end(&mut prefix)
            .map_err(MappingError::Io)?;
        Ok(Self::from_prefix(&prefix))
    }

    pub fn name(&self) -> &'static str {
        match self {
            PackageType::None => "None",
            PackageType::Bsp => "BSP",
            PackageType::Gcf => "GCF",
            PackageType::Ncf => "NCF",
            PackageType::Pak => "PAK",
            PackageType::Sga => "SGA",
            PackageType::Vbsp => "VBSP",
            PackageType::Vpk => "VPK",
            PackageType::Wad => "WAD",
            PackageType::Xzp => "XZP",
            PackageType::Zip => "ZIP",
        }
    }
}

impl fmt::Display for PackageType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Flags for opening a package
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenMode {
    /// Reserved. Packages are never modified.
    pub write: bool,
    /// Read the package into memory instead of memory-mapping it.
    pub no_mapping: bool,
}

impl OpenMode {
    pub const READ: OpenMode = OpenMode {
        write: false,
        no_mapping: false,
    };

    pub fn without_mapping(self) -> Self {
        Self {
            no_mapping: true,
            ..self
        }
    }

    pub fn with_write(self) -> Self {
        Self {
            write: true,
            ..self
        }
    }
}

/// Everything that can be configured about opening a package
#[derive(Debug, Clone, Default)]
pub struct PackageOptions {
    pub mode: OpenMode,
    /// Where NCF packages find their items on disk.
    pub root_path: Option<Utf8PathBuf>,
}

impl From<OpenMode> for PackageOptions {
    fn from(mode: OpenMode) -> Self {
        Self {
            mode,
            root_path: None,
        }
    }
}

/// The value of an [`Attribute`]
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Bool(bool),
    Integer(i64),
    Unsigned { value: u64, hexadecimal: bool },
    Float(f32),
    String(String),
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AttributeValue::Bool(b) => write!(f, "{}", if *b { "True" } else { "False" }),
            AttributeValue::Integer(i) => write!(f, "{}", i),
            AttributeValue::Unsigned {
                value,
                hexadecimal: true,
            } => write!(f, "{:#010x}", value),
            AttributeValue::Unsigned { value, .. } => write!(f, "{}", value),
            AttributeValue::Float(v) => write!(f, "{:.2}", v),
            AttributeValue::String(s) => f.write_str(s),
        }
    }
}

/// A named fact about a package or one of its items
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: &'static str,
    pub value: AttributeValue,
}

impl Attribute {
    pub fn boolean(name: &'static str, value: bool) -> Self {
        Self {
            name,
            value: AttributeValue::Bool(value),
        }
    }

    pub fn integer(name: &'static str, value: i64) -> Self {
        Self {
            name,
            value: AttributeValue::Integer(value),
        }
    }

    pub fn unsigned<I: Into<u64>>(name: &'static str, value: I) -> Self {
        Self {
            name,
            value: AttributeValue::Unsigned {
                value: value.into(),
                hexadecimal: false,
            },
        }
    }

    pub fn hex<I: Into<u64>>(name: &'static str, value: I) -> Self {
        Self {
            name,
            value: AttributeValue::Unsigned {
                value: value.into(),
                hexadecimal: true,
            },
        }
    }

    pub fn float(name: &'static str, value: f32) -> Self {
        Self {
            name,
            value: AttributeValue::Float(value),
        }
    }

    pub fn string<S: Into<String>>(name: &'static str, value: S) -> Self {
        Self {
            name,
            value: AttributeValue::String(value.into()),
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value)
    }
}

/// Finds an attribute by name in a list of them.
pub fn find_attribute<'a>(attributes: &'a [Attribute], name: &str) -> Option<&'a AttributeValue> {
    attributes
        .iter()
        .find(|a| a.name == name)
        .map(|a| &a.value)
}

/// The outcome of checking an item against its stored checksum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    /// The contents match the stored checksum.
    Ok,
    /// The contents don't match the stored checksum (or some are missing).
    Corrupt,
    /// There's nothing to check against, or the item can't be read out.
    AssumedOk,
}

impl Validation {
    /// Combines the results of several items: any corruption wins,
    /// then any real check, then assumptions.
    pub fn worst(self, other: Validation) -> Validation {
        use Validation::*;
        match (self, other) {
            (Corrupt, _) | (_, Corrupt) => Corrupt,
            (Ok, _) | (_, Ok) => Ok,
            (AssumedOk, AssumedOk) => AssumedOk,
        }
    }
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Validation::Ok => "OK",
            Validation::Corrupt => "Corrupt",
            Validation::AssumedOk => "Assumed OK",
        })
    }
}

/// Where a package is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageState {
    Closed,
    Opening,
    Open,
}

struct OpenPackage {
    mapping: Mapping,
    decoder: Decoder,
    tree: DirectoryTree,
    package_type: PackageType,
    path: Option<Utf8PathBuf>,
}

/// A package of some [`PackageType`], open or not.
pub struct Package {
    package_type: PackageType,
    state: PackageState,
    open: Option<OpenPackage>,
}

impl fmt::Debug for Package {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Package")
            .field("package_type", &self.package_type())
            .field("state", &self.state)
            .field("path", &self.path())
            .finish()
    }
}

impl Package {
    /// Creates a closed package of the given type.
    ///
    /// With `PackageType::None`, the type is guessed from the source's first bytes
    /// each time it's opened.
    pub fn new(package_type: PackageType) -> Self {
        Self {
            package_type,
            state: PackageState::Closed,
            open: None,
        }
    }

    /// Opens the file at `path` as whatever package type it looks like.
    ///
    /// ```no_run
    /// # use pakfs::*;
    /// let package = Package::open_path("half-life.gcf", OpenMode::READ)?;
    /// let tree = package.tree()?;
    /// for file in tree.files() {
    ///     println!("{} ({} bytes)", tree.path(file.id()), package.size(file.id())?);
    /// }
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn open_path<P: AsRef<Utf8Path>>(path: P, mode: OpenMode) -> PakResult<Self> {
        let mut package = Self::new(PackageType::None);
        package.open(path, mode)?;
        Ok(package)
    }

    /// Opens the file at `path`, closing whatever was open before.
    pub fn open<P, O>(&mut self, path: P, options: O) -> PakResult<()>
    where
        P: AsRef<Utf8Path>,
        O: Into<PackageOptions>,
    {
        let path = path.as_ref();
        let options = options.into();
        self.close();
        self.state = PackageState::Opening;
        info!("Opening {}", path);

        let mapping = match Mapping::open(path, options.mode) {
            Ok(m) => m,
            Err(e) => {
                self.state = PackageState::Closed;
                return Err(e.into());
            }
        };
        self.finish_open(mapping, Some(path), &options)
    }

    /// Opens a package held in memory.
    pub fn open_bytes(&mut self, bytes: Vec<u8>) -> PakResult<()> {
        self.open_mapping(Mapping::from_bytes(bytes), PackageOptions::default())
    }

    /// Opens a package from an existing mapping.
    pub fn open_mapping(&mut self, mapping: Mapping, options: PackageOptions) -> PakResult<()> {
        self.close();
        self.state = PackageState::Opening;
        self.finish_open(mapping, None, &options)
    }

    fn finish_open(
        &mut self,
        mapping: Mapping,
        path: Option<&Utf8Path>,
        options: &PackageOptions,
    ) -> PakResult<()> {
        match Self::load(self.package_type, mapping, path, options) {
            Ok(open) => {
                debug!(
                    "Opened {} package with {} items",
                    open.package_type,
                    open.tree.len() - 1
                );
                self.open = Some(open);
                self.state = PackageState::Open;
                Ok(())
            }
            Err(e) => {
                debug!("Couldn't open package: {}", e);
                self.state = PackageState::Closed;
                Err(e)
            }
        }
    }

    /// Maps the decoder's structures and builds the tree.
    /// On failure, everything built so far is dropped on the way out.
    fn load(
        package_type: PackageType,
        mapping: Mapping,
        path: Option<&Utf8Path>,
        options: &PackageOptions,
    ) -> PakResult<OpenPackage> {
        let package_type = match package_type {
            PackageType::None => {
                let prefix = mapping.map(0, mapping.len().min(SNIFF_LENGTH as u64))?;
                PackageType::from_prefix(&prefix)
            }
            known => known,
        };
        if package_type == PackageType::None {
            return Err(PakError::UnknownPackageType);
        }

        let context = OpenContext { path, options };
        let decoder = Decoder::map_data_structures(package_type, &mapping, &context)?;

        let mut tree = DirectoryTree::new();
        decoder.create_root(&mapping, &mut tree)?;

        Ok(OpenPackage {
            mapping,
            decoder,
            tree,
            package_type,
            path: path.map(Utf8Path::to_owned),
        })
    }

    /// Closes the package, dropping its tree and unmapping its source.
    ///
    /// Closing a package that isn't open does nothing.
    pub fn close(&mut self) {
        if let Some(open) = self.open.take() {
            info!("Closing {} package", open.package_type);
        }
        self.state = PackageState::Closed;
    }

    pub fn state(&self) -> PackageState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// The type of the open package, or the type it was created with while closed.
    pub fn package_type(&self) -> PackageType {
        match &self.open {
            Some(open) => open.package_type,
            None => self.package_type,
        }
    }

    /// The path the package was opened from, if it came from a file.
    pub fn path(&self) -> Option<&Utf8Path> {
        self.open.as_ref().and_then(|o| o.path.as_deref())
    }

    fn opened(&self) -> PakResult<&OpenPackage> {
        self.open.as_ref().ok_or(PakError::NotOpen)
    }

    /// The package's directory tree.
    pub fn tree(&self) -> PakResult<&DirectoryTree> {
        Ok(&self.opened()?.tree)
    }

    pub fn root(&self) -> PakResult<ItemId> {
        Ok(self.tree()?.root())
    }

    /// Looks up an item by its path in the package.
    pub fn lookup<P: AsRef<Utf8Path>>(&self, path: P) -> PakResult<ItemId> {
        self.tree()?.lookup(path)
    }

    /// Facts about the package as a whole.
    pub fn attributes(&self) -> PakResult<Vec<Attribute>> {
        Ok(self.opened()?.decoder.package_attributes())
    }

    /// Facts about an item. Folders have none.
    pub fn item_attributes(&self, item: ItemId) -> PakResult<Vec<Attribute>> {
        let open = self.opened()?;
        match open.tree.get(item)?.entry() {
            Some(entry) => open.decoder.item_attributes(&open.mapping, entry),
            None => Ok(Vec::new()),
        }
    }

    /// The logical size of an item: what reading its stream would produce.
    /// A folder's size is the total of the files within it.
    pub fn size(&self, item: ItemId) -> PakResult<u64> {
        let open = self.opened()?;
        open.tree.files_under(item)?.iter().try_fold(0u64, |total, f| {
            let size = open.decoder.size(&open.mapping, open.tree.entry(*f)?)?;
            Ok(total + size)
        })
    }

    /// How many bytes an item occupies in the package.
    /// A folder's size is the total of the files within it.
    pub fn size_on_disk(&self, item: ItemId) -> PakResult<u64> {
        let open = self.opened()?;
        open.tree.files_under(item)?.iter().try_fold(0u64, |total, f| {
            let size = open.decoder.size_on_disk(&open.mapping, open.tree.entry(*f)?)?;
            Ok(total + size)
        })
    }

    /// Opens a stream over a file's contents.
    pub fn create_stream(&self, item: ItemId) -> PakResult<Stream<'_>> {
        let open = self.opened()?;
        let entry = open.tree.entry(item)?;
        trace!("Creating stream for {}", open.tree.path(item));
        open.decoder.create_stream(&open.mapping, entry)
    }

    /// Checks an item's contents against the checksums stored in the package.
    /// A folder's result is the worst of the files within it.
    pub fn validate(&self, item: ItemId) -> PakResult<Validation> {
        let open = self.opened()?;
        let mut result = Validation::AssumedOk;
        for file in open.tree.files_under(item)? {
            let validation = open
                .decoder
                .validate(&open.mapping, open.tree.entry(file)?)?;
            debug!("{}: {}", open.tree.path(file), validation);
            result = result.worst(validation);
        }
        Ok(result)
    }

    /// Checks package-wide digests, for formats that have them.
    pub fn validate_package(&self) -> PakResult<Validation> {
        let open = self.opened()?;
        open.decoder.validate_package(&open.mapping)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sniffing() {
        let cases: &[(&[u8], PackageType)] = &[
            (&[0x1e, 0, 0, 0, 0x7c, 0, 0, 0], PackageType::Bsp),
            (&[1, 0, 0, 0, 1, 0, 0, 0, 6, 0, 0, 0], PackageType::Gcf),
            (&[1, 0, 0, 0, 2, 0, 0, 0, 1, 0, 0, 0], PackageType::Ncf),
            (b"PACK\x0c\0\0\0", PackageType::Pak),
            (b"_ARCHIVE\x04\0\x00\0", PackageType::Sga),
            (b"VBSP\x14\0\0\0", PackageType::Vbsp),
            (&[0x34, 0x12, 0xaa, 0x55, 1, 0, 0, 0], PackageType::Vpk),
            (b"WAD3", PackageType::Wad),
            (b"piZx\x06\0\0\0", PackageType::Xzp),
            (b"PK\x03\x04\x14\0", PackageType::Zip),
            (b"PK\x05\x06\0\0", PackageType::Zip),
            (b"WAD2", PackageType::None),
            (b"", PackageType::None),
            (&[1, 0, 0, 0, 3, 0, 0, 0], PackageType::None),
        ];
        for (prefix, expected) in cases {
            assert_eq!(PackageType::from_prefix(prefix), *expected, "{:?}", prefix);
        }
    }

    #[test]
    fn validation_combines() {
        use Validation::*;
        assert_eq!(AssumedOk.worst(AssumedOk), AssumedOk);
        assert_eq!(AssumedOk.worst(Ok), Ok);
        assert_eq!(Ok.worst(Corrupt), Corrupt);
        assert_eq!(Corrupt.worst(AssumedOk), Corrupt);
    }

    #[test]
    fn attribute_display() {
        assert_eq!(Attribute::hex("CRC", 0xbeefu32).to_string(), "CRC: 0x0000beef");
        assert_eq!(Attribute::unsigned("Version", 6u32).to_string(), "Version: 6");
        assert_eq!(Attribute::boolean("Encrypted", false).to_string(), "Encrypted: False");
        assert_eq!(Attribute::float("Fragmentation", 12.5).to_string(), "Fragmentation: 12.50");
        let attributes = vec![Attribute::string("Comment", "hi")];
        assert_eq!(
            find_attribute(&attributes, "Comment"),
            Some(&AttributeValue::String("hi".to_owned()))
        );
        assert_eq!(find_attribute(&attributes, "Nope"), None);
    }

    #[test]
    fn closed_packages_refuse_queries() {
        let mut package = Package::new(PackageType::Pak);
        assert_eq!(package.state(), PackageState::Closed);
        assert!(matches!(package.tree(), Err(PakError::NotOpen)));
        assert!(matches!(package.attributes(), Err(PakError::NotOpen)));
        package.close();
        package.close();
        assert_eq!(package.state(), PackageState::Closed);
    }

    #[test]
    fn unknown_bytes() {
        let mut package = Package::new(PackageType::None);
        match package.open_bytes(b"definitely not a package".to_vec()) {
            Err(PakError::UnknownPackageType) => {}
            other => panic!("Expected UnknownPackageType, got {:?}", other),
        }
        assert!(!package.is_open());
    }
}
