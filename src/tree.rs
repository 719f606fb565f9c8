//! The virtual directory tree every package type converges on.
//!
//! Packages store their contents in wildly different ways: flat lists of paths
//! (PAK, ZIP), linked parent/child indices (GCF), ranges of folders and files
//! (SGA)... Whatever the layout, opening a package builds one of these trees,
//! and that's all anybody outside the decoder needs to navigate it.
//!
//! Nodes live in an arena and are addressed by [`ItemId`].
//! Folders know their children; every node knows its parent.

use std::collections::HashMap;
use std::fmt;
use std::slice;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use log::*;

use crate::result::*;

/// The address of a file or folder in a [`DirectoryTree`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(usize);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a package decoder knows about one of its files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Format-defined identifier, usually an index into the decoder's directory.
    /// Stable for as long as the package is open.
    pub id: u32,
    /// The raw directory record, for formats that need nothing else
    /// to answer questions about the file.
    pub data: Option<Vec<u8>>,
}

impl FileEntry {
    pub fn new(id: u32) -> Self {
        Self { id, data: None }
    }

    pub fn with_data(id: u32, data: Vec<u8>) -> Self {
        Self {
            id,
            data: Some(data),
        }
    }
}

#[derive(Debug, Default)]
struct FolderNode {
    children: Vec<ItemId>,
    /// Child folders by name, so building a tree from paths doesn't rescan `children`.
    folders: HashMap<String, ItemId>,
}

#[derive(Debug)]
enum NodeKind {
    Folder(FolderNode),
    File(FileEntry),
}

#[derive(Debug)]
struct Node {
    name: String,
    parent: Option<ItemId>,
    kind: NodeKind,
}

/// A file or folder in a [`DirectoryTree`]
#[derive(Debug, Clone, Copy)]
pub enum DirectoryItem<'t> {
    Folder {
        id: ItemId,
        name: &'t str,
        children: &'t [ItemId],
    },
    File {
        id: ItemId,
        name: &'t str,
        entry: &'t FileEntry,
    },
}

impl<'t> DirectoryItem<'t> {
    pub fn id(&self) -> ItemId {
        match *self {
            DirectoryItem::Folder { id, .. } | DirectoryItem::File { id, .. } => id,
        }
    }

    pub fn name(&self) -> &'t str {
        match *self {
            DirectoryItem::Folder { name, .. } | DirectoryItem::File { name, .. } => name,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, DirectoryItem::File { .. })
    }

    pub fn is_folder(&self) -> bool {
        !self.is_file()
    }

    /// The file's entry, or `None` for folders
    pub fn entry(&self) -> Option<&'t FileEntry> {
        match *self {
            DirectoryItem::File { entry, .. } => Some(entry),
            DirectoryItem::Folder { .. } => None,
        }
    }
}

/// A tree of folders and files with a single root folder.
#[derive(Debug)]
pub struct DirectoryTree {
    nodes: Vec<Node>,
}

impl Default for DirectoryTree {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectoryTree {
    /// Creates a tree holding only an unnamed root folder.
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                name: String::new(),
                parent: None,
                kind: NodeKind::Folder(FolderNode::default()),
            }],
        }
    }

    pub fn root(&self) -> ItemId {
        ItemId(0)
    }

    /// Total number of items, root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if the tree holds nothing but its root.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    pub fn file_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::File(_)))
            .count()
    }

    /// True if `id` names an item of this tree.
    pub fn contains(&self, id: ItemId) -> bool {
        id.0 < self.nodes.len()
    }

    fn node(&self, id: ItemId) -> PakResult<&Node> {
        self.nodes.get(id.0).ok_or(PakError::NoSuchItem(id))
    }

    /// Looks up an item by ID, or `NoSuchItem` if it's from some other tree.
    pub fn get(&self, id: ItemId) -> PakResult<DirectoryItem<'_>> {
        self.node(id)?;
        Ok(self.item(id))
    }

    /// Looks up an item by ID.
    ///
    /// # Panics
    ///
    /// If `id` didn't come from this tree. Use [`get()`](Self::get) for IDs
    /// that might be stale.
    pub fn item(&self, id: ItemId) -> DirectoryItem<'_> {
        let node = &self.nodes[id.0];
        match &node.kind {
            NodeKind::Folder(folder) => DirectoryItem::Folder {
                id,
                name: &node.name,
                children: &folder.children,
            },
            NodeKind::File(entry) => DirectoryItem::File {
                id,
                name: &node.name,
                entry,
            },
        }
    }

    /// # Panics
    ///
    /// If `id` didn't come from this tree.
    pub fn name(&self, id: ItemId) -> &str {
        &self.nodes[id.0].name
    }

    /// # Panics
    ///
    /// If `id` didn't come from this tree.
    pub fn parent(&self, id: ItemId) -> Option<ItemId> {
        self.nodes[id.0].parent
    }

    /// The children of a folder, in insertion order. Files have none.
    ///
    /// # Panics
    ///
    /// If `id` didn't come from this tree.
    pub fn children(&self, id: ItemId) -> &[ItemId] {
        match &self.nodes[id.0].kind {
            NodeKind::Folder(folder) => &folder.children,
            NodeKind::File(_) => &[],
        }
    }

    /// The entry of a file, `NotAFile` for folders,
    /// or `NoSuchItem` for IDs from some other tree
    pub fn entry(&self, id: ItemId) -> PakResult<&FileEntry> {
        match &self.node(id)?.kind {
            NodeKind::File(entry) => Ok(entry),
            NodeKind::Folder(_) => Err(PakError::NotAFile),
        }
    }

    /// The item's path from the root, with `/` separators.
    ///
    /// # Panics
    ///
    /// If `id` didn't come from this tree.
    pub fn path(&self, id: ItemId) -> Utf8PathBuf {
        let mut names = Vec::new();
        let mut current = Some(id);
        while let Some(i) = current {
            let node = &self.nodes[i.0];
            if node.parent.is_some() {
                names.push(node.name.as_str());
            }
            current = node.parent;
        }
        names.reverse();
        Utf8PathBuf::from(names.join("/"))
    }

    fn push(&mut self, parent: ItemId, name: &str, kind: NodeKind) -> ItemId {
        let id = ItemId(self.nodes.len());
        let is_folder = matches!(kind, NodeKind::Folder(_));
        self.nodes.push(Node {
            name: name.to_owned(),
            parent: Some(parent),
            kind,
        });
        match &mut self.nodes[parent.0].kind {
            NodeKind::Folder(folder) => {
                folder.children.push(id);
                if is_folder {
                    folder.folders.insert(name.to_owned(), id);
                }
            }
            NodeKind::File(_) => unreachable!("Items are only ever added to folders"),
        }
        id
    }

    fn folder_node(&self, id: ItemId) -> &FolderNode {
        match &self.nodes[id.0].kind {
            NodeKind::Folder(folder) => folder,
            NodeKind::File(_) => panic!("{} is a file, expected a folder", id),
        }
    }

    /// Returns the child folder of `parent` with the given name,
    /// creating it if it doesn't exist yet.
    ///
    /// A file with the same name doesn't count: a new folder is created beside it.
    ///
    /// # Panics
    ///
    /// If `parent` is a file or didn't come from this tree.
    pub fn add_folder(&mut self, parent: ItemId, name: &str) -> ItemId {
        if let Some(existing) = self.folder_node(parent).folders.get(name) {
            return *existing;
        }
        self.push(parent, name, NodeKind::Folder(FolderNode::default()))
    }

    /// Adds a file directly under `parent`.
    ///
    /// # Panics
    ///
    /// If `parent` is a file or didn't come from this tree.
    pub fn add_file(&mut self, parent: ItemId, name: &str, entry: FileEntry) -> ItemId {
        let _ = self.folder_node(parent);
        self.push(parent, name, NodeKind::File(entry))
    }

    /// Adds a file by its stored path, creating whatever folders lead up to it.
    ///
    /// Both `/` and `\` separate path segments.
    /// A path ending in a separator names a folder, so only folders are created
    /// and `None` is returned.
    pub fn add_path(&mut self, folder: ItemId, path: &str, entry: FileEntry) -> Option<ItemId> {
        let mut segments = path.split(&['/', '\\'][..]).peekable();
        let mut current = folder;

        while let Some(segment) = segments.next() {
            let last = segments.peek().is_none();
            if last {
                if segment.is_empty() {
                    trace!("{} names a folder", path);
                    return None;
                }
                return Some(self.add_file(current, segment, entry));
            }
            if segment.is_empty() {
                continue;
            }
            current = self.add_folder(current, segment);
        }
        unreachable!("split() always yields at least one segment")
    }

    /// Looks up a file or folder by its path.
    ///
    /// The path comes from a user, not from a package,
    /// so anything but plain names is rejected.
    /// Where a folder and a file share a name, intermediate segments
    /// resolve to the folder and the final one to whichever came first.
    pub fn lookup<P: AsRef<Utf8Path>>(&self, path: P) -> PakResult<ItemId> {
        let path = path.as_ref();
        let normalized = Utf8PathBuf::from(path.as_str().replace('\\', "/"));
        let mut components = normalized.components().peekable();
        let mut current = self.root();

        while let Some(component) = components.next() {
            let name = match component {
                Utf8Component::Prefix(prefix) => {
                    return Err(PakError::InvalidPath(format!(
                        "Prefix {prefix} found in path {path}",
                    )));
                }
                Utf8Component::RootDir => {
                    return Err(PakError::InvalidPath(format!(
                        "Root directory found in path {path}",
                    )));
                }
                Utf8Component::CurDir => {
                    return Err(PakError::InvalidPath(format!(
                        "Current dir (.) found in path {path}",
                    )));
                }
                Utf8Component::ParentDir => {
                    return Err(PakError::InvalidPath(format!(
                        "Parent dir (..) found in path {path}",
                    )));
                }
                Utf8Component::Normal(name) => name,
            };

            let folder = match &self.nodes[current.0].kind {
                NodeKind::Folder(folder) => folder,
                NodeKind::File(_) => {
                    return Err(PakError::InvalidPath(format!(
                        "{path} goes through a file, expected a folder",
                    )));
                }
            };

            let next = if components.peek().is_some() {
                folder.folders.get(name).copied()
            } else {
                folder
                    .children
                    .iter()
                    .copied()
                    .find(|child| self.nodes[child.0].name == name)
            };
            current = next.ok_or_else(|| PakError::NoSuchFile(path.to_owned()))?;
        }
        Ok(current)
    }

    /// Returns an iterator over every item under the root, depth first.
    pub fn traverse(&self) -> TreeIterator<'_> {
        self.traverse_from(self.root())
    }

    /// Returns an iterator over every item under the given folder, depth first.
    pub fn traverse_from(&self, folder: ItemId) -> TreeIterator<'_> {
        TreeIterator::new(self, folder)
    }

    /// Returns an iterator over the files in the tree, depth first.
    pub fn files(&self) -> impl Iterator<Item = DirectoryItem<'_>> {
        self.traverse().filter(DirectoryItem::is_file)
    }

    /// Returns an iterator over the folders in the tree (root excluded), depth first.
    pub fn folders(&self) -> impl Iterator<Item = DirectoryItem<'_>> {
        self.traverse().filter(DirectoryItem::is_folder)
    }

    /// The item itself if it's a file, or every file below it if it's a folder.
    pub fn files_under(&self, id: ItemId) -> PakResult<Vec<ItemId>> {
        Ok(match self.get(id)? {
            DirectoryItem::File { .. } => vec![id],
            DirectoryItem::Folder { .. } => self
                .traverse_from(id)
                .filter(DirectoryItem::is_file)
                .map(|item| item.id())
                .collect(),
        })
    }
}

/// Iterates over all files and folders below some folder of a [`DirectoryTree`]
pub struct TreeIterator<'t> {
    tree: &'t DirectoryTree,
    stack: Vec<slice::Iter<'t, ItemId>>,
}

impl<'t> TreeIterator<'t> {
    fn new(tree: &'t DirectoryTree, folder: ItemId) -> Self {
        let stack = vec![tree.children(folder).iter()];
        Self { tree, stack }
    }
}

impl<'t> Iterator for TreeIterator<'t> {
    type Item = DirectoryItem<'t>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let top = self.stack.last_mut()?;
            match top.next() {
                Some(id) => {
                    let item = self.tree.item(*id);
                    if let DirectoryItem::Folder { children, .. } = item {
                        self.stack.push(children.iter());
                    }
                    return Some(item);
                }
                None => {
                    self.stack.pop();
                }
            }
        }
    }
}
