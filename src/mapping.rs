//! Byte sources and bounded views into them.
//!
//! A [`Mapping`] owns the bytes of a package, either memory-mapped from a file
//! or read into a buffer. Decoders never slice it directly: they ask for a
//! [`View`] of exactly the region they're about to decode, which is checked
//! against the mapping's size up front.
//!
//! Views are guards. Dropping one (including on an early `?` return) unmaps it,
//! and every mapping counts its live views so leaks show up in tests.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use camino::Utf8Path;
use log::*;
use memmap2::Mmap;

use crate::arch::{end_of, usize};
use crate::package::OpenMode;
use crate::result::*;

enum Backing {
    Mapped(Mmap),
    Buffer(Vec<u8>),
}

impl Backing {
    fn bytes(&self) -> &[u8] {
        match self {
            Backing::Mapped(m) => m,
            Backing::Buffer(b) => b,
        }
    }
}

/// An owned byte source of known size.
pub struct Mapping {
    backing: Backing,
    views: ViewCounter,
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("size", &self.len())
            .field("mapped", &self.is_memory_mapped())
            .field("views", &self.views.mapped())
            .finish()
    }
}

impl Mapping {
    /// Maps the file at the given path.
    ///
    /// If `mode.no_mapping` is set, the file is read into memory instead.
    pub fn open<P: AsRef<Utf8Path>>(path: P, mode: OpenMode) -> Result<Self, MappingError> {
        let path = path.as_ref();
        let mut file = File::open(path)?;
        let size = file.metadata()?.len();
        debug!("Opening {} ({} bytes)", path, size);

        // Mapping an empty file fails on some platforms; there's nothing to map anyways.
        if mode.no_mapping || size == 0 {
            let mut buffer = Vec::with_capacity(size as usize);
            file.read_to_end(&mut buffer)?;
            return Ok(Self::from_bytes(buffer));
        }

        let mapping = unsafe { Mmap::map(&file)? };
        Ok(Self::with_backing(Backing::Mapped(mapping)))
    }

    /// Wraps an in-memory buffer.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self::with_backing(Backing::Buffer(bytes))
    }

    fn with_backing(backing: Backing) -> Self {
        Self {
            backing,
            views: ViewCounter::default(),
        }
    }

    /// The total size of the source, in bytes.
    pub fn len(&self) -> u64 {
        self.backing.bytes().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_memory_mapped(&self) -> bool {
        matches!(self.backing, Backing::Mapped(_))
    }

    /// Returns a handle to this mapping's live view count.
    ///
    /// The handle outlives the mapping, so it can be checked after a failed open
    /// has thrown the mapping away.
    pub fn view_counter(&self) -> ViewCounter {
        self.views.clone()
    }

    /// Maps `length` bytes starting at `offset`.
    pub fn map(&self, offset: u64, length: u64) -> Result<View<'_>, MappingError> {
        let size = self.len();
        let out_of_bounds = MappingError::OutOfBounds {
            offset,
            length,
            size,
        };
        let end = match end_of(offset, length) {
            Ok(end) if end <= size => end,
            _ => return Err(out_of_bounds),
        };
        let (start, end) = match (usize(offset), usize(end)) {
            (Ok(s), Ok(e)) => (s, e),
            _ => return Err(out_of_bounds),
        };

        self.views.0.fetch_add(1, Ordering::Relaxed);
        Ok(View {
            offset,
            bytes: &self.backing.bytes()[start..end],
            views: &self.views,
        })
    }

    /// Maps everything from `offset` to the end of the source.
    pub fn map_to_end(&self, offset: u64) -> Result<View<'_>, MappingError> {
        self.map(offset, self.len().saturating_sub(offset))
    }

    /// Maps a fixed-size structure at `offset`,
    /// reporting `what` didn't fit if the source is too short.
    pub fn map_record(
        &self,
        what: &'static str,
        offset: u64,
        length: u64,
    ) -> Result<View<'_>, MappingError> {
        self.map(offset, length).map_err(|_| MappingError::TooSmall {
            what,
            needed: offset.saturating_add(length),
            available: self.len(),
        })
    }

    /// Releases a view. Equivalent to dropping it.
    pub fn unmap(&self, view: View<'_>) {
        drop(view)
    }
}

/// A bounded window over a [`Mapping`].
///
/// Derefs to the mapped bytes; unmaps itself when dropped.
pub struct View<'a> {
    offset: u64,
    bytes: &'a [u8],
    views: &'a ViewCounter,
}

impl<'a> View<'a> {
    /// Where this view starts in its mapping.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The mapped bytes, tied to the mapping rather than to this guard.
    ///
    /// Decoders use this to hand out sub-slices that live as long as the view does.
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

impl Deref for View<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.bytes
    }
}

impl fmt::Debug for View<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("View")
            .field("offset", &self.offset)
            .field("length", &self.bytes.len())
            .finish()
    }
}

impl Drop for View<'_> {
    fn drop(&mut self) {
        self.views.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Counts the views currently mapped over a [`Mapping`].
#[derive(Debug, Clone, Default)]
pub struct ViewCounter(Arc<AtomicUsize>);

impl ViewCounter {
    /// How many views are currently mapped
    pub fn mapped(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}
