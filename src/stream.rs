//! Readable handles over item contents.
//!
//! Most items are a contiguous run of bytes in the package, so their stream is
//! just a [`View`]. Some aren't:
//!
//! - Block-chained formats (GCF) and VPK preload data scatter an item over
//!   several regions, so their streams chain segments together.
//! - Derived content (a bitmap built from a BSP texture) doesn't exist in the
//!   package at all, so its stream owns a buffer assembled on demand.
//! - NCF items live in their own files on disk, so their streams own a mapping.
//!
//! Streams borrow the package they came from, so it can't be closed
//! out from under them.

use std::cmp;
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};

use crate::arch::usize;
use crate::mapping::{Mapping, View};
use crate::result::*;

/// One piece of a chained stream
pub enum Segment<'a> {
    /// Bytes mapped from the package
    Mapped(View<'a>),
    /// Bytes the decoder already holds (VPK preload data, for example)
    Borrowed(&'a [u8]),
}

impl Segment<'_> {
    fn bytes(&self) -> &[u8] {
        match self {
            Segment::Mapped(view) => &view[..],
            Segment::Borrowed(bytes) => bytes,
        }
    }
}

enum Source<'a> {
    View(View<'a>),
    Buffer(Vec<u8>),
    Chain {
        segments: Vec<Segment<'a>>,
        /// Where each segment starts in the stream
        starts: Vec<u64>,
    },
    External(Mapping),
}

/// A read-only, seekable stream over an item's contents.
pub struct Stream<'a> {
    source: Source<'a>,
    len: u64,
    position: u64,
}

impl fmt::Debug for Stream<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match &self.source {
            Source::View(_) => "view",
            Source::Buffer(_) => "buffer",
            Source::Chain { .. } => "chain",
            Source::External(_) => "external",
        };
        f.debug_struct("Stream")
            .field("kind", &kind)
            .field("len", &self.len)
            .field("position", &self.position)
            .finish()
    }
}

impl<'a> Stream<'a> {
    /// A zero-copy stream over mapped bytes.
    pub fn from_view(view: View<'a>) -> Self {
        let len = view.len() as u64;
        Self::new(Source::View(view), len)
    }

    /// A stream over content assembled in memory.
    pub fn from_buffer(buffer: Vec<u8>) -> Self {
        let len = buffer.len() as u64;
        Self::new(Source::Buffer(buffer), len)
    }

    /// A stream reading each segment in turn.
    pub fn from_segments(segments: Vec<Segment<'a>>) -> Self {
        let mut starts = Vec::with_capacity(segments.len());
        let mut len = 0u64;
        for segment in &segments {
            starts.push(len);
            len += segment.bytes().len() as u64;
        }
        Self::new(Source::Chain { segments, starts }, len)
    }

    /// A stream over an entire mapping it owns.
    pub fn from_mapping(mapping: Mapping) -> Self {
        let len = mapping.len();
        Self::new(Source::External(mapping), len)
    }

    fn new(source: Source<'a>, len: u64) -> Self {
        Self {
            source,
            len,
            position: 0,
        }
    }

    /// Total length of the stream in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The current read position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Reads from `position` without moving the stream's cursor.
    ///
    /// Returns how many bytes were read, which is only short at the end of the stream.
    pub fn read_at(&self, position: u64, buf: &mut [u8]) -> PakResult<usize> {
        if position >= self.len || buf.is_empty() {
            return Ok(0);
        }
        let wanted = cmp::min(buf.len() as u64, self.len - position);
        let buf = &mut buf[..usize(wanted)?];

        match &self.source {
            Source::View(view) => copy_from(view, position, buf),
            Source::Buffer(buffer) => copy_from(buffer, position, buf),
            Source::External(mapping) => {
                let view = mapping.map(position, wanted)?;
                buf.copy_from_slice(&view);
                Ok(buf.len())
            }
            Source::Chain { segments, starts } => {
                // Find the segment containing `position`, then keep going until full.
                let mut index = match starts.binary_search(&position) {
                    Ok(i) => i,
                    Err(i) => i - 1,
                };
                let mut filled = 0;
                let mut at = position;
                while filled < buf.len() && index < segments.len() {
                    let segment = segments[index].bytes();
                    let within = at - starts[index];
                    let n = copy_from(segment, within, &mut buf[filled..])?;
                    filled += n;
                    at += n as u64;
                    index += 1;
                }
                Ok(filled)
            }
        }
    }

    /// Reads the rest of the stream into a vector.
    pub fn to_vec(&mut self) -> PakResult<Vec<u8>> {
        let mut contents = Vec::with_capacity(usize(self.len.saturating_sub(self.position))?);
        self.read_to_end(&mut contents)?;
        Ok(contents)
    }

    /// Closes the stream, unmapping anything it had mapped.
    pub fn close(self) {}
}

fn copy_from(source: &[u8], position: u64, buf: &mut [u8]) -> PakResult<usize> {
    let start = usize(position)?;
    if start >= source.len() {
        return Ok(0);
    }
    let n = cmp::min(buf.len(), source.len() - start);
    buf[..n].copy_from_slice(&source[start..start + n]);
    Ok(n)
}

fn to_io(e: PakError) -> io::Error {
    match e {
        PakError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

impl Read for Stream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.read_at(self.position, buf).map_err(to_io)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for Stream<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(delta) => self.len.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        match target {
            Some(p) => {
                // Like files, seeking past the end is fine; reads there return nothing.
                self.position = p;
                Ok(p)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Seek to a negative position",
            )),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn view_stream() {
        let mapping = Mapping::from_bytes(b"hello world".to_vec());
        let counter = mapping.view_counter();
        let mut stream = Stream::from_view(mapping.map(6, 5).unwrap());
        assert_eq!(stream.len(), 5);
        assert_eq!(stream.to_vec().unwrap(), b"world");
        assert_eq!(counter.mapped(), 1);
        stream.close();
        assert_eq!(counter.mapped(), 0);
    }

    #[test]
    fn chained_stream() {
        let mapping = Mapping::from_bytes(b"0123456789".to_vec());
        let preload = b"ab";
        let stream = Stream::from_segments(vec![
            Segment::Borrowed(preload),
            Segment::Mapped(mapping.map(7, 3).unwrap()),
            Segment::Mapped(mapping.map(0, 0).unwrap()),
            Segment::Mapped(mapping.map(0, 2).unwrap()),
        ]);
        assert_eq!(stream.len(), 7);

        let mut buf = [0u8; 4];
        assert_eq!(stream.read_at(1, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"b789");
        assert_eq!(stream.read_at(5, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"01");
        assert_eq!(stream.read_at(7, &mut buf).unwrap(), 0);
    }

    #[test]
    fn chained_stream_byte_by_byte() {
        let mapping = Mapping::from_bytes(b"abcdef".to_vec());
        let mut stream = Stream::from_segments(vec![
            Segment::Mapped(mapping.map(3, 3).unwrap()),
            Segment::Mapped(mapping.map(0, 3).unwrap()),
        ]);
        let mut out = Vec::new();
        let mut buf = [0u8; 1];
        while stream.read(&mut buf).unwrap() == 1 {
            out.push(buf[0]);
        }
        assert_eq!(out, b"defabc");
    }

    #[test]
    fn seeking() {
        let mut stream = Stream::from_buffer(b"0123456789".to_vec());
        assert_eq!(stream.seek(SeekFrom::End(-3)).unwrap(), 7);
        assert_eq!(stream.to_vec().unwrap(), b"789");
        assert_eq!(stream.seek(SeekFrom::Start(2)).unwrap(), 2);
        assert_eq!(stream.seek(SeekFrom::Current(1)).unwrap(), 3);
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"34");
        assert!(stream.seek(SeekFrom::Current(-10)).is_err());

        stream.seek(SeekFrom::Start(50)).unwrap();
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn external_stream() {
        let mut stream = Stream::from_mapping(Mapping::from_bytes(b"on disk".to_vec()));
        assert_eq!(stream.to_vec().unwrap(), b"on disk");
    }
}
