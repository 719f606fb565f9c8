//! Checksums used to validate items.
//!
//! The algorithms themselves come from crates;
//! this module just gives them a common shape so validation can
//! stream an item through whichever one its format stores.

use std::io::{self, Read};

use crc32fast::Hasher;

/// How many bytes we feed a checksum at a time
pub const CHUNK_SIZE: usize = 0x8000;

/// A running checksum.
pub trait Checksum {
    type Digest: PartialEq;

    fn update(&mut self, bytes: &[u8]);

    fn finalize(self) -> Self::Digest;
}

/// CRC-32 (as used by ZIP, VPK, and SGA)
#[derive(Default, Clone)]
pub struct Crc32(Hasher);

impl Crc32 {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Checksum for Crc32 {
    type Digest = u32;

    fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes)
    }

    fn finalize(self) -> u32 {
        self.0.finalize()
    }
}

/// Adler-32, starting from an arbitrary seed
#[derive(Clone)]
pub struct Adler32(adler::Adler32);

impl Adler32 {
    /// The standard checksum, seeded with 1
    pub fn new() -> Self {
        Self(adler::Adler32::new())
    }

    pub fn with_seed(seed: u32) -> Self {
        Self(adler::Adler32::from_checksum(seed))
    }
}

impl Default for Adler32 {
    fn default() -> Self {
        Self::new()
    }
}

impl Checksum for Adler32 {
    type Digest = u32;

    fn update(&mut self, bytes: &[u8]) {
        self.0.write_slice(bytes)
    }

    fn finalize(self) -> u32 {
        self.0.checksum()
    }
}

/// The checksum Steam cache files (GCF, NCF) store for each 32 KiB chunk:
/// Adler-32 seeded with *zero* XORed with CRC-32.
#[derive(Clone)]
pub struct SteamChecksum {
    adler: Adler32,
    crc: Crc32,
}

impl SteamChecksum {
    pub fn new() -> Self {
        Self {
            adler: Adler32::with_seed(0),
            crc: Crc32::new(),
        }
    }

    /// Checksums one chunk in one go
    pub fn of(chunk: &[u8]) -> u32 {
        let mut sum = Self::new();
        sum.update(chunk);
        sum.finalize()
    }
}

impl Default for SteamChecksum {
    fn default() -> Self {
        Self::new()
    }
}

impl Checksum for SteamChecksum {
    type Digest = u32;

    fn update(&mut self, bytes: &[u8]) {
        self.adler.update(bytes);
        self.crc.update(bytes);
    }

    fn finalize(self) -> u32 {
        self.adler.finalize() ^ self.crc.finalize()
    }
}

/// MD5 (as used by SGA and VPK package digests)
#[derive(Clone)]
pub struct Md5(md5::Context);

impl Md5 {
    pub fn new() -> Self {
        Self(md5::Context::new())
    }
}

impl Default for Md5 {
    fn default() -> Self {
        Self::new()
    }
}

impl Checksum for Md5 {
    type Digest = [u8; 16];

    fn update(&mut self, bytes: &[u8]) {
        self.0.consume(bytes)
    }

    fn finalize(self) -> [u8; 16] {
        self.0.compute().0
    }
}

/// Feeds everything `reader` has into `checksum`, [`CHUNK_SIZE`] bytes at a time.
pub fn digest_reader<R: Read, C: Checksum>(mut reader: R, mut checksum: C) -> io::Result<C::Digest> {
    let mut chunk = vec![0u8; CHUNK_SIZE];
    loop {
        let n = read_chunk(&mut reader, &mut chunk)?;
        if n == 0 {
            break;
        }
        checksum.update(&chunk[..n]);
    }
    Ok(checksum.finalize())
}

/// Fills as much of `chunk` as the reader can, stopping early only at EOF.
pub fn read_chunk<R: Read>(reader: &mut R, chunk: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < chunk.len() {
        match reader.read(&mut chunk[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn crc32() {
        let mut sum = Crc32::new();
        sum.update(b"12");
        sum.update(b"34");
        assert_eq!(sum.finalize(), 0x9be3e0a3);
    }

    #[test]
    fn adler32() {
        let mut sum = Adler32::new();
        sum.update(b"Wikipedia");
        assert_eq!(sum.finalize(), 0x11E60398);

        // Seeded with zero, both halves start at zero instead of (1, 0).
        let mut zeroed = Adler32::with_seed(0);
        zeroed.update(&[1, 2]);
        // a = 1 + 2 = 3, b = 1 + 3 = 4
        assert_eq!(zeroed.finalize(), (4 << 16) | 3);
    }

    #[test]
    fn steam_checksum() {
        let data = b"some chunk of a cache file";
        let mut adler = Adler32::with_seed(0);
        adler.update(data);
        let mut crc = Crc32::new();
        crc.update(data);
        assert_eq!(SteamChecksum::of(data), adler.finalize() ^ crc.finalize());
    }

    #[test]
    fn md5() {
        let mut sum = Md5::new();
        sum.update(b"abc");
        assert_eq!(
            sum.finalize(),
            [
                0x90, 0x01, 0x50, 0x98, 0x3c, 0xd2, 0x4f, 0xb0, 0xd6, 0x96, 0x3f, 0x7d, 0x28, 0xe1,
                0x7f, 0x72
            ]
        );
    }

    #[test]
    fn digest_in_chunks() {
        let data = vec![0xa5u8; CHUNK_SIZE * 2 + 17];
        let whole = {
            let mut sum = Crc32::new();
            sum.update(&data);
            sum.finalize()
        };
        assert_eq!(digest_reader(&data[..], Crc32::new()).unwrap(), whole);
    }

    #[test]
    fn empty_reader() {
        let data: &[u8] = b"";
        assert_eq!(digest_reader(data, Crc32::new()).unwrap(), 0);
        let mut chunk = [0u8; 4];
        let mut reader = data;
        assert_eq!(read_chunk(&mut reader, &mut chunk).unwrap(), 0);
    }
}
