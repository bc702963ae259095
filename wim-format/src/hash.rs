//! SHA-1 content hashes and a reader that computes one while data passes through.

use std::fmt;
use std::io::{Read, Result};

use sha1::{Digest, Sha1};

pub const SHA1_LEN: usize = 20;

/// SHA-1 of a stream's uncompressed content. The all-zero hash means "no stream".
#[repr(transparent)]
#[derive(Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sha1Hash(pub [u8; SHA1_LEN]);

impl Sha1Hash {
    pub const ZERO: Sha1Hash = Sha1Hash([0u8; SHA1_LEN]);

    pub fn of(data: &[u8]) -> Sha1Hash {
        let mut hasher = Sha1::new();
        hasher.update(data);
        Sha1Hash::from_hasher(hasher)
    }

    pub(crate) fn from_hasher(hasher: Sha1) -> Sha1Hash {
        let mut out = [0u8; SHA1_LEN];
        out.copy_from_slice(&hasher.finalize());
        Sha1Hash(out)
    }

    #[inline(always)]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; SHA1_LEN]
    }
}

impl fmt::Display for Sha1Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.iter() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Sha1Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha1Hash({})", self)
    }
}

/// A reader wrapper that hashes everything read through it.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha1,
    bytes_read: u64,
}

impl<R> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha1::new(),
            bytes_read: 0,
        }
    }

    /// Get the total number of bytes read through this reader.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn finalize(self) -> Sha1Hash {
        Sha1Hash::from_hasher(self.hasher)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.hasher.update(&buf[..n]);
            self.bytes_read += n as u64;
        }
        Ok(n)
    }
}
