//! Integrity table: SHA-1 of every 10 MiB chunk between the header and the
//! end of the lookup table.

use std::fs::File;
use std::io::{prelude::*, SeekFrom};

use byteorder::{ByteOrder, LittleEndian};
use memmap2::MmapOptions;
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::hash::SHA1_LEN;
use crate::header::HEADER_SIZE;
use crate::Sha1Hash;

pub const INTEGRITY_CHUNK_SIZE: u32 = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityTable {
    pub chunk_size: u32,
    pub hashes: Vec<Sha1Hash>,
}

impl IntegrityTable {
    /// Hashes `[HEADER_SIZE, end)` of `reader` in chunks.
    pub fn compute<R: Read + Seek>(reader: &mut R, end: u64) -> std::io::Result<IntegrityTable> {
        let start = HEADER_SIZE as u64;
        reader.seek(SeekFrom::Start(start))?;
        let mut hashes = vec![];
        let mut remaining = end.saturating_sub(start);
        let mut buf = vec![0u8; 64 * 1024];
        while remaining > 0 {
            let chunk = remaining.min(INTEGRITY_CHUNK_SIZE as u64);
            let mut hasher = Sha1::new();
            let mut left = chunk;
            while left > 0 {
                let n = left.min(buf.len() as u64) as usize;
                reader.read_exact(&mut buf[..n])?;
                hasher.update(&buf[..n]);
                left -= n as u64;
            }
            hashes.push(Sha1Hash::from_hasher(hasher));
            remaining -= chunk;
        }
        Ok(IntegrityTable {
            chunk_size: INTEGRITY_CHUNK_SIZE,
            hashes,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let size = 12 + SHA1_LEN * self.hashes.len();
        let mut out = Vec::with_capacity(size);
        out.extend_from_slice(&(size as u32).to_le_bytes());
        out.extend_from_slice(&(self.hashes.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.chunk_size.to_le_bytes());
        for hash in self.hashes.iter() {
            out.extend_from_slice(&hash.0);
        }
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<IntegrityTable> {
        if buf.len() < 12 {
            return Err(Error::invalid_data("integrity table too short"));
        }
        let size = LittleEndian::read_u32(&buf[0..4]) as usize;
        let count = LittleEndian::read_u32(&buf[4..8]) as usize;
        let chunk_size = LittleEndian::read_u32(&buf[8..12]);
        let expected = count.checked_mul(SHA1_LEN).and_then(|n| n.checked_add(12));
        if chunk_size == 0 || size != buf.len() || expected != Some(size) {
            return Err(Error::invalid_data("integrity table size mismatch"));
        }
        let hashes = buf[12..]
            .chunks_exact(SHA1_LEN)
            .map(|c| {
                let mut h = Sha1Hash::ZERO;
                h.0.copy_from_slice(c);
                h
            })
            .collect();
        Ok(IntegrityTable { chunk_size, hashes })
    }

    /// Verifies `[HEADER_SIZE, end)` of `file` against the table.
    pub fn verify(&self, file: &File, end: u64) -> Result<()> {
        let start = HEADER_SIZE as u64;
        let len = end.saturating_sub(start);
        let expected_chunks = len.div_ceil(self.chunk_size as u64);
        if expected_chunks != self.hashes.len() as u64 {
            return Err(Error::invalid_data(format!(
                "integrity table has {} entries, expected {}",
                self.hashes.len(),
                expected_chunks
            )));
        }
        if len == 0 {
            return Ok(());
        }

        let map = unsafe {
            MmapOptions::new()
                .offset(start)
                .len(len as usize)
                .map(file)
        }
        .map_err(|e| Error::Read(e, "<integrity>".into()))?;

        for (i, (chunk, expected)) in map
            .chunks(self.chunk_size as usize)
            .zip(self.hashes.iter())
            .enumerate()
        {
            if Sha1Hash::of(chunk) != *expected {
                tracing::error!(chunk = i, "integrity check failed");
                return Err(Error::IntegrityMismatch { chunk: i as u32 });
            }
        }
        Ok(())
    }
}
