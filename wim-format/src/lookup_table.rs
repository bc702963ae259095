//! The stream table: every distinct piece of content, addressed by SHA-1.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::header::{ResourceEntry, ResourceFlags, WimHeader};
use crate::Sha1Hash;

/// On-disk lookup table record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupTableEntry {
    pub resource: ResourceEntry,
    pub part_number: u16,
    pub refcnt: u32,
    pub hash: Sha1Hash,
}

impl LookupTableEntry {
    pub(crate) const DISK_SIZE: u64 = 50;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(pub(crate) usize);

/// Where the bytes of a stream currently live.
#[derive(Debug, Clone)]
pub enum StreamSource {
    /// A resource inside a WIM file on disk (possibly another part of a split set).
    Wim {
        path: Arc<PathBuf>,
        resource: ResourceEntry,
    },
    /// Content added in memory.
    Buffer(Arc<[u8]>),
    /// Content captured from a file that is read again when written out.
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct Stream {
    pub hash: Sha1Hash,
    pub size: u64,
    pub source: StreamSource,
    pub refcnt: u32,
    pub part_number: u16,
    pub(crate) extracted_file: Option<PathBuf>,
}

impl Stream {
    pub fn new(hash: Sha1Hash, size: u64, source: StreamSource) -> Stream {
        Stream {
            hash,
            size,
            source,
            refcnt: 1,
            part_number: 1,
            extracted_file: None,
        }
    }

    pub fn from_buffer(data: impl Into<Arc<[u8]>>) -> Stream {
        let data = data.into();
        Stream::new(
            Sha1Hash::of(&data),
            data.len() as u64,
            StreamSource::Buffer(data),
        )
    }

    /// Set while a link-mode extraction batch has already written this
    /// stream's content to a concrete file.
    pub fn extracted_file(&self) -> Option<&Path> {
        self.extracted_file.as_deref()
    }

    /// Sort key for reading streams in ascending on-disk order. Streams not
    /// stored in a WIM sort after every stored one.
    pub fn container_position(&self) -> (u16, u64) {
        match &self.source {
            StreamSource::Wim { resource, .. } => (self.part_number, resource.offset),
            _ => (u16::MAX, u64::MAX),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct LookupTable {
    streams: Vec<Stream>,
    by_hash: HashMap<Sha1Hash, StreamId>,
    merge_base: Option<usize>,
}

impl LookupTable {
    pub fn new() -> LookupTable {
        LookupTable::default()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn lookup(&self, hash: &Sha1Hash) -> Option<StreamId> {
        self.by_hash.get(hash).copied()
    }

    /// Resolves a hash referenced by an inode. The zero hash means the slot
    /// carries no content and resolves to `None`.
    pub fn resolve(&self, hash: &Sha1Hash) -> Result<Option<StreamId>> {
        if hash.is_zero() {
            return Ok(None);
        }
        match self.lookup(hash) {
            Some(id) => Ok(Some(id)),
            None => Err(Error::StreamNotFound(*hash)),
        }
    }

    pub fn get(&self, id: StreamId) -> &Stream {
        &self.streams[id.0]
    }

    pub(crate) fn get_mut(&mut self, id: StreamId) -> &mut Stream {
        &mut self.streams[id.0]
    }

    /// Inserts `stream`, or bumps the refcount of the stream already stored
    /// under the same hash.
    pub fn insert(&mut self, stream: Stream) -> StreamId {
        if let Some(id) = self.lookup(&stream.hash) {
            let existing = &mut self.streams[id.0];
            existing.refcnt = existing.refcnt.saturating_add(stream.refcnt);
            return id;
        }
        let id = StreamId(self.streams.len());
        self.by_hash.insert(stream.hash, id);
        self.streams.push(stream);
        id
    }

    pub fn iter(&self) -> impl Iterator<Item = (StreamId, &Stream)> {
        self.streams
            .iter()
            .enumerate()
            .map(|(i, s)| (StreamId(i), s))
    }

    pub(crate) fn clear_extracted_files(&mut self) {
        for stream in self.streams.iter_mut() {
            stream.extracted_file = None;
        }
    }

    /// Builds the table from on-disk records. Metadata resources are not
    /// streams in this model and are returned separately, in image order.
    pub(crate) fn from_entries(
        path: &Arc<PathBuf>,
        entries: Vec<LookupTableEntry>,
    ) -> (LookupTable, Vec<LookupTableEntry>) {
        let mut table = LookupTable::new();
        let mut metadata = vec![];
        for entry in entries {
            if entry.resource.flags.contains(ResourceFlags::METADATA) {
                metadata.push(entry);
                continue;
            }
            if table.lookup(&entry.hash).is_some() {
                tracing::warn!(hash = %entry.hash, "duplicate lookup table entry ignored");
                continue;
            }
            let stream = Stream {
                hash: entry.hash,
                size: entry.resource.original_size,
                source: StreamSource::Wim {
                    path: Arc::clone(path),
                    resource: entry.resource,
                },
                refcnt: entry.refcnt,
                part_number: entry.part_number,
                extracted_file: None,
            };
            table.insert(stream);
        }
        (table, metadata)
    }

    /// Temporarily adds the streams of another split part. Undone by
    /// [`LookupTable::unmerge`].
    pub(crate) fn merge(&mut self, other: &LookupTable) {
        if self.merge_base.is_none() {
            self.merge_base = Some(self.streams.len());
        }
        for stream in other.streams.iter() {
            if self.lookup(&stream.hash).is_none() {
                let mut stream = stream.clone();
                stream.extracted_file = None;
                let id = StreamId(self.streams.len());
                self.by_hash.insert(stream.hash, id);
                self.streams.push(stream);
            }
        }
    }

    pub(crate) fn unmerge(&mut self) {
        let Some(base) = self.merge_base.take() else {
            return;
        };
        for stream in self.streams.drain(base..) {
            self.by_hash.remove(&stream.hash);
        }
    }
}

/// Checks that `primary` and `parts` together form one complete split set.
pub(crate) fn verify_split_set(primary: &WimHeader, parts: &[&WimHeader]) -> Result<()> {
    let total = primary.total_parts as usize;
    if parts.len() + 1 != total {
        return Err(Error::SplitSetMismatch(format!(
            "expected {} parts, got {}",
            total,
            parts.len() + 1
        )));
    }

    let mut seen = vec![false; total + 1];
    for header in std::iter::once(primary).chain(parts.iter().copied()) {
        if header.guid != primary.guid {
            return Err(Error::SplitSetMismatch(
                "parts belong to different WIMs".into(),
            ));
        }
        if header.total_parts != primary.total_parts {
            return Err(Error::SplitSetMismatch(
                "parts disagree on the number of parts".into(),
            ));
        }
        let part = header.part_number as usize;
        if part == 0 || part > total || seen[part] {
            return Err(Error::SplitSetMismatch(format!(
                "part {} is invalid or duplicated",
                part
            )));
        }
        seen[part] = true;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_deduplicates_by_hash() {
        let mut table = LookupTable::new();
        let a = table.insert(Stream::from_buffer(b"same".to_vec()));
        let b = table.insert(Stream::from_buffer(b"same".to_vec()));
        let c = table.insert(Stream::from_buffer(b"other".to_vec()));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(a).refcnt, 2);
    }

    #[test]
    fn resolve_zero_and_missing() {
        let table = LookupTable::new();
        assert!(table.resolve(&Sha1Hash::ZERO).unwrap().is_none());
        match table.resolve(&Sha1Hash::of(b"nope")) {
            Err(Error::StreamNotFound(_)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn merge_and_unmerge() {
        let mut primary = LookupTable::new();
        primary.insert(Stream::from_buffer(b"one".to_vec()));
        let mut part = LookupTable::new();
        part.insert(Stream::from_buffer(b"one".to_vec()));
        part.insert(Stream::from_buffer(b"two".to_vec()));

        primary.merge(&part);
        assert_eq!(primary.len(), 2);
        assert!(primary.lookup(&Sha1Hash::of(b"two")).is_some());

        primary.unmerge();
        assert_eq!(primary.len(), 1);
        assert!(primary.lookup(&Sha1Hash::of(b"two")).is_none());
        assert!(primary.lookup(&Sha1Hash::of(b"one")).is_some());
    }

    #[test]
    fn split_set_validation() {
        let mut first = WimHeader::new();
        first.total_parts = 2;
        let mut second = first.clone();
        second.part_number = 2;

        verify_split_set(&first, &[&second]).unwrap();
        assert!(verify_split_set(&first, &[]).is_err());
        assert!(verify_split_set(&first, &[&first]).is_err());

        let mut stranger = second.clone();
        stranger.guid[0] ^= 0xff;
        assert!(verify_split_set(&first, &[&stranger]).is_err());
    }

    #[test]
    fn non_wim_streams_sort_last() {
        let stored = Stream {
            part_number: 1,
            ..Stream::new(
                Sha1Hash::of(b"x"),
                1,
                StreamSource::Wim {
                    path: Arc::new(PathBuf::from("a.wim")),
                    resource: ResourceEntry::uncompressed(4096, 1),
                },
            )
        };
        let buffered = Stream::from_buffer(b"y".to_vec());
        assert!(stored.container_position() < buffered.container_position());
    }
}
