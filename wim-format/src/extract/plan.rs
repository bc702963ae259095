use std::collections::TryReserveError;

use super::dedup::StreamList;
use super::ExtractFlags;
use crate::error::Result;
use crate::lookup_table::{LookupTable, StreamId};

type SortScratch = Vec<((u16, u64), StreamId)>;

/// Returns the number of streams and bytes an extraction will write.
///
/// In link mode each stream is written once and every further name becomes a
/// link, so only streams not already written by an earlier command count.
/// Otherwise every claiming inode gets its own copy.
pub fn calculate_bytes_to_extract(
    list: &StreamList,
    table: &LookupTable,
    flags: ExtractFlags,
) -> (u64, u64) {
    let mut num_streams = 0;
    let mut total_bytes = 0;
    for &id in list.streams() {
        let stream = table.get(id);
        if flags.is_link_mode() {
            if stream.extracted_file().is_none() {
                num_streams += 1;
                total_bytes += stream.size;
            }
        } else {
            let copies = list.out_refcnt(id) as u64;
            num_streams += copies;
            total_bytes += copies * stream.size;
        }
    }
    (num_streams, total_bytes)
}

/// Stable sort of `streams` by where their bytes live, so a WIM is read
/// front to back.
pub fn sort_streams_by_container_position(
    streams: &mut Vec<StreamId>,
    table: &LookupTable,
) -> Result<()> {
    sort_streams_with(streams, table, |len| {
        let mut scratch = Vec::new();
        scratch.try_reserve_exact(len)?;
        Ok(scratch)
    })
}

pub(crate) fn sort_streams_with<A>(
    streams: &mut Vec<StreamId>,
    table: &LookupTable,
    alloc: A,
) -> Result<()>
where
    A: FnOnce(usize) -> std::result::Result<SortScratch, TryReserveError>,
{
    let mut keyed = alloc(streams.len())?;
    keyed.extend(
        streams
            .iter()
            .map(|&id| (table.get(id).container_position(), id)),
    );
    keyed.sort_by_key(|(pos, _)| *pos);
    streams.clear();
    streams.extend(keyed.into_iter().map(|(_, id)| id));
    Ok(())
}

/// Orders `list` for sequential reads. If that fails the original order is
/// kept and `SEQUENTIAL` is dropped from `flags`.
pub(crate) fn order_for_sequential_reads(
    list: &mut StreamList,
    table: &LookupTable,
    flags: &mut ExtractFlags,
) {
    order_for_sequential_reads_with(list, table, flags, |len| {
        let mut scratch = Vec::new();
        scratch.try_reserve_exact(len)?;
        Ok(scratch)
    })
}

fn order_for_sequential_reads_with<A>(
    list: &mut StreamList,
    table: &LookupTable,
    flags: &mut ExtractFlags,
    alloc: A,
) where
    A: FnOnce(usize) -> std::result::Result<SortScratch, TryReserveError>,
{
    if let Err(err) = sort_streams_with(list.order_mut(), table, alloc) {
        tracing::warn!(error = %err, "Falling back to non-sequential extraction");
        flags.remove(ExtractFlags::SEQUENTIAL);
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use tracing_test::traced_test;

    use super::*;
    use crate::extract::dedup::{find_streams_for_extraction, VisitState};
    use crate::header::ResourceEntry;
    use crate::lookup_table::{Stream, StreamSource};
    use crate::tree::{DentryTree, Inode};
    use crate::{Error, Sha1Hash};

    fn stored(content: &[u8], part: u16, offset: u64) -> Stream {
        let mut stream = Stream::new(
            Sha1Hash::of(content),
            content.len() as u64,
            StreamSource::Wim {
                path: Arc::new(PathBuf::from("test.wim")),
                resource: ResourceEntry::uncompressed(offset, content.len() as u64),
            },
        );
        stream.part_number = part;
        stream
    }

    // /a, /b hard linked to /a, /c with a copy of the same content in its own
    // inode, /big with different content.
    fn fixture() -> (DentryTree, LookupTable) {
        let mut table = LookupTable::new();
        table.insert(stored(b"hello", 1, 500));
        table.insert(stored(b"big content", 1, 208));
        table.insert(Stream::from_buffer(b"buffered".to_vec()));

        let mut tree = DentryTree::new();
        let root = tree.root();
        let mut a = Inode::file();
        a.hash = Sha1Hash::of(b"hello");
        let c = a.clone();
        let a = tree.add_inode(a);
        tree.add_child(root, "a", a).unwrap();
        tree.add_child(root, "b", a).unwrap();
        let c = tree.add_inode(c);
        tree.add_child(root, "c", c).unwrap();
        let mut big = Inode::file();
        big.hash = Sha1Hash::of(b"big content");
        let big = tree.add_inode(big);
        tree.add_child(root, "big", big).unwrap();
        let mut buffered = Inode::file();
        buffered.hash = Sha1Hash::of(b"buffered");
        let buffered = tree.add_inode(buffered);
        tree.add_child(root, "buffered", buffered).unwrap();
        (tree, table)
    }

    fn list_for(tree: &DentryTree, table: &LookupTable) -> StreamList {
        let mut state = VisitState::default();
        find_streams_for_extraction(tree, tree.root(), table, false, &mut state).unwrap()
    }

    #[test]
    fn totals_in_normal_mode() {
        let (tree, table) = fixture();
        let list = list_for(&tree, &table);
        // "hello" is claimed by two inodes.
        assert_eq!(
            calculate_bytes_to_extract(&list, &table, ExtractFlags::empty()),
            (4, 5 * 2 + 11 + 8)
        );
    }

    #[test]
    fn totals_in_link_mode() {
        let (tree, mut table) = fixture();
        let list = list_for(&tree, &table);
        assert_eq!(
            calculate_bytes_to_extract(&list, &table, ExtractFlags::HARDLINK),
            (3, 5 + 11 + 8)
        );

        let big = table.lookup(&Sha1Hash::of(b"big content")).unwrap();
        table.get_mut(big).extracted_file = Some(PathBuf::from("/tmp/big"));
        assert_eq!(
            calculate_bytes_to_extract(&list, &table, ExtractFlags::SYMLINK),
            (2, 5 + 8)
        );
    }

    #[test]
    fn sequential_order() {
        let (tree, table) = fixture();
        let mut list = list_for(&tree, &table);
        sort_streams_by_container_position(list.order_mut(), &table).unwrap();
        let positions: Vec<_> = list
            .streams()
            .iter()
            .map(|&id| table.get(id).container_position())
            .collect();
        assert_eq!(positions, vec![(1, 208), (1, 500), (u16::MAX, u64::MAX)]);
    }

    #[test]
    fn sort_reports_allocation_failure() {
        let (tree, table) = fixture();
        let mut list = list_for(&tree, &table);
        let before = list.streams().to_vec();
        let res = sort_streams_with(list.order_mut(), &table, |_| {
            let mut v = Vec::new();
            v.try_reserve_exact(usize::MAX)?;
            Ok(v)
        });
        assert!(matches!(res, Err(Error::OutOfMemory(_))));
        assert_eq!(list.streams(), &before[..]);
    }

    #[test]
    #[traced_test]
    fn falls_back_to_discovery_order() {
        let (tree, table) = fixture();
        let mut list = list_for(&tree, &table);
        let before = list.streams().to_vec();
        let mut flags = ExtractFlags::SEQUENTIAL | ExtractFlags::VERBOSE;

        order_for_sequential_reads_with(&mut list, &table, &mut flags, |_| {
            let mut v = Vec::new();
            v.try_reserve_exact(usize::MAX)?;
            Ok(v)
        });

        assert_eq!(list.streams(), &before[..]);
        assert_eq!(flags, ExtractFlags::VERBOSE);
        assert!(logs_contain("Falling back to non-sequential extraction"));
    }
}
