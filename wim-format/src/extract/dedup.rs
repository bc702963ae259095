//! Finds the distinct streams a subtree needs and which dentries use them.

use std::collections::{HashMap, HashSet};

use crate::error::Result;
use crate::lookup_table::{LookupTable, StreamId};
use crate::tree::{DentryId, DentryTree, InodeId};

/// Per-operation visit state. Kept outside the tree so the tree itself is
/// never mutated by an extraction.
#[derive(Debug, Default)]
pub struct VisitState {
    needs_extraction: HashSet<DentryId>,
    visited: HashSet<InodeId>,
}

impl VisitState {
    pub fn needs_extraction(&self, dentry: DentryId) -> bool {
        self.needs_extraction.contains(&dentry)
    }

    pub fn is_visited(&self, inode: InodeId) -> bool {
        self.visited.contains(&inode)
    }

    pub(crate) fn mark_extracted(&mut self, dentry: DentryId) {
        self.needs_extraction.remove(&dentry);
    }

    pub fn reset(&mut self) {
        self.needs_extraction.clear();
        self.visited.clear();
    }

    pub fn is_clean(&self) -> bool {
        self.needs_extraction.is_empty() && self.visited.is_empty()
    }
}

/// Streams to extract, in discovery order, with their fan-out lists.
#[derive(Debug, Default)]
pub struct StreamList {
    order: Vec<StreamId>,
    fan_out: HashMap<StreamId, Vec<DentryId>>,
    out_refcnt: HashMap<StreamId, u32>,
    resolved: HashMap<InodeId, Vec<Option<StreamId>>>,
}

impl StreamList {
    pub fn streams(&self) -> &[StreamId] {
        &self.order
    }

    pub(crate) fn order_mut(&mut self) -> &mut Vec<StreamId> {
        &mut self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn fan_out(&self, stream: StreamId) -> &[DentryId] {
        self.fan_out.get(&stream).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of distinct inodes that claimed `stream` during this pass.
    pub fn out_refcnt(&self, stream: StreamId) -> u32 {
        self.out_refcnt.get(&stream).copied().unwrap_or(0)
    }

    /// Stream resolved for slot `index` of `inode`; 0 is the unnamed stream.
    pub fn resolved(&self, inode: InodeId, index: usize) -> Option<StreamId> {
        self.resolved
            .get(&inode)
            .and_then(|slots| slots.get(index).copied().flatten())
    }

    fn claim(&mut self, stream: StreamId) {
        let count = self.out_refcnt.entry(stream).or_insert(0);
        *count += 1;
        if *count == 1 {
            self.order.push(stream);
            self.fan_out.entry(stream).or_default();
        }
    }
}

/// Builds the stream list for the subtree at `root`.
///
/// Every dentry is marked as needing extraction. A shared inode claims its
/// streams once but every one of its names joins the fan-out list of its
/// first stream. Named alternate streams are only considered when
/// `include_ads` is set.
pub fn find_streams_for_extraction(
    tree: &DentryTree,
    root: DentryId,
    table: &LookupTable,
    include_ads: bool,
    state: &mut VisitState,
) -> Result<StreamList> {
    let dentries = tree.preorder(root);
    let mut list = StreamList::default();

    // Resolve every stream slot first; refcounts start from zero each pass.
    for &dentry in dentries.iter() {
        let inode_id = tree.dentry(dentry).inode;
        if list.resolved.contains_key(&inode_id) {
            continue;
        }
        let inode = tree.inode(inode_id);
        let mut slots = Vec::with_capacity(inode.num_streams());
        for index in 0..inode.num_streams() {
            slots.push(inode.resolve_stream(index, table)?);
        }
        list.resolved.insert(inode_id, slots);
    }

    for &dentry in dentries.iter() {
        state.needs_extraction.insert(dentry);

        let inode_id = tree.dentry(dentry).inode;
        let inode = tree.inode(inode_id);
        let first_visit = !state.visited.contains(&inode_id);
        let mut dentry_added = false;

        if let Some(stream) = list.resolved(inode_id, 0) {
            if first_visit {
                list.claim(stream);
            }
            list.fan_out.entry(stream).or_default().push(dentry);
            dentry_added = true;
        }

        if include_ads {
            for (i, ads) in inode.ads.iter().enumerate() {
                if ads.name.is_empty() {
                    continue;
                }
                if let Some(stream) = list.resolved(inode_id, i + 1) {
                    if first_visit {
                        list.claim(stream);
                    }
                    if !dentry_added {
                        list.fan_out.entry(stream).or_default().push(dentry);
                        dentry_added = true;
                    }
                }
            }
        }

        state.visited.insert(inode_id);
    }

    tracing::debug!(
        streams = list.len(),
        dentries = dentries.len(),
        "found streams for extraction"
    );
    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup_table::Stream;
    use crate::tree::{AltStream, Inode};
    use crate::{Error, Sha1Hash};

    struct Fixture {
        tree: DentryTree,
        table: LookupTable,
    }

    fn file_with(table: &mut LookupTable, content: &[u8]) -> Inode {
        table.insert(Stream::from_buffer(content.to_vec()));
        let mut inode = Inode::file();
        inode.hash = Sha1Hash::of(content);
        inode
    }

    // /a and /dir/b are hard links, /c has the same content as /a in a
    // separate inode, /d carries an alternate stream, /empty has no content.
    fn fixture() -> Fixture {
        let mut table = LookupTable::new();
        let mut tree = DentryTree::new();
        let root = tree.root();

        let shared = file_with(&mut table, b"shared");
        let shared = tree.add_inode(shared);
        tree.add_child(root, "a", shared).unwrap();
        let dir = tree.add_inode(Inode::directory());
        let dir = tree.add_child(root, "dir", dir).unwrap();
        tree.add_child(dir, "b", shared).unwrap();

        let copy = file_with(&mut table, b"shared");
        let copy = tree.add_inode(copy);
        tree.add_child(root, "c", copy).unwrap();

        let mut with_ads = file_with(&mut table, b"main");
        table.insert(Stream::from_buffer(b"side".to_vec()));
        with_ads.ads.push(AltStream {
            name: "side".into(),
            hash: Sha1Hash::of(b"side"),
        });
        let with_ads = tree.add_inode(with_ads);
        tree.add_child(root, "d", with_ads).unwrap();

        let empty = tree.add_inode(Inode::file());
        tree.add_child(root, "empty", empty).unwrap();

        Fixture { tree, table }
    }

    #[test]
    fn streams_are_listed_once() {
        let f = fixture();
        let mut state = VisitState::default();
        let list =
            find_streams_for_extraction(&f.tree, f.tree.root(), &f.table, false, &mut state)
                .unwrap();

        // "shared" and "main"; the alternate stream is excluded.
        assert_eq!(list.len(), 2);
        let shared = f.table.lookup(&Sha1Hash::of(b"shared")).unwrap();
        let mut unique = list.streams().to_vec();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), list.len());

        // Two inodes claim "shared": the hard linked pair counts once.
        assert_eq!(list.out_refcnt(shared), 2);
        let names: Vec<String> = list
            .fan_out(shared)
            .iter()
            .map(|&d| f.tree.full_path(d))
            .collect();
        assert_eq!(names, vec!["/a", "/c", "/dir/b"]);
    }

    #[test]
    fn alternate_streams_when_enabled() {
        let f = fixture();
        let mut state = VisitState::default();
        let list =
            find_streams_for_extraction(&f.tree, f.tree.root(), &f.table, true, &mut state)
                .unwrap();
        assert_eq!(list.len(), 3);

        let side = f.table.lookup(&Sha1Hash::of(b"side")).unwrap();
        let main = f.table.lookup(&Sha1Hash::of(b"main")).unwrap();
        assert_eq!(list.out_refcnt(side), 1);
        // The dentry joins only the fan-out of its first stream.
        assert!(list.fan_out(side).is_empty());
        assert_eq!(list.fan_out(main).len(), 1);
    }

    #[test]
    fn marks_every_dentry() {
        let f = fixture();
        let mut state = VisitState::default();
        find_streams_for_extraction(&f.tree, f.tree.root(), &f.table, false, &mut state).unwrap();
        for id in f.tree.preorder(f.tree.root()) {
            assert!(state.needs_extraction(id));
            assert!(state.is_visited(f.tree.dentry(id).inode));
        }
        state.reset();
        assert!(state.is_clean());
    }

    #[test]
    fn subtree_only() {
        let f = fixture();
        let dir = f.tree.lookup("/dir").unwrap();
        let mut state = VisitState::default();
        let list = find_streams_for_extraction(&f.tree, dir, &f.table, false, &mut state).unwrap();
        assert_eq!(list.len(), 1);
        let shared = f.table.lookup(&Sha1Hash::of(b"shared")).unwrap();
        assert_eq!(list.out_refcnt(shared), 1);
        assert!(!state.needs_extraction(f.tree.lookup("/a").unwrap()));
    }

    #[test]
    fn missing_stream_is_an_error() {
        let mut tree = DentryTree::new();
        let mut inode = Inode::file();
        inode.hash = Sha1Hash::of(b"absent");
        let inode = tree.add_inode(inode);
        let root = tree.root();
        tree.add_child(root, "x", inode).unwrap();

        let mut state = VisitState::default();
        let res = find_streams_for_extraction(&tree, root, &LookupTable::new(), false, &mut state);
        assert!(matches!(res, Err(Error::StreamNotFound(_))));
    }
}
