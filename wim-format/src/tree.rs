//! In-memory directory tree of an image.
//!
//! Dentries and inodes live in arenas owned by [`DentryTree`] and are
//! referred to by index. Several dentries may share one inode (hard links).

use std::collections::BTreeMap;
use std::path::PathBuf;

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::lookup_table::{LookupTable, StreamId};
use crate::Sha1Hash;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FileAttributes: u32 {
        const READONLY = 0x0000_0001;
        const HIDDEN = 0x0000_0002;
        const SYSTEM = 0x0000_0004;
        const DIRECTORY = 0x0000_0010;
        const ARCHIVE = 0x0000_0020;
        const NORMAL = 0x0000_0080;
        const SPARSE_FILE = 0x0000_0200;
        const REPARSE_POINT = 0x0000_0400;
        const COMPRESSED = 0x0000_0800;
    }
}

/// Name of the alternate stream that carries uid, gid and mode.
pub const UNIX_DATA_STREAM_NAME: &str = "$$__wimlib_UNIX_data";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DentryId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InodeId(pub(crate) usize);

/// Timestamps in Windows FILETIME units (100ns intervals since 1601).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamps {
    pub creation: u64,
    pub last_access: u64,
    pub last_write: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AltStream {
    pub name: String,
    pub hash: Sha1Hash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub attributes: FileAttributes,
    pub security_id: i32,
    pub timestamps: Timestamps,
    pub hash: Sha1Hash,
    pub reparse_tag: u32,
    pub not_rpfixed: bool,
    pub ads: Vec<AltStream>,
    pub(crate) link_count: u32,
}

impl Inode {
    pub fn new(attributes: FileAttributes) -> Inode {
        Inode {
            attributes,
            security_id: -1,
            timestamps: Timestamps::default(),
            hash: Sha1Hash::ZERO,
            reparse_tag: 0,
            not_rpfixed: false,
            ads: vec![],
            link_count: 0,
        }
    }

    pub fn directory() -> Inode {
        Inode::new(FileAttributes::DIRECTORY)
    }

    pub fn file() -> Inode {
        Inode::new(FileAttributes::NORMAL)
    }

    pub fn is_directory(&self) -> bool {
        self.attributes.contains(FileAttributes::DIRECTORY)
            && !self.attributes.contains(FileAttributes::REPARSE_POINT)
    }

    pub fn is_reparse_point(&self) -> bool {
        self.attributes.contains(FileAttributes::REPARSE_POINT)
    }

    pub fn is_regular_file(&self) -> bool {
        !self.is_directory() && !self.is_reparse_point()
    }

    pub fn link_count(&self) -> u32 {
        self.link_count
    }

    /// Number of stream slots: the unnamed stream plus one per alternate stream.
    pub fn num_streams(&self) -> usize {
        1 + self.ads.len()
    }

    /// Hash of stream slot `index`; 0 is the unnamed stream, `1..` the
    /// alternate streams.
    pub fn stream_hash(&self, index: usize) -> Sha1Hash {
        match index {
            0 => self.hash,
            n => self.ads.get(n - 1).map(|a| a.hash).unwrap_or(Sha1Hash::ZERO),
        }
    }

    /// Resolves stream slot `index` against `table`.
    pub fn resolve_stream(&self, index: usize, table: &LookupTable) -> Result<Option<StreamId>> {
        table.resolve(&self.stream_hash(index))
    }

    pub fn find_ads(&self, name: &str) -> Option<&AltStream> {
        self.ads.iter().find(|a| a.name == name)
    }
}

#[derive(Debug, Clone)]
pub struct Dentry {
    pub name: String,
    pub short_name: String,
    pub inode: InodeId,
    pub(crate) parent: Option<DentryId>,
    pub(crate) children: BTreeMap<String, DentryId>,
}

impl Dentry {
    pub fn parent(&self) -> Option<DentryId> {
        self.parent
    }

    pub fn children(&self) -> impl Iterator<Item = DentryId> + '_ {
        self.children.values().copied()
    }
}

#[derive(Debug, Clone)]
pub struct DentryTree {
    dentries: Vec<Dentry>,
    inodes: Vec<Inode>,
}

impl Default for DentryTree {
    fn default() -> Self {
        DentryTree::new()
    }
}

impl DentryTree {
    /// A tree containing only an unnamed root directory.
    pub fn new() -> DentryTree {
        DentryTree::with_root(Inode::directory())
    }

    pub(crate) fn with_root(mut inode: Inode) -> DentryTree {
        inode.link_count = 1;
        DentryTree {
            dentries: vec![Dentry {
                name: String::new(),
                short_name: String::new(),
                inode: InodeId(0),
                parent: None,
                children: BTreeMap::new(),
            }],
            inodes: vec![inode],
        }
    }

    pub fn root(&self) -> DentryId {
        DentryId(0)
    }

    pub fn dentry(&self, id: DentryId) -> &Dentry {
        &self.dentries[id.0]
    }

    pub fn inode(&self, id: InodeId) -> &Inode {
        &self.inodes[id.0]
    }

    pub fn inode_mut(&mut self, id: InodeId) -> &mut Inode {
        &mut self.inodes[id.0]
    }

    pub fn dentry_inode(&self, id: DentryId) -> &Inode {
        self.inode(self.dentry(id).inode)
    }

    pub fn dentry_count(&self) -> usize {
        self.dentries.len()
    }

    pub fn inode_count(&self) -> usize {
        self.inodes.len()
    }

    pub fn inodes(&self) -> impl Iterator<Item = (InodeId, &Inode)> {
        self.inodes.iter().enumerate().map(|(i, n)| (InodeId(i), n))
    }

    pub fn add_inode(&mut self, inode: Inode) -> InodeId {
        let id = InodeId(self.inodes.len());
        self.inodes.push(Inode {
            link_count: 0,
            ..inode
        });
        id
    }

    /// Links `inode` into directory `parent` under `name`.
    pub fn add_child(&mut self, parent: DentryId, name: &str, inode: InodeId) -> Result<DentryId> {
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
            return Err(Error::InvalidParameter(format!("invalid file name '{}'", name)));
        }
        if !self.dentry_inode(parent).is_directory() {
            return Err(Error::InvalidParameter(format!(
                "'{}' is not a directory",
                self.full_path(parent)
            )));
        }
        if self.dentry(parent).children.contains_key(name) {
            return Err(Error::InvalidParameter(format!(
                "'{}' already exists in '{}'",
                name,
                self.full_path(parent)
            )));
        }

        let id = DentryId(self.dentries.len());
        self.dentries.push(Dentry {
            name: name.to_string(),
            short_name: String::new(),
            inode,
            parent: Some(parent),
            children: BTreeMap::new(),
        });
        self.dentries[parent.0].children.insert(name.to_string(), id);
        self.inodes[inode.0].link_count += 1;
        Ok(id)
    }

    pub(crate) fn set_short_name(&mut self, id: DentryId, short_name: String) {
        self.dentries[id.0].short_name = short_name;
    }

    pub fn child(&self, parent: DentryId, name: &str) -> Option<DentryId> {
        self.dentry(parent).children.get(name).copied()
    }

    /// Looks up a path of `/`-separated components starting at the root.
    /// The empty path and `/` name the root.
    pub fn lookup(&self, path: &str) -> Option<DentryId> {
        let mut cur = self.root();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            cur = self.child(cur, component)?;
        }
        Some(cur)
    }

    /// Absolute image path, `/` for the root.
    pub fn full_path(&self, id: DentryId) -> String {
        let mut names = vec![];
        let mut cur = id;
        while let Some(parent) = self.dentry(cur).parent {
            names.push(self.dentry(cur).name.as_str());
            cur = parent;
        }
        if names.is_empty() {
            return "/".to_string();
        }
        names.reverse();
        let mut out = String::new();
        for name in names {
            out.push('/');
            out.push_str(name);
        }
        out
    }

    /// Path of `id` relative to its ancestor `base`, as a native path.
    pub fn relative_path(&self, base: DentryId, id: DentryId) -> PathBuf {
        let mut names = vec![];
        let mut cur = id;
        while cur != base {
            let dentry = self.dentry(cur);
            names.push(dentry.name.as_str());
            match dentry.parent {
                Some(p) => cur = p,
                None => break,
            }
        }
        names.iter().rev().collect()
    }

    /// Dentries below and including `start`, parents before children.
    pub fn preorder(&self, start: DentryId) -> Vec<DentryId> {
        let mut out = vec![];
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            out.push(id);
            // Reverse so children come out in name order.
            stack.extend(self.dentry(id).children.values().rev().copied());
        }
        out
    }

    /// Dentries below and including `start`, children before parents.
    pub fn postorder(&self, start: DentryId) -> Vec<DentryId> {
        let mut out = self.preorder_mirrored(start);
        out.reverse();
        out
    }

    // Root, then children in reverse name order; reversing this yields a
    // post-order walk with children in name order.
    fn preorder_mirrored(&self, start: DentryId) -> Vec<DentryId> {
        let mut out = vec![];
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.dentry(id).children.values().copied());
        }
        out
    }

    /// Dentries below and including `start` in breadth-first order.
    pub fn breadth_first(&self, start: DentryId) -> Vec<DentryId> {
        let mut out = vec![start];
        let mut i = 0;
        while i < out.len() {
            let id = out[i];
            out.extend(self.dentry(id).children.values().copied());
            i += 1;
        }
        out
    }

    /// Pre-order walk that stops at the first callback error.
    pub fn for_each_preorder<F>(&self, start: DentryId, mut f: F) -> Result<()>
    where
        F: FnMut(DentryId) -> Result<()>,
    {
        self.preorder(start).into_iter().try_for_each(|id| f(id))
    }

    /// Post-order walk that stops at the first callback error.
    pub fn for_each_postorder<F>(&self, start: DentryId, mut f: F) -> Result<()>
    where
        F: FnMut(DentryId) -> Result<()>,
    {
        self.postorder(start).into_iter().try_for_each(|id| f(id))
    }

    /// Number of directories, root included.
    pub fn dir_count(&self) -> u64 {
        self.dentries
            .iter()
            .filter(|d| self.inode(d.inode).is_directory())
            .count() as u64
    }

    pub fn file_count(&self) -> u64 {
        self.dentries.len() as u64 - self.dir_count()
    }
}
