//! Building new images, either by hand or from files on disk.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::fs::{attributes_from_metadata, now_filetime, timestamps_from_metadata, UnixData};
use crate::hash::HashingReader;
use crate::lookup_table::{Stream, StreamSource};
use crate::metadata::SecurityData;
use crate::reparse::{fixup_target, ReparseData, IO_REPARSE_TAG_SYMLINK};
use crate::tree::{
    AltStream, DentryId, DentryTree, FileAttributes, Inode, Timestamps, UNIX_DATA_STREAM_NAME,
};
use crate::Sha1Hash;

/// A new image being assembled before it is added with
/// [`Wim::add_image`](crate::Wim::add_image).
#[derive(Debug)]
pub struct ImageBuilder {
    pub(crate) tree: DentryTree,
    pub(crate) streams: Vec<Stream>,
    pub(crate) security: SecurityData,
    pub(crate) rpfix_root: Option<PathBuf>,
    capture_unix_data: bool,
    seen: HashSet<Sha1Hash>,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        ImageBuilder::new()
    }
}

/// Hashes the content of the file at `path`.
pub fn hash_file(path: &Path) -> Result<(Sha1Hash, u64)> {
    let file = File::open(path).map_err(|e| Error::Open(e, path.to_path_buf()))?;
    let mut reader = HashingReader::new(file);
    io::copy(&mut reader, &mut io::sink()).map_err(|e| Error::Read(e, path.to_path_buf()))?;
    let size = reader.bytes_read();
    Ok((reader.finalize(), size))
}

fn new_inode(attributes: FileAttributes) -> Inode {
    let now = now_filetime();
    let mut inode = Inode::new(attributes);
    inode.timestamps = Timestamps {
        creation: now,
        last_access: now,
        last_write: now,
    };
    inode
}

impl ImageBuilder {
    pub fn new() -> ImageBuilder {
        let mut tree = DentryTree::new();
        let root = tree.dentry(tree.root()).inode;
        tree.inode_mut(root).timestamps = new_inode(FileAttributes::DIRECTORY).timestamps;
        ImageBuilder {
            tree,
            streams: vec![],
            security: SecurityData::default(),
            rpfix_root: None,
            capture_unix_data: false,
            seen: HashSet::new(),
        }
    }

    /// Rewrites absolute symlink targets inside `capture_root` to be
    /// relative to the image root, and marks the image as fixed up.
    pub fn with_reparse_fixup(mut self, capture_root: impl Into<PathBuf>) -> ImageBuilder {
        self.rpfix_root = Some(capture_root.into());
        self
    }

    /// Records ownership and mode of captured files.
    pub fn with_unix_data(mut self, enabled: bool) -> ImageBuilder {
        self.capture_unix_data = enabled;
        self
    }

    #[inline(always)]
    pub fn root(&self) -> DentryId {
        self.tree.root()
    }

    #[inline(always)]
    pub fn tree(&self) -> &DentryTree {
        &self.tree
    }

    fn add_stream(&mut self, stream: Stream) -> Sha1Hash {
        if stream.size == 0 {
            return Sha1Hash::ZERO;
        }
        let hash = stream.hash;
        if self.seen.insert(hash) {
            self.streams.push(stream);
        }
        hash
    }

    fn add_inode(&mut self, parent: DentryId, name: &str, inode: Inode) -> Result<DentryId> {
        let inode = self.tree.add_inode(inode);
        self.tree.add_child(parent, name, inode)
    }

    pub fn add_directory(&mut self, parent: DentryId, name: &str) -> Result<DentryId> {
        self.add_inode(parent, name, new_inode(FileAttributes::DIRECTORY))
    }

    pub fn add_file(
        &mut self,
        parent: DentryId,
        name: &str,
        data: impl Into<Vec<u8>>,
    ) -> Result<DentryId> {
        let mut inode = new_inode(FileAttributes::NORMAL);
        inode.hash = self.add_stream(Stream::from_buffer(data.into()));
        self.add_inode(parent, name, inode)
    }

    /// Adds a file whose content is read from `path` when the WIM is written.
    pub fn add_file_from_path(
        &mut self,
        parent: DentryId,
        name: &str,
        path: &Path,
    ) -> Result<DentryId> {
        let (hash, size) = hash_file(path)?;
        self.add_prehashed_file(parent, name, path, hash, size)
    }

    /// Like [`ImageBuilder::add_file_from_path`] for content that was
    /// already hashed, for example in parallel.
    pub fn add_prehashed_file(
        &mut self,
        parent: DentryId,
        name: &str,
        path: &Path,
        hash: Sha1Hash,
        size: u64,
    ) -> Result<DentryId> {
        let mut inode = new_inode(FileAttributes::NORMAL);
        let source = StreamSource::File(path.to_path_buf());
        inode.hash = self.add_stream(Stream::new(hash, size, source));
        self.add_inode(parent, name, inode)
    }

    /// Adds another name for the inode of `existing`.
    pub fn add_hard_link(
        &mut self,
        parent: DentryId,
        name: &str,
        existing: DentryId,
    ) -> Result<DentryId> {
        let inode = self.tree.dentry(existing).inode;
        if self.tree.inode(inode).is_directory() {
            return Err(Error::InvalidParameter(format!(
                "cannot hard link directory '{}'",
                self.tree.full_path(existing)
            )));
        }
        self.tree.add_child(parent, name, inode)
    }

    pub fn add_symlink(&mut self, parent: DentryId, name: &str, target: &str) -> Result<DentryId> {
        let fixed = self
            .rpfix_root
            .as_deref()
            .and_then(|root| fixup_target(target, root));
        let not_rpfixed = fixed.is_none();
        let data = ReparseData::from_unix_target(fixed.as_deref().unwrap_or(target)).to_bytes()?;

        let mut inode = new_inode(FileAttributes::REPARSE_POINT);
        inode.reparse_tag = IO_REPARSE_TAG_SYMLINK;
        inode.not_rpfixed = not_rpfixed;
        inode.hash = self.add_stream(Stream::from_buffer(data));
        self.add_inode(parent, name, inode)
    }

    pub fn add_alternate_stream(
        &mut self,
        dentry: DentryId,
        name: &str,
        data: impl Into<Vec<u8>>,
    ) -> Result<()> {
        let inode = self.tree.dentry(dentry).inode;
        if name.is_empty() || self.tree.inode(inode).find_ads(name).is_some() {
            return Err(Error::InvalidParameter(format!(
                "invalid or duplicate stream name '{}'",
                name
            )));
        }
        let hash = self.add_stream(Stream::from_buffer(data.into()));
        self.tree.inode_mut(inode).ads.push(AltStream {
            name: name.to_string(),
            hash,
        });
        Ok(())
    }

    pub fn set_timestamps(&mut self, dentry: DentryId, timestamps: Timestamps) {
        let inode = self.tree.dentry(dentry).inode;
        self.tree.inode_mut(inode).timestamps = timestamps;
    }

    pub fn set_unix_data(&mut self, dentry: DentryId, data: UnixData) {
        let hash = self.add_stream(Stream::from_buffer(data.to_bytes()));
        let inode = self.tree.dentry(dentry).inode;
        let inode = self.tree.inode_mut(inode);
        match inode.ads.iter_mut().find(|a| a.name == UNIX_DATA_STREAM_NAME) {
            Some(ads) => ads.hash = hash,
            None => inode.ads.push(AltStream {
                name: UNIX_DATA_STREAM_NAME.to_string(),
                hash,
            }),
        }
    }

    /// Adds the file, directory or symlink at `path` as `name` without
    /// descending into directories.
    pub fn add_path(&mut self, parent: DentryId, name: &str, path: &Path) -> Result<DentryId> {
        let meta = fs::symlink_metadata(path).map_err(|e| Error::Stat(e, path.to_path_buf()))?;
        let file_type = meta.file_type();
        let id = if file_type.is_symlink() {
            let target = fs::read_link(path).map_err(|e| Error::Read(e, path.to_path_buf()))?;
            let target = target.to_str().ok_or_else(|| {
                Error::InvalidParameter(format!("{}: link target is not UTF-8", path.display()))
            })?;
            self.add_symlink(parent, name, target)?
        } else if file_type.is_dir() {
            self.add_directory(parent, name)?
        } else {
            self.add_file_from_path(parent, name, path)?
        };
        self.apply_metadata(id, &meta);
        Ok(id)
    }

    /// Copies timestamps, attributes and, if enabled, UNIX data from `meta`.
    pub fn apply_metadata(&mut self, dentry: DentryId, meta: &fs::Metadata) {
        let inode = self.tree.dentry(dentry).inode;
        {
            let inode = self.tree.inode_mut(inode);
            inode.timestamps = timestamps_from_metadata(meta);
            if !inode.is_reparse_point() {
                inode.attributes = attributes_from_metadata(meta);
            }
        }
        #[cfg(unix)]
        if self.capture_unix_data {
            self.set_unix_data(dentry, UnixData::from_metadata(meta));
        }
    }
}
