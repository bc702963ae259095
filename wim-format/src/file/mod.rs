use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::builder::ImageBuilder;
use crate::compression::Compression;
use crate::error::{Error, Result};
use crate::fs::now_filetime;
use crate::header::{HeaderFlags, ResourceEntry, WimHeader};
use crate::lookup_table::{LookupTable, LookupTableEntry};
use crate::metadata::SecurityData;
use crate::tree::DentryTree;
use crate::xml::{ImageInfo, WimInfo};

pub mod reader;
pub mod writer;

pub use self::writer::WriteFlags;

/// Which images an operation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSelector {
    All,
    /// 1-based image index.
    Index(u32),
}

/// Where an image's metadata resource was read from.
#[derive(Debug, Clone)]
pub(crate) struct MetadataSource {
    pub path: Arc<PathBuf>,
    pub entry: LookupTableEntry,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ImageMetadata {
    /// Loaded on first use.
    pub tree: Option<DentryTree>,
    pub security: SecurityData,
    pub source: Option<MetadataSource>,
}

/// An open WIM file, or a new one that has not been written yet.
///
/// No file handle is kept open between calls.
#[derive(Debug)]
pub struct Wim {
    pub(crate) path: Option<PathBuf>,
    pub(crate) header: WimHeader,
    pub(crate) lookup_table: LookupTable,
    pub(crate) info: WimInfo,
    pub(crate) images: Vec<ImageMetadata>,
    /// Set once streams or images changed and only a full rewrite will do.
    pub(crate) content_modified: bool,
}

impl Default for Wim {
    fn default() -> Self {
        Wim::new()
    }
}

impl Wim {
    /// An empty WIM with no images.
    pub fn new() -> Wim {
        Wim {
            path: None,
            header: WimHeader::new(),
            lookup_table: LookupTable::new(),
            info: WimInfo::default(),
            images: vec![],
            content_modified: false,
        }
    }

    #[inline(always)]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[inline(always)]
    pub fn header(&self) -> &WimHeader {
        &self.header
    }

    #[inline(always)]
    pub fn lookup_table(&self) -> &LookupTable {
        &self.lookup_table
    }

    #[inline(always)]
    pub fn info(&self) -> &WimInfo {
        &self.info
    }

    #[inline(always)]
    pub fn compression(&self) -> Compression {
        Compression::from_header_flags(self.header.flags)
    }

    #[inline(always)]
    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    #[inline(always)]
    pub fn boot_index(&self) -> u32 {
        self.header.boot_index
    }

    pub(crate) fn check_image(&self, image: u32) -> Result<usize> {
        if image == 0 || image > self.image_count() {
            tracing::error!(image, count = self.image_count(), "Invalid image index");
            return Err(Error::InvalidImage(image));
        }
        Ok((image - 1) as usize)
    }

    /// Marks image `image` as bootable, or none with 0.
    pub fn set_boot_index(&mut self, image: u32) -> Result<()> {
        if image == 0 {
            self.header.boot_index = 0;
            self.header.boot_metadata = ResourceEntry::default();
            return Ok(());
        }
        let i = self.check_image(image)?;
        self.header.boot_index = image;
        self.header.boot_metadata = self.images[i]
            .source
            .as_ref()
            .map(|s| s.entry.resource)
            .unwrap_or_default();
        Ok(())
    }

    pub fn image_info(&self, image: u32) -> Option<&ImageInfo> {
        self.info.image(image)
    }

    /// Name of image `image`, empty if it has none.
    pub fn image_name(&self, image: u32) -> &str {
        self.info.image(image).map(|i| i.name.as_str()).unwrap_or("")
    }

    /// Finds an image by 1-based index or by name.
    pub fn resolve_image(&self, name_or_index: &str) -> Option<u32> {
        if let Ok(index) = name_or_index.parse::<u32>() {
            return (index >= 1 && index <= self.image_count()).then_some(index);
        }
        (1..=self.image_count()).find(|&i| self.image_name(i) == name_or_index)
    }

    pub fn set_image_name(&mut self, image: u32, name: &str) -> Result<()> {
        self.check_image(image)?;
        if !name.is_empty()
            && (1..=self.image_count()).any(|i| i != image && self.image_name(i) == name)
        {
            return Err(Error::InvalidParameter(format!(
                "an image named '{}' already exists",
                name
            )));
        }
        if let Some(info) = self.info.image_mut(image) {
            info.name = name.to_string();
        }
        Ok(())
    }

    pub fn set_image_description(&mut self, image: u32, description: &str) -> Result<()> {
        self.check_image(image)?;
        if let Some(info) = self.info.image_mut(image) {
            info.description = description.to_string();
        }
        Ok(())
    }

    /// Lookup table record of the metadata resource image `image` was read from.
    pub fn metadata_resource(&self, image: u32) -> Option<&LookupTableEntry> {
        let i = self.check_image(image).ok()?;
        self.images[i].source.as_ref().map(|s| &s.entry)
    }

    /// Loads image `image` if needed and returns its tree.
    pub fn select_image(&mut self, image: u32) -> Result<&DentryTree> {
        self.load_image(image)?;
        self.loaded_tree(image)
    }

    pub(crate) fn loaded_tree(&self, image: u32) -> Result<&DentryTree> {
        let i = self.check_image(image)?;
        self.images[i].tree.as_ref().ok_or(Error::InvalidImage(image))
    }

    /// Appends the image assembled in `builder` and returns its index.
    pub fn add_image(
        &mut self,
        builder: ImageBuilder,
        name: &str,
        description: &str,
    ) -> Result<u32> {
        if !name.is_empty() && (1..=self.image_count()).any(|i| self.image_name(i) == name) {
            return Err(Error::InvalidParameter(format!(
                "an image named '{}' already exists",
                name
            )));
        }

        let ImageBuilder {
            tree,
            streams,
            security,
            rpfix_root,
            ..
        } = builder;
        for stream in streams {
            self.lookup_table.insert(stream);
        }

        let mut total_bytes = 0;
        let mut hard_link_bytes = 0;
        let mut seen = std::collections::HashSet::new();
        for dentry in tree.preorder(tree.root()) {
            let inode_id = tree.dentry(dentry).inode;
            let inode = tree.inode(inode_id);
            let size = match inode.resolve_stream(0, &self.lookup_table)? {
                Some(id) => self.lookup_table.get(id).size,
                None => 0,
            };
            total_bytes += size;
            if !seen.insert(inode_id) {
                hard_link_bytes += size;
            }
        }

        let now = now_filetime();
        self.info.images.push(ImageInfo {
            name: name.to_string(),
            description: description.to_string(),
            dir_count: tree.dir_count(),
            file_count: tree.file_count(),
            total_bytes,
            hard_link_bytes,
            creation_time: now,
            last_modification_time: now,
        });
        self.images.push(ImageMetadata {
            tree: Some(tree),
            security,
            source: None,
        });
        self.header.image_count = self.image_count();
        if rpfix_root.is_some() {
            self.header.flags.insert(HeaderFlags::RP_FIX);
        }
        self.content_modified = true;

        tracing::debug!(image = self.image_count(), name, total_bytes, "added image");
        Ok(self.image_count())
    }
}
