use std::fs::File;
use std::io::{BufReader, Cursor};
use std::path::Path;
use std::sync::Arc;

use super::{ImageMetadata, MetadataSource, Wim};
use crate::de::DeserializeOwned;
use crate::error::{Error, Result};
use crate::header::WimHeader;
use crate::integrity::IntegrityTable;
use crate::lookup_table::{LookupTable, LookupTableEntry};
use crate::metadata::parse_metadata_resource;
use crate::resource::read_resource;
use crate::xml::{ImageInfo, WimInfo};
use crate::Sha1Hash;

impl Wim {
    /// Opens the WIM at `path`. Image trees are loaded on demand.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Wim> {
        let path = path.as_ref();
        let header = {
            let file = File::open(path).map_err(|e| Error::Open(e, path.to_path_buf()))?;
            let mut reader = BufReader::new(file);
            WimHeader::deserialize_owned(&mut reader).map_err(|e| {
                tracing::error!(path = %path.display(), error = %e, "Invalid WIM header");
                Error::InvalidHeader(e)
            })?
        };
        tracing::debug!(
            path = %path.display(),
            images = header.image_count,
            part = header.part_number,
            total_parts = header.total_parts,
            "opened WIM"
        );

        let shared_path = Arc::new(path.to_path_buf());
        let entries = read_lookup_table(path, &header)?;
        let (lookup_table, metadata) = LookupTable::from_entries(&shared_path, entries);

        if header.part_number == 1 && metadata.len() != header.image_count as usize {
            return Err(Error::invalid_data(format!(
                "header lists {} images but {} metadata resources were found",
                header.image_count,
                metadata.len()
            )));
        }

        let mut info = if header.xml_data.size == 0 {
            WimInfo::default()
        } else {
            WimInfo::from_bytes(&read_resource(path, &header.xml_data)?)?
        };
        if info.images.len() < metadata.len() {
            tracing::warn!(
                xml = info.images.len(),
                images = metadata.len(),
                "XML data describes fewer images than the WIM contains"
            );
            info.images.resize_with(metadata.len(), ImageInfo::default);
        }

        let images = metadata
            .into_iter()
            .map(|entry| ImageMetadata {
                tree: None,
                security: Default::default(),
                source: Some(MetadataSource {
                    path: Arc::clone(&shared_path),
                    entry,
                }),
            })
            .collect();

        Ok(Wim {
            path: Some(path.to_path_buf()),
            header,
            lookup_table,
            info,
            images,
            content_modified: false,
        })
    }

    /// Reads and parses the metadata resource of image `image` unless it is
    /// already loaded.
    pub(crate) fn load_image(&mut self, image: u32) -> Result<()> {
        let i = self.check_image(image)?;
        let meta = &mut self.images[i];
        if meta.tree.is_some() {
            return Ok(());
        }
        let source = meta
            .source
            .as_ref()
            .ok_or_else(|| Error::invalid_data(format!("image {} has no metadata", image)))?;

        let buf = read_resource(&source.path, &source.entry.resource)?;
        if Sha1Hash::of(&buf) != source.entry.hash {
            return Err(Error::invalid_data(format!(
                "metadata resource of image {} has the wrong checksum",
                image
            )));
        }
        let (tree, security) = parse_metadata_resource(&buf)?;
        tracing::debug!(image, dentries = tree.dentry_count(), "loaded image metadata");
        meta.tree = Some(tree);
        meta.security = security;
        Ok(())
    }

    /// Verifies the integrity table. Returns `false` if the WIM has none.
    pub fn check_integrity(&self) -> Result<bool> {
        let path = self.path.as_deref().ok_or(Error::NoFilename)?;
        let integrity = &self.header.integrity;
        if integrity.offset == 0 || integrity.size == 0 {
            return Ok(false);
        }
        let table = IntegrityTable::from_bytes(&read_resource(path, integrity)?)?;
        let file = File::open(path).map_err(|e| Error::Open(e, path.to_path_buf()))?;
        table.verify(&file, self.header.lookup_table.end())?;
        Ok(true)
    }
}

fn read_lookup_table(path: &Path, header: &WimHeader) -> Result<Vec<LookupTableEntry>> {
    if header.lookup_table.size == 0 {
        return Ok(vec![]);
    }
    let buf = read_resource(path, &header.lookup_table)?;
    if buf.len() as u64 % LookupTableEntry::DISK_SIZE != 0 {
        return Err(Error::invalid_data("lookup table size is not a multiple of its entry size"));
    }
    buf.chunks_exact(LookupTableEntry::DISK_SIZE as usize)
        .map(|chunk| LookupTableEntry::deserialize_owned(&mut Cursor::new(chunk)))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(Error::invalid_data)
}
