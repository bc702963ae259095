use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{prelude::*, BufWriter, SeekFrom};
use std::path::{Path, PathBuf};

use bitflags::bitflags;

use super::{ImageSelector, Wim};
use crate::error::{Error, Result};
use crate::header::{HeaderFlags, ResourceEntry, ResourceFlags, WimHeader, HEADER_SIZE};
use crate::integrity::IntegrityTable;
use crate::lookup_table::{LookupTable, LookupTableEntry, Stream};
use crate::metadata::{write_metadata_resource, SecurityData};
use crate::resource::{copy_stream_to, read_resource};
use crate::ser::{write_traced, Serialize};
use crate::tree::DentryTree;
use crate::Sha1Hash;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WriteFlags: u32 {
        /// Write an integrity table.
        const CHECK_INTEGRITY = 0x0000_0001;
        const SHOW_PROGRESS = 0x0000_0002;
        /// Always rewrite the whole file on commit.
        const REBUILD = 0x0000_0004;
    }
}

const COMPRESSION_FLAGS: HeaderFlags = HeaderFlags::COMPRESSION
    .union(HeaderFlags::COMPRESS_RESERVED)
    .union(HeaderFlags::COMPRESS_XPRESS)
    .union(HeaderFlags::COMPRESS_LZX);

fn write_err(path: &Path) -> impl FnOnce(std::io::Error) -> Error + '_ {
    move |e| Error::Write(e, path.to_path_buf())
}

/// Streams resources into a new WIM file and finishes it with the lookup
/// table, XML data, integrity table and header.
pub(crate) struct WimWriter {
    file: BufWriter<File>,
    path: PathBuf,
    written: HashMap<Sha1Hash, usize>,
    entries: Vec<LookupTableEntry>,
    metadata: Vec<(u32, LookupTableEntry)>,
}

impl WimWriter {
    /// Starts a WIM in `file` with a placeholder header.
    pub(crate) fn begin(file: File, path: &Path, header: &WimHeader) -> Result<WimWriter> {
        let mut file = BufWriter::new(file);
        let mut placeholder = header.clone();
        placeholder.flags.insert(HeaderFlags::WRITE_IN_PROGRESS);
        file.seek(SeekFrom::Start(0)).map_err(write_err(path))?;
        placeholder.write(&mut file).map_err(write_err(path))?;
        Ok(WimWriter {
            file,
            path: path.to_path_buf(),
            written: HashMap::new(),
            entries: vec![],
            metadata: vec![],
        })
    }

    fn position(&mut self) -> Result<u64> {
        self.file.stream_position().map_err(write_err(&self.path))
    }

    /// Writes `stream` unless its content is already in the file.
    fn write_stream(&mut self, stream: &Stream) -> Result<()> {
        if let Some(&i) = self.written.get(&stream.hash) {
            self.entries[i].refcnt += 1;
            return Ok(());
        }
        let offset = self.position()?;
        let size = copy_stream_to(stream, &mut self.file, &self.path)?;
        self.written.insert(stream.hash, self.entries.len());
        self.entries.push(LookupTableEntry {
            resource: ResourceEntry::uncompressed(offset, size),
            part_number: 1,
            refcnt: 1,
            hash: stream.hash,
        });
        Ok(())
    }

    /// Writes every stream referenced from `tree`, counting one reference
    /// per name.
    pub(crate) fn write_file_resources(
        &mut self,
        tree: &DentryTree,
        table: &LookupTable,
    ) -> Result<()> {
        for dentry in tree.preorder(tree.root()) {
            let inode = tree.dentry_inode(dentry);
            for index in 0..inode.num_streams() {
                if let Some(id) = inode.resolve_stream(index, table)? {
                    self.write_stream(table.get(id))?;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn write_metadata_resource(
        &mut self,
        image: u32,
        tree: &DentryTree,
        security: &SecurityData,
    ) -> Result<()> {
        let buf = write_metadata_resource(tree, security)?;
        let offset = self.position()?;
        self.file.write_all(&buf).map_err(write_err(&self.path))?;
        let mut resource = ResourceEntry::uncompressed(offset, buf.len() as u64);
        resource.flags = ResourceFlags::METADATA;
        self.metadata.push((
            image,
            LookupTableEntry {
                resource,
                part_number: 1,
                refcnt: 1,
                hash: Sha1Hash::of(&buf),
            },
        ));
        Ok(())
    }

    /// Writes the lookup table (if `write_lt`), XML data and integrity
    /// table, then the final header. Returns the header written.
    pub(crate) fn finish_write(
        &mut self,
        wim: &Wim,
        image: ImageSelector,
        flags: WriteFlags,
        write_lt: bool,
    ) -> Result<WimHeader> {
        let mut hdr = wim.header.clone();

        if write_lt {
            let entries: Vec<LookupTableEntry> = self
                .entries
                .iter()
                .chain(self.metadata.iter().map(|(_, e)| e))
                .copied()
                .collect();
            let offset = write_traced(entries.as_slice(), &mut self.file, "lookup table")
                .map_err(write_err(&self.path))?;
            hdr.lookup_table = ResourceEntry::uncompressed(offset, self.position()? - offset);
        }
        hdr.lookup_table.original_size = hdr.lookup_table.size;
        hdr.lookup_table.flags = ResourceFlags::METADATA;

        let xml_offset = self.position()?;
        let xml = wim.info.to_bytes(image, xml_offset)?;
        self.file.write_all(&xml).map_err(write_err(&self.path))?;
        hdr.xml_data = ResourceEntry::uncompressed(xml_offset, xml.len() as u64);
        let xml_end = xml_offset + xml.len() as u64;

        if flags.contains(WriteFlags::CHECK_INTEGRITY) {
            self.file.flush().map_err(write_err(&self.path))?;
            let file = self.file.get_mut();
            if flags.contains(WriteFlags::SHOW_PROGRESS) {
                tracing::info!(
                    bytes = xml_offset - HEADER_SIZE as u64,
                    "Calculating integrity table"
                );
            }
            let table = IntegrityTable::compute(file, xml_offset)
                .map_err(|e| Error::Read(e, self.path.clone()))?;
            let bytes = table.to_bytes();
            file.seek(SeekFrom::Start(xml_end))
                .and_then(|_| file.write_all(&bytes))
                .map_err(write_err(&self.path))?;
            hdr.integrity = ResourceEntry::uncompressed(xml_end, bytes.len() as u64);
        } else {
            hdr.integrity = ResourceEntry::default();
        }

        let written_boot = match image {
            ImageSelector::All => true,
            ImageSelector::Index(i) => i == wim.header.boot_index,
        };
        if wim.header.boot_index == 0 || self.metadata.is_empty() || !written_boot {
            hdr.boot_metadata = ResourceEntry::default();
        } else {
            hdr.boot_metadata = self
                .metadata
                .iter()
                .find(|(i, _)| *i == wim.header.boot_index)
                .map(|(_, e)| e.resource)
                .unwrap_or_default();
        }

        match image {
            ImageSelector::All => hdr.image_count = wim.image_count(),
            ImageSelector::Index(i) => {
                hdr.image_count = 1;
                hdr.boot_index = if i == wim.header.boot_index { 1 } else { 0 };
            }
        }
        hdr.flags.remove(COMPRESSION_FLAGS | HeaderFlags::WRITE_IN_PROGRESS);
        hdr.part_number = 1;
        hdr.total_parts = 1;

        self.file.seek(SeekFrom::Start(0)).map_err(write_err(&self.path))?;
        hdr.write(&mut self.file).map_err(write_err(&self.path))?;
        self.file.flush().map_err(write_err(&self.path))?;
        tracing::debug!(
            path = %self.path.display(),
            images = hdr.image_count,
            boot = hdr.boot_index,
            integrity = hdr.integrity.size != 0,
            "finished writing WIM"
        );
        Ok(hdr)
    }
}

impl Wim {
    /// Writes the selected image(s) to a new file at `path`.
    pub fn write<P: AsRef<Path>>(
        &mut self,
        path: P,
        image: ImageSelector,
        flags: WriteFlags,
    ) -> Result<()> {
        let path = path.as_ref();
        if self.path.as_deref() == Some(path) {
            return Err(Error::InvalidParameter(
                "cannot write a WIM over itself; use overwrite".into(),
            ));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| Error::Open(e, path.to_path_buf()))?;
        self.write_to_file(file, path, image, flags)?;
        Ok(())
    }

    fn write_to_file(
        &mut self,
        file: File,
        path: &Path,
        image: ImageSelector,
        flags: WriteFlags,
    ) -> Result<WimHeader> {
        let images: Vec<u32> = match image {
            ImageSelector::All => (1..=self.image_count()).collect(),
            ImageSelector::Index(i) => {
                self.check_image(i)?;
                vec![i]
            }
        };
        for &i in images.iter() {
            self.load_image(i)?;
        }

        let mut writer = WimWriter::begin(file, path, &self.header)?;
        for &i in images.iter() {
            writer.write_file_resources(self.loaded_tree(i)?, &self.lookup_table)?;
        }
        for &i in images.iter() {
            let security = &self.images[(i - 1) as usize].security;
            writer.write_metadata_resource(i, self.loaded_tree(i)?, security)?;
        }
        writer.finish_write(self, image, flags, true)
    }

    /// Rewrites the whole WIM to a temporary file in the same directory and
    /// renames it over the original.
    pub fn overwrite(&mut self, flags: WriteFlags) -> Result<()> {
        let path = self.path.clone().ok_or(Error::NoFilename)?;
        for i in 1..=self.image_count() {
            self.load_image(i)?;
        }

        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let prefix = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "wim".into());
        let tmp = tempfile::Builder::new()
            .prefix(&prefix)
            .rand_bytes(9)
            .tempfile_in(dir)
            .map_err(|e| Error::Open(e, dir.to_path_buf()))?;
        let tmp_path = tmp.path().to_path_buf();
        tracing::debug!(
            path = %path.display(),
            tmp = %tmp_path.display(),
            "writing replacement WIM"
        );

        let file = tmp
            .as_file()
            .try_clone()
            .map_err(|e| Error::Open(e, tmp_path.clone()))?;
        if let Err(e) = self.write_to_file(file, &tmp_path, ImageSelector::All, flags) {
            tracing::error!(tmp = %tmp_path.display(), "Failed to write the replacement WIM");
            return Err(e);
        }

        tracing::debug!(from = %tmp_path.display(), to = %path.display(), "renaming");
        if let Err(err) = tmp.persist(&path) {
            let tempfile::PersistError { error, file } = err;
            tracing::error!(
                from = %tmp_path.display(),
                to = %path.display(),
                error = %error,
                "Failed to rename"
            );
            let cleanup = file.close().err();
            if let Some(e) = &cleanup {
                tracing::error!(
                    tmp = %tmp_path.display(),
                    error = %e,
                    "Failed to remove temporary file"
                );
            }
            return Err(Error::Rename {
                source: error,
                from: tmp_path,
                to: path,
                cleanup,
            });
        }

        *self = Wim::open(&path)?;
        Ok(())
    }

    /// Rewrites only the XML data, integrity table and header in place.
    ///
    /// This is not atomic: a crash part way through leaves a damaged file.
    /// It is refused once stream content or images have changed.
    pub fn overwrite_xml_and_header(&mut self, flags: WriteFlags) -> Result<()> {
        if self.content_modified {
            return Err(Error::InvalidParameter(
                "images were changed; a full overwrite is required".into(),
            ));
        }
        let path = self.path.clone().ok_or(Error::NoFilename)?;
        let mut hdr = self.header.clone();

        let keep_integrity =
            flags.contains(WriteFlags::CHECK_INTEGRITY) && hdr.integrity.offset != 0;
        let preserved = if keep_integrity {
            Some(read_resource(&path, &hdr.integrity)?)
        } else {
            None
        };

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| Error::Open(e, path.clone()))?;

        let xml_offset = hdr.xml_data.offset;
        let xml = self.info.to_bytes(ImageSelector::All, xml_offset)?;
        file.seek(SeekFrom::Start(xml_offset))
            .and_then(|_| file.write_all(&xml))
            .map_err(write_err(&path))?;
        hdr.xml_data = ResourceEntry::uncompressed(xml_offset, xml.len() as u64);
        let xml_end = xml_offset + xml.len() as u64;

        let end = if flags.contains(WriteFlags::CHECK_INTEGRITY) {
            let bytes = match preserved {
                Some(bytes) => bytes,
                None => IntegrityTable::compute(&mut file, hdr.lookup_table.end())
                    .map_err(|e| Error::Read(e, path.clone()))?
                    .to_bytes(),
            };
            file.seek(SeekFrom::Start(xml_end))
                .and_then(|_| file.write_all(&bytes))
                .map_err(write_err(&path))?;
            hdr.integrity = ResourceEntry::uncompressed(xml_end, bytes.len() as u64);
            xml_end + bytes.len() as u64
        } else {
            hdr.integrity = ResourceEntry::default();
            xml_end
        };
        file.set_len(end).map_err(write_err(&path))?;

        {
            let mut out = BufWriter::new(&mut file);
            out.seek(SeekFrom::Start(0))
                .and_then(|_| hdr.write(&mut out))
                .and_then(|_| out.flush())
                .map_err(write_err(&path))?;
        }
        tracing::debug!(path = %path.display(), xml = xml.len(), "rewrote XML data and header");
        self.header = hdr;
        Ok(())
    }

    /// Saves changes to the file this WIM was opened from, in place when
    /// only names, descriptions or the boot index changed.
    pub fn commit(&mut self, flags: WriteFlags) -> Result<()> {
        if flags.contains(WriteFlags::REBUILD) || self.content_modified {
            self.overwrite(flags)
        } else {
            self.overwrite_xml_and_header(flags)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ImageBuilder;
    use crate::de::DeserializeOwned;

    fn read_header(path: &Path) -> WimHeader {
        let mut f = File::open(path).unwrap();
        WimHeader::deserialize_owned(&mut f).unwrap()
    }

    fn three_images() -> Wim {
        let mut wim = Wim::new();
        for name in ["one", "two", "three"] {
            let mut b = ImageBuilder::new();
            let root = b.root();
            b.add_file(root, "shared", b"common content".to_vec()).unwrap();
            b.add_file(root, "own", name.as_bytes().to_vec()).unwrap();
            wim.add_image(b, name, "").unwrap();
        }
        wim.set_boot_index(2).unwrap();
        wim
    }

    #[test]
    fn shared_content_is_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wim");
        let mut wim = three_images();
        wim.write(&path, ImageSelector::All, WriteFlags::empty()).unwrap();

        let reopened = Wim::open(&path).unwrap();
        // "common content" plus three distinct "own" files.
        assert_eq!(reopened.lookup_table().len(), 4);
        let shared = reopened
            .lookup_table()
            .lookup(&Sha1Hash::of(b"common content"))
            .unwrap();
        assert_eq!(reopened.lookup_table().get(shared).refcnt, 3);

        let hdr = read_header(&path);
        assert_eq!(hdr.image_count, 3);
        assert_eq!(hdr.boot_index, 2);
        assert_eq!(Some(&hdr.boot_metadata), reopened.metadata_resource(2).map(|e| &e.resource));
        assert_eq!(hdr.lookup_table.flags, ResourceFlags::METADATA);
        assert_eq!(hdr.lookup_table.original_size, hdr.lookup_table.size);
        assert!(!hdr.flags.contains(HeaderFlags::WRITE_IN_PROGRESS));
    }

    #[test]
    fn single_boot_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("two.wim");
        let mut wim = three_images();
        wim.write(&path, ImageSelector::Index(2), WriteFlags::empty()).unwrap();

        let hdr = read_header(&path);
        assert_eq!(hdr.image_count, 1);
        assert_eq!(hdr.boot_index, 1);
        let mut reopened = Wim::open(&path).unwrap();
        assert_eq!(reopened.image_name(1), "two");
        assert_eq!(Some(&hdr.boot_metadata), reopened.metadata_resource(1).map(|e| &e.resource));
        assert!(reopened.select_image(1).unwrap().lookup("own").is_some());
    }

    #[test]
    fn single_non_boot_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("three.wim");
        let mut wim = three_images();
        wim.write(&path, ImageSelector::Index(3), WriteFlags::empty()).unwrap();

        let hdr = read_header(&path);
        assert_eq!(hdr.image_count, 1);
        assert_eq!(hdr.boot_index, 0);
        assert_eq!(hdr.boot_metadata, ResourceEntry::default());
    }

    #[test]
    fn integrity_table_covers_lookup_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checked.wim");
        let mut wim = three_images();
        wim.write(&path, ImageSelector::All, WriteFlags::CHECK_INTEGRITY).unwrap();

        let hdr = read_header(&path);
        assert_eq!(hdr.integrity.offset, hdr.xml_data.end());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), hdr.integrity.end());
        assert!(Wim::open(&path).unwrap().check_integrity().unwrap());
    }

    #[test]
    fn write_refuses_own_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("self.wim");
        let mut wim = three_images();
        wim.write(&path, ImageSelector::All, WriteFlags::empty()).unwrap();
        let mut wim = Wim::open(&path).unwrap();
        assert!(matches!(
            wim.write(&path, ImageSelector::All, WriteFlags::empty()),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn failed_rename_removes_temporary_file() {
        let dir = tempfile::tempdir().unwrap();
        let busy = dir.path().join("busy");
        std::fs::create_dir(&busy).unwrap();
        std::fs::write(busy.join("keep"), b"keep").unwrap();

        let mut wim = three_images();
        wim.path = Some(busy.clone());
        let res = wim.overwrite(WriteFlags::empty());
        match res {
            Err(Error::Rename { from, to, cleanup, .. }) => {
                assert!(cleanup.is_none());
                assert_eq!(to, busy);
                assert!(!from.exists());
            }
            other => panic!("expected a rename error, got {:?}", other),
        }

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("busy")]);
        assert_eq!(std::fs::read(busy.join("keep")).unwrap(), b"keep");
    }

    #[test]
    fn write_rejects_bad_image() {
        let dir = tempfile::tempdir().unwrap();
        let mut wim = three_images();
        let res = wim.write(dir.path().join("x.wim"), ImageSelector::Index(4), WriteFlags::empty());
        assert!(matches!(res, Err(Error::InvalidImage(4))));
    }
}
