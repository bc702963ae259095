//! Extraction of image trees to a filesystem or a mounted volume.

use std::fs;
use std::io::{self, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use bitflags::bitflags;

mod apply;
mod dedup;
mod executor;
mod plan;
mod progress;
mod validate;

pub use self::apply::{ApplyEntry, BackendCapabilities, MountedVolume, VolumeMounter};
pub use self::dedup::{find_streams_for_extraction, StreamList, VisitState};
pub use self::plan::{calculate_bytes_to_extract, sort_streams_by_container_position};
pub use self::progress::{ExtractProgress, ProgressFn, ProgressMsg};
pub use self::validate::check_extract_command;

use self::executor::{extract_dentry_to_writer, extract_tree, TreeSource};
use self::validate::check_batch_link_modes;
use crate::error::{Error, Result};
use crate::lookup_table::verify_split_set;
use crate::path::{image_name_ok_as_dir, WimPath};
use crate::{ImageSelector, Wim};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ExtractFlags: u32 {
        /// Apply to a volume opened by a [`VolumeMounter`].
        const NTFS = 0x0000_0001;
        const HARDLINK = 0x0000_0002;
        const SYMLINK = 0x0000_0004;
        const VERBOSE = 0x0000_0008;
        const SEQUENTIAL = 0x0000_0010;
        const UNIX_DATA = 0x0000_0020;
        const NO_ACLS = 0x0000_0040;
        const STRICT_ACLS = 0x0000_0080;
        const RPFIX = 0x0000_0100;
        const NORPFIX = 0x0000_0200;
        const TO_STDOUT = 0x0000_0400;

        #[doc(hidden)]
        const NO_STREAMS = 0x4000_0000;
        #[doc(hidden)]
        const MULTI_IMAGE = 0x8000_0000;
    }
}

impl ExtractFlags {
    /// Flags callers may pass in.
    pub const PUBLIC: ExtractFlags = ExtractFlags::from_bits_retain(0x0000_07ff);

    pub const LINK_MODES: ExtractFlags = ExtractFlags::HARDLINK.union(ExtractFlags::SYMLINK);

    pub fn is_link_mode(self) -> bool {
        self.intersects(ExtractFlags::LINK_MODES)
    }
}

/// One `source_path -> dest_path` extraction of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractCommand {
    /// Path inside the image; empty or `/` for the whole image.
    pub source_path: String,
    pub dest_path: PathBuf,
    pub flags: ExtractFlags,
}

impl ExtractCommand {
    pub fn new(source_path: impl Into<String>, dest_path: impl Into<PathBuf>) -> ExtractCommand {
        ExtractCommand {
            source_path: source_path.into(),
            dest_path: dest_path.into(),
            flags: ExtractFlags::empty(),
        }
    }
}

#[derive(Default)]
pub struct ExtractOptions<'a> {
    pub progress: Option<Box<ProgressFn<'a>>>,
    /// Remaining parts when extracting from a split WIM.
    pub additional_parts: &'a [Wim],
    /// Needed for [`ExtractFlags::NTFS`].
    pub volume_mounter: Option<&'a dyn VolumeMounter>,
}

impl<'a> ExtractOptions<'a> {
    pub fn with_progress<F>(mut self, f: F) -> ExtractOptions<'a>
    where
        F: FnMut(ProgressMsg, &ExtractProgress) -> ControlFlow<()> + 'a,
    {
        self.progress = Some(Box::new(f));
        self
    }
}

impl Wim {
    /// Runs a batch of extraction commands against one image.
    pub fn extract_files(
        &mut self,
        image: u32,
        cmds: &[ExtractCommand],
        default_flags: ExtractFlags,
        options: ExtractOptions<'_>,
    ) -> Result<()> {
        let ExtractOptions {
            mut progress,
            additional_parts,
            volume_mounter,
        } = options;

        self.verify_parts(additional_parts)?;
        if cmds.is_empty() {
            return Ok(());
        }
        let merged = self.merge_parts(additional_parts);

        let default_flags = default_flags & ExtractFlags::PUBLIC;
        let mut all_flags = ExtractFlags::empty();
        let mut copies = Vec::with_capacity(cmds.len());
        let mut result = Ok(());
        for cmd in cmds {
            let flags = (default_flags | cmd.flags) & ExtractFlags::PUBLIC;
            all_flags |= flags;
            match WimPath::new(&cmd.source_path) {
                Ok(source) => copies.push(ExtractCommand {
                    source_path: source.as_str().to_string(),
                    dest_path: cmd.dest_path.clone(),
                    flags,
                }),
                Err(e) => {
                    result = Err(e.into());
                    break;
                }
            }
        }

        if result.is_ok() {
            result =
                self.do_extract_files(image, &mut copies, progress.as_deref_mut(), volume_mounter);
        }

        if all_flags.is_link_mode() {
            self.lookup_table.clear_extracted_files();
        }
        if merged {
            self.lookup_table.unmerge();
        }
        result
    }

    /// Extracts one image, or every image into numbered or named
    /// subdirectories of `target`.
    pub fn extract_image(
        &mut self,
        image: ImageSelector,
        target: impl AsRef<Path>,
        flags: ExtractFlags,
        options: ExtractOptions<'_>,
    ) -> Result<()> {
        let ExtractOptions {
            mut progress,
            additional_parts,
            volume_mounter,
        } = options;
        let target = target.as_ref();
        let flags = flags & ExtractFlags::PUBLIC;

        self.verify_parts(additional_parts)?;
        let merged = self.merge_parts(additional_parts);

        let ret = match image {
            ImageSelector::All => self.extract_all_images(
                target,
                flags | ExtractFlags::MULTI_IMAGE,
                progress.as_deref_mut(),
                volume_mounter,
            ),
            ImageSelector::Index(index) => self.extract_single_image(
                index,
                target,
                flags,
                progress.as_deref_mut(),
                volume_mounter,
            ),
        };

        if flags.is_link_mode() {
            self.lookup_table.clear_extracted_files();
        }
        if merged {
            self.lookup_table.unmerge();
        }
        ret
    }

    /// Copies the content of the regular file at `source_path` to `writer`.
    pub fn extract_to_writer<W: Write>(
        &mut self,
        image: u32,
        source_path: &str,
        writer: &mut W,
    ) -> Result<u64> {
        let source = WimPath::new(source_path)?;
        self.load_image(image)?;
        let tree = self.loaded_tree(image)?;
        let dentry = tree
            .lookup(source.as_str())
            .ok_or_else(|| Error::PathNotFound(source.as_str().to_string()))?;
        extract_dentry_to_writer(tree, dentry, &self.lookup_table, writer)
    }

    fn verify_parts(&self, parts: &[Wim]) -> Result<()> {
        if parts.is_empty() && !self.header.is_split() {
            return Ok(());
        }
        let headers: Vec<_> = parts.iter().map(|w| &w.header).collect();
        verify_split_set(&self.header, &headers)
    }

    fn merge_parts(&mut self, parts: &[Wim]) -> bool {
        for part in parts {
            self.lookup_table.merge(&part.lookup_table);
        }
        !parts.is_empty()
    }

    fn do_extract_files<F>(
        &mut self,
        image: u32,
        cmds: &mut [ExtractCommand],
        mut progress: Option<&mut F>,
        mounter: Option<&dyn VolumeMounter>,
    ) -> Result<()>
    where
        F: FnMut(ProgressMsg, &ExtractProgress) -> ControlFlow<()> + ?Sized,
    {
        self.load_image(image)?;

        let platform = BackendCapabilities::filesystem();
        for cmd in cmds.iter_mut() {
            check_extract_command(cmd, self.header.flags, platform, mounter.is_some())?;
        }
        check_batch_link_modes(cmds)?;

        let Wim {
            path,
            lookup_table,
            info,
            images,
            ..
        } = self;
        let tree = images
            .get((image - 1) as usize)
            .and_then(|m| m.tree.as_ref())
            .ok_or(Error::InvalidImage(image))?;
        let image_name = info.image(image).map(|i| i.name.as_str()).unwrap_or("");

        for cmd in cmds.iter() {
            tracing::debug!(
                image,
                source = %cmd.source_path,
                target = %cmd.dest_path.display(),
                flags = ?cmd.flags,
                "extracting"
            );
            let src = TreeSource {
                wim_path: path.as_deref(),
                image,
                image_name,
                tree,
            };
            extract_tree(
                src,
                lookup_table,
                &cmd.source_path,
                &cmd.dest_path,
                cmd.flags,
                progress.as_deref_mut(),
                mounter,
            )?;
        }
        Ok(())
    }

    fn extract_single_image<F>(
        &mut self,
        image: u32,
        target: &Path,
        flags: ExtractFlags,
        progress: Option<&mut F>,
        mounter: Option<&dyn VolumeMounter>,
    ) -> Result<()>
    where
        F: FnMut(ProgressMsg, &ExtractProgress) -> ControlFlow<()> + ?Sized,
    {
        let mut cmds = [ExtractCommand {
            source_path: String::new(),
            dest_path: target.to_path_buf(),
            flags,
        }];
        self.do_extract_files(image, &mut cmds, progress, mounter)
    }

    fn extract_all_images<F>(
        &mut self,
        target: &Path,
        flags: ExtractFlags,
        mut progress: Option<&mut F>,
        mounter: Option<&dyn VolumeMounter>,
    ) -> Result<()>
    where
        F: FnMut(ProgressMsg, &ExtractProgress) -> ControlFlow<()> + ?Sized,
    {
        prepare_multi_image_target(target)?;

        for image in 1..=self.image_count() {
            let name = self.image_name(image);
            let dir = if image_name_ok_as_dir(name) {
                target.join(name)
            } else {
                target.join(image.to_string())
            };
            self.extract_single_image(image, &dir, flags, progress.as_deref_mut(), mounter)?;
        }
        Ok(())
    }
}

fn prepare_multi_image_target(target: &Path) -> Result<()> {
    match fs::metadata(target) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => {
            tracing::error!(target = %target.display(), "Extraction target is not a directory");
            Err(Error::NotADirectory(target.to_path_buf()))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let mut builder = fs::DirBuilder::new();
            #[cfg(unix)]
            {
                use std::os::unix::fs::DirBuilderExt;
                builder.mode(0o755);
            }
            builder
                .create(target)
                .map_err(|e| Error::Mkdir(e, target.to_path_buf()))
        }
        Err(e) => Err(Error::Stat(e, target.to_path_buf())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_mask() {
        assert!(ExtractFlags::PUBLIC.contains(ExtractFlags::TO_STDOUT));
        let private = ExtractFlags::NO_STREAMS | ExtractFlags::MULTI_IMAGE;
        assert!(!ExtractFlags::PUBLIC.intersects(private));
        assert!(ExtractFlags::SYMLINK.is_link_mode());
        assert!(!ExtractFlags::SEQUENTIAL.is_link_mode());
    }

    #[test]
    fn multi_image_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("all");
        prepare_multi_image_target(&target).unwrap();
        assert!(target.is_dir());
        prepare_multi_image_target(&target).unwrap();

        let file = dir.path().join("file");
        fs::write(&file, b"").unwrap();
        assert!(matches!(
            prepare_multi_image_target(&file),
            Err(Error::NotADirectory(_))
        ));
    }
}
