//! Apply backends: where extracted entries are materialized.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use super::ExtractFlags;
use crate::error::{Error, Result};
use crate::lookup_table::{LookupTable, Stream, StreamId};
use crate::reparse::ReparseData;
use crate::resource::{copy_stream_to, read_stream};
use crate::tree::{Dentry, DentryId, DentryTree, FileAttributes, Inode};

/// What a backend can represent. Decides which streams are planned and which
/// flags are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCapabilities {
    pub alternate_streams: bool,
    pub unix_data: bool,
    pub link_extraction: bool,
}

impl BackendCapabilities {
    /// The native filesystem of the running platform.
    pub fn filesystem() -> BackendCapabilities {
        BackendCapabilities {
            alternate_streams: cfg!(windows),
            unix_data: cfg!(unix),
            link_extraction: cfg!(unix),
        }
    }

    pub fn mounted_volume() -> BackendCapabilities {
        BackendCapabilities {
            alternate_streams: true,
            unix_data: false,
            link_extraction: false,
        }
    }
}

/// One entry handed to a [`MountedVolume`].
pub struct ApplyEntry<'a> {
    /// Output path: the extraction target joined with the path below the
    /// extraction root.
    pub path: &'a Path,
    /// Absolute path inside the image.
    pub wim_path: &'a str,
    pub tree: &'a DentryTree,
    pub dentry: DentryId,
    pub flags: ExtractFlags,
    lookup_table: &'a LookupTable,
}

impl<'a> ApplyEntry<'a> {
    pub fn dentry(&self) -> &'a Dentry {
        self.tree.dentry(self.dentry)
    }

    pub fn inode(&self) -> &'a Inode {
        self.tree.dentry_inode(self.dentry)
    }

    /// The unnamed stream (`None` name) and every named stream with content.
    pub fn streams(&self) -> Result<Vec<(Option<&'a str>, &'a Stream)>> {
        let inode = self.inode();
        let mut out = vec![];
        if let Some(id) = inode.resolve_stream(0, self.lookup_table)? {
            out.push((None, self.lookup_table.get(id)));
        }
        for (i, ads) in inode.ads.iter().enumerate() {
            if ads.name.is_empty() {
                continue;
            }
            if let Some(id) = inode.resolve_stream(i + 1, self.lookup_table)? {
                out.push((Some(ads.name.as_str()), self.lookup_table.get(id)));
            }
        }
        Ok(out)
    }

    pub fn write_stream<W: Write>(&self, stream: &Stream, writer: &mut W) -> Result<u64> {
        copy_stream_to(stream, writer, self.path)
    }
}

/// A volume opened for extraction, such as an unmounted NTFS partition.
pub trait MountedVolume {
    /// Creates the entry with all of its streams and returns the number of
    /// content bytes written.
    fn materialize_entry(&mut self, entry: &ApplyEntry<'_>) -> Result<u64>;

    fn apply_timestamps(&mut self, entry: &ApplyEntry<'_>) -> Result<()>;

    fn unmount(&mut self) -> io::Result<()>;
}

/// Opens a [`MountedVolume`] for the `NTFS` extraction mode.
pub trait VolumeMounter {
    fn mount(&self, target: &Path) -> io::Result<Box<dyn MountedVolume>>;
}

pub(crate) enum Backend {
    Filesystem(FsBackend),
    MountedVolume(Box<dyn MountedVolume>),
}

impl Backend {
    pub(crate) fn capabilities(&self) -> BackendCapabilities {
        match self {
            Backend::Filesystem(_) => BackendCapabilities::filesystem(),
            Backend::MountedVolume(_) => BackendCapabilities::mounted_volume(),
        }
    }

    pub(crate) fn materialize(
        &mut self,
        ctx: EntryContext<'_>,
        table: &mut LookupTable,
    ) -> Result<u64> {
        match self {
            Backend::Filesystem(fs) => fs.materialize(ctx, table),
            Backend::MountedVolume(volume) => volume.materialize_entry(&ctx.to_entry(&*table)),
        }
    }

    pub(crate) fn apply_timestamps(
        &mut self,
        ctx: EntryContext<'_>,
        table: &LookupTable,
    ) -> Result<()> {
        match self {
            Backend::Filesystem(_) => FsBackend::apply_timestamps(ctx),
            Backend::MountedVolume(volume) => volume.apply_timestamps(&ctx.to_entry(table)),
        }
    }

    pub(crate) fn set_target_realpath(&mut self, realpath: Option<PathBuf>) {
        if let Backend::Filesystem(fs) = self {
            fs.target_realpath = realpath;
        }
    }

    pub(crate) fn unmount(&mut self) -> io::Result<()> {
        match self {
            Backend::Filesystem(_) => Ok(()),
            Backend::MountedVolume(volume) => volume.unmount(),
        }
    }
}

#[derive(Clone, Copy)]
pub(crate) struct EntryContext<'a> {
    pub path: &'a Path,
    pub wim_path: &'a str,
    pub tree: &'a DentryTree,
    pub dentry: DentryId,
    pub flags: ExtractFlags,
}

impl<'a> EntryContext<'a> {
    fn to_entry(self, table: &'a LookupTable) -> ApplyEntry<'a> {
        ApplyEntry {
            path: self.path,
            wim_path: self.wim_path,
            tree: self.tree,
            dentry: self.dentry,
            flags: self.flags,
            lookup_table: table,
        }
    }

    fn inode(&self) -> &'a Inode {
        self.tree.dentry_inode(self.dentry)
    }
}

/// Extraction to a directory of the native filesystem.
#[derive(Debug, Default)]
pub(crate) struct FsBackend {
    target_realpath: Option<PathBuf>,
}

impl FsBackend {
    pub(crate) fn new() -> FsBackend {
        FsBackend::default()
    }

    fn materialize(&mut self, ctx: EntryContext<'_>, table: &mut LookupTable) -> Result<u64> {
        let inode = ctx.inode();
        let mut bytes = if inode.is_reparse_point() {
            self.create_reparse_point(ctx, table)?
        } else if inode.is_directory() {
            create_directory(ctx.path)?;
            0
        } else {
            create_regular_file(ctx, table)?
        };

        if ctx.flags.contains(ExtractFlags::UNIX_DATA) {
            apply_unix_data(ctx, table)?;
        }
        if BackendCapabilities::filesystem().alternate_streams {
            bytes += write_alternate_streams(ctx, table)?;
        }
        Ok(bytes)
    }

    fn create_reparse_point(&self, ctx: EntryContext<'_>, table: &LookupTable) -> Result<u64> {
        let inode = ctx.inode();
        let id = inode
            .resolve_stream(0, table)?
            .ok_or_else(|| {
                Error::invalid_data(format!("{}: reparse point has no data", ctx.wim_path))
            })?;
        let stream = table.get(id);
        let data = read_stream(stream)?;
        let reparse = ReparseData::parse(inode.reparse_tag, &data);
        let reparse = match reparse {
            Ok(r) if r.is_link() => r,
            _ => {
                tracing::warn!(
                    path = ctx.wim_path,
                    tag = format_args!("{:#x}", inode.reparse_tag),
                    "Skipping unsupported reparse point"
                );
                return Ok(0);
            }
        };

        let mut target = reparse.unix_target();
        let fixup = ctx.flags.contains(ExtractFlags::RPFIX) && !inode.not_rpfixed;
        if fixup && target.starts_with('/') {
            if let Some(root) = &self.target_realpath {
                target = format!("{}{}", root.display(), target);
            }
        }
        tracing::trace!(path = %ctx.path.display(), target = %target, "creating symlink");
        let is_dir = inode.attributes.contains(FileAttributes::DIRECTORY);
        create_symlink(Path::new(&target), ctx.path, is_dir)
            .map_err(|e| Error::Link(e, ctx.path.to_path_buf()))?;
        Ok(stream.size)
    }

    fn apply_timestamps(ctx: EntryContext<'_>) -> Result<()> {
        let inode = ctx.inode();
        let ts = inode.timestamps;
        if ts.last_write == 0 {
            return Ok(());
        }
        // Unsupported reparse points were never created.
        let meta = match fs::symlink_metadata(ctx.path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound && inode.is_reparse_point() => {
                return Ok(())
            }
            Err(e) => return Err(Error::Stat(e, ctx.path.to_path_buf())),
        };
        let atime = match ts.last_access {
            0 => crate::fs::to_file_time(ts.last_write),
            t => crate::fs::to_file_time(t),
        };
        let mtime = crate::fs::to_file_time(ts.last_write);
        let res = if meta.file_type().is_symlink() {
            filetime::set_symlink_file_times(ctx.path, atime, mtime)
        } else {
            filetime::set_file_times(ctx.path, atime, mtime)
        };
        res.map_err(|e| Error::Timestamps(e, ctx.path.to_path_buf()))
    }
}

fn create_directory(path: &Path) -> Result<()> {
    match fs::create_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
        Err(e) => Err(Error::Mkdir(e, path.to_path_buf())),
    }
}

fn write_file(path: &Path, stream: Option<&Stream>) -> Result<u64> {
    let file = File::create(path).map_err(|e| Error::Open(e, path.to_path_buf()))?;
    let Some(stream) = stream else {
        return Ok(0);
    };
    let mut writer = BufWriter::new(file);
    let bytes = copy_stream_to(stream, &mut writer, path)?;
    writer.flush().map_err(|e| Error::Write(e, path.to_path_buf()))?;
    Ok(bytes)
}

fn create_regular_file(ctx: EntryContext<'_>, table: &mut LookupTable) -> Result<u64> {
    let Some(id) = ctx.inode().resolve_stream(0, table)? else {
        return write_file(ctx.path, None);
    };

    if ctx.flags.is_link_mode() {
        if let Some(existing) = table.get(id).extracted_file.clone() {
            link_to_existing(&existing, ctx.path, ctx.flags)?;
            return Ok(0);
        }
    }

    let bytes = write_file(ctx.path, Some(table.get(id)))?;
    if ctx.flags.is_link_mode() {
        mark_extracted(table, id, ctx.path);
    }
    Ok(bytes)
}

fn mark_extracted(table: &mut LookupTable, id: StreamId, path: &Path) {
    table.get_mut(id).extracted_file = Some(path.to_path_buf());
}

fn link_to_existing(existing: &Path, path: &Path, flags: ExtractFlags) -> Result<()> {
    if flags.contains(ExtractFlags::HARDLINK) {
        tracing::trace!(from = %path.display(), to = %existing.display(), "hard linking");
        return fs::hard_link(existing, path).map_err(|e| Error::Link(e, path.to_path_buf()));
    }

    let target = relative_link_target(existing, path);
    tracing::trace!(from = %path.display(), to = %target.display(), "symlinking");
    create_symlink(&target, path, false).map_err(|e| Error::Link(e, path.to_path_buf()))
}

/// Target for a symlink at `link` pointing at `existing`, relative when both
/// resolve on the same filesystem tree.
fn relative_link_target(existing: &Path, link: &Path) -> PathBuf {
    let existing = fs::canonicalize(existing).unwrap_or_else(|_| existing.to_path_buf());
    let parent = link
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .and_then(|p| fs::canonicalize(p).ok());
    parent
        .and_then(|parent| pathdiff::diff_paths(&existing, parent))
        .unwrap_or(existing)
}

#[cfg(unix)]
fn create_symlink(target: &Path, path: &Path, _is_dir: bool) -> io::Result<()> {
    std::os::unix::fs::symlink(target, path)
}

#[cfg(windows)]
fn create_symlink(target: &Path, path: &Path, is_dir: bool) -> io::Result<()> {
    if is_dir {
        std::os::windows::fs::symlink_dir(target, path)
    } else {
        std::os::windows::fs::symlink_file(target, path)
    }
}

#[cfg(unix)]
fn apply_unix_data(ctx: EntryContext<'_>, table: &LookupTable) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    use crate::fs::UnixData;
    use crate::tree::UNIX_DATA_STREAM_NAME;

    let inode = ctx.inode();
    let Some(ads) = inode.find_ads(UNIX_DATA_STREAM_NAME) else {
        return Ok(());
    };
    let Some(id) = table.resolve(&ads.hash)? else {
        return Ok(());
    };
    let buf = read_stream(table.get(id))?;
    let Some(data) = UnixData::from_bytes(&buf) else {
        tracing::warn!(path = ctx.wim_path, "Ignoring malformed UNIX data");
        return Ok(());
    };

    match std::os::unix::fs::lchown(ctx.path, Some(data.uid), Some(data.gid)) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            tracing::warn!(
                path = %ctx.path.display(),
                uid = data.uid,
                gid = data.gid,
                "Cannot set file ownership"
            );
        }
        Err(e) => return Err(Error::Write(e, ctx.path.to_path_buf())),
    }

    if !inode.is_reparse_point() {
        fs::set_permissions(ctx.path, fs::Permissions::from_mode(data.mode & 0o7777))
            .map_err(|e| Error::Write(e, ctx.path.to_path_buf()))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn apply_unix_data(_ctx: EntryContext<'_>, _table: &LookupTable) -> Result<()> {
    Ok(())
}

/// Writes named streams as `path:name`. Only reachable where the native
/// filesystem has alternate streams.
fn write_alternate_streams(ctx: EntryContext<'_>, table: &LookupTable) -> Result<u64> {
    let inode = ctx.inode();
    if inode.is_reparse_point() {
        return Ok(0);
    }
    let mut bytes = 0;
    for (i, ads) in inode.ads.iter().enumerate() {
        if ads.name.is_empty() {
            continue;
        }
        let Some(id) = inode.resolve_stream(i + 1, table)? else {
            continue;
        };
        let mut stream_path = ctx.path.as_os_str().to_os_string();
        stream_path.push(":");
        stream_path.push(&ads.name);
        bytes += write_file(Path::new(&stream_path), Some(table.get(id)))?;
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Sha1Hash;

    #[test]
    fn directory_creation_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d");
        create_directory(&path).unwrap();
        create_directory(&path).unwrap();
        assert!(path.is_dir());

        let file = dir.path().join("f");
        fs::write(&file, b"x").unwrap();
        assert!(matches!(create_directory(&file), Err(Error::Mkdir(..))));
    }

    #[test]
    fn write_file_copies_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let stream = Stream::from_buffer(b"contents".to_vec());
        assert_eq!(write_file(&path, Some(&stream)).unwrap(), 8);
        assert_eq!(fs::read(&path).unwrap(), b"contents");
        assert_eq!(stream.hash, Sha1Hash::of(b"contents"));

        let empty = dir.path().join("e");
        assert_eq!(write_file(&empty, None).unwrap(), 0);
        assert_eq!(fs::metadata(&empty).unwrap().len(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn relative_symlink_target() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("a")).unwrap();
        fs::create_dir(dir.path().join("b")).unwrap();
        let existing = dir.path().join("a/file");
        fs::write(&existing, b"x").unwrap();

        let link = dir.path().join("b/link");
        assert_eq!(relative_link_target(&existing, &link), PathBuf::from("../a/file"));
        link_to_existing(&existing, &link, ExtractFlags::SYMLINK).unwrap();
        assert_eq!(fs::read(&link).unwrap(), b"x");
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
    }

    #[cfg(unix)]
    #[test]
    fn hard_link_shares_inode() {
        use std::os::unix::fs::MetadataExt;

        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("file");
        fs::write(&existing, b"x").unwrap();
        let link = dir.path().join("link");
        link_to_existing(&existing, &link, ExtractFlags::HARDLINK).unwrap();
        assert_eq!(
            fs::metadata(&existing).unwrap().ino(),
            fs::metadata(&link).unwrap().ino()
        );
    }
}
