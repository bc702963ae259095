//! Extraction of one subtree of one image to one target.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use super::apply::{Backend, EntryContext, FsBackend, VolumeMounter};
use super::dedup::{find_streams_for_extraction, StreamList, VisitState};
use super::plan::{calculate_bytes_to_extract, order_for_sequential_reads};
use super::progress::{ExtractProgress, ProgressMsg, Threshold};
use super::ExtractFlags;
use crate::error::{Error, Result};
use crate::lookup_table::{LookupTable, StreamId};
use crate::resource::copy_stream_to;
use crate::tree::{DentryId, DentryTree, InodeId};

pub(crate) struct TreeSource<'a> {
    pub wim_path: Option<&'a Path>,
    pub image: u32,
    pub image_name: &'a str,
    pub tree: &'a DentryTree,
}

struct Extraction<'a, F: ?Sized> {
    tree: &'a DentryTree,
    table: &'a mut LookupTable,
    root: DentryId,
    target: &'a Path,
    flags: ExtractFlags,
    backend: Backend,
    state: VisitState,
    paths: HashMap<DentryId, String>,
    counted_inodes: HashSet<InodeId>,
    counted_streams: HashSet<StreamId>,
    progress: ExtractProgress,
    callback: Option<&'a mut F>,
}

/// Extracts `source_path` of the image in `src` to `target`.
///
/// The backend is torn down on every path out of this function. An unmount
/// failure is only reported when nothing failed before it.
pub(crate) fn extract_tree<'a, F>(
    src: TreeSource<'a>,
    table: &'a mut LookupTable,
    source_path: &str,
    target: &'a Path,
    flags: ExtractFlags,
    callback: Option<&'a mut F>,
    mounter: Option<&dyn VolumeMounter>,
) -> Result<()>
where
    F: FnMut(ProgressMsg, &ExtractProgress) -> ControlFlow<()> + ?Sized,
{
    let backend = mount_backend(target, flags, mounter)?;
    let mut extraction = Extraction {
        tree: src.tree,
        table,
        root: src.tree.root(),
        target,
        flags,
        backend,
        state: VisitState::default(),
        paths: HashMap::new(),
        counted_inodes: HashSet::new(),
        counted_streams: HashSet::new(),
        progress: ExtractProgress {
            image: src.image,
            image_name: src.image_name.to_string(),
            wim_path: src.wim_path.map(Path::to_path_buf),
            source_path: source_path.to_string(),
            target: target.to_path_buf(),
            flags,
            ..Default::default()
        },
        callback,
    };

    let ret = extraction.run(source_path);
    let teardown = extraction.teardown();
    ret.and(teardown)
}

fn mount_backend(
    target: &Path,
    flags: ExtractFlags,
    mounter: Option<&dyn VolumeMounter>,
) -> Result<Backend> {
    if !flags.contains(ExtractFlags::NTFS) {
        return Ok(Backend::Filesystem(FsBackend::new()));
    }
    let mounter = mounter
        .ok_or_else(|| Error::UnsupportedFeature("no volume mounter is available".into()))?;
    tracing::debug!(target = %target.display(), "mounting volume");
    let volume = mounter.mount(target).map_err(|e| {
        tracing::error!(target = %target.display(), error = %e, "Failed to mount volume");
        Error::BackendMount(e, target.to_path_buf())
    })?;
    Ok(Backend::MountedVolume(volume))
}

impl<'a, F> Extraction<'a, F>
where
    F: FnMut(ProgressMsg, &ExtractProgress) -> ControlFlow<()> + ?Sized,
{
    fn run(&mut self, source_path: &str) -> Result<()> {
        let tree = self.tree;
        self.root = tree.lookup(source_path).ok_or_else(|| {
            tracing::error!(path = source_path, "Path does not exist in the image");
            Error::PathNotFound(source_path.to_string())
        })?;
        for id in tree.preorder(self.root) {
            self.paths.insert(id, tree.full_path(id));
        }

        let include_ads = self.backend.capabilities().alternate_streams;
        let mut list =
            find_streams_for_extraction(tree, self.root, self.table, include_ads, &mut self.state)?;
        let (num_streams, total_bytes) = calculate_bytes_to_extract(&list, self.table, self.flags);
        self.progress.num_streams = num_streams;
        self.progress.total_bytes = total_bytes;
        self.progress.completed_bytes = 0;

        if self.flags.contains(ExtractFlags::TO_STDOUT) {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            extract_dentry_to_writer(tree, self.root, self.table, &mut out)?;
            return out
                .flush()
                .map_err(|e| Error::Write(e, PathBuf::from("<stdout>")));
        }

        let (begin, end) = if source_path.is_empty() {
            (ProgressMsg::ExtractImageBegin, ProgressMsg::ExtractImageEnd)
        } else {
            (ProgressMsg::ExtractTreeBegin, ProgressMsg::ExtractTreeEnd)
        };
        self.emit(begin)?;

        if self.flags.contains(ExtractFlags::SEQUENTIAL) {
            order_for_sequential_reads(&mut list, self.table, &mut self.flags);
        }

        self.emit(ProgressMsg::ExtractDirStructureBegin)?;
        self.flags.insert(ExtractFlags::NO_STREAMS);
        let res = self.apply_dir_structure(&list);
        self.flags.remove(ExtractFlags::NO_STREAMS);
        res?;
        self.emit(ProgressMsg::ExtractDirStructureEnd)?;

        let on_filesystem = matches!(self.backend, Backend::Filesystem(_));
        if self.flags.contains(ExtractFlags::RPFIX) && on_filesystem {
            let realpath = fs::canonicalize(self.target)
                .map_err(|e| Error::Stat(e, self.target.to_path_buf()))?;
            self.backend.set_target_realpath(Some(realpath));
        }

        self.apply_stream_list(&list)?;

        self.emit(ProgressMsg::ApplyTimestamps)?;
        for dentry in tree.postorder(self.root) {
            self.apply_timestamps(dentry)?;
        }

        self.emit(end)
    }

    fn apply_dir_structure(&mut self, list: &StreamList) -> Result<()> {
        for dentry in self.tree.preorder(self.root) {
            self.maybe_apply_dentry(dentry, list)?;
        }
        Ok(())
    }

    fn apply_stream_list(&mut self, list: &StreamList) -> Result<()> {
        let total = self.progress.total_bytes;
        let step = total / 100;
        let mut threshold = Threshold::new(step);

        for &stream in list.streams() {
            for &dentry in list.fan_out(stream) {
                self.maybe_apply_dentry(dentry, list)?;
                if self.callback.is_some() && threshold.crossed(self.progress.completed_bytes) {
                    self.emit(ProgressMsg::ExtractStreams)?;
                    threshold.advance(self.progress.completed_bytes, total, step);
                }
            }
        }
        Ok(())
    }

    fn maybe_apply_dentry(&mut self, dentry: DentryId, list: &StreamList) -> Result<()> {
        if !self.state.needs_extraction(dentry) {
            return Ok(());
        }
        let tree = self.tree;
        let inode_id = tree.dentry(dentry).inode;
        let inode = tree.inode(inode_id);
        let unnamed = list.resolved(inode_id, 0);

        // Regular content is written by the stream pass.
        if self.flags.contains(ExtractFlags::NO_STREAMS)
            && !inode.is_directory()
            && unnamed.is_some()
        {
            return Ok(());
        }

        let path = self.output_path(dentry);
        let wim_path = self.paths.get(&dentry).cloned().unwrap_or_default();
        if self.flags.contains(ExtractFlags::VERBOSE) && self.callback.is_some() {
            self.progress.cur_path = wim_path.clone();
            self.emit(ProgressMsg::ExtractDentry)?;
        }

        let ctx = EntryContext {
            path: &path,
            wim_path: &wim_path,
            tree,
            dentry,
            flags: self.flags,
        };
        let bytes = self.backend.materialize(ctx, self.table)?;

        let first = if self.flags.is_link_mode() {
            unnamed.map_or(true, |s| self.counted_streams.insert(s))
        } else {
            self.counted_inodes.insert(inode_id)
        };
        if first {
            self.progress.completed_bytes += bytes;
        }

        self.state.mark_extracted(dentry);
        Ok(())
    }

    fn apply_timestamps(&mut self, dentry: DentryId) -> Result<()> {
        let path = self.output_path(dentry);
        let wim_path = self.paths.get(&dentry).cloned().unwrap_or_default();
        let ctx = EntryContext {
            path: &path,
            wim_path: &wim_path,
            tree: self.tree,
            dentry,
            flags: self.flags,
        };
        self.backend.apply_timestamps(ctx, self.table)
    }

    fn output_path(&self, dentry: DentryId) -> PathBuf {
        if dentry == self.root {
            self.target.to_path_buf()
        } else {
            self.target.join(self.tree.relative_path(self.root, dentry))
        }
    }

    fn emit(&mut self, msg: ProgressMsg) -> Result<()> {
        if let Some(callback) = self.callback.as_deref_mut() {
            if callback(msg, &self.progress).is_break() {
                tracing::debug!(?msg, "extraction aborted by progress callback");
                return Err(Error::Aborted);
            }
        }
        Ok(())
    }

    fn teardown(&mut self) -> Result<()> {
        self.state.reset();
        self.paths.clear();
        self.counted_inodes.clear();
        self.counted_streams.clear();
        self.backend.set_target_realpath(None);
        self.backend.unmount().map_err(|e| {
            tracing::error!(
                target = %self.target.display(),
                error = %e,
                "Failed to unmount volume"
            );
            Error::BackendUnmount(e, self.target.to_path_buf())
        })
    }
}

/// Copies the unnamed stream of a regular file to `writer`.
pub(crate) fn extract_dentry_to_writer<W: Write>(
    tree: &DentryTree,
    dentry: DentryId,
    table: &LookupTable,
    writer: &mut W,
) -> Result<u64> {
    let inode = tree.dentry_inode(dentry);
    if !inode.is_regular_file() {
        let path = tree.full_path(dentry);
        tracing::error!(path = %path, "Not a regular file");
        return Err(Error::NotARegularFile(path));
    }
    match inode.resolve_stream(0, table)? {
        Some(id) => copy_stream_to(table.get(id), writer, Path::new("<stdout>")),
        None => Ok(0),
    }
}
