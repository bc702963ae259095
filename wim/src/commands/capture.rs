use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use wim_format::tree::DentryId;
use wim_format::{hash_file, ImageBuilder, ImageSelector, Sha1Hash, Wim, WriteFlags};

use super::{format_size, open_wim};
use crate::error::{Error, Result};

#[derive(Debug)]
pub struct CaptureArgs {
    pub source: PathBuf,
    pub path: PathBuf,
    pub name: Option<String>,
    pub description: String,
    pub check: bool,
    pub unix_data: bool,
    pub rpfix: bool,
    pub boot: bool,
    pub verbose: bool,
}

fn capture_err(path: &Path) -> impl FnOnce(wim_format::Error) -> Error + '_ {
    move |source| Error::Capture {
        path: path.to_path_buf(),
        source,
    }
}

fn stat(path: &Path) -> Result<fs::Metadata> {
    fs::symlink_metadata(path)
        .map_err(|e| wim_format::Error::Stat(e, path.to_path_buf()))
        .map_err(capture_err(path))
}

/// Refuses output paths that would end up inside the captured tree.
fn check_not_inside(source: &Path, output: &Path) -> Result<()> {
    let parent = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    if let Ok(parent) = parent.canonicalize() {
        if parent.starts_with(source) {
            return Err(Error::CaptureIntoSelf {
                path: output.to_path_buf(),
            });
        }
    }
    Ok(())
}

fn build_image(source: &Path, args: &CaptureArgs) -> Result<ImageBuilder> {
    let mut builder = ImageBuilder::new().with_unix_data(args.unix_data);
    if args.rpfix {
        builder = builder.with_reparse_fixup(source);
    }

    let paths = jwalk::WalkDir::new(source)
        .skip_hidden(false)
        .sort(true)
        .into_iter()
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|source| Error::ProcessDirEntry { source })?;

    let hashes: HashMap<PathBuf, (Sha1Hash, u64)> = paths
        .par_iter()
        .filter(|p| {
            fs::symlink_metadata(p)
                .map(|m| m.file_type().is_file())
                .unwrap_or(false)
        })
        .map(|p| {
            hash_file(p)
                .map(|hashed| (p.clone(), hashed))
                .map_err(capture_err(p))
        })
        .collect::<Result<_>>()?;
    tracing::debug!(files = hashes.len(), "hashed file content");

    let root = builder.root();
    builder.apply_metadata(root, &stat(source)?);

    let mut ids: HashMap<PathBuf, DentryId> = HashMap::new();
    #[cfg(unix)]
    let mut links: HashMap<(u64, u64), DentryId> = HashMap::new();

    for path in paths.iter().filter(|p| p.as_path() != source) {
        let parent = match path.parent() {
            Some(p) if p == source => root,
            Some(p) => match ids.get(p) {
                Some(id) => *id,
                None => {
                    tracing::warn!(
                        path = %path.display(),
                        "Skipping entry with no captured parent"
                    );
                    continue;
                }
            },
            None => continue,
        };
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => {
                tracing::warn!(path = %path.display(), "Skipping file name that is not UTF-8");
                continue;
            }
        };

        let meta = stat(path)?;
        let file_type = meta.file_type();

        let id = if file_type.is_file() {
            #[cfg(unix)]
            let link_key = {
                use std::os::unix::fs::MetadataExt;
                (meta.nlink() > 1).then(|| (meta.dev(), meta.ino()))
            };
            #[cfg(unix)]
            if let Some(existing) = link_key.and_then(|k| links.get(&k)) {
                builder
                    .add_hard_link(parent, name, *existing)
                    .map_err(capture_err(path))?;
                continue;
            }

            let (hash, size) = match hashes.get(path) {
                Some(hashed) => *hashed,
                None => hash_file(path).map_err(capture_err(path))?,
            };
            let id = builder
                .add_prehashed_file(parent, name, path, hash, size)
                .map_err(capture_err(path))?;
            builder.apply_metadata(id, &meta);

            #[cfg(unix)]
            if let Some(key) = link_key {
                links.insert(key, id);
            }
            id
        } else if file_type.is_dir() || file_type.is_symlink() {
            builder.add_path(parent, name, path).map_err(capture_err(path))?
        } else {
            tracing::warn!(path = %path.display(), "Skipping special file");
            continue;
        };

        if args.verbose {
            eprintln!("{}", path.strip_prefix(source).unwrap_or(path).display());
        }
        ids.insert(path.clone(), id);
    }

    Ok(builder)
}

pub fn run(args: CaptureArgs) -> Result<()> {
    let source = args
        .source
        .canonicalize()
        .map_err(|e| wim_format::Error::Stat(e, args.source.clone()))
        .map_err(capture_err(&args.source))?;
    check_not_inside(&source, &args.path)?;

    let mut wim = if args.path.exists() {
        open_wim(&args.path)?
    } else {
        Wim::new()
    };

    let builder = build_image(&source, &args)?;
    let name = args.name.clone().unwrap_or_else(|| {
        source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    });
    let image = wim
        .add_image(builder, &name, &args.description)
        .map_err(capture_err(&source))?;
    if args.boot {
        wim.set_boot_index(image).map_err(capture_err(&source))?;
    }

    let mut flags = WriteFlags::empty();
    flags.set(WriteFlags::CHECK_INTEGRITY, args.check);
    flags.set(WriteFlags::SHOW_PROGRESS, args.verbose);
    let written = if wim.path().is_some() {
        wim.overwrite(flags)
    } else {
        wim.write(&args.path, ImageSelector::All, flags)
    };
    written.map_err(|source| Error::WriteArchive {
        path: args.path.clone(),
        source,
    })?;

    let size = fs::metadata(&args.path).map(|m| m.len()).unwrap_or(0);
    println!(
        "Captured image {} (\"{}\") into {} [{}]",
        image,
        name,
        args.path.display(),
        format_size(size)
    );
    Ok(())
}
