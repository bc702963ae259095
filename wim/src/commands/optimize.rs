use std::fs;
use std::path::PathBuf;

use wim_format::WriteFlags;

use super::{format_size, open_wim};
use crate::error::{Error, Result};

pub fn run(path: PathBuf, check: bool, verbose: bool) -> Result<()> {
    let before = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
    let mut wim = open_wim(&path)?;

    let mut flags = WriteFlags::REBUILD;
    flags.set(WriteFlags::CHECK_INTEGRITY, check);
    flags.set(WriteFlags::SHOW_PROGRESS, verbose);
    wim.commit(flags).map_err(|source| Error::WriteArchive {
        path: path.clone(),
        source,
    })?;

    let after = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
    println!(
        "{}: {} -> {}",
        path.display(),
        format_size(before),
        format_size(after)
    );
    Ok(())
}
