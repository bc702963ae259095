use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use wim_format::fs::system_time_from_filetime;
use wim_format::{ExtractProgress, ProgressMsg, Wim};

use crate::error::{Error, Result};

pub mod apply;
pub mod capture;
pub mod extract;
pub mod info;
pub mod optimize;

pub use apply::{run as apply, ApplyArgs};
pub use capture::{run as capture, CaptureArgs};
pub use extract::{run as extract, ExtractArgs};
pub use info::{run as info, InfoArgs};
pub use optimize::run as optimize;

pub(crate) fn open_wim(path: &Path) -> Result<Wim> {
    Wim::open(path).map_err(|source| Error::OpenArchive {
        path: path.to_path_buf(),
        source,
    })
}

/// Opens the remaining parts of a split WIM.
pub(crate) fn open_parts(parts: &[PathBuf]) -> Result<Vec<Wim>> {
    parts.iter().map(|p| open_wim(p)).collect()
}

pub(crate) fn resolve_image(wim: &Wim, path: &Path, image: &str) -> Result<u32> {
    wim.resolve_image(image).ok_or_else(|| Error::NoSuchImage {
        image: image.to_string(),
        path: path.to_path_buf(),
    })
}

#[inline(always)]
pub(crate) fn format_size(bytes: u64) -> String {
    use humansize::{file_size_opts as options, FileSize};
    bytes
        .file_size(options::BINARY)
        .unwrap_or_else(|_| bytes.to_string())
}

#[inline(always)]
pub(crate) fn format_time(filetime: u64) -> String {
    if filetime == 0 {
        return "-".into();
    }
    let datetime: chrono::DateTime<chrono::Utc> = system_time_from_filetime(filetime).into();
    datetime.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Progress printer for apply and extract. Stream progress goes to stderr
/// on a single line.
pub(crate) fn print_progress(
    verbose: bool,
) -> impl FnMut(ProgressMsg, &ExtractProgress) -> ControlFlow<()> {
    let mut last_percent: Option<u64> = None;
    move |msg, p| {
        match msg {
            ProgressMsg::ExtractImageBegin => {
                let name = if p.image_name.is_empty() {
                    String::new()
                } else {
                    format!(" (\"{}\")", p.image_name)
                };
                eprintln!("Applying image {}{} to {}", p.image, name, p.target.display());
            }
            ProgressMsg::ExtractTreeBegin => {
                eprintln!(
                    "Extracting `{}` from image {} to {}",
                    p.source_path,
                    p.image,
                    p.target.display()
                );
            }
            ProgressMsg::ExtractDirStructureBegin if verbose => {
                eprintln!("Creating directory structure");
            }
            ProgressMsg::ExtractDentry if verbose && !p.cur_path.is_empty() => {
                eprintln!("{}", p.cur_path);
            }
            ProgressMsg::ExtractStreams => {
                let percent = if p.total_bytes == 0 {
                    100
                } else {
                    p.completed_bytes.saturating_mul(100) / p.total_bytes
                };
                if last_percent != Some(percent) {
                    if p.flags.is_link_mode() {
                        eprint!(
                            "\r{} of {} streams ({}%) done",
                            p.completed_bytes, p.total_bytes, percent
                        );
                    } else {
                        eprint!(
                            "\r{} of {} ({}%) done",
                            format_size(p.completed_bytes),
                            format_size(p.total_bytes),
                            percent
                        );
                    }
                    last_percent = Some(percent);
                }
            }
            ProgressMsg::ApplyTimestamps => {
                if last_percent.take().is_some() {
                    eprintln!();
                }
            }
            ProgressMsg::ExtractImageEnd | ProgressMsg::ExtractTreeEnd => {
                if last_percent.take().is_some() {
                    eprintln!();
                }
                eprintln!("Done extracting to {}", p.target.display());
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }
}
