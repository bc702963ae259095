use std::path::PathBuf;

use serde_json::json;
use wim_format::{ImageInfo, Wim, WriteFlags};

use super::{format_size, format_time, open_wim, resolve_image};
use crate::error::{Error, Result};

#[derive(Debug)]
pub struct InfoArgs {
    pub path: PathBuf,
    pub image: Option<String>,
    pub boot: Option<u32>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub check: bool,
    pub json: bool,
}

const LABEL_WIDTH: usize = 24;

fn guid_hex(wim: &Wim) -> String {
    wim.header().guid.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Applies the requested edits. Returns whether anything changed.
fn apply_edits(wim: &mut Wim, image: Option<u32>, args: &InfoArgs) -> Result<bool> {
    let mut changed = false;
    if let Some(boot) = args.boot {
        if boot != wim.boot_index() {
            wim.set_boot_index(boot)
                .map_err(|source| Error::UpdateInfo { source })?;
            changed = true;
        }
    }
    if let Some(image) = image {
        if let Some(name) = &args.name {
            if wim.image_name(image) != name {
                wim.set_image_name(image, name)
                    .map_err(|source| Error::UpdateInfo { source })?;
                changed = true;
            }
        }
        if let Some(description) = &args.description {
            wim.set_image_description(image, description)
                .map_err(|source| Error::UpdateInfo { source })?;
            changed = true;
        }
    }
    Ok(changed)
}

fn image_json(index: u32, info: &ImageInfo) -> serde_json::Value {
    json!({
        "index": index,
        "name": info.name,
        "description": info.description,
        "directories": info.dir_count,
        "files": info.file_count,
        "total_bytes": info.total_bytes,
        "hard_link_bytes": info.hard_link_bytes,
        "creation_time": format_time(info.creation_time),
        "last_modification_time": format_time(info.last_modification_time),
    })
}

fn print_json(wim: &Wim, images: &[u32], integrity: Option<bool>) -> Result<()> {
    let header = wim.header();
    let value = json!({
        "path": wim.path().map(|p| p.display().to_string()),
        "guid": guid_hex(wim),
        "version": header.version,
        "part_number": header.part_number,
        "total_parts": header.total_parts,
        "image_count": wim.image_count(),
        "boot_index": wim.boot_index(),
        "compression": wim.compression().to_string(),
        "chunk_size": header.chunk_size,
        "has_integrity_table": header.integrity.size != 0,
        "integrity_ok": integrity,
        "rpfix": header.flags.contains(wim_format::HeaderFlags::RP_FIX),
        "images": images
            .iter()
            .filter_map(|&i| wim.image_info(i).map(|info| image_json(i, info)))
            .collect::<Vec<_>>(),
    });
    let out = serde_json::to_string_pretty(&value).map_err(|source| Error::Json { source })?;
    println!("{}", out);
    Ok(())
}

fn print_row(label: &str, value: impl std::fmt::Display) {
    println!("{:width$}{}", format!("{}:", label), value, width = LABEL_WIDTH);
}

fn print_image(index: u32, info: &ImageInfo) {
    println!();
    print_row("Index", index);
    print_row("Name", &info.name);
    if !info.description.is_empty() {
        let indent = " ".repeat(LABEL_WIDTH);
        let options = textwrap::Options::new(72).subsequent_indent(&indent);
        print_row("Description", textwrap::fill(&info.description, options));
    }
    print_row("Directories", info.dir_count);
    print_row("Files", info.file_count);
    print_row("Total size", format_size(info.total_bytes));
    print_row("Hard link size", format_size(info.hard_link_bytes));
    print_row("Creation time", format_time(info.creation_time));
    print_row("Last modification time", format_time(info.last_modification_time));
}

fn print_text(wim: &Wim, images: &[u32], integrity: Option<bool>) {
    let header = wim.header();
    if let Some(path) = wim.path() {
        print_row("Path", path.display());
    }
    print_row("GUID", guid_hex(wim));
    print_row("Version", format!("{:#x}", header.version));
    print_row("Part", format!("{}/{}", header.part_number, header.total_parts));
    print_row("Image count", wim.image_count());
    print_row("Boot index", wim.boot_index());
    print_row("Compression", wim.compression());
    print_row("Chunk size", format_size(header.chunk_size as u64));
    print_row(
        "Integrity",
        match integrity {
            Some(true) => "verified",
            Some(false) => "MISMATCH",
            None if header.integrity.size != 0 => "present",
            None => "none",
        },
    );
    print_row("Flags", format!("{:?}", header.flags));
    for &i in images {
        if let Some(info) = wim.image_info(i) {
            print_image(i, info);
        }
    }
}

pub fn run(args: InfoArgs) -> Result<()> {
    let mut wim = open_wim(&args.path)?;
    let image = args
        .image
        .as_deref()
        .map(|i| resolve_image(&wim, &args.path, i))
        .transpose()?;

    if apply_edits(&mut wim, image, &args)? {
        let mut flags = WriteFlags::empty();
        flags.set(
            WriteFlags::CHECK_INTEGRITY,
            args.check || wim.header().integrity.size != 0,
        );
        wim.commit(flags).map_err(|source| Error::WriteArchive {
            path: args.path.clone(),
            source,
        })?;
    }

    let integrity = if args.check {
        match wim.check_integrity() {
            Ok(true) => Some(true),
            Ok(false) => None,
            Err(wim_format::Error::IntegrityMismatch { chunk }) => {
                tracing::error!(chunk, "Integrity table mismatch");
                Some(false)
            }
            Err(source) => {
                return Err(Error::Integrity {
                    path: args.path.clone(),
                    source,
                })
            }
        }
    } else {
        None
    };

    let images: Vec<u32> = match image {
        Some(i) => vec![i],
        None => (1..=wim.image_count()).collect(),
    };
    if args.json {
        print_json(&wim, &images, integrity)
    } else {
        print_text(&wim, &images, integrity);
        Ok(())
    }
}
