use std::path::{Path, PathBuf};

use wim_format::{ExtractCommand, ExtractFlags, ExtractOptions};

use super::{open_parts, open_wim, print_progress, resolve_image};
use crate::error::{Error, Result};

#[derive(Debug)]
pub struct ExtractArgs {
    pub path: PathBuf,
    pub image: String,
    pub paths: Vec<String>,
    pub dest: PathBuf,
    pub to_stdout: bool,
    pub unix_data: bool,
    pub parts: Vec<PathBuf>,
    pub verbose: bool,
}

/// `dest/<last component of source>`, or `dest` itself for the root.
fn dest_for(dest: &Path, source: &str) -> PathBuf {
    match source.trim_end_matches(['/', '\\']).rsplit(['/', '\\']).next() {
        Some(name) if !name.is_empty() => dest.join(name),
        _ => dest.to_path_buf(),
    }
}

pub fn run(args: ExtractArgs) -> Result<()> {
    let mut wim = open_wim(&args.path)?;
    let parts = open_parts(&args.parts)?;
    let image = resolve_image(&wim, &args.path, &args.image)?;

    let mut flags = ExtractFlags::empty();
    flags.set(ExtractFlags::TO_STDOUT, args.to_stdout);
    flags.set(ExtractFlags::UNIX_DATA, args.unix_data);
    flags.set(ExtractFlags::VERBOSE, args.verbose);

    let cmds: Vec<ExtractCommand> = args
        .paths
        .iter()
        .map(|source| ExtractCommand::new(source.as_str(), dest_for(&args.dest, source)))
        .collect();

    let mut options = ExtractOptions {
        additional_parts: &parts,
        ..Default::default()
    };
    if !args.to_stdout {
        options = options.with_progress(print_progress(args.verbose));
    }

    wim.extract_files(image, &cmds, flags, options)
        .map_err(|source| Error::Extract {
            path: args.path.clone(),
            source,
        })
}
