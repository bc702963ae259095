use std::path::PathBuf;

use wim_format::{ExtractFlags, ExtractOptions, ImageSelector};

use super::{open_parts, open_wim, print_progress, resolve_image};
use crate::error::{Error, Result};

#[derive(Debug)]
pub struct ApplyArgs {
    pub path: PathBuf,
    pub image: Option<String>,
    pub target: PathBuf,
    pub hardlink: bool,
    pub symlink: bool,
    pub sequential: bool,
    pub unix_data: bool,
    pub rpfix: bool,
    pub norpfix: bool,
    pub parts: Vec<PathBuf>,
    pub verbose: bool,
}

impl ApplyArgs {
    fn flags(&self) -> ExtractFlags {
        let mut flags = ExtractFlags::empty();
        flags.set(ExtractFlags::HARDLINK, self.hardlink);
        flags.set(ExtractFlags::SYMLINK, self.symlink);
        flags.set(ExtractFlags::SEQUENTIAL, self.sequential);
        flags.set(ExtractFlags::UNIX_DATA, self.unix_data);
        flags.set(ExtractFlags::RPFIX, self.rpfix);
        flags.set(ExtractFlags::NORPFIX, self.norpfix);
        flags.set(ExtractFlags::VERBOSE, self.verbose);
        flags
    }
}

pub fn run(args: ApplyArgs) -> Result<()> {
    let mut wim = open_wim(&args.path)?;
    let parts = open_parts(&args.parts)?;

    let image = match args.image.as_deref() {
        Some("all") | Some("*") => ImageSelector::All,
        Some(image) => ImageSelector::Index(resolve_image(&wim, &args.path, image)?),
        None if wim.image_count() == 1 => ImageSelector::Index(1),
        None => {
            return Err(Error::ImageRequired {
                path: args.path.clone(),
                count: wim.image_count(),
            })
        }
    };

    let options = ExtractOptions {
        additional_parts: &parts,
        ..Default::default()
    }
    .with_progress(print_progress(args.verbose));

    wim.extract_image(image, &args.target, args.flags(), options)
        .map_err(|source| Error::Extract {
            path: args.path.clone(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wim_format::{ImageBuilder, Wim, WriteFlags};

    fn args(path: PathBuf, image: Option<&str>, target: PathBuf) -> ApplyArgs {
        ApplyArgs {
            path,
            image: image.map(String::from),
            target,
            hardlink: false,
            symlink: false,
            sequential: true,
            unix_data: false,
            rpfix: false,
            norpfix: false,
            parts: vec![],
            verbose: false,
        }
    }

    fn write_wim(path: &std::path::Path, names: &[&str]) {
        let mut wim = Wim::new();
        for name in names {
            let mut b = ImageBuilder::new();
            let root = b.root();
            let dir = b.add_directory(root, "etc").unwrap();
            b.add_file(dir, "hostname", name.as_bytes().to_vec()).unwrap();
            wim.add_image(b, name, "").unwrap();
        }
        wim.write(path, ImageSelector::All, WriteFlags::empty()).unwrap();
    }

    #[test]
    fn applies_single_image_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let wim = dir.path().join("one.wim");
        write_wim(&wim, &["base"]);
        let target = dir.path().join("out");
        run(args(wim, None, target.clone())).unwrap();
        assert_eq!(std::fs::read(target.join("etc/hostname")).unwrap(), b"base");
    }

    #[test]
    fn multi_image_needs_a_selection() {
        let dir = tempfile::tempdir().unwrap();
        let wim = dir.path().join("two.wim");
        write_wim(&wim, &["a", "b"]);
        assert!(matches!(
            run(args(wim.clone(), None, dir.path().join("x"))),
            Err(Error::ImageRequired { count: 2, .. })
        ));
        assert!(matches!(
            run(args(wim.clone(), Some("c"), dir.path().join("x"))),
            Err(Error::NoSuchImage { .. })
        ));

        let target = dir.path().join("all");
        run(args(wim, Some("all"), target.clone())).unwrap();
        assert_eq!(std::fs::read(target.join("a/etc/hostname")).unwrap(), b"a");
        assert_eq!(std::fs::read(target.join("b/etc/hostname")).unwrap(), b"b");
    }
}
