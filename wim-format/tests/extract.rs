//! End-to-end extraction from WIM files written to disk.

use std::fs;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use wim_format::{
    Error, ExtractCommand, ExtractFlags, ExtractOptions, ExtractProgress, ImageBuilder,
    ImageSelector, ProgressMsg, Wim, WriteFlags,
};

/// Writes a WIM with one image per name. Every image holds two files with
/// the same content and one file named after the image.
fn create_wim(dir: &TempDir, names: &[&str]) -> PathBuf {
    let path = dir.path().join("test.wim");
    let mut wim = Wim::new();
    for name in names {
        let mut b = ImageBuilder::new();
        let root = b.root();
        let docs = b.add_directory(root, "docs").unwrap();
        b.add_file(docs, "readme.txt", b"shared readme".to_vec()).unwrap();
        b.add_file(root, "copy.txt", b"shared readme".to_vec()).unwrap();
        b.add_file(root, "name.txt", name.as_bytes().to_vec()).unwrap();
        wim.add_image(b, name, "test image").unwrap();
    }
    wim.write(&path, ImageSelector::All, WriteFlags::empty())
        .unwrap();
    path
}

fn read(path: &Path) -> Vec<u8> {
    fs::read(path).unwrap()
}

#[test]
fn extract_whole_image() {
    let dir = TempDir::new().unwrap();
    let path = create_wim(&dir, &["base"]);
    let target = dir.path().join("out");

    let mut wim = Wim::open(&path).unwrap();
    wim.extract_image(
        ImageSelector::Index(1),
        &target,
        ExtractFlags::empty(),
        ExtractOptions::default(),
    )
    .unwrap();

    assert_eq!(read(&target.join("docs/readme.txt")), b"shared readme");
    assert_eq!(read(&target.join("copy.txt")), b"shared readme");
    assert_eq!(read(&target.join("name.txt")), b"base");
}

#[test]
fn progress_reports_every_phase() {
    let dir = TempDir::new().unwrap();
    let path = create_wim(&dir, &["base"]);
    let target = dir.path().join("out");

    let mut seen: Vec<(ProgressMsg, u64, u64)> = vec![];
    {
        let options = ExtractOptions::default().with_progress(|msg, p: &ExtractProgress| {
            seen.push((msg, p.completed_bytes, p.total_bytes));
            ControlFlow::Continue(())
        });
        let mut wim = Wim::open(&path).unwrap();
        wim.extract_image(ImageSelector::Index(1), &target, ExtractFlags::SEQUENTIAL, options)
            .unwrap();
    }

    let msgs: Vec<ProgressMsg> = seen.iter().map(|(m, _, _)| *m).collect();
    assert_eq!(msgs.first(), Some(&ProgressMsg::ExtractImageBegin));
    assert_eq!(msgs.last(), Some(&ProgressMsg::ExtractImageEnd));
    let order = [
        ProgressMsg::ExtractDirStructureBegin,
        ProgressMsg::ExtractDirStructureEnd,
        ProgressMsg::ExtractStreams,
        ProgressMsg::ApplyTimestamps,
    ];
    let positions: Vec<usize> = order
        .iter()
        .map(|m| msgs.iter().position(|x| x == m).unwrap())
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));

    // Two inodes share "shared readme" (13 bytes each) plus "base".
    let (_, completed, total) = seen.last().copied().unwrap();
    assert_eq!(total, 13 * 2 + 4);
    assert_eq!(completed, total);
}

#[cfg(unix)]
#[test]
fn hardlink_mode_shares_inodes() {
    use std::os::unix::fs::MetadataExt;

    let dir = TempDir::new().unwrap();
    let path = create_wim(&dir, &["base"]);
    let mut wim = Wim::open(&path).unwrap();

    let normal = dir.path().join("normal");
    wim.extract_image(
        ImageSelector::Index(1),
        &normal,
        ExtractFlags::empty(),
        ExtractOptions::default(),
    )
    .unwrap();
    let a = fs::metadata(normal.join("docs/readme.txt")).unwrap();
    let b = fs::metadata(normal.join("copy.txt")).unwrap();
    assert_ne!(a.ino(), b.ino());

    let linked = dir.path().join("linked");
    wim.extract_image(
        ImageSelector::Index(1),
        &linked,
        ExtractFlags::HARDLINK,
        ExtractOptions::default(),
    )
    .unwrap();
    let a = fs::metadata(linked.join("docs/readme.txt")).unwrap();
    let b = fs::metadata(linked.join("copy.txt")).unwrap();
    assert_eq!(a.ino(), b.ino());
    assert_eq!(read(&linked.join("copy.txt")), b"shared readme");
}

#[test]
fn all_images_go_to_named_subdirectories() {
    let dir = TempDir::new().unwrap();
    let path = create_wim(&dir, &["first", "", "bad/name"]);
    let target = dir.path().join("all");

    let mut wim = Wim::open(&path).unwrap();
    wim.extract_image(
        ImageSelector::All,
        &target,
        ExtractFlags::empty(),
        ExtractOptions::default(),
    )
    .unwrap();

    assert_eq!(read(&target.join("first/name.txt")), b"first");
    assert_eq!(read(&target.join("2/name.txt")), b"");
    assert_eq!(read(&target.join("3/name.txt")), b"bad/name");
}

#[test]
fn all_images_need_a_directory_target() {
    let dir = TempDir::new().unwrap();
    let path = create_wim(&dir, &["a", "b"]);
    let file = dir.path().join("file");
    fs::write(&file, b"").unwrap();

    let mut wim = Wim::open(&path).unwrap();
    let res = wim.extract_image(
        ImageSelector::All,
        &file,
        ExtractFlags::empty(),
        ExtractOptions::default(),
    );
    assert!(matches!(res, Err(Error::NotADirectory(_))));
}

#[test]
fn extract_files_runs_a_batch() {
    let dir = TempDir::new().unwrap();
    let path = create_wim(&dir, &["base"]);
    let out = dir.path().join("batch");
    fs::create_dir(&out).unwrap();

    let mut wim = Wim::open(&path).unwrap();
    let cmds = [
        ExtractCommand::new("/docs", out.join("docs")),
        ExtractCommand::new("name.txt", out.join("renamed.txt")),
    ];
    wim.extract_files(1, &cmds, ExtractFlags::empty(), ExtractOptions::default())
        .unwrap();

    assert_eq!(read(&out.join("docs/readme.txt")), b"shared readme");
    assert_eq!(read(&out.join("renamed.txt")), b"base");
    assert!(!out.join("copy.txt").exists());
}

#[test]
fn invalid_commands_are_rejected() {
    let dir = TempDir::new().unwrap();
    let path = create_wim(&dir, &["base"]);
    let out = dir.path().join("rejected");
    let mut wim = Wim::open(&path).unwrap();

    let both = ExtractFlags::SYMLINK | ExtractFlags::HARDLINK;
    let res = wim.extract_image(ImageSelector::Index(1), &out, both, ExtractOptions::default());
    assert!(matches!(res, Err(Error::InvalidParameter(_))));

    let fix = ExtractFlags::RPFIX | ExtractFlags::NORPFIX;
    let res = wim.extract_image(ImageSelector::Index(1), &out, fix, ExtractOptions::default());
    assert!(matches!(res, Err(Error::InvalidParameter(_))));

    let res = wim.extract_image(
        ImageSelector::Index(1),
        &out,
        ExtractFlags::NTFS,
        ExtractOptions::default(),
    );
    assert!(matches!(res, Err(Error::UnsupportedFeature(_))));

    let cmds = [ExtractCommand::new("/docs", out.join("docs"))];
    let res = wim.extract_files(1, &cmds, ExtractFlags::RPFIX, ExtractOptions::default());
    assert!(matches!(res, Err(Error::InvalidParameter(_))));

    let cmds = [ExtractCommand::new("/missing", out.join("missing"))];
    let res = wim.extract_files(1, &cmds, ExtractFlags::empty(), ExtractOptions::default());
    assert!(matches!(res, Err(Error::PathNotFound(_))));

    let res = wim.extract_image(
        ImageSelector::Index(2),
        &out,
        ExtractFlags::empty(),
        ExtractOptions::default(),
    );
    assert!(matches!(res, Err(Error::InvalidImage(2))));
    assert!(!out.exists());
}

#[test]
fn mismatched_parts_are_rejected() {
    let dir = TempDir::new().unwrap();
    let path = create_wim(&dir, &["base"]);
    let other_dir = TempDir::new().unwrap();
    let other = create_wim(&other_dir, &["other"]);

    let mut wim = Wim::open(&path).unwrap();
    let parts = [Wim::open(&other).unwrap()];
    let options = ExtractOptions {
        additional_parts: &parts,
        ..Default::default()
    };
    let res = wim.extract_image(
        ImageSelector::Index(1),
        dir.path().join("out"),
        ExtractFlags::empty(),
        options,
    );
    assert!(matches!(res, Err(Error::SplitSetMismatch(_))));
    // Nothing was merged into the stream table.
    assert_eq!(wim.lookup_table().len(), 2);
}

#[test]
fn extract_to_writer_copies_one_file() {
    let dir = TempDir::new().unwrap();
    let path = create_wim(&dir, &["base"]);
    let mut wim = Wim::open(&path).unwrap();

    let mut out = vec![];
    let n = wim.extract_to_writer(1, "/docs/readme.txt", &mut out).unwrap();
    assert_eq!(n, 13);
    assert_eq!(out, b"shared readme");

    let res = wim.extract_to_writer(1, "/docs", &mut out);
    assert!(matches!(res, Err(Error::NotARegularFile(_))));
    let res = wim.extract_to_writer(1, "/nope", &mut out);
    assert!(matches!(res, Err(Error::PathNotFound(_))));
}

#[cfg(unix)]
#[test]
fn symlinks_are_fixed_up_on_extraction() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    fs::create_dir_all(src.join("etc")).unwrap();
    let path = dir.path().join("links.wim");

    let mut b = ImageBuilder::new().with_reparse_fixup(&src);
    let root = b.root();
    let etc = b.add_directory(root, "etc").unwrap();
    b.add_file(etc, "real", b"target".to_vec()).unwrap();
    b.add_symlink(root, "abs", src.join("etc/real").to_str().unwrap())
        .unwrap();
    let mut wim = Wim::new();
    wim.add_image(b, "links", "").unwrap();
    wim.write(&path, ImageSelector::All, WriteFlags::empty())
        .unwrap();

    let target = dir.path().join("out");
    let mut wim = Wim::open(&path).unwrap();
    wim.extract_image(
        ImageSelector::Index(1),
        &target,
        ExtractFlags::empty(),
        ExtractOptions::default(),
    )
    .unwrap();

    let link = fs::read_link(target.join("abs")).unwrap();
    assert_eq!(link, target.canonicalize().unwrap().join("etc/real"));
    assert_eq!(read(&target.join("abs")), b"target");
}
