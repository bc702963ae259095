//! Writing, exporting and rewriting WIM files.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use wim_format::{
    Error, ExtractFlags, ExtractOptions, ImageBuilder, ImageSelector, ResourceEntry, Wim,
    WriteFlags,
};

fn builder(files: &[(&str, &[u8])]) -> ImageBuilder {
    let mut b = ImageBuilder::new();
    let root = b.root();
    for (name, data) in files {
        b.add_file(root, name, data.to_vec()).unwrap();
    }
    b
}

/// Three images sharing `common`, image 2 bootable.
fn create_wim(dir: &TempDir, flags: WriteFlags) -> PathBuf {
    let path = dir.path().join("base.wim");
    let mut wim = Wim::new();
    for name in ["one", "two", "three"] {
        let b = builder(&[("common", b"common data"), ("own", name.as_bytes())]);
        wim.add_image(b, name, "").unwrap();
    }
    wim.set_boot_index(2).unwrap();
    wim.write(&path, ImageSelector::All, flags).unwrap();
    path
}

fn file_len(path: &Path) -> u64 {
    fs::metadata(path).unwrap().len()
}

fn extract(wim: &mut Wim, image: u32, target: &Path) {
    wim.extract_image(
        ImageSelector::Index(image),
        target,
        ExtractFlags::empty(),
        ExtractOptions::default(),
    )
    .unwrap();
}

#[test]
fn reopened_wim_matches_what_was_written() {
    let dir = TempDir::new().unwrap();
    let path = create_wim(&dir, WriteFlags::empty());

    let mut wim = Wim::open(&path).unwrap();
    assert_eq!(wim.image_count(), 3);
    assert_eq!(wim.boot_index(), 2);
    assert_eq!(wim.image_name(3), "three");
    assert_eq!(wim.header().integrity, ResourceEntry::default());
    assert_eq!(
        Some(&wim.header().boot_metadata),
        wim.metadata_resource(2).map(|e| &e.resource)
    );
    let info = wim.image_info(1).unwrap();
    assert_eq!(info.file_count, 2);
    assert_eq!(info.dir_count, 1);
    assert_eq!(info.total_bytes, 11 + 3);

    let target = dir.path().join("three");
    extract(&mut wim, 3, &target);
    assert_eq!(fs::read(target.join("own")).unwrap(), b"three");
    assert_eq!(fs::read(target.join("common")).unwrap(), b"common data");
}

#[test]
fn export_single_image() {
    let dir = TempDir::new().unwrap();
    let path = create_wim(&dir, WriteFlags::empty());
    let mut wim = Wim::open(&path).unwrap();

    let boot = dir.path().join("boot.wim");
    wim.write(&boot, ImageSelector::Index(2), WriteFlags::CHECK_INTEGRITY)
        .unwrap();
    let mut exported = Wim::open(&boot).unwrap();
    assert_eq!(exported.image_count(), 1);
    assert_eq!(exported.boot_index(), 1);
    assert_eq!(exported.image_name(1), "two");
    assert_eq!(exported.lookup_table().len(), 2);
    assert!(exported.check_integrity().unwrap());

    let target = dir.path().join("two");
    extract(&mut exported, 1, &target);
    assert_eq!(fs::read(target.join("own")).unwrap(), b"two");

    let other = dir.path().join("other.wim");
    wim.write(&other, ImageSelector::Index(1), WriteFlags::empty())
        .unwrap();
    let exported = Wim::open(&other).unwrap();
    assert_eq!(exported.boot_index(), 0);
    assert_eq!(exported.header().boot_metadata, ResourceEntry::default());
}

#[test]
fn full_overwrite_appends_an_image() {
    let dir = TempDir::new().unwrap();
    let path = create_wim(&dir, WriteFlags::CHECK_INTEGRITY);

    let mut wim = Wim::open(&path).unwrap();
    wim.add_image(builder(&[("own", b"four"), ("new", b"fresh")]), "four", "")
        .unwrap();
    assert!(matches!(
        wim.overwrite_xml_and_header(WriteFlags::empty()),
        Err(Error::InvalidParameter(_))
    ));
    wim.commit(WriteFlags::CHECK_INTEGRITY).unwrap();

    // Reloaded from disk by the overwrite.
    assert_eq!(wim.image_count(), 4);
    assert!(wim.check_integrity().unwrap());
    assert_eq!(wim.boot_index(), 2);
    assert_eq!(
        fs::read_dir(dir.path()).unwrap().count(),
        1,
        "temporary file left behind"
    );

    let target = dir.path().join("four");
    extract(&mut wim, 4, &target);
    assert_eq!(fs::read(target.join("new")).unwrap(), b"fresh");
    let target = dir.path().join("one");
    extract(&mut wim, 1, &target);
    assert_eq!(fs::read(target.join("common")).unwrap(), b"common data");
}

#[test]
fn fast_overwrite_rewrites_xml_in_place() {
    let dir = TempDir::new().unwrap();
    let path = create_wim(&dir, WriteFlags::CHECK_INTEGRITY);
    let original = Wim::open(&path).unwrap();
    let lookup_table = original.header().lookup_table;

    let mut wim = Wim::open(&path).unwrap();
    wim.set_image_description(1, &"a much longer description ".repeat(20))
        .unwrap();
    wim.commit(WriteFlags::CHECK_INTEGRITY).unwrap();
    let grown = file_len(&path);
    assert!(grown > file_len_of(&original));

    let wim = Wim::open(&path).unwrap();
    assert_eq!(wim.header().lookup_table, lookup_table);
    assert_eq!(wim.header().integrity.offset, wim.header().xml_data.end());
    assert_eq!(grown, wim.header().integrity.end());
    assert!(wim.check_integrity().unwrap());

    // Shrinking the XML data truncates the file, dropping the integrity table.
    let mut wim = wim;
    wim.set_image_description(1, "short").unwrap();
    wim.set_boot_index(3).unwrap();
    wim.overwrite_xml_and_header(WriteFlags::empty()).unwrap();
    let wim = Wim::open(&path).unwrap();
    assert_eq!(file_len(&path), wim.header().xml_data.end());
    assert_eq!(wim.header().integrity, ResourceEntry::default());
    assert!(!wim.check_integrity().unwrap());
    assert_eq!(wim.boot_index(), 3);
    assert_eq!(wim.image_info(1).unwrap().description, "short");
    assert_eq!(
        Some(&wim.header().boot_metadata),
        wim.metadata_resource(3).map(|e| &e.resource)
    );
}

fn file_len_of(wim: &Wim) -> u64 {
    wim.header().integrity.end()
}

#[test]
fn rebuild_forces_a_full_rewrite() {
    let dir = TempDir::new().unwrap();
    let path = create_wim(&dir, WriteFlags::empty());
    let mut wim = Wim::open(&path).unwrap();
    wim.set_image_name(1, "renamed").unwrap();
    wim.commit(WriteFlags::REBUILD).unwrap();

    let wim = Wim::open(&path).unwrap();
    assert_eq!(wim.image_name(1), "renamed");
    assert_eq!(wim.lookup_table().len(), 4);
    assert_eq!(file_len(&path), wim.header().xml_data.end());
}

#[test]
fn new_wims_need_a_path_to_commit() {
    let mut wim = Wim::new();
    wim.add_image(builder(&[("a", b"a")]), "a", "").unwrap();
    assert!(matches!(
        wim.commit(WriteFlags::empty()),
        Err(Error::NoFilename)
    ));
    assert!(matches!(wim.check_integrity(), Err(Error::NoFilename)));
}

#[test]
fn corrupted_data_fails_the_integrity_check() {
    use std::io::{Seek, SeekFrom, Write};

    let dir = TempDir::new().unwrap();
    let path = create_wim(&dir, WriteFlags::CHECK_INTEGRITY);
    {
        let mut f = fs::OpenOptions::new().write(true).open(&path).unwrap();
        f.seek(SeekFrom::Start(208)).unwrap();
        f.write_all(b"XXXX").unwrap();
    }
    let wim = Wim::open(&path).unwrap();
    assert!(matches!(
        wim.check_integrity(),
        Err(Error::IntegrityMismatch { chunk: 0 })
    ));
}
