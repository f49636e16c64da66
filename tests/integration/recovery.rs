use chronofs::config::{ChronoConfig, FormatOptions};
use chronofs::ChronoError;

use crate::helpers::{small_format, TestVolume};

#[test]
fn deleted_file_comes_back_from_its_newest_version() {
    let tv = TestVolume::new();
    let e = &tv.engine;
    e.write_file("notes", b"v1").unwrap();
    e.version_create("notes", "one").unwrap();
    e.write_file("notes", b"v2").unwrap();
    e.version_create("notes", "two").unwrap();
    e.write_file("notes", b"unversioned tail").unwrap();

    e.unlink("notes").unwrap();
    assert!(matches!(e.read_file("notes"), Err(ChronoError::NotFound(_))));
    let deleted = e.list_deleted(10);
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].name, "notes");

    e.recover_file("notes").unwrap();
    assert_eq!(e.read_file("notes").unwrap(), b"v2");
    assert_eq!(e.version_count("notes").unwrap(), 2);
    assert_eq!(e.version_get_content("notes", 0, 16).unwrap(), b"v1");
    assert!(e.list_deleted(10).is_empty());
}

#[test]
fn files_without_versions_are_not_registered() {
    let tv = TestVolume::new();
    let e = &tv.engine;
    let before = tv.allocated();
    e.write_file("tmp", b"scratch").unwrap();
    e.unlink("tmp").unwrap();
    assert!(e.list_deleted(10).is_empty());
    assert!(matches!(e.recover_file("tmp"), Err(ChronoError::NotFound(_))));
    assert_eq!(tv.allocated(), before);
}

#[test]
fn recover_refuses_to_clobber() {
    let tv = TestVolume::new();
    let e = &tv.engine;
    e.write_file("f", b"old").unwrap();
    e.version_create("f", "").unwrap();
    e.unlink("f").unwrap();
    e.write_file("f", b"new").unwrap();
    assert!(matches!(
        e.recover_file("f"),
        Err(ChronoError::InvalidArgument(_))
    ));
    assert_eq!(e.list_deleted(10).len(), 1);
    assert_eq!(e.read_file("f").unwrap(), b"new");
}

#[test]
fn newest_deletion_wins() {
    let tv = TestVolume::new();
    let e = &tv.engine;
    for content in [&b"first life"[..], &b"second life"[..]] {
        e.write_file("f", content).unwrap();
        e.version_create("f", "").unwrap();
        e.unlink("f").unwrap();
    }
    assert_eq!(e.list_deleted(10).len(), 2);
    e.recover_file("f").unwrap();
    assert_eq!(e.read_file("f").unwrap(), b"second life");
    assert_eq!(e.list_deleted(10).len(), 1);
}

#[test]
fn full_registry_blocks_unlink() {
    let opts = FormatOptions {
        deleted_slots: 1,
        ..small_format()
    };
    let tv = TestVolume::with(opts, ChronoConfig::default());
    let e = &tv.engine;
    for name in ["a", "b"] {
        e.write_file(name, name.as_bytes()).unwrap();
        e.version_create(name, "").unwrap();
    }
    e.unlink("a").unwrap();
    assert!(matches!(
        e.unlink("b"),
        Err(ChronoError::TableFull("deleted file"))
    ));
    assert_eq!(e.read_file("b").unwrap(), b"b");
    assert_eq!(e.list_deleted(10).len(), 1);
}

#[test]
fn registry_survives_remount() {
    let tv = TestVolume::new();
    tv.engine.write_file("keep", b"precious").unwrap();
    tv.engine.version_create("keep", "").unwrap();
    tv.engine.unlink("keep").unwrap();

    let tv = tv.remount();
    let entry = tv.engine.find_deleted("keep").unwrap();
    // The chain of a deleted file still pins its blocks.
    assert_eq!(tv.engine.refs().len(), 1);
    assert!(tv.engine.volume().is_allocated(entry.version_head).unwrap());

    tv.engine.recover_file("/keep").unwrap();
    assert_eq!(tv.engine.read_file("keep").unwrap(), b"precious");
}

#[test]
fn recovered_file_keeps_its_flags() {
    let tv = TestVolume::new();
    tv.engine.write_file("sealed", b"final").unwrap();
    tv.engine.version_create("sealed", "").unwrap();
    tv.engine.set_immutable("sealed", true).unwrap();
    tv.engine.unlink("sealed").unwrap();

    let tv = tv.remount();
    tv.engine.recover_file("sealed").unwrap();
    let info = tv
        .engine
        .list_files()
        .unwrap()
        .into_iter()
        .find(|f| f.name == "sealed")
        .unwrap();
    assert!(info.immutable);
    assert!(matches!(
        tv.engine.write_file("sealed", b"changed"),
        Err(ChronoError::InvalidArgument(_))
    ));
    // Versioning still works on the recovered inode.
    tv.engine.version_create("sealed", "after").unwrap();
    assert_eq!(tv.engine.version_count("sealed").unwrap(), 2);
}
