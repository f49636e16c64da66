use chronofs::config::{ChronoConfig, FormatOptions};
use chronofs::fs::layout::SNAPSHOT_INODE_START;
use chronofs::ChronoError;

use crate::helpers::{small_format, TestVolume};

#[test]
fn snapshot_records_are_unique_by_name() {
    let tv = TestVolume::new();
    let e = &tv.engine;
    e.write_file("a", b"1234").unwrap();
    let first = e.snapshot_create("monday").unwrap();
    assert_eq!(first.id, SNAPSHOT_INODE_START);
    assert_eq!(first.file_count, 1);
    assert_eq!(first.total_blocks, 1);
    assert_eq!(first.creator_pid, std::process::id());

    assert!(matches!(
        e.snapshot_create("monday"),
        Err(ChronoError::InvalidArgument(_))
    ));
    let second = e.snapshot_create("tuesday").unwrap();
    assert_ne!(first.id, second.id);

    let names: Vec<String> = e.snapshot_list(10).into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["monday", "tuesday"]);
    assert_eq!(e.snapshot_list(1).len(), 1);
    assert_eq!(e.snapshot_find("tuesday").unwrap().id, second.id);
    assert_eq!(e.snapshot_find_by_id(first.id).unwrap().name, "monday");
    assert!(e.snapshot_find("friday").is_none());
}

#[test]
fn snapshot_names_are_bounded() {
    let tv = TestVolume::new();
    assert!(matches!(
        tv.engine.snapshot_create(&"n".repeat(32)),
        Err(ChronoError::InvalidArgument(_))
    ));
    assert!(tv.engine.snapshot_create(&"n".repeat(31)).is_ok());
}

#[test]
fn full_table_is_reported() {
    let opts = FormatOptions {
        snapshot_slots: 1,
        ..small_format()
    };
    let tv = TestVolume::with(opts, ChronoConfig::default());
    tv.engine.snapshot_create("only").unwrap();
    assert!(matches!(
        tv.engine.snapshot_create("more"),
        Err(ChronoError::TableFull("snapshot"))
    ));
    tv.engine.snapshot_delete("only").unwrap();
    tv.engine.snapshot_create("more").unwrap();
}

#[test]
fn whole_tree_restore_is_unsupported() {
    let tv = TestVolume::new();
    tv.engine.snapshot_create("s").unwrap();
    assert!(matches!(
        tv.engine.snapshot_restore("s"),
        Err(ChronoError::Unsupported(_))
    ));
}

#[test]
fn capture_then_restore_files() {
    let tv = TestVolume::new();
    let e = &tv.engine;
    e.write_file("a", b"a1").unwrap();
    e.write_file("b", b"b1").unwrap();
    let meta = e.snapshot_capture("release", &[]).unwrap();
    assert_eq!(meta.file_count, 2);

    let v = &e.version_list("a", usize::MAX).unwrap()[0];
    assert_eq!(v.description, "release");
    assert_eq!(v.snapshot_id, Some(meta.id));

    e.write_file("a", b"a2").unwrap();
    e.write_file("b", b"b2").unwrap();
    e.version_create("a", "later").unwrap();

    let outcomes = e.snapshot_restore_files("release", &[]).unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| o.error.is_none()));
    assert_eq!(e.read_file("a").unwrap(), b"a1");
    assert_eq!(e.read_file("b").unwrap(), b"b1");
}

#[test]
fn per_file_failures_do_not_stop_the_rest() {
    let tv = TestVolume::new();
    let e = &tv.engine;
    e.write_file("a", b"a1").unwrap();
    e.write_file("c", b"c1").unwrap();
    e.snapshot_capture("s", &["a".to_string()]).unwrap();
    e.write_file("a", b"a2").unwrap();

    let files = vec!["c".to_string(), "a".to_string(), "zzz".to_string()];
    let outcomes = e.snapshot_restore_files("s", &files).unwrap();
    assert!(outcomes[0].error.is_some());
    assert_eq!(outcomes[1].version, Some(0));
    assert!(outcomes[2].error.is_some());
    assert_eq!(e.read_file("a").unwrap(), b"a1");
    assert_eq!(e.read_file("c").unwrap(), b"c1");
}

#[test]
fn failed_capture_leaves_no_record() {
    let tv = TestVolume::new();
    let e = &tv.engine;
    e.write_file("a", b"x").unwrap();
    let missing = vec!["a".to_string(), "missing".to_string()];
    assert!(e.snapshot_capture("s", &missing).is_err());
    assert!(e.snapshot_find("s").is_none());
    assert_eq!(e.version_count("a").unwrap(), 0);
}

#[test]
fn snapshots_survive_remount() {
    let tv = TestVolume::new();
    tv.engine.snapshot_create("persisted").unwrap();
    tv.engine.snapshot_create("gone").unwrap();
    tv.engine.snapshot_delete("gone").unwrap();
    assert!(matches!(
        tv.engine.snapshot_delete("gone"),
        Err(ChronoError::NotFound(_))
    ));

    let tv = tv.remount();
    let all = tv.engine.snapshot_list(10);
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].name, "persisted");
}

#[test]
fn restoring_an_unknown_snapshot_is_not_found() {
    let tv = TestVolume::new();
    tv.engine.write_file("a", b"a1").unwrap();
    tv.engine.version_create("a", "ghost").unwrap();
    assert!(matches!(
        tv.engine.snapshot_restore_files("ghost", &[]),
        Err(ChronoError::NotFound(_))
    ));
}
