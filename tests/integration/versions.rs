use chronofs::fs::layout::{BSIZE, MAXFILE_BYTES};
use chronofs::ChronoError;

use crate::helpers::{random_bytes, temp_image, small_format, TestVolume};

#[test]
fn restore_brings_back_exact_content() {
    let tv = TestVolume::new();
    let e = &tv.engine;
    e.write_file("doc", b"A").unwrap();
    e.version_create("doc", "first").unwrap();
    e.write_file("doc", b"B").unwrap();
    e.version_create("doc", "second").unwrap();

    e.version_restore("doc", 0).unwrap();
    assert_eq!(e.read_file("doc").unwrap(), b"A");
    assert_eq!(e.list_files().unwrap()[0].size, 1);
}

#[test]
fn every_version_round_trips() {
    let tv = TestVolume::new();
    let e = &tv.engine;
    let sizes = [0, 1, BSIZE, BSIZE + 1, 3 * BSIZE - 7, MAXFILE_BYTES];
    let contents: Vec<Vec<u8>> = sizes
        .iter()
        .enumerate()
        .map(|(i, &n)| random_bytes(i as u64, n))
        .collect();
    for (i, c) in contents.iter().enumerate() {
        e.write_file("data", c).unwrap();
        e.version_create("data", &format!("v{}", i)).unwrap();
    }
    for (i, c) in contents.iter().enumerate() {
        e.version_restore("data", i as u32).unwrap();
        assert_eq!(&e.read_file("data").unwrap(), c, "version {}", i);
        assert_eq!(
            &e.version_get_content("data", i as u32, MAXFILE_BYTES).unwrap(),
            c
        );
    }
}

#[test]
fn list_is_oldest_first_with_stable_ordinals() {
    let tv = TestVolume::new();
    let e = &tv.engine;
    for i in 0..3 {
        e.write_file("f", format!("content {}", i).as_bytes()).unwrap();
        e.version_create("f", &format!("rev {}", i)).unwrap();
    }
    let all = e.version_list("f", usize::MAX).unwrap();
    let ordinals: Vec<u32> = all.iter().map(|v| v.version_num).collect();
    assert_eq!(ordinals, vec![0, 1, 2]);
    assert_eq!(all[0].description, "rev 0");

    let newest_two = e.version_list("f", 2).unwrap();
    assert_eq!(newest_two.len(), 2);
    assert_eq!(newest_two[0].version_num, 1);
    assert_eq!(newest_two[1].description, "rev 2");
    assert_eq!(e.version_count("f").unwrap(), 3);
}

#[test]
fn get_content_respects_cap() {
    let tv = TestVolume::new();
    let e = &tv.engine;
    e.write_file("f", b"hello world").unwrap();
    e.version_create("f", "").unwrap();
    assert_eq!(e.version_get_content("f", 0, 5).unwrap(), b"hello");
}

#[test]
fn bad_arguments_are_rejected() {
    let tv = TestVolume::new();
    let e = &tv.engine;
    assert!(matches!(
        e.version_create("missing", "x"),
        Err(ChronoError::NotFound(_))
    ));
    e.write_file("f", b"x").unwrap();
    assert!(matches!(
        e.version_restore("f", 0),
        Err(ChronoError::InvalidArgument(_))
    ));
    let long = "d".repeat(32);
    assert!(matches!(
        e.version_create("f", &long),
        Err(ChronoError::InvalidArgument(_))
    ));
    assert_eq!(e.version_count("f").unwrap(), 0);
    assert!(matches!(
        e.write_file("f", &vec![0u8; MAXFILE_BYTES + 1]),
        Err(ChronoError::InvalidArgument(_))
    ));
    assert!(matches!(
        e.write_file("a/b", b"x"),
        Err(ChronoError::InvalidArgument(_))
    ));
}

#[test]
fn live_writes_never_touch_history() {
    let tv = TestVolume::new();
    let e = &tv.engine;
    e.write_file("f", b"original").unwrap();
    e.version_create("f", "keep").unwrap();
    assert_eq!(tv.live_blocks("f"), tv.version_blocks("f", 0));

    e.write_file("f", b"overwritten").unwrap();
    assert_ne!(tv.live_blocks("f"), tv.version_blocks("f", 0));
    assert_eq!(e.version_get_content("f", 0, 64).unwrap(), b"original");

    // Restore copies instead of aliasing the version's blocks.
    e.version_restore("f", 0).unwrap();
    assert_ne!(tv.live_blocks("f"), tv.version_blocks("f", 0));
    e.write_file("f", b"again").unwrap();
    assert_eq!(e.version_get_content("f", 0, 64).unwrap(), b"original");
}

#[test]
fn immutable_files_reject_changes() {
    let tv = TestVolume::new();
    let e = &tv.engine;
    e.write_file("f", b"fixed").unwrap();
    e.version_create("f", "v").unwrap();
    e.set_immutable("f", true).unwrap();
    assert!(e.write_file("f", b"nope").is_err());
    assert!(e.version_restore("f", 0).is_err());
    e.set_immutable("f", false).unwrap();
    e.write_file("f", b"yes").unwrap();
}

#[test]
fn lookup_by_time() {
    let tv = TestVolume::new();
    let e = &tv.engine;
    e.write_file("f", b"x").unwrap();
    e.version_create("f", "only").unwrap();
    let v = e.version_at_time("f", u64::MAX).unwrap().unwrap();
    assert_eq!(v.description, "only");
    assert!(e.version_at_time("f", 0).unwrap().is_none());
}

#[test]
fn diff_between_versions() {
    let tv = TestVolume::new();
    let e = &tv.engine;
    e.write_file("f", b"one\ntwo\nthree\n").unwrap();
    e.version_create("f", "a").unwrap();
    e.write_file("f", b"one\nthree\nfour\n").unwrap();
    e.version_create("f", "b").unwrap();

    let same = e.version_diff("f", 1, 1).unwrap();
    assert!(same.identical);
    assert!(same.added.is_empty() && same.removed.is_empty());

    let d = e.version_diff("f", 0, 1).unwrap();
    assert_eq!(d.removed, vec!["two"]);
    assert_eq!(d.added, vec!["four"]);
    assert!(e.version_diff("f", 0, 2).is_err());
}

#[test]
fn chains_survive_remount() {
    let tv = TestVolume::new();
    tv.engine.write_file("f", b"A").unwrap();
    tv.engine.version_create("f", "a").unwrap();
    tv.engine.write_file("f", b"B").unwrap();
    let block = tv.version_blocks("f", 0)[0];
    let before = tv.engine.refs().get(block);

    let tv = tv.remount();
    assert_eq!(tv.engine.read_file("f").unwrap(), b"B");
    assert_eq!(tv.engine.version_get_content("f", 0, 16).unwrap(), b"A");
    assert_eq!(tv.engine.refs().get(block), before);
    assert_eq!(tv.engine.dedup().get(block).unwrap().refcount, 1);
}

#[test]
fn image_files_persist() {
    let (_dir, path) = temp_image();
    {
        let e = chronofs::StorageEngine::create_image(&path, &small_format(), Default::default())
            .unwrap();
        e.write_file("f", b"on disk").unwrap();
        e.version_create("f", "v").unwrap();
    }
    let e = chronofs::StorageEngine::open_image(&path, Default::default()).unwrap();
    assert_eq!(e.read_file("f").unwrap(), b"on disk");
    assert_eq!(e.version_count("f").unwrap(), 1);
}
