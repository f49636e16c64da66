use chronofs::config::ChronoConfig;
use chronofs::fs::layout::BSIZE;
use chronofs::state::dedup::DedupIndex;
use chronofs::ChronoError;

use crate::helpers::{small_format, TestVolume};

#[test]
fn identical_versions_share_one_block() {
    let tv = TestVolume::new();
    let e = &tv.engine;
    e.write_file("a", b"same bytes").unwrap();
    e.write_file("b", b"same bytes").unwrap();
    e.version_create("a", "va").unwrap();
    let shared = tv.version_blocks("a", 0)[0];

    e.version_create("b", "vb0").unwrap();
    assert_eq!(tv.version_blocks("b", 0), vec![shared]);
    assert_eq!(e.dedup().get(shared).unwrap().refcount, 2);
    // a's live copy plus two version references.
    assert_eq!(e.refs().get(shared), 3);

    // Drop b's reference by pruning its older version away.
    e.write_file("b", b"other bytes").unwrap();
    e.version_create("b", "vb1").unwrap();
    let stats = e.gc_prune_by_count(1).unwrap();
    assert_eq!(stats.versions_pruned, 1);
    assert_eq!(e.dedup().get(shared).unwrap().refcount, 1);
    assert_eq!(e.refs().get(shared), 2);
    assert!(e.volume().is_allocated(shared).unwrap());
    assert_eq!(e.version_get_content("a", 0, 64).unwrap(), b"same bytes");
}

#[test]
fn repeated_blocks_inside_one_file_collapse() {
    let tv = TestVolume::new();
    let e = &tv.engine;
    let content = vec![b'z'; 3 * BSIZE];
    e.write_file("f", &content).unwrap();
    e.version_create("f", "zzz").unwrap();
    let blocks = tv.version_blocks("f", 0);
    assert_eq!(blocks.len(), 3);
    assert!(blocks.iter().all(|&b| b == blocks[0]));
    assert_eq!(e.dedup().get(blocks[0]).unwrap().refcount, 3);
    assert_eq!(e.version_get_content("f", 0, content.len()).unwrap(), content);
}

#[test]
fn checksum_collision_is_not_reused() {
    let mut ab = [0u8; BSIZE];
    ab[..2].copy_from_slice(b"Ab");
    let mut ba = [0u8; BSIZE];
    ba[..2].copy_from_slice(b"BA");
    assert_eq!(DedupIndex::hash(&ab), DedupIndex::hash(&ba));

    let tv = TestVolume::new();
    let e = &tv.engine;
    e.write_file("x", b"Ab").unwrap();
    e.version_create("x", "").unwrap();
    e.write_file("y", b"BA").unwrap();
    e.version_create("y", "").unwrap();
    assert_ne!(tv.version_blocks("x", 0), tv.version_blocks("y", 0));
    assert_eq!(e.version_get_content("y", 0, 2).unwrap(), b"BA");
    assert_eq!(e.version_get_content("x", 0, 2).unwrap(), b"Ab");
}

#[test]
fn full_refcount_table_aborts_cleanly() {
    let config = ChronoConfig {
        refcount_capacity: 1,
        ..ChronoConfig::default()
    };
    let tv = TestVolume::with(small_format(), config);
    let e = &tv.engine;
    e.write_file("a", b"first").unwrap();
    e.version_create("a", "").unwrap();
    e.write_file("b", b"second").unwrap();
    let allocated = tv.allocated();

    assert!(matches!(
        e.version_create("b", ""),
        Err(ChronoError::TableFull("block refcount"))
    ));
    assert_eq!(e.version_count("b").unwrap(), 0);
    assert_eq!(tv.allocated(), allocated);
    assert_eq!(e.refs().len(), 1);
    assert_eq!(e.dedup().len(), 1);
}
