use chronofs::fs::layout::MAX_VERSIONS_PER_FILE;

use crate::helpers::TestVolume;

fn versioned(tv: &TestVolume, file: &str, count: usize) {
    for i in 0..count {
        tv.engine
            .write_file(file, format!("{} content {}", file, i).as_bytes())
            .unwrap();
        tv.engine.version_create(file, &format!("v{}", i)).unwrap();
    }
}

#[test]
fn prune_keeps_the_newest_versions() {
    let tv = TestVolume::new();
    versioned(&tv, "f", MAX_VERSIONS_PER_FILE + 1);
    let oldest = tv.version_blocks("f", 0)[0];
    let before = tv.allocated();

    let stats = tv.engine.gc_prune_by_count(MAX_VERSIONS_PER_FILE).unwrap();
    assert_eq!(stats.versions_pruned, 1);
    // The oldest node and the block only it referenced.
    assert_eq!(stats.blocks_freed, 2);
    assert_eq!(tv.allocated(), before - 2);
    assert!(!tv.engine.volume().is_allocated(oldest).unwrap());
    assert!(!tv.engine.refs().is_tracked(oldest));
    assert!(tv.engine.dedup().get(oldest).is_none());

    let versions = tv.engine.version_list("f", usize::MAX).unwrap();
    assert_eq!(versions.len(), MAX_VERSIONS_PER_FILE);
    assert_eq!(versions[0].description, "v1");
    assert_eq!(
        tv.engine.version_get_content("f", 0, 64).unwrap(),
        b"f content 1"
    );
}

#[test]
fn pruning_everything_empties_the_chain() {
    let tv = TestVolume::new();
    versioned(&tv, "f", 3);
    tv.engine.gc_prune_by_count(0).unwrap();
    assert_eq!(tv.engine.version_count("f").unwrap(), 0);
    assert_eq!(tv.engine.read_file("f").unwrap(), b"f content 2");
    // Only the live block is left, with the file as its sole owner.
    assert_eq!(tv.allocated(), 1);
    let live = tv.live_blocks("f")[0];
    assert_eq!(tv.engine.refs().get(live), 1);
    assert!(tv.engine.dedup().is_empty());

    tv.engine.write_file("f", b"replaced").unwrap();
    assert_eq!(tv.allocated(), 1);
    assert!(tv.engine.refs().is_empty());
}

#[test]
fn deleted_chains_are_pruned_too() {
    let tv = TestVolume::new();
    versioned(&tv, "gone", 3);
    versioned(&tv, "dropped", 1);
    tv.engine.unlink("gone").unwrap();
    tv.engine.unlink("dropped").unwrap();

    tv.engine.gc_prune_by_count(1).unwrap();
    assert_eq!(tv.engine.list_deleted(10).len(), 2);
    tv.engine.recover_file("gone").unwrap();
    assert_eq!(tv.engine.version_count("gone").unwrap(), 1);

    tv.engine.gc_prune_by_count(0).unwrap();
    assert!(tv.engine.list_deleted(10).is_empty());
    assert_eq!(tv.engine.read_file("gone").unwrap(), b"gone content 2");
}

#[test]
fn age_pruning_keeps_the_newest() {
    let tv = TestVolume::new();
    versioned(&tv, "f", 3);
    tv.engine.gc_prune_old_versions(u64::MAX).unwrap();
    assert_eq!(tv.engine.version_count("f").unwrap(), 3);

    tv.engine.gc_prune_old_versions(0).unwrap();
    let n = tv.engine.version_count("f").unwrap();
    assert!(n >= 1);
    assert_eq!(
        tv.engine.version_get_content("f", n as u32 - 1, 64).unwrap(),
        b"f content 2"
    );
}

#[test]
fn sweep_reclaims_leaked_blocks() {
    let tv = TestVolume::new();
    versioned(&tv, "f", 2);
    let before = tv.allocated();
    let leaked = tv
        .engine
        .volume()
        .transact(|vol| vol.alloc_block())
        .unwrap();
    assert_eq!(tv.allocated(), before + 1);

    assert_eq!(tv.engine.gc_collect_blocks().unwrap(), 1);
    assert!(!tv.engine.volume().is_allocated(leaked).unwrap());
    assert_eq!(tv.allocated(), before);
    assert_eq!(tv.engine.read_file("f").unwrap(), b"f content 1");
}

#[test]
fn run_accumulates_stats() {
    let tv = TestVolume::new();
    versioned(&tv, "f", 4);
    let first = tv.engine.gc_run(Some(2), None).unwrap();
    assert_eq!(first.total_runs, 1);
    assert_eq!(first.versions_pruned, 2);
    assert!(first.last_run_time > 0);

    let second = tv.engine.gc_run(None, None).unwrap();
    assert_eq!(second.total_runs, 2);
    assert_eq!(second.versions_pruned, 2);
    assert_eq!(tv.engine.gc_stats(), second);
    assert_eq!(tv.engine.version_count("f").unwrap(), 2);
}
