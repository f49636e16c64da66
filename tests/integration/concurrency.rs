use std::thread;

use chronofs::StorageEngine;

use crate::helpers::TestVolume;

const WORKERS: usize = 4;
const ROUNDS: usize = 12;
const GC_RUNS: u64 = 20;

/// Write, version, and now and then delete and recover one file. Returns
/// the content it should end with.
fn churn(engine: &StorageEngine, name: &str) -> Vec<u8> {
    let mut last = Vec::new();
    for i in 0..ROUNDS {
        last = format!("{} round {}", name, i).into_bytes();
        engine.write_file(name, &last).unwrap();
        engine.version_create(name, &format!("r{}", i)).unwrap();
        if i % 4 == 3 {
            engine.unlink(name).unwrap();
            engine.recover_file(name).unwrap();
            assert_eq!(engine.read_file(name).unwrap(), last);
        }
    }
    last
}

#[test]
fn collection_runs_alongside_writers() {
    let tv = TestVolume::new();
    let engine = &tv.engine;
    let names: Vec<String> = (0..WORKERS).map(|i| format!("w{}", i)).collect();

    let finals: Vec<Vec<u8>> = thread::scope(|s| {
        let workers: Vec<_> = names
            .iter()
            .map(|name| s.spawn(move || churn(engine, name)))
            .collect();
        s.spawn(move || {
            for _ in 0..GC_RUNS {
                engine.gc_run(Some(2), None).unwrap();
                thread::yield_now();
            }
        });
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    assert!(engine.list_deleted(usize::MAX).is_empty());
    for (name, last) in names.iter().zip(&finals) {
        assert_eq!(&engine.read_file(name).unwrap(), last);
        let n = engine.version_count(name).unwrap();
        assert!(n >= 1);
        assert_eq!(
            &engine.version_get_content(name, n as u32 - 1, 64).unwrap(),
            last
        );
    }
    tv.assert_reachable_allocated();

    let stats = engine.gc_run(Some(2), None).unwrap();
    assert_eq!(stats.total_runs, GC_RUNS + 1);
    for name in &names {
        assert!(engine.version_count(name).unwrap() <= 2);
    }
    tv.assert_reachable_allocated();
    assert_eq!(engine.gc_collect_blocks().unwrap(), 0);

    let tv = tv.remount();
    for (name, last) in names.iter().zip(&finals) {
        assert_eq!(&tv.engine.read_file(name).unwrap(), last);
    }
    tv.assert_reachable_allocated();
}

#[test]
fn unlink_racing_a_sweep_keeps_the_deleted_chain() {
    let tv = TestVolume::new();
    let engine = &tv.engine;
    for i in 0..WORKERS {
        let name = format!("d{}", i);
        engine.write_file(&name, name.as_bytes()).unwrap();
        engine.version_create(&name, "").unwrap();
    }

    thread::scope(|s| {
        s.spawn(|| {
            for i in 0..WORKERS {
                engine.unlink(&format!("d{}", i)).unwrap();
            }
        });
        s.spawn(|| {
            for _ in 0..WORKERS {
                engine.gc_collect_blocks().unwrap();
            }
        });
    });

    tv.assert_reachable_allocated();
    for i in 0..WORKERS {
        let name = format!("d{}", i);
        engine.recover_file(&name).unwrap();
        assert_eq!(engine.read_file(&name).unwrap(), name.as_bytes());
    }
}
