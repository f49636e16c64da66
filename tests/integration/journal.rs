use std::sync::Arc;

use chronofs::fs::device::MemDevice;
use chronofs::fs::layout::BSIZE;
use chronofs::fs::Volume;
use chronofs::journal::{RecoveryOutcome, TxState};
use chronofs::ChronoError;

use crate::helpers::{small_format, FlakyDevice, TestVolume, TEST_BLOCKS};

fn fresh_volume() -> (MemDevice, Volume) {
    let dev = MemDevice::new(TEST_BLOCKS);
    let vol = Volume::format(Arc::new(dev.clone()), &small_format()).unwrap();
    (dev, vol)
}

#[test]
fn crash_before_commit_changes_nothing() {
    let (dev, vol) = fresh_volume();
    let target = vol.superblock().datastart + 5;
    vol.journal().begin_tx().unwrap();
    vol.write_block(target, &[0xAB; BSIZE]).unwrap();
    assert_eq!(vol.read_block(target).unwrap(), [0xAB; BSIZE]);
    drop(vol);

    let vol = Volume::open(Arc::new(dev.clone())).unwrap();
    assert!(matches!(vol.recovery(), RecoveryOutcome::Discarded(_)));
    assert_eq!(vol.read_block(target).unwrap(), [0u8; BSIZE]);
    assert_eq!(vol.journal().state(), TxState::Idle);
}

#[test]
fn crash_after_commit_is_replayed() {
    let (dev, vol) = fresh_volume();
    let a = vol.superblock().datastart + 1;
    let b = vol.superblock().datastart + 2;
    vol.journal().begin_tx().unwrap();
    vol.write_block(a, &[1; BSIZE]).unwrap();
    vol.write_block(b, &[2; BSIZE]).unwrap();
    // Durable but never installed.
    let tx = vol.journal().commit_tx().unwrap();
    assert_eq!(tx.entries.len(), 2);
    drop(vol);

    let vol = Volume::open(Arc::new(dev.clone())).unwrap();
    assert!(matches!(
        vol.recovery(),
        RecoveryOutcome::Replayed { blocks: 2, .. }
    ));
    assert_eq!(vol.read_block(a).unwrap(), [1; BSIZE]);
    assert_eq!(vol.read_block(b).unwrap(), [2; BSIZE]);
    drop(vol);

    let vol = Volume::open(Arc::new(dev)).unwrap();
    assert_eq!(vol.recovery(), &RecoveryOutcome::Clean);
    assert_eq!(vol.read_block(a).unwrap(), [1; BSIZE]);
}

#[test]
fn failed_transaction_rolls_back() {
    let (_dev, vol) = fresh_volume();
    let target = vol.superblock().datastart + 3;
    let result: chronofs::Result<()> = vol.transact(|v| {
        v.write_block(target, &[9; BSIZE])?;
        Err(ChronoError::InvalidArgument("stop".to_string()))
    });
    assert!(result.is_err());
    assert_eq!(vol.read_block(target).unwrap(), [0u8; BSIZE]);
    assert!(matches!(
        vol.write_block(target, &[9; BSIZE]),
        Err(ChronoError::StateViolation(_))
    ));
}

#[test]
fn oversized_transaction_is_refused() {
    let (_dev, vol) = fresh_volume();
    let start = vol.superblock().datastart;
    let capacity = vol.journal().capacity() as u32;
    let result = vol.transact(|v| {
        for i in 0..=capacity {
            v.write_block(start + i, &[7; BSIZE])?;
        }
        Ok(())
    });
    assert!(matches!(result, Err(ChronoError::TableFull("journal"))));
    assert_eq!(vol.read_block(start).unwrap(), [0u8; BSIZE]);
}

#[test]
fn engine_survives_crash_between_operations() {
    let tv = TestVolume::new();
    tv.engine.write_file("f", b"before").unwrap();
    tv.engine.version_create("f", "v").unwrap();
    tv.engine.write_file("f", b"after").unwrap();

    let tv = tv.remount();
    assert_eq!(tv.engine.volume().recovery(), &RecoveryOutcome::Clean);
    assert_eq!(tv.engine.read_file("f").unwrap(), b"after");
    assert_eq!(tv.engine.version_get_content("f", 0, 64).unwrap(), b"before");
}

#[test]
fn failed_install_is_settled_before_the_next_transaction() {
    let mem = MemDevice::new(TEST_BLOCKS);
    let flaky = Arc::new(FlakyDevice::new(mem.clone()));
    let vol = Volume::format(flaky.clone(), &small_format()).unwrap();
    let target = vol.superblock().datastart + 4;

    flaky.fail_writes_from(vol.superblock().datastart);
    let result = vol.transact(|v| v.write_block(target, &[5; BSIZE]));
    assert!(matches!(result, Err(ChronoError::Fatal(_))));
    assert!(vol.journal().needs_recovery());

    // The committed transaction must not be overwritten while it cannot
    // be installed.
    assert!(matches!(
        vol.transact(|_| Ok(())),
        Err(ChronoError::Fatal(_))
    ));
    assert!(vol.journal().needs_recovery());

    flaky.heal();
    vol.transact(|v| v.write_block(target + 1, &[6; BSIZE])).unwrap();
    assert!(!vol.journal().needs_recovery());
    assert_eq!(vol.read_block(target).unwrap(), [5; BSIZE]);
    assert_eq!(vol.read_block(target + 1).unwrap(), [6; BSIZE]);
    drop(vol);

    let vol = Volume::open(Arc::new(mem)).unwrap();
    assert_eq!(vol.recovery(), &RecoveryOutcome::Clean);
    assert_eq!(vol.read_block(target).unwrap(), [5; BSIZE]);
}

#[test]
fn engine_halts_after_a_failed_install() {
    let (tv, flaky) = TestVolume::flaky();
    tv.engine.write_file("f", b"A").unwrap();

    flaky.fail_writes_from(tv.engine.volume().superblock().datastart);
    assert!(matches!(
        tv.engine.write_file("f", b"B"),
        Err(ChronoError::Fatal(_))
    ));
    flaky.heal();
    assert!(matches!(
        tv.engine.write_file("g", b"x"),
        Err(ChronoError::Fatal(_))
    ));
    assert!(matches!(tv.engine.read_file("f"), Err(ChronoError::Fatal(_))));

    let tv = tv.remount();
    assert!(matches!(
        tv.engine.volume().recovery(),
        RecoveryOutcome::Replayed { .. }
    ));
    assert_eq!(tv.engine.read_file("f").unwrap(), b"B");
    tv.engine.write_file("g", b"x").unwrap();
    assert_eq!(tv.engine.read_file("f").unwrap(), b"B");
    assert_eq!(tv.engine.read_file("g").unwrap(), b"x");
    assert_ne!(tv.live_blocks("f"), tv.live_blocks("g"));
}
