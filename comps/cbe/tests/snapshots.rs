// SPDX-License-Identifier: MPL-2.0

mod common;

use cbe::{Block, Errno, Result, SuperblockState};
use common::{TestDevice, payload};

#[test]
fn snapshot_keeps_old_content() -> Result<()> {
    let mut dev = TestDevice::standard()?;
    let cbe = &mut dev.cbe;
    assert_eq!(cbe.curr_gen(), 1);

    cbe.write(100, &payload(1))?;
    let s1 = cbe.create_snapshot(true)?;
    assert_eq!(s1, 1);
    cbe.write(100, &payload(2))?;
    cbe.sync()?;

    assert_eq!(cbe.read(100)?, payload(2));
    assert_eq!(cbe.read_snapshot(s1, 100)?, payload(1));
    // Never written leaves read as zeroes in every snapshot.
    assert_eq!(cbe.read(101)?, Block::zeroed());
    assert_eq!(cbe.read_snapshot(s1, 4095)?, Block::zeroed());
    Ok(())
}

#[test]
fn kept_snapshot_survives_many_commits() -> Result<()> {
    let mut dev = TestDevice::standard()?;
    let cbe = &mut dev.cbe;
    cbe.write(7, &payload(7))?;
    let kept = cbe.create_snapshot(true)?;
    let pinned = |cbe: &cbe::Cbe<_>| {
        cbe.snapshots()
            .into_iter()
            .find(|snapshot| snapshot.generation == kept && snapshot.keep)
    };
    let before = pinned(cbe).expect("kept snapshot missing");

    for round in 0..60u64 {
        cbe.write(round % 4096, &payload(round as u8))?;
        cbe.sync()?;
        assert!(cbe.snapshots().len() <= 4);
    }

    let after = pinned(cbe).expect("kept snapshot discarded");
    assert_eq!(
        (after.pba, after.generation, after.hash),
        (before.pba, before.generation, before.hash)
    );
    assert_eq!(cbe.read_snapshot(kept, 7)?, payload(7));
    Ok(())
}

#[test]
fn discarded_snapshot_is_no_longer_readable() -> Result<()> {
    let mut dev = TestDevice::standard()?;
    let cbe = &mut dev.cbe;
    cbe.write(1, &payload(1))?;
    let kept = cbe.create_snapshot(true)?;
    cbe.discard_snapshot(kept)?;
    assert_eq!(
        cbe.read_snapshot(kept, 1).unwrap_err().errno(),
        Errno::NotFound
    );
    assert_eq!(
        cbe.discard_snapshot(kept).unwrap_err().errno(),
        Errno::NotFound
    );

    cbe.sync()?;
    cbe.sync()?;
    assert!(cbe.snapshots().iter().all(|snapshot| snapshot.generation != kept));
    Ok(())
}

#[test]
fn unkept_snapshot_is_not_readable() -> Result<()> {
    let mut dev = TestDevice::standard()?;
    let cbe = &mut dev.cbe;
    let generation = cbe.create_snapshot(false)?;
    assert_eq!(
        cbe.read_snapshot(generation, 0).unwrap_err().errno(),
        Errno::NotFound
    );
    Ok(())
}

#[test]
fn commits_advance_the_generation_by_one() -> Result<()> {
    let mut dev = TestDevice::standard()?;
    let cbe = &mut dev.cbe;
    for round in 0..10 {
        let before = cbe.curr_gen();
        if round % 2 == 0 {
            cbe.write(round, &payload(round as u8))?;
        }
        cbe.sync()?;
        assert_eq!(cbe.curr_gen(), before + 1);
        assert_eq!(cbe.last_secured_generation(), before);
        assert_eq!(cbe.state(), SuperblockState::Normal);
    }
    Ok(())
}

#[test]
fn rewrites_within_a_generation_stay_in_place() -> Result<()> {
    let mut dev = TestDevice::standard()?;
    dev.cbe.write(5, &payload(1))?;
    dev.cbe.write(6, &payload(1))?;
    let free = dev.cbe.nr_of_free_blocks();
    dev.cbe.write(5, &payload(2))?;
    dev.cbe.write(6, &payload(3))?;
    assert_eq!(dev.cbe.nr_of_free_blocks(), free);

    dev.cbe.sync()?;
    dev.cbe.write(5, &payload(4))?;
    // A secured branch is copied: leaf, level-1 node and root.
    assert_eq!(dev.cbe.nr_of_free_blocks(), free - 3);
    assert_eq!(dev.cbe.read(5)?, payload(4));
    assert_eq!(dev.cbe.read(6)?, payload(3));
    Ok(())
}
