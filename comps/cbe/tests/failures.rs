// SPDX-License-Identifier: MPL-2.0

mod common;

use cbe::{Config, Errno, Geometry, Result};
use common::{PASSPHRASE, TestDevice, payload};

#[test]
fn failed_commit_keeps_the_generation() -> Result<()> {
    let mut dev = TestDevice::standard()?;
    let curr_gen = dev.cbe.curr_gen();
    dev.cbe.write(0, &payload(1))?;

    // The first commit after formatting goes to slot 1.
    dev.disk.inject_fault(1);
    assert_eq!(dev.cbe.sync().unwrap_err().errno(), Errno::IoFailed);
    assert_eq!(dev.cbe.curr_gen(), curr_gen);
    assert_eq!(dev.cbe.read(0)?, payload(1));

    dev.disk.clear_faults();
    dev.cbe.sync()?;
    assert_eq!(dev.cbe.curr_gen(), curr_gen + 1);
    dev.restart()?;
    assert_eq!(dev.cbe.read(0)?, payload(1));
    Ok(())
}

#[test]
fn corrupted_tree_node_is_detected() -> Result<()> {
    let config = Config {
        cache_capacity: 1,
        ..Config::default()
    };
    let geometry = Geometry {
        degree: 64,
        nr_of_leaves: 64 * 64,
        nr_of_pbas: 1024,
    };
    let mut dev = TestDevice::format(config, geometry, 2048)?;
    dev.cbe.write(0, &payload(1))?;
    dev.cbe.sync()?;
    // Leaves only the level-1 node of vba 0 in the cache.
    assert_eq!(dev.cbe.read(0)?, payload(1));

    let current = dev
        .cbe
        .snapshots()
        .into_iter()
        .max_by_key(|snapshot| snapshot.generation)
        .unwrap();
    let root = current.pba;
    dev.disk.corrupt(root);
    assert_eq!(dev.cbe.read(64).unwrap_err().errno(), Errno::HashMismatch);

    let err = dev.open(PASSPHRASE).err().map(|err| err.errno());
    assert_eq!(err, Some(Errno::HashMismatch));
    Ok(())
}

#[test]
fn corrupted_superblock_is_not_trusted() -> Result<()> {
    let mut dev = TestDevice::standard()?;
    dev.cbe.write(0, &payload(1))?;
    dev.cbe.sync()?;

    dev.disk.corrupt(1);
    let err = dev.open(PASSPHRASE).err().map(|err| err.errno());
    assert_eq!(err, Some(Errno::NoValidSuperblock));
    Ok(())
}

#[test]
fn deinitialized_device_rejects_requests() -> Result<()> {
    let mut dev = TestDevice::standard()?;
    dev.cbe.write(9, &payload(9))?;
    dev.cbe.deinitialize()?;

    assert_eq!(dev.cbe.read(9).unwrap_err().errno(), Errno::NotInitialized);
    assert_eq!(
        dev.cbe.write(9, &payload(1)).unwrap_err().errno(),
        Errno::NotInitialized
    );
    assert_eq!(dev.cbe.sync().unwrap_err().errno(), Errno::NotInitialized);

    // Deinitializing secured the last write.
    dev.restart()?;
    assert_eq!(dev.cbe.read(9)?, payload(9));
    Ok(())
}

#[test]
fn exhausted_free_tree_fails_the_write_only() -> Result<()> {
    // Four level-1 nodes and the root leave three free blocks.
    let geometry = Geometry {
        degree: 4,
        nr_of_leaves: 16,
        nr_of_pbas: 8,
    };
    let mut dev = TestDevice::format(Config::default(), geometry, 512)?;
    assert_eq!(dev.cbe.nr_of_free_blocks(), 3);

    dev.cbe.write(0, &payload(1))?;
    assert_eq!(dev.cbe.nr_of_free_blocks(), 0);
    assert_eq!(
        dev.cbe.write(5, &payload(2)).unwrap_err().errno(),
        Errno::OutOfDisk
    );
    assert_eq!(dev.cbe.read(0)?, payload(1));
    dev.cbe.sync()?;
    dev.restart()?;
    assert_eq!(dev.cbe.read(0)?, payload(1));
    Ok(())
}
