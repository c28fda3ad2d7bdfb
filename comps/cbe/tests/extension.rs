// SPDX-License-Identifier: MPL-2.0

mod common;

use cbe::{Block, Config, Errno, Geometry, Result, SuperblockState};
use common::{TestDevice, payload};

fn small(degree: u32, nr_of_leaves: u64, nr_of_pbas: u64) -> Result<TestDevice> {
    let geometry = Geometry {
        degree,
        nr_of_leaves,
        nr_of_pbas,
    };
    TestDevice::format(Config::default(), geometry, 512)
}

#[test]
fn vbd_grows_beyond_a_full_tree() -> Result<()> {
    let mut dev = small(4, 16, 256)?;
    dev.cbe.write(3, &payload(1))?;
    dev.cbe.write(15, &payload(2))?;
    dev.cbe.sync()?;
    let height = dev.cbe.snapshots()[0].max_level;

    dev.cbe.extend_vbd(10)?;
    assert_eq!(dev.cbe.state(), SuperblockState::ExtendingVbd);
    dev.cbe.wait_for_background()?;
    assert_eq!(dev.cbe.state(), SuperblockState::Normal);
    assert_eq!(dev.cbe.nr_of_leaves(), 26);
    let current = dev
        .cbe
        .snapshots()
        .into_iter()
        .max_by_key(|snapshot| snapshot.generation)
        .unwrap();
    assert_eq!(current.max_level, height + 1);

    assert_eq!(dev.cbe.read(25)?, Block::zeroed());
    dev.cbe.write(25, &payload(3))?;
    assert_eq!(
        dev.cbe.write(26, &payload(4)).unwrap_err().errno(),
        Errno::InvalidArgs
    );
    dev.cbe.sync()?;

    dev.restart()?;
    assert_eq!(dev.cbe.nr_of_leaves(), 26);
    assert_eq!(dev.cbe.read(3)?, payload(1));
    assert_eq!(dev.cbe.read(15)?, payload(2));
    assert_eq!(dev.cbe.read(25)?, payload(3));
    Ok(())
}

#[test]
fn vbd_grows_within_its_height() -> Result<()> {
    let mut dev = small(4, 5, 256)?;
    dev.cbe.write(4, &payload(1))?;
    dev.cbe.extend_vbd(9)?;
    dev.cbe.wait_for_background()?;
    assert_eq!(dev.cbe.nr_of_leaves(), 14);

    // The extension secured the write that preceded it.
    dev.restart()?;
    assert_eq!(dev.cbe.nr_of_leaves(), 14);
    assert_eq!(dev.cbe.read(4)?, payload(1));
    dev.cbe.write(13, &payload(2))?;
    assert_eq!(dev.cbe.read(13)?, payload(2));
    Ok(())
}

#[test]
fn vbd_extension_is_bounded_by_the_tree_height() -> Result<()> {
    // Degree 2 at most reaches 2^6 leaves.
    let mut dev = small(2, 16, 256)?;
    assert_eq!(dev.cbe.extend_vbd(49).unwrap_err().errno(), Errno::InvalidArgs);
    assert_eq!(dev.cbe.extend_vbd(0).unwrap_err().errno(), Errno::InvalidArgs);
    assert_eq!(dev.cbe.state(), SuperblockState::Normal);
    dev.cbe.extend_vbd(48)?;
    dev.cbe.wait_for_background()?;
    assert_eq!(dev.cbe.nr_of_leaves(), 64);
    dev.cbe.write(63, &payload(1))?;
    assert_eq!(dev.cbe.read(63)?, payload(1));
    Ok(())
}

#[test]
fn free_tree_grows_step_by_step() -> Result<()> {
    let mut dev = small(4, 16, 64)?;
    let free = dev.cbe.nr_of_free_blocks();
    dev.cbe.extend_free_tree(100)?;
    assert_eq!(dev.cbe.state(), SuperblockState::ExtendingFt);
    dev.cbe.wait_for_background()?;
    assert_eq!(dev.cbe.state(), SuperblockState::Normal);
    assert_eq!(dev.cbe.nr_of_pbas(), 164);
    assert_eq!(dev.cbe.nr_of_free_blocks(), free + 100);

    dev.restart()?;
    assert_eq!(dev.cbe.nr_of_pbas(), 164);
    Ok(())
}

#[test]
fn free_tree_extension_beyond_the_device_is_aborted() -> Result<()> {
    let mut dev = small(4, 16, 64)?;
    dev.cbe.write(1, &payload(1))?;
    dev.cbe.extend_free_tree(1000)?;
    let err = dev.cbe.wait_for_background().unwrap_err();
    assert_eq!(err.errno(), Errno::OutOfDisk);
    assert_eq!(dev.cbe.state(), SuperblockState::Normal);

    // The device stays usable and can start over.
    dev.cbe.write(2, &payload(2))?;
    dev.cbe.sync()?;
    dev.cbe.extend_free_tree(16)?;
    dev.cbe.wait_for_background()?;
    dev.restart()?;
    assert_eq!(dev.cbe.read(1)?, payload(1));
    assert_eq!(dev.cbe.read(2)?, payload(2));
    Ok(())
}
