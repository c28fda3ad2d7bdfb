// SPDX-License-Identifier: MPL-2.0

mod common;

use cbe::{Block, Errno, Result};
use common::{TestDevice, payload};

#[test]
fn synced_data_survives_a_restart() -> Result<()> {
    let mut dev = TestDevice::standard()?;
    dev.cbe.write(7, &payload(1))?;
    dev.cbe.write(4095, &payload(2))?;
    dev.cbe.sync()?;
    dev.cbe.write(7, &payload(3))?;
    dev.cbe.write(8, &payload(4))?;

    dev.restart()?;
    assert_eq!(dev.cbe.read(7)?, payload(1));
    assert_eq!(dev.cbe.read(4095)?, payload(2));
    assert_eq!(dev.cbe.read(8)?, Block::zeroed());
    Ok(())
}

#[test]
fn restart_continues_after_the_last_secured_generation() -> Result<()> {
    let mut dev = TestDevice::standard()?;
    for round in 0..10u8 {
        dev.cbe.write(u64::from(round), &payload(round))?;
        dev.cbe.sync()?;
    }
    let last_secured = dev.cbe.last_secured_generation();
    dev.restart()?;
    assert_eq!(dev.cbe.last_secured_generation(), last_secured);
    assert_eq!(dev.cbe.curr_gen(), last_secured + 1);

    // The ring keeps turning after the restart.
    for round in 10..20u8 {
        dev.cbe.write(u64::from(round), &payload(round))?;
        dev.cbe.sync()?;
    }
    dev.restart()?;
    for round in 0..20u8 {
        assert_eq!(dev.cbe.read(u64::from(round))?, payload(round));
    }
    Ok(())
}

#[test]
fn opening_twice_gives_the_same_device() -> Result<()> {
    let mut dev = TestDevice::standard()?;
    dev.cbe.write(1, &payload(1))?;
    dev.cbe.create_snapshot(true)?;
    dev.cbe.write(1, &payload(2))?;
    dev.cbe.sync()?;

    let first = dev.open(common::PASSPHRASE)?;
    let second = dev.open(common::PASSPHRASE)?;
    assert_eq!(first.curr_gen(), second.curr_gen());
    assert_eq!(first.snapshots(), second.snapshots());
    assert_eq!(first.snapshots(), dev.cbe.snapshots());
    Ok(())
}

#[test]
fn wrong_passphrase_is_rejected() -> Result<()> {
    let dev = TestDevice::standard()?;
    let err = dev.open("not the passphrase").err().map(|err| err.errno());
    assert_eq!(err, Some(Errno::PermissionDenied));
    Ok(())
}
