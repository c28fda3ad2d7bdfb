// SPDX-License-Identifier: MPL-2.0

use std::sync::Arc;

use cbe::{Block, Cbe, Config, Geometry, MemDisk, Result, TaStore};

pub const PASSPHRASE: &str = "correct horse battery staple";

/// A formatted device together with what survives a restart.
pub struct TestDevice {
    pub disk: Arc<MemDisk>,
    pub ta: TaStore,
    pub config: Config,
    pub cbe: Cbe<MemDisk>,
}

impl TestDevice {
    pub fn format(config: Config, geometry: Geometry, nblocks: u64) -> Result<Self> {
        let _ = env_logger::builder().is_test(true).try_init();
        let disk = Arc::new(MemDisk::create(nblocks)?);
        let ta = TaStore::new();
        let cbe = Cbe::format(config, geometry, disk.clone(), ta.clone(), PASSPHRASE)?;
        Ok(Self {
            disk,
            ta,
            config,
            cbe,
        })
    }

    /// Degree 64 and two levels, the shape of a small real device.
    pub fn standard() -> Result<Self> {
        let geometry = Geometry {
            degree: 64,
            nr_of_leaves: 64 * 64,
            nr_of_pbas: 1024,
        };
        Self::format(Config::default(), geometry, 2048)
    }

    /// Opens the device again, as after a power cut: whatever was not
    /// secured is gone.
    pub fn restart(&mut self) -> Result<()> {
        self.cbe = self.open(PASSPHRASE)?;
        Ok(())
    }

    pub fn open(&self, passphrase: &str) -> Result<Cbe<MemDisk>> {
        Cbe::open(self.config, self.disk.clone(), self.ta.clone(), passphrase)
    }
}

/// A block whose content identifies `tag`.
pub fn payload(tag: u8) -> Block {
    let mut block = Block::filled(tag);
    block.as_mut_slice()[..8].copy_from_slice(&u64::from(tag).to_be_bytes());
    block
}
