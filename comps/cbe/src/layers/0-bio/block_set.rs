// SPDX-License-Identifier: MPL-2.0

use core::sync::atomic::{AtomicUsize, Ordering};

use hashbrown::HashSet;

use super::{BLOCK_SIZE, Block};
use crate::{os::Mutex, prelude::*};

/// A fixed set of data blocks that can support random reads and writes.
///
/// # Thread safety
///
/// `BlockSet` is a data structure of interior mutability. It is ok to
/// perform I/O on a `BlockSet` concurrently in multiple threads.
pub trait BlockSet: Send + Sync {
    /// Reads the block at `pba`.
    fn read(&self, pba: Pba, block: &mut Block) -> Result<()>;

    /// Writes the block at `pba`.
    fn write(&self, pba: Pba, block: &Block) -> Result<()>;

    /// Ensures that written blocks are persisted.
    fn flush(&self) -> Result<()>;

    /// Returns the number of blocks.
    fn nblocks(&self) -> u64;
}

macro_rules! impl_blockset_for {
    ($typ:ty) => {
        impl<T: BlockSet + ?Sized> BlockSet for $typ {
            fn read(&self, pba: Pba, block: &mut Block) -> Result<()> {
                (**self).read(pba, block)
            }

            fn write(&self, pba: Pba, block: &Block) -> Result<()> {
                (**self).write(pba, block)
            }

            fn flush(&self) -> Result<()> {
                (**self).flush()
            }

            fn nblocks(&self) -> u64 {
                (**self).nblocks()
            }
        }
    };
}

impl_blockset_for!(&T);
impl_blockset_for!(Box<T>);
impl_blockset_for!(Arc<T>);

/// An in-memory disk that impls `BlockSet`.
///
/// Individual blocks can be made to fail, and the number of writes is
/// counted, so tests can observe what reached the device.
pub struct MemDisk {
    disk: Mutex<Vec<u8>>,
    nblocks: u64,
    faulty: Mutex<HashSet<Pba>>,
    nr_of_writes: AtomicUsize,
}

impl MemDisk {
    /// Creates a `MemDisk` of `nblocks` zeroed blocks.
    pub fn create(nblocks: u64) -> Result<Self> {
        let Some(len) = (nblocks as usize).checked_mul(BLOCK_SIZE) else {
            return_errno_with_msg!(InvalidArgs, "mem disk too large");
        };
        Ok(Self {
            disk: Mutex::new(vec![0u8; len]),
            nblocks,
            faulty: Mutex::new(HashSet::new()),
            nr_of_writes: AtomicUsize::new(0),
        })
    }

    /// Makes every later read and write of `pba` fail with `IoFailed`.
    pub fn inject_fault(&self, pba: Pba) {
        self.faulty.lock().insert(pba);
    }

    pub fn clear_faults(&self) {
        self.faulty.lock().clear();
    }

    /// Flips one byte of the block at `pba`, bypassing every check.
    pub fn corrupt(&self, pba: Pba) {
        let mut disk = self.disk.lock();
        let offset = pba as usize * BLOCK_SIZE;
        disk[offset] ^= 0xff;
    }

    /// Returns how many blocks have been written so far.
    pub fn nr_of_writes(&self) -> usize {
        self.nr_of_writes.load(Ordering::Acquire)
    }

    fn check(&self, pba: Pba) -> Result<usize> {
        if pba >= self.nblocks {
            return_errno_with_msg!(InvalidArgs, "block address out of bound");
        }
        if self.faulty.lock().contains(&pba) {
            return_errno_with_msg!(IoFailed, "injected I/O fault");
        }
        Ok(pba as usize * BLOCK_SIZE)
    }
}

impl BlockSet for MemDisk {
    fn read(&self, pba: Pba, block: &mut Block) -> Result<()> {
        let offset = self.check(pba)?;
        let disk = self.disk.lock();
        block
            .as_mut_slice()
            .copy_from_slice(&disk[offset..offset + BLOCK_SIZE]);
        Ok(())
    }

    fn write(&self, pba: Pba, block: &Block) -> Result<()> {
        let offset = self.check(pba)?;
        let mut disk = self.disk.lock();
        disk[offset..offset + BLOCK_SIZE].copy_from_slice(block.as_slice());
        self.nr_of_writes.fetch_add(1, Ordering::Release);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn nblocks(&self) -> u64 {
        self.nblocks
    }
}
