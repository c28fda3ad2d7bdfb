// SPDX-License-Identifier: MPL-2.0

use bitvec::{bitvec, vec::BitVec};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::{prelude::*, tree::Type1Node};

/// The range of physical blocks handed out by the free tree.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct FreeTreeInfo {
    pub first_pba: Pba,
    pub nr_of_pbas: u64,
}

impl FreeTreeInfo {
    pub fn contains(&self, pba: Pba) -> bool {
        pba >= self.first_pba && pba - self.first_pba < self.nr_of_pbas
    }

    pub fn end(&self) -> Pba {
        self.first_pba + self.nr_of_pbas
    }
}

/// The generations that decide whether a freed block may be handed out
/// again.
#[derive(Clone, Debug, Default)]
pub struct AllocCtx {
    pub curr_gen: Generation,
    pub last_secured_gen: Generation,
    /// Generations of every valid snapshot other than the current one.
    pub snapshot_gens: Vec<Generation>,
}

/// A block that is no longer referenced by the current snapshot but may
/// still be referenced by older ones.
#[derive(Clone, Copy, Debug)]
struct Reservation {
    alloc_gen: Generation,
    free_gen: Generation,
    /// Replaced by rekeying, which re-points every snapshot at once.
    rekeyed: bool,
}

impl Reservation {
    fn is_reusable(&self, ctx: &AllocCtx) -> bool {
        if self.free_gen > ctx.last_secured_gen {
            return false;
        }
        self.rekeyed
            || !ctx
                .snapshot_gens
                .iter()
                .any(|snap_gen| self.alloc_gen <= *snap_gen && *snap_gen < self.free_gen)
    }
}

/// Block validity table of the free tree.
#[derive(Debug)]
pub(super) struct FreeTable {
    info: FreeTreeInfo,
    used: BitVec,
    reserved: HashMap<Pba, Reservation>,
    next_avail: u64,
}

impl FreeTable {
    pub fn new(info: FreeTreeInfo) -> Self {
        Self {
            info,
            used: bitvec![0; info.nr_of_pbas as usize],
            reserved: HashMap::new(),
            next_avail: 0,
        }
    }

    pub fn info(&self) -> FreeTreeInfo {
        self.info
    }

    pub fn is_used(&self, pba: Pba) -> bool {
        self.info.contains(pba) && self.used[(pba - self.info.first_pba) as usize]
    }

    pub fn nr_of_free(&self) -> u64 {
        self.used.count_zeros() as u64
    }

    /// Allocates `count` blocks, all or nothing.
    pub fn alloc(&mut self, count: usize, ctx: &AllocCtx) -> Result<Vec<Pba>> {
        let total = self.info.nr_of_pbas;
        let mut picked = Vec::with_capacity(count);
        let mut offset = 0;
        while picked.len() < count && offset < total {
            let idx = (self.next_avail + offset) % total;
            if !self.used[idx as usize] {
                picked.push(idx);
            }
            offset += 1;
        }
        if picked.len() < count {
            let mut reusable: Vec<Pba> = self
                .reserved
                .iter()
                .filter(|(_, reservation)| reservation.is_reusable(ctx))
                .map(|(pba, _)| *pba - self.info.first_pba)
                .collect();
            reusable.sort_unstable();
            picked.extend(reusable.into_iter().take(count - picked.len()));
        }
        if picked.len() < count {
            warn!(
                "[FreeTree] out of disk: {} blocks wanted, {} available",
                count,
                picked.len()
            );
            return_errno_with_msg!(OutOfDisk, "not enough free physical blocks");
        }

        for idx in picked.iter() {
            self.used.set(*idx as usize, true);
            self.reserved.remove(&(self.info.first_pba + *idx));
        }
        if let Some(last) = picked.last() {
            self.next_avail = (*last + 1) % total;
        }
        Ok(picked
            .into_iter()
            .map(|idx| self.info.first_pba + idx)
            .collect())
    }

    /// Reserves a block replaced in `free_gen` until no snapshot can
    /// reach it anymore.
    pub fn release(&mut self, node: &Type1Node, free_gen: Generation, rekeyed: bool) {
        if !self.is_used(node.pba) {
            return;
        }
        self.reserved.insert(
            node.pba,
            Reservation {
                alloc_gen: node.generation,
                free_gen,
                rekeyed,
            },
        );
    }

    pub fn extend(&mut self, nr_of_pbas: u64) {
        self.info.nr_of_pbas += nr_of_pbas;
        self.used.resize(self.info.nr_of_pbas as usize, false);
    }

    /// Forgets every allocation, as the first step of a recovery.
    pub fn reset(&mut self, info: FreeTreeInfo) {
        *self = Self::new(info);
    }

    /// Marks `pba` used, returning whether it was free before.
    pub fn mark_used(&mut self, pba: Pba) -> Result<bool> {
        if !self.info.contains(pba) {
            return_errno_with_msg!(InvalidArgs, "tree block outside the free-tree range");
        }
        let idx = (pba - self.info.first_pba) as usize;
        let was_free = !self.used[idx];
        self.used.set(idx, true);
        Ok(was_free)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(nr_of_pbas: u64) -> FreeTable {
        FreeTable::new(FreeTreeInfo {
            first_pba: 8,
            nr_of_pbas,
        })
    }

    fn node(pba: Pba, generation: Generation) -> Type1Node {
        Type1Node {
            pba,
            generation,
            hash: Hash::default(),
        }
    }

    #[test]
    fn alloc_is_all_or_nothing() -> Result<()> {
        let mut table = table(4);
        let ctx = AllocCtx::default();
        assert_eq!(table.alloc(3, &ctx)?, vec![8, 9, 10]);
        assert_eq!(table.alloc(2, &ctx).unwrap_err().errno(), OutOfDisk);
        assert_eq!(table.nr_of_free(), 1);
        assert_eq!(table.alloc(1, &ctx)?, vec![11]);
        Ok(())
    }

    #[test]
    fn freed_blocks_wait_for_the_commit() -> Result<()> {
        let mut table = table(2);
        let pbas = table.alloc(2, &AllocCtx::default())?;
        table.release(&node(pbas[0], 1), 3, false);

        let mut ctx = AllocCtx {
            curr_gen: 3,
            last_secured_gen: 2,
            snapshot_gens: vec![],
        };
        assert_eq!(table.alloc(1, &ctx).unwrap_err().errno(), OutOfDisk);
        ctx.last_secured_gen = 3;
        ctx.curr_gen = 4;
        assert_eq!(table.alloc(1, &ctx)?, vec![pbas[0]]);
        Ok(())
    }

    #[test]
    fn snapshots_pin_freed_blocks() -> Result<()> {
        let mut table = table(1);
        let pbas = table.alloc(1, &AllocCtx::default())?;
        table.release(&node(pbas[0], 2), 5, false);
        let mut ctx = AllocCtx {
            curr_gen: 7,
            last_secured_gen: 6,
            snapshot_gens: vec![4],
        };
        assert_eq!(table.alloc(1, &ctx).unwrap_err().errno(), OutOfDisk);

        // A snapshot taken before the block was written does not see it.
        ctx.snapshot_gens = vec![1, 5];
        assert_eq!(table.alloc(1, &ctx)?, pbas);
        Ok(())
    }

    #[test]
    fn rekeyed_blocks_ignore_snapshots() -> Result<()> {
        let mut table = table(1);
        let pbas = table.alloc(1, &AllocCtx::default())?;
        table.release(&node(pbas[0], 2), 5, true);
        let ctx = AllocCtx {
            curr_gen: 6,
            last_secured_gen: 5,
            snapshot_gens: vec![3],
        };
        assert_eq!(table.alloc(1, &ctx)?, pbas);
        Ok(())
    }

    #[test]
    fn extend_adds_free_blocks() -> Result<()> {
        let mut table = table(1);
        table.alloc(1, &AllocCtx::default())?;
        table.extend(2);
        assert_eq!(table.info().end(), 11);
        assert_eq!(table.alloc(2, &AllocCtx::default())?, vec![9, 10]);
        assert!(table.mark_used(11).is_err());
        Ok(())
    }
}
