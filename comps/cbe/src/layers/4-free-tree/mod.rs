// SPDX-License-Identifier: MPL-2.0

//! The layer of physical block allocation.
//!
//! The [`FreeTree`] hands out blocks for copy-on-write. A block replaced by
//! a write is not free right away: older snapshots may still reach it. It
//! becomes reusable once the replacement is secured and no valid snapshot
//! was taken between the generation the block was written in and the one
//! it was replaced in.

mod free_table;

pub use self::free_table::{AllocCtx, FreeTreeInfo};
use self::free_table::FreeTable;
use crate::{
    layers::bio::BlockSet,
    module::{ChannelPool, Module, ModuleId, ModuleRequest, Origin, SyncState},
    prelude::*,
    tree::{Snapshot, Type1Block, Type1Node, hash_of},
};

/// How the generation of a newly allocated block is chosen.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AllocKind {
    /// Copy-on-write by a client write; new blocks belong to the current
    /// generation.
    NonRekeying,
    /// Rekeying of the current snapshot.
    RekeyingCurrGen,
    /// Rekeying of an older snapshot.
    RekeyingOldGen,
}

/// Allocation of replacements for the blocks in `old`.
#[derive(Debug)]
pub struct AllocReq {
    pub kind: AllocKind,
    pub ctx: AllocCtx,
    pub old: Vec<Type1Node>,
    /// One entry per block of `old`, filled on completion.
    pub new: Vec<Type1Node>,
}

/// Requests served by [`FreeTree`].
#[derive(Debug)]
pub enum FreeTreeReq {
    Alloc(AllocReq),
    /// Reserves the replaced `blocks`; they become reusable later.
    Release {
        blocks: Vec<Type1Node>,
        free_gen: Generation,
        rekeyed: bool,
    },
    /// Grows the managed range; the new range is returned in `info`.
    Extend { nr_of_pbas: u64, info: FreeTreeInfo },
    /// Rebuilds the allocation state from the trees of `snapshots`.
    Recover {
        info: FreeTreeInfo,
        snapshots: Vec<Snapshot>,
        degree: u32,
    },
}

/// The free-tree module.
pub struct FreeTree<D> {
    disk: Arc<D>,
    table: FreeTable,
    pool: ChannelPool<SyncState>,
}

impl<D: BlockSet> FreeTree<D> {
    pub fn new(disk: Arc<D>, info: FreeTreeInfo, nr_of_channels: usize) -> Self {
        Self {
            disk,
            table: FreeTable::new(info),
            pool: ChannelPool::new(ModuleId::FreeTree, nr_of_channels),
        }
    }

    pub fn info(&self) -> FreeTreeInfo {
        self.table.info()
    }

    pub fn nr_of_free(&self) -> u64 {
        self.table.nr_of_free()
    }

    pub fn alloc(&mut self, req: &mut AllocReq) -> Result<()> {
        let pbas = self.table.alloc(req.old.len(), &req.ctx)?;
        req.new = req
            .old
            .iter()
            .zip(pbas)
            .map(|(old, pba)| Type1Node {
                pba,
                generation: match req.kind {
                    AllocKind::NonRekeying => req.ctx.curr_gen,
                    AllocKind::RekeyingCurrGen | AllocKind::RekeyingOldGen => old.generation,
                },
                hash: old.hash,
            })
            .collect();
        trace!("[FreeTree] {:?} allocated {:?}", req.kind, req.new);
        Ok(())
    }

    pub fn release(&mut self, blocks: &[Type1Node], free_gen: Generation, rekeyed: bool) {
        for block in blocks.iter().filter(|block| block.is_valid()) {
            self.table.release(block, free_gen, rekeyed);
        }
    }

    pub fn extend(&mut self, nr_of_pbas: u64) -> Result<FreeTreeInfo> {
        let end = self.table.info().end();
        if end.saturating_add(nr_of_pbas) > self.disk.nblocks() {
            return_errno_with_msg!(OutOfDisk, "free-tree extension beyond the device");
        }
        self.table.extend(nr_of_pbas);
        info!("[FreeTree] extended to {:?}", self.table.info());
        Ok(self.table.info())
    }

    /// Marks every block reachable from a valid snapshot as used, verifying
    /// each inner node against the hash its parent recorded.
    pub fn recover(&mut self, info: FreeTreeInfo, snapshots: &[Snapshot], degree: u32) -> Result<()> {
        self.table.reset(info);
        let mut block = Block::zeroed();
        for snapshot in snapshots.iter().filter(|snapshot| snapshot.valid) {
            let mut stack = vec![(snapshot.root(), snapshot.max_level)];
            while let Some((node, level)) = stack.pop() {
                if !node.is_valid() || !self.table.mark_used(node.pba)? {
                    continue;
                }
                if level == 0 {
                    continue;
                }
                self.disk.read(node.pba, &mut block)?;
                if hash_of(&block) != node.hash {
                    error!(
                        "[FreeTree] level-{} node at pba {} fails its hash",
                        level, node.pba
                    );
                    return_errno_with_msg!(HashMismatch, "tree node hash mismatch");
                }
                let children = Type1Block::decode(&block, degree)?;
                stack.extend(
                    children
                        .entries()
                        .iter()
                        .filter(|child| child.is_valid())
                        .map(|child| (*child, level - 1)),
                );
            }
        }
        debug!(
            "[FreeTree] recovered, {} of {} blocks free",
            self.table.nr_of_free(),
            info.nr_of_pbas
        );
        Ok(())
    }

    fn serve(&mut self, req: &mut FreeTreeReq) -> Result<()> {
        match req {
            FreeTreeReq::Alloc(alloc) => self.alloc(alloc),
            FreeTreeReq::Release {
                blocks,
                free_gen,
                rekeyed,
            } => {
                self.release(blocks, *free_gen, *rekeyed);
                Ok(())
            }
            FreeTreeReq::Extend { nr_of_pbas, info } => {
                *info = self.extend(*nr_of_pbas)?;
                Ok(())
            }
            FreeTreeReq::Recover {
                info,
                snapshots,
                degree,
            } => self.recover(*info, snapshots, *degree),
        }
    }
}

impl<D: BlockSet> Module for FreeTree<D> {
    fn ready_to_submit_request(&self) -> bool {
        self.pool.has_free_slot()
    }

    fn submit_request(&mut self, req: ModuleRequest) {
        self.pool.insert(req, SyncState::Submitted);
    }

    fn execute(&mut self, progress: &mut bool) {
        for idx in self.pool.occupied() {
            let Some(chan) = self.pool.get_mut(idx) else {
                continue;
            };
            if chan.state != SyncState::Submitted {
                continue;
            }
            let mut payload = core::mem::replace(
                chan.req.payload_mut::<FreeTreeReq>(),
                FreeTreeReq::Release {
                    blocks: Vec::new(),
                    free_gen: 0,
                    rekeyed: false,
                },
            );
            let result = self.serve(&mut payload);
            if let Err(err) = &result {
                warn!("[FreeTree] request failed: {}", err);
            }
            if let Some(chan) = self.pool.get_mut(idx) {
                *chan.req.payload_mut::<FreeTreeReq>() = payload;
                chan.req.result = result;
                chan.state = SyncState::Completed;
            }
            *progress = true;
        }
    }

    fn peek_completed_request(&self) -> Option<&ModuleRequest> {
        self.pool.peek_completed()
    }

    fn drop_completed_request(&mut self, origin: Origin) -> ModuleRequest {
        self.pool.take_completed(origin)
    }
}
