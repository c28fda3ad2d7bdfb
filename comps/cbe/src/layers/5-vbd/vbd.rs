// SPDX-License-Identifier: MPL-2.0

use hashbrown::HashMap;

use super::branch::Branch;
use crate::{
    layers::{
        bio::BlockIoReq,
        cache::CacheReq,
        free_tree::{AllocCtx, AllocKind, AllocReq, FreeTreeReq},
    },
    module::{
        ChannelPool, ChannelState, Module, ModuleId, ModuleRequest, Origin, Payload, TypedPayload,
    },
    prelude::*,
    tree::{KeyId, Snapshot, TREE_MAX_LEVEL, Type1Block, Type1Node, tree_capacity},
};

/// Requests served by [`Vbd`].
#[derive(Debug)]
pub enum VbdReq {
    /// Reads `vba` of `snapshot` into `data`. A leaf never written reads as
    /// zeroes.
    ReadVba {
        vba: Vba,
        snapshot: Snapshot,
        key_id: KeyId,
        degree: u32,
        data: Block,
    },
    /// Writes `data` to `vba` of the current snapshot, which is returned
    /// updated.
    WriteVba {
        vba: Vba,
        key_id: KeyId,
        data: Block,
        snapshot: Snapshot,
        degree: u32,
        ctx: AllocCtx,
    },
    /// Re-encrypts the leaf of `vba` from the old to the new key in every
    /// snapshot containing it. `snapshots` is returned updated.
    RekeyVba {
        vba: Vba,
        old_key_id: KeyId,
        new_key_id: KeyId,
        snapshots: Vec<Snapshot>,
        curr_snap: usize,
        degree: u32,
        ctx: AllocCtx,
    },
    /// Adds leaves to the current snapshot, at most one level-1 node worth,
    /// without going past `target_nr_of_leaves`.
    ExtensionStep {
        target_nr_of_leaves: u64,
        snapshot: Snapshot,
        degree: u32,
        ctx: AllocCtx,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
enum Stage {
    #[default]
    Submitted,
    ReadNode(u32),
    ReadLeaf,
    Alloc,
    WriteLeaf,
    WriteNode(u32),
    Release,
    Completed,
}

/// Progress of a rekeying request across snapshots.
#[derive(Debug, Default)]
struct RekeyProgress {
    /// Snapshot indices in processing order.
    order: Vec<usize>,
    pos: usize,
    /// Replacement of every block rekeyed so far, keyed by level and old
    /// address. A snapshot meeting one of these blocks shares the subtree
    /// below it with a snapshot already processed.
    replaced: HashMap<(u32, Pba), Type1Node>,
    plaintext: Block,
}

#[derive(Debug, Default)]
struct VbdState {
    stage: Stage,
    branch: Branch,
    alloc_levels: Vec<u32>,
    released: Vec<Type1Node>,
    rekey: RekeyProgress,
}

impl ChannelState for VbdState {
    fn is_completed(&self) -> bool {
        self.stage == Stage::Completed
    }
}

fn into_payload<P: TypedPayload>(done: Option<Payload>) -> P {
    match done.and_then(P::take) {
        Some(payload) => payload,
        None => panic!("[Vbd] completion does not match the stage"),
    }
}

impl VbdState {
    /// Advances the request by one sub-request. Returns the next
    /// sub-request, or `None` once the request is done.
    fn advance(&mut self, req: &mut VbdReq, done: Option<Payload>) -> Result<Option<Payload>> {
        match self.stage {
            Stage::Submitted => self.start(req),
            Stage::ReadNode(level) => {
                let CacheReq::Read { data, .. } = into_payload::<CacheReq>(done) else {
                    panic!("[Vbd] expected a node read");
                };
                self.node_read(req, level, &data)
            }
            Stage::ReadLeaf => {
                let BlockIoReq::ReadClientData { data, .. } = into_payload::<BlockIoReq>(done) else {
                    panic!("[Vbd] expected a leaf read");
                };
                self.leaf_read(req, data)
            }
            Stage::Alloc => {
                let FreeTreeReq::Alloc(alloc) = into_payload::<FreeTreeReq>(done) else {
                    panic!("[Vbd] expected an allocation");
                };
                self.allocated(req, alloc.new)
            }
            Stage::WriteLeaf => {
                let BlockIoReq::WriteClientData { hash, .. } = into_payload::<BlockIoReq>(done)
                else {
                    panic!("[Vbd] expected a leaf write");
                };
                self.branch.new[0].hash = hash;
                Ok(Some(self.write_node(1)))
            }
            Stage::WriteNode(level) => {
                if level < self.branch.max_level {
                    Ok(Some(self.write_node(level + 1)))
                } else {
                    self.branch_written(req)
                }
            }
            Stage::Release => Ok(None),
            Stage::Completed => unreachable!("completed requests are not advanced"),
        }
    }

    fn start(&mut self, req: &mut VbdReq) -> Result<Option<Payload>> {
        match req {
            VbdReq::ReadVba {
                vba,
                snapshot,
                degree,
                ..
            }
            | VbdReq::WriteVba {
                vba,
                snapshot,
                degree,
                ..
            } => {
                if !snapshot.contains(*vba) {
                    return_errno_with_msg!(InvalidArgs, "vba beyond the snapshot");
                }
                self.branch = Branch::new(*vba, *degree, snapshot.root(), snapshot.max_level);
                Ok(Some(self.read_node(snapshot.max_level)))
            }
            VbdReq::RekeyVba {
                vba,
                snapshots,
                curr_snap,
                ..
            } => {
                let curr_snap = *curr_snap;
                let mut order: Vec<usize> = (0..snapshots.len())
                    .filter(|idx| snapshots[*idx].contains(*vba))
                    .collect();
                order.sort_by_key(|idx| {
                    (
                        core::cmp::Reverse(snapshots[*idx].generation),
                        *idx != curr_snap,
                    )
                });
                trace!("[Vbd] rekey vba {} across snapshots {:?}", vba, order);
                self.rekey = RekeyProgress {
                    order,
                    ..Default::default()
                };
                self.next_snapshot(req)
            }
            VbdReq::ExtensionStep {
                target_nr_of_leaves,
                snapshot,
                degree,
                ctx,
            } => {
                let nr_of_leaves = snapshot.nr_of_leaves;
                if nr_of_leaves >= *target_nr_of_leaves {
                    return Ok(None);
                }
                let fanout = *degree as u64;
                if nr_of_leaves % fanout != 0 {
                    // The last level-1 node still has free slots.
                    snapshot.nr_of_leaves =
                        (nr_of_leaves + fanout - nr_of_leaves % fanout).min(*target_nr_of_leaves);
                    return Ok(None);
                }
                if nr_of_leaves < tree_capacity(*degree, snapshot.max_level) {
                    self.branch =
                        Branch::new(nr_of_leaves, *degree, snapshot.root(), snapshot.max_level);
                    return Ok(Some(self.read_node(snapshot.max_level)));
                }
                if snapshot.max_level >= TREE_MAX_LEVEL {
                    return_errno_with_msg!(InvalidArgs, "tree already at its maximum height");
                }
                // Grow a new root whose first child is the old root.
                let max_level = snapshot.max_level + 1;
                debug!("[Vbd] grow tree to {} levels", max_level);
                self.branch = Branch::new(nr_of_leaves, *degree, Type1Node::invalid(), max_level);
                let mut root = Type1Block::empty(*degree);
                root.set_entry(0, snapshot.root());
                self.branch.nodes[max_level as usize] = Some(root);
                self.branch.add_empty_below(max_level);
                self.branch.rewrite_from = 1;
                let ctx = ctx.clone();
                self.plan_alloc(req, AllocKind::NonRekeying, &ctx, |node| {
                    node.is_valid() && node.generation == ctx.curr_gen
                })
            }
        }
    }

    fn read_node(&mut self, level: u32) -> Payload {
        self.stage = Stage::ReadNode(level);
        CacheReq::Read {
            pba: self.branch.old[level as usize].pba,
            data: Block::zeroed(),
        }
        .into()
    }

    fn node_read(&mut self, req: &mut VbdReq, level: u32, block: &Block) -> Result<Option<Payload>> {
        let child = self.branch.descend(level, block)?;
        match req {
            VbdReq::ReadVba {
                vba, key_id, data, ..
            } => {
                if level > 1 {
                    return Ok(Some(self.read_node(level - 1)));
                }
                if child.is_unwritten_leaf() {
                    *data = Block::zeroed();
                    return Ok(None);
                }
                self.stage = Stage::ReadLeaf;
                Ok(Some(
                    BlockIoReq::ReadClientData {
                        pba: child.pba,
                        vba: *vba,
                        key_id: *key_id,
                        hash: child.hash,
                        data: Block::zeroed(),
                    }
                    .into(),
                ))
            }
            VbdReq::WriteVba { ctx, .. } => {
                if level > 1 {
                    return Ok(Some(self.read_node(level - 1)));
                }
                self.branch.rewrite_from = 0;
                let ctx = ctx.clone();
                self.plan_alloc(req, AllocKind::NonRekeying, &ctx, |node| {
                    node.is_valid() && node.generation == ctx.curr_gen
                })
            }
            VbdReq::ExtensionStep {
                target_nr_of_leaves,
                snapshot,
                degree,
                ctx,
            } => {
                if level == 1 {
                    // The level-1 node exists already; only the count grows.
                    let nr_of_leaves = snapshot.nr_of_leaves;
                    snapshot.nr_of_leaves =
                        nr_of_leaves + (*degree as u64).min(*target_nr_of_leaves - nr_of_leaves);
                    return Ok(None);
                }
                if child.is_valid() {
                    return Ok(Some(self.read_node(level - 1)));
                }
                self.branch.add_empty_below(level);
                self.branch.rewrite_from = 1;
                let ctx = ctx.clone();
                self.plan_alloc(req, AllocKind::NonRekeying, &ctx, |node| {
                    node.is_valid() && node.generation == ctx.curr_gen
                })
            }
            VbdReq::RekeyVba {
                vba,
                old_key_id,
                curr_snap,
                ctx,
                ..
            } => {
                if child.is_valid() {
                    if let Some(replaced) = self.rekey.replaced.get(&(level - 1, child.pba)) {
                        if *replaced == child {
                            self.rekey.pos += 1;
                            return self.next_snapshot(req);
                        }
                        self.branch.new[level as usize - 1] = *replaced;
                        self.branch.rewrite_from = level;
                        let (curr_snap, ctx) = (*curr_snap, ctx.clone());
                        return self.plan_rekey_alloc(req, curr_snap, &ctx);
                    }
                }
                if level > 1 {
                    return Ok(Some(self.read_node(level - 1)));
                }
                if child.is_unwritten_leaf() {
                    self.rekey.pos += 1;
                    return self.next_snapshot(req);
                }
                self.stage = Stage::ReadLeaf;
                Ok(Some(
                    BlockIoReq::ReadClientData {
                        pba: child.pba,
                        vba: *vba,
                        key_id: *old_key_id,
                        hash: child.hash,
                        data: Block::zeroed(),
                    }
                    .into(),
                ))
            }
        }
    }

    fn leaf_read(&mut self, req: &mut VbdReq, plaintext: Block) -> Result<Option<Payload>> {
        match req {
            VbdReq::ReadVba { data, .. } => {
                *data = plaintext;
                Ok(None)
            }
            VbdReq::RekeyVba { curr_snap, ctx, .. } => {
                self.rekey.plaintext = plaintext;
                self.branch.rewrite_from = 0;
                let (curr_snap, ctx) = (*curr_snap, ctx.clone());
                self.plan_rekey_alloc(req, curr_snap, &ctx)
            }
            other => panic!("[Vbd] no leaf read for {:?}", other),
        }
    }

    fn plan_rekey_alloc(
        &mut self,
        req: &VbdReq,
        curr_snap: usize,
        ctx: &AllocCtx,
    ) -> Result<Option<Payload>> {
        let is_current = self.rekey.order[self.rekey.pos] == curr_snap;
        let kind = if is_current {
            AllocKind::RekeyingCurrGen
        } else {
            AllocKind::RekeyingOldGen
        };
        let curr_gen = ctx.curr_gen;
        self.plan_alloc(req, kind, ctx, |node| {
            is_current && node.is_valid() && node.generation == curr_gen
        })
    }

    /// Decides which levels from `rewrite_from` up need a new block and
    /// asks the free tree for them. Levels for which `in_place` holds are
    /// rewritten where they are.
    fn plan_alloc(
        &mut self,
        req: &VbdReq,
        kind: AllocKind,
        ctx: &AllocCtx,
        in_place: impl Fn(&Type1Node) -> bool,
    ) -> Result<Option<Payload>> {
        let branch = &mut self.branch;
        let mut levels = Vec::new();
        for level in branch.rewrite_from..=branch.max_level {
            let old = branch.old[level as usize];
            if !in_place(&old) {
                levels.push(level);
            }
            branch.new[level as usize] = Type1Node {
                pba: old.pba,
                generation: match kind {
                    AllocKind::NonRekeying => ctx.curr_gen,
                    AllocKind::RekeyingCurrGen | AllocKind::RekeyingOldGen => old.generation,
                },
                hash: old.hash,
            };
        }
        if levels.is_empty() {
            return Ok(Some(self.first_write(req)));
        }
        let old = levels
            .iter()
            .map(|level| branch.old[*level as usize])
            .collect();
        self.alloc_levels = levels;
        self.stage = Stage::Alloc;
        Ok(Some(
            FreeTreeReq::Alloc(AllocReq {
                kind,
                ctx: ctx.clone(),
                old,
                new: Vec::new(),
            })
            .into(),
        ))
    }

    fn allocated(&mut self, req: &mut VbdReq, new: Vec<Type1Node>) -> Result<Option<Payload>> {
        for (level, node) in self.alloc_levels.iter().zip(new) {
            let level = *level as usize;
            let old = self.branch.old[level];
            if old.is_valid() {
                self.released.push(old);
            }
            self.branch.new[level].pba = node.pba;
            self.branch.new[level].generation = node.generation;
        }
        Ok(Some(self.first_write(req)))
    }

    /// Issues the first write of the branch: the leaf if it is rewritten,
    /// the lowest rewritten node otherwise.
    fn first_write(&mut self, req: &VbdReq) -> Payload {
        if self.branch.rewrite_from > 0 {
            return self.write_node(self.branch.rewrite_from);
        }
        let (key_id, data) = match req {
            VbdReq::WriteVba { key_id, data, .. } => (*key_id, data.clone()),
            VbdReq::RekeyVba { new_key_id, .. } => {
                (*new_key_id, core::mem::take(&mut self.rekey.plaintext))
            }
            other => panic!("[Vbd] no leaf write for {:?}", other),
        };
        self.stage = Stage::WriteLeaf;
        BlockIoReq::WriteClientData {
            pba: self.branch.new[0].pba,
            vba: self.branch.vba,
            key_id,
            data,
            hash: Hash::default(),
        }
        .into()
    }

    fn write_node(&mut self, level: u32) -> Payload {
        let data = self.branch.link(level);
        self.stage = Stage::WriteNode(level);
        CacheReq::Write {
            pba: self.branch.new[level as usize].pba,
            data,
        }
        .into()
    }

    fn branch_written(&mut self, req: &mut VbdReq) -> Result<Option<Payload>> {
        let root = self.branch.new_root();
        match req {
            VbdReq::WriteVba { snapshot, ctx, .. } => {
                snapshot.set_root(root);
                Ok(self.release(ctx.curr_gen, false))
            }
            VbdReq::ExtensionStep {
                target_nr_of_leaves,
                snapshot,
                degree,
                ctx,
            } => {
                let nr_of_leaves = snapshot.nr_of_leaves;
                snapshot.set_root(root);
                snapshot.max_level = self.branch.max_level;
                snapshot.nr_of_leaves =
                    nr_of_leaves + (*degree as u64).min(*target_nr_of_leaves - nr_of_leaves);
                debug!(
                    "[Vbd] extended to {} leaves, {} levels",
                    snapshot.nr_of_leaves, snapshot.max_level
                );
                Ok(self.release(ctx.curr_gen, false))
            }
            VbdReq::RekeyVba { snapshots, .. } => {
                let branch = &self.branch;
                for level in branch.rewrite_from..=branch.max_level {
                    let level_idx = level as usize;
                    self.rekey
                        .replaced
                        .insert((level, branch.old[level_idx].pba), branch.new[level_idx]);
                }
                snapshots[self.rekey.order[self.rekey.pos]].set_root(root);
                self.rekey.pos += 1;
                self.next_snapshot(req)
            }
            VbdReq::ReadVba { .. } => unreachable!("reads write no nodes"),
        }
    }

    /// Moves on to the next snapshot of a rekeying request that is not
    /// fully covered by blocks already rekeyed.
    fn next_snapshot(&mut self, req: &mut VbdReq) -> Result<Option<Payload>> {
        let VbdReq::RekeyVba {
            vba,
            snapshots,
            degree,
            ctx,
            ..
        } = req
        else {
            unreachable!("only rekeying walks several snapshots");
        };
        while let Some(idx) = self.rekey.order.get(self.rekey.pos).copied() {
            let snapshot = &mut snapshots[idx];
            let root = snapshot.root();
            if let Some(replaced) = self.rekey.replaced.get(&(snapshot.max_level, root.pba)) {
                snapshot.set_root(*replaced);
                self.rekey.pos += 1;
                continue;
            }
            self.branch = Branch::new(*vba, *degree, root, snapshot.max_level);
            return Ok(Some(self.read_node(snapshot.max_level)));
        }
        let free_gen = ctx.curr_gen;
        Ok(self.release(free_gen, true))
    }

    fn release(&mut self, free_gen: Generation, rekeyed: bool) -> Option<Payload> {
        if self.released.is_empty() {
            return None;
        }
        self.stage = Stage::Release;
        Some(
            FreeTreeReq::Release {
                blocks: core::mem::take(&mut self.released),
                free_gen,
                rekeyed,
            }
            .into(),
        )
    }
}

/// The virtual block device module.
pub struct Vbd {
    pool: ChannelPool<VbdState>,
}

impl Vbd {
    pub fn new(nr_of_channels: usize) -> Self {
        Self {
            pool: ChannelPool::new(ModuleId::Vbd, nr_of_channels),
        }
    }

    fn step(&mut self, idx: usize, progress: &mut bool) {
        let Some(chan) = self.pool.get_mut(idx) else {
            return;
        };
        let done = match chan.state.stage {
            Stage::Completed => return,
            Stage::Submitted => None,
            _ => match chan.take_completed_prim() {
                Some(prim) => Some(prim),
                None => return,
            },
        };
        *progress = true;
        let done = match done {
            Some(prim) => match prim.result {
                Ok(()) => Some(prim.payload),
                Err(err) => {
                    warn!("[Vbd] sub-request failed in {:?}: {}", chan.state.stage, err);
                    chan.fail(err);
                    chan.state.stage = Stage::Completed;
                    return;
                }
            },
            None => None,
        };
        let outcome = chan.state.advance(chan.req.payload_mut::<VbdReq>(), done);
        match outcome {
            Ok(Some(payload)) => chan.generate(payload),
            Ok(None) => chan.state.stage = Stage::Completed,
            Err(err) => {
                warn!("[Vbd] request failed in {:?}: {}", chan.state.stage, err);
                chan.fail(err);
                chan.state.stage = Stage::Completed;
            }
        }
    }
}

impl Module for Vbd {
    fn ready_to_submit_request(&self) -> bool {
        self.pool.has_free_slot()
    }

    fn submit_request(&mut self, req: ModuleRequest) {
        self.pool.insert(req, VbdState::default());
    }

    fn execute(&mut self, progress: &mut bool) {
        for idx in self.pool.occupied() {
            self.step(idx, progress);
        }
    }

    fn peek_completed_request(&self) -> Option<&ModuleRequest> {
        self.pool.peek_completed()
    }

    fn drop_completed_request(&mut self, origin: Origin) -> ModuleRequest {
        self.pool.take_completed(origin)
    }

    fn peek_generated_request(&self) -> Option<&ModuleRequest> {
        self.pool.peek_generated()
    }

    fn drop_generated_request(&mut self, origin: Origin) -> ModuleRequest {
        self.pool.take_generated(origin)
    }

    fn generated_request_complete(&mut self, req: ModuleRequest) {
        self.pool.complete_generated(req);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(nr_of_leaves: u64, max_level: u32) -> Snapshot {
        Snapshot {
            pba: 8,
            generation: 1,
            root_generation: 0,
            hash: Hash::default(),
            max_level,
            nr_of_leaves,
            valid: true,
            keep: false,
        }
    }

    fn run_to_completion(vbd: &mut Vbd, payload: VbdReq) -> ModuleRequest {
        vbd.submit_request(ModuleRequest::new(Origin::Library, payload));
        let mut progress = false;
        vbd.execute(&mut progress);
        assert!(progress);
        vbd.drop_completed_request(Origin::Library)
    }

    #[test]
    fn extension_fills_the_last_node_without_io() {
        let mut vbd = Vbd::new(1);
        let req = run_to_completion(
            &mut vbd,
            VbdReq::ExtensionStep {
                target_nr_of_leaves: 100,
                snapshot: snapshot(10, 1),
                degree: 64,
                ctx: AllocCtx::default(),
            },
        );
        let (VbdReq::ExtensionStep { snapshot, .. }, Ok(())) = req.into_parts::<VbdReq>() else {
            panic!("extension step failed");
        };
        assert_eq!(snapshot.nr_of_leaves, 64);
        assert!(vbd.peek_generated_request().is_none());
    }

    #[test]
    fn out_of_range_vba_is_rejected() {
        let mut vbd = Vbd::new(1);
        let req = run_to_completion(
            &mut vbd,
            VbdReq::ReadVba {
                vba: 10,
                snapshot: snapshot(10, 1),
                key_id: 1,
                degree: 64,
                data: Block::zeroed(),
            },
        );
        assert_eq!(req.result.unwrap_err().errno(), InvalidArgs);
    }

    #[test]
    fn read_starts_at_the_root() {
        let mut vbd = Vbd::new(1);
        vbd.submit_request(ModuleRequest::new(
            Origin::Library,
            VbdReq::ReadVba {
                vba: 3,
                snapshot: snapshot(10, 1),
                key_id: 1,
                degree: 64,
                data: Block::zeroed(),
            },
        ));
        let mut progress = false;
        vbd.execute(&mut progress);
        let sub = vbd.peek_generated_request().unwrap();
        let CacheReq::Read { pba, .. } = sub.payload::<CacheReq>() else {
            panic!("expected a node read");
        };
        assert_eq!(*pba, 8);
    }

    #[test]
    fn full_tree_at_maximum_height_cannot_grow() {
        let mut vbd = Vbd::new(1);
        let req = run_to_completion(
            &mut vbd,
            VbdReq::ExtensionStep {
                target_nr_of_leaves: 200,
                snapshot: snapshot(tree_capacity(2, TREE_MAX_LEVEL), TREE_MAX_LEVEL),
                degree: 2,
                ctx: AllocCtx::default(),
            },
        );
        assert_eq!(req.result.unwrap_err().errno(), InvalidArgs);
    }
}
