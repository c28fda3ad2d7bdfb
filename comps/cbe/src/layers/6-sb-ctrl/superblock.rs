// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use crate::{
    layers::{crypto::KeyValue, free_tree::FreeTreeInfo, trust_anchor::WrappedKey},
    prelude::*,
    tree::{KeyId, MAX_NR_OF_SNAPSHOTS, Snapshot},
};

/// The operation the superblock is in the middle of.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub enum SuperblockState {
    #[default]
    Invalid,
    Normal,
    Rekeying,
    ExtendingVbd,
    ExtendingFt,
}

/// A client-data key. Only the wrapped value reaches the disk.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct Key {
    pub id: KeyId,
    #[serde(skip)]
    pub value: KeyValue,
    pub wrapped: WrappedKey,
}

/// The root of trust for one generation of the store.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Superblock {
    pub state: SuperblockState,
    /// The first VBA not yet moved to the current key while rekeying.
    pub rekeying_vba: Vba,
    /// The leaf or PBA count an extension is heading for.
    pub extension_target: u64,
    pub current_key: Key,
    /// The key being replaced, present only while rekeying.
    pub previous_key: Option<Key>,
    pub snapshots: Vec<Snapshot>,
    pub curr_snap: usize,
    pub degree: u32,
    pub last_secured_generation: Generation,
    pub free_tree: FreeTreeInfo,
}

impl Superblock {
    pub fn new(current_key: Key, root: Snapshot, degree: u32, free_tree: FreeTreeInfo) -> Self {
        let mut snapshots = vec![Snapshot::default(); MAX_NR_OF_SNAPSHOTS];
        snapshots[0] = root;
        Self {
            state: SuperblockState::Normal,
            rekeying_vba: 0,
            extension_target: 0,
            current_key,
            previous_key: None,
            snapshots,
            curr_snap: 0,
            degree,
            last_secured_generation: 0,
            free_tree,
        }
    }

    pub fn current_snapshot(&self) -> &Snapshot {
        &self.snapshots[self.curr_snap]
    }

    pub fn current_snapshot_mut(&mut self) -> &mut Snapshot {
        &mut self.snapshots[self.curr_snap]
    }

    /// Returns the key that encrypts `vba` at the moment.
    ///
    /// While rekeying, the VBAs below `rekeying_vba` are already moved to
    /// the current key; the rest still use the previous one.
    pub fn key_id_for(&self, vba: Vba) -> KeyId {
        match (&self.state, &self.previous_key) {
            (SuperblockState::Rekeying, Some(previous)) if vba >= self.rekeying_vba => previous.id,
            _ => self.current_key.id,
        }
    }

    /// Invalidates every snapshot that nothing needs anymore: not pinned,
    /// not current, and neither of the current nor of the last secured
    /// generation.
    pub fn discard_disposable_snapshots(&mut self, curr_gen: Generation) {
        let last_secured = self.last_secured_generation;
        let curr_snap = self.curr_snap;
        for (idx, snapshot) in self.snapshots.iter_mut().enumerate() {
            if idx != curr_snap
                && snapshot.valid
                && !snapshot.keep
                && snapshot.generation != curr_gen
                && snapshot.generation != last_secured
            {
                trace!("[SbCtrl] discard snapshot of generation {}", snapshot.generation);
                *snapshot = Snapshot::default();
            }
        }
    }

    pub fn free_snapshot_slot(&self) -> Option<usize> {
        self.snapshots.iter().position(|snapshot| !snapshot.valid)
    }

    /// Generations of the valid snapshots other than the current one.
    pub fn snapshot_generations(&self) -> Vec<Generation> {
        self.snapshots
            .iter()
            .enumerate()
            .filter(|(idx, snapshot)| *idx != self.curr_snap && snapshot.valid)
            .map(|(_, snapshot)| snapshot.generation)
            .collect()
    }

    /// Looks up a readable snapshot: a kept one or the current one.
    pub fn readable_snapshot(&self, generation: Generation) -> Option<&Snapshot> {
        let current = self.current_snapshot();
        if current.generation == generation {
            return Some(current);
        }
        self.snapshots
            .iter()
            .find(|snapshot| snapshot.valid && snapshot.keep && snapshot.generation == generation)
    }

    pub fn encode(&self) -> Result<Block> {
        let mut block = Block::zeroed();
        postcard::to_slice(self, block.as_mut_slice())
            .map_err(|_| Error::with_msg(SerializeFailed, "superblock does not fit a block"))?;
        Ok(block)
    }

    pub fn decode(block: &Block) -> Result<Self> {
        postcard::from_bytes(block.as_slice())
            .map_err(|_| Error::with_msg(SerializeFailed, "malformed superblock"))
    }
}
