// SPDX-License-Identifier: MPL-2.0

//! Definitions shared by every layer: addresses, generations, hashes and the
//! codec of type-1 nodes, the inner nodes of the VBD tree.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    error::{Errno::*, Result},
    layers::bio::{BLOCK_SIZE, Block},
    return_errno_with_msg,
};

/// Physical block address.
pub type Pba = u64;
/// Virtual block address, the block number seen by clients.
pub type Vba = u64;
/// A commit epoch.
pub type Generation = u64;
/// Identifies a key registered with the crypto module.
pub type KeyId = u32;

pub const HASH_SIZE: usize = 32;
/// Marks a child slot with no block behind it.
pub const INVALID_PBA: Pba = Pba::MAX;
/// The generation of format-time nodes. A leaf entry at this generation
/// has never been written.
pub const INVALID_GENERATION: Generation = 0;
pub const MAX_NR_OF_SNAPSHOTS: usize = 48;
pub const MAX_SUPERBLOCK_INDEX: u64 = 7;
pub const NR_OF_SUPERBLOCK_SLOTS: u64 = MAX_SUPERBLOCK_INDEX + 1;
pub const TREE_MAX_LEVEL: u32 = 6;
pub const TREE_MAX_DEGREE: u32 = 64;
pub const TREE_MIN_DEGREE: u32 = 2;

/// A SHA-256 digest.
#[repr(transparent)]
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
pub struct Hash([u8; HASH_SIZE]);

impl Hash {
    /// Hashes `data`.
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    pub const fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn to_bytes(self) -> [u8; HASH_SIZE] {
        self.0
    }
}

impl core::fmt::Debug for Hash {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        f.write_str("..")
    }
}

/// Returns the hash of a block.
pub fn hash_of(block: &Block) -> Hash {
    Hash::of(block.as_slice())
}

/// A pointer to a child block: its address, the generation it was written
/// in and the hash of its content.
#[repr(C)]
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    Debug,
    Serialize,
    Deserialize,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
pub struct Type1Node {
    pub pba: Pba,
    pub generation: Generation,
    pub hash: Hash,
}

pub const TYPE1_NODE_SIZE: usize = core::mem::size_of::<Type1Node>();
const _: () = assert!(TYPE1_NODE_SIZE * TREE_MAX_DEGREE as usize <= BLOCK_SIZE);

impl Type1Node {
    pub const fn invalid() -> Self {
        Self {
            pba: INVALID_PBA,
            generation: INVALID_GENERATION,
            hash: Hash([0; HASH_SIZE]),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.pba != INVALID_PBA
    }

    /// Whether the entry points to a leaf that was never written.
    pub fn is_unwritten_leaf(&self) -> bool {
        !self.is_valid() || self.generation == INVALID_GENERATION
    }
}

impl Default for Type1Node {
    fn default() -> Self {
        Self::invalid()
    }
}

/// The decoded content of one inner node: `degree` child pointers.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Type1Block {
    entries: Vec<Type1Node>,
}

impl Type1Block {
    /// Creates a node whose children are all absent.
    pub fn empty(degree: u32) -> Self {
        Self {
            entries: vec![Type1Node::invalid(); degree as usize],
        }
    }

    pub fn decode(block: &Block, degree: u32) -> Result<Self> {
        check_degree(degree)?;
        let entries = block.as_slice()[..degree as usize * TYPE1_NODE_SIZE]
            .chunks_exact(TYPE1_NODE_SIZE)
            .map(|chunk| {
                Type1Node::read_from_bytes(chunk)
                    .map_err(|_| crate::Error::with_msg(InvalidArgs, "malformed type-1 node"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }

    pub fn encode(&self) -> Block {
        let mut block = Block::zeroed();
        let bytes = self.entries.as_slice().as_bytes();
        block.as_mut_slice()[..bytes.len()].copy_from_slice(bytes);
        block
    }

    pub fn entry(&self, idx: usize) -> Type1Node {
        self.entries[idx]
    }

    pub fn set_entry(&mut self, idx: usize, node: Type1Node) {
        self.entries[idx] = node;
    }

    pub fn entries(&self) -> &[Type1Node] {
        &self.entries
    }
}

/// Checks that the degree is a power of two the node layout can hold.
pub fn check_degree(degree: u32) -> Result<()> {
    if !degree.is_power_of_two() || !(TREE_MIN_DEGREE..=TREE_MAX_DEGREE).contains(&degree) {
        return_errno_with_msg!(InvalidArgs, "degree must be a power of two in [2, 64]");
    }
    Ok(())
}

/// Returns the index of the child of a level-`level` node on the path to
/// `vba`. Leaves are at level 0.
pub fn child_idx_for_vba(vba: Vba, level: u32, degree: u32) -> usize {
    debug_assert!(level >= 1 && degree.is_power_of_two());
    let log2 = degree.trailing_zeros();
    ((vba >> (log2 * (level - 1))) & (degree as u64 - 1)) as usize
}

/// Returns how many leaves a tree of the given shape can address.
pub fn tree_capacity(degree: u32, max_level: u32) -> u64 {
    (degree as u64).saturating_pow(max_level)
}

/// Returns the smallest height, at least one, of a tree holding
/// `nr_of_leaves` leaves.
pub fn height_for(nr_of_leaves: u64, degree: u32) -> u32 {
    let mut level = 1;
    while tree_capacity(degree, level) < nr_of_leaves {
        level += 1;
    }
    level
}

/// A versioned root pointer into the VBD tree.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub pba: Pba,
    /// The commit generation, which is also the id of the snapshot. The
    /// current snapshot carries the current generation.
    pub generation: Generation,
    /// The generation the root block was written in.
    pub root_generation: Generation,
    pub hash: Hash,
    pub max_level: u32,
    pub nr_of_leaves: u64,
    pub valid: bool,
    pub keep: bool,
}

impl Snapshot {
    /// Returns the pointer to the root block.
    pub fn root(&self) -> Type1Node {
        Type1Node {
            pba: self.pba,
            generation: self.root_generation,
            hash: self.hash,
        }
    }

    pub fn set_root(&mut self, root: Type1Node) {
        self.pba = root.pba;
        self.root_generation = root.generation;
        self.hash = root.hash;
    }

    pub fn contains(&self, vba: Vba) -> bool {
        self.valid && vba < self.nr_of_leaves
    }
}
