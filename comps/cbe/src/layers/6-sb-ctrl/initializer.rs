// SPDX-License-Identifier: MPL-2.0

use super::superblock::{Key, Superblock};
use crate::{
    config::Geometry,
    layers::{bio::BlockSet, free_tree::FreeTreeInfo, trust_anchor::TrustAnchor},
    prelude::*,
    tree::{
        INVALID_GENERATION, NR_OF_SUPERBLOCK_SLOTS, Snapshot, TREE_MAX_LEVEL, Type1Block,
        Type1Node, check_degree, hash_of, height_for,
    },
};

/// The id of the key a fresh device starts with.
const FIRST_KEY_ID: u32 = 1;

/// Lays out a new device on `disk`.
///
/// The superblock ring takes the first blocks, the free tree manages the
/// `geometry.nr_of_pbas` blocks after it. The inner nodes of the VBD tree
/// are written at the start of the free-tree range; every leaf is left
/// unwritten and reads as zeroes. The superblock of generation 0 goes to
/// slot 0 and its hash is sealed by `ta`.
pub fn format<D: BlockSet>(
    disk: &D,
    ta: &mut TrustAnchor,
    geometry: &Geometry,
    passphrase: &str,
) -> Result<()> {
    let Geometry {
        degree,
        nr_of_leaves,
        nr_of_pbas,
    } = *geometry;
    check_degree(degree)?;
    if nr_of_leaves == 0 {
        return_errno_with_msg!(InvalidArgs, "a device needs at least one leaf");
    }
    let max_level = height_for(nr_of_leaves, degree);
    if max_level > TREE_MAX_LEVEL {
        return_errno_with_msg!(InvalidArgs, "too many leaves for the tree degree");
    }
    let free_tree = FreeTreeInfo {
        first_pba: NR_OF_SUPERBLOCK_SLOTS,
        nr_of_pbas,
    };
    if free_tree.end() > disk.nblocks() {
        return_errno_with_msg!(OutOfDisk, "device smaller than the geometry");
    }

    ta.initialize(passphrase)?;
    let value = ta.create_key()?;
    let key = Key {
        id: FIRST_KEY_ID,
        value,
        wrapped: ta.encrypt_key(&value)?,
    };

    let root = write_tree(disk, &free_tree, degree, nr_of_leaves, max_level)?;
    let mut snapshot = Snapshot {
        generation: INVALID_GENERATION,
        max_level,
        nr_of_leaves,
        valid: true,
        keep: false,
        ..Snapshot::default()
    };
    snapshot.set_root(root);
    let sb = Superblock::new(key, snapshot, degree, free_tree);

    let block = sb.encode()?;
    disk.write(0, &block)?;
    let stale = Block::zeroed();
    for slot in 1..NR_OF_SUPERBLOCK_SLOTS {
        disk.write(slot, &stale)?;
    }
    disk.flush()?;
    ta.secure_superblock(hash_of(&block))?;
    info!(
        "[SbCtrl] formatted: degree {}, {} leaves, height {}, {} free-tree blocks",
        degree, nr_of_leaves, max_level, nr_of_pbas
    );
    Ok(())
}

/// Writes the inner nodes bottom-up and returns the root.
fn write_tree<D: BlockSet>(
    disk: &D,
    free_tree: &FreeTreeInfo,
    degree: u32,
    nr_of_leaves: u64,
    max_level: u32,
) -> Result<Type1Node> {
    let mut next_pba = free_tree.first_pba;
    // Leaves are unwritten, so level-1 nodes start out empty.
    let mut children: Vec<Type1Node> = Vec::new();
    let mut nr_of_children = nr_of_leaves;
    for level in 1..=max_level {
        let nr_of_nodes = nr_of_children.div_ceil(degree as u64);
        if next_pba + nr_of_nodes > free_tree.end() {
            return_errno_with_msg!(OutOfDisk, "free tree too small for the VBD tree");
        }
        let mut parents = Vec::with_capacity(nr_of_nodes as usize);
        for idx in 0..nr_of_nodes as usize {
            let mut node = Type1Block::empty(degree);
            let group = children.iter().skip(idx * degree as usize).take(degree as usize);
            for (slot, child) in group.enumerate() {
                node.set_entry(slot, *child);
            }
            let block = node.encode();
            disk.write(next_pba, &block)?;
            parents.push(Type1Node {
                pba: next_pba,
                generation: INVALID_GENERATION,
                hash: hash_of(&block),
            });
            next_pba += 1;
        }
        trace!("[SbCtrl] level {} has {} nodes", level, nr_of_nodes);
        children = parents;
        nr_of_children = nr_of_nodes;
    }
    match children.as_slice() {
        [root] => Ok(*root),
        _ => return_errno_with_msg!(InvalidArgs, "VBD tree without a single root"),
    }
}
