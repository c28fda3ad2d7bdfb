// SPDX-License-Identifier: MPL-2.0

use crate::{
    prelude::*,
    tree::{Type1Block, Type1Node, child_idx_for_vba, hash_of},
};

/// The path from a snapshot root down to one leaf.
///
/// Index `l` of `old` and `new` holds the pointer to the level-`l` block
/// (the leaf at level 0) before and after the update; `nodes[l]` holds the
/// decoded level-`l` node. Levels below `rewrite_from` are left untouched.
#[derive(Debug, Default)]
pub(super) struct Branch {
    pub vba: Vba,
    pub degree: u32,
    pub max_level: u32,
    pub old: Vec<Type1Node>,
    pub new: Vec<Type1Node>,
    pub nodes: Vec<Option<Type1Block>>,
    pub rewrite_from: u32,
}

impl Branch {
    pub fn new(vba: Vba, degree: u32, root: Type1Node, max_level: u32) -> Self {
        let len = max_level as usize + 1;
        let mut old = vec![Type1Node::invalid(); len];
        old[max_level as usize] = root;
        Self {
            vba,
            degree,
            max_level,
            new: vec![Type1Node::invalid(); len],
            old,
            nodes: vec![None; len],
            rewrite_from: 0,
        }
    }

    pub fn child_idx(&self, level: u32) -> usize {
        child_idx_for_vba(self.vba, level, self.degree)
    }

    /// Takes in the level-`level` node read from disk and returns the
    /// pointer to its child on the path.
    pub fn descend(&mut self, level: u32, block: &Block) -> Result<Type1Node> {
        let expected = self.old[level as usize];
        if hash_of(block) != expected.hash {
            error!(
                "[Vbd] level-{} node at pba {} fails its hash (vba {})",
                level, expected.pba, self.vba
            );
            return_errno_with_msg!(HashMismatch, "tree node hash mismatch");
        }
        let node = Type1Block::decode(block, self.degree)?;
        let child = node.entry(self.child_idx(level));
        self.old[level as usize - 1] = child;
        self.nodes[level as usize] = Some(node);
        Ok(child)
    }

    /// Puts fresh empty nodes at every level below `level`.
    pub fn add_empty_below(&mut self, level: u32) {
        for lower in 1..level {
            self.nodes[lower as usize] = Some(Type1Block::empty(self.degree));
            self.old[lower as usize] = Type1Node::invalid();
        }
    }

    /// Points the level-`level` node at the new child below it and returns
    /// the encoded node, recording its hash in `new[level]`.
    ///
    /// # Panics
    ///
    /// Panics if the node has not been read.
    pub fn link(&mut self, level: u32) -> Block {
        let idx = self.child_idx(level);
        let child = self.new[level as usize - 1];
        let Some(node) = self.nodes[level as usize].as_mut() else {
            panic!("level-{} node missing from the branch", level);
        };
        node.set_entry(idx, child);
        let block = node.encode();
        self.new[level as usize].hash = hash_of(&block);
        block
    }

    pub fn new_root(&self) -> Type1Node {
        self.new[self.max_level as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descend_and_link() -> Result<()> {
        let leaf = Type1Node {
            pba: 77,
            generation: 2,
            hash: Hash::of(b"leaf"),
        };
        let mut node = Type1Block::empty(4);
        node.set_entry(3, leaf);
        let block = node.encode();
        let root = Type1Node {
            pba: 9,
            generation: 2,
            hash: hash_of(&block),
        };

        let mut branch = Branch::new(3, 4, root, 1);
        assert_eq!(branch.descend(1, &block)?, leaf);

        branch.new[0] = Type1Node {
            pba: 78,
            generation: 3,
            hash: Hash::of(b"new leaf"),
        };
        let linked = branch.link(1);
        let decoded = Type1Block::decode(&linked, 4)?;
        assert_eq!(decoded.entry(3), branch.new[0]);
        assert_eq!(branch.new_root().hash, hash_of(&linked));
        Ok(())
    }

    #[test]
    fn descend_rejects_bad_hash() {
        let block = Type1Block::empty(4).encode();
        let mut branch = Branch::new(0, 4, Type1Node::invalid(), 1);
        assert_eq!(
            branch.descend(1, &block).unwrap_err().errno(),
            HashMismatch
        );
    }
}
