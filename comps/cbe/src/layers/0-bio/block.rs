// SPDX-License-Identifier: MPL-2.0

use super::BLOCK_SIZE;
use crate::{error::Errno::InvalidArgs, prelude::Result, return_errno_with_msg};

/// A heap-allocated buffer of exactly one block.
#[derive(Clone, PartialEq, Eq)]
pub struct Block(Box<[u8; BLOCK_SIZE]>);

impl Block {
    /// Allocates a block filled with zeroes.
    pub fn zeroed() -> Self {
        Self(Box::new([0u8; BLOCK_SIZE]))
    }

    /// Copies one block worth of bytes out of `bytes`.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != BLOCK_SIZE {
            return_errno_with_msg!(InvalidArgs, "buffer is not one block long");
        }
        let mut block = Self::zeroed();
        block.0.copy_from_slice(bytes);
        Ok(block)
    }

    /// Allocates a block with every byte set to `byte`.
    pub fn filled(byte: u8) -> Self {
        Self(Box::new([byte; BLOCK_SIZE]))
    }

    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.0.as_mut_slice()
    }
}

impl Default for Block {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl core::fmt::Debug for Block {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Block")
            .field("head", &&self.0[..8])
            .finish_non_exhaustive()
    }
}
