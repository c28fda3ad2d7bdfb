// SPDX-License-Identifier: MPL-2.0

//! The layer of untrusted block I/O.
//!
//! A [`BlockSet`] is the raw device. The [`BlockIo`] module serves plain
//! block reads and writes for the superblock ring, and client-data reads
//! and writes that pass through the crypto module on their way.

mod block;
mod block_io;
mod block_set;

pub use self::{
    block::Block,
    block_io::{BlockIo, BlockIoReq},
    block_set::{BlockSet, MemDisk},
};

pub const BLOCK_SIZE: usize = 0x1000;
