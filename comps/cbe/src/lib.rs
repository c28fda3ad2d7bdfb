// SPDX-License-Identifier: MPL-2.0

//! The Consistent Block Encrypter (CBE).
//!
//! The CBE turns an untrusted block device into an encrypted virtual block
//! device. Client blocks are the leaves of a hashed tree whose inner nodes
//! record the address, generation and hash of each child. Writes never
//! touch a block of a secured generation; they allocate new blocks and
//! rewrite the branch above. A commit seals the hash of the superblock with
//! a trust anchor and places it into the next slot of a ring, so a crash
//! never loses the last secured generation.
//!
//! Secured generations can be kept as snapshots, the client-data key can be
//! replaced while the device is in use, and both the device and its pool
//! of physical blocks can grow.

#![deny(unsafe_code)]

mod cbe;
mod config;
mod error;
mod layers;
mod module;
mod os;
mod prelude;
mod tree;
mod util;

pub use self::{
    cbe::Cbe,
    config::{Config, Geometry},
    error::{Errno, Error, Result},
    layers::{
        bio::{BLOCK_SIZE, Block, BlockSet, MemDisk},
        sb_ctrl::{SbCtrlReq, SuperblockState},
        trust_anchor::TaStore,
    },
    tree::{Generation, Hash, Pba, Snapshot, Vba},
};
