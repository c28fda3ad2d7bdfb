// SPDX-License-Identifier: MPL-2.0

//! The layer of superblock control.
//!
//! [`SbCtrl`] owns the in-memory superblock. It turns client requests into
//! VBD requests with the right key and snapshot, commits the superblock
//! into a ring of slots sealed by the trust anchor, recovers the newest
//! sealed slot on start-up, and drives rekeying and extension one step at
//! a time.

mod initializer;
mod sb_ctrl;
mod superblock;

pub use self::{
    initializer::format,
    sb_ctrl::{SbCtrl, SbCtrlReq},
    superblock::SuperblockState,
};
