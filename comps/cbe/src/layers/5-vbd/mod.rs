// SPDX-License-Identifier: MPL-2.0

//! The layer of the virtual block device.
//!
//! The VBD maps a VBA to its leaf through a tree of type-1 nodes hanging
//! off a snapshot root. It reads with hash verification, writes with
//! copy-on-write, re-encrypts one VBA across all snapshots for rekeying,
//! and grows the tree for extension. It never touches the superblock: the
//! snapshots it works on travel by value in the request and come back
//! updated.

mod branch;
mod vbd;

pub use self::vbd::{Vbd, VbdReq};
