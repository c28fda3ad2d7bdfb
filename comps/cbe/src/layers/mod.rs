// SPDX-License-Identifier: MPL-2.0

#[path = "0-bio/mod.rs"]
pub mod bio;
#[path = "1-crypto/mod.rs"]
pub mod crypto;
#[path = "2-trust-anchor/mod.rs"]
pub mod trust_anchor;
#[path = "3-cache/mod.rs"]
pub mod cache;
#[path = "4-free-tree/mod.rs"]
pub mod free_tree;
#[path = "5-vbd/mod.rs"]
pub mod vbd;
#[path = "6-sb-ctrl/mod.rs"]
pub mod sb_ctrl;
