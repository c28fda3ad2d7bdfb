// SPDX-License-Identifier: MPL-2.0

//! Utilities.

mod crypto;

pub use self::crypto::{Aead, RandomInit, Skcipher};
