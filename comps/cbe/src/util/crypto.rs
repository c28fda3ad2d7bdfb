// SPDX-License-Identifier: MPL-2.0

use core::ops::Deref;

use crate::prelude::Result;

/// Random initialization for keys, IVs and MACs.
pub trait RandomInit: Default {
    fn random() -> Self;
}

/// Authenticated Encryption with Associated Data (AEAD) algorithm.
///
/// Both directions work in place: `buf` holds the plaintext on the way in
/// and the ciphertext on the way out (or vice versa).
pub trait Aead {
    type Key: Deref<Target = [u8]> + RandomInit;
    type Iv: Deref<Target = [u8]> + RandomInit;
    type Mac: Deref<Target = [u8]> + RandomInit;

    /// Encrypts `buf` in place with a secret `Key`, an initialization vector
    /// `Iv` and additional associated data `aad`, returning the MAC that
    /// authenticates the ciphertext.
    fn seal(&self, key: &Self::Key, iv: &Self::Iv, aad: &[u8], buf: &mut [u8])
    -> Result<Self::Mac>;

    /// Verifies `mac` and decrypts `buf` in place.
    ///
    /// On a MAC mismatch `buf` must be considered garbage.
    fn open(
        &self,
        key: &Self::Key,
        iv: &Self::Iv,
        aad: &[u8],
        mac: &Self::Mac,
        buf: &mut [u8],
    ) -> Result<()>;
}

/// Symmetric key cipher algorithm working in place.
pub trait Skcipher {
    type Key: Deref<Target = [u8]> + RandomInit;
    type Iv: Deref<Target = [u8]> + RandomInit;

    /// Encrypts the plaintext in `buf` with a secret `Key` and initialization
    /// vector `Iv`.
    fn encrypt(&self, key: &Self::Key, iv: &Self::Iv, buf: &mut [u8]) -> Result<()>;

    /// Decrypts the ciphertext in `buf` with a secret `Key` and
    /// initialization vector `Iv`.
    fn decrypt(&self, key: &Self::Key, iv: &Self::Iv, buf: &mut [u8]) -> Result<()>;
}
