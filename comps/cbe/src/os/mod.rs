// SPDX-License-Identifier: MPL-2.0

//! OS-specific or OS-dependent APIs.

use core::ops::{Deref, DerefMut};

use aes_gcm::{
    Aes256Gcm,
    aead::{AeadInPlace, NewAead, generic_array::GenericArray},
    aes::Aes256,
};
use ctr::cipher::{NewCipher, StreamCipher};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Errno, Error, Result},
    util::RandomInit,
};

pub use std::sync::Arc;

/// A mutual exclusion primitive. A panicking holder does not poison it.
#[repr(transparent)]
pub struct Mutex<T: ?Sized> {
    inner: std::sync::Mutex<T>,
}

impl<T> Mutex<T> {
    /// Creates a new mutex.
    pub const fn new(t: T) -> Self {
        Self {
            inner: std::sync::Mutex::new(t),
        }
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquires the mutex, blocking the current thread until it is able to.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        MutexGuard { inner }
    }
}

impl<T: ?Sized + core::fmt::Debug> core::fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(&*self.lock(), f)
    }
}

/// The guard of [`Mutex`].
pub struct MutexGuard<'a, T: ?Sized + 'a> {
    inner: std::sync::MutexGuard<'a, T>,
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

macro_rules! new_byte_array_type {
    ($name:ident, $n:expr) => {
        #[repr(C)]
        #[derive(Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
        pub struct $name([u8; $n]);

        impl $name {
            pub const SIZE: usize = $n;

            pub const fn from_bytes(bytes: [u8; $n]) -> Self {
                Self(bytes)
            }
        }

        impl Deref for $name {
            type Target = [u8];

            fn deref(&self) -> &Self::Target {
                self.0.as_slice()
            }
        }

        impl DerefMut for $name {
            fn deref_mut(&mut self) -> &mut Self::Target {
                self.0.as_mut_slice()
            }
        }

        impl RandomInit for $name {
            fn random() -> Self {
                let mut arr = [0u8; $n];
                rand::rng().fill_bytes(&mut arr);
                Self(arr)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self([0u8; $n])
            }
        }

        impl core::fmt::Debug for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(concat!(stringify!($name), "(..)"))
            }
        }
    };
}

const AES_GCM_KEY_SIZE: usize = 32;
const AES_GCM_IV_SIZE: usize = 12;
const AES_GCM_MAC_SIZE: usize = 16;

new_byte_array_type!(AeadKey, AES_GCM_KEY_SIZE);
new_byte_array_type!(AeadIv, AES_GCM_IV_SIZE);
new_byte_array_type!(AeadMac, AES_GCM_MAC_SIZE);

/// An `AEAD` cipher, AES-256-GCM.
#[derive(Debug, Default)]
pub struct Aead;

impl Aead {
    pub const fn new() -> Self {
        Self
    }
}

impl crate::util::Aead for Aead {
    type Key = AeadKey;
    type Iv = AeadIv;
    type Mac = AeadMac;

    fn seal(&self, key: &AeadKey, iv: &AeadIv, aad: &[u8], buf: &mut [u8]) -> Result<AeadMac> {
        let cipher = Aes256Gcm::new(GenericArray::from_slice(key));
        let tag = cipher
            .encrypt_in_place_detached(GenericArray::from_slice(iv), aad, buf)
            .map_err(|_| Error::with_msg(Errno::EncryptFailed, "aes-gcm seal failed"))?;
        let mut mac = AeadMac::default();
        mac.copy_from_slice(tag.as_slice());
        Ok(mac)
    }

    fn open(
        &self,
        key: &AeadKey,
        iv: &AeadIv,
        aad: &[u8],
        mac: &AeadMac,
        buf: &mut [u8],
    ) -> Result<()> {
        let cipher = Aes256Gcm::new(GenericArray::from_slice(key));
        cipher
            .decrypt_in_place_detached(
                GenericArray::from_slice(iv),
                aad,
                buf,
                GenericArray::from_slice(mac),
            )
            .map_err(|_| Error::with_msg(Errno::MacMismatched, "aes-gcm open failed"))
    }
}

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

const AES_CTR_KEY_SIZE: usize = 32;
const AES_CTR_IV_SIZE: usize = 16;

new_byte_array_type!(SkcipherKey, AES_CTR_KEY_SIZE);
new_byte_array_type!(SkcipherIv, AES_CTR_IV_SIZE);

/// A symmetric key cipher, AES-256-CTR.
#[derive(Debug, Default)]
pub struct Skcipher;

impl Skcipher {
    pub const fn new() -> Self {
        Self
    }

    fn apply(key: &SkcipherKey, iv: &SkcipherIv, buf: &mut [u8], errno: Errno) -> Result<()> {
        let mut cipher = Aes256Ctr::new_from_slices(key, iv)
            .map_err(|_| Error::with_msg(errno, "invalid aes-ctr key or iv length"))?;
        cipher.apply_keystream(buf);
        Ok(())
    }
}

impl crate::util::Skcipher for Skcipher {
    type Key = SkcipherKey;
    type Iv = SkcipherIv;

    fn encrypt(&self, key: &SkcipherKey, iv: &SkcipherIv, buf: &mut [u8]) -> Result<()> {
        Self::apply(key, iv, buf, Errno::EncryptFailed)
    }

    fn decrypt(&self, key: &SkcipherKey, iv: &SkcipherIv, buf: &mut [u8]) -> Result<()> {
        Self::apply(key, iv, buf, Errno::DecryptFailed)
    }
}
