// SPDX-License-Identifier: MPL-2.0

//! The layer of the trust anchor.
//!
//! The trust anchor is the only party that can unwrap client-data keys and
//! the only one that remembers which superblock was secured last. Its
//! persistent part lives in a [`TaStore`], which outlives any single
//! library instance the way a TPM outlives a boot.

use serde::{Deserialize, Serialize};

use crate::{
    layers::crypto::KeyValue,
    module::{ChannelPool, Module, ModuleId, ModuleRequest, Origin, SyncState},
    os::{Aead, AeadIv, AeadKey, AeadMac},
    prelude::*,
    util::{Aead as _, RandomInit},
};

/// A client-data key wrapped with the trust anchor's private key.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct WrappedKey {
    pub ciphertext: [u8; 32],
    pub iv: AeadIv,
    pub mac: AeadMac,
}

/// Requests served by [`TrustAnchor`].
#[derive(Debug)]
pub enum TaReq {
    /// Derives the private key from a passphrase.
    Initialize { passphrase: String },
    /// Creates a new random key, returned in `value`.
    CreateKey { value: KeyValue },
    /// Wraps `value` into `wrapped`.
    EncryptKey { value: KeyValue, wrapped: WrappedKey },
    /// Unwraps `wrapped` into `value`.
    DecryptKey { wrapped: WrappedKey, value: KeyValue },
    /// Seals the hash of the superblock just written.
    SecureSuperblock { hash: Hash },
    /// Returns the hash sealed last.
    GetLastSbHash { hash: Hash },
}

#[derive(Debug, Default)]
struct TaState {
    key_digest: Option<Hash>,
    last_sb_hash: Option<Hash>,
}

/// The persistent state of the trust anchor.
#[derive(Clone, Debug, Default)]
pub struct TaStore {
    state: Arc<Mutex<TaState>>,
}

impl TaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the hash sealed last, if any.
    pub fn last_sb_hash(&self) -> Option<Hash> {
        self.state.lock().last_sb_hash
    }
}

/// The trust anchor module.
pub struct TrustAnchor {
    store: TaStore,
    private_key: Option<AeadKey>,
    aead: Aead,
    pool: ChannelPool<SyncState>,
}

impl TrustAnchor {
    pub fn new(store: TaStore, nr_of_channels: usize) -> Self {
        Self {
            store,
            private_key: None,
            aead: Aead::new(),
            pool: ChannelPool::new(ModuleId::TrustAnchor, nr_of_channels),
        }
    }

    /// Derives the private key from `passphrase`.
    ///
    /// The first initialization binds the store to the passphrase; any
    /// later one must present the same passphrase.
    pub fn initialize(&mut self, passphrase: &str) -> Result<()> {
        let key_bytes = Hash::of(passphrase.as_bytes()).to_bytes();
        let digest = Hash::of(&key_bytes);
        let mut state = self.store.state.lock();
        match state.key_digest {
            Some(stored) if stored != digest => {
                warn!("[TrustAnchor] passphrase rejected");
                return_errno_with_msg!(PermissionDenied, "wrong passphrase");
            }
            Some(_) => {}
            None => state.key_digest = Some(digest),
        }
        self.private_key = Some(AeadKey::from_bytes(key_bytes));
        Ok(())
    }

    pub fn create_key(&self) -> Result<KeyValue> {
        self.private_key()?;
        Ok(KeyValue::random())
    }

    pub fn encrypt_key(&self, value: &KeyValue) -> Result<WrappedKey> {
        let private_key = self.private_key()?;
        let iv = AeadIv::random();
        let mut ciphertext = [0u8; 32];
        ciphertext.copy_from_slice(value);
        let mac = self.aead.seal(private_key, &iv, &[], &mut ciphertext)?;
        Ok(WrappedKey {
            ciphertext,
            iv,
            mac,
        })
    }

    pub fn decrypt_key(&self, wrapped: &WrappedKey) -> Result<KeyValue> {
        let private_key = self.private_key()?;
        let mut plaintext = wrapped.ciphertext;
        self.aead
            .open(private_key, &wrapped.iv, &[], &wrapped.mac, &mut plaintext)?;
        Ok(KeyValue::from_bytes(plaintext))
    }

    pub fn secure_superblock(&self, hash: Hash) -> Result<()> {
        self.private_key()?;
        debug!("[TrustAnchor] seal superblock hash {:?}", hash);
        self.store.state.lock().last_sb_hash = Some(hash);
        Ok(())
    }

    pub fn last_sb_hash(&self) -> Result<Hash> {
        self.private_key()?;
        self.store
            .last_sb_hash()
            .ok_or(Error::with_msg(NotFound, "no superblock has been secured"))
    }

    fn private_key(&self) -> Result<&AeadKey> {
        self.private_key
            .as_ref()
            .ok_or(Error::with_msg(NotInitialized, "trust anchor not initialized"))
    }

    fn serve(&mut self, req: &mut TaReq) -> Result<()> {
        match req {
            TaReq::Initialize { passphrase } => self.initialize(passphrase),
            TaReq::CreateKey { value } => {
                *value = self.create_key()?;
                Ok(())
            }
            TaReq::EncryptKey { value, wrapped } => {
                *wrapped = self.encrypt_key(value)?;
                Ok(())
            }
            TaReq::DecryptKey { wrapped, value } => {
                *value = self.decrypt_key(wrapped)?;
                Ok(())
            }
            TaReq::SecureSuperblock { hash } => self.secure_superblock(*hash),
            TaReq::GetLastSbHash { hash } => {
                *hash = self.last_sb_hash()?;
                Ok(())
            }
        }
    }
}

impl Module for TrustAnchor {
    fn ready_to_submit_request(&self) -> bool {
        self.pool.has_free_slot()
    }

    fn submit_request(&mut self, req: ModuleRequest) {
        self.pool.insert(req, SyncState::Submitted);
    }

    fn execute(&mut self, progress: &mut bool) {
        for idx in self.pool.occupied() {
            let Some(chan) = self.pool.get_mut(idx) else {
                continue;
            };
            if chan.state != SyncState::Submitted {
                continue;
            }
            let mut payload = core::mem::replace(
                chan.req.payload_mut::<TaReq>(),
                TaReq::GetLastSbHash {
                    hash: Hash::default(),
                },
            );
            let result = self.serve(&mut payload);
            if let Some(chan) = self.pool.get_mut(idx) {
                *chan.req.payload_mut::<TaReq>() = payload;
                chan.req.result = result;
                chan.state = SyncState::Completed;
            }
            *progress = true;
        }
    }

    fn peek_completed_request(&self) -> Option<&ModuleRequest> {
        self.pool.peek_completed()
    }

    fn drop_completed_request(&mut self, origin: Origin) -> ModuleRequest {
        self.pool.take_completed(origin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_wrapping() -> Result<()> {
        let mut ta = TrustAnchor::new(TaStore::new(), 1);
        assert_eq!(ta.create_key().unwrap_err().errno(), NotInitialized);
        ta.initialize("secret")?;

        let key = ta.create_key()?;
        let wrapped = ta.encrypt_key(&key)?;
        assert_ne!(wrapped.ciphertext.as_slice(), &*key);
        assert_eq!(ta.decrypt_key(&wrapped)?, key);

        let mut tampered = wrapped;
        tampered.ciphertext[3] ^= 1;
        assert_eq!(ta.decrypt_key(&tampered).unwrap_err().errno(), MacMismatched);
        Ok(())
    }

    #[test]
    fn store_survives_instances() -> Result<()> {
        let store = TaStore::new();
        let mut first = TrustAnchor::new(store.clone(), 1);
        first.initialize("secret")?;
        assert_eq!(first.last_sb_hash().unwrap_err().errno(), NotFound);
        let hash = Hash::of(b"superblock");
        first.secure_superblock(hash)?;
        let wrapped = first.encrypt_key(&KeyValue::from_bytes([7; 32]))?;

        let mut second = TrustAnchor::new(store.clone(), 1);
        assert_eq!(
            second.initialize("guess").unwrap_err().errno(),
            PermissionDenied
        );
        second.initialize("secret")?;
        assert_eq!(second.last_sb_hash()?, hash);
        assert_eq!(second.decrypt_key(&wrapped)?, KeyValue::from_bytes([7; 32]));
        Ok(())
    }
}
