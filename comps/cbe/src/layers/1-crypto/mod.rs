// SPDX-License-Identifier: MPL-2.0

//! The layer of client-data encryption.
//!
//! The [`Crypto`] module holds at most two keys, the current one and, while
//! rekeying, the previous one. Each client block is encrypted with
//! AES-256-CTR under an IV derived from its VBA.

use hashbrown::HashMap;

use crate::{
    module::{ChannelPool, Module, ModuleId, ModuleRequest, Origin, SyncState},
    os::{Skcipher, SkcipherIv, SkcipherKey},
    prelude::*,
    tree::KeyId,
    util::Skcipher as _,
};

/// The plaintext value of a client-data key.
pub type KeyValue = SkcipherKey;

pub const MAX_NR_OF_KEYS: usize = 2;

/// Requests served by [`Crypto`].
#[derive(Debug)]
pub enum CryptoReq {
    AddKey { key_id: KeyId, value: KeyValue },
    RemoveKey { key_id: KeyId },
    Encrypt { key_id: KeyId, vba: Vba, data: Block },
    Decrypt { key_id: KeyId, vba: Vba, data: Block },
}

/// The crypto module.
pub struct Crypto {
    keys: HashMap<KeyId, KeyValue>,
    cipher: Skcipher,
    pool: ChannelPool<SyncState>,
}

impl Crypto {
    pub fn new(nr_of_channels: usize) -> Self {
        Self {
            keys: HashMap::new(),
            cipher: Skcipher::new(),
            pool: ChannelPool::new(ModuleId::Crypto, nr_of_channels),
        }
    }

    pub fn add_key(&mut self, key_id: KeyId, value: KeyValue) -> Result<()> {
        if self.keys.contains_key(&key_id) {
            return_errno_with_msg!(InvalidArgs, "key id already registered");
        }
        if self.keys.len() >= MAX_NR_OF_KEYS {
            return_errno!(KeyTableFull);
        }
        debug!("[Crypto] add key {}", key_id);
        self.keys.insert(key_id, value);
        Ok(())
    }

    pub fn remove_key(&mut self, key_id: KeyId) -> Result<()> {
        if self.keys.remove(&key_id).is_none() {
            return_errno!(KeyNotFound);
        }
        debug!("[Crypto] remove key {}", key_id);
        Ok(())
    }

    pub fn encrypt(&self, key_id: KeyId, vba: Vba, data: &mut Block) -> Result<()> {
        let key = self.key(key_id)?;
        self.cipher.encrypt(key, &iv_for(vba), data.as_mut_slice())
    }

    pub fn decrypt(&self, key_id: KeyId, vba: Vba, data: &mut Block) -> Result<()> {
        let key = self.key(key_id)?;
        self.cipher.decrypt(key, &iv_for(vba), data.as_mut_slice())
    }

    fn key(&self, key_id: KeyId) -> Result<&KeyValue> {
        self.keys
            .get(&key_id)
            .ok_or(Error::with_msg(KeyNotFound, "unknown key id"))
    }

    fn serve(&mut self, req: &mut CryptoReq) -> Result<()> {
        match req {
            CryptoReq::AddKey { key_id, value } => self.add_key(*key_id, *value),
            CryptoReq::RemoveKey { key_id } => self.remove_key(*key_id),
            CryptoReq::Encrypt { key_id, vba, data } => self.encrypt(*key_id, *vba, data),
            CryptoReq::Decrypt { key_id, vba, data } => self.decrypt(*key_id, *vba, data),
        }
    }
}

/// The VBA, big-endian, in the upper half of the counter block.
fn iv_for(vba: Vba) -> SkcipherIv {
    let mut iv = [0u8; SkcipherIv::SIZE];
    iv[..8].copy_from_slice(&vba.to_be_bytes());
    SkcipherIv::from_bytes(iv)
}

impl Module for Crypto {
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
                chan.req.payload_mut::<CryptoReq>(),
                CryptoReq::RemoveKey { key_id: 0 },
            );
            let result = self.serve(&mut payload);
            if let Err(err) = &result {
                warn!("[Crypto] request failed: {}", err);
            }
            if let Some(chan) = self.pool.get_mut(idx) {
                *chan.req.payload_mut::<CryptoReq>() = payload;
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
