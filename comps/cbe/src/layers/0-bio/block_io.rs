// SPDX-License-Identifier: MPL-2.0

use super::BlockSet;
use crate::{
    layers::crypto::CryptoReq,
    module::{ChannelPool, ChannelState, Module, ModuleId, ModuleRequest, Origin},
    prelude::*,
    tree::{KeyId, hash_of},
};

/// Requests served by [`BlockIo`].
#[derive(Debug)]
pub enum BlockIoReq {
    /// Reads a block into `data`.
    Read { pba: Pba, data: Block },
    /// Writes `data` to a block.
    Write { pba: Pba, data: Block },
    /// Flushes the device.
    Sync,
    /// Reads the ciphertext of a client block, checks it against `hash` and
    /// decrypts it into `data`.
    ReadClientData {
        pba: Pba,
        vba: Vba,
        key_id: KeyId,
        hash: Hash,
        data: Block,
    },
    /// Encrypts the plaintext in `data`, writes it, and reports the hash of
    /// the ciphertext in `hash`.
    WriteClientData {
        pba: Pba,
        vba: Vba,
        key_id: KeyId,
        data: Block,
        hash: Hash,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum BlockIoState {
    Submitted,
    Decrypting,
    Encrypting,
    Completed,
}

impl ChannelState for BlockIoState {
    fn is_completed(&self) -> bool {
        *self == BlockIoState::Completed
    }
}

/// The block I/O module.
pub struct BlockIo<D> {
    disk: Arc<D>,
    pool: ChannelPool<BlockIoState>,
}

impl<D: BlockSet> BlockIo<D> {
    pub fn new(disk: Arc<D>, nr_of_channels: usize) -> Self {
        Self {
            disk,
            pool: ChannelPool::new(ModuleId::BlockIo, nr_of_channels),
        }
    }

    fn step(&mut self, idx: usize, progress: &mut bool) {
        let Some(chan) = self.pool.get_mut(idx) else {
            return;
        };
        match chan.state {
            BlockIoState::Submitted => {
                *progress = true;
                let disk = &self.disk;
                let outcome = match chan.req.payload_mut::<BlockIoReq>() {
                    BlockIoReq::Read { pba, data } => disk.read(*pba, data).map(|_| None),
                    BlockIoReq::Write { pba, data } => disk.write(*pba, data).map(|_| None),
                    BlockIoReq::Sync => disk.flush().map(|_| None),
                    BlockIoReq::ReadClientData {
                        pba,
                        vba,
                        key_id,
                        hash,
                        data,
                    } => disk.read(*pba, data).and_then(|_| {
                        if hash_of(data) != *hash {
                            error!("[BlockIo] client block {} at pba {} fails its hash", vba, pba);
                            return_errno_with_msg!(HashMismatch, "client data hash mismatch");
                        }
                        Ok(Some(CryptoReq::Decrypt {
                            key_id: *key_id,
                            vba: *vba,
                            data: core::mem::take(data),
                        }))
                    }),
                    BlockIoReq::WriteClientData {
                        vba, key_id, data, ..
                    } => Ok(Some(CryptoReq::Encrypt {
                        key_id: *key_id,
                        vba: *vba,
                        data: core::mem::take(data),
                    })),
                };
                match outcome {
                    Ok(Some(crypto_req)) => {
                        chan.state = if matches!(crypto_req, CryptoReq::Decrypt { .. }) {
                            BlockIoState::Decrypting
                        } else {
                            BlockIoState::Encrypting
                        };
                        chan.generate(crypto_req);
                    }
                    Ok(None) => chan.state = BlockIoState::Completed,
                    Err(err) => {
                        warn!("[BlockIo] request failed: {}", err);
                        chan.fail(err);
                        chan.state = BlockIoState::Completed;
                    }
                }
            }
            BlockIoState::Decrypting | BlockIoState::Encrypting => {
                let Some(prim) = chan.take_completed_prim() else {
                    return;
                };
                *progress = true;
                let (crypto_req, result) = prim.into_parts::<CryptoReq>();
                let plain_or_cipher = match crypto_req {
                    CryptoReq::Decrypt { data, .. } | CryptoReq::Encrypt { data, .. } => data,
                    other => panic!("unexpected crypto completion {:?}", other),
                };
                if let Err(err) = result {
                    chan.fail(err);
                    chan.state = BlockIoState::Completed;
                    return;
                }
                let outcome = match chan.req.payload_mut::<BlockIoReq>() {
                    BlockIoReq::ReadClientData { data, .. } => {
                        *data = plain_or_cipher;
                        Ok(())
                    }
                    BlockIoReq::WriteClientData { pba, hash, data, .. } => {
                        *hash = hash_of(&plain_or_cipher);
                        let res = self.disk.write(*pba, &plain_or_cipher);
                        *data = plain_or_cipher;
                        res
                    }
                    other => panic!("no crypto stage for {:?}", other),
                };
                if let Err(err) = outcome {
                    warn!("[BlockIo] client data write failed: {}", err);
                    chan.fail(err);
                }
                chan.state = BlockIoState::Completed;
            }
            BlockIoState::Completed => {}
        }
    }
}

impl<D: BlockSet> Module for BlockIo<D> {
    fn ready_to_submit_request(&self) -> bool {
        self.pool.has_free_slot()
    }

    fn submit_request(&mut self, req: ModuleRequest) {
        trace!("[BlockIo] submit {:?}", req.payload);
        self.pool.insert(req, BlockIoState::Submitted);
    }

    fn execute(&mut self, progress: &mut bool) {
        for idx in self.pool.occupied() {
            self.step(idx, progress);
        }
    }

    fn peek_completed_request(&self) -> Option<&ModuleRequest> {
        self.pool.peek_completed()
    }

    fn drop_completed_request(&mut self, origin: Origin) -> ModuleRequest {
        self.pool.take_completed(origin)
    }

    fn peek_generated_request(&self) -> Option<&ModuleRequest> {
        self.pool.peek_generated()
    }

    fn drop_generated_request(&mut self, origin: Origin) -> ModuleRequest {
        self.pool.take_generated(origin)
    }

    fn generated_request_complete(&mut self, req: ModuleRequest) {
        self.pool.complete_generated(req);
    }
}
