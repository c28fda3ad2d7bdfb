// SPDX-License-Identifier: MPL-2.0

use std::collections::VecDeque;

use super::superblock::{Key, Superblock, SuperblockState};
use crate::{
    layers::{
        bio::BlockIoReq,
        cache::CacheReq,
        crypto::{CryptoReq, KeyValue},
        free_tree::{AllocCtx, FreeTreeInfo, FreeTreeReq},
        trust_anchor::{TaReq, WrappedKey},
        vbd::VbdReq,
    },
    module::{
        ChannelPool, ChannelState, Module, ModuleId, ModuleRequest, Origin, Payload, TypedPayload,
    },
    prelude::*,
    tree::{
        KeyId, MAX_SUPERBLOCK_INDEX, NR_OF_SUPERBLOCK_SLOTS, Snapshot, TREE_MAX_LEVEL, hash_of,
        tree_capacity,
    },
};

/// Requests served by [`SbCtrl`].
#[derive(Debug)]
pub enum SbCtrlReq {
    /// Loads the newest sealed superblock.
    Initialize { passphrase: String },
    /// Reads `vba` of the current snapshot, or of the kept snapshot with
    /// the given generation.
    ReadVba {
        vba: Vba,
        snapshot_gen: Option<Generation>,
        data: Block,
    },
    WriteVba { vba: Vba, data: Block },
    /// Commits the superblock.
    Sync,
    /// Commits the superblock, pinning the secured snapshot if `keep` is
    /// set. Its generation is returned in `generation`.
    CreateSnapshot { keep: bool, generation: Generation },
    /// Unpins a kept snapshot. It goes away with a later commit.
    DiscardSnapshot { generation: Generation },
    /// Commits, then forgets the keys. The library is unusable afterwards.
    Deinitialize,
    /// Creates a new key and starts moving every block over to it.
    InitializeRekeying,
    /// Rekeys the next VBA.
    RekeyVba,
    InitializeVbdExtension { nr_of_leaves: u64 },
    VbdExtensionStep,
    InitializeFtExtension { nr_of_pbas: u64 },
    FtExtensionStep,
}

impl SbCtrlReq {
    fn is_read(&self) -> bool {
        matches!(self, SbCtrlReq::ReadVba { .. })
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
enum Stage {
    #[default]
    Queued,
    Submitted,
    Vbd,
    // Commit.
    EncryptCurrentKey,
    EncryptPreviousKey,
    SyncCache,
    WriteSb,
    SyncBlkIo,
    SecureSb,
    RemoveKey,
    // Initialization.
    TaInitialize,
    GetLastSbHash,
    ReadSb(u64),
    ReadWinner,
    DecryptCurrentKey,
    AddCurrentKey,
    DecryptPreviousKey,
    AddPreviousKey,
    RecoverFreeTree,
    // Rekeying and extension.
    CreateKey,
    AddNewKey,
    RollbackKey,
    FtExtend,
    Completed,
}

/// What follows a successful commit.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum AfterCommit {
    Done,
    Deinitialize,
    FinishRekeying { previous: KeyId },
}

#[derive(Debug)]
struct Commit {
    staging: Superblock,
    hash: Hash,
    after: AfterCommit,
}

#[derive(Debug, Default)]
struct Scan {
    sealed: Hash,
    best: Option<(u64, Generation)>,
    loaded: Option<Superblock>,
}

#[derive(Debug, Default)]
struct SbState {
    stage: Stage,
    commit: Option<Commit>,
    scan: Scan,
    new_key: Option<Key>,
    /// Keys registered with the crypto module that must go again if the
    /// request fails.
    rollback_keys: Vec<KeyId>,
    keys_to_remove: Vec<KeyId>,
    error: Option<Error>,
}

impl ChannelState for SbState {
    fn is_completed(&self) -> bool {
        self.stage == Stage::Completed
    }
}

fn into_payload<P: TypedPayload>(done: Option<Payload>) -> P {
    match done.and_then(P::take) {
        Some(payload) => payload,
        None => panic!("[SbCtrl] completion does not match the stage"),
    }
}

/// The superblock and the counters around it.
#[derive(Debug)]
struct Core {
    sb: Option<Superblock>,
    curr_gen: Generation,
    /// The ring slot the next commit writes to.
    sb_idx: u64,
    ft_extension_step: u64,
}

impl Core {
    fn sb(&self) -> Result<&Superblock> {
        match &self.sb {
            Some(sb) if sb.state != SuperblockState::Invalid => Ok(sb),
            _ => return_errno_with_msg!(NotInitialized, "superblock control not initialized"),
        }
    }

    fn sb_mut(&mut self) -> Result<&mut Superblock> {
        match &mut self.sb {
            Some(sb) if sb.state != SuperblockState::Invalid => Ok(sb),
            _ => return_errno_with_msg!(NotInitialized, "superblock control not initialized"),
        }
    }

    fn alloc_ctx(&self, sb: &Superblock) -> AllocCtx {
        AllocCtx {
            curr_gen: self.curr_gen,
            last_secured_gen: sb.last_secured_generation,
            snapshot_gens: sb.snapshot_generations(),
        }
    }

    fn advance(
        &mut self,
        st: &mut SbState,
        req: &mut SbCtrlReq,
        done: Option<Payload>,
    ) -> Result<Option<Payload>> {
        match st.stage {
            Stage::Queued | Stage::Completed => {
                unreachable!("[SbCtrl] {:?} requests are not advanced", st.stage)
            }
            Stage::Submitted => self.start(st, req),
            Stage::Vbd => self.vbd_done(st, req, into_payload(done)),

            Stage::EncryptCurrentKey => {
                let TaReq::EncryptKey { wrapped, .. } = into_payload::<TaReq>(done) else {
                    panic!("[SbCtrl] expected a wrapped key");
                };
                let commit = Self::commit_of(st);
                commit.staging.current_key.wrapped = wrapped;
                if let Some(previous) = &commit.staging.previous_key {
                    let value = previous.value;
                    st.stage = Stage::EncryptPreviousKey;
                    return Ok(Some(encrypt_key(value)));
                }
                st.stage = Stage::SyncCache;
                Ok(Some(CacheReq::Sync.into()))
            }
            Stage::EncryptPreviousKey => {
                let TaReq::EncryptKey { wrapped, .. } = into_payload::<TaReq>(done) else {
                    panic!("[SbCtrl] expected a wrapped key");
                };
                if let Some(previous) = Self::commit_of(st).staging.previous_key.as_mut() {
                    previous.wrapped = wrapped;
                }
                st.stage = Stage::SyncCache;
                Ok(Some(CacheReq::Sync.into()))
            }
            Stage::SyncCache => {
                let sb_idx = self.sb_idx;
                let commit = Self::commit_of(st);
                let block = commit.staging.encode()?;
                commit.hash = hash_of(&block);
                st.stage = Stage::WriteSb;
                Ok(Some(
                    BlockIoReq::Write {
                        pba: sb_idx,
                        data: block,
                    }
                    .into(),
                ))
            }
            Stage::WriteSb => {
                st.stage = Stage::SyncBlkIo;
                Ok(Some(BlockIoReq::Sync.into()))
            }
            Stage::SyncBlkIo => {
                let hash = Self::commit_of(st).hash;
                st.stage = Stage::SecureSb;
                Ok(Some(TaReq::SecureSuperblock { hash }.into()))
            }
            Stage::SecureSb => self.committed(st, req),
            Stage::RemoveKey => self.remove_next_key(st),

            Stage::TaInitialize => {
                st.stage = Stage::GetLastSbHash;
                Ok(Some(
                    TaReq::GetLastSbHash {
                        hash: Hash::default(),
                    }
                    .into(),
                ))
            }
            Stage::GetLastSbHash => {
                let TaReq::GetLastSbHash { hash } = into_payload::<TaReq>(done) else {
                    panic!("[SbCtrl] expected the sealed hash");
                };
                st.scan.sealed = hash;
                Ok(Some(Self::read_slot(st, 0)))
            }
            Stage::ReadSb(slot) => {
                let BlockIoReq::Read { data, .. } = into_payload::<BlockIoReq>(done) else {
                    panic!("[SbCtrl] expected a superblock read");
                };
                if hash_of(&data) == st.scan.sealed {
                    match Superblock::decode(&data) {
                        Ok(sb) => {
                            let generation = sb.last_secured_generation;
                            debug!("[SbCtrl] slot {} sealed, generation {}", slot, generation);
                            if st.scan.best.is_none_or(|(_, best)| generation > best) {
                                st.scan.best = Some((slot, generation));
                            }
                        }
                        Err(_) => warn!("[SbCtrl] slot {} sealed but undecodable", slot),
                    }
                }
                if slot < MAX_SUPERBLOCK_INDEX {
                    return Ok(Some(Self::read_slot(st, slot + 1)));
                }
                let Some((winner, _)) = st.scan.best else {
                    error!("[SbCtrl] no superblock slot matches the sealed hash");
                    return_errno!(NoValidSuperblock);
                };
                st.stage = Stage::ReadWinner;
                Ok(Some(
                    BlockIoReq::Read {
                        pba: winner,
                        data: Block::zeroed(),
                    }
                    .into(),
                ))
            }
            Stage::ReadWinner => {
                let BlockIoReq::Read { data, .. } = into_payload::<BlockIoReq>(done) else {
                    panic!("[SbCtrl] expected a superblock read");
                };
                if hash_of(&data) != st.scan.sealed {
                    return_errno_with_msg!(NoValidSuperblock, "superblock slot changed under us");
                }
                let loaded = Superblock::decode(&data)?;
                let wrapped = loaded.current_key.wrapped;
                st.scan.loaded = Some(loaded);
                st.stage = Stage::DecryptCurrentKey;
                Ok(Some(decrypt_key(wrapped)))
            }
            Stage::DecryptCurrentKey => {
                let TaReq::DecryptKey { value, .. } = into_payload::<TaReq>(done) else {
                    panic!("[SbCtrl] expected an unwrapped key");
                };
                let loaded = Self::loaded_of(st);
                loaded.current_key.value = value;
                let key_id = loaded.current_key.id;
                st.stage = Stage::AddCurrentKey;
                Ok(Some(CryptoReq::AddKey { key_id, value }.into()))
            }
            Stage::AddCurrentKey => {
                let loaded = Self::loaded_of(st);
                let current = loaded.current_key.id;
                let previous = loaded.previous_key.map(|key| key.wrapped);
                st.rollback_keys.push(current);
                if let Some(wrapped) = previous {
                    st.stage = Stage::DecryptPreviousKey;
                    return Ok(Some(decrypt_key(wrapped)));
                }
                Ok(Some(Self::recover_free_tree(st)))
            }
            Stage::DecryptPreviousKey => {
                let TaReq::DecryptKey { value, .. } = into_payload::<TaReq>(done) else {
                    panic!("[SbCtrl] expected an unwrapped key");
                };
                let Some(previous) = Self::loaded_of(st).previous_key.as_mut() else {
                    unreachable!("previous key checked before");
                };
                previous.value = value;
                let key_id = previous.id;
                st.stage = Stage::AddPreviousKey;
                Ok(Some(CryptoReq::AddKey { key_id, value }.into()))
            }
            Stage::AddPreviousKey => {
                let previous = Self::loaded_of(st).previous_key.map(|key| key.id);
                st.rollback_keys.extend(previous);
                Ok(Some(Self::recover_free_tree(st)))
            }
            Stage::RecoverFreeTree => self.initialized(st),

            Stage::CreateKey => {
                let TaReq::CreateKey { value } = into_payload::<TaReq>(done) else {
                    panic!("[SbCtrl] expected a new key");
                };
                let sb = self.sb()?;
                let key = Key {
                    id: sb.current_key.id.wrapping_add(1),
                    value,
                    wrapped: WrappedKey::default(),
                };
                st.new_key = Some(key);
                st.stage = Stage::AddNewKey;
                Ok(Some(
                    CryptoReq::AddKey {
                        key_id: key.id,
                        value,
                    }
                    .into(),
                ))
            }
            Stage::AddNewKey => {
                let Some(new_key) = st.new_key.take() else {
                    unreachable!("new key created before");
                };
                st.rollback_keys.push(new_key.id);
                let mut staging = self.sb()?.clone();
                info!(
                    "[SbCtrl] start rekeying from key {} to key {}",
                    staging.current_key.id, new_key.id
                );
                staging.previous_key = Some(staging.current_key);
                staging.current_key = new_key;
                staging.state = SuperblockState::Rekeying;
                staging.rekeying_vba = 0;
                self.begin_commit(st, staging, false, AfterCommit::Done)
            }
            Stage::RollbackKey => {
                if let Some(key_id) = st.rollback_keys.pop() {
                    return Ok(Some(CryptoReq::RemoveKey { key_id }.into()));
                }
                Err(st.error.take().unwrap_or(Error::new(InvalidState)))
            }
            Stage::FtExtend => {
                let FreeTreeReq::Extend { info, .. } = into_payload::<FreeTreeReq>(done) else {
                    panic!("[SbCtrl] expected a free-tree extension");
                };
                let sb = self.sb_mut()?;
                sb.free_tree = info;
                if info.nr_of_pbas < sb.extension_target {
                    return Ok(None);
                }
                self.finish_extension(st)
            }
        }
    }

    fn start(&mut self, st: &mut SbState, req: &mut SbCtrlReq) -> Result<Option<Payload>> {
        if let SbCtrlReq::Initialize { passphrase } = req {
            if self.sb().is_ok() {
                return_errno_with_msg!(InvalidState, "already initialized");
            }
            st.stage = Stage::TaInitialize;
            return Ok(Some(
                TaReq::Initialize {
                    passphrase: passphrase.clone(),
                }
                .into(),
            ));
        }

        let sb = self.sb()?;
        match req {
            SbCtrlReq::Initialize { .. } => unreachable!("handled above"),
            SbCtrlReq::ReadVba {
                vba, snapshot_gen, ..
            } => {
                let snapshot = match snapshot_gen {
                    None => sb.current_snapshot(),
                    Some(generation) => sb
                        .readable_snapshot(*generation)
                        .ok_or(Error::with_msg(NotFound, "no such kept snapshot"))?,
                };
                if !snapshot.contains(*vba) {
                    return_errno_with_msg!(InvalidArgs, "vba beyond the snapshot");
                }
                st.stage = Stage::Vbd;
                Ok(Some(
                    VbdReq::ReadVba {
                        vba: *vba,
                        snapshot: *snapshot,
                        key_id: sb.key_id_for(*vba),
                        degree: sb.degree,
                        data: Block::zeroed(),
                    }
                    .into(),
                ))
            }
            SbCtrlReq::WriteVba { vba, data } => {
                if !sb.current_snapshot().contains(*vba) {
                    return_errno_with_msg!(InvalidArgs, "vba beyond the device");
                }
                st.stage = Stage::Vbd;
                Ok(Some(
                    VbdReq::WriteVba {
                        vba: *vba,
                        key_id: sb.key_id_for(*vba),
                        data: data.clone(),
                        snapshot: *sb.current_snapshot(),
                        degree: sb.degree,
                        ctx: self.alloc_ctx(sb),
                    }
                    .into(),
                ))
            }
            SbCtrlReq::Sync => {
                let staging = sb.clone();
                self.begin_commit(st, staging, false, AfterCommit::Done)
            }
            SbCtrlReq::CreateSnapshot { keep, .. } => {
                let (staging, keep) = (sb.clone(), *keep);
                self.begin_commit(st, staging, keep, AfterCommit::Done)
            }
            SbCtrlReq::DiscardSnapshot { generation } => {
                let generation = *generation;
                let sb = self.sb_mut()?;
                let curr_snap = sb.curr_snap;
                let Some(snapshot) = sb
                    .snapshots
                    .iter_mut()
                    .enumerate()
                    .find(|(idx, snapshot)| {
                        *idx != curr_snap
                            && snapshot.valid
                            && snapshot.keep
                            && snapshot.generation == generation
                    })
                    .map(|(_, snapshot)| snapshot)
                else {
                    return_errno_with_msg!(NotFound, "no such kept snapshot");
                };
                snapshot.keep = false;
                debug!("[SbCtrl] unpin snapshot of generation {}", generation);
                Ok(None)
            }
            SbCtrlReq::Deinitialize => {
                let staging = sb.clone();
                self.begin_commit(st, staging, false, AfterCommit::Deinitialize)
            }
            SbCtrlReq::InitializeRekeying => {
                if sb.state != SuperblockState::Normal {
                    return_errno_with_msg!(InvalidState, "another operation is in progress");
                }
                st.stage = Stage::CreateKey;
                Ok(Some(
                    TaReq::CreateKey {
                        value: KeyValue::default(),
                    }
                    .into(),
                ))
            }
            SbCtrlReq::RekeyVba => {
                if sb.state != SuperblockState::Rekeying {
                    return Ok(None);
                }
                let Some(previous) = sb.previous_key else {
                    return_errno_with_msg!(InvalidState, "rekeying without a previous key");
                };
                if sb.rekeying_vba >= sb.current_snapshot().nr_of_leaves {
                    return self.finish_rekeying(st);
                }
                st.stage = Stage::Vbd;
                Ok(Some(
                    VbdReq::RekeyVba {
                        vba: sb.rekeying_vba,
                        old_key_id: previous.id,
                        new_key_id: sb.current_key.id,
                        snapshots: sb.snapshots.clone(),
                        curr_snap: sb.curr_snap,
                        degree: sb.degree,
                        ctx: self.alloc_ctx(sb),
                    }
                    .into(),
                ))
            }
            SbCtrlReq::InitializeVbdExtension { nr_of_leaves } => {
                if sb.state != SuperblockState::Normal {
                    return_errno_with_msg!(InvalidState, "another operation is in progress");
                }
                let target = sb.current_snapshot().nr_of_leaves.saturating_add(*nr_of_leaves);
                if *nr_of_leaves == 0 || target > tree_capacity(sb.degree, TREE_MAX_LEVEL) {
                    return_errno_with_msg!(InvalidArgs, "invalid number of leaves to add");
                }
                let mut staging = sb.clone();
                staging.state = SuperblockState::ExtendingVbd;
                staging.extension_target = target;
                info!("[SbCtrl] start extending the VBD to {} leaves", target);
                self.begin_commit(st, staging, false, AfterCommit::Done)
            }
            SbCtrlReq::VbdExtensionStep => {
                if sb.state != SuperblockState::ExtendingVbd {
                    return Ok(None);
                }
                let snapshot = *sb.current_snapshot();
                if snapshot.nr_of_leaves >= sb.extension_target {
                    return self.finish_extension(st);
                }
                st.stage = Stage::Vbd;
                Ok(Some(
                    VbdReq::ExtensionStep {
                        target_nr_of_leaves: sb.extension_target,
                        snapshot,
                        degree: sb.degree,
                        ctx: self.alloc_ctx(sb),
                    }
                    .into(),
                ))
            }
            SbCtrlReq::InitializeFtExtension { nr_of_pbas } => {
                if sb.state != SuperblockState::Normal {
                    return_errno_with_msg!(InvalidState, "another operation is in progress");
                }
                if *nr_of_pbas == 0 {
                    return_errno_with_msg!(InvalidArgs, "invalid number of blocks to add");
                }
                let mut staging = sb.clone();
                staging.state = SuperblockState::ExtendingFt;
                staging.extension_target = sb.free_tree.nr_of_pbas.saturating_add(*nr_of_pbas);
                info!(
                    "[SbCtrl] start extending the free tree to {} blocks",
                    staging.extension_target
                );
                self.begin_commit(st, staging, false, AfterCommit::Done)
            }
            SbCtrlReq::FtExtensionStep => {
                if sb.state != SuperblockState::ExtendingFt {
                    return Ok(None);
                }
                let remaining = sb.extension_target.saturating_sub(sb.free_tree.nr_of_pbas);
                if remaining == 0 {
                    return self.finish_extension(st);
                }
                st.stage = Stage::FtExtend;
                Ok(Some(
                    FreeTreeReq::Extend {
                        nr_of_pbas: remaining.min(self.ft_extension_step.max(1)),
                        info: FreeTreeInfo::default(),
                    }
                    .into(),
                ))
            }
        }
    }

    fn vbd_done(
        &mut self,
        st: &mut SbState,
        req: &mut SbCtrlReq,
        vbd_req: VbdReq,
    ) -> Result<Option<Payload>> {
        let sb = self.sb_mut()?;
        match (req, vbd_req) {
            (SbCtrlReq::ReadVba { data, .. }, VbdReq::ReadVba { data: read, .. }) => {
                *data = read;
                Ok(None)
            }
            (SbCtrlReq::WriteVba { .. }, VbdReq::WriteVba { snapshot, .. }) => {
                *sb.current_snapshot_mut() = snapshot;
                Ok(None)
            }
            (SbCtrlReq::RekeyVba, VbdReq::RekeyVba { vba, snapshots, .. }) => {
                sb.snapshots = snapshots;
                sb.rekeying_vba = vba + 1;
                trace!("[SbCtrl] rekeyed vba {}", vba);
                if sb.rekeying_vba < sb.current_snapshot().nr_of_leaves {
                    return Ok(None);
                }
                self.finish_rekeying(st)
            }
            (SbCtrlReq::VbdExtensionStep, VbdReq::ExtensionStep { snapshot, .. }) => {
                *sb.current_snapshot_mut() = snapshot;
                if snapshot.nr_of_leaves < sb.extension_target {
                    return Ok(None);
                }
                self.finish_extension(st)
            }
            (req, vbd_req) => panic!("[SbCtrl] {:?} completed as {:?}", req, vbd_req),
        }
    }

    fn finish_rekeying(&mut self, st: &mut SbState) -> Result<Option<Payload>> {
        let mut staging = self.sb()?.clone();
        let Some(previous) = staging.previous_key.take() else {
            return_errno_with_msg!(InvalidState, "rekeying without a previous key");
        };
        staging.state = SuperblockState::Normal;
        staging.rekeying_vba = 0;
        info!(
            "[SbCtrl] rekeying to key {} finished",
            staging.current_key.id
        );
        self.begin_commit(
            st,
            staging,
            false,
            AfterCommit::FinishRekeying {
                previous: previous.id,
            },
        )
    }

    fn finish_extension(&mut self, st: &mut SbState) -> Result<Option<Payload>> {
        let mut staging = self.sb()?.clone();
        info!("[SbCtrl] {:?} finished", staging.state);
        staging.state = SuperblockState::Normal;
        staging.extension_target = 0;
        self.begin_commit(st, staging, false, AfterCommit::Done)
    }

    /// Prepares `staging` for the commit and issues the first step.
    ///
    /// Nothing of `staging` reaches the live superblock unless the trust
    /// anchor seals it.
    fn begin_commit(
        &mut self,
        st: &mut SbState,
        mut staging: Superblock,
        keep: bool,
        after: AfterCommit,
    ) -> Result<Option<Payload>> {
        staging.discard_disposable_snapshots(self.curr_gen);
        let curr_gen = self.curr_gen;
        let current = staging.current_snapshot_mut();
        current.generation = curr_gen;
        current.keep |= keep;
        staging.last_secured_generation = curr_gen;
        if staging.free_snapshot_slot().is_none() {
            warn!("[SbCtrl] every snapshot slot is taken by a kept snapshot");
            return_errno!(NoFreeSnapshotSlot);
        }
        let value = staging.current_key.value;
        st.commit = Some(Commit {
            staging,
            hash: Hash::default(),
            after,
        });
        st.stage = Stage::EncryptCurrentKey;
        Ok(Some(encrypt_key(value)))
    }

    fn committed(&mut self, st: &mut SbState, req: &mut SbCtrlReq) -> Result<Option<Payload>> {
        let Some(Commit { staging, after, .. }) = st.commit.take() else {
            unreachable!("commit prepared before");
        };
        let secured_gen = self.curr_gen;
        info!(
            "[SbCtrl] generation {} secured in slot {}",
            secured_gen, self.sb_idx
        );
        let mut sb = staging;
        self.curr_gen += 1;
        self.sb_idx = (self.sb_idx + 1) % NR_OF_SUPERBLOCK_SLOTS;
        open_current_snapshot(&mut sb, self.curr_gen)?;
        let key_ids = (sb.current_key.id, sb.previous_key.map(|key| key.id));
        self.sb = Some(sb);
        st.rollback_keys.clear();
        if let SbCtrlReq::CreateSnapshot { generation, .. } = req {
            *generation = secured_gen;
        }

        match after {
            AfterCommit::Done => Ok(None),
            AfterCommit::Deinitialize => {
                if let Some(sb) = self.sb.as_mut() {
                    sb.state = SuperblockState::Invalid;
                }
                info!("[SbCtrl] deinitialized at generation {}", secured_gen);
                st.keys_to_remove = core::iter::once(key_ids.0).chain(key_ids.1).collect();
                self.remove_next_key(st)
            }
            AfterCommit::FinishRekeying { previous } => {
                st.keys_to_remove = vec![previous];
                self.remove_next_key(st)
            }
        }
    }

    fn remove_next_key(&mut self, st: &mut SbState) -> Result<Option<Payload>> {
        let Some(key_id) = st.keys_to_remove.pop() else {
            return Ok(None);
        };
        st.stage = Stage::RemoveKey;
        Ok(Some(CryptoReq::RemoveKey { key_id }.into()))
    }

    fn read_slot(st: &mut SbState, slot: u64) -> Payload {
        st.stage = Stage::ReadSb(slot);
        BlockIoReq::Read {
            pba: slot,
            data: Block::zeroed(),
        }
        .into()
    }

    fn recover_free_tree(st: &mut SbState) -> Payload {
        let loaded = Self::loaded_of(st);
        let req = FreeTreeReq::Recover {
            info: loaded.free_tree,
            snapshots: loaded.snapshots.clone(),
            degree: loaded.degree,
        };
        st.stage = Stage::RecoverFreeTree;
        req.into()
    }

    fn initialized(&mut self, st: &mut SbState) -> Result<Option<Payload>> {
        let Some(mut sb) = st.scan.loaded.take() else {
            unreachable!("superblock loaded before");
        };
        let Some((winner, _)) = st.scan.best else {
            unreachable!("winning slot chosen before");
        };
        self.curr_gen = sb.last_secured_generation + 1;
        self.sb_idx = (winner + 1) % NR_OF_SUPERBLOCK_SLOTS;
        open_current_snapshot(&mut sb, self.curr_gen)?;
        info!(
            "[SbCtrl] initialized from slot {}: generation {}, {:?}",
            winner, sb.last_secured_generation, sb.state
        );
        self.sb = Some(sb);
        st.rollback_keys.clear();
        Ok(None)
    }

    /// Turns a failure into the request's outcome, undoing what must not
    /// outlive the request.
    fn recover_from(
        &mut self,
        st: &mut SbState,
        req: &SbCtrlReq,
        err: Error,
    ) -> Result<Option<Payload>> {
        if st.stage == Stage::RollbackKey {
            return Err(st.error.take().unwrap_or(err));
        }
        warn!("[SbCtrl] {:?} failed in {:?}: {}", req, st.stage, err);
        st.commit = None;
        if let Some(key_id) = st.rollback_keys.pop() {
            st.error = Some(err);
            st.stage = Stage::RollbackKey;
            return Ok(Some(CryptoReq::RemoveKey { key_id }.into()));
        }
        let extending = matches!(
            req,
            SbCtrlReq::VbdExtensionStep | SbCtrlReq::FtExtensionStep
        );
        if let Some(sb) = self.sb.as_mut().filter(|_| extending) {
            if matches!(
                sb.state,
                SuperblockState::ExtendingVbd | SuperblockState::ExtendingFt
            ) {
                warn!("[SbCtrl] abort {:?}", sb.state);
                sb.state = SuperblockState::Normal;
                sb.extension_target = 0;
            }
        }
        Err(err)
    }

    fn commit_of(st: &mut SbState) -> &mut Commit {
        match st.commit.as_mut() {
            Some(commit) => commit,
            None => unreachable!("commit prepared before"),
        }
    }

    fn loaded_of(st: &mut SbState) -> &mut Superblock {
        match st.scan.loaded.as_mut() {
            Some(loaded) => loaded,
            None => unreachable!("superblock loaded before"),
        }
    }
}

/// Copies the secured snapshot into a free slot, where it becomes the
/// snapshot that receives new writes.
fn open_current_snapshot(sb: &mut Superblock, curr_gen: Generation) -> Result<()> {
    let Some(slot) = sb.free_snapshot_slot() else {
        return_errno!(NoFreeSnapshotSlot);
    };
    let secured = *sb.current_snapshot();
    sb.snapshots[slot] = Snapshot {
        generation: curr_gen,
        keep: false,
        ..secured
    };
    sb.curr_snap = slot;
    Ok(())
}

fn encrypt_key(value: KeyValue) -> Payload {
    TaReq::EncryptKey {
        value,
        wrapped: WrappedKey::default(),
    }
    .into()
}

fn decrypt_key(wrapped: WrappedKey) -> Payload {
    TaReq::DecryptKey {
        wrapped,
        value: KeyValue::default(),
    }
    .into()
}

/// The superblock control module.
///
/// Requests start in submission order. Reads may run alongside each other,
/// every other request runs alone.
pub struct SbCtrl {
    core: Core,
    pool: ChannelPool<SbState>,
    queue: VecDeque<usize>,
}

impl SbCtrl {
    pub fn new(nr_of_channels: usize, ft_extension_step: u64) -> Self {
        Self {
            core: Core {
                sb: None,
                curr_gen: 0,
                sb_idx: 0,
                ft_extension_step,
            },
            pool: ChannelPool::new(ModuleId::SbCtrl, nr_of_channels),
            queue: VecDeque::new(),
        }
    }

    /// Returns the live superblock, if the module is initialized.
    pub fn superblock(&self) -> Option<&Superblock> {
        self.core.sb().ok()
    }

    /// Returns the generation the current snapshot is written in.
    pub fn curr_gen(&self) -> Generation {
        self.core.curr_gen
    }

    /// Returns the ring slot the next commit goes to.
    #[cfg(test)]
    pub fn sb_idx(&self) -> u64 {
        self.core.sb_idx
    }

    fn start_queued(&mut self, progress: &mut bool) {
        while let Some(&idx) = self.queue.front() {
            let Some(chan) = self.pool.get(idx) else {
                self.queue.pop_front();
                continue;
            };
            let is_read = chan.req.payload::<SbCtrlReq>().is_read();
            let can_start = {
                let mut active = self
                    .pool
                    .iter()
                    .filter(|chan| !matches!(chan.state.stage, Stage::Queued | Stage::Completed));
                if is_read {
                    active.all(|chan| chan.req.payload::<SbCtrlReq>().is_read())
                } else {
                    active.next().is_none()
                }
            };
            if !can_start {
                return;
            }
            self.queue.pop_front();
            if let Some(chan) = self.pool.get_mut(idx) {
                chan.state.stage = Stage::Submitted;
                *progress = true;
            }
        }
    }

    fn step(&mut self, idx: usize, progress: &mut bool) {
        let Self { core, pool, .. } = self;
        let Some(chan) = pool.get_mut(idx) else {
            return;
        };
        let done = match chan.state.stage {
            Stage::Queued | Stage::Completed => return,
            Stage::Submitted => None,
            _ => match chan.take_completed_prim() {
                Some(prim) => Some(prim),
                None => return,
            },
        };
        *progress = true;
        let req = chan.req.payload_mut::<SbCtrlReq>();
        let outcome = match done {
            Some(ModuleRequest {
                result: Err(err), ..
            }) => Err(err),
            Some(prim) => core.advance(&mut chan.state, req, Some(prim.payload)),
            None => core.advance(&mut chan.state, req, None),
        };
        let outcome = match outcome {
            Err(err) => core.recover_from(&mut chan.state, req, err),
            ok => ok,
        };
        match outcome {
            Ok(Some(payload)) => chan.generate(payload),
            Ok(None) => {
                trace!("[SbCtrl] channel {} completed", idx);
                chan.state.stage = Stage::Completed;
            }
            Err(err) => {
                chan.fail(err);
                chan.state.stage = Stage::Completed;
            }
        }
    }
}

impl Module for SbCtrl {
    fn ready_to_submit_request(&self) -> bool {
        self.pool.has_free_slot()
    }

    fn submit_request(&mut self, req: ModuleRequest) {
        let idx = self.pool.insert(req, SbState::default());
        self.queue.push_back(idx);
    }

    fn execute(&mut self, progress: &mut bool) {
        self.start_queued(progress);
        for idx in self.pool.occupied() {
            self.step(idx, progress);
        }
        // A finished request may unblock the next ones.
        self.start_queued(progress);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::INVALID_GENERATION;

    const TAG: Origin = Origin::Client(1);

    fn superblock(last_secured: Generation) -> Superblock {
        let root = Snapshot {
            pba: 8,
            generation: last_secured,
            root_generation: INVALID_GENERATION,
            hash: Hash::default(),
            max_level: 1,
            nr_of_leaves: 64,
            valid: true,
            keep: false,
        };
        let key = Key {
            id: 1,
            ..Key::default()
        };
        let free_tree = FreeTreeInfo {
            first_pba: 9,
            nr_of_pbas: 100,
        };
        let mut sb = Superblock::new(key, root, 64, free_tree);
        sb.last_secured_generation = last_secured;
        sb
    }

    fn execute(sb_ctrl: &mut SbCtrl) {
        let mut progress = false;
        sb_ctrl.execute(&mut progress);
    }

    /// Takes the pending sub-request, lets `serve` answer it and hands the
    /// completion back.
    fn serve(sb_ctrl: &mut SbCtrl, serve: impl FnOnce(&mut Payload) -> Result<()>) {
        let origin = sb_ctrl.peek_generated_request().unwrap().origin;
        let mut req = sb_ctrl.drop_generated_request(origin);
        req.result = serve(&mut req.payload);
        sb_ctrl.generated_request_complete(req);
        execute(sb_ctrl);
    }

    fn serve_ok(sb_ctrl: &mut SbCtrl) {
        serve(sb_ctrl, |_| Ok(()));
    }

    fn sealed(sb: &Superblock) -> Hash {
        hash_of(&sb.encode().unwrap())
    }

    fn initialize(sb_ctrl: &mut SbCtrl, slots: &[Option<Superblock>], sealed: Hash) {
        let blocks: Vec<Block> = slots
            .iter()
            .map(|slot| match slot {
                Some(sb) => sb.encode().unwrap(),
                None => Block::filled(0xff),
            })
            .collect();

        sb_ctrl.submit_request(ModuleRequest::new(
            TAG,
            SbCtrlReq::Initialize {
                passphrase: "secret".to_string(),
            },
        ));
        execute(sb_ctrl);
        serve_ok(sb_ctrl);
        serve(sb_ctrl, |payload| {
            let Payload::TrustAnchor(TaReq::GetLastSbHash { hash }) = payload else {
                panic!("expected the sealed hash lookup");
            };
            *hash = sealed;
            Ok(())
        });
        while matches!(
            sb_ctrl.peek_generated_request().map(|req| &req.payload),
            Some(Payload::BlockIo(_))
        ) {
            serve(sb_ctrl, |payload| {
                let Payload::BlockIo(BlockIoReq::Read { pba, data }) = payload else {
                    panic!("expected a superblock read");
                };
                *data = blocks[*pba as usize].clone();
                Ok(())
            });
        }
        while sb_ctrl.peek_generated_request().is_some() {
            serve_ok(sb_ctrl);
        }
    }

    fn ring(slots: &[(usize, Generation)]) -> Vec<Option<Superblock>> {
        let mut ring = vec![None; NR_OF_SUPERBLOCK_SLOTS as usize];
        for &(slot, generation) in slots {
            ring[slot] = Some(superblock(generation));
        }
        ring
    }

    fn initialized() -> SbCtrl {
        let mut sb_ctrl = SbCtrl::new(2, 16);
        initialize(&mut sb_ctrl, &ring(&[(0, 4)]), sealed(&superblock(4)));
        sb_ctrl.drop_completed_request(TAG).result.unwrap();
        sb_ctrl
    }

    fn submit(sb_ctrl: &mut SbCtrl, req: SbCtrlReq) {
        sb_ctrl.submit_request(ModuleRequest::new(TAG, req));
        execute(sb_ctrl);
    }

    #[test]
    fn requests_before_initialization_fail() {
        let mut sb_ctrl = SbCtrl::new(1, 16);
        submit(&mut sb_ctrl, SbCtrlReq::Sync);
        let req = sb_ctrl.drop_completed_request(TAG);
        assert_eq!(req.result.unwrap_err().errno(), NotInitialized);
    }

    #[test]
    fn initialization_picks_the_sealed_slot() {
        let mut sb_ctrl = SbCtrl::new(1, 16);
        initialize(
            &mut sb_ctrl,
            &ring(&[(2, 5), (3, 6)]),
            sealed(&superblock(6)),
        );
        sb_ctrl.drop_completed_request(TAG).result.unwrap();

        let sb = sb_ctrl.superblock().unwrap();
        assert_eq!(sb.last_secured_generation, 6);
        assert_eq!(sb_ctrl.curr_gen(), 7);
        assert_eq!(sb_ctrl.sb_idx(), 4);
        assert_eq!(sb.current_snapshot().generation, 7);
        assert_ne!(sb.curr_snap, 0);
    }

    #[test]
    fn initialization_without_sealed_slot_fails() {
        let mut sb_ctrl = SbCtrl::new(1, 16);
        initialize(&mut sb_ctrl, &ring(&[(1, 3)]), sealed(&superblock(9)));
        let req = sb_ctrl.drop_completed_request(TAG);
        assert_eq!(req.result.unwrap_err().errno(), NoValidSuperblock);
        assert!(sb_ctrl.superblock().is_none());
    }

    #[test]
    fn initialization_resumes_rekeying_at_the_sealed_vba() {
        let mut sb = superblock(4);
        sb.previous_key = Some(sb.current_key);
        sb.current_key.id = 2;
        sb.state = SuperblockState::Rekeying;
        sb.rekeying_vba = 17;
        let mut slots = ring(&[]);
        slots[0] = Some(sb.clone());

        let mut sb_ctrl = SbCtrl::new(1, 16);
        initialize(&mut sb_ctrl, &slots, sealed(&sb));
        sb_ctrl.drop_completed_request(TAG).result.unwrap();

        let loaded = sb_ctrl.superblock().unwrap();
        assert_eq!(loaded.state, SuperblockState::Rekeying);
        assert_eq!(loaded.rekeying_vba, 17);
        assert_eq!(loaded.previous_key.map(|key| key.id), Some(1));
        assert_eq!(loaded.current_key.id, 2);
    }

    #[test]
    fn failed_commit_keeps_the_generation() {
        let mut sb_ctrl = initialized();
        let (curr_gen, sb_idx) = (sb_ctrl.curr_gen(), sb_ctrl.sb_idx());

        submit(&mut sb_ctrl, SbCtrlReq::Sync);
        serve_ok(&mut sb_ctrl);
        serve_ok(&mut sb_ctrl);
        serve(&mut sb_ctrl, |_| Err(Error::new(IoFailed)));

        let req = sb_ctrl.drop_completed_request(TAG);
        assert_eq!(req.result.unwrap_err().errno(), IoFailed);
        assert_eq!(sb_ctrl.curr_gen(), curr_gen);
        assert_eq!(sb_ctrl.sb_idx(), sb_idx);
        assert_eq!(sb_ctrl.superblock().unwrap().last_secured_generation, 4);
    }

    #[test]
    fn commit_advances_generation_and_ring() {
        let mut sb_ctrl = initialized();
        submit(&mut sb_ctrl, SbCtrlReq::CreateSnapshot {
            keep: true,
            generation: 0,
        });
        while sb_ctrl.peek_generated_request().is_some() {
            serve_ok(&mut sb_ctrl);
        }
        let (req, result) = sb_ctrl.drop_completed_request(TAG).into_parts::<SbCtrlReq>();
        result.unwrap();
        let SbCtrlReq::CreateSnapshot { generation, .. } = req else {
            panic!("unexpected request");
        };
        assert_eq!(generation, 5);
        assert_eq!(sb_ctrl.curr_gen(), 6);
        assert_eq!(sb_ctrl.sb_idx(), 2);

        let sb = sb_ctrl.superblock().unwrap();
        assert_eq!(sb.last_secured_generation, 5);
        assert!(sb.readable_snapshot(5).unwrap().keep);
    }

    #[test]
    fn failed_rekeying_start_removes_the_new_key() {
        let mut sb_ctrl = initialized();
        submit(&mut sb_ctrl, SbCtrlReq::InitializeRekeying);
        serve_ok(&mut sb_ctrl);
        serve(&mut sb_ctrl, |payload| {
            let Payload::Crypto(CryptoReq::AddKey { key_id, .. }) = payload else {
                panic!("expected the new key");
            };
            assert_eq!(*key_id, 2);
            Ok(())
        });
        serve(&mut sb_ctrl, |_| Err(Error::new(MacMismatched)));
        serve(&mut sb_ctrl, |payload| {
            let Payload::Crypto(CryptoReq::RemoveKey { key_id }) = payload else {
                panic!("expected the new key to go");
            };
            assert_eq!(*key_id, 2);
            Ok(())
        });

        let req = sb_ctrl.drop_completed_request(TAG);
        assert_eq!(req.result.unwrap_err().errno(), MacMismatched);
        let sb = sb_ctrl.superblock().unwrap();
        assert_eq!(sb.state, SuperblockState::Normal);
        assert_eq!(sb.current_key.id, 1);
    }

    #[test]
    fn steps_without_matching_state_are_no_ops() {
        let mut sb_ctrl = initialized();
        for req in [
            SbCtrlReq::RekeyVba,
            SbCtrlReq::VbdExtensionStep,
            SbCtrlReq::FtExtensionStep,
        ] {
            submit(&mut sb_ctrl, req);
            assert!(sb_ctrl.peek_generated_request().is_none());
            sb_ctrl.drop_completed_request(TAG).result.unwrap();
        }
    }

    #[test]
    fn write_waits_for_running_reads() {
        let mut sb_ctrl = initialized();
        sb_ctrl.submit_request(ModuleRequest::new(
            Origin::Client(1),
            SbCtrlReq::ReadVba {
                vba: 0,
                snapshot_gen: None,
                data: Block::zeroed(),
            },
        ));
        sb_ctrl.submit_request(ModuleRequest::new(
            Origin::Client(2),
            SbCtrlReq::WriteVba {
                vba: 1,
                data: Block::zeroed(),
            },
        ));
        execute(&mut sb_ctrl);

        let generated: Vec<_> = sb_ctrl.pool.iter().filter(|chan| chan.is_waiting()).collect();
        assert_eq!(generated.len(), 1);
        assert!(generated[0].req.payload::<SbCtrlReq>().is_read());
    }

    #[test]
    fn discarding_an_unknown_snapshot_fails() {
        let mut sb_ctrl = initialized();
        submit(&mut sb_ctrl, SbCtrlReq::DiscardSnapshot { generation: 3 });
        let req = sb_ctrl.drop_completed_request(TAG);
        assert_eq!(req.result.unwrap_err().errno(), NotFound);
    }
}
