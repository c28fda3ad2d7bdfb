// SPDX-License-Identifier: MPL-2.0

//! The Consistent Block Encrypter as a library object.
//!
//! API: format(), open(), submit_request(), execute(),
//! peek_completed_request(), drop_completed_request(), plus blocking
//! wrappers (read(), write(), sync(), create_snapshot(), ...).
//!
//! `Cbe` owns one instance of every module and runs the scheduler: it lets
//! each module execute, moves generated sub-requests to their destination
//! and completions back to where they came from, until nothing moves
//! anymore. While a rekeying or an extension is pending it also keeps one
//! background step in flight.
//!
//! # Usage Example
//!
//! ```
//! use cbe::{Block, Cbe, Config, Geometry, MemDisk, TaStore};
//!
//! let disk = std::sync::Arc::new(MemDisk::create(8192)?);
//! let geometry = Geometry { degree: 64, nr_of_leaves: 4096, nr_of_pbas: 4096 };
//! let mut cbe = Cbe::format(Config::default(), geometry, disk, TaStore::new(), "passphrase")?;
//!
//! cbe.write(100, &Block::filled(1))?;
//! let snapshot = cbe.create_snapshot(true)?;
//! cbe.write(100, &Block::filled(2))?;
//! assert_eq!(cbe.read(100)?, Block::filled(2));
//! assert_eq!(cbe.read_snapshot(snapshot, 100)?, Block::filled(1));
//! # Ok::<(), cbe::Error>(())
//! ```

use std::collections::VecDeque;

use hashbrown::HashSet;

use crate::{
    config::{Config, Geometry},
    layers::{
        bio::{BlockIo, BlockSet},
        cache::Cache,
        crypto::Crypto,
        free_tree::{FreeTree, FreeTreeInfo},
        sb_ctrl::{self, SbCtrl, SbCtrlReq, SuperblockState},
        trust_anchor::{TaStore, TrustAnchor},
        vbd::Vbd,
    },
    module::{Module, ModuleId, ModuleRequest, Origin},
    prelude::*,
    tree::Snapshot,
};

/// The Consistent Block Encrypter.
pub struct Cbe<D: BlockSet> {
    sb_ctrl: SbCtrl,
    vbd: Vbd,
    free_tree: FreeTree<D>,
    cache: Cache<D>,
    block_io: BlockIo<D>,
    crypto: Crypto,
    trust_anchor: TrustAnchor,
    /// Completed client requests, in completion order.
    completed: VecDeque<ModuleRequest>,
    /// Client tags submitted and not yet dropped.
    tags: HashSet<u64>,
    /// Tag of the next request issued by a blocking wrapper.
    next_sync_tag: u64,
    background_in_flight: bool,
    /// The failure that paused the background operation.
    background_error: Option<Error>,
}

impl<D: BlockSet> Cbe<D> {
    /// Formats `disk` according to `geometry` and opens it.
    pub fn format(
        config: Config,
        geometry: Geometry,
        disk: Arc<D>,
        ta: TaStore,
        passphrase: &str,
    ) -> Result<Self> {
        let mut trust_anchor = TrustAnchor::new(ta.clone(), config.nr_of_channels);
        sb_ctrl::format(&*disk, &mut trust_anchor, &geometry, passphrase)?;
        Self::open(config, disk, ta, passphrase)
    }

    /// Opens a formatted device, recovering the newest sealed superblock.
    pub fn open(config: Config, disk: Arc<D>, ta: TaStore, passphrase: &str) -> Result<Self> {
        let nr_of_channels = config.nr_of_channels;
        let mut cbe = Self {
            sb_ctrl: SbCtrl::new(nr_of_channels, config.ft_extension_step),
            vbd: Vbd::new(nr_of_channels),
            free_tree: FreeTree::new(disk.clone(), FreeTreeInfo::default(), nr_of_channels),
            cache: Cache::new(disk.clone(), config.cache_capacity, nr_of_channels),
            block_io: BlockIo::new(disk, nr_of_channels),
            crypto: Crypto::new(nr_of_channels),
            trust_anchor: TrustAnchor::new(ta, nr_of_channels),
            completed: VecDeque::new(),
            tags: HashSet::new(),
            next_sync_tag: u64::MAX,
            background_in_flight: false,
            background_error: None,
        };
        cbe.run(SbCtrlReq::Initialize {
            passphrase: passphrase.to_string(),
        })?;
        Ok(cbe)
    }

    /// Submits a request. Its completion is picked up with
    /// [`Self::drop_completed_request`] under the same `tag`.
    pub fn submit_request(&mut self, tag: u64, req: SbCtrlReq) -> Result<()> {
        if !self.sb_ctrl.ready_to_submit_request() {
            return_errno!(Busy);
        }
        if !self.tags.insert(tag) {
            return_errno_with_msg!(InvalidArgs, "tag already in use");
        }
        debug!("[Cbe] submit {:?} as {}", req, tag);
        self.sb_ctrl
            .submit_request(ModuleRequest::new(Origin::Client(tag), req));
        Ok(())
    }

    /// Returns the tag of the first completed request, if any.
    pub fn peek_completed_request(&self) -> Option<u64> {
        self.completed.front().map(|req| match req.origin {
            Origin::Client(tag) => tag,
            origin => unreachable!("{:?} completed as a client request", origin),
        })
    }

    /// Takes the completed request with `tag`, returning it with its
    /// outputs filled in.
    pub fn drop_completed_request(&mut self, tag: u64) -> Option<Result<SbCtrlReq>> {
        let pos = self
            .completed
            .iter()
            .position(|req| req.origin == Origin::Client(tag))?;
        let req = self.completed.remove(pos)?;
        self.tags.remove(&tag);
        let (payload, result) = req.into_parts::<SbCtrlReq>();
        Some(result.map(|()| payload))
    }

    /// Runs the modules until none of them can make progress. Returns
    /// whether anything happened.
    pub fn execute(&mut self) -> bool {
        let mut any_progress = false;
        let mut background_submitted = false;
        loop {
            let mut progress = false;
            for id in ModuleId::ALL {
                self.module_mut(id).execute(&mut progress);
            }
            for id in ModuleId::ALL {
                self.route_generated(id, &mut progress);
                self.route_completed(id, &mut progress);
            }
            if !background_submitted {
                background_submitted = self.drive_background();
                progress |= background_submitted;
            }
            if !progress {
                return any_progress;
            }
            any_progress = true;
        }
    }

    fn module(&self, id: ModuleId) -> &dyn Module {
        match id {
            ModuleId::SbCtrl => &self.sb_ctrl,
            ModuleId::Vbd => &self.vbd,
            ModuleId::FreeTree => &self.free_tree,
            ModuleId::Cache => &self.cache,
            ModuleId::BlockIo => &self.block_io,
            ModuleId::Crypto => &self.crypto,
            ModuleId::TrustAnchor => &self.trust_anchor,
        }
    }

    fn module_mut(&mut self, id: ModuleId) -> &mut dyn Module {
        match id {
            ModuleId::SbCtrl => &mut self.sb_ctrl,
            ModuleId::Vbd => &mut self.vbd,
            ModuleId::FreeTree => &mut self.free_tree,
            ModuleId::Cache => &mut self.cache,
            ModuleId::BlockIo => &mut self.block_io,
            ModuleId::Crypto => &mut self.crypto,
            ModuleId::TrustAnchor => &mut self.trust_anchor,
        }
    }

    fn route_generated(&mut self, src: ModuleId, progress: &mut bool) {
        while let Some(req) = self.module(src).peek_generated_request() {
            let (origin, dst) = (req.origin, req.payload.dst());
            if !self.module(dst).ready_to_submit_request() {
                return;
            }
            let req = self.module_mut(src).drop_generated_request(origin);
            trace!("[Cbe] {:?} -> {:?}: {:?}", src, dst, origin);
            self.module_mut(dst).submit_request(req);
            *progress = true;
        }
    }

    fn route_completed(&mut self, src: ModuleId, progress: &mut bool) {
        while let Some(req) = self.module(src).peek_completed_request() {
            let origin = req.origin;
            let req = self.module_mut(src).drop_completed_request(origin);
            match origin {
                Origin::Channel { module, .. } => {
                    self.module_mut(module).generated_request_complete(req)
                }
                Origin::Client(_) => self.completed.push_back(req),
                Origin::Library => self.background_done(req),
            }
            *progress = true;
        }
    }

    /// Submits the next step of a pending background operation. Returns
    /// whether a step was submitted.
    fn drive_background(&mut self) -> bool {
        if self.background_in_flight
            || self.background_error.is_some()
            || !self.sb_ctrl.ready_to_submit_request()
        {
            return false;
        }
        let step = match self.state() {
            SuperblockState::Rekeying => SbCtrlReq::RekeyVba,
            SuperblockState::ExtendingVbd => SbCtrlReq::VbdExtensionStep,
            SuperblockState::ExtendingFt => SbCtrlReq::FtExtensionStep,
            SuperblockState::Normal | SuperblockState::Invalid => return false,
        };
        trace!("[Cbe] background {:?}", step);
        self.sb_ctrl
            .submit_request(ModuleRequest::new(Origin::Library, step));
        self.background_in_flight = true;
        true
    }

    fn background_done(&mut self, req: ModuleRequest) {
        self.background_in_flight = false;
        if let Err(err) = req.result {
            warn!(
                "[Cbe] background {:?} failed: {}, pausing",
                req.payload, err
            );
            self.background_error = Some(err);
        }
    }

    /// Submits `req` and runs the modules until it completes.
    fn run(&mut self, req: SbCtrlReq) -> Result<SbCtrlReq> {
        while !self.sb_ctrl.ready_to_submit_request() {
            if !self.execute() {
                return_errno_with_msg!(InvalidState, "no channel frees up");
            }
        }
        let tag = self.next_sync_tag;
        self.next_sync_tag = self.next_sync_tag.wrapping_sub(1);
        self.submit_request(tag, req)?;
        loop {
            if let Some(done) = self.drop_completed_request(tag) {
                return done;
            }
            if !self.execute() {
                error!("[Cbe] request {} stalled", tag);
                return_errno_with_msg!(InvalidState, "request stalled");
            }
        }
    }

    /// Reads `vba` of the current snapshot.
    pub fn read(&mut self, vba: Vba) -> Result<Block> {
        self.read_from(vba, None)
    }

    /// Reads `vba` of the kept snapshot with the given generation.
    pub fn read_snapshot(&mut self, generation: Generation, vba: Vba) -> Result<Block> {
        self.read_from(vba, Some(generation))
    }

    fn read_from(&mut self, vba: Vba, snapshot_gen: Option<Generation>) -> Result<Block> {
        let req = self.run(SbCtrlReq::ReadVba {
            vba,
            snapshot_gen,
            data: Block::zeroed(),
        })?;
        match req {
            SbCtrlReq::ReadVba { data, .. } => Ok(data),
            other => unreachable!("read completed as {:?}", other),
        }
    }

    pub fn write(&mut self, vba: Vba, data: &Block) -> Result<()> {
        self.run(SbCtrlReq::WriteVba {
            vba,
            data: data.clone(),
        })
        .map(|_| ())
    }

    /// Secures everything written so far.
    pub fn sync(&mut self) -> Result<()> {
        self.run(SbCtrlReq::Sync).map(|_| ())
    }

    /// Secures everything written so far as a snapshot and returns its
    /// generation. A kept snapshot stays readable until discarded.
    pub fn create_snapshot(&mut self, keep: bool) -> Result<Generation> {
        match self.run(SbCtrlReq::CreateSnapshot {
            keep,
            generation: 0,
        })? {
            SbCtrlReq::CreateSnapshot { generation, .. } => Ok(generation),
            other => unreachable!("snapshot completed as {:?}", other),
        }
    }

    pub fn discard_snapshot(&mut self, generation: Generation) -> Result<()> {
        self.run(SbCtrlReq::DiscardSnapshot { generation })
            .map(|_| ())
    }

    /// Starts moving every block to a new key. The sweep runs in the
    /// background, see [`Self::wait_for_background`].
    pub fn rekey(&mut self) -> Result<()> {
        self.start_background(SbCtrlReq::InitializeRekeying)
    }

    /// Starts adding `nr_of_leaves` blocks to the device.
    pub fn extend_vbd(&mut self, nr_of_leaves: u64) -> Result<()> {
        self.start_background(SbCtrlReq::InitializeVbdExtension { nr_of_leaves })
    }

    /// Starts adding `nr_of_pbas` blocks to the free tree.
    pub fn extend_free_tree(&mut self, nr_of_pbas: u64) -> Result<()> {
        self.start_background(SbCtrlReq::InitializeFtExtension { nr_of_pbas })
    }

    fn start_background(&mut self, req: SbCtrlReq) -> Result<()> {
        if self.state() == SuperblockState::Normal {
            self.background_error = None;
        }
        self.run(req).map(|_| ())
    }

    /// Runs the pending background operation to its end.
    pub fn wait_for_background(&mut self) -> Result<()> {
        loop {
            if let Some(err) = &self.background_error {
                return Err(err.clone());
            }
            if !self.background_in_flight
                && matches!(
                    self.state(),
                    SuperblockState::Normal | SuperblockState::Invalid
                )
            {
                return Ok(());
            }
            if !self.execute() {
                return_errno_with_msg!(InvalidState, "background operation stalled");
            }
        }
    }

    /// Clears the failure that paused the background operation, so the
    /// next [`Self::execute`] retries the failed step.
    pub fn resume_background(&mut self) {
        if let Some(err) = self.background_error.take() {
            info!("[Cbe] resume background operation after {}", err);
        }
    }

    /// Returns the failure that paused the background operation.
    pub fn background_error(&self) -> Option<&Error> {
        self.background_error.as_ref()
    }

    /// Secures everything and forgets the keys. Every later request fails
    /// with `NotInitialized`.
    pub fn deinitialize(&mut self) -> Result<()> {
        self.run(SbCtrlReq::Deinitialize).map(|_| ())
    }

    pub fn state(&self) -> SuperblockState {
        self.sb_ctrl
            .superblock()
            .map_or(SuperblockState::Invalid, |sb| sb.state)
    }

    /// Returns the generation new writes go to.
    pub fn curr_gen(&self) -> Generation {
        self.sb_ctrl.curr_gen()
    }

    pub fn last_secured_generation(&self) -> Generation {
        self.sb_ctrl
            .superblock()
            .map_or(0, |sb| sb.last_secured_generation)
    }

    /// Returns the valid snapshots, the current one included.
    pub fn snapshots(&self) -> Vec<Snapshot> {
        self.sb_ctrl.superblock().map_or(Vec::new(), |sb| {
            sb.snapshots
                .iter()
                .filter(|snapshot| snapshot.valid)
                .copied()
                .collect()
        })
    }

    pub fn rekeying_vba(&self) -> Vba {
        self.sb_ctrl.superblock().map_or(0, |sb| sb.rekeying_vba)
    }

    /// Returns the number of client-visible blocks.
    pub fn nr_of_leaves(&self) -> u64 {
        self.sb_ctrl
            .superblock()
            .map_or(0, |sb| sb.current_snapshot().nr_of_leaves)
    }

    /// Returns the number of blocks managed by the free tree.
    pub fn nr_of_pbas(&self) -> u64 {
        self.free_tree.info().nr_of_pbas
    }

    /// Returns the number of blocks the free tree can hand out right now.
    pub fn nr_of_free_blocks(&self) -> u64 {
        self.free_tree.nr_of_free()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::bio::MemDisk;

    fn geometry() -> Geometry {
        Geometry {
            degree: 4,
            nr_of_leaves: 16,
            nr_of_pbas: 256,
        }
    }

    fn new_cbe() -> Result<Cbe<MemDisk>> {
        let disk = Arc::new(MemDisk::create(512)?);
        Cbe::format(
            Config::default(),
            geometry(),
            disk,
            TaStore::new(),
            "passphrase",
        )
    }

    #[test]
    fn requests_complete_by_tag() -> Result<()> {
        let mut cbe = new_cbe()?;
        cbe.submit_request(
            7,
            SbCtrlReq::WriteVba {
                vba: 3,
                data: Block::filled(3),
            },
        )?;
        cbe.submit_request(
            8,
            SbCtrlReq::ReadVba {
                vba: 3,
                snapshot_gen: None,
                data: Block::zeroed(),
            },
        )?;
        assert_eq!(
            cbe.submit_request(7, SbCtrlReq::Sync).unwrap_err().errno(),
            InvalidArgs
        );
        while cbe.execute() {}

        assert_eq!(cbe.peek_completed_request(), Some(7));
        assert!(cbe.drop_completed_request(7).unwrap().is_ok());
        let Some(Ok(SbCtrlReq::ReadVba { data, .. })) = cbe.drop_completed_request(8) else {
            panic!("read failed");
        };
        assert_eq!(data, Block::filled(3));
        assert!(cbe.drop_completed_request(8).is_none());
        Ok(())
    }

    #[test]
    fn full_pool_reports_busy() -> Result<()> {
        let mut cbe = new_cbe()?;
        let nr_of_channels = Config::default().nr_of_channels as u64;
        for tag in 0..nr_of_channels {
            cbe.submit_request(tag, SbCtrlReq::Sync)?;
        }
        assert_eq!(
            cbe.submit_request(nr_of_channels, SbCtrlReq::Sync)
                .unwrap_err()
                .errno(),
            Busy
        );
        while cbe.execute() {}
        for tag in 0..nr_of_channels {
            assert!(cbe.drop_completed_request(tag).unwrap().is_ok());
        }
        Ok(())
    }

    #[test]
    fn background_runs_until_normal() -> Result<()> {
        let mut cbe = new_cbe()?;
        cbe.rekey()?;
        assert_eq!(cbe.state(), SuperblockState::Rekeying);
        cbe.wait_for_background()?;
        assert_eq!(cbe.state(), SuperblockState::Normal);
        assert_eq!(cbe.rekeying_vba(), 0);
        Ok(())
    }
}
