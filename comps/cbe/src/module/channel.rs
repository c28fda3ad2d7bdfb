// SPDX-License-Identifier: MPL-2.0

use super::{ModuleId, ModuleRequest, Origin, Payload};
use crate::prelude::*;

/// The state of a channel.
pub trait ChannelState: Debug {
    fn is_completed(&self) -> bool;
}

/// The mailbox for the one sub-request a channel may have outstanding.
#[derive(Debug, Default)]
pub enum GeneratedPrim {
    #[default]
    Idle,
    /// Generated, waiting for the scheduler to pick it up.
    Pending(ModuleRequest),
    /// Submitted to the destination module.
    InProgress,
    /// Completed, waiting for the channel to consume it.
    Complete(ModuleRequest),
}

/// One slot of a [`ChannelPool`].
#[derive(Debug)]
pub struct Channel<S> {
    pub req: ModuleRequest,
    pub state: S,
    pub prim: GeneratedPrim,
    idx: usize,
    owner: ModuleId,
}

impl<S> Channel<S> {
    /// Issues a sub-request on behalf of this channel.
    ///
    /// # Panics
    ///
    /// Panics if a sub-request is already outstanding.
    pub fn generate(&mut self, payload: impl Into<Payload>) {
        assert!(
            matches!(self.prim, GeneratedPrim::Idle),
            "{:?} channel {} issued a second sub-request",
            self.owner,
            self.idx
        );
        let origin = Origin::Channel {
            module: self.owner,
            idx: self.idx,
        };
        self.prim = GeneratedPrim::Pending(ModuleRequest::new(origin, payload));
    }

    /// Takes the completed sub-request, if there is one.
    pub fn take_completed_prim(&mut self) -> Option<ModuleRequest> {
        match core::mem::take(&mut self.prim) {
            GeneratedPrim::Complete(req) => Some(req),
            other => {
                self.prim = other;
                None
            }
        }
    }

    /// Whether the channel waits for a sub-request.
    #[cfg(test)]
    pub fn is_waiting(&self) -> bool {
        matches!(
            self.prim,
            GeneratedPrim::Pending(_) | GeneratedPrim::InProgress
        )
    }

    /// Fails the channel's request with `err`.
    pub fn fail(&mut self, err: Error) {
        self.req.result = Err(err);
    }
}

/// A fixed arena of channels, each carrying one request.
#[derive(Debug)]
pub struct ChannelPool<S> {
    owner: ModuleId,
    slots: Vec<Option<Channel<S>>>,
}

impl<S: ChannelState> ChannelPool<S> {
    pub fn new(owner: ModuleId, nr_of_channels: usize) -> Self {
        let mut slots = Vec::with_capacity(nr_of_channels);
        slots.resize_with(nr_of_channels.max(1), || None);
        Self { owner, slots }
    }

    pub fn has_free_slot(&self) -> bool {
        self.slots.iter().any(Option::is_none)
    }

    /// Places `req` into a free channel, returning the channel index.
    ///
    /// # Panics
    ///
    /// Panics if every channel is in use.
    pub fn insert(&mut self, req: ModuleRequest, state: S) -> usize {
        let Some(idx) = self.slots.iter().position(Option::is_none) else {
            panic!("{:?} accepted a request without a free channel", self.owner);
        };
        self.slots[idx] = Some(Channel {
            req,
            state,
            prim: GeneratedPrim::Idle,
            idx,
            owner: self.owner,
        });
        idx
    }

    pub fn get(&self, idx: usize) -> Option<&Channel<S>> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Channel<S>> {
        self.slots.get_mut(idx).and_then(Option::as_mut)
    }

    /// Returns the indices of occupied channels.
    pub fn occupied(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|_| idx))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel<S>> {
        self.slots.iter().flatten()
    }

    pub fn peek_completed(&self) -> Option<&ModuleRequest> {
        self.iter()
            .find(|chan| chan.state.is_completed())
            .map(|chan| &chan.req)
    }

    /// Frees the completed channel whose request came from `origin`.
    ///
    /// # Panics
    ///
    /// Panics if no such request has completed.
    pub fn take_completed(&mut self, origin: Origin) -> ModuleRequest {
        let pos = self.slots.iter().position(|slot| {
            slot.as_ref()
                .is_some_and(|chan| chan.state.is_completed() && chan.req.origin == origin)
        });
        match pos.and_then(|idx| self.slots[idx].take()) {
            Some(chan) => chan.req,
            None => panic!("{:?} has no completed request from {:?}", self.owner, origin),
        }
    }

    pub fn peek_generated(&self) -> Option<&ModuleRequest> {
        self.iter().find_map(|chan| match &chan.prim {
            GeneratedPrim::Pending(req) => Some(req),
            _ => None,
        })
    }

    /// Moves the pending sub-request of the channel named by `origin` to
    /// in-progress and returns it.
    pub fn take_generated(&mut self, origin: Origin) -> ModuleRequest {
        let chan = self.channel_of(origin);
        match core::mem::replace(&mut chan.prim, GeneratedPrim::InProgress) {
            GeneratedPrim::Pending(req) => req,
            other => panic!("no pending sub-request for {:?}, found {:?}", origin, other),
        }
    }

    /// Stores the completion of an in-progress sub-request.
    pub fn complete_generated(&mut self, req: ModuleRequest) {
        let chan = self.channel_of(req.origin);
        assert!(
            matches!(chan.prim, GeneratedPrim::InProgress),
            "completion for a sub-request that is not in flight"
        );
        chan.prim = GeneratedPrim::Complete(req);
    }

    fn channel_of(&mut self, origin: Origin) -> &mut Channel<S> {
        let owner = self.owner;
        let Origin::Channel { module, idx } = origin else {
            panic!("{:?} is not a channel origin", origin);
        };
        assert_eq!(module, owner, "sub-request routed back to the wrong module");
        match self.get_mut(idx) {
            Some(chan) => chan,
            None => panic!("{:?} channel {} is not in use", owner, idx),
        }
    }
}

/// The state of a request that a module serves in a single step.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SyncState {
    Submitted,
    Completed,
}

impl ChannelState for SyncState {
    fn is_completed(&self) -> bool {
        *self == SyncState::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::cache::CacheReq;

    #[test]
    fn generated_prim_lifecycle() {
        let mut pool = ChannelPool::new(ModuleId::Vbd, 2);
        let idx = pool.insert(
            ModuleRequest::new(Origin::Library, CacheReq::Sync),
            SyncState::Submitted,
        );
        let chan = pool.get_mut(idx).unwrap();
        chan.generate(CacheReq::Sync);
        assert!(chan.is_waiting());

        let origin = pool.peek_generated().unwrap().origin;
        assert_eq!(
            origin,
            Origin::Channel {
                module: ModuleId::Vbd,
                idx
            }
        );
        let mut sub = pool.take_generated(origin);
        assert!(pool.peek_generated().is_none());

        sub.result = Err(Error::new(IoFailed));
        pool.complete_generated(sub);
        let chan = pool.get_mut(idx).unwrap();
        let done = chan.take_completed_prim().unwrap();
        assert_eq!(done.result, Err(Error::new(IoFailed)));
        assert!(!chan.is_waiting());
    }

    #[test]
    fn completed_requests_leave_the_pool() {
        let mut pool = ChannelPool::new(ModuleId::Cache, 1);
        let idx = pool.insert(
            ModuleRequest::new(Origin::Client(7), CacheReq::Sync),
            SyncState::Submitted,
        );
        assert!(!pool.has_free_slot());
        assert!(pool.peek_completed().is_none());

        pool.get_mut(idx).unwrap().state = SyncState::Completed;
        assert_eq!(pool.peek_completed().unwrap().origin, Origin::Client(7));
        let req = pool.take_completed(Origin::Client(7));
        assert!(req.result.is_ok());
        assert!(pool.has_free_slot());
    }

    #[test]
    #[should_panic]
    fn second_sub_request_panics() {
        let mut pool = ChannelPool::new(ModuleId::Vbd, 1);
        let idx = pool.insert(
            ModuleRequest::new(Origin::Library, CacheReq::Sync),
            SyncState::Submitted,
        );
        let chan = pool.get_mut(idx).unwrap();
        chan.generate(CacheReq::Sync);
        chan.generate(CacheReq::Sync);
    }
}
