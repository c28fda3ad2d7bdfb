// SPDX-License-Identifier: MPL-2.0

//! The module framework.
//!
//! Every component of the CBE is a [`Module`]: it accepts requests, advances
//! them in [`Module::execute`], and hands them back once completed. Modules
//! that need help from a sibling put a *generated* request into a mailbox,
//! which the scheduler in [`crate::Cbe`] routes to the destination module and
//! whose completion it routes back. No module ever calls another directly.

mod channel;

pub(crate) use self::channel::{ChannelPool, ChannelState, SyncState};
use crate::{
    layers::{
        bio::BlockIoReq, cache::CacheReq, crypto::CryptoReq, free_tree::FreeTreeReq,
        sb_ctrl::SbCtrlReq, trust_anchor::TaReq, vbd::VbdReq,
    },
    prelude::*,
};

/// Identifies a module.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum ModuleId {
    BlockIo,
    Cache,
    Crypto,
    TrustAnchor,
    FreeTree,
    Vbd,
    SbCtrl,
}

impl ModuleId {
    /// All modules, in the order the scheduler visits them.
    pub const ALL: [ModuleId; 7] = [
        ModuleId::SbCtrl,
        ModuleId::Vbd,
        ModuleId::FreeTree,
        ModuleId::Cache,
        ModuleId::BlockIo,
        ModuleId::Crypto,
        ModuleId::TrustAnchor,
    ];
}

/// Who receives the completion of a request.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Origin {
    /// A client request, identified by the tag the client chose.
    Client(u64),
    /// A background request issued by the library itself.
    Library,
    /// A sub-request generated by channel `idx` of `module`.
    Channel { module: ModuleId, idx: usize },
}

/// A request travelling between modules.
#[derive(Debug)]
pub struct ModuleRequest {
    pub origin: Origin,
    pub payload: Payload,
    pub result: Result<()>,
}

impl ModuleRequest {
    pub fn new(origin: Origin, payload: impl Into<Payload>) -> Self {
        Self {
            origin,
            payload: payload.into(),
            result: Ok(()),
        }
    }

    /// Returns the typed payload.
    ///
    /// # Panics
    ///
    /// Panics if the payload belongs to another module, which means the
    /// request was routed to the wrong destination.
    pub fn payload<P: TypedPayload>(&self) -> &P {
        match P::of(&self.payload) {
            Some(payload) => payload,
            None => panic!("request {:?} routed to the wrong module", self.payload.dst()),
        }
    }

    /// Returns the typed payload mutably. Panics like [`Self::payload`].
    pub fn payload_mut<P: TypedPayload>(&mut self) -> &mut P {
        let dst = self.payload.dst();
        match P::of_mut(&mut self.payload) {
            Some(payload) => payload,
            None => panic!("request {:?} routed to the wrong module", dst),
        }
    }

    /// Consumes the request, returning its typed payload and outcome.
    pub fn into_parts<P: TypedPayload>(self) -> (P, Result<()>) {
        let dst = self.payload.dst();
        match P::take(self.payload) {
            Some(payload) => (payload, self.result),
            None => panic!("request {:?} routed to the wrong module", dst),
        }
    }
}

/// A payload type that belongs to one module.
pub trait TypedPayload: Sized {
    fn of(payload: &Payload) -> Option<&Self>;
    fn of_mut(payload: &mut Payload) -> Option<&mut Self>;
    fn take(payload: Payload) -> Option<Self>;
}

macro_rules! define_payload {
    ($($variant:ident($ty:ty) => $module:ident),* $(,)?) => {
        /// The per-module request types. The destination of a request
        /// follows from the variant.
        #[derive(Debug)]
        pub enum Payload {
            $($variant($ty),)*
        }

        impl Payload {
            /// Returns the module this payload is destined for.
            pub fn dst(&self) -> ModuleId {
                match self {
                    $(Payload::$variant(_) => ModuleId::$module,)*
                }
            }
        }

        $(
            impl From<$ty> for Payload {
                fn from(req: $ty) -> Self {
                    Payload::$variant(req)
                }
            }

            impl TypedPayload for $ty {
                fn of(payload: &Payload) -> Option<&Self> {
                    match payload {
                        Payload::$variant(req) => Some(req),
                        _ => None,
                    }
                }

                fn of_mut(payload: &mut Payload) -> Option<&mut Self> {
                    match payload {
                        Payload::$variant(req) => Some(req),
                        _ => None,
                    }
                }

                fn take(payload: Payload) -> Option<Self> {
                    match payload {
                        Payload::$variant(req) => Some(req),
                        _ => None,
                    }
                }
            }
        )*
    };
}

define_payload! {
    BlockIo(BlockIoReq) => BlockIo,
    Cache(CacheReq) => Cache,
    Crypto(CryptoReq) => Crypto,
    TrustAnchor(TaReq) => TrustAnchor,
    FreeTree(FreeTreeReq) => FreeTree,
    Vbd(VbdReq) => Vbd,
    SbCtrl(SbCtrlReq) => SbCtrl,
}

/// The contract every module fulfils towards the scheduler.
///
/// Modules that never generate sub-requests keep the default
/// implementations of the last three methods, which must never be reached.
pub trait Module {
    /// Whether a new request can be accepted.
    fn ready_to_submit_request(&self) -> bool;

    /// Accepts a request.
    ///
    /// # Panics
    ///
    /// Panics if the module is not ready, see
    /// [`Module::ready_to_submit_request`].
    fn submit_request(&mut self, req: ModuleRequest);

    /// Advances every in-flight request as far as possible, setting
    /// `progress` if anything changed.
    fn execute(&mut self, progress: &mut bool);

    /// Returns a completed request, if any.
    fn peek_completed_request(&self) -> Option<&ModuleRequest>;

    /// Removes the completed request issued by `origin` and returns it.
    fn drop_completed_request(&mut self, origin: Origin) -> ModuleRequest;

    /// Returns a generated sub-request waiting for dispatch, if any.
    fn peek_generated_request(&self) -> Option<&ModuleRequest> {
        None
    }

    /// Hands the generated sub-request of `origin` over to the scheduler.
    fn drop_generated_request(&mut self, origin: Origin) -> ModuleRequest {
        panic!("module generates no requests, dropped {:?}", origin)
    }

    /// Delivers the completion of a generated sub-request.
    fn generated_request_complete(&mut self, req: ModuleRequest) {
        panic!("module generates no requests, completed {:?}", req.origin)
    }
}
