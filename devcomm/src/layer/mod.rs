//! The layer abstraction: a symmetric up/down message pipeline.
//!
//! This is not a strict OSI stack but a chain of nodes that all implement the same five-operation
//! contract: `open`, `close`, `send` going down, `receive`/`indication` going up. A *communicator*
//! sits at the bottom (touches hardware/OS, has no lower), a *device* sits at the top (exposes the
//! application API, has no upper), and zero or more *protocols* sit in between.
//!
//! ## Wiring
//!
//! A natural translation of "each ctor captures its `lower` and registers itself as `upper`" is a
//! pair of mutual back-references -- which in safe Rust is either a reference-counted cycle or a
//! raw pointer. Both carry a re-entrancy hazard: a callback driven by a layer's own state must not
//! try to mutably re-borrow that same state, which is exactly what happens if a protocol calls back
//! down into a layer it is itself being invoked from.
//!
//! This crate resolves it the way a lock-protected observer graph resolves it: each layer is
//! reference-counted (`Arc<dyn Layer>`) and internally synchronized (its own `parking_lot::Mutex`
//! around whatever state needs it), so its trait methods take `&self` rather than `&mut self`. The
//! "upper" back-reference is a non-owning `Weak<dyn Upper>`, set once by [`wire`]. The lifetime
//! contract is enforced by `Weak` itself: a dropped upper silently stops receiving events instead
//! of dangling.
//!
//! ## Receiving
//!
//! A layer routes accepted messages to whichever [`Upper`] is currently wired above it. The
//! encapsulation a layer adds (a CAN-TP length prefix, a SLIP frame) is always stripped before the
//! message reaches that upper; there is no mechanism for an upper to see a lower layer's own
//! framing.
//!
//! ## Sending
//!
//! `send` takes ownership of the message (by value) only on acceptance; a rejected `send` (`false`)
//! leaves the caller holding it, so a caller can retry, redirect, or queue without the layer having
//! touched the pool. `more` marks a fragment of one logical transfer, allowing a protocol that
//! reassembles at this layer (or passes the hint further down) to know more is coming before
//! finalizing anything.
use std::sync::{Arc, Weak};

use crate::eid::Eid;
use crate::msg::Msg;
use crate::status::Status;

pub mod cantp;
pub mod debug;
pub mod device;
pub mod passthrough;
pub mod slip;

/// A node in the stack: communicator, protocol, or device.
///
/// Implementors hold whatever state they need behind their own internal synchronization; methods
/// take `&self` so that `Arc<dyn Layer>` can be shared between the layer above (which calls down
/// through it) and a timer thread (which may call back into it concurrently). Upward and
/// downward calls into one layer may interleave and must be serialized by the implementer, not by
/// the caller.
pub trait Layer: Send + Sync {
    /// Establish this layer's state, cascading downward first -- failure of the lower layer halts
    /// the cascade and this layer does not open either. `address` is this layer's own address if
    /// it needs one (e.g. a communicator binding a socket); `id` selects which multiplexed channel
    /// to open, defaulting to [`Eid::ANY`] at call sites that don't care.
    fn open(&self, address: Option<Eid>, id: Eid) -> bool;

    /// Tear down this layer's own state first, then cascade downward. Idempotent and safe to call
    /// from any layer at any time, including re-entrantly from within a callback.
    fn close(&self, id: Eid);

    /// Accept one message from the layer above (or the application, at the top). `more == true`
    /// marks a fragment of a larger logical send. Returns `false` if the message is rejected
    /// outright -- the caller keeps ownership and no resources were consumed. A `true` return
    /// transfers ownership of `msg`.
    fn send(&self, msg: Msg<'static>, id: Eid, more: bool) -> bool;

    /// Install (or replace) the observer notified of this layer's upward events. Layers with
    /// nothing to report upward (a device, which has no functional layer above it) use the
    /// default no-op.
    fn set_upper(&self, _upper: Weak<dyn Upper>) {}
}

/// The upward half of the contract: what a lower layer calls on whoever is wired above it.
pub trait Upper: Send + Sync {
    /// One message arriving from below. Ownership of `msg` transfers to the receiver.
    fn receive(&self, msg: Msg<'static>, id: Eid, more: bool);

    /// An asynchronous status event from below.
    fn indication(&self, status: Status, id: Eid);
}

/// Wire `lower` to a freshly built upper layer: construct `upper` from a clone of `lower`'s handle,
/// then install a weak back-reference to it as `lower`'s observer.
pub fn wire<L, U>(lower: Arc<L>, build: impl FnOnce(Arc<L>) -> U) -> Arc<U>
where
    L: Layer + 'static,
    U: Layer + Upper + 'static,
{
    let upper = Arc::new(build(lower.clone()));
    let observer: Weak<dyn Upper> = Arc::downgrade(&upper);
    lower.set_upper(observer);
    upper
}

/// A no-op [`Upper`], useful as the top observer of a stack whose device doesn't need one (tests,
/// or a device that polls explicitly instead of being called back).
pub struct NullUpper;

impl Upper for NullUpper {
    fn receive(&self, _msg: Msg<'static>, _id: Eid, _more: bool) {}
    fn indication(&self, _status: Status, _id: Eid) {}
}
