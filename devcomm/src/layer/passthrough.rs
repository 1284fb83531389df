//! The identity protocol: forwards every operation to its lower layer unchanged.
//!
//! Exists as a thin collaborator for testing the layer abstraction in isolation from any real
//! protocol logic, and as the clearest illustration of the "defaults forward unchanged" rule
//! every other protocol overrides selectively.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::eid::Eid;
use crate::layer::{self, Layer, Upper};
use crate::msg::Msg;
use crate::status::Status;

/// A no-op protocol layer: every operation is forwarded to `lower` (downward) or to the wired
/// observer (upward) exactly as received.
pub struct PassThrough {
    lower: Arc<dyn Layer>,
    upper: Mutex<Weak<dyn Upper>>,
}

impl PassThrough {
    pub fn new(lower: Arc<dyn Layer>) -> Arc<PassThrough> {
        layer::wire(lower, |lower| PassThrough { lower, upper: Mutex::new(Weak::new()) })
    }
}

impl Layer for PassThrough {
    fn open(&self, address: Option<Eid>, id: Eid) -> bool {
        if self.upper.lock().upgrade().is_none() {
            return false;
        }
        self.lower.open(address, id)
    }

    fn close(&self, id: Eid) {
        self.lower.close(id);
    }

    fn send(&self, msg: Msg<'static>, id: Eid, more: bool) -> bool {
        self.lower.send(msg, id, more)
    }

    fn set_upper(&self, upper: Weak<dyn Upper>) {
        *self.upper.lock() = upper;
    }
}

impl Upper for PassThrough {
    fn receive(&self, msg: Msg<'static>, id: Eid, more: bool) {
        if let Some(upper) = self.upper.lock().upgrade() {
            upper.receive(msg, id, more);
        }
    }

    fn indication(&self, status: Status, id: Eid) {
        if let Some(upper) = self.upper.lock().upgrade() {
            upper.indication(status, id);
        }
    }
}
