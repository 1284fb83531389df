//! A pass-through protocol that additionally reports every operation to an observer closure.
//!
//! The stand-in for the out-of-scope logging/tracing collaborator: attach one of these above a
//! communicator under test to watch exactly what crosses the layer boundary without changing any
//! behavior.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::eid::Eid;
use crate::layer::{self, Layer, Upper};
use crate::msg::Msg;
use crate::status::Status;

/// One observed crossing of the layer boundary, reported by size rather than by content -- a tap
/// is for tracing traffic shape, not for inspecting payloads (which would require borrowing the
/// message past the call it's reported from).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TapEvent {
    Send { id: Eid, size: usize, more: bool },
    Receive { id: Eid, size: usize, more: bool },
    Indication { status: Status, id: Eid },
}

/// A [`Layer`]/[`Upper`] pass-through that calls `observer` on every operation before forwarding
/// it unchanged.
pub struct DebugTap {
    lower: Arc<dyn Layer>,
    upper: Mutex<Weak<dyn Upper>>,
    observer: Box<dyn Fn(TapEvent) + Send + Sync>,
}

impl DebugTap {
    pub fn new(lower: Arc<dyn Layer>, observer: impl Fn(TapEvent) + Send + Sync + 'static) -> Arc<DebugTap> {
        layer::wire(lower, |lower| DebugTap {
            lower,
            upper: Mutex::new(Weak::new()),
            observer: Box::new(observer),
        })
    }
}

impl Layer for DebugTap {
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
        (self.observer)(TapEvent::Send { id, size: msg.size(), more });
        self.lower.send(msg, id, more)
    }

    fn set_upper(&self, upper: Weak<dyn Upper>) {
        *self.upper.lock() = upper;
    }
}

impl Upper for DebugTap {
    fn receive(&self, msg: Msg<'static>, id: Eid, more: bool) {
        (self.observer)(TapEvent::Receive { id, size: msg.size(), more });
        if let Some(upper) = self.upper.lock().upgrade() {
            upper.receive(msg, id, more);
        }
    }

    fn indication(&self, status: Status, id: Eid) {
        (self.observer)(TapEvent::Indication { status, id });
        if let Some(upper) = self.upper.lock().upgrade() {
            upper.indication(status, id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{leaked_pool, RecordingCommunicator};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn observer_sees_every_send_and_traffic_still_passes_through() {
        let pool = leaked_pool::<8, 8>();
        let lower = RecordingCommunicator::new(pool);
        let seen = Arc::new(AtomicUsize::new(0));
        let counted = seen.clone();
        let tap = DebugTap::new(lower.clone(), move |event| {
            if let TapEvent::Send { size, .. } = event {
                counted.fetch_add(size, Ordering::SeqCst);
            }
        });

        let mut msg = Msg::new(pool);
        msg.put(&[1, 2, 3, 4]);
        assert!(tap.send(msg, Eid::ANY, false));
        assert_eq!(seen.load(Ordering::SeqCst), 4);
        assert_eq!(lower.take_sent(), vec![vec![1, 2, 3, 4]]);
    }
}
