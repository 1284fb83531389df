//! In-memory test doubles: a communicator that records what crosses the hardware boundary and
//! lets a test inject bytes as if they arrived from the wire.
//!
//! Not part of the public API -- real communicators (serial, socket, bus) are out of scope here
//! and live in their own crates, the way `ethox`'s NIC drivers do.

use std::mem;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::eid::Eid;
use crate::layer::{Layer, Upper};
use crate::msg::Msg;
use crate::pool::{MessagePool, Pool};
use crate::status::Status;

/// A pool sized generously for test messages, leaked for the `'static` lifetime every
/// [`crate::layer::Layer`] impl expects its pool reference to have.
pub fn leaked_pool<const PAGES: usize, const PAGE_SIZE: usize>() -> &'static dyn Pool {
    Box::leak(Box::new(MessagePool::<PAGES, PAGE_SIZE>::try_new().unwrap()))
}

/// Enable `log` output for a test, visible with `cargo test -- --nocapture`. Safe to call from
/// every test in a suite; only the first call actually installs the logger.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A bottom-of-stack communicator double: records every frame handed to `send`, acknowledges it
/// with a synchronous `tx_done` (as a real communicator would, asynchronously, on its own
/// worker), and exposes `inject`/`indicate` so a test can drive the upward direction.
pub struct RecordingCommunicator {
    pool: &'static dyn Pool,
    upper: Mutex<Weak<dyn Upper>>,
    sent: Mutex<Vec<Vec<u8>>>,
    ack_sends: bool,
}

impl RecordingCommunicator {
    pub fn new(pool: &'static dyn Pool) -> Arc<Self> {
        Arc::new(RecordingCommunicator {
            pool,
            upper: Mutex::new(Weak::new()),
            sent: Mutex::new(Vec::new()),
            ack_sends: true,
        })
    }

    /// A communicator that never acknowledges sends, for exercising `N_As` timeout paths.
    pub fn new_without_ack(pool: &'static dyn Pool) -> Arc<Self> {
        Arc::new(RecordingCommunicator {
            pool,
            upper: Mutex::new(Weak::new()),
            sent: Mutex::new(Vec::new()),
            ack_sends: false,
        })
    }

    /// Every frame sent so far, linearized, oldest first. Clears the log.
    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        mem::take(&mut self.sent.lock())
    }

    /// Feed `bytes` upward as if received from the wire.
    pub fn inject(&self, bytes: &[u8], id: Eid) {
        let mut msg = Msg::new(self.pool);
        assert!(msg.put(bytes), "test pool exhausted while injecting a frame");
        if let Some(upper) = self.upper.lock().upgrade() {
            upper.receive(msg, id, false);
        }
    }

    /// Raise a status indication as if observed by the communicator.
    pub fn indicate(&self, status: Status, id: Eid) {
        if let Some(upper) = self.upper.lock().upgrade() {
            upper.indication(status, id);
        }
    }
}

impl Layer for RecordingCommunicator {
    fn open(&self, _address: Option<Eid>, _id: Eid) -> bool {
        true
    }

    fn close(&self, _id: Eid) {}

    fn send(&self, msg: Msg<'static>, id: Eid, _more: bool) -> bool {
        let mut buf = vec![0u8; msg.size()];
        msg.get(&mut buf, 0);
        self.sent.lock().push(buf);
        if self.ack_sends {
            if let Some(upper) = self.upper.lock().upgrade() {
                upper.indication(Status::TxDone, id);
            }
        }
        true
    }

    fn set_upper(&self, upper: Weak<dyn Upper>) {
        *self.upper.lock() = upper;
    }
}

/// Wires two [`RecordingCommunicator`]s so that whatever `A` sends is injected into `B` and vice
/// versa, as if they shared a CAN bus. Acknowledgment of the sender's own `send` still happens
/// synchronously via `RecordingCommunicator::send`; this additionally delivers the frame to the
/// peer.
pub struct Bus {
    pub a: Arc<RecordingCommunicator>,
    pub b: Arc<RecordingCommunicator>,
}

impl Bus {
    pub fn new(pool: &'static dyn Pool) -> Self {
        Bus { a: RecordingCommunicator::new(pool), b: RecordingCommunicator::new(pool) }
    }

    /// Forward every frame currently queued in `a`'s send log to `b`, and vice versa.
    pub fn pump(&self, id: Eid) {
        for frame in self.a.take_sent() {
            self.b.inject(&frame, id);
        }
        for frame in self.b.take_sent() {
            self.a.inject(&frame, id);
        }
    }
}
