//! The application-facing top of a stack: a blocking `write`/`read` pair built on the
//! non-blocking `send`/`receive` core and a latch [`Event`].
//!
//! A device has no functional layer above it, so unlike [`super::cantp::CanTp`] or
//! [`super::slip::Slip`] it does not implement [`Layer`] itself -- it only wires itself as the
//! [`Upper`] observer of whatever is below it.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::eid::Eid;
use crate::event::{Event, WaitResult};
use crate::layer::{Layer, Upper};
use crate::msg::Msg;
use crate::status::Status;

/// A generic application device: queues inbound messages and the most recent status, and exposes
/// them through a blocking, timeout-bounded `read` alongside a non-blocking `write`.
pub struct GenericDevice {
    lower: Arc<dyn Layer>,
    inbox: Mutex<VecDeque<(Msg<'static>, Eid)>>,
    arrived: Event,
    last_status: Mutex<Option<(Status, Eid)>>,
}

impl GenericDevice {
    /// Wire a device above `lower`. Unlike a protocol's construction, this does not route back
    /// through [`crate::layer::wire`]: a device is never itself a [`Layer`], so there is no
    /// downward link for anything to be wired beneath.
    pub fn new(lower: Arc<dyn Layer>) -> Arc<GenericDevice> {
        let device = Arc::new(GenericDevice {
            lower: lower.clone(),
            inbox: Mutex::new(VecDeque::new()),
            arrived: Event::new(),
            last_status: Mutex::new(None),
        });
        let observer: Weak<dyn Upper> = Arc::downgrade(&device);
        lower.set_upper(observer);
        device
    }

    /// Open the stack beneath this device.
    pub fn open(&self, address: Option<Eid>, id: Eid) -> bool {
        self.lower.open(address, id)
    }

    /// Close the stack beneath this device.
    pub fn close(&self, id: Eid) {
        self.lower.close(id);
    }

    /// Hand `msg` to the stack below. Non-blocking; `false` means the layer below rejected it.
    pub fn write(&self, msg: Msg<'static>, id: Eid) -> bool {
        self.lower.send(msg, id, false)
    }

    /// Block for up to `timeout` for the next message to arrive, FIFO across however many have
    /// queued up. `None` on timeout.
    pub fn read(&self, timeout: Duration) -> Option<(Msg<'static>, Eid)> {
        if let Some(item) = self.inbox.lock().pop_front() {
            return Some(item);
        }
        self.arrived.reset();
        if let Some(item) = self.inbox.lock().pop_front() {
            return Some(item);
        }
        if self.arrived.wait_for(timeout) == WaitResult::Timeout {
            return None;
        }
        self.inbox.lock().pop_front()
    }

    /// The most recent status indication from the stack below, if any arrived yet.
    pub fn last_status(&self) -> Option<(Status, Eid)> {
        *self.last_status.lock()
    }
}

impl Upper for GenericDevice {
    fn receive(&self, msg: Msg<'static>, id: Eid, _more: bool) {
        self.inbox.lock().push_back((msg, id));
        self.arrived.set();
    }

    fn indication(&self, status: Status, id: Eid) {
        *self.last_status.lock() = Some((status, id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{leaked_pool, RecordingCommunicator};
    use std::thread;

    #[test]
    fn write_forwards_and_read_drains_the_inbox_fifo() {
        let pool = leaked_pool::<8, 8>();
        let lower = RecordingCommunicator::new(pool);
        let device = GenericDevice::new(lower.clone());

        let mut msg = Msg::new(pool);
        msg.put(&[1, 2]);
        assert!(device.write(msg, Eid::ANY));
        assert_eq!(lower.take_sent(), vec![vec![1, 2]]);

        lower.inject(&[9], Eid::ANY);
        lower.inject(&[8], Eid::ANY);

        let (first, _) = device.read(Duration::from_millis(50)).unwrap();
        let mut buf = [0u8; 1];
        first.get(&mut buf, 0);
        assert_eq!(buf, [9]);

        let (second, _) = device.read(Duration::from_millis(50)).unwrap();
        second.get(&mut buf, 0);
        assert_eq!(buf, [8]);
    }

    #[test]
    fn read_times_out_when_nothing_arrives() {
        let pool = leaked_pool::<8, 8>();
        let lower = RecordingCommunicator::new(pool);
        let device = GenericDevice::new(lower);
        assert!(device.read(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn read_observes_a_message_injected_from_another_thread() {
        let pool = leaked_pool::<8, 8>();
        let lower = RecordingCommunicator::new(pool);
        let device = Arc::new(GenericDevice::new(lower.clone()));

        let injector = lower.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(15));
            injector.inject(&[42], Eid::ANY);
        });

        let (msg, _) = device.read(Duration::from_secs(2)).expect("message should arrive before timeout");
        let mut buf = [0u8; 1];
        msg.get(&mut buf, 0);
        assert_eq!(buf, [42]);
    }

    #[test]
    fn indication_updates_last_status() {
        let pool = leaked_pool::<8, 8>();
        let lower = RecordingCommunicator::new(pool);
        let device = GenericDevice::new(lower.clone());
        lower.indicate(Status::Connected, Eid::ANY);
        assert_eq!(device.last_status(), Some((Status::Connected, Eid::ANY)));
    }
}
