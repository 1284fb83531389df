//! ISO 15765-2 (CAN-TP): segmentation and reassembly of payloads up to 4095 bytes over 8-byte CAN
//! frames, with flow control and multi-timer supervision.
//!
//! One `CanTp` instance runs one transfer at a time in each direction: the sender state machine
//! (`IDLE -> WAIT_FC -> (pacing CFs) -> IDLE`) and the receiver state machine
//! (`IDLE -> RECEIVING -> IDLE`) are independent of each other but share the stack's wiring.

mod frame;

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::eid::Eid;
use crate::event::{Event, WaitResult};
use crate::layer::{self, Layer, Upper};
use crate::msg::Msg;
use crate::pool::Pool;
use crate::status::Status;
use crate::timer::Timer;

use frame::{Decoded, DecodeError};

/// `N_As`, `N_Ar`, `N_Bs`, `N_Cr`: the protocol's four supervision timers, all 1000 ms.
const N_AS: Duration = Duration::from_millis(1000);
const N_BS: Duration = Duration::from_millis(1000);
const N_CR: Duration = Duration::from_millis(1000);
/// Reserved for the communicator's own receive-side ack timer; this stack does not drive it.
#[allow(dead_code)]
const N_AR: Duration = Duration::from_millis(1000);

/// Addressing mode: plain N_PCI framing, or one leading address byte per frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Addressing {
    Normal,
    Extended { source: u8, target: u8 },
}

/// Per-stack ISO 15765-2 configuration.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Minimum separation the *receiver* demands between the sender's consecutive frames.
    pub stmin: Duration,
    /// Block size: frames between flow controls; `0` disables pacing (send until done).
    pub bs: u8,
    /// Largest payload this stack will reassemble or transmit, at most 4095.
    pub max_dl: usize,
    pub addressing: Addressing,
    /// Pad every frame to 8 bytes on the wire.
    pub zero_padding: bool,
    /// Respond to an oversized First Frame with a Flow Control OVERFLOW instead of staying
    /// silent.
    pub send_overflow_fc: bool,
}

impl Config {
    /// Reject configurations the protocol cannot express: `MAX_DL` outside `1..=4095`, or an
    /// `STmin` past the single byte the wire format allots it.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.max_dl == 0 {
            return Err(ConfigError::ZeroMaxDl);
        }
        if self.max_dl > 4095 {
            return Err(ConfigError::MaxDlTooLarge(self.max_dl));
        }
        if self.stmin.as_millis() > 0x7F {
            return Err(ConfigError::StminTooLarge(self.stmin));
        }
        Ok(self)
    }

    fn stmin_ms(&self) -> u8 {
        self.stmin.as_millis() as u8
    }
}

/// Construction-time configuration error.
#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("MAX_DL must be nonzero")]
    ZeroMaxDl,
    #[error("MAX_DL {0} exceeds the protocol maximum of 4095")]
    MaxDlTooLarge(usize),
    #[error("STmin {0:?} exceeds the single-byte wire range of 127ms")]
    StminTooLarge(Duration),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SenderPhase {
    Idle,
    WaitFc,
}

struct SenderState {
    phase: SenderPhase,
    id: Eid,
    pending: Option<Msg<'static>>,
    sn: u8,
    sent: usize,
    total: usize,
    bs: u8,
    stmin_ms: u64,
    bs_count: u8,
}

impl SenderState {
    fn idle() -> Self {
        SenderState {
            phase: SenderPhase::Idle,
            id: Eid::ANY,
            pending: None,
            sn: 0,
            sent: 0,
            total: 0,
            bs: 0,
            stmin_ms: 0,
            bs_count: 0,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ReceiverPhase {
    Idle,
    Receiving,
}

struct ReceiverState {
    phase: ReceiverPhase,
    id: Eid,
    buffer: Option<Msg<'static>>,
    expected_sn: u8,
    dl: usize,
    bs_count: u8,
}

impl ReceiverState {
    fn idle() -> Self {
        ReceiverState {
            phase: ReceiverPhase::Idle,
            id: Eid::ANY,
            buffer: None,
            expected_sn: 0,
            dl: 0,
            bs_count: 0,
        }
    }
}

/// One ISO 15765-2 protocol instance, sitting between a device (or another protocol) above and a
/// communicator below.
pub struct CanTp {
    lower: Arc<dyn Layer>,
    upper: Mutex<Weak<dyn Upper>>,
    pool: &'static dyn Pool,
    config: Config,
    sender: Mutex<SenderState>,
    receiver: Mutex<ReceiverState>,
    /// Set by the lower layer's `tx_done`/`tx_error` indication; consumed by `send_cf`'s bounded
    /// `N_As` wait before the next Consecutive Frame goes out.
    tx_ack: Event,
    n_bs_timer: Timer,
    n_cr_timer: Timer,
    pacing_timer: Timer,
    self_weak: Mutex<Weak<CanTp>>,
}

impl CanTp {
    /// Build a CAN-TP protocol instance above `lower`, wired per [`layer::wire`].
    pub fn new(lower: Arc<dyn Layer>, pool: &'static dyn Pool, config: Config) -> Arc<CanTp> {
        let this = layer::wire(lower, |lower| CanTp {
            lower,
            upper: Mutex::new(Weak::new()),
            pool,
            config,
            sender: Mutex::new(SenderState::idle()),
            receiver: Mutex::new(ReceiverState::idle()),
            tx_ack: Event::new(),
            n_bs_timer: Timer::new(),
            n_cr_timer: Timer::new(),
            pacing_timer: Timer::new(),
            self_weak: Mutex::new(Weak::new()),
        });
        *this.self_weak.lock() = Arc::downgrade(&this);
        this
    }

    fn notify_receive(&self, msg: Msg<'static>, id: Eid) {
        if let Some(upper) = self.upper.lock().upgrade() {
            upper.receive(msg, id, false);
        }
    }

    fn notify_upper(&self, status: Status, id: Eid) {
        if let Some(upper) = self.upper.lock().upgrade() {
            upper.indication(status, id);
        }
    }

    fn send_wire(&self, id: Eid, bytes: &[u8]) -> bool {
        let mut msg = Msg::new(self.pool);
        if !msg.put(bytes) {
            return false;
        }
        self.lower.send(msg, id, false)
    }

    fn send_flow_control(&self, id: Eid, fs: u8, bs: u8, stmin_ms: u8) {
        let frame = frame::encode_fc(self.config.addressing, fs, bs, stmin_ms, self.config.zero_padding);
        self.send_wire(id, frame.as_slice());
    }

    fn weak_self(&self) -> Weak<CanTp> {
        self.self_weak.lock().clone()
    }

    fn start_n_bs(&self) {
        let weak = self.weak_self();
        self.n_bs_timer.start(N_BS, false, move || {
            if let Some(this) = weak.upgrade() {
                this.on_n_bs_timeout();
            }
        });
    }

    fn on_n_bs_timeout(&self) {
        let mut sender = self.sender.lock();
        if sender.phase == SenderPhase::Idle {
            return;
        }
        let id = sender.id;
        *sender = SenderState::idle();
        drop(sender);
        log::warn!("cantp: N_Bs expired waiting for flow control");
        self.notify_upper(Status::RxTimeout, id);
    }

    fn start_n_cr(&self) {
        let weak = self.weak_self();
        self.n_cr_timer.start(N_CR, false, move || {
            if let Some(this) = weak.upgrade() {
                this.on_n_cr_timeout();
            }
        });
    }

    fn on_n_cr_timeout(&self) {
        let mut receiver = self.receiver.lock();
        if receiver.phase == ReceiverPhase::Idle {
            return;
        }
        let id = receiver.id;
        *receiver = ReceiverState::idle();
        drop(receiver);
        log::warn!("cantp: N_Cr expired waiting for a consecutive frame");
        self.notify_upper(Status::RxTimeout, id);
    }

    fn schedule_send_cf(&self) {
        let weak = self.weak_self();
        let stmin_ms = self.sender.lock().stmin_ms;
        self.pacing_timer.start(Duration::from_millis(stmin_ms), false, move || {
            if let Some(this) = weak.upgrade() {
                this.send_cf();
            }
        });
    }

    /// Send one Consecutive Frame, gated by the bounded wait for the previous frame's `tx_done`.
    fn send_cf(&self) {
        if self.tx_ack.wait_for(N_AS) == WaitResult::Timeout {
            let id = {
                let mut sender = self.sender.lock();
                let id = sender.id;
                *sender = SenderState::idle();
                id
            };
            log::warn!("cantp: N_As expired waiting for tx_done");
            self.notify_upper(Status::TxTimeout, id);
            return;
        }
        self.tx_ack.reset();

        let (id, frame) = {
            let sender = self.sender.lock();
            if sender.phase == SenderPhase::Idle {
                return;
            }
            let cf_max = frame::cf_max_payload(self.config.addressing);
            let remaining = sender.total - sender.sent;
            let take = remaining.min(cf_max);
            let mut buf = [0u8; frame::CAN_FRAME_BYTES];
            let got = sender.pending.as_ref().expect("sending implies a pending message").get(&mut buf[..take], sender.sent);
            debug_assert_eq!(got, take);
            let frame = frame::encode_cf(self.config.addressing, sender.sn, &buf[..take], self.config.zero_padding);
            (sender.id, frame)
        };

        if !self.send_wire(id, frame.as_slice()) {
            *self.sender.lock() = SenderState::idle();
            log::warn!("cantp: lower layer rejected a consecutive frame");
            self.notify_upper(Status::TxError, id);
            return;
        }

        let mut sender = self.sender.lock();
        if sender.phase == SenderPhase::Idle {
            return; // closed/aborted while the frame was in flight
        }
        let cf_max = frame::cf_max_payload(self.config.addressing);
        let take = (sender.total - sender.sent).min(cf_max);
        sender.sent += take;
        sender.sn = sender.sn.wrapping_add(1) & 0x0F;

        if sender.sent >= sender.total {
            *sender = SenderState::idle();
            drop(sender);
            self.notify_upper(Status::TxDone, id);
            return;
        }

        sender.bs_count += 1;
        if sender.bs != 0 && sender.bs_count >= sender.bs {
            sender.bs_count = 0;
            sender.phase = SenderPhase::WaitFc;
            drop(sender);
            self.start_n_bs();
        } else {
            drop(sender);
            self.schedule_send_cf();
        }
    }

    fn on_flow_control(&self, id: Eid, fs: u8, bs: u8, stmin_ms: u8) {
        {
            let sender = self.sender.lock();
            if sender.phase != SenderPhase::WaitFc || sender.id != id {
                log::debug!("cantp: flow control received with no sender awaiting it");
                return;
            }
        }
        self.n_bs_timer.stop();

        match fs {
            frame::FS_CTS => {
                {
                    let mut sender = self.sender.lock();
                    sender.bs = bs;
                    sender.stmin_ms = stmin_ms as u64;
                    sender.bs_count = 0;
                }
                self.schedule_send_cf();
            }
            frame::FS_WAIT => self.start_n_bs(),
            _ => {
                let id = {
                    let mut sender = self.sender.lock();
                    let id = sender.id;
                    *sender = SenderState::idle();
                    id
                };
                log::debug!("cantp: flow control overflow, aborting send");
                self.notify_upper(Status::TxError, id);
            }
        }
    }

    fn deliver_single_frame(&self, id: Eid, payload: &[u8]) {
        let mut msg = Msg::new(self.pool);
        if !msg.put(payload) {
            log::warn!("cantp: pool exhausted delivering a single frame");
            self.notify_upper(Status::RxOverrun, id);
            return;
        }
        self.notify_receive(msg, id);
    }

    fn on_first_frame(&self, id: Eid, dl: usize, payload: &[u8]) {
        let ff_min = frame::ff_first_payload_len(self.config.addressing);
        if dl < ff_min + 2 {
            log::debug!("cantp: first frame DL {dl} too small, should have been a single frame");
            self.notify_upper(Status::RxError, id);
            return;
        }
        if dl > self.config.max_dl {
            if self.config.send_overflow_fc {
                self.send_flow_control(id, frame::FS_OVERFLOW, 0, 0);
            }
            log::debug!("cantp: first frame DL {dl} exceeds MAX_DL {}", self.config.max_dl);
            self.notify_upper(Status::RxError, id);
            return;
        }

        let mut buffer = Msg::new(self.pool);
        let take = payload.len().min(dl);
        if !buffer.put(&payload[..take]) {
            log::warn!("cantp: pool exhausted reassembling a first frame");
            self.notify_upper(Status::RxOverrun, id);
            return;
        }

        *self.receiver.lock() = ReceiverState {
            phase: ReceiverPhase::Receiving,
            id,
            buffer: Some(buffer),
            expected_sn: 1,
            dl,
            bs_count: 0,
        };

        self.send_flow_control(id, frame::FS_CTS, self.config.bs, self.config.stmin_ms());
        self.start_n_cr();
    }

    fn on_consecutive_frame(&self, id: Eid, sn: u8, payload: &[u8]) {
        self.n_cr_timer.stop();

        let mut receiver = self.receiver.lock();
        if receiver.phase != ReceiverPhase::Receiving {
            drop(receiver);
            log::debug!("cantp: consecutive frame with no active reassembly");
            self.notify_upper(Status::RxError, id);
            return;
        }
        if sn != receiver.expected_sn {
            *receiver = ReceiverState::idle();
            drop(receiver);
            log::debug!("cantp: consecutive frame sequence number mismatch");
            self.notify_upper(Status::RxError, id);
            return;
        }

        let dl = receiver.dl;
        let remaining = dl - receiver.buffer.as_ref().unwrap().size();
        let take = payload.len().min(remaining);
        if !receiver.buffer.as_mut().unwrap().put(&payload[..take]) {
            let id = receiver.id;
            *receiver = ReceiverState::idle();
            drop(receiver);
            log::warn!("cantp: pool exhausted reassembling a consecutive frame");
            self.notify_upper(Status::RxOverrun, id);
            return;
        }
        receiver.expected_sn = receiver.expected_sn.wrapping_add(1) & 0x0F;

        if receiver.buffer.as_ref().unwrap().size() >= dl {
            let delivered = receiver.buffer.take().unwrap();
            *receiver = ReceiverState::idle();
            drop(receiver);
            self.notify_receive(delivered, id);
            return;
        }

        receiver.bs_count += 1;
        let emit_fc = self.config.bs != 0 && receiver.bs_count >= self.config.bs;
        if emit_fc {
            receiver.bs_count = 0;
        }
        drop(receiver);

        if emit_fc {
            self.send_flow_control(id, frame::FS_CTS, self.config.bs, self.config.stmin_ms());
        }
        self.start_n_cr();
    }
}

impl Layer for CanTp {
    fn open(&self, address: Option<Eid>, id: Eid) -> bool {
        if self.upper.lock().upgrade().is_none() {
            log::warn!("cantp: refusing to open with no upper wired");
            return false;
        }
        self.lower.open(address, id)
    }

    fn close(&self, id: Eid) {
        self.n_bs_timer.stop();
        self.n_cr_timer.stop();
        self.pacing_timer.stop();
        self.tx_ack.set();
        *self.sender.lock() = SenderState::idle();
        *self.receiver.lock() = ReceiverState::idle();
        self.lower.close(id);
    }

    fn send(&self, mut msg: Msg<'static>, id: Eid, _more: bool) -> bool {
        {
            let sender = self.sender.lock();
            if sender.phase != SenderPhase::Idle {
                return false;
            }
        }

        let size = msg.size();
        if size == 0 || size > self.config.max_dl {
            return false;
        }

        if size <= frame::sf_max_payload(self.config.addressing) {
            let mut buf = [0u8; frame::CAN_FRAME_BYTES];
            let n = msg.get(&mut buf, 0);
            return match frame::encode_sf(self.config.addressing, &buf[..n], self.config.zero_padding) {
                Some(frame) => self.send_wire(id, frame.as_slice()),
                None => false,
            };
        }

        let first_len = frame::ff_first_payload_len(self.config.addressing);
        let mut first = [0u8; frame::CAN_FRAME_BYTES];
        let got = msg.get(&mut first[..first_len], 0);
        debug_assert_eq!(got, first_len);
        let ff = frame::encode_ff(self.config.addressing, size, &first[..first_len], self.config.zero_padding);
        if !self.send_wire(id, ff.as_slice()) {
            return false;
        }

        *self.sender.lock() = SenderState {
            phase: SenderPhase::WaitFc,
            id,
            pending: Some(msg),
            sn: 1,
            sent: first_len,
            total: size,
            bs: 0,
            stmin_ms: 0,
            bs_count: 0,
        };
        self.start_n_bs();
        true
    }

    fn set_upper(&self, upper: Weak<dyn Upper>) {
        *self.upper.lock() = upper;
    }
}

impl Upper for CanTp {
    fn receive(&self, msg: Msg<'static>, id: Eid, _more: bool) {
        let mut buf = [0u8; frame::CAN_FRAME_BYTES];
        let n = msg.get(&mut buf, 0);
        drop(msg);

        match frame::decode(self.config.addressing, &buf[..n]) {
            Ok(Decoded::Single { payload }) => self.deliver_single_frame(id, payload),
            Ok(Decoded::First { dl, payload }) => self.on_first_frame(id, dl, payload),
            Ok(Decoded::Consecutive { sn, payload }) => self.on_consecutive_frame(id, sn, payload),
            Ok(Decoded::FlowControl { fs, bs, stmin_ms }) => self.on_flow_control(id, fs, bs, stmin_ms),
            Err(DecodeError::AddressMismatch) => {}
            Err(DecodeError::Malformed) => {
                log::debug!("cantp: malformed frame discarded");
                self.notify_upper(Status::RxError, id);
            }
        }
    }

    fn indication(&self, status: Status, id: Eid) {
        match status {
            Status::TxDone => self.tx_ack.set(),
            Status::TxError => {
                let aborted = {
                    let mut sender = self.sender.lock();
                    if sender.phase == SenderPhase::Idle {
                        false
                    } else {
                        *sender = SenderState::idle();
                        true
                    }
                };
                if aborted {
                    self.notify_upper(Status::TxError, id);
                }
            }
            other => self.notify_upper(other, id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{leaked_pool, Bus, RecordingCommunicator};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration as StdDuration;

    fn normal_config(max_dl: usize) -> Config {
        Config {
            stmin: StdDuration::from_millis(1),
            bs: 3,
            max_dl,
            addressing: Addressing::Normal,
            zero_padding: false,
            send_overflow_fc: false,
        }
    }

    #[test]
    fn single_frame_emit_matches_concrete_scenario() {
        let pool = leaked_pool::<64, 64>();
        let lower = RecordingCommunicator::new(pool);
        let stack = CanTp::new(lower.clone(), pool, normal_config(4095).validate().unwrap());

        let mut msg = Msg::new(pool);
        msg.put(&[1, 5, 9]);
        assert!(stack.send(msg, Eid::ANY, false));

        let sent = lower.take_sent();
        assert_eq!(sent, vec![vec![0x03, 0x01, 0x05, 0x09]]);
    }

    #[test]
    fn first_frame_then_flow_control_emits_consecutive_frame() {
        let pool = leaked_pool::<64, 64>();
        let lower = RecordingCommunicator::new(pool);
        let stack = CanTp::new(lower.clone(), pool, normal_config(4095).validate().unwrap());

        let payload: Vec<u8> = (1u8..=8).collect();
        let mut msg = Msg::new(pool);
        msg.put(&payload);
        assert!(stack.send(msg, Eid::ANY, false));

        let sent = lower.take_sent();
        assert_eq!(sent, vec![vec![0x10, 0x08, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06]]);

        lower.inject(&[0x30, 0x00, 0x00], Eid::ANY);
        thread::sleep(StdDuration::from_millis(30));

        let sent = lower.take_sent();
        assert_eq!(sent, vec![vec![0x21, 0x07, 0x08]]);
    }

    #[test]
    fn wrong_sequence_number_aborts_reassembly_with_rx_error() {
        let pool = leaked_pool::<64, 64>();
        let lower = RecordingCommunicator::new(pool);
        let received = Arc::new(Mutex::new(Vec::new()));
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let stack = CanTp::new(lower.clone(), pool, normal_config(4095).validate().unwrap());

        struct Capture {
            received: Arc<Mutex<Vec<Vec<u8>>>>,
            statuses: Arc<Mutex<Vec<Status>>>,
        }
        impl Upper for Capture {
            fn receive(&self, msg: Msg<'static>, _id: Eid, _more: bool) {
                let mut buf = vec![0u8; msg.size()];
                msg.get(&mut buf, 0);
                self.received.lock().push(buf);
            }
            fn indication(&self, status: Status, _id: Eid) {
                self.statuses.lock().push(status);
            }
        }
        let capture: Arc<Capture> = Arc::new(Capture { received: received.clone(), statuses: statuses.clone() });
        stack.set_upper(Arc::downgrade(&capture) as Weak<dyn Upper>);

        let payload: Vec<u8> = (1u8..=6).collect();
        lower.inject(&[0x10, 0x08, payload[0], payload[1], payload[2], payload[3], payload[4], payload[5]], Eid::ANY);
        // Correct first CF would carry SN=1; send SN=2 instead.
        lower.inject(&[0x22, 7, 8], Eid::ANY);

        assert!(received.lock().is_empty());
        assert_eq!(statuses.lock().last(), Some(&Status::RxError));
    }

    #[test]
    fn loopback_transfers_a_large_payload_and_returns_pool_to_baseline() {
        crate::testutil::init_logging();
        let pool = leaked_pool::<256, 64>();
        let bus = Bus::new(pool);

        let config = Config {
            stmin: StdDuration::from_millis(1),
            bs: 3,
            max_dl: 4095,
            addressing: Addressing::Normal,
            zero_padding: false,
            send_overflow_fc: false,
        }
        .validate()
        .unwrap();

        let stack_a = CanTp::new(bus.a.clone(), pool, config);
        let stack_b = CanTp::new(bus.b.clone(), pool, config);

        let received: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
        struct Sink(Arc<Mutex<Option<Vec<u8>>>>);
        impl Upper for Sink {
            fn receive(&self, msg: Msg<'static>, _id: Eid, _more: bool) {
                let mut buf = vec![0u8; msg.size()];
                msg.get(&mut buf, 0);
                *self.0.lock() = Some(buf);
            }
            fn indication(&self, _status: Status, _id: Eid) {}
        }
        let sink = Arc::new(Sink(received.clone()));
        stack_b.set_upper(Arc::downgrade(&sink) as Weak<dyn Upper>);

        let baseline = pool.used_pages();
        let payload: Vec<u8> = (0u8..=255u8).cycle().take(1000).collect();
        let mut msg = Msg::new(pool);
        msg.put(&payload);
        assert!(stack_a.send(msg, Eid::ANY, false));

        let stop = Arc::new(AtomicBool::new(false));
        let pump_bus = &bus;
        thread::scope(|scope| {
            let stop_flag = stop.clone();
            scope.spawn(move || {
                while !stop_flag.load(Ordering::Relaxed) {
                    pump_bus.pump(Eid::ANY);
                    thread::sleep(StdDuration::from_millis(2));
                }
            });

            let deadline = std::time::Instant::now() + StdDuration::from_secs(5);
            while received.lock().is_none() && std::time::Instant::now() < deadline {
                thread::sleep(StdDuration::from_millis(5));
            }
            stop.store(true, Ordering::Relaxed);
        });

        assert_eq!(received.lock().as_deref(), Some(payload.as_slice()));

        let deadline = std::time::Instant::now() + StdDuration::from_secs(1);
        while pool.used_pages() > baseline && std::time::Instant::now() < deadline {
            thread::sleep(StdDuration::from_millis(10));
        }
        assert_eq!(pool.used_pages(), baseline);
    }
}
