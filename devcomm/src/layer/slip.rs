//! SLIP (RFC 1055): byte-stuffed framing over a byte stream, recovering frame boundaries from an
//! otherwise unframed communicator below (a serial port, typically).

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::eid::Eid;
use crate::layer::{self, Layer, Upper};
use crate::msg::Msg;
use crate::pool::Pool;
use crate::status::Status;

const END: u8 = 0xC0;
const ESC: u8 = 0xDB;
const ESC_END: u8 = 0xDC;
const ESC_ESC: u8 = 0xDD;

fn stuff(buffer: &mut Msg<'static>, byte: u8) -> bool {
    match byte {
        END => buffer.push_back(ESC) && buffer.push_back(ESC_END),
        ESC => buffer.push_back(ESC) && buffer.push_back(ESC_ESC),
        _ => buffer.push_back(byte),
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum DecodePhase {
    Idle,
    Data,
    EscSeen,
}

struct DecodeState {
    phase: DecodePhase,
    buffer: Option<Msg<'static>>,
}

impl DecodeState {
    fn idle() -> Self {
        DecodeState { phase: DecodePhase::Idle, buffer: None }
    }
}

/// A SLIP framer sitting directly above a byte-stream communicator.
pub struct Slip {
    lower: Arc<dyn Layer>,
    upper: Mutex<Weak<dyn Upper>>,
    pool: &'static dyn Pool,
    /// The frame currently being accumulated for `send`; `None` means the next `send` must first
    /// prepend the resync `END`.
    encode: Mutex<Option<Msg<'static>>>,
    decode: Mutex<DecodeState>,
}

impl Slip {
    pub fn new(lower: Arc<dyn Layer>, pool: &'static dyn Pool) -> Arc<Slip> {
        layer::wire(lower, |lower| Slip {
            lower,
            upper: Mutex::new(Weak::new()),
            pool,
            encode: Mutex::new(None),
            decode: Mutex::new(DecodeState::idle()),
        })
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
}

impl Layer for Slip {
    fn open(&self, address: Option<Eid>, id: Eid) -> bool {
        if self.upper.lock().upgrade().is_none() {
            log::warn!("slip: refusing to open with no upper wired");
            return false;
        }
        self.lower.open(address, id)
    }

    fn close(&self, id: Eid) {
        *self.encode.lock() = None;
        *self.decode.lock() = DecodeState::idle();
        self.lower.close(id);
    }

    fn send(&self, msg: Msg<'static>, id: Eid, more: bool) -> bool {
        let mut encode = self.encode.lock();

        if encode.is_none() {
            let mut buffer = Msg::new(self.pool);
            if !buffer.push_back(END) {
                return false;
            }
            *encode = Some(buffer);
        }

        {
            let buffer = encode.as_mut().expect("just initialized above");
            for byte in msg.iter() {
                if !stuff(buffer, byte) {
                    *encode = None;
                    log::warn!("slip: pool exhausted mid-frame, discarding partial frame");
                    return false;
                }
            }
        }

        if !more {
            let mut buffer = encode.take().unwrap();
            if !buffer.push_back(END) {
                log::warn!("slip: pool exhausted terminating frame");
                return false;
            }
            drop(encode);
            return self.lower.send(buffer, id, false);
        }

        drop(encode);
        self.notify_upper(Status::TxDone, id);
        true
    }

    fn set_upper(&self, upper: Weak<dyn Upper>) {
        *self.upper.lock() = upper;
    }
}

impl Upper for Slip {
    fn receive(&self, msg: Msg<'static>, id: Eid, _more: bool) {
        let mut decode = self.decode.lock();

        for byte in msg.iter() {
            match decode.phase {
                DecodePhase::Idle => {
                    if byte == END {
                        decode.phase = DecodePhase::Data;
                        decode.buffer = Some(Msg::new(self.pool));
                    }
                }
                DecodePhase::Data => {
                    if byte == END {
                        decode.phase = DecodePhase::Idle;
                        let delivered = decode.buffer.take();
                        if let Some(buffer) = delivered {
                            if !buffer.empty() {
                                drop(decode);
                                self.notify_receive(buffer, id);
                                decode = self.decode.lock();
                            }
                        }
                    } else if byte == ESC {
                        decode.phase = DecodePhase::EscSeen;
                    } else if !decode.buffer.as_mut().unwrap().push_back(byte) {
                        log::warn!("slip: pool exhausted reassembling a frame, discarding it");
                        self.notify_upper(Status::RxOverrun, id);
                        decode.phase = DecodePhase::Idle;
                        decode.buffer = None;
                    }
                }
                DecodePhase::EscSeen => match byte {
                    ESC_END => {
                        decode.phase = DecodePhase::Data;
                        if !decode.buffer.as_mut().unwrap().push_back(END) {
                            log::warn!("slip: pool exhausted reassembling a frame, discarding it");
                            self.notify_upper(Status::RxOverrun, id);
                            decode.phase = DecodePhase::Idle;
                            decode.buffer = None;
                        }
                    }
                    ESC_ESC => {
                        decode.phase = DecodePhase::Data;
                        if !decode.buffer.as_mut().unwrap().push_back(ESC) {
                            log::warn!("slip: pool exhausted reassembling a frame, discarding it");
                            self.notify_upper(Status::RxOverrun, id);
                            decode.phase = DecodePhase::Idle;
                            decode.buffer = None;
                        }
                    }
                    _ => {
                        log::debug!("slip: invalid escape sequence, discarding frame and resyncing");
                        decode.phase = DecodePhase::Idle;
                        decode.buffer = None;
                    }
                },
            }
        }
    }

    fn indication(&self, status: Status, id: Eid) {
        self.notify_upper(status, id);
    }
}
