//! The closed set of status codes a lower layer may indicate upward.

/// Status codes a layer reports to the one above it via [`crate::layer::Upper::indication`].
///
/// This is a closed set by design: protocols match on it exhaustively rather than
/// treating indications as an open-ended event bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    /// The lower layer has established its connection (e.g. a communicator's link came up).
    Connected,
    /// The lower layer's connection dropped.
    Disconnected,
    /// A previously accepted `send` was put on the wire successfully.
    TxDone,
    /// A previously accepted `send` failed to transmit.
    TxError,
    /// A previously accepted `send` timed out waiting for `TxDone`.
    TxTimeout,
    /// Malformed or unexpected data was received and discarded.
    RxError,
    /// A reassembly buffer could not hold incoming data; the frame was consumed to keep sync.
    RxOverrun,
    /// A receive-side timer expired while waiting for the next expected frame.
    RxTimeout,
}

impl Status {
    /// Terminal statuses reset the protocol's per-transfer state in addition to being reported.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Disconnected | Status::TxTimeout | Status::RxTimeout)
    }
}
