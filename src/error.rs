use thiserror::Error;

/// Error taxonomy of the reliability engine.
///
/// Only [TransportError::ExcessiveLoss], [TransportError::RetransmissionExhausted]
///  and [TransportError::MalformedWireData] are fatal: they tear the connection
///  down and are reported to the application exactly once. [TransportError::WindowFull]
///  is local backpressure and never leaves the engine; duplicate data units and
///  stale acks are not errors at all and are handled silently.
#[derive(Debug, Error)]
pub enum TransportError {
    /// the send window holds as many units as it has capacity for; the caller
    ///  must leave its data queued until acks free up space
    #[error("send window is full")]
    WindowFull,

    /// a requested window range is not covered by `[first, next)`
    #[error("requested range [{begin}, {bound}) is outside the window")]
    OutOfRange { begin: u32, bound: u32 },

    /// the ordered-delivery buffer for a channel exceeded the configured loss
    ///  bound - the gap is presumed unrecoverable
    #[error("too many buffered out-of-order messages on ordering channel {channel}")]
    ExcessiveLoss { channel: u8 },

    /// a unit reached the retransmission bound without being acknowledged
    #[error("message unacknowledged after {attempts} transmissions")]
    RetransmissionExhausted { attempts: u32 },

    /// structurally invalid inbound data; the framing of the stream can no
    ///  longer be trusted
    #[error("malformed wire data")]
    MalformedWireData(#[source] anyhow::Error),
}
