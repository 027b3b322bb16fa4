//! Reliable-message transport core for the RakNet protocol family: given an
//!  unreliable, unordered datagram channel, this crate provides reliable and
//!  optionally-ordered delivery of discrete messages for one connection.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (defined-length chunks
//!   of data as opposed to streams of bytes)
//! * Delivery is acknowledged per data unit; loss is repaired by
//!   retransmission under a bounded sliding send window
//!   * negative acks ask for missing units early, duplicate acks trigger fast
//!     resends, and a periodic timer catches everything else via a smoothed
//!     RTT / RTO estimate
//!   * retransmission timeouts grow linearly rather than exponentially, so a
//!     flow under bursty loss is not starved
//! * Combine small messages into a single data unit, delaying the send
//!   operation by a fraction of the round-trip time
//!   * NB: while there are similarities to Nagle's algorithm, the negative-ack
//!     design mitigates the stacked-delay problem TCP has with slow acks
//! * Messages can be tagged for ordered delivery on one of 8 ordering
//!   channels; each channel buffers stragglers and releases contiguous
//!   prefixes, with a bounded tolerance for loss
//! * Everything outside the reliability core is a collaborator: the session
//!   handshake, MTU discovery, message fragmentation, socket I/O and timer
//!   scheduling are delegated (the engine only needs a datagram sink, a
//!   message sink and a reactor that delivers datagrams and timer callbacks on
//!   the connection's execution context)
//!
//! ## Wire formats
//!
//! All sequence numbers are 24-bit and wrap around; comparisons use circular
//!  deltas. Numbers are little-endian unless stated otherwise.
//!
//! Data datagram:
//! ```ascii
//! 0: kind (u8) - 0x80 (0x80..=0x8f accepted on decode)
//! 1: sequence number (u24)
//! 4: encapsulated message records until the end of the datagram
//! ```
//!
//! Encapsulated message record:
//! ```ascii
//! 0: flags (u8) - reliability in bits 5-7 (0 unreliable, 2 reliable,
//!     3 reliable-ordered)
//! 1: payload length (u16 BE)
//! 3: order index (u24) - only for reliability 3
//! 6: ordering channel (u8) - only for reliability 3
//! *: payload
//! ```
//!
//! ACK (kind 0xc0) and NACK (kind 0xa0) datagrams:
//! ```ascii
//! 0: kind (u8)
//! 1: number of ranges (varint)
//! *: (repeated) range start (u24), range end inclusive (u24)
//!     - ranges are increasing and non-overlapping
//! ```
//!
//! Datagrams with an unknown kind byte are dropped; structurally invalid
//!  datagrams tear the connection down, since the framing of a reliable
//!  stream cannot be trusted after a decode error.

pub mod config;
pub mod engine;
pub mod error;
pub mod message_dispatcher;
pub mod metrics;
mod reorder;
mod rtt;
mod send_unit;
mod send_window;
pub mod seq;
pub mod socket;
pub mod wire;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
