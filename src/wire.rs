use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use crate::seq::SeqNr;

/// Number of ordered-delivery channels per connection. This is a protocol
///  constant, not a tunable.
pub const ORDERING_CHANNELS: u8 = 8;

/// Leading byte of a sequenced data datagram. Decoding accepts the whole
///  `0x80..=0x8f` range the protocol family reserves for data.
pub const KIND_DATA: u8 = 0x80;
pub const KIND_ACK: u8 = 0xc0;
pub const KIND_NACK: u8 = 0xa0;

fn put_u24_le(buf: &mut BytesMut, value: SeqNr) {
    buf.put_uint_le(value.to_raw() as u64, 3);
}

fn try_get_u24_le(buf: &mut impl Buf) -> anyhow::Result<SeqNr> {
    if buf.remaining() < 3 {
        bail!("buffer too short for a sequence number");
    }
    Ok(SeqNr::from_raw(buf.get_uint_le(3) as u32))
}

/// Delivery contract of a single encapsulated message. The protocol's message
///  set is closed, so this is an enum rather than an open registry.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Reliability {
    Unreliable = 0,
    Reliable = 2,
    ReliableOrdered = 3,
}

impl Reliability {
    fn from_flags(flags: u8) -> anyhow::Result<Reliability> {
        match flags >> 5 {
            0 => Ok(Reliability::Unreliable),
            2 => Ok(Reliability::Reliable),
            3 => Ok(Reliability::ReliableOrdered),
            other => bail!("unsupported reliability {}", other),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MessageOrdering {
    pub channel: u8,
    pub order_index: SeqNr,
}

/// One application message as carried inside a data unit. Each record
///  self-describes its length and flags, so a data unit is decoded by
///  consuming records until the buffer is exhausted.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Message {
    pub reliability: Reliability,
    /// present iff `reliability` is [Reliability::ReliableOrdered]
    pub ordering: Option<MessageOrdering>,
    pub payload: Bytes,
}

impl Message {
    const FLAGS_LEN: usize = 1;
    const LENGTH_LEN: usize = 2;
    const ORDERING_LEN: usize = 4;

    /// Encoded record size, the quantity batching is budgeted in.
    pub fn encoded_len(&self) -> usize {
        let ordering_len = if self.ordering.is_some() { Self::ORDERING_LEN } else { 0 };
        Self::FLAGS_LEN + Self::LENGTH_LEN + ordering_len + self.payload.len()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8((self.reliability as u8) << 5);
        buf.put_u16(self.payload.len() as u16);
        if let Some(ordering) = &self.ordering {
            put_u24_le(buf, ordering.order_index);
            buf.put_u8(ordering.channel);
        }
        buf.put_slice(&self.payload);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Message> {
        let reliability = Reliability::from_flags(buf.try_get_u8()?)?;
        let payload_len = buf.try_get_u16()? as usize;

        let ordering = if reliability == Reliability::ReliableOrdered {
            let order_index = try_get_u24_le(buf)?;
            let channel = buf.try_get_u8()?;
            if channel >= ORDERING_CHANNELS {
                bail!("ordering channel {} out of range", channel);
            }
            Some(MessageOrdering { channel, order_index })
        }
        else {
            None
        };

        if buf.remaining() < payload_len {
            bail!("message record declares {} payload bytes, {} available", payload_len, buf.remaining());
        }
        Ok(Message {
            reliability,
            ordering,
            payload: buf.copy_to_bytes(payload_len),
        })
    }
}

/// A sequenced data datagram: one sequence number over a batch of messages.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DataUnit {
    pub seq: SeqNr,
    pub messages: Vec<Message>,
}

impl DataUnit {
    /// Serializes a data datagram without requiring ownership of the batch -
    ///  the send path encodes straight out of the window.
    pub fn ser_slice(seq: SeqNr, messages: &[Message], buf: &mut BytesMut) {
        buf.put_u8(KIND_DATA);
        put_u24_le(buf, seq);
        for message in messages {
            message.ser(buf);
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        Self::ser_slice(self.seq, &self.messages, buf);
    }

    /// NB: expects the kind byte to be consumed already
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<DataUnit> {
        let seq = try_get_u24_le(buf)?;
        let mut messages = Vec::new();
        while buf.has_remaining() {
            messages.push(Message::deser(buf)?);
        }
        Ok(DataUnit { seq, messages })
    }
}

/// An inclusive acknowledged (or negatively acknowledged) sequence range.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct AckRange {
    pub start: SeqNr,
    pub end: SeqNr,
}

impl AckRange {
    pub fn single(seq: SeqNr) -> AckRange {
        AckRange { start: seq, end: seq }
    }
}

/// The payload of an ACK or NACK datagram: an increasing, non-overlapping list
///  of inclusive ranges.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AckRanges(pub Vec<AckRange>);

impl AckRanges {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_usize_varint(self.0.len());
        for range in &self.0 {
            put_u24_le(buf, range.start);
            put_u24_le(buf, range.end);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<AckRanges> {
        let num_ranges = buf.try_get_usize_varint()?;
        let mut ranges = Vec::with_capacity(num_ranges);
        let mut prev_end: Option<SeqNr> = None;
        for _ in 0..num_ranges {
            let start = try_get_u24_le(buf)?;
            let end = try_get_u24_le(buf)?;
            if start != end && !end.is_after(start) {
                bail!("ack range end {} before start {}", end, start);
            }
            if let Some(prev_end) = prev_end {
                if !start.is_after(prev_end) {
                    bail!("ack ranges not increasing: {} after {}", start, prev_end);
                }
            }
            prev_end = Some(end);
            ranges.push(AckRange { start, end });
        }
        Ok(AckRanges(ranges))
    }
}

/// All inbound datagram kinds the engine dispatches on.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Datagram {
    Data(DataUnit),
    Ack(AckRanges),
    Nack(AckRanges),
}

impl Datagram {
    /// Returns `Ok(None)` for an unknown kind byte - those are dropped without
    ///  tearing the connection down. Structural violations are errors.
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Option<Datagram>> {
        let kind = buf.try_get_u8()?;
        match kind {
            0x80..=0x8f => Ok(Some(Datagram::Data(DataUnit::deser(buf)?))),
            KIND_ACK => Ok(Some(Datagram::Ack(AckRanges::deser(buf)?))),
            KIND_NACK => Ok(Some(Datagram::Nack(AckRanges::deser(buf)?))),
            _ => Ok(None),
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        match self {
            Datagram::Data(data) => data.ser(buf),
            Datagram::Ack(ranges) => {
                buf.put_u8(KIND_ACK);
                ranges.ser(buf);
            }
            Datagram::Nack(ranges) => {
                buf.put_u8(KIND_NACK);
                ranges.ser(buf);
            }
        }
    }
}
