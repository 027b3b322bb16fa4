use rustc_hash::FxHashMap;
use tracing::trace;

use crate::error::TransportError;
use crate::seq::SeqNr;
use crate::wire::Message;

/// Ordered-delivery reassembly for one ordering channel.
///
/// Messages arrive already deduplicated at the datagram level but possibly out
///  of order; this buffers stragglers and releases the longest contiguous
///  prefix. The buffer is bounded: a gap that outlives `max_loss` buffered
///  messages is presumed unrecoverable and fatal for the connection.
pub struct OrderedReassembler {
    channel: u8,
    /// highest order index released to the application; starts one before
    ///  index 0 in the circular space
    last_delivered: SeqNr,
    buffer: FxHashMap<u32, Message>,
    max_loss: usize,
}

impl OrderedReassembler {
    pub fn new(channel: u8, max_loss: usize) -> OrderedReassembler {
        OrderedReassembler {
            channel,
            last_delivered: SeqNr::MAX,
            buffer: FxHashMap::default(),
            max_loss,
        }
    }

    /// Accepts one message and returns whatever became releasable, in order.
    pub fn submit(&mut self, order_index: SeqNr, message: Message) -> Result<Vec<Message>, TransportError> {
        if !order_index.is_after(self.last_delivered) {
            trace!("duplicate ordered message {} on channel {} - ignoring", order_index, self.channel);
            return Ok(Vec::new());
        }

        let next = self.last_delivered.add(1);
        if order_index == next && self.buffer.is_empty() {
            self.last_delivered = next;
            return Ok(vec![message]);
        }

        // re-buffering a duplicate index must not replace what is there
        self.buffer.entry(order_index.to_raw()).or_insert(message);

        let mut released = Vec::new();
        loop {
            let next = self.last_delivered.add(1);
            match self.buffer.remove(&next.to_raw()) {
                Some(message) => {
                    released.push(message);
                    self.last_delivered = next;
                }
                None => break,
            }
        }

        if self.buffer.len() > self.max_loss {
            return Err(TransportError::ExcessiveLoss { channel: self.channel });
        }
        Ok(released)
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::wire::{MessageOrdering, Reliability};

    fn message(tag: u8, order_index: u32) -> Message {
        Message {
            reliability: Reliability::ReliableOrdered,
            ordering: Some(MessageOrdering { channel: 0, order_index: SeqNr::from_raw(order_index) }),
            payload: Bytes::copy_from_slice(&[tag]),
        }
    }

    fn tags(released: &[Message]) -> Vec<u8> {
        released.iter().map(|m| m.payload[0]).collect()
    }

    #[test]
    fn test_in_order_delivery_is_immediate() {
        let mut reassembler = OrderedReassembler::new(0, 16);
        for idx in 0..5u32 {
            let released = reassembler.submit(SeqNr::from_raw(idx), message(idx as u8, idx)).unwrap();
            assert_eq!(tags(&released), vec![idx as u8]);
        }
        assert_eq!(reassembler.buffered(), 0);
    }

    #[test]
    fn test_gap_is_buffered_and_drained() {
        let mut reassembler = OrderedReassembler::new(0, 16);

        assert_eq!(tags(&reassembler.submit(SeqNr::from_raw(0), message(0, 0)).unwrap()), vec![0]);
        assert_eq!(tags(&reassembler.submit(SeqNr::from_raw(2), message(2, 2)).unwrap()), Vec::<u8>::new());
        assert_eq!(tags(&reassembler.submit(SeqNr::from_raw(1), message(1, 1)).unwrap()), vec![1, 2]);
    }

    #[test]
    fn test_resubmission_releases_at_most_once() {
        let mut reassembler = OrderedReassembler::new(0, 16);

        assert_eq!(reassembler.submit(SeqNr::from_raw(0), message(0, 0)).unwrap().len(), 1);
        assert!(reassembler.submit(SeqNr::from_raw(0), message(0, 0)).unwrap().is_empty());

        // duplicates of a still-buffered index are no-ops as well
        assert!(reassembler.submit(SeqNr::from_raw(2), message(2, 2)).unwrap().is_empty());
        assert!(reassembler.submit(SeqNr::from_raw(2), message(99, 2)).unwrap().is_empty());
        let released = reassembler.submit(SeqNr::from_raw(1), message(1, 1)).unwrap();
        assert_eq!(tags(&released), vec![1, 2]);
    }

    #[test]
    fn test_excessive_loss_is_fatal() {
        let mut reassembler = OrderedReassembler::new(3, 2);

        assert!(reassembler.submit(SeqNr::from_raw(5), message(5, 5)).unwrap().is_empty());
        assert!(reassembler.submit(SeqNr::from_raw(6), message(6, 6)).unwrap().is_empty());
        match reassembler.submit(SeqNr::from_raw(7), message(7, 7)) {
            Err(TransportError::ExcessiveLoss { channel: 3 }) => {}
            other => panic!("expected ExcessiveLoss, got {:?}", other.map(|r| r.len())),
        }
    }

    #[test]
    fn test_order_index_wraparound() {
        let mut reassembler = OrderedReassembler::new(0, 16);
        reassembler.last_delivered = SeqNr::from_raw(SeqNr::MAX_VALUE - 1);

        assert_eq!(tags(&reassembler.submit(SeqNr::MAX, message(1, SeqNr::MAX_VALUE)).unwrap()), vec![1]);
        assert_eq!(tags(&reassembler.submit(SeqNr::ZERO, message(2, 0)).unwrap()), vec![2]);
    }
}
