use std::time::Duration;
use tokio::time::Instant;

use crate::seq::SeqNr;
use crate::wire::Message;

/// Why a unit is due for retransmission. Kept on the unit so the engine can
///  attribute the resend in its metrics.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ResendReason {
    /// the retransmission timeout elapsed without an ack
    Rto,
    /// the peer explicitly asked for the unit again
    Nack,
    /// enough acks for later units arrived while this one stayed outstanding
    FastAck,
}

/// A batch of outbound messages travelling under a single sequence number.
///
/// A unit is created when the flush drains the send queue, then lives in the
///  send window until it is acknowledged and compacted away. Every (re)send
///  assigns a fresh sequence number; the retransmission bookkeeping
///  (attempt count, current timeout, duplicate-ack count) stays with the unit
///  across those moves.
pub struct SendUnit {
    messages: Vec<Message>,
    encoded_len: usize,

    assigned_seq: SeqNr,
    attempt_count: u32,
    current_rto: Duration,
    last_send_time: Option<Instant>,
    next_timeout: Option<Instant>,
    fast_ack_count: u32,
    acknowledged: bool,
    due: Option<ResendReason>,
}

impl SendUnit {
    pub fn new(first_message: Message) -> SendUnit {
        let encoded_len = first_message.encoded_len();
        SendUnit {
            messages: vec![first_message],
            encoded_len,
            assigned_seq: SeqNr::ZERO,
            attempt_count: 0,
            current_rto: Duration::ZERO,
            last_send_time: None,
            next_timeout: None,
            fast_ack_count: 0,
            acknowledged: false,
            due: None,
        }
    }

    pub fn append(&mut self, message: Message) {
        self.encoded_len += message.encoded_len();
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn encoded_len(&self) -> usize {
        self.encoded_len
    }

    pub fn assigned_seq(&self) -> SeqNr {
        self.assigned_seq
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn current_rto(&self) -> Duration {
        self.current_rto
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged
    }

    pub fn due_reason(&self) -> Option<ResendReason> {
        self.due
    }

    /// Bookkeeping for a (re)send. The first send establishes the timeout from
    ///  the freshly sampled RTO plus a fixed slack so the very first round trip
    ///  is not cut short; resends keep whatever `current_rto` has grown to.
    pub fn mark_sent(&mut self, seq: SeqNr, initial_rto: Duration, now: Instant) {
        self.assigned_seq = seq;
        self.attempt_count += 1;
        if self.attempt_count == 1 {
            self.current_rto = initial_rto;
        }
        self.last_send_time = Some(now);
        self.next_timeout = Some(now + self.current_rto);
        self.fast_ack_count = 0;
        self.due = None;
    }

    pub fn mark_acknowledged(&mut self) {
        self.acknowledged = true;
    }

    /// An ack range confirmed a later unit while this one is still outstanding.
    pub fn register_fast_ack(&mut self) {
        self.fast_ack_count += 1;
    }

    /// The peer NACK'ed this unit: due immediately, `current_rto` untouched.
    pub fn mark_nacked(&mut self) {
        self.due = Some(ResendReason::Nack);
    }

    /// Periodic timeout check. An RTO expiry grows the timeout linearly
    ///  (`current_rto += rx_rto`) so bursty loss does not starve the flow the
    ///  way exponential backoff would.
    pub fn tick(&mut self, rx_rto: Duration, fast_resend_threshold: u32, now: Instant) {
        if self.due.is_some() {
            return;
        }
        if let Some(next_timeout) = self.next_timeout {
            if now >= next_timeout {
                self.current_rto += rx_rto;
                self.due = Some(ResendReason::Rto);
                return;
            }
        }
        if self.fast_ack_count >= fast_resend_threshold {
            self.due = Some(ResendReason::FastAck);
        }
    }

    /// Round-trip time observed for the most recent transmission.
    pub fn rtt_sample(&self, now: Instant) -> Duration {
        match self.last_send_time {
            Some(last_send_time) => now.saturating_duration_since(last_send_time),
            None => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rstest::*;
    use crate::wire::Reliability;

    fn message(payload: &[u8]) -> Message {
        Message {
            reliability: Reliability::Reliable,
            ordering: None,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn test_append_tracks_encoded_len() {
        let mut unit = SendUnit::new(message(&[1, 2, 3]));
        assert_eq!(unit.encoded_len(), 6);
        unit.append(message(&[4]));
        assert_eq!(unit.encoded_len(), 10);
        assert_eq!(unit.messages().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_send_uses_initial_rto() {
        let mut unit = SendUnit::new(message(&[1]));
        let now = Instant::now();

        unit.mark_sent(SeqNr::from_raw(7), Duration::from_millis(400), now);

        assert_eq!(unit.assigned_seq(), SeqNr::from_raw(7));
        assert_eq!(unit.attempt_count(), 1);
        assert_eq!(unit.current_rto(), Duration::from_millis(400));
        assert_eq!(unit.due_reason(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rto_expiry_marks_due_and_grows_linearly() {
        let mut unit = SendUnit::new(message(&[1]));
        let start = Instant::now();
        unit.mark_sent(SeqNr::from_raw(0), Duration::from_millis(250), start);

        unit.tick(Duration::from_millis(300), 3, start + Duration::from_millis(249));
        assert_eq!(unit.due_reason(), None);

        unit.tick(Duration::from_millis(300), 3, start + Duration::from_millis(250));
        assert_eq!(unit.due_reason(), Some(ResendReason::Rto));
        assert_eq!(unit.current_rto(), Duration::from_millis(550));

        // the resend resets the due marker and keeps the grown timeout
        unit.mark_sent(SeqNr::from_raw(5), Duration::from_millis(999), start + Duration::from_millis(260));
        assert_eq!(unit.attempt_count(), 2);
        assert_eq!(unit.current_rto(), Duration::from_millis(550));
        assert_eq!(unit.due_reason(), None);
    }

    #[rstest]
    #[case::below_threshold(2, None)]
    #[case::at_threshold(3, Some(ResendReason::FastAck))]
    #[case::above_threshold(5, Some(ResendReason::FastAck))]
    #[tokio::test(start_paused = true)]
    async fn test_fast_ack_threshold(#[case] fast_acks: u32, #[case] expected: Option<ResendReason>) {
        let mut unit = SendUnit::new(message(&[1]));
        let start = Instant::now();
        unit.mark_sent(SeqNr::from_raw(0), Duration::from_millis(250), start);

        for _ in 0..fast_acks {
            unit.register_fast_ack();
        }
        unit.tick(Duration::from_millis(300), 3, start + Duration::from_millis(1));

        assert_eq!(unit.due_reason(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nack_does_not_grow_rto() {
        let mut unit = SendUnit::new(message(&[1]));
        let start = Instant::now();
        unit.mark_sent(SeqNr::from_raw(0), Duration::from_millis(250), start);

        unit.mark_nacked();
        assert_eq!(unit.due_reason(), Some(ResendReason::Nack));
        assert_eq!(unit.current_rto(), Duration::from_millis(250));

        // a later tick must not overwrite the nack attribution or grow the rto
        unit.tick(Duration::from_millis(300), 3, start + Duration::from_millis(500));
        assert_eq!(unit.due_reason(), Some(ResendReason::Nack));
        assert_eq!(unit.current_rto(), Duration::from_millis(250));
    }
}
