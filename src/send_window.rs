use crate::error::TransportError;
use crate::send_unit::SendUnit;
use crate::seq::{SeqNr, SeqRange};

/// What a window slot between `first` and `next` currently holds.
///
/// `Retired` marks a slot whose unit was moved to a later sequence number by a
///  resend: the slot keeps occupying window length until compaction reaches it,
///  but acks targeting it refer to an outdated transmission.
pub enum Slot {
    Vacant,
    Live(SendUnit),
    Retired,
}

/// Fixed-capacity circular buffer of in-flight send units, indexed by sequence
///  number modulo capacity.
///
/// Capacity is a power of two strictly greater than the configured window size
///  so that resends (which occupy a second slot while the original slot awaits
///  compaction) cannot run the buffer out of room in steady state.
pub struct SendWindow {
    slots: Vec<Slot>,
    mask: u32,
    first: SeqNr,
    next: SeqNr,
    length: u32,
}

impl SendWindow {
    pub fn new(power: u32) -> SendWindow {
        let capacity = 1u32 << power;
        assert!(capacity <= SeqNr::MAX_VALUE, "window capacity {} exceeds the sequence space", capacity);

        SendWindow {
            slots: (0..capacity).map(|_| Slot::Vacant).collect(),
            mask: capacity - 1,
            first: SeqNr::ZERO,
            next: SeqNr::ZERO,
            length: 0,
        }
    }

    fn idx(&self, seq: SeqNr) -> usize {
        (seq.to_raw() & self.mask) as usize
    }

    pub fn capacity(&self) -> u32 {
        self.mask + 1
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn is_full(&self) -> bool {
        self.length == self.capacity()
    }

    pub fn first(&self) -> SeqNr {
        self.first
    }

    pub fn next_seq(&self) -> SeqNr {
        self.next
    }

    /// Stores the unit under the next sequence number and returns it together
    ///  with a reference for the caller's send bookkeeping.
    pub fn insert(&mut self, unit: SendUnit) -> Result<(SeqNr, &mut SendUnit), TransportError> {
        if self.is_full() {
            return Err(TransportError::WindowFull);
        }
        let seq = self.next;
        let idx = self.idx(seq);
        debug_assert!(matches!(self.slots[idx], Slot::Vacant));

        self.slots[idx] = Slot::Live(unit);
        self.next = self.next.add(1);
        self.length += 1;

        match &mut self.slots[idx] {
            Slot::Live(unit) => Ok((seq, unit)),
            _ => unreachable!(),
        }
    }

    pub fn contains(&self, seq: SeqNr) -> bool {
        !self.is_empty() && SeqNr::between(self.first, self.next, seq)
    }

    pub fn get(&self, seq: SeqNr) -> Option<&SendUnit> {
        if !self.contains(seq) {
            return None;
        }
        match &self.slots[self.idx(seq)] {
            Slot::Live(unit) => Some(unit),
            _ => None,
        }
    }

    pub fn slot_mut(&mut self, seq: SeqNr) -> Option<&mut Slot> {
        if !self.contains(seq) {
            return None;
        }
        let idx = self.idx(seq);
        Some(&mut self.slots[idx])
    }

    /// Takes the live unit at `seq` out for a resend, leaving the slot retired:
    ///  the slot's logical identity has moved to whatever sequence number the
    ///  unit is sent under next.
    pub fn extract(&mut self, seq: SeqNr) -> Option<SendUnit> {
        if !self.contains(seq) {
            return None;
        }
        let idx = self.idx(seq);
        match std::mem::replace(&mut self.slots[idx], Slot::Retired) {
            Slot::Live(unit) => Some(unit),
            other => {
                self.slots[idx] = other;
                None
            }
        }
    }

    /// Lazy walk over `[begin, bound)`. Fails if `begin` is neither `first` nor
    ///  contained, or if the span reaches beyond `[first, next)`.
    pub fn range(&self, begin: SeqNr, bound: SeqNr) -> Result<WindowRange<'_>, TransportError> {
        if (begin != self.first && !self.contains(begin)) || begin.delta(bound) > begin.delta(self.next) {
            return Err(TransportError::OutOfRange { begin: begin.to_raw(), bound: bound.to_raw() });
        }
        Ok(WindowRange {
            window: self,
            ids: SeqRange::new(begin, bound),
        })
    }

    /// Compaction: advance `first` past retired slots and acknowledged units
    ///  that are still assigned to their original sequence number. Stops at the
    ///  first live, unacknowledged unit.
    pub fn reclaim_prefix(&mut self) {
        loop {
            if self.is_empty() {
                return;
            }
            let idx = self.idx(self.first);
            let reclaim = match &self.slots[idx] {
                Slot::Vacant => false,
                Slot::Retired => true,
                Slot::Live(unit) => unit.is_acknowledged() && unit.assigned_seq() == self.first,
            };
            if !reclaim {
                return;
            }
            self.slots[idx] = Slot::Vacant;
            self.first = self.first.add(1);
            self.length -= 1;
        }
    }

    /// Full reset on connection teardown.
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            *slot = Slot::Vacant;
        }
        self.first = SeqNr::ZERO;
        self.next = SeqNr::ZERO;
        self.length = 0;
    }
}

pub struct WindowRange<'a> {
    window: &'a SendWindow,
    ids: SeqRange,
}

impl<'a> Iterator for WindowRange<'a> {
    type Item = (SeqNr, &'a Slot);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.ids.next()?;
        Some((id, &self.window.slots[self.window.idx(id)]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rstest::*;
    use tokio::time::Instant;
    use std::time::Duration;
    use crate::wire::{Message, Reliability};

    fn unit() -> SendUnit {
        SendUnit::new(Message {
            reliability: Reliability::Reliable,
            ordering: None,
            payload: Bytes::from_static(&[42]),
        })
    }

    fn insert_sent(window: &mut SendWindow) -> SeqNr {
        let (seq, unit) = window.insert(unit()).unwrap();
        unit.mark_sent(seq, Duration::from_millis(300), Instant::now());
        seq
    }

    #[test]
    fn test_full_window_rejects_insert() {
        let mut window = SendWindow::new(7);
        assert_eq!(window.capacity(), 128);

        for _ in 0..128 {
            insert_sent(&mut window);
        }
        assert!(window.is_full());
        assert!(matches!(window.insert(unit()), Err(TransportError::WindowFull)));
    }

    #[test]
    fn test_length_equals_cursor_delta() {
        let mut window = SendWindow::new(4);

        for round in 0..50 {
            insert_sent(&mut window);
            assert_eq!(window.length(), window.first().delta(window.next_seq()));
            assert!(window.length() <= window.capacity());

            if round % 2 == 0 {
                match window.slot_mut(window.first()).unwrap() {
                    Slot::Live(unit) => unit.mark_acknowledged(),
                    _ => panic!("head slot should be live"),
                }
                window.reclaim_prefix();
                assert_eq!(window.length(), window.first().delta(window.next_seq()));
            }
        }
    }

    #[test]
    fn test_contains() {
        let mut window = SendWindow::new(4);
        assert!(!window.contains(SeqNr::ZERO));

        let seq = insert_sent(&mut window);
        assert!(window.contains(seq));
        assert!(!window.contains(seq.add(1)));
        assert!(!window.contains(seq.add(-1)));
    }

    #[test]
    fn test_reclaim_stops_at_live_unacknowledged_head() {
        let mut window = SendWindow::new(4);
        let head = insert_sent(&mut window);
        insert_sent(&mut window);

        window.reclaim_prefix();
        assert_eq!(window.first(), head);
        assert_eq!(window.length(), 2);
    }

    #[test]
    fn test_reclaim_passes_acknowledged_and_retired_slots() {
        let mut window = SendWindow::new(4);
        let first = insert_sent(&mut window);
        let second = insert_sent(&mut window);
        let third = insert_sent(&mut window);

        match window.slot_mut(first).unwrap() {
            Slot::Live(unit) => unit.mark_acknowledged(),
            _ => panic!(),
        }
        // a resend moves the second unit to a new slot, retiring its old one
        let moved = window.extract(second).unwrap();
        let (new_seq, new_slot) = window.insert(moved).unwrap();
        new_slot.mark_sent(new_seq, Duration::from_millis(300), Instant::now());

        window.reclaim_prefix();
        assert_eq!(window.first(), third);
        assert_eq!(window.length(), 2);
    }

    #[rstest]
    #[case::full_span(0, 3, Some(vec![0, 1, 2]))]
    #[case::prefix(0, 2, Some(vec![0, 1]))]
    #[case::suffix(1, 3, Some(vec![1, 2]))]
    #[case::empty_at_first(0, 0, Some(vec![]))]
    #[case::beyond_next(0, 4, None)]
    #[case::begin_outside(5, 6, None)]
    fn test_range(#[case] begin: u32, #[case] bound: u32, #[case] expected: Option<Vec<u32>>) {
        let mut window = SendWindow::new(4);
        for _ in 0..3 {
            insert_sent(&mut window);
        }

        let actual = window
            .range(SeqNr::from_raw(begin), SeqNr::from_raw(bound))
            .map(|range| range.map(|(seq, _)| seq.to_raw()).collect::<Vec<_>>());
        match expected {
            Some(expected) => assert_eq!(actual.unwrap(), expected),
            None => assert!(matches!(actual, Err(TransportError::OutOfRange { .. }))),
        }
    }

    #[test]
    fn test_reset() {
        let mut window = SendWindow::new(4);
        for _ in 0..5 {
            insert_sent(&mut window);
        }

        window.reset();
        assert!(window.is_empty());
        assert_eq!(window.first(), SeqNr::ZERO);
        assert_eq!(window.next_seq(), SeqNr::ZERO);
    }
}
