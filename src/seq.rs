use std::fmt::{Display, Formatter};

/// A 24-bit wrap-around sequence number, the unit of accounting for datagrams
///  and ordered-delivery indexes.
///
/// All ordering decisions must go through [SeqNr::delta] / [SeqNr::between]:
///  raw comparison of two sequence numbers is meaningless once the space has
///  wrapped.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct SeqNr(u32);

impl Display for SeqNr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SeqNr {
    pub const MAX_VALUE: u32 = (1 << 24) - 1;
    /// half the sequence space - deltas above this mean "logically before"
    pub const HALF_SPAN: u32 = 1 << 23;

    pub const ZERO: SeqNr = SeqNr(0);
    pub const MAX: SeqNr = SeqNr(Self::MAX_VALUE);

    pub fn from_raw(value: u32) -> SeqNr {
        SeqNr(value & Self::MAX_VALUE)
    }

    pub fn to_raw(self) -> u32 {
        self.0
    }

    /// Modular add; negative deltas walk backwards through the space.
    pub fn add(self, delta: i32) -> SeqNr {
        SeqNr(self.0.wrapping_add(delta as u32) & Self::MAX_VALUE)
    }

    /// Non-negative circular distance from `self` to `later`, assuming `later`
    ///  occurs at or after `self`. Always in `[0, 2^24)`.
    pub fn delta(self, later: SeqNr) -> u32 {
        later.0.wrapping_sub(self.0) & Self::MAX_VALUE
    }

    /// True iff `value` lies in the circular interval `[low, bound)`. A value
    ///  equal to `low` is always inside.
    pub fn between(low: SeqNr, bound: SeqNr, value: SeqNr) -> bool {
        value == low || low.delta(value) < low.delta(bound)
    }

    /// True iff `self` is logically after `other`, i.e. the distance from
    ///  `other` forward to `self` is non-zero and at most half the space.
    pub fn is_after(self, other: SeqNr) -> bool {
        let d = other.delta(self);
        d != 0 && d <= Self::HALF_SPAN
    }
}

/// Finite iterator over the sequence numbers in `[begin, bound)` in circular
///  order. Not restartable.
pub struct SeqRange {
    next: SeqNr,
    bound: SeqNr,
}

impl SeqRange {
    pub fn new(begin: SeqNr, bound: SeqNr) -> SeqRange {
        SeqRange { next: begin, bound }
    }
}

impl Iterator for SeqRange {
    type Item = SeqNr;

    fn next(&mut self) -> Option<SeqNr> {
        if self.next.delta(self.bound) < 1 {
            return None;
        }
        let id = self.next;
        self.next = self.next.add(1);
        Some(id)
    }
}
