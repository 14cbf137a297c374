use std::fmt::{Display, Formatter};

/// An 8-bit wrapping sequence number. Control and data segments share a single
/// sequence space per sender.
///
/// There is deliberately no `Ord` implementation: with a wrapping counter the
/// notion of "ahead" only makes sense relative to another number, using the
/// half-space rule - `a` is ahead of `b` iff `(a - b) mod 256 < 128` and
/// `a != b`. All comparisons go through [`SeqNum::follows`] / [`SeqNum::at_or_before`].
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SeqNum(u8);

impl Display for SeqNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SeqNum {
    pub const ZERO: SeqNum = SeqNum(0);

    pub fn from_raw(value: u8) -> Self {
        Self(value)
    }

    pub fn to_raw(self) -> u8 {
        self.0
    }

    pub fn next(self) -> SeqNum {
        SeqNum(self.0.wrapping_add(1))
    }

    pub fn prev(self) -> SeqNum {
        SeqNum(self.0.wrapping_sub(1))
    }

    /// number of increments from `other` to `self`, wrapping
    pub fn distance_from(self, other: SeqNum) -> u8 {
        self.0.wrapping_sub(other.0)
    }

    /// true iff `self` is strictly ahead of `other` in wrap-aware order
    pub fn follows(self, other: SeqNum) -> bool {
        self != other && self.distance_from(other) < 128
    }

    /// true iff `self` is at or behind `other` in wrap-aware order
    pub fn at_or_before(self, other: SeqNum) -> bool {
        !self.follows(other)
    }
}
