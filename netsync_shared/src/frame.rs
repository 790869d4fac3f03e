//! Frame indices and stored per-frame inputs.

use crate::bit_array::BitArray;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Sub};

/// Monotone counter identifying one fixed-step tick of one peer's input
/// stream.
///
/// `NONE` is a reserved sentinel (the maximum value), so the plain integer
/// ordering makes it compare greater than every real index. Arithmetic
/// saturates only at `NONE`: adding to or subtracting from `NONE` yields
/// `NONE`, and a subtraction below zero clamps to zero.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct FrameIndex(pub u32);

impl FrameIndex {
    pub const NONE: FrameIndex = FrameIndex(u32::MAX);
    pub const ZERO: FrameIndex = FrameIndex(0);

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }

    /// Absolute distance between two real indices.
    pub fn distance(self, other: FrameIndex) -> u32 {
        (i64::from(self.0) - i64::from(other.0)).unsigned_abs() as u32
    }
}

impl Add<u32> for FrameIndex {
    type Output = FrameIndex;

    fn add(self, rhs: u32) -> FrameIndex {
        if self.is_none() {
            return FrameIndex::NONE;
        }
        match self.0.checked_add(rhs) {
            Some(v) if v != u32::MAX => FrameIndex(v),
            _ => FrameIndex::NONE,
        }
    }
}

impl AddAssign<u32> for FrameIndex {
    fn add_assign(&mut self, rhs: u32) {
        *self = *self + rhs;
    }
}

impl Sub<u32> for FrameIndex {
    type Output = FrameIndex;

    fn sub(self, rhs: u32) -> FrameIndex {
        if self.is_none() {
            return FrameIndex::NONE;
        }
        FrameIndex(self.0.saturating_sub(rhs))
    }
}

impl fmt::Display for FrameIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// One collected input frame, as stored in the controller timelines.
///
/// The payload begins with a single metadata bit (`has_data`). `similarity`
/// caches "this input is byte-equivalent to the input with that id"; it is
/// only consulted to fold duplicates on send.
#[derive(Debug, Clone, Default)]
pub struct FrameInput {
    pub id: FrameIndex,
    pub payload: BitArray,
    pub payload_bit_size: u16,
    pub similarity: FrameIndex,
    pub received_at_ms: u32,
}

impl FrameInput {
    /// True when the payload carries nothing beyond the metadata bit.
    pub fn is_empty(&self, metadata_bits: u16) -> bool {
        self.payload_bit_size <= metadata_bits
    }
}

impl PartialEq for FrameInput {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_puts_none_last() {
        assert!(FrameIndex(0) < FrameIndex(1));
        assert!(FrameIndex(u32::MAX - 1) < FrameIndex::NONE);
        assert!(FrameIndex::NONE > FrameIndex(12345));
    }

    #[test]
    fn arithmetic_saturates_at_none() {
        assert_eq!(FrameIndex::NONE + 5, FrameIndex::NONE);
        assert_eq!(FrameIndex::NONE - 5, FrameIndex::NONE);
        assert_eq!(FrameIndex(u32::MAX - 1) + 10, FrameIndex::NONE);
        assert_eq!(FrameIndex(3) - 10, FrameIndex(0));
        assert_eq!(FrameIndex(10) + 1, FrameIndex(11));
    }

    #[test]
    fn distance_is_symmetric() {
        assert_eq!(FrameIndex(3).distance(FrameIndex(10)), 7);
        assert_eq!(FrameIndex(10).distance(FrameIndex(3)), 7);
    }
}
