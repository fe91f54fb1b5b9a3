//! See [`Seq`].

use std::fmt;

/// Sequence number of a datagram sent over a circuit.
///
/// Sequence numbers are assigned per circuit, starting at 1 and increasing
/// monotonically with each first transmission; a resent datagram keeps its
/// original sequence. On the wire this is 4 bytes, big-endian.
///
/// Unlike a 16-bit sequence space there is no wraparound handling here: at a
/// sustained thousand packets per second a `u32` lasts over a month, far past
/// the lifetime of any circuit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Seq(pub u32);

impl Seq {
    /// Number of bytes this takes up on the wire.
    pub const WIRE_LEN: usize = 4;

    /// The sequence assigned to the first datagram on a circuit.
    pub const FIRST: Seq = Seq(1);

    /// Gets the sequence after this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u32> for Seq {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_is_monotonic() {
        let mut seq = Seq::FIRST;
        for expect in 2..10 {
            seq = seq.next();
            assert_eq!(Seq(expect), seq);
        }
    }
}
