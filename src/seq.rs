//! 16-bit per-stream sequence numbers and wrap-safe comparison.
//!
//! The `±10000` bound is a hard-coded half-window heuristic carried over
//! from the legacy client verbatim, not the stricter exact half-window
//! (`±0x8000`) a from-scratch design might reach for — see `DESIGN.md` for
//! why we kept it.

use std::{
    cmp::Ordering,
    fmt,
    ops::{Add, AddAssign, Sub, SubAssign},
};

/// Hard-coded half-window bound used by [`compare`].
const FUTURE_PAST_BOUND: i32 = 10000;

/// A 16-bit sequence number on one reliable stream.
///
/// Arithmetic wraps at `u16::MAX` by design; two sequences more than
/// [`FUTURE_PAST_BOUND`] apart are assumed to have wrapped around rather
/// than to be genuinely far apart.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Seq(pub u16);

impl Seq {
    /// Sequence zero.
    pub const ZERO: Self = Self(0);

    /// Signed distance `rhs - self`, taking wraparound into account.
    ///
    /// ```
    /// use daybreak_proto::seq::Seq;
    /// assert_eq!(Seq(0).dist_to(Seq(5)), 5);
    /// assert_eq!(Seq(5).dist_to(Seq(0)), -5);
    /// assert_eq!(Seq(u16::MAX).dist_to(Seq(0)), 1);
    /// ```
    #[must_use]
    pub const fn dist_to(self, rhs: Self) -> i32 {
        (rhs.0.wrapping_sub(self.0) as i16) as i32
    }
}

impl fmt::Debug for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl Add for Seq {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self(self.0.wrapping_add(rhs.0))
    }
}

impl AddAssign for Seq {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Seq {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self(self.0.wrapping_sub(rhs.0))
    }
}

impl SubAssign for Seq {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl From<u16> for Seq {
    fn from(n: u16) -> Self {
        Self(n)
    }
}

impl From<Seq> for u16 {
    fn from(seq: Seq) -> Self {
        seq.0
    }
}

/// Result of comparing an expected (next-in-order) sequence against one
/// actually received,
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    /// `actual == expected`.
    Current,
    /// `actual` is ahead of `expected` (not yet in order).
    Future,
    /// `actual` is behind `expected` (already delivered, or a duplicate).
    Past,
}

/// Compares a received sequence against the next expected one.
///
/// A raw wrapping distance more than [`FUTURE_PAST_BOUND`] away in either
/// direction is assumed to be the *other* case wrapped around: a
/// far-future-looking value is classified [`Order::Past`], and a
/// far-past-looking value is classified [`Order::Future`].
///
/// ```
/// use daybreak_proto::seq::{compare, Order, Seq};
/// assert_eq!(compare(Seq(5), Seq(5)), Order::Current);
/// assert_eq!(compare(Seq(5), Seq(6)), Order::Future);
/// assert_eq!(compare(Seq(5), Seq(4)), Order::Past);
/// ```
#[must_use]
pub fn compare(expected: Seq, actual: Seq) -> Order {
    if expected == actual {
        return Order::Current;
    }
    let dist = expected.dist_to(actual);
    if dist > 0 && dist <= FUTURE_PAST_BOUND {
        Order::Future
    } else if dist < 0 && dist >= -FUTURE_PAST_BOUND {
        Order::Past
    } else if dist > 0 {
        // far in the future => assume it actually wrapped from behind us
        Order::Past
    } else {
        // far in the past => assume it actually wrapped from ahead of us
        Order::Future
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_future_past() {
        assert_eq!(compare(Seq(10), Seq(10)), Order::Current);
        assert_eq!(compare(Seq(10), Seq(11)), Order::Future);
        assert_eq!(compare(Seq(10), Seq(9)), Order::Past);
    }

    #[test]
    fn wraps_around_u16_max() {
        // expected just wrapped to 0, actual is a packet from just before
        // the wrap: should read as Past (already delivered).
        assert_eq!(compare(Seq(0), Seq(u16::MAX)), Order::Past);
        // expected is near the top, actual has wrapped to a small number:
        // should read as Future (ahead of us).
        assert_eq!(compare(Seq(u16::MAX - 2), Seq(1)), Order::Future);
    }

    #[test]
    fn dist_to_wraps() {
        assert_eq!(Seq(0).dist_to(Seq(0)), 0);
        assert_eq!(Seq(u16::MAX).dist_to(Seq(0)), 1);
        assert_eq!(Seq(0).dist_to(Seq(u16::MAX)), -1);
    }

    #[test]
    fn wrapping_arithmetic() {
        assert_eq!(Seq(u16::MAX) + Seq(1), Seq(0));
        assert_eq!(Seq(0) - Seq(1), Seq(u16::MAX));
    }
}
