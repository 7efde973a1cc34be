use serde::{Deserialize, Serialize};
use std::fmt;

/// Non-negative integer amount of points, used for user balances and show prices.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Points(u64);

impl Points {
    pub const ZERO: Points = Points(0);

    pub const fn new(value: u64) -> Self {
        Points(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    /// Subtract `rhs`, returning `None` when the result would be negative.
    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Points)
    }

    /// Add `rhs`, returning `None` on overflow.
    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Points)
    }
}

impl fmt::Display for Points {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
