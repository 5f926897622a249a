use core::ops::{Add, AddAssign};

/// The number of additional bytes a consumer is willing to accept.
///
/// Demand accumulates across repeated requests and is drawn down as bytes are
/// delivered. [`Demand::Unbounded`] absorbs every finite increment and is never
/// drawn down.
///
/// # Example
///
/// ```
/// use assetflow::Demand;
///
/// let mut demand = Demand::max(2000) + Demand::max(3000);
/// assert_eq!(demand.clamp(4096), 4096);
///
/// demand.consume(4096);
/// assert_eq!(demand, Demand::max(904));
///
/// demand += Demand::UNBOUNDED;
/// assert!(demand.is_unbounded());
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Demand {
    /// No upper bound; deliver everything as it arrives.
    Unbounded,
    /// At most this many more bytes.
    Max(usize),
}

impl Demand {
    pub const UNBOUNDED: Self = Self::Unbounded;
    pub const NONE: Self = Self::Max(0);

    pub const fn none() -> Self {
        Self::NONE
    }

    pub const fn max(n: usize) -> Self {
        Self::Max(n)
    }

    pub const fn is_unbounded(&self) -> bool {
        matches!(self, Self::Unbounded)
    }

    pub const fn is_zero(&self) -> bool {
        matches!(self, Self::Max(0))
    }

    /// Returns `min(len, self)`.
    pub const fn clamp(&self, len: usize) -> usize {
        match *self {
            Self::Unbounded => len,
            Self::Max(n) if n < len => n,
            Self::Max(_) => len,
        }
    }

    /// Draws down `delivered` bytes. Saturates at zero and leaves
    /// [`Demand::Unbounded`] untouched.
    pub const fn consume(&mut self, delivered: usize) {
        if let Self::Max(n) = self {
            *n = n.saturating_sub(delivered);
        }
    }
}

impl Default for Demand {
    fn default() -> Self {
        Self::NONE
    }
}

impl Add for Demand {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        match (self, rhs) {
            (Self::Max(a), Self::Max(b)) => Self::Max(a.saturating_add(b)),
            _ => Self::Unbounded,
        }
    }
}

impl AddAssign for Demand {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl From<usize> for Demand {
    fn from(n: usize) -> Self {
        Self::Max(n)
    }
}
