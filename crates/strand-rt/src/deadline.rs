//! Absolute monotonic deadlines for blocking operations.
//!
//! Every blocking operation in the runtime accepts a [`Deadline`].
//! `Deadline::Inf` disables the timeout and never fires.

use std::fmt;
use std::time::{Duration, Instant};

/// An absolute point in monotonic time by which a blocking operation must
/// complete, or `Inf` for no limit.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Deadline {
    /// Never fires.
    Inf,
    /// Fires once monotonic time reaches the instant.
    At(Instant),
}

impl Deadline {
    /// A deadline `dur` from now.
    pub fn after(dur: Duration) -> Self {
        Deadline::At(Instant::now() + dur)
    }

    /// A deadline `ms` milliseconds from now; non-positive means `Inf`,
    /// matching the convention that a missing timeout disables it.
    pub fn after_ms(ms: i64) -> Self {
        if ms <= 0 {
            Deadline::Inf
        } else {
            Deadline::At(Instant::now() + Duration::from_millis(ms as u64))
        }
    }

    /// True when the deadline has already passed.
    pub fn expired(self) -> bool {
        match self {
            Deadline::Inf => false,
            Deadline::At(at) => Instant::now() >= at,
        }
    }

    /// Time remaining until the deadline, `None` for `Inf`.
    /// A deadline in the past yields a zero duration.
    pub fn remaining(self) -> Option<Duration> {
        match self {
            Deadline::Inf => None,
            Deadline::At(at) => Some(at.saturating_duration_since(Instant::now())),
        }
    }

    /// The underlying instant, `None` for `Inf`.
    pub fn instant(self) -> Option<Instant> {
        match self {
            Deadline::Inf => None,
            Deadline::At(at) => Some(at),
        }
    }

    /// The earlier of two deadlines.
    pub fn min(self, other: Deadline) -> Deadline {
        match (self, other) {
            (Deadline::Inf, d) | (d, Deadline::Inf) => d,
            (Deadline::At(a), Deadline::At(b)) => Deadline::At(a.min(b)),
        }
    }
}

impl From<Duration> for Deadline {
    fn from(dur: Duration) -> Self {
        Deadline::after(dur)
    }
}

impl From<Instant> for Deadline {
    fn from(at: Instant) -> Self {
        Deadline::At(at)
    }
}

impl fmt::Debug for Deadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Deadline::Inf => write!(f, "Deadline::Inf"),
            Deadline::At(at) => write!(f, "Deadline::At({:?})", at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inf_never_expires() {
        assert!(!Deadline::Inf.expired());
        assert_eq!(Deadline::Inf.remaining(), None);
        assert_eq!(Deadline::Inf.instant(), None);
    }

    #[test]
    fn test_after_ms_non_positive_is_inf() {
        assert_eq!(Deadline::after_ms(0), Deadline::Inf);
        assert_eq!(Deadline::after_ms(-5), Deadline::Inf);
    }

    #[test]
    fn test_past_deadline_expired() {
        let d = Deadline::At(Instant::now() - Duration::from_millis(1));
        assert!(d.expired());
        assert_eq!(d.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn test_future_deadline_not_expired() {
        let d = Deadline::after(Duration::from_secs(60));
        assert!(!d.expired());
        assert!(d.remaining().unwrap() > Duration::from_secs(59));
    }

    #[test]
    fn test_min() {
        let near = Deadline::after(Duration::from_millis(10));
        let far = Deadline::after(Duration::from_secs(60));
        assert_eq!(near.min(far), near);
        assert_eq!(far.min(near), near);
        assert_eq!(Deadline::Inf.min(near), near);
        assert_eq!(near.min(Deadline::Inf), near);
        assert_eq!(Deadline::Inf.min(Deadline::Inf), Deadline::Inf);
    }
}
