use chrono::{DateTime, TimeDelta, Utc};

/// Source of the current time for reservation timestamps and the cancellation window.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Whether a reservation for a show starting at `starts_at` may still be cancelled at `now`.
///
/// Cancellation needs at least `window` left before the show; exactly `window` left is allowed.
// TODO: confirm with product whether exactly `window` left should refuse instead (`>` here).
pub fn cancellation_open(starts_at: DateTime<Utc>, now: DateTime<Utc>, window: TimeDelta) -> bool {
    starts_at - now >= window
}

#[cfg(test)]
mod tests {
    use super::*;

    fn show_at() -> DateTime<Utc> {
        DateTime::from_timestamp(1_800_000_000, 0).unwrap()
    }

    #[test]
    fn open_well_before_the_show() {
        let now = show_at() - TimeDelta::hours(4);
        assert!(cancellation_open(show_at(), now, TimeDelta::hours(3)));
    }

    #[test]
    fn open_exactly_at_the_boundary() {
        let now = show_at() - TimeDelta::hours(3);
        assert!(cancellation_open(show_at(), now, TimeDelta::hours(3)));
    }

    #[test]
    fn closed_just_inside_the_window() {
        let now = show_at() - TimeDelta::hours(3) + TimeDelta::seconds(1);
        assert!(!cancellation_open(show_at(), now, TimeDelta::hours(3)));
    }

    #[test]
    fn closed_after_the_show() {
        let now = show_at() + TimeDelta::minutes(5);
        assert!(!cancellation_open(show_at(), now, TimeDelta::hours(3)));
    }

    #[test]
    fn fixed_clock_does_not_move() {
        let clock = FixedClock(show_at());
        assert_eq!(clock.now(), clock.now());
    }
}
