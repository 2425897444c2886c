//! Minimum interval between scheduled syncs of a scope

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Whether `min_interval` has passed since the last completed run
///
/// A scope that never completed a run is always due.
pub fn cooldown_elapsed(last_completed: Option<DateTime<Utc>>, min_interval: Duration) -> bool {
    let Some(last) = last_completed else {
        return true;
    };
    match (Utc::now() - last).to_std() {
        Ok(elapsed) => elapsed >= min_interval,
        // Completed "in the future": clock skew, treat as just synced
        Err(_) => min_interval.is_zero(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_never_synced_is_due() {
        assert!(cooldown_elapsed(None, MINUTE));
        assert!(cooldown_elapsed(None, Duration::ZERO));
    }

    #[test]
    fn test_recent_sync_is_not_due() {
        let last = Utc::now() - ChronoDuration::seconds(10);
        assert!(!cooldown_elapsed(Some(last), MINUTE));
    }

    #[test]
    fn test_old_sync_is_due() {
        let last = Utc::now() - ChronoDuration::seconds(61);
        assert!(cooldown_elapsed(Some(last), MINUTE));

        let last = Utc::now() - ChronoDuration::hours(24);
        assert!(cooldown_elapsed(Some(last), MINUTE));
    }

    #[test]
    fn test_zero_interval_is_always_due() {
        assert!(cooldown_elapsed(Some(Utc::now()), Duration::ZERO));
        let future = Utc::now() + ChronoDuration::seconds(30);
        assert!(cooldown_elapsed(Some(future), Duration::ZERO));
        assert!(!cooldown_elapsed(Some(future), MINUTE));
    }
}
