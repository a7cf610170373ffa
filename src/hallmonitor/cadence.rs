//! Refresh cadence bands.
//!
//! Popular subjects change often and get short refresh intervals; dormant
//! ones drift out to a month or two. A recent push pulls the next refresh in
//! regardless of band.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Repo bands by stars.
const REPO_HIGH_STARS: i32 = 1000;
const REPO_MID_STARS: i32 = 100;
const REPO_HIGH_REFRESH: Duration = Duration::from_secs(7 * 86400);
const REPO_MID_REFRESH: Duration = Duration::from_secs(14 * 86400);
const REPO_LOW_REFRESH: Duration = Duration::from_secs(30 * 86400);

/// Actor bands by followers.
const ACTOR_HIGH_FOLLOWERS: i32 = 1000;
const ACTOR_HIGH_REFRESH: Duration = Duration::from_secs(30 * 86400);
const ACTOR_LOW_REFRESH: Duration = Duration::from_secs(60 * 86400);

/// Refresh interval pulled in for freshly pushed repos.
const FRESH_PUSH_REFRESH: Duration = Duration::from_secs(3 * 86400);

/// Next refresh for a repository, from its star band and push recency.
pub fn next_repo_refresh(
    now: DateTime<Utc>,
    stars: Option<i32>,
    pushed_at: Option<DateTime<Utc>>,
    push_min: Duration,
) -> DateTime<Utc> {
    let band = match stars.unwrap_or(0) {
        s if s >= REPO_HIGH_STARS => REPO_HIGH_REFRESH,
        s if s >= REPO_MID_STARS => REPO_MID_REFRESH,
        _ => REPO_LOW_REFRESH,
    };

    let fresh_push = pushed_at
        .and_then(|pushed| (now - pushed).to_std().ok())
        .is_some_and(|age| age <= push_min);
    let interval = if fresh_push {
        band.min(FRESH_PUSH_REFRESH)
    } else {
        band
    };

    now + chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::days(30))
}

/// Next refresh for an actor, from its follower band.
pub fn next_actor_refresh(now: DateTime<Utc>, followers: Option<i32>) -> DateTime<Utc> {
    let band = if followers.unwrap_or(0) >= ACTOR_HIGH_FOLLOWERS {
        ACTOR_HIGH_REFRESH
    } else {
        ACTOR_LOW_REFRESH
    };
    now + chrono::Duration::from_std(band).unwrap_or(chrono::Duration::days(60))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        "2025-06-01T00:00:00Z".parse().unwrap()
    }

    fn push_min() -> Duration {
        Duration::from_secs(2 * 86400)
    }

    #[test]
    fn repo_bands_by_stars() {
        let t = now();
        assert_eq!(next_repo_refresh(t, Some(5000), None, push_min()), t + chrono::Duration::days(7));
        assert_eq!(next_repo_refresh(t, Some(1000), None, push_min()), t + chrono::Duration::days(7));
        assert_eq!(next_repo_refresh(t, Some(500), None, push_min()), t + chrono::Duration::days(14));
        assert_eq!(next_repo_refresh(t, Some(3), None, push_min()), t + chrono::Duration::days(30));
        assert_eq!(next_repo_refresh(t, None, None, push_min()), t + chrono::Duration::days(30));
    }

    #[test]
    fn fresh_push_pulls_refresh_in() {
        let t = now();
        let pushed = t - chrono::Duration::hours(6);
        let next = next_repo_refresh(t, Some(3), Some(pushed), push_min());
        assert_eq!(next, t + chrono::Duration::days(3));

        // A high-star repo already refreshes faster than the fresh-push pull.
        let busy = next_repo_refresh(t, Some(5000), Some(pushed), push_min());
        assert_eq!(busy, t + chrono::Duration::days(3));
    }

    #[test]
    fn stale_push_keeps_band() {
        let t = now();
        let pushed = t - chrono::Duration::days(200);
        let next = next_repo_refresh(t, Some(3), Some(pushed), push_min());
        assert_eq!(next, t + chrono::Duration::days(30));
    }

    #[test]
    fn actor_bands_by_followers() {
        let t = now();
        assert_eq!(next_actor_refresh(t, Some(2000)), t + chrono::Duration::days(30));
        assert_eq!(next_actor_refresh(t, Some(999)), t + chrono::Duration::days(60));
        assert_eq!(next_actor_refresh(t, None), t + chrono::Duration::days(60));
    }
}
