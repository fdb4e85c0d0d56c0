//! Entitlement resolution: whether a user is PRO right now.
//!
//! Pure function of the subscription row, the role row and the clock. The
//! tracker and every route that gates on PRO go through [`resolve`].

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::models::{Plan, SubscriptionRecord, UserRole};

const MILLIS_PER_DAY: i64 = 86_400_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entitlement {
    pub is_team_member: bool,
    pub is_pro_active: bool,
    pub is_in_trial: bool,
    pub trial_days_left: i64,
    pub trial_bonus_months: i32,
    pub current_plan: Plan,
}

pub fn resolve(
    subscription: Option<&SubscriptionRecord>,
    role: Option<UserRole>,
    now: DateTime<Utc>,
) -> Entitlement {
    let is_team_member = role.is_some_and(UserRole::is_elevated);
    // Expiry and trial fields of a free row are ignored.
    let pro = subscription.filter(|s| s.plan == Plan::Pro);

    let is_pro_active = is_team_member || pro.is_some_and(|s| pro_active(s, now));
    let is_in_trial = !is_team_member
        && pro
            .filter(|s| s.is_trial)
            .and_then(|s| s.trial_ends_at)
            .is_some_and(|ends| ends > now);
    // Counts down from the trial end even after an upgrade clears `is_trial`.
    let trial_days_left = pro
        .and_then(|s| s.trial_ends_at)
        .map_or(0, |ends| days_left(ends, now));

    Entitlement {
        is_team_member,
        is_pro_active,
        is_in_trial,
        trial_days_left,
        trial_bonus_months: subscription.map_or(0, |s| s.trial_bonus_months),
        current_plan: if is_pro_active { Plan::Pro } else { Plan::Free },
    }
}

/// Expiry including bonus days; `None` never expires. Bonus days that push
/// past the last representable instant also read as never expiring.
pub fn effective_expiry(subscription: &SubscriptionRecord) -> Option<DateTime<Utc>> {
    let expires_at = subscription.expires_at?;
    let bonus = Duration::try_days(i64::from(subscription.bonus_days.max(0)))?;
    expires_at.checked_add_signed(bonus)
}

fn pro_active(subscription: &SubscriptionRecord, now: DateTime<Utc>) -> bool {
    match effective_expiry(subscription) {
        None => true,
        Some(expiry) => expiry > now,
    }
}

/// Whole days until `ends`, rounded up, never negative.
fn days_left(ends: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let millis = (ends - now).num_milliseconds();
    if millis <= 0 {
        return 0;
    }
    (millis + MILLIS_PER_DAY - 1) / MILLIS_PER_DAY
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Period, SubscriptionWrite};
    use chrono::TimeZone;
    use uuid::Uuid;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn pro(expires_at: Option<DateTime<Utc>>, bonus_days: i32) -> SubscriptionRecord {
        let mut s = SubscriptionRecord::default_for(Uuid::new_v4(), at(2023, 1, 1));
        s.plan = Plan::Pro;
        s.period = Some(Period::Monthly);
        s.expires_at = expires_at;
        s.bonus_days = bonus_days;
        s
    }

    fn trial(ends: DateTime<Utc>) -> SubscriptionRecord {
        let mut s = pro(Some(ends), 0);
        s.period = None;
        s.is_trial = true;
        s.trial_ends_at = Some(ends);
        s
    }

    #[test]
    fn no_row_is_free() {
        let e = resolve(None, None, at(2024, 1, 1));
        assert!(!e.is_pro_active);
        assert!(!e.is_in_trial);
        assert_eq!(e.trial_days_left, 0);
        assert_eq!(e.current_plan, Plan::Free);
    }

    #[test]
    fn lifetime_is_always_active() {
        let s = pro(None, 0);
        for now in [at(2000, 1, 1), at(2024, 6, 1), at(2099, 12, 31)] {
            let e = resolve(Some(&s), None, now);
            assert!(e.is_pro_active);
            assert_eq!(e.current_plan, Plan::Pro);
        }
    }

    #[test]
    fn bonus_days_extend_expiry() {
        let s = pro(Some(at(2024, 1, 1)), 10);
        assert!(resolve(Some(&s), None, at(2024, 1, 8)).is_pro_active);
        assert!(!resolve(Some(&s), None, at(2024, 1, 15)).is_pro_active);
        // Boundary: active strictly before E + B days.
        assert!(!resolve(Some(&s), None, at(2024, 1, 11)).is_pro_active);
        assert!(resolve(Some(&s), None, at(2024, 1, 11) - Duration::seconds(1)).is_pro_active);
    }

    #[test]
    fn active_iff_now_before_effective_expiry() {
        let expiry = at(2024, 5, 1);
        for bonus in [0, 1, 30] {
            let s = pro(Some(expiry), bonus);
            let edge = expiry + Duration::days(i64::from(bonus));
            for offset_hours in [-48, -1, 0, 1, 48] {
                let now = edge + Duration::hours(offset_hours);
                assert_eq!(
                    resolve(Some(&s), None, now).is_pro_active,
                    now < edge,
                    "bonus={bonus} offset={offset_hours}h"
                );
            }
        }
    }

    #[test]
    fn staff_roles_override_subscription() {
        let expired_trial = trial(at(2024, 1, 10));
        let cases: [Option<&SubscriptionRecord>; 3] = [None, Some(&expired_trial), None];
        for role in [UserRole::Team, UserRole::Admin, UserRole::Moderator] {
            for sub in cases {
                let e = resolve(sub, Some(role), at(2024, 1, 5));
                assert!(e.is_team_member);
                assert!(e.is_pro_active);
                assert!(!e.is_in_trial);
            }
        }
        let e = resolve(None, Some(UserRole::Other), at(2024, 1, 5));
        assert!(!e.is_pro_active);
    }

    #[test]
    fn trial_window() {
        let s = trial(at(2024, 1, 10));
        let e = resolve(Some(&s), None, at(2024, 1, 5));
        assert!(e.is_in_trial);
        assert!(e.is_pro_active);
        assert_eq!(e.trial_days_left, 5);

        let e = resolve(Some(&s), None, at(2024, 1, 10));
        assert!(!e.is_in_trial);
        assert_eq!(e.trial_days_left, 0);
    }

    #[test]
    fn trial_days_left_rounds_up_and_never_increases() {
        let ends = at(2024, 1, 10);
        let s = trial(ends);
        assert_eq!(
            resolve(Some(&s), None, ends - Duration::hours(1)).trial_days_left,
            1
        );
        assert_eq!(
            resolve(Some(&s), None, ends - Duration::hours(25)).trial_days_left,
            2
        );

        let mut previous = i64::MAX;
        let mut now = at(2023, 12, 20);
        while now < at(2024, 1, 20) {
            let left = resolve(Some(&s), None, now).trial_days_left;
            assert!(left <= previous);
            assert!(left >= 0);
            previous = left;
            now += Duration::hours(7);
        }
        assert_eq!(previous, 0);
    }

    #[test]
    fn no_trial_end_means_zero_days_left() {
        let mut s = pro(Some(at(2024, 2, 1)), 0);
        s.is_trial = true;
        let e = resolve(Some(&s), None, at(2024, 1, 1));
        assert!(!e.is_in_trial);
        assert_eq!(e.trial_days_left, 0);
    }

    #[test]
    fn free_row_ignores_leftover_expiry_and_trial() {
        let mut s = trial(at(2024, 1, 10));
        s.plan = Plan::Free;
        let e = resolve(Some(&s), None, at(2024, 1, 5));
        assert!(!e.is_pro_active);
        assert!(!e.is_in_trial);
        assert_eq!(e.trial_days_left, 0);
    }

    #[test]
    fn monthly_grant_scenario() {
        let now = at(2024, 1, 1);
        let mut s = pro(Period::Monthly.expires_at(now), 0);
        s.started_at = now;
        assert_eq!(s.expires_at, Some(at(2024, 1, 31)));
        assert!(resolve(Some(&s), None, at(2024, 1, 30)).is_pro_active);
        assert!(!resolve(Some(&s), None, at(2024, 1, 31)).is_pro_active);
    }

    #[test]
    fn huge_bonus_never_panics() {
        let s = pro(Some(at(2024, 1, 31)), i32::MAX);
        assert_eq!(effective_expiry(&s), None);
        let e = resolve(Some(&s), None, at(2024, 6, 1));
        assert!(e.is_pro_active);

        let mut edge = pro(Some(DateTime::<Utc>::MAX_UTC - Duration::days(1)), 2);
        edge.period = Some(Period::Annual);
        assert_eq!(effective_expiry(&edge), None);
    }

    #[test]
    fn upgrading_mid_trial_keeps_the_countdown() {
        let now = at(2024, 1, 1);
        let mut s = SubscriptionRecord::default_for(Uuid::new_v4(), now);
        s.apply(&SubscriptionWrite::trial(now, 7), now);
        s.apply(&SubscriptionWrite::paid(Period::Monthly, now), now);
        assert!(!s.is_trial);
        assert_eq!(s.trial_ends_at, Some(at(2024, 1, 8)));

        let e = resolve(Some(&s), None, now);
        assert_eq!(e.trial_days_left, 7);
        assert!(!e.is_in_trial);
        assert!(e.is_pro_active);
    }
}
