use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Pro,
}

impl Plan {
    pub fn as_str(self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Pro => "pro",
        }
    }
}

impl FromStr for Plan {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Plan::Free),
            "pro" => Ok(Plan::Pro),
            other => Err(UnknownVariant::new("plan", other)),
        }
    }
}

/// Billing period of a paid subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Monthly,
    Quarterly,
    Semiannual,
    Annual,
    Biennial,
    Lifetime,
}

impl Period {
    pub const ALL: [Period; 6] = [
        Period::Monthly,
        Period::Quarterly,
        Period::Semiannual,
        Period::Annual,
        Period::Biennial,
        Period::Lifetime,
    ];

    /// Length of the period in days. `None` means the grant never expires.
    pub fn days(self) -> Option<i64> {
        match self {
            Period::Monthly => Some(30),
            Period::Quarterly => Some(90),
            Period::Semiannual => Some(180),
            Period::Annual => Some(365),
            Period::Biennial => Some(730),
            Period::Lifetime => None,
        }
    }

    pub fn expires_at(self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.days().map(|d| from + Duration::days(d))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Period::Monthly => "monthly",
            Period::Quarterly => "quarterly",
            Period::Semiannual => "semiannual",
            Period::Annual => "annual",
            Period::Biennial => "biennial",
            Period::Lifetime => "lifetime",
        }
    }
}

impl FromStr for Period {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Period::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| UnknownVariant::new("period", s))
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    pub fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// One row of `subscriptions`; one per user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub user_id: Uuid,
    pub plan: Plan,
    pub period: Option<Period>,
    pub started_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub bonus_days: i32,
    pub is_trial: bool,
    pub trial_bonus_months: i32,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl SubscriptionRecord {
    /// The row created on first read.
    pub fn default_for(user_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            plan: Plan::Free,
            period: None,
            started_at: now,
            expires_at: None,
            bonus_days: 0,
            is_trial: false,
            trial_bonus_months: 0,
            trial_ends_at: None,
            updated_at: now,
        }
    }

    /// Applies an entitlement write. `bonus_days` and `trial_bonus_months`
    /// are not part of the write and carry over; `trial_ends_at` is only ever
    /// replaced, never cleared, so a used trial stays recorded.
    pub fn apply(&mut self, write: &SubscriptionWrite, now: DateTime<Utc>) {
        let write = write.clone().normalized();
        self.plan = write.plan;
        self.period = write.period;
        self.started_at = write.started_at;
        self.expires_at = write.expires_at;
        self.is_trial = write.is_trial;
        if write.trial_ends_at.is_some() {
            self.trial_ends_at = write.trial_ends_at;
        }
        self.updated_at = now;
    }
}

/// Raw `subscriptions` row as stored; enums are TEXT columns.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubscriptionRow {
    pub user_id: Uuid,
    pub plan: String,
    pub period: Option<String>,
    pub started_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub bonus_days: i32,
    pub is_trial: bool,
    pub trial_bonus_months: i32,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for SubscriptionRecord {
    type Error = UnknownVariant;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            user_id: row.user_id,
            plan: row.plan.parse()?,
            period: row.period.as_deref().map(str::parse).transpose()?,
            started_at: row.started_at,
            expires_at: row.expires_at,
            bonus_days: row.bonus_days,
            is_trial: row.is_trial,
            trial_bonus_months: row.trial_bonus_months,
            trial_ends_at: row.trial_ends_at,
            updated_at: row.updated_at,
        })
    }
}

/// The entitlement fields of a subscription, as written by the webhook
/// processor, the trial route and the admin toggle. All writes go through
/// [`SubscriptionWrite::normalized`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionWrite {
    pub plan: Plan,
    pub period: Option<Period>,
    pub started_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_trial: bool,
    pub trial_ends_at: Option<DateTime<Utc>>,
}

impl SubscriptionWrite {
    pub fn free(now: DateTime<Utc>) -> Self {
        Self {
            plan: Plan::Free,
            period: None,
            started_at: now,
            expires_at: None,
            is_trial: false,
            trial_ends_at: None,
        }
    }

    /// A paid grant for `period` starting at `now`.
    pub fn paid(period: Period, now: DateTime<Utc>) -> Self {
        Self {
            plan: Plan::Pro,
            period: Some(period),
            started_at: now,
            expires_at: period.expires_at(now),
            is_trial: false,
            trial_ends_at: None,
        }
    }

    pub fn trial(now: DateTime<Utc>, days: i64) -> Self {
        let ends = now + Duration::days(days);
        Self {
            plan: Plan::Pro,
            period: None,
            started_at: now,
            expires_at: Some(ends),
            is_trial: true,
            trial_ends_at: Some(ends),
        }
    }

    /// A free plan carries no period, no expiry and no active trial.
    pub fn normalized(self) -> Self {
        match self.plan {
            Plan::Free => Self {
                period: None,
                expires_at: None,
                is_trial: false,
                ..self
            },
            Plan::Pro => self,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AdminSubscriptionRequest {
    pub plan: Plan,
    pub period: Option<Period>,
}

#[derive(Debug, Deserialize)]
pub struct BonusDaysRequest {
    pub days: i32,
}
