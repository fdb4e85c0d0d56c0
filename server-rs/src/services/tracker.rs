//! Live entitlement state for one user.
//!
//! Mounting performs one concurrent load of subscription, role and referral
//! stats, then follows the subscription change feed. Feed events replace the
//! stored row without a refetch; the last delivered event wins.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::entitlement::resolve;
use super::feed::{FeedEvent, SubscriptionFeed};
use crate::models::{Plan, ReferralStats, SubscriptionRecord, UserRole};
use crate::store::Store;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackerState {
    pub subscription: Option<SubscriptionRecord>,
    pub role: Option<UserRole>,
    pub referral_stats: Option<ReferralStats>,
    pub loading: bool,
}

/// What the client renders and gates on.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementView {
    pub is_team_member: bool,
    pub is_pro_active: bool,
    pub is_in_trial: bool,
    pub trial_days_left: i64,
    pub trial_bonus_months: i32,
    pub current_plan: Plan,
    pub subscription: Option<SubscriptionRecord>,
    pub referral_stats: Option<ReferralStats>,
    pub loading: bool,
}

impl EntitlementView {
    pub fn from_state(state: &TrackerState, now: DateTime<Utc>) -> Self {
        let entitlement = resolve(state.subscription.as_ref(), state.role, now);
        Self {
            is_team_member: entitlement.is_team_member,
            is_pro_active: entitlement.is_pro_active,
            is_in_trial: entitlement.is_in_trial,
            trial_days_left: entitlement.trial_days_left,
            trial_bonus_months: entitlement.trial_bonus_months,
            current_plan: entitlement.current_plan,
            subscription: state.subscription.clone(),
            referral_stats: state.referral_stats.clone(),
            loading: state.loading,
        }
    }
}

pub struct EntitlementTracker {
    user_id: Uuid,
    store: Arc<dyn Store>,
    state: Arc<watch::Sender<TrackerState>>,
    listener: JoinHandle<()>,
}

impl EntitlementTracker {
    pub async fn mount(store: Arc<dyn Store>, feed: &SubscriptionFeed, user_id: Uuid) -> Self {
        // Subscribe before loading so no change between load and listen is lost.
        let mut updates = feed.subscribe(user_id);
        let (tx, _) = watch::channel(TrackerState {
            loading: true,
            ..TrackerState::default()
        });
        let state = Arc::new(tx);

        let (subscription, role, referral_stats) = tokio::join!(
            store.get_or_create_subscription(user_id),
            store.find_role(user_id),
            store.referral_stats(user_id),
        );
        state.send_modify(|s| {
            match subscription {
                Ok(sub) => s.subscription = Some(sub),
                Err(e) => tracing::error!(%user_id, "subscription load failed: {e}"),
            }
            match role {
                Ok(role) => s.role = role,
                Err(e) => tracing::error!(%user_id, "role load failed: {e}"),
            }
            match referral_stats {
                Ok(stats) => s.referral_stats = Some(stats),
                Err(e) => tracing::error!(%user_id, "referral stats load failed: {e}"),
            }
            s.loading = false;
        });

        let listener = {
            let state = Arc::clone(&state);
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                while let Some(event) = updates.next().await {
                    match event {
                        FeedEvent::Snapshot(record) => {
                            state.send_modify(|s| s.subscription = Some(record))
                        }
                        FeedEvent::Lagged => {
                            reload_subscription(store.as_ref(), user_id, &state).await
                        }
                    }
                }
            })
        };

        Self {
            user_id,
            store,
            state,
            listener,
        }
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn state(&self) -> TrackerState {
        self.state.borrow().clone()
    }

    pub fn view(&self, now: DateTime<Utc>) -> EntitlementView {
        EntitlementView::from_state(&self.state.borrow(), now)
    }

    /// Fires on every state change.
    pub fn watch(&self) -> watch::Receiver<TrackerState> {
        self.state.subscribe()
    }

    pub async fn refetch_subscription(&self) {
        reload_subscription(self.store.as_ref(), self.user_id, &self.state).await;
    }

    pub async fn refetch_referral_stats(&self) {
        match self.store.referral_stats(self.user_id).await {
            Ok(stats) => self.state.send_modify(|s| s.referral_stats = Some(stats)),
            Err(e) => tracing::error!(user_id = %self.user_id, "referral stats refetch failed: {e}"),
        }
    }
}

async fn reload_subscription(store: &dyn Store, user_id: Uuid, state: &watch::Sender<TrackerState>) {
    match store.get_or_create_subscription(user_id).await {
        Ok(sub) => state.send_modify(|s| s.subscription = Some(sub)),
        Err(e) => tracing::error!(%user_id, "subscription refetch failed: {e}"),
    }
}

impl Drop for EntitlementTracker {
    fn drop(&mut self) {
        self.listener.abort();
    }
}
