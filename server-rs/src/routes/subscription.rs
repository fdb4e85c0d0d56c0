use std::convert::Infallible;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    Extension, Json,
};
use chrono::Utc;
use futures_util::stream::{self, Stream};

use crate::error::{AppError, AppResult};
use crate::middleware::auth::AuthUser;
use crate::models::{ReferralStats, SubscriptionWrite};
use crate::services::tracker::{EntitlementTracker, EntitlementView, TrackerState};
use crate::AppState;

pub async fn status(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Json<EntitlementView> {
    let tracker = EntitlementTracker::mount(state.store.clone(), &state.feed, user.id).await;
    Json(tracker.view(Utc::now()))
}

/// One `entitlement` event on connect, then one per change. The tracker
/// lives in the stream state and is dropped with the connection.
pub async fn events(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let tracker = EntitlementTracker::mount(state.store.clone(), &state.feed, user.id).await;
    let rx = tracker.watch();

    let stream = stream::unfold((tracker, rx, true), |(tracker, mut rx, first)| async move {
        if !first {
            rx.changed().await.ok()?;
        }
        let view = EntitlementView::from_state(&rx.borrow_and_update(), Utc::now());
        let event = Event::default()
            .event("entitlement")
            .json_data(&view)
            .unwrap_or_else(|e| {
                tracing::error!("entitlement event encoding failed: {e}");
                Event::default().event("error")
            });
        Some((Ok(event), (tracker, rx, false)))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub async fn start_trial(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> AppResult<Json<EntitlementView>> {
    let now = Utc::now();
    // Make sure the row exists so the conditional write has something to match.
    state.store.get_or_create_subscription(user.id).await?;

    let record = state
        .store
        .start_trial(user.id, SubscriptionWrite::trial(now, state.config.trial.days))
        .await?
        .ok_or_else(|| AppError::Conflict("Trial is not available".into()))?;
    state.feed.publish(record.clone());
    tracing::info!(user_id = %user.id, trial_ends_at = ?record.trial_ends_at, "trial started");

    let role = state.store.find_role(user.id).await?;
    let referral_stats = state.store.referral_stats(user.id).await?;
    let view = EntitlementView::from_state(
        &TrackerState {
            subscription: Some(record),
            role,
            referral_stats: Some(referral_stats),
            loading: false,
        },
        now,
    );
    Ok(Json(view))
}

pub async fn referral_stats(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> AppResult<Json<ReferralStats>> {
    Ok(Json(state.store.referral_stats(user.id).await?))
}
