use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{
    AdminSubscriptionRequest, BonusDaysRequest, Plan, SetRoleRequest, SubscriptionRecord,
    SubscriptionWrite,
};
use crate::AppState;

const MAX_BONUS_DAYS_PER_GRANT: i32 = 3650;

async fn existing_user(state: &AppState, id: Uuid) -> AppResult<()> {
    state
        .store
        .find_user(id)
        .await?
        .map(|_| ())
        .ok_or_else(|| AppError::NotFound("User not found".into()))
}

pub async fn set_subscription(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<AdminSubscriptionRequest>,
) -> AppResult<Json<SubscriptionRecord>> {
    existing_user(&state, id).await?;
    let now = Utc::now();
    let write = match (body.plan, body.period) {
        (Plan::Free, _) => SubscriptionWrite::free(now),
        (Plan::Pro, Some(period)) => SubscriptionWrite::paid(period, now),
        (Plan::Pro, None) => {
            return Err(AppError::BadRequest("period is required for the pro plan".into()))
        }
    };

    let record = state.store.write_subscription(id, write).await?;
    state.feed.publish(record.clone());
    tracing::info!(user_id = %id, plan = record.plan.as_str(), "subscription set by admin");
    Ok(Json(record))
}

pub async fn add_bonus_days(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<BonusDaysRequest>,
) -> AppResult<Json<SubscriptionRecord>> {
    if !(0..=MAX_BONUS_DAYS_PER_GRANT).contains(&body.days) {
        return Err(AppError::BadRequest(format!(
            "days must be between 0 and {MAX_BONUS_DAYS_PER_GRANT}"
        )));
    }
    existing_user(&state, id).await?;

    let record = state.store.add_bonus_days(id, body.days).await?;
    state.feed.publish(record.clone());
    tracing::info!(user_id = %id, days = body.days, "bonus days granted");
    Ok(Json(record))
}

pub async fn set_role(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<SetRoleRequest>,
) -> AppResult<Json<Value>> {
    existing_user(&state, id).await?;
    state.store.set_role(id, body.role).await?;
    tracing::info!(user_id = %id, role = ?body.role, "role changed");
    Ok(Json(json!({ "ok": true, "role": body.role.map(|r| r.as_str()) })))
}
