use axum::{body::Bytes, extract::State, Json};
use chrono::Utc;
use serde_json::{json, Value};

use crate::error::{AppError, AppResult};
use crate::services::webhook::{process_payment_webhook, WebhookOutcome};
use crate::AppState;

/// Payment notifications from the gateway. Unauthenticated: the body is
/// only trusted as far as the gateway confirms it.
pub async fn payment_webhook(State(state): State<AppState>, body: Bytes) -> AppResult<Json<Value>> {
    let payload: Value = serde_json::from_slice(&body)
        .map_err(|_| AppError::BadRequest("Invalid JSON body".into()))?;

    let outcome = process_payment_webhook(
        state.store.as_ref(),
        state.gateway.as_deref(),
        &state.feed,
        &payload,
        Utc::now(),
    )
    .await?;
    if let WebhookOutcome::Ignored { event } = &outcome {
        tracing::debug!(event = %event, "webhook acknowledged without action");
    }

    Ok(Json(json!({ "ok": true })))
}
