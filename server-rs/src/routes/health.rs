use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::AppState;

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let store_ok = state.store.health_check().await;
    let status = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if store_ok { "healthy" } else { "degraded" },
            "store": store_ok,
            "gateway": state.gateway.is_some(),
            "timestamp": chrono::Utc::now(),
        })),
    )
}
