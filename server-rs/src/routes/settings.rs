use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde_json::{json, Value};

use crate::error::{AppError, AppResult};
use crate::middleware::auth::AuthUser;
use crate::AppState;

const MAX_KEY_LEN: usize = 64;

fn check_key(key: &str) -> AppResult<()> {
    let valid = !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(AppError::BadRequest("Invalid settings key".into()))
    }
}

pub async fn get_setting(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(key): Path<String>,
) -> AppResult<Json<Value>> {
    check_key(&key)?;
    let value = state.settings.get(user.id, &key).await?;
    Ok(Json(json!({ "key": key, "value": value })))
}

pub async fn put_setting(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(key): Path<String>,
    Json(value): Json<Value>,
) -> AppResult<Json<Value>> {
    check_key(&key)?;
    state.settings.put(user.id, &key, &value).await?;
    Ok(Json(json!({ "key": key, "value": value })))
}
