use axum::{extract::State, Json};
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::middleware::auth::{generate_tokens, verify_token, TokenType};
use crate::models::{RefreshRequest, TelegramLoginRequest, User};
use crate::services::telegram::{verify_init_data, InitDataError};
use crate::AppState;

const REFERRAL_PREFIX: &str = "ref_";

fn referrer_from(start_param: Option<&str>) -> Option<Uuid> {
    start_param
        .and_then(|p| p.strip_prefix(REFERRAL_PREFIX))
        .and_then(|id| Uuid::parse_str(id).ok())
}

pub async fn telegram_login(
    State(state): State<AppState>,
    Json(body): Json<TelegramLoginRequest>,
) -> AppResult<Json<Value>> {
    let telegram = &state.config.telegram;
    if telegram.bot_token.is_empty() {
        return Err(AppError::Internal("Telegram bot token not configured".into()));
    }

    let verified = verify_init_data(
        &body.init_data,
        &telegram.bot_token,
        telegram.init_data_max_age_secs,
        Utc::now().timestamp(),
    )
    .map_err(|e| {
        tracing::warn!(target: "security", "telegram login rejected: {e}");
        match e {
            InitDataError::Malformed(_) => AppError::BadRequest("Malformed initData".into()),
            InitDataError::BadSignature | InitDataError::Expired => {
                AppError::Unauthorized("initData could not be verified".into())
            }
        }
    })?;

    let user: User = state.store.upsert_telegram_user(&verified.profile).await?;

    if let Some(referrer) = referrer_from(verified.start_param.as_deref()) {
        if referrer != user.id && state.store.find_user(referrer).await?.is_some() {
            state.store.record_referral(referrer, user.id).await?;
        }
    }

    let tokens = generate_tokens(user.id, &state.config.jwt)?;
    tracing::info!(user_id = %user.id, "telegram login");

    Ok(Json(json!({
        "tokens": tokens,
        "user": user,
    })))
}

pub async fn refresh(
    State(state): State<AppState>,
    Json(body): Json<RefreshRequest>,
) -> AppResult<Json<Value>> {
    let user_id = verify_token(&body.refresh_token, TokenType::Refresh, &state.config.jwt.secret)?;
    if state.store.find_user(user_id).await?.is_none() {
        return Err(AppError::Unauthorized("User no longer exists".into()));
    }

    let tokens = generate_tokens(user_id, &state.config.jwt)?;
    Ok(Json(json!({ "tokens": tokens })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn referral_start_param() {
        let id = Uuid::new_v4();
        assert_eq!(referrer_from(Some(&format!("ref_{id}"))), Some(id));
        assert_eq!(referrer_from(Some("ref_nope")), None);
        assert_eq!(referrer_from(Some(&id.to_string())), None);
        assert_eq!(referrer_from(None), None);
    }
}
