use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::JwtConfig;
use crate::error::{AppError, AppResult};
use crate::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user id
    #[serde(rename = "type")]
    pub token_type: TokenType,
    pub exp: i64,
    pub iat: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

fn sign(user_id: Uuid, token_type: TokenType, ttl_secs: i64, secret: &str) -> AppResult<String> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: user_id.to_string(),
        token_type,
        exp: now + ttl_secs,
        iat: now,
    };
    Ok(encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?)
}

pub fn generate_tokens(user_id: Uuid, jwt: &JwtConfig) -> AppResult<TokenPair> {
    Ok(TokenPair {
        access_token: sign(user_id, TokenType::Access, jwt.access_expiry_secs, &jwt.secret)?,
        refresh_token: sign(user_id, TokenType::Refresh, jwt.refresh_expiry_secs, &jwt.secret)?,
        expires_in: jwt.access_expiry_secs,
    })
}

/// Verifies signature and expiry, and that the token is of the expected type.
pub fn verify_token(token: &str, expected: TokenType, secret: &str) -> AppResult<Uuid> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )?;
    if data.claims.token_type != expected {
        return Err(AppError::Unauthorized(match expected {
            TokenType::Access => "Access token required".into(),
            TokenType::Refresh => "Refresh token required".into(),
        }));
    }
    Uuid::parse_str(&data.claims.sub)
        .map_err(|_| AppError::Unauthorized("Invalid token subject".into()))
}

fn extract_bearer(req: &Request) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Middleware: requires a valid access token. Sets [`AuthUser`] in extensions.
pub async fn authenticate(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_bearer(&req)
        .ok_or_else(|| AppError::Unauthorized("No token provided".into()))?;
    let id = verify_token(token, TokenType::Access, &state.config.jwt.secret)?;

    req.extensions_mut().insert(AuthUser { id });
    Ok(next.run(req).await)
}
