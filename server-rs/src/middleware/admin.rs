use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::error::AppError;
use crate::middleware::auth::AuthUser;
use crate::models::UserRole;
use crate::AppState;

/// Middleware: requires the admin role. Must run after `authenticate`.
pub async fn require_admin(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let user = req
        .extensions()
        .get::<AuthUser>()
        .copied()
        .ok_or_else(|| AppError::Unauthorized("Authentication required".into()))?;

    let role = state.store.find_role(user.id).await?;
    if role != Some(UserRole::Admin) {
        tracing::warn!(target: "security", user_id = %user.id, "admin route refused");
        return Err(AppError::Forbidden("Requires admin role".into()));
    }

    Ok(next.run(req).await)
}
