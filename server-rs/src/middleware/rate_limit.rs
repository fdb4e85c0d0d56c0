use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::AppError;
use crate::middleware::auth::AuthUser;
use crate::AppState;

/// Fixed-window request counter keyed by caller.
#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<Mutex<HashMap<String, Window>>>,
    max_requests: u32,
    window_secs: i64,
}

struct Window {
    count: u32,
    reset_at: i64,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            windows: Arc::new(Mutex::new(HashMap::new())),
            max_requests,
            window_secs: i64::try_from(window_secs).unwrap_or(i64::MAX),
        }
    }

    pub async fn check(&self, key: &str) -> bool {
        self.check_at(key, Utc::now().timestamp()).await
    }

    async fn check_at(&self, key: &str, now: i64) -> bool {
        let mut windows = self.windows.lock().await;
        // Keep the map bounded by dropping windows that have already closed.
        if windows.len() > 10_000 {
            windows.retain(|_, w| w.reset_at > now);
        }

        let window = windows.entry(key.to_string()).or_insert(Window {
            count: 0,
            reset_at: now + self.window_secs,
        });
        if now >= window.reset_at {
            window.count = 0;
            window.reset_at = now + self.window_secs;
        }

        window.count += 1;
        window.count <= self.max_requests
    }
}

fn client_key(req: &Request) -> String {
    if let Some(user) = req.extensions().get::<AuthUser>() {
        return format!("user:{}", user.id);
    }
    if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        return format!("ip:{}", addr.ip());
    }
    req.headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|ip| format!("ip:{}", ip.trim()))
        .unwrap_or_else(|| "ip:unknown".to_string())
}

pub async fn rate_limit(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    if !state.rate_limiter.check(&client_key(&req)).await {
        return Err(AppError::RateLimited);
    }
    Ok(next.run(req).await)
}
