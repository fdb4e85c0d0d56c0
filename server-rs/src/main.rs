use axum::{
    http::HeaderValue,
    middleware as axum_mw,
    routing::{get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

mod cache;
mod config;
mod db;
mod error;
mod middleware;
mod models;
mod routes;
mod services;
mod store;

use cache::Cache;
use config::{Config, StoreBackend};
use middleware::rate_limit::RateLimiter;
use services::feed::SubscriptionFeed;
use services::gateway::{PaymentGateway, YooKassaClient};
use services::settings::SettingsService;
use store::{MemoryStore, PgStore, Store};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub gateway: Option<Arc<dyn PaymentGateway>>,
    pub feed: SubscriptionFeed,
    pub settings: SettingsService,
    pub rate_limiter: RateLimiter,
}

impl AppState {
    fn new(
        config: Config,
        store: Arc<dyn Store>,
        gateway: Option<Arc<dyn PaymentGateway>>,
    ) -> Self {
        let rate_limiter =
            RateLimiter::new(config.rate_limit.max_requests, config.rate_limit.window_secs);
        Self {
            settings: SettingsService::new(store.clone()),
            config: Arc::new(config),
            store,
            gateway,
            feed: SubscriptionFeed::new(),
            rate_limiter,
        }
    }
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    let allow_origin = if origins.is_empty() || config.cors_origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Wraps `router` in `authenticate`, with the per-caller rate limit running
/// after authentication so it can key on the user.
fn authenticated(router: Router<AppState>, state: &AppState) -> Router<AppState> {
    router
        .layer(axum_mw::from_fn_with_state(
            state.clone(),
            middleware::rate_limit::rate_limit,
        ))
        .layer(axum_mw::from_fn_with_state(
            state.clone(),
            middleware::auth::authenticate,
        ))
}

fn build_router(state: AppState) -> Router {
    // --- Auth routes (no auth required) ---
    let auth_routes = Router::new()
        .route("/telegram", post(routes::auth::telegram_login))
        .route("/refresh", post(routes::auth::refresh))
        .layer(axum_mw::from_fn_with_state(
            state.clone(),
            middleware::rate_limit::rate_limit,
        ));

    // --- Webhook routes (raw body, no auth) ---
    let webhook_routes =
        Router::new().route("/payments", post(routes::webhooks::payment_webhook));

    // --- Authenticated routes ---
    let subscription_routes = authenticated(
        Router::new()
            .route("/", get(routes::subscription::status))
            .route("/events", get(routes::subscription::events))
            .route("/trial", post(routes::subscription::start_trial)),
        &state,
    );

    let referral_routes = authenticated(
        Router::new().route("/stats", get(routes::subscription::referral_stats)),
        &state,
    );

    let billing_routes = authenticated(
        Router::new()
            .route("/checkout", post(routes::billing::checkout))
            .route("/payments", get(routes::billing::payments)),
        &state,
    );

    let settings_routes = authenticated(
        Router::new().route(
            "/:key",
            get(routes::settings::get_setting).put(routes::settings::put_setting),
        ),
        &state,
    );

    let admin_routes = authenticated(
        Router::new()
            .route(
                "/users/:id/subscription",
                put(routes::admin::set_subscription),
            )
            .route("/users/:id/bonus-days", post(routes::admin::add_bonus_days))
            .route("/users/:id/role", put(routes::admin::set_role))
            .layer(axum_mw::from_fn_with_state(
                state.clone(),
                middleware::admin::require_admin,
            )),
        &state,
    );

    // --- Compose full API ---
    let api = Router::new()
        .nest("/auth", auth_routes)
        .nest("/webhooks", webhook_routes)
        .nest("/subscription", subscription_routes)
        .nest("/referrals", referral_routes)
        .nest("/billing", billing_routes)
        .nest("/settings", settings_routes)
        .nest("/admin", admin_routes);

    Router::new()
        .nest("/api/v1", api)
        .route("/health", get(routes::health::health))
        .layer(CompressionLayer::new())
        .layer(cors_layer(&state.config))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn build_store(config: &Config) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    match config.store_backend {
        StoreBackend::Postgres => {
            let pool = db::create_pool(config).await?;
            let cache = Cache::new(config).await?;
            Ok(Arc::new(PgStore::new(pool, cache)))
        }
        StoreBackend::Memory => {
            tracing::warn!("using the in-memory store; data is lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    let config = Config::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .json()
        .init();

    let store = build_store(&config).await?;
    let gateway = YooKassaClient::new(&config.gateway)
        .map(|client| Arc::new(client) as Arc<dyn PaymentGateway>);
    if gateway.is_none() {
        tracing::warn!("payment gateway credentials missing; checkout and webhooks are disabled");
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(env = %config.app_env, "Habitat API initialized");

    let app = build_router(AppState::new(config, store, gateway));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on {addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl+c: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
