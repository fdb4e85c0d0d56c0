use std::env;

use crate::models::Period;

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub app_env: String,
    pub cors_origins: Vec<String>,
    pub store_backend: StoreBackend,
    pub db: DbConfig,
    pub redis: RedisConfig,
    pub jwt: JwtConfig,
    pub rate_limit: RateLimitConfig,
    pub gateway: GatewayConfig,
    pub pricing: PricingConfig,
    pub trial: TrialConfig,
    pub telegram: TelegramConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Clone, Debug)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub pool_min: u32,
    pub pool_max: u32,
}

#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: u8,
    pub key_prefix: String,
}

#[derive(Clone, Debug)]
pub struct JwtConfig {
    pub secret: String,
    pub access_expiry_secs: i64,
    pub refresh_expiry_secs: i64,
}

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub window_secs: u64,
    pub max_requests: u32,
}

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub shop_id: String,
    pub secret_key: String,
    pub api_base: String,
    pub return_url: String,
    pub currency: String,
}

/// Price per billing period, as the decimal string the gateway expects.
#[derive(Clone, Debug)]
pub struct PricingConfig {
    pub monthly: String,
    pub quarterly: String,
    pub semiannual: String,
    pub annual: String,
    pub biennial: String,
    pub lifetime: String,
}

#[derive(Clone, Debug)]
pub struct TrialConfig {
    pub days: i64,
}

#[derive(Clone, Debug)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub init_data_max_age_secs: i64,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_or_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env_or_parse("PORT", 3000),
            app_env: env_or("APP_ENV", "development"),
            cors_origins: env_or("CORS_ORIGINS", "http://localhost:5173")
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            store_backend: match env_or("STORE_BACKEND", "postgres").as_str() {
                "memory" => StoreBackend::Memory,
                _ => StoreBackend::Postgres,
            },
            db: DbConfig {
                host: env_or("DB_HOST", "localhost"),
                port: env_or_parse("DB_PORT", 5432),
                database: env_or("DB_NAME", "habitat"),
                user: env_or("DB_USER", "habitat"),
                password: env_or("DB_PASSWORD", ""),
                pool_min: env_or_parse("DB_POOL_MIN", 2),
                pool_max: env_or_parse("DB_POOL_MAX", 20),
            },
            redis: RedisConfig {
                host: env_or("REDIS_HOST", "localhost"),
                port: env_or_parse("REDIS_PORT", 6379),
                password: env::var("REDIS_PASSWORD").ok().filter(|s| !s.is_empty()),
                db: env_or_parse("REDIS_DB", 0),
                key_prefix: "habitat:".to_string(),
            },
            jwt: JwtConfig {
                secret: env_or("JWT_SECRET", "change-me-to-a-secure-random-string"),
                access_expiry_secs: parse_duration_to_secs(&env_or("JWT_ACCESS_EXPIRY", "1h")),
                refresh_expiry_secs: parse_duration_to_secs(&env_or("JWT_REFRESH_EXPIRY", "30d")),
            },
            rate_limit: RateLimitConfig {
                window_secs: 60,
                max_requests: env_or_parse("RATE_LIMIT_MAX", 120),
            },
            gateway: GatewayConfig {
                shop_id: env_or("YOOKASSA_SHOP_ID", ""),
                secret_key: env_or("YOOKASSA_SECRET_KEY", ""),
                api_base: env_or("YOOKASSA_API_BASE", "https://api.yookassa.ru/v3"),
                return_url: env_or("PAYMENT_RETURN_URL", "https://t.me/habitat_bot/app"),
                currency: env_or("PAYMENT_CURRENCY", "RUB"),
            },
            pricing: PricingConfig {
                monthly: env_or("PRICE_MONTHLY", "199.00"),
                quarterly: env_or("PRICE_QUARTERLY", "499.00"),
                semiannual: env_or("PRICE_SEMIANNUAL", "899.00"),
                annual: env_or("PRICE_ANNUAL", "1490.00"),
                biennial: env_or("PRICE_BIENNIAL", "2490.00"),
                lifetime: env_or("PRICE_LIFETIME", "4990.00"),
            },
            trial: TrialConfig {
                days: env_or_parse("TRIAL_DAYS", 7),
            },
            telegram: TelegramConfig {
                bot_token: env_or("TELEGRAM_BOT_TOKEN", ""),
                init_data_max_age_secs: parse_duration_to_secs(&env_or(
                    "TELEGRAM_INIT_DATA_MAX_AGE",
                    "1d",
                )),
            },
        }
    }

    pub fn database_url(&self) -> String {
        if let Ok(url) = env::var("DATABASE_URL") {
            return url;
        }
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.db.user, self.db.password, self.db.host, self.db.port, self.db.database
        )
    }

    pub fn redis_url(&self) -> String {
        if let Ok(url) = env::var("REDIS_URL") {
            return url;
        }
        match &self.redis.password {
            Some(pw) if !pw.is_empty() => format!(
                "redis://:{}@{}:{}/{}",
                pw, self.redis.host, self.redis.port, self.redis.db
            ),
            _ => format!(
                "redis://{}:{}/{}",
                self.redis.host, self.redis.port, self.redis.db
            ),
        }
    }
}

impl PricingConfig {
    pub fn price_for(&self, period: Period) -> &str {
        match period {
            Period::Monthly => &self.monthly,
            Period::Quarterly => &self.quarterly,
            Period::Semiannual => &self.semiannual,
            Period::Annual => &self.annual,
            Period::Biennial => &self.biennial,
            Period::Lifetime => &self.lifetime,
        }
    }
}

fn parse_duration_to_secs(s: &str) -> i64 {
    let s = s.trim();
    if s.is_empty() {
        return 3600;
    }
    let (num_str, unit) = s.split_at(s.len() - 1);
    match unit {
        "s" | "m" | "h" | "d" => {
            let num: i64 = num_str.parse().unwrap_or(1);
            match unit {
                "s" => num,
                "m" => num * 60,
                "h" => num * 3600,
                _ => num * 86400,
            }
        }
        _ => s.parse().unwrap_or(3600),
    }
}
