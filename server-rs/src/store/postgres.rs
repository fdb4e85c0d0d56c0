use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use super::Store;
use crate::cache::Cache;
use crate::error::AppResult;
use crate::models::{
    NewPayment, PaymentGrant, PaymentRecord, PaymentRow, ReferralStats, SubscriptionRecord,
    SubscriptionRow, SubscriptionWrite, TelegramProfile, User, UserRole,
};

const SUBSCRIPTION_COLUMNS: &str = "user_id, plan, period, started_at, expires_at, bonus_days, \
     is_trial, trial_bonus_months, trial_ends_at, updated_at";

const PAYMENT_COLUMNS: &str = "invoice_id, user_id, amount, currency, status, payment_method, \
     subscription_period, metadata, paid_at, created_at";

const ROLE_CACHE_TTL_SECS: u64 = 300;

#[derive(Clone)]
pub struct PgStore {
    db: PgPool,
    cache: Cache,
}

impl PgStore {
    pub fn new(db: PgPool, cache: Cache) -> Self {
        Self { db, cache }
    }

    fn role_key(user_id: Uuid) -> String {
        format!("role:{user_id}")
    }
}

/// Upsert of the entitlement fields, keyed by `user_id`.
fn subscription_upsert_sql() -> String {
    format!(
        r#"INSERT INTO subscriptions (user_id, plan, period, started_at, expires_at, is_trial, trial_ends_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
        ON CONFLICT (user_id) DO UPDATE SET
            plan = EXCLUDED.plan, period = EXCLUDED.period,
            started_at = EXCLUDED.started_at, expires_at = EXCLUDED.expires_at,
            is_trial = EXCLUDED.is_trial,
            trial_ends_at = COALESCE(EXCLUDED.trial_ends_at, subscriptions.trial_ends_at),
            updated_at = NOW()
        RETURNING {SUBSCRIPTION_COLUMNS}"#
    )
}

#[async_trait]
impl Store for PgStore {
    async fn upsert_telegram_user(&self, profile: &TelegramProfile) -> AppResult<User> {
        let user = sqlx::query_as::<_, User>(
            r#"INSERT INTO users (telegram_id, username, first_name, language_code)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (telegram_id) DO UPDATE SET
                username = EXCLUDED.username, first_name = EXCLUDED.first_name,
                language_code = EXCLUDED.language_code, updated_at = NOW()
            RETURNING id, telegram_id, username, first_name, language_code"#,
        )
        .bind(profile.id)
        .bind(&profile.username)
        .bind(&profile.first_name)
        .bind(&profile.language_code)
        .fetch_one(&self.db)
        .await?;
        Ok(user)
    }

    async fn find_user(&self, id: Uuid) -> AppResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, telegram_id, username, first_name, language_code FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn get_or_create_subscription(&self, user_id: Uuid) -> AppResult<SubscriptionRecord> {
        sqlx::query("INSERT INTO subscriptions (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING")
            .bind(user_id)
            .execute(&self.db)
            .await?;

        let sql = format!("SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE user_id = $1");
        let row = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(user_id)
            .fetch_one(&self.db)
            .await?;
        Ok(row.try_into()?)
    }

    async fn write_subscription(
        &self,
        user_id: Uuid,
        write: SubscriptionWrite,
    ) -> AppResult<SubscriptionRecord> {
        let write = write.normalized();
        let sql = subscription_upsert_sql();
        let row = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(user_id)
            .bind(write.plan.as_str())
            .bind(write.period.map(|p| p.as_str()))
            .bind(write.started_at)
            .bind(write.expires_at)
            .bind(write.is_trial)
            .bind(write.trial_ends_at)
            .fetch_one(&self.db)
            .await?;
        Ok(row.try_into()?)
    }

    async fn start_trial(
        &self,
        user_id: Uuid,
        write: SubscriptionWrite,
    ) -> AppResult<Option<SubscriptionRecord>> {
        self.get_or_create_subscription(user_id).await?;

        let write = write.normalized();
        let sql = format!(
            r#"UPDATE subscriptions SET
                plan = $2, period = $3, started_at = $4, expires_at = $5,
                is_trial = $6, trial_ends_at = $7, updated_at = NOW()
            WHERE user_id = $1 AND plan = 'free' AND trial_ends_at IS NULL
            RETURNING {SUBSCRIPTION_COLUMNS}"#
        );
        let row = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(user_id)
            .bind(write.plan.as_str())
            .bind(write.period.map(|p| p.as_str()))
            .bind(write.started_at)
            .bind(write.expires_at)
            .bind(write.is_trial)
            .bind(write.trial_ends_at)
            .fetch_optional(&self.db)
            .await?;
        Ok(row.map(SubscriptionRecord::try_from).transpose()?)
    }

    async fn add_bonus_days(&self, user_id: Uuid, days: i32) -> AppResult<SubscriptionRecord> {
        self.get_or_create_subscription(user_id).await?;

        let sql = format!(
            r#"UPDATE subscriptions
            SET bonus_days = GREATEST(LEAST(bonus_days::BIGINT + $2, 2147483647), 0)::INTEGER,
                updated_at = NOW()
            WHERE user_id = $1
            RETURNING {SUBSCRIPTION_COLUMNS}"#
        );
        let row = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(user_id)
            .bind(days)
            .fetch_one(&self.db)
            .await?;
        Ok(row.try_into()?)
    }

    async fn find_role(&self, user_id: Uuid) -> AppResult<Option<UserRole>> {
        let key = Self::role_key(user_id);
        if let Some(cached) = self.cache.get_json::<Option<UserRole>>(&key).await {
            return Ok(cached);
        }

        let role: Option<String> =
            sqlx::query_scalar("SELECT role FROM user_roles WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.db)
                .await?;
        let role = role.map(|r| r.parse::<UserRole>()).transpose()?;

        self.cache.set_json(&key, &role, ROLE_CACHE_TTL_SECS).await;
        Ok(role)
    }

    async fn set_role(&self, user_id: Uuid, role: Option<UserRole>) -> AppResult<()> {
        match role {
            Some(role) => {
                sqlx::query(
                    r#"INSERT INTO user_roles (user_id, role) VALUES ($1, $2)
                    ON CONFLICT (user_id) DO UPDATE SET role = EXCLUDED.role"#,
                )
                .bind(user_id)
                .bind(role.as_str())
                .execute(&self.db)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM user_roles WHERE user_id = $1")
                    .bind(user_id)
                    .execute(&self.db)
                    .await?;
            }
        }
        self.cache.del(&Self::role_key(user_id)).await;
        Ok(())
    }

    async fn record_referral(&self, referrer: Uuid, referred: Uuid) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO referrals (referred_id, referrer_id) VALUES ($1, $2) ON CONFLICT (referred_id) DO NOTHING",
        )
        .bind(referred)
        .bind(referrer)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn referral_stats(&self, user_id: Uuid) -> AppResult<ReferralStats> {
        let (invited_count, converted_count): (i64, i64) = sqlx::query_as(
            r#"SELECT COUNT(*)::bigint, COUNT(*) FILTER (WHERE converted)::bigint
            FROM referrals WHERE referrer_id = $1"#,
        )
        .bind(user_id)
        .fetch_one(&self.db)
        .await?;
        Ok(ReferralStats {
            invited_count,
            converted_count,
        })
    }

    async fn find_payment(&self, invoice_id: &str) -> AppResult<Option<PaymentRecord>> {
        let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE invoice_id = $1");
        let row = sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(invoice_id)
            .fetch_optional(&self.db)
            .await?;
        Ok(row.map(PaymentRecord::try_from).transpose()?)
    }

    async fn create_pending_payment(&self, payment: NewPayment) -> AppResult<PaymentRecord> {
        let sql = format!(
            r#"INSERT INTO payments (invoice_id, user_id, amount, currency, status, payment_method, subscription_period, metadata)
            VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7)
            RETURNING {PAYMENT_COLUMNS}"#
        );
        let row = sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(&payment.invoice_id)
            .bind(payment.user_id)
            .bind(&payment.amount)
            .bind(&payment.currency)
            .bind(&payment.payment_method)
            .bind(payment.period.as_str())
            .bind(&payment.metadata)
            .fetch_one(&self.db)
            .await?;
        Ok(row.try_into()?)
    }

    async fn list_payments(&self, user_id: Uuid) -> AppResult<Vec<PaymentRecord>> {
        let sql = format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE user_id = $1 ORDER BY created_at DESC LIMIT 100"
        );
        let rows = sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(user_id)
            .fetch_all(&self.db)
            .await?;
        rows.into_iter()
            .map(|r| PaymentRecord::try_from(r).map_err(Into::into))
            .collect()
    }

    async fn grant_payment(&self, grant: &PaymentGrant) -> AppResult<SubscriptionRecord> {
        let mut tx = self.db.begin().await?;

        sqlx::query(
            r#"INSERT INTO payments (invoice_id, user_id, amount, currency, status, payment_method, subscription_period, paid_at)
            VALUES ($1, $2, COALESCE($3, '0.00'), COALESCE($4, ''), 'paid', $5, $6, $7)
            ON CONFLICT (invoice_id) DO UPDATE SET
                status = 'paid', paid_at = EXCLUDED.paid_at,
                amount = COALESCE($3, payments.amount),
                currency = COALESCE($4, payments.currency),
                payment_method = COALESCE(EXCLUDED.payment_method, payments.payment_method),
                subscription_period = EXCLUDED.subscription_period"#,
        )
        .bind(&grant.invoice_id)
        .bind(grant.user_id)
        .bind(&grant.amount)
        .bind(&grant.currency)
        .bind(&grant.payment_method)
        .bind(grant.period.as_str())
        .bind(grant.paid_at)
        .execute(&mut *tx)
        .await?;

        let write = SubscriptionWrite::paid(grant.period, grant.paid_at);
        let sql = subscription_upsert_sql();
        let row = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(grant.user_id)
            .bind(write.plan.as_str())
            .bind(write.period.map(|p| p.as_str()))
            .bind(write.started_at)
            .bind(write.expires_at)
            .bind(write.is_trial)
            .bind(write.trial_ends_at)
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query("UPDATE referrals SET converted = true WHERE referred_id = $1 AND converted = false")
            .bind(grant.user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(row.try_into()?)
    }

    async fn get_setting(&self, user_id: Uuid, key: &str) -> AppResult<Option<Value>> {
        let value: Option<Value> =
            sqlx::query_scalar("SELECT value FROM user_settings WHERE user_id = $1 AND key = $2")
                .bind(user_id)
                .bind(key)
                .fetch_optional(&self.db)
                .await?;
        Ok(value)
    }

    async fn put_setting(&self, user_id: Uuid, key: &str, value: &Value) -> AppResult<()> {
        sqlx::query(
            r#"INSERT INTO user_settings (user_id, key, value) VALUES ($1, $2, $3)
            ON CONFLICT (user_id, key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()"#,
        )
        .bind(user_id)
        .bind(key)
        .bind(value)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn health_check(&self) -> bool {
        let db_ok = sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.db)
            .await
            .is_ok();
        db_ok && self.cache.health_check().await
    }
}
