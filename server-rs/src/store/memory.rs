use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::Store;
use crate::error::{AppError, AppResult};
use crate::models::{
    NewPayment, PaymentGrant, PaymentRecord, PaymentStatus, Plan, ReferralStats,
    SubscriptionRecord, SubscriptionWrite, TelegramProfile, User, UserRole,
};

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    subscriptions: HashMap<Uuid, SubscriptionRecord>,
    roles: HashMap<Uuid, UserRole>,
    payments: HashMap<String, PaymentRecord>,
    /// referred -> (referrer, converted)
    referrals: HashMap<Uuid, (Uuid, bool)>,
    settings: HashMap<(Uuid, String), Value>,
}

/// Map-backed store. Every mutation bumps a write counter so callers can
/// assert that a code path left storage untouched.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
    writes: Arc<AtomicU64>,
    failing: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mutating operations applied so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// While set, every operation fails with an internal error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Reads the subscription row without creating it.
    pub async fn peek_subscription(&self, user_id: Uuid) -> Option<SubscriptionRecord> {
        self.tables.read().await.subscriptions.get(&user_id).cloned()
    }

    fn check(&self) -> AppResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::Internal("memory store unavailable".into()));
        }
        Ok(())
    }

    fn wrote(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

fn subscription_entry(tables: &mut Tables, user_id: Uuid) -> &mut SubscriptionRecord {
    tables
        .subscriptions
        .entry(user_id)
        .or_insert_with(|| SubscriptionRecord::default_for(user_id, Utc::now()))
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_telegram_user(&self, profile: &TelegramProfile) -> AppResult<User> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let existing = tables
            .users
            .values()
            .find(|u| u.telegram_id == profile.id)
            .map(|u| u.id);
        let user = User {
            id: existing.unwrap_or_else(Uuid::new_v4),
            telegram_id: profile.id,
            username: profile.username.clone(),
            first_name: profile.first_name.clone(),
            language_code: profile.language_code.clone(),
        };
        tables.users.insert(user.id, user.clone());
        self.wrote();
        Ok(user)
    }

    async fn find_user(&self, id: Uuid) -> AppResult<Option<User>> {
        self.check()?;
        Ok(self.tables.read().await.users.get(&id).cloned())
    }

    async fn get_or_create_subscription(&self, user_id: Uuid) -> AppResult<SubscriptionRecord> {
        self.check()?;
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables.subscriptions.get(&user_id) {
            return Ok(existing.clone());
        }
        self.wrote();
        Ok(subscription_entry(&mut tables, user_id).clone())
    }

    async fn write_subscription(
        &self,
        user_id: Uuid,
        write: SubscriptionWrite,
    ) -> AppResult<SubscriptionRecord> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let record = subscription_entry(&mut tables, user_id);
        record.apply(&write, Utc::now());
        self.wrote();
        Ok(record.clone())
    }

    async fn start_trial(
        &self,
        user_id: Uuid,
        write: SubscriptionWrite,
    ) -> AppResult<Option<SubscriptionRecord>> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let record = subscription_entry(&mut tables, user_id);
        if record.plan != Plan::Free || record.trial_ends_at.is_some() {
            return Ok(None);
        }
        record.apply(&write, Utc::now());
        self.wrote();
        Ok(Some(record.clone()))
    }

    async fn add_bonus_days(&self, user_id: Uuid, days: i32) -> AppResult<SubscriptionRecord> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let record = subscription_entry(&mut tables, user_id);
        record.bonus_days = record.bonus_days.saturating_add(days).max(0);
        record.updated_at = Utc::now();
        self.wrote();
        Ok(record.clone())
    }

    async fn find_role(&self, user_id: Uuid) -> AppResult<Option<UserRole>> {
        self.check()?;
        Ok(self.tables.read().await.roles.get(&user_id).copied())
    }

    async fn set_role(&self, user_id: Uuid, role: Option<UserRole>) -> AppResult<()> {
        self.check()?;
        let mut tables = self.tables.write().await;
        match role {
            Some(role) => tables.roles.insert(user_id, role),
            None => tables.roles.remove(&user_id),
        };
        self.wrote();
        Ok(())
    }

    async fn record_referral(&self, referrer: Uuid, referred: Uuid) -> AppResult<()> {
        self.check()?;
        let mut tables = self.tables.write().await;
        if !tables.referrals.contains_key(&referred) {
            tables.referrals.insert(referred, (referrer, false));
            self.wrote();
        }
        Ok(())
    }

    async fn referral_stats(&self, user_id: Uuid) -> AppResult<ReferralStats> {
        self.check()?;
        let tables = self.tables.read().await;
        let mine = tables.referrals.values().filter(|(r, _)| *r == user_id);
        let (invited, converted) = mine.fold((0, 0), |(i, c), (_, conv)| {
            (i + 1, c + i64::from(*conv))
        });
        Ok(ReferralStats {
            invited_count: invited,
            converted_count: converted,
        })
    }

    async fn find_payment(&self, invoice_id: &str) -> AppResult<Option<PaymentRecord>> {
        self.check()?;
        Ok(self.tables.read().await.payments.get(invoice_id).cloned())
    }

    async fn create_pending_payment(&self, payment: NewPayment) -> AppResult<PaymentRecord> {
        self.check()?;
        let mut tables = self.tables.write().await;
        if tables.payments.contains_key(&payment.invoice_id) {
            return Err(AppError::Conflict(format!(
                "payment {} already exists",
                payment.invoice_id
            )));
        }
        let record = PaymentRecord {
            invoice_id: payment.invoice_id.clone(),
            user_id: payment.user_id,
            amount: payment.amount,
            currency: payment.currency,
            status: PaymentStatus::Pending,
            payment_method: payment.payment_method,
            subscription_period: Some(payment.period),
            metadata: payment.metadata,
            paid_at: None,
            created_at: Utc::now(),
        };
        tables.payments.insert(payment.invoice_id, record.clone());
        self.wrote();
        Ok(record)
    }

    async fn list_payments(&self, user_id: Uuid) -> AppResult<Vec<PaymentRecord>> {
        self.check()?;
        let tables = self.tables.read().await;
        let mut payments: Vec<_> = tables
            .payments
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        payments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(payments)
    }

    async fn grant_payment(&self, grant: &PaymentGrant) -> AppResult<SubscriptionRecord> {
        self.check()?;
        let mut tables = self.tables.write().await;

        let payment = tables
            .payments
            .entry(grant.invoice_id.clone())
            .or_insert_with(|| PaymentRecord {
                invoice_id: grant.invoice_id.clone(),
                user_id: grant.user_id,
                amount: "0.00".into(),
                currency: String::new(),
                status: PaymentStatus::Pending,
                payment_method: None,
                subscription_period: None,
                metadata: json!({}),
                paid_at: None,
                created_at: grant.paid_at,
            });
        payment.status = PaymentStatus::Paid;
        payment.paid_at = Some(grant.paid_at);
        payment.subscription_period = Some(grant.period);
        if let Some(amount) = &grant.amount {
            payment.amount = amount.clone();
        }
        if let Some(currency) = &grant.currency {
            payment.currency = currency.clone();
        }
        if grant.payment_method.is_some() {
            payment.payment_method = grant.payment_method.clone();
        }

        if let Some((_, converted)) = tables.referrals.get_mut(&grant.user_id) {
            *converted = true;
        }

        let record = subscription_entry(&mut tables, grant.user_id);
        record.apply(
            &SubscriptionWrite::paid(grant.period, grant.paid_at),
            grant.paid_at,
        );
        self.wrote();
        Ok(record.clone())
    }

    async fn get_setting(&self, user_id: Uuid, key: &str) -> AppResult<Option<Value>> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables.settings.get(&(user_id, key.to_string())).cloned())
    }

    async fn put_setting(&self, user_id: Uuid, key: &str, value: &Value) -> AppResult<()> {
        self.check()?;
        let mut tables = self.tables.write().await;
        tables
            .settings
            .insert((user_id, key.to_string()), value.clone());
        self.wrote();
        Ok(())
    }

    async fn health_check(&self) -> bool {
        !self.failing.load(Ordering::SeqCst)
    }
}
