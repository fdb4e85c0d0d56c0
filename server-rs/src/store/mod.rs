//! Persistence seam between handlers/services and storage.
//!
//! [`PgStore`] is the production backend; [`MemoryStore`] backs local
//! development (`STORE_BACKEND=memory`) and the test suite.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{
    NewPayment, PaymentGrant, PaymentRecord, ReferralStats, SubscriptionRecord, SubscriptionWrite,
    TelegramProfile, User, UserRole,
};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait Store: Send + Sync {
    /// Creates the user on first login, refreshes the profile afterwards.
    async fn upsert_telegram_user(&self, profile: &TelegramProfile) -> AppResult<User>;

    async fn find_user(&self, id: Uuid) -> AppResult<Option<User>>;

    /// Returns the user's subscription, inserting the free default row if
    /// none exists. Concurrent first reads resolve to the same row.
    async fn get_or_create_subscription(&self, user_id: Uuid) -> AppResult<SubscriptionRecord>;

    /// Overwrites the entitlement fields; the write is normalised first.
    async fn write_subscription(
        &self,
        user_id: Uuid,
        write: SubscriptionWrite,
    ) -> AppResult<SubscriptionRecord>;

    /// Applies `write` only while the row is free and has never had a
    /// trial. Returns `None` when the condition does not hold.
    async fn start_trial(
        &self,
        user_id: Uuid,
        write: SubscriptionWrite,
    ) -> AppResult<Option<SubscriptionRecord>>;

    async fn add_bonus_days(&self, user_id: Uuid, days: i32) -> AppResult<SubscriptionRecord>;

    /// `None` when the user has no role row.
    async fn find_role(&self, user_id: Uuid) -> AppResult<Option<UserRole>>;

    async fn set_role(&self, user_id: Uuid, role: Option<UserRole>) -> AppResult<()>;

    /// Records that `referred` joined through `referrer`'s link. A user is
    /// referred at most once; later calls are ignored.
    async fn record_referral(&self, referrer: Uuid, referred: Uuid) -> AppResult<()>;

    async fn referral_stats(&self, user_id: Uuid) -> AppResult<ReferralStats>;

    async fn find_payment(&self, invoice_id: &str) -> AppResult<Option<PaymentRecord>>;

    async fn create_pending_payment(&self, payment: NewPayment) -> AppResult<PaymentRecord>;

    async fn list_payments(&self, user_id: Uuid) -> AppResult<Vec<PaymentRecord>>;

    /// Marks the payment paid and overwrites the user's subscription with
    /// the paid grant, as one unit. Re-applying the same grant converges to
    /// the same state.
    async fn grant_payment(&self, grant: &PaymentGrant) -> AppResult<SubscriptionRecord>;

    async fn get_setting(&self, user_id: Uuid, key: &str) -> AppResult<Option<Value>>;

    async fn put_setting(&self, user_id: Uuid, key: &str, value: &Value) -> AppResult<()>;

    async fn health_check(&self) -> bool;
}
