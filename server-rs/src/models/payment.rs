use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use super::subscription::{Period, UnknownVariant};

/// `pending -> paid`; paid is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Paid,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "paid" => Ok(PaymentStatus::Paid),
            other => Err(UnknownVariant::new("payment status", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub invoice_id: String,
    pub user_id: Uuid,
    pub amount: String,
    pub currency: String,
    pub status: PaymentStatus,
    pub payment_method: Option<String>,
    pub subscription_period: Option<Period>,
    pub metadata: serde_json::Value,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PaymentRow {
    pub invoice_id: String,
    pub user_id: Uuid,
    pub amount: String,
    pub currency: String,
    pub status: String,
    pub payment_method: Option<String>,
    pub subscription_period: Option<String>,
    pub metadata: serde_json::Value,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for PaymentRecord {
    type Error = UnknownVariant;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(Self {
            invoice_id: row.invoice_id,
            user_id: row.user_id,
            amount: row.amount,
            currency: row.currency,
            status: row.status.parse()?,
            payment_method: row.payment_method,
            subscription_period: row
                .subscription_period
                .as_deref()
                .map(str::parse)
                .transpose()?,
            metadata: row.metadata,
            paid_at: row.paid_at,
            created_at: row.created_at,
        })
    }
}

/// A payment initiated through checkout, stored as `pending`.
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub invoice_id: String,
    pub user_id: Uuid,
    pub amount: String,
    pub currency: String,
    pub payment_method: Option<String>,
    pub period: Period,
    pub metadata: serde_json::Value,
}

/// Everything a verified webhook writes: the payment transition to `paid`
/// and the subscription overwrite for the same user.
#[derive(Debug, Clone)]
pub struct PaymentGrant {
    pub invoice_id: String,
    pub user_id: Uuid,
    pub period: Period,
    pub amount: Option<String>,
    pub currency: Option<String>,
    pub payment_method: Option<String>,
    pub paid_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub period: Period,
}
