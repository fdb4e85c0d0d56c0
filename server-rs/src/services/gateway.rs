use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::GatewayConfig;

/// A payment as the gateway reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayPayment {
    pub id: String,
    pub status: String,
    pub metadata: Value,
    pub amount: Option<String>,
    pub currency: Option<String>,
    pub payment_method: Option<String>,
    pub confirmation_url: Option<String>,
}

impl GatewayPayment {
    pub fn from_json(body: &Value) -> Result<Self, GatewayError> {
        let id = body["id"]
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| GatewayError::Malformed("payment without id".into()))?;
        let status = body["status"]
            .as_str()
            .ok_or_else(|| GatewayError::Malformed(format!("payment {id} without status")))?;
        let metadata = match &body["metadata"] {
            Value::Object(_) => body["metadata"].clone(),
            _ => json!({}),
        };
        let text = |v: &Value| v.as_str().map(String::from);

        Ok(Self {
            id: id.to_string(),
            status: status.to_string(),
            metadata,
            amount: text(&body["amount"]["value"]),
            currency: text(&body["amount"]["currency"]),
            payment_method: text(&body["payment_method"]["type"]),
            confirmation_url: text(&body["confirmation"]["confirmation_url"]),
        })
    }
}

#[derive(Debug, Clone)]
pub struct CreatePayment {
    pub amount: String,
    pub currency: String,
    pub description: String,
    pub return_url: String,
    pub metadata: Value,
    /// Sent as `Idempotence-Key`; retries with the same key create one payment.
    pub idempotence_key: String,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway unreachable: {0}")]
    Unreachable(String),

    #[error("gateway answered {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("gateway response malformed: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Server-to-server read of the authoritative payment record.
    async fn fetch_payment(&self, payment_id: &str) -> Result<GatewayPayment, GatewayError>;

    async fn create_payment(&self, request: &CreatePayment) -> Result<GatewayPayment, GatewayError>;
}

/// YooKassa REST client over raw HTTP, authenticated with the shop id and
/// secret key as Basic credentials.
#[derive(Clone)]
pub struct YooKassaClient {
    shop_id: String,
    secret_key: String,
    api_base: String,
    client: reqwest::Client,
}

impl YooKassaClient {
    pub fn new(config: &GatewayConfig) -> Option<Self> {
        if config.shop_id.is_empty() || config.secret_key.is_empty() {
            return None;
        }
        Some(Self {
            shop_id: config.shop_id.clone(),
            secret_key: config.secret_key.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
        })
    }

    async fn read(&self, resp: reqwest::Response) -> Result<GatewayPayment, GatewayError> {
        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| GatewayError::Malformed(format!("response parse failed: {e}")))?;

        if !status.is_success() {
            let message = body["description"]
                .as_str()
                .unwrap_or("Unknown gateway error")
                .to_string();
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        GatewayPayment::from_json(&body)
    }
}

#[async_trait]
impl PaymentGateway for YooKassaClient {
    async fn fetch_payment(&self, payment_id: &str) -> Result<GatewayPayment, GatewayError> {
        let url = format!(
            "{}/payments/{}",
            self.api_base,
            urlencoding::encode(payment_id)
        );
        let resp = self
            .client
            .get(&url)
            .basic_auth(&self.shop_id, Some(&self.secret_key))
            .send()
            .await
            .map_err(|e| GatewayError::Unreachable(e.to_string()))?;
        self.read(resp).await
    }

    async fn create_payment(&self, request: &CreatePayment) -> Result<GatewayPayment, GatewayError> {
        let url = format!("{}/payments", self.api_base);
        let body = json!({
            "amount": { "value": request.amount, "currency": request.currency },
            "capture": true,
            "confirmation": { "type": "redirect", "return_url": request.return_url },
            "description": request.description,
            "metadata": request.metadata,
        });
        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.shop_id, Some(&self.secret_key))
            .header("Idempotence-Key", &request.idempotence_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Unreachable(e.to_string()))?;
        self.read(resp).await
    }
}
