use axum::{extract::State, Extension, Json};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::middleware::auth::AuthUser;
use crate::models::{CheckoutRequest, NewPayment, PaymentRecord};
use crate::services::gateway::{CreatePayment, GatewayError};
use crate::AppState;

pub async fn checkout(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<CheckoutRequest>,
) -> AppResult<Json<Value>> {
    let gateway = state
        .gateway
        .as_deref()
        .ok_or_else(|| AppError::Internal("payment gateway not configured".into()))?;

    let amount = state.config.pricing.price_for(body.period).to_string();
    let currency = state.config.gateway.currency.clone();
    let metadata = json!({
        "user_id": user.id.to_string(),
        "period": body.period.as_str(),
    });

    let payment = gateway
        .create_payment(&CreatePayment {
            amount: amount.clone(),
            currency: currency.clone(),
            description: format!("Pro subscription ({})", body.period),
            return_url: state.config.gateway.return_url.clone(),
            metadata: metadata.clone(),
            idempotence_key: Uuid::new_v4().to_string(),
        })
        .await
        .map_err(|e| match e {
            GatewayError::Rejected { .. } => AppError::BadRequest("Payment could not be created".into()),
            other => AppError::BadGateway(other.to_string()),
        })?;

    state
        .store
        .create_pending_payment(NewPayment {
            invoice_id: payment.id.clone(),
            user_id: user.id,
            amount,
            currency,
            payment_method: payment.payment_method.clone(),
            period: body.period,
            metadata,
        })
        .await?;

    tracing::info!(user_id = %user.id, payment_id = %payment.id, period = %body.period, "checkout started");

    Ok(Json(json!({
        "paymentId": payment.id,
        "confirmationUrl": payment.confirmation_url,
    })))
}

pub async fn payments(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> AppResult<Json<Vec<PaymentRecord>>> {
    Ok(Json(state.store.list_payments(user.id).await?))
}
