//! Payment webhook processing.
//!
//! The inbound body is untrusted: it only names a payment. Entitlement is
//! granted from the gateway's own record of that payment, fetched
//! server-to-server, and only once per payment id. Every rejection happens
//! before the first write.

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::feed::SubscriptionFeed;
use super::gateway::{GatewayError, PaymentGateway};
use crate::error::{AppError, AppResult};
use crate::models::{PaymentGrant, PaymentStatus, Period, SubscriptionRecord};
use crate::store::Store;

pub const PAYMENT_SUCCEEDED_EVENT: &str = "payment.succeeded";
const GATEWAY_STATUS_SUCCEEDED: &str = "succeeded";

#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    /// Not a payment-succeeded notification; acknowledged untouched.
    Ignored { event: String },
    /// The payment was already marked paid by an earlier delivery.
    AlreadyProcessed { payment_id: String },
    Granted {
        payment_id: String,
        subscription: SubscriptionRecord,
    },
}

fn invalid(msg: &str) -> AppError {
    tracing::info!("payment webhook rejected: {msg}");
    AppError::BadRequest(msg.to_string())
}

fn parse_period(value: &Value) -> AppResult<Period> {
    value
        .as_str()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| invalid("unknown subscription period"))
}

fn parse_user_id(value: &Value) -> Option<Uuid> {
    value.as_str().and_then(|s| Uuid::parse_str(s).ok())
}

pub async fn process_payment_webhook(
    store: &dyn Store,
    gateway: Option<&dyn PaymentGateway>,
    feed: &SubscriptionFeed,
    payload: &Value,
    now: DateTime<Utc>,
) -> AppResult<WebhookOutcome> {
    let event = payload["event"].as_str().unwrap_or_default();
    if event != PAYMENT_SUCCEEDED_EVENT {
        tracing::debug!(event, "ignoring payment webhook event");
        return Ok(WebhookOutcome::Ignored {
            event: event.to_string(),
        });
    }

    let object = &payload["object"];
    let payment_id = object["id"]
        .as_str()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| invalid("payment id missing"))?;
    let claimed_user = parse_user_id(&object["metadata"]["user_id"])
        .ok_or_else(|| invalid("user_id missing"))?;
    parse_period(&object["metadata"]["period"])?;

    // Checked only once a lookup is needed, so ignored events are still acknowledged.
    let gateway =
        gateway.ok_or_else(|| AppError::Internal("payment gateway not configured".into()))?;

    let verified = match gateway.fetch_payment(payment_id).await {
        Ok(payment) => payment,
        Err(GatewayError::Rejected { status, message }) => {
            tracing::warn!(
                target: "security",
                payment_id,
                status,
                "payment lookup refused by gateway: {message}"
            );
            return Err(AppError::BadRequest("payment could not be verified".into()));
        }
        Err(e) => return Err(AppError::BadGateway(e.to_string())),
    };

    if verified.id != payment_id {
        tracing::warn!(target: "security", payment_id, returned = %verified.id, "gateway returned a different payment");
        return Err(AppError::BadRequest("payment could not be verified".into()));
    }

    if verified.status != GATEWAY_STATUS_SUCCEEDED {
        tracing::warn!(
            target: "security",
            payment_id,
            status = %verified.status,
            "payment webhook claims success the gateway does not confirm"
        );
        return Err(AppError::BadRequest("payment has not succeeded".into()));
    }

    let verified_user = parse_user_id(&verified.metadata["user_id"]);
    if verified_user != Some(claimed_user) {
        tracing::warn!(
            target: "security",
            payment_id,
            claimed_user = %claimed_user,
            "payment webhook user does not match the payment owner"
        );
        return Err(AppError::Forbidden("payment does not belong to this user".into()));
    }

    let period = parse_period(&verified.metadata["period"])?;

    if let Some(existing) = store.find_payment(payment_id).await? {
        if existing.user_id != claimed_user {
            tracing::warn!(
                target: "security",
                payment_id,
                claimed_user = %claimed_user,
                "payment row belongs to another user"
            );
            return Err(AppError::Forbidden("payment does not belong to this user".into()));
        }
        if existing.status == PaymentStatus::Paid {
            tracing::info!(payment_id, "payment already processed");
            return Ok(WebhookOutcome::AlreadyProcessed {
                payment_id: payment_id.to_string(),
            });
        }
    }

    if store.find_user(claimed_user).await?.is_none() {
        tracing::error!(payment_id, user_id = %claimed_user, "verified payment names an unknown user");
        return Err(invalid("payment names an unknown user"));
    }

    let grant = PaymentGrant {
        invoice_id: payment_id.to_string(),
        user_id: claimed_user,
        period,
        amount: verified.amount,
        currency: verified.currency,
        payment_method: verified.payment_method,
        paid_at: now,
    };
    let subscription = store.grant_payment(&grant).await?;
    feed.publish(subscription.clone());

    tracing::info!(
        payment_id,
        user_id = %claimed_user,
        %period,
        expires_at = ?subscription.expires_at,
        "subscription granted"
    );

    Ok(WebhookOutcome::Granted {
        payment_id: payment_id.to_string(),
        subscription,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{NewPayment, Plan, TelegramProfile};
    use crate::services::entitlement::resolve;
    use crate::services::feed::FeedEvent;
    use crate::services::gateway::{CreatePayment, GatewayPayment};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Clone)]
    pub(crate) enum Reply {
        Payment(GatewayPayment),
        Rejected(u16),
        Down,
    }

    /// Gateway double answering from a fixed table of payments.
    #[derive(Default)]
    pub(crate) struct FakeGateway {
        replies: Mutex<HashMap<String, Reply>>,
        fetches: AtomicUsize,
    }

    impl FakeGateway {
        pub(crate) fn with(id: &str, reply: Reply) -> Self {
            let gw = Self::default();
            gw.set(id, reply);
            gw
        }

        pub(crate) fn set(&self, id: &str, reply: Reply) {
            self.replies.lock().unwrap().insert(id.to_string(), reply);
        }

        pub(crate) fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PaymentGateway for FakeGateway {
        async fn fetch_payment(&self, payment_id: &str) -> Result<GatewayPayment, GatewayError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let reply = self.replies.lock().unwrap().get(payment_id).cloned();
            match reply {
                Some(Reply::Payment(p)) => Ok(p),
                Some(Reply::Rejected(status)) => Err(GatewayError::Rejected {
                    status,
                    message: "rejected".into(),
                }),
                Some(Reply::Down) => Err(GatewayError::Unreachable("connection refused".into())),
                None => Err(GatewayError::Rejected {
                    status: 404,
                    message: "not found".into(),
                }),
            }
        }

        async fn create_payment(
            &self,
            request: &CreatePayment,
        ) -> Result<GatewayPayment, GatewayError> {
            let id = format!("pay_{}", request.idempotence_key);
            let payment = GatewayPayment {
                id: id.clone(),
                status: "pending".into(),
                metadata: request.metadata.clone(),
                amount: Some(request.amount.clone()),
                currency: Some(request.currency.clone()),
                payment_method: None,
                confirmation_url: Some(format!("https://pay.example/{id}")),
            };
            self.set(&id, Reply::Payment(payment.clone()));
            Ok(payment)
        }
    }

    pub(crate) fn gateway_payment(id: &str, status: &str, user: Uuid, period: &str) -> GatewayPayment {
        GatewayPayment {
            id: id.into(),
            status: status.into(),
            metadata: json!({ "user_id": user.to_string(), "period": period }),
            amount: Some("199.00".into()),
            currency: Some("RUB".into()),
            payment_method: Some("bank_card".into()),
            confirmation_url: None,
        }
    }

    pub(crate) fn succeeded_event(id: &str, user: &str, period: &str) -> Value {
        json!({
            "type": "notification",
            "event": "payment.succeeded",
            "object": {
                "id": id,
                "status": "succeeded",
                "metadata": { "user_id": user, "period": period }
            }
        })
    }

    /// A user row the grant can attach to.
    async fn registered(store: &MemoryStore) -> Uuid {
        store
            .upsert_telegram_user(&TelegramProfile {
                id: (Uuid::new_v4().as_u128() >> 66) as i64,
                username: None,
                first_name: None,
                language_code: None,
            })
            .await
            .unwrap()
            .id
    }

    fn jan_1() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    async fn run(
        store: &MemoryStore,
        gateway: &FakeGateway,
        payload: &Value,
        now: DateTime<Utc>,
    ) -> AppResult<WebhookOutcome> {
        let feed = SubscriptionFeed::new();
        process_payment_webhook(store, Some(gateway as &dyn PaymentGateway), &feed, payload, now).await
    }

    fn status_of(result: AppResult<WebhookOutcome>) -> StatusCode {
        result.expect_err("expected rejection").status()
    }

    #[tokio::test]
    async fn other_events_are_ignored() {
        let store = MemoryStore::new();
        let gateway = FakeGateway::default();
        for event in ["payment.canceled", "payment.waiting_for_capture", "refund.succeeded", ""] {
            let mut payload = succeeded_event("p1", &Uuid::new_v4().to_string(), "monthly");
            payload["event"] = json!(event);
            let outcome = run(&store, &gateway, &payload, jan_1()).await.unwrap();
            assert!(matches!(outcome, WebhookOutcome::Ignored { .. }));
        }
        assert_eq!(store.write_count(), 0);
        assert_eq!(gateway.fetches(), 0);
    }

    #[tokio::test]
    async fn malformed_payloads_are_rejected_before_any_lookup() {
        let store = MemoryStore::new();
        let gateway = FakeGateway::default();
        let user = Uuid::new_v4().to_string();

        let mut no_user = succeeded_event("p1", &user, "monthly");
        no_user["object"]["metadata"]
            .as_object_mut()
            .unwrap()
            .remove("user_id");
        let mut numeric_id = succeeded_event("p1", &user, "monthly");
        numeric_id["object"]["id"] = json!(42);

        let cases = [
            no_user,
            numeric_id,
            succeeded_event("", &user, "monthly"),
            succeeded_event("p1", "not-a-uuid", "monthly"),
            succeeded_event("p1", &user, "weekly"),
            json!({ "event": "payment.succeeded" }),
        ];
        for payload in &cases {
            assert_eq!(
                status_of(run(&store, &gateway, payload, jan_1()).await),
                StatusCode::BAD_REQUEST
            );
        }
        assert_eq!(store.write_count(), 0);
        assert_eq!(gateway.fetches(), 0);
    }

    #[tokio::test]
    async fn unverifiable_payments_are_rejected() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let payload = succeeded_event("p1", &user.to_string(), "monthly");

        let gateway = FakeGateway::with("p1", Reply::Rejected(404));
        assert_eq!(
            status_of(run(&store, &gateway, &payload, jan_1()).await),
            StatusCode::BAD_REQUEST
        );

        for status in ["pending", "canceled", "waiting_for_capture"] {
            gateway.set("p1", Reply::Payment(gateway_payment("p1", status, user, "monthly")));
            assert_eq!(
                status_of(run(&store, &gateway, &payload, jan_1()).await),
                StatusCode::BAD_REQUEST
            );
        }

        gateway.set("p1", Reply::Payment(gateway_payment("p2", "succeeded", user, "monthly")));
        assert_eq!(
            status_of(run(&store, &gateway, &payload, jan_1()).await),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn unreachable_gateway_is_a_bad_gateway() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let gateway = FakeGateway::with("p1", Reply::Down);
        let payload = succeeded_event("p1", &user.to_string(), "monthly");
        assert_eq!(
            status_of(run(&store, &gateway, &payload, jan_1()).await),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn someone_elses_payment_is_forbidden() {
        let store = MemoryStore::new();
        let (attacker, victim) = (Uuid::new_v4(), Uuid::new_v4());
        let gateway = FakeGateway::with(
            "p1",
            Reply::Payment(gateway_payment("p1", "succeeded", victim, "annual")),
        );
        let payload = succeeded_event("p1", &attacker.to_string(), "annual");

        assert_eq!(
            status_of(run(&store, &gateway, &payload, jan_1()).await),
            StatusCode::FORBIDDEN
        );
        assert_eq!(store.write_count(), 0);
        assert!(store.find_payment("p1").await.unwrap().is_none());
        assert!(store.peek_subscription(attacker).await.is_none());
        assert!(store.peek_subscription(victim).await.is_none());
    }

    #[tokio::test]
    async fn authoritative_period_must_be_valid() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let gateway = FakeGateway::with(
            "p1",
            Reply::Payment(gateway_payment("p1", "succeeded", user, "forever")),
        );
        let payload = succeeded_event("p1", &user.to_string(), "monthly");
        assert_eq!(
            status_of(run(&store, &gateway, &payload, jan_1()).await),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn monthly_payment_grants_thirty_days() {
        let store = MemoryStore::new();
        let feed = SubscriptionFeed::new();
        let user = registered(&store).await;
        let mut events = feed.subscribe(user);
        let gateway = FakeGateway::with(
            "p1",
            Reply::Payment(gateway_payment("p1", "succeeded", user, "monthly")),
        );
        let payload = succeeded_event("p1", &user.to_string(), "monthly");

        let outcome = process_payment_webhook(&store, Some(&gateway as &dyn PaymentGateway), &feed, &payload, jan_1())
            .await
            .unwrap();
        let WebhookOutcome::Granted { subscription, .. } = outcome else {
            panic!("expected grant, got {outcome:?}");
        };
        assert_eq!(subscription.plan, Plan::Pro);
        assert_eq!(subscription.period, Some(Period::Monthly));
        assert!(!subscription.is_trial);
        assert_eq!(subscription.started_at, jan_1());
        assert_eq!(
            subscription.expires_at,
            Some(Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap())
        );

        let payment = store.find_payment("p1").await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Paid);
        assert_eq!(payment.paid_at, Some(jan_1()));
        assert_eq!(payment.amount, "199.00");

        assert_eq!(events.next().await, Some(FeedEvent::Snapshot(subscription)));
    }

    #[tokio::test]
    async fn authoritative_period_wins_over_claimed() {
        let store = MemoryStore::new();
        let user = registered(&store).await;
        let gateway = FakeGateway::with(
            "p1",
            Reply::Payment(gateway_payment("p1", "succeeded", user, "monthly")),
        );
        let payload = succeeded_event("p1", &user.to_string(), "lifetime");

        run(&store, &gateway, &payload, jan_1()).await.unwrap();
        let sub = store.peek_subscription(user).await.unwrap();
        assert_eq!(sub.period, Some(Period::Monthly));
    }

    #[tokio::test]
    async fn lifetime_payment_never_expires() {
        let store = MemoryStore::new();
        let user = registered(&store).await;
        let gateway = FakeGateway::with(
            "p1",
            Reply::Payment(gateway_payment("p1", "succeeded", user, "lifetime")),
        );
        let payload = succeeded_event("p1", &user.to_string(), "lifetime");

        run(&store, &gateway, &payload, jan_1()).await.unwrap();
        let sub = store.peek_subscription(user).await.unwrap();
        assert_eq!(sub.expires_at, None);
        let far_future = Utc.with_ymd_and_hms(2099, 1, 1, 0, 0, 0).unwrap();
        assert!(resolve(Some(&sub), None, far_future).is_pro_active);
    }

    #[tokio::test]
    async fn replays_do_not_extend_expiry() {
        let store = MemoryStore::new();
        let user = registered(&store).await;
        let gateway = FakeGateway::with(
            "p1",
            Reply::Payment(gateway_payment("p1", "succeeded", user, "annual")),
        );
        let payload = succeeded_event("p1", &user.to_string(), "annual");

        run(&store, &gateway, &payload, jan_1()).await.unwrap();
        let first = store.peek_subscription(user).await.unwrap();
        let writes = store.write_count();

        for days_later in [1, 30] {
            let later = jan_1() + chrono::Duration::days(days_later);
            let outcome = run(&store, &gateway, &payload, later).await.unwrap();
            assert!(matches!(outcome, WebhookOutcome::AlreadyProcessed { .. }));
        }
        assert_eq!(store.peek_subscription(user).await.unwrap(), first);
        assert_eq!(store.write_count(), writes);
    }

    #[tokio::test]
    async fn concurrent_deliveries_converge() {
        let store = MemoryStore::new();
        let user = registered(&store).await;
        let gateway = FakeGateway::with(
            "p1",
            Reply::Payment(gateway_payment("p1", "succeeded", user, "quarterly")),
        );
        let payload = succeeded_event("p1", &user.to_string(), "quarterly");

        let (a, b) = tokio::join!(
            run(&store, &gateway, &payload, jan_1()),
            run(&store, &gateway, &payload, jan_1())
        );
        assert!(a.is_ok() && b.is_ok());
        let sub = store.peek_subscription(user).await.unwrap();
        assert_eq!(sub.expires_at, Period::Quarterly.expires_at(jan_1()));
    }

    #[tokio::test]
    async fn pending_checkout_row_becomes_paid() {
        let store = MemoryStore::new();
        let user = registered(&store).await;
        store
            .create_pending_payment(NewPayment {
                invoice_id: "p1".into(),
                user_id: user,
                amount: "199.00".into(),
                currency: "RUB".into(),
                payment_method: None,
                period: Period::Monthly,
                metadata: json!({}),
            })
            .await
            .unwrap();
        let gateway = FakeGateway::with(
            "p1",
            Reply::Payment(gateway_payment("p1", "succeeded", user, "monthly")),
        );
        let payload = succeeded_event("p1", &user.to_string(), "monthly");

        run(&store, &gateway, &payload, jan_1()).await.unwrap();
        let payment = store.find_payment("p1").await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Paid);
        assert_eq!(payment.payment_method.as_deref(), Some("bank_card"));
    }

    #[tokio::test]
    async fn storage_failure_is_a_server_error() {
        let store = MemoryStore::new();
        let user = registered(&store).await;
        let gateway = FakeGateway::with(
            "p1",
            Reply::Payment(gateway_payment("p1", "succeeded", user, "monthly")),
        );
        let payload = succeeded_event("p1", &user.to_string(), "monthly");

        store.set_failing(true);
        assert_eq!(
            status_of(run(&store, &gateway, &payload, jan_1()).await),
            StatusCode::INTERNAL_SERVER_ERROR
        );

        // The gateway retries; the retry succeeds once storage is back.
        store.set_failing(false);
        let outcome = run(&store, &gateway, &payload, jan_1()).await.unwrap();
        assert!(matches!(outcome, WebhookOutcome::Granted { .. }));
    }

    #[tokio::test]
    async fn missing_gateway_only_matters_for_succeeded_events() {
        let store = MemoryStore::new();
        let feed = SubscriptionFeed::new();
        let ignored = json!({ "event": "payment.canceled", "object": {} });
        let outcome = process_payment_webhook(&store, None, &feed, &ignored, jan_1())
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Ignored { .. }));

        let payload = succeeded_event("p1", &Uuid::new_v4().to_string(), "monthly");
        assert_eq!(
            status_of(process_payment_webhook(&store, None, &feed, &payload, jan_1()).await),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn payment_for_an_unknown_user_is_not_retried_forever() {
        let store = MemoryStore::new();
        let ghost = Uuid::new_v4();
        let gateway = FakeGateway::with(
            "p1",
            Reply::Payment(gateway_payment("p1", "succeeded", ghost, "monthly")),
        );
        let payload = succeeded_event("p1", &ghost.to_string(), "monthly");

        assert_eq!(
            status_of(run(&store, &gateway, &payload, jan_1()).await),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(store.write_count(), 0);
        assert!(store.find_payment("p1").await.unwrap().is_none());
    }
}
