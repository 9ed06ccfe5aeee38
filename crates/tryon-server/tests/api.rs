// HTTP-level tests for tryon-server
//
// Drives the full Axum router with tower::ServiceExt::oneshot against an
// in-memory store and a scripted gateway.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{Duration, Utc};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use tryon_payments::{
    GatewayOrder, GatewayOrderReply, GatewayOrderState, GatewayOrderStatus, Interval,
    MemoryPaymentStore, NOTIFY_FIELDS, PayRail, PaymentError, PaymentGateway, PaymentRecord,
    PaymentStatus, PaymentStore, PaymentType, PriceCatalog, Result, Signer, TracingNotifier,
};
use tryon_server::{AppState, app};

const SECRET: &str = "integration_secret";

// ─── Test Gateway ─────────────────────────────────────────────────

/// Issues sequential order ids; refuses orders for the `o_bad` openid.
struct TestGateway {
    signer: Signer,
    issued: AtomicUsize,
}

impl TestGateway {
    fn new() -> Self {
        Self {
            signer: Signer::new(SECRET),
            issued: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl PaymentGateway for TestGateway {
    async fn create_order(&self, order: &GatewayOrder) -> Result<GatewayOrderReply> {
        if order.openid.as_deref() == Some("o_bad") {
            return Err(PaymentError::GatewayRejected {
                code: "openid_invalid".into(),
                rail: order.rail,
            });
        }
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(GatewayOrderReply {
            gateway_order_id: format!("aoid_{n}"),
            qr_code: (order.rail == PayRail::Alipay).then(|| format!("qr://{}", order.order_no)),
            expires_in: 300,
        })
    }

    async fn query_order(&self, _gateway_order_id: &str) -> Result<GatewayOrderStatus> {
        Ok(GatewayOrderStatus::new(GatewayOrderState::Processing))
    }

    fn signer(&self) -> &Signer {
        &self.signer
    }

    fn notify_url(&self) -> &str {
        "http://localhost/webhook/payment"
    }
}

// ─── Helpers ──────────────────────────────────────────────────────

fn test_app() -> (Router, Arc<MemoryPaymentStore>) {
    let store = Arc::new(MemoryPaymentStore::new());
    let state = AppState::new(
        Arc::new(PriceCatalog::builtin()),
        Arc::new(TestGateway::new()),
        store.clone(),
        Arc::new(TracingNotifier),
        true,
    );
    (app(state), store)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec())
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let (status, body) = send(app, request).await;
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

async fn post_json(app: &Router, uri: &str, payload: &Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .unwrap();
    let (status, body) = send(app, request).await;
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

async fn gated(app: &Router, user_id: Option<&str>) -> (StatusCode, Value) {
    let mut builder = Request::builder().uri("/api/tryon/access");
    if let Some(user_id) = user_id {
        builder = builder.header("x-user-id", user_id);
    }
    let (status, body) = send(app, builder.body(Body::empty()).unwrap()).await;
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

fn encode(value: &str) -> String {
    value
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => (b as char).to_string(),
            _ => format!("%{b:02X}"),
        })
        .collect()
}

/// Form body of a signed gateway notification
fn notification_body(aoid: &str, order_no: &str, pay_price: &str) -> Vec<(String, String)> {
    let values = [order_no, aoid, pay_price, "2026-10-18 12:00:05"];
    let fields: Vec<(&str, &str)> = NOTIFY_FIELDS.iter().copied().zip(values).collect();
    let sign = Signer::new(SECRET).sign(&fields);

    let mut form: Vec<(String, String)> = fields
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    form.push(("sign".into(), sign));
    form
}

async fn post_webhook(app: &Router, form: &[(String, String)]) -> (StatusCode, String) {
    let body = form
        .iter()
        .map(|(k, v)| format!("{}={}", encode(k), encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    let request = Request::builder()
        .method("POST")
        .uri("/webhook/payment")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from(body))
        .unwrap();
    let (status, body) = send(app, request).await;
    (status, String::from_utf8(body).unwrap())
}

fn checkout_payload(price_id: &str, openid: Option<&str>) -> Value {
    json!({
        "user_id": "u1",
        "price_id": price_id,
        "customer_email": "buyer@example.com",
        "success_url": "https://shop.example.com/ok",
        "cancel_url": "https://shop.example.com/pricing",
        "openid": openid,
    })
}

// ─── Tests ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health() {
    let (app, _) = test_app();
    let (status, body) = get_json(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["prices"], 2);
}

#[tokio::test]
async fn test_monthly_purchase_flow() {
    let (app, _) = test_app();

    let (status, session) = post_json(&app, "/api/checkout", &checkout_payload("price_tryon_monthly", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(session["rail"], "alipay");
    assert_eq!(session["amount"], 180);
    let aoid = session["gateway_order_id"].as_str().unwrap().to_string();
    let order_no = session["order_no"].as_str().unwrap().to_string();

    // Not entitled before confirmation
    let (_, entitlement) = get_json(&app, "/api/entitlement?user_id=u1").await;
    assert_eq!(entitlement["has_access"], false);
    assert_eq!(entitlement["subscription_status"], "none");
    let (status, body) = gated(&app, Some("u1")).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["code"], "PAYMENT_REQUIRED");

    let (status, view) = get_json(&app, &format!("/api/payments/status?aoid={aoid}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["status"], "processing");
    assert_eq!(view["gateway_status"], "processing");
    assert_eq!(view["data"]["price_id"], "price_tryon_monthly");

    // Gateway delivers the same notification twice
    let form = notification_body(&aoid, &order_no, "1.80");
    for _ in 0..2 {
        let (status, body) = post_webhook(&app, &form).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "success");
    }

    let (_, view) = get_json(&app, &format!("/api/payments/status?aoid={aoid}")).await;
    assert_eq!(view["status"], "active");
    assert!(view.get("gateway_status").is_none());

    let (_, entitlement) = get_json(&app, "/api/entitlement?user_id=u1").await;
    assert_eq!(entitlement["has_access"], true);
    assert_eq!(entitlement["subscription_status"], "active");
    assert_eq!(entitlement["amount"], 180);
    assert_eq!(entitlement["interval"], "month");

    let (status, body) = gated(&app, Some("u1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["has_access"], true);
}

#[tokio::test]
async fn test_tampered_webhook_rejected() {
    let (app, store) = test_app();
    let (_, session) = post_json(&app, "/api/checkout", &checkout_payload("price_tryon_monthly", None)).await;
    let aoid = session["gateway_order_id"].as_str().unwrap();
    let order_no = session["order_no"].as_str().unwrap();

    let mut form = notification_body(aoid, order_no, "1.80");
    form[2].1 = "0.01".into();
    let (status, body) = post_webhook(&app, &form).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, "fail");

    let mut missing = notification_body(aoid, order_no, "1.80");
    missing.retain(|(k, _)| k != "pay_time");
    let (status, body) = post_webhook(&app, &missing).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, "fail");

    let record = store.get_by_gateway_order(aoid).await.unwrap().unwrap();
    assert_eq!(record.status, PaymentStatus::Processing);
}

#[tokio::test]
async fn test_webhook_for_unknown_order_is_acknowledged() {
    let (app, _) = test_app();
    let form = notification_body("aoid_404", "no_404", "1.80");
    let (status, body) = post_webhook(&app, &form).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "success");
}

#[tokio::test]
async fn test_unknown_status_is_404() {
    let (app, _) = test_app();
    let (status, body) = get_json(&app, "/api/payments/status?aoid=missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_checkout_errors() {
    let (app, store) = test_app();

    let (status, body) = post_json(&app, "/api/checkout", &checkout_payload("price_missing", None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "PLAN_NOT_FOUND");

    let (status, body) = post_json(&app, "/api/checkout", &checkout_payload("price_tryon_monthly", Some("o_bad"))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "GATEWAY_REJECTED");
    assert!(body["error"].as_str().unwrap().contains("Alipay"));

    assert!(store.list_by_user("u1").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_gate_requires_user_header() {
    let (app, _) = test_app();
    let (status, body) = gated(&app, None).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["code"], "PAYMENT_REQUIRED");
}

#[tokio::test]
async fn test_lapsed_subscription_is_expired() {
    let (app, store) = test_app();
    let start = Utc::now() - Duration::days(40);
    store
        .insert(&PaymentRecord {
            id: "r1".into(),
            user_id: "u2".into(),
            customer_id: "cus_1".into(),
            customer_email: "old@example.com".into(),
            price_id: "price_tryon_monthly".into(),
            plan_id: "tryon_pro".into(),
            amount: 180,
            currency: "CNY".into(),
            payment_type: PaymentType::Subscription,
            interval: Some(Interval::Month),
            order_no: "no_old".into(),
            gateway_order_id: "aoid_old".into(),
            status: PaymentStatus::Active,
            period_start: start,
            period_end: start + Duration::days(30),
            metadata: BTreeMap::new(),
            created_at: start,
            updated_at: start,
        })
        .await
        .unwrap();

    let (_, entitlement) = get_json(&app, "/api/entitlement?user_id=u2").await;
    assert_eq!(entitlement["has_access"], false);
    assert_eq!(entitlement["subscription_status"], "expired");

    let (status, _) = gated(&app, Some("u2")).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);

    store.grant_lifetime("u2").await.unwrap();
    let (status, body) = gated(&app, Some("u2")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["is_lifetime"], true);
}
