//! Gateway Webhook Handling
//!
//! The authoritative confirmation path. Every handled delivery, including
//! duplicates and unknown orders, is acknowledged with [`WEBHOOK_ACK`];
//! only malformed or unverifiable requests are rejected.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::{PaymentError, Result};
use crate::record::PaymentRecord;
use crate::settle::{PaymentEvent, SettleOutcome, Settlement};
use crate::sign::{NOTIFY_FIELDS, Signer};
use crate::store::PaymentStore;

/// Body the gateway expects on every handled delivery
pub const WEBHOOK_ACK: &str = "success";

/// Body returned for rejected deliveries
pub const WEBHOOK_REJECT: &str = "fail";

/// Parsed gateway notification
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    /// Local order number (`order_id`)
    pub order_no: String,
    /// Gateway order id (`aoid`)
    pub gateway_order_id: String,
    /// Paid amount as sent (`pay_price`)
    pub pay_price: String,
    /// Payment time as sent (`pay_time`)
    pub pay_time: String,
    /// Raw `event` field, signed when present
    pub event_field: Option<String>,
    pub event: PaymentEvent,
    pub sign: String,
}

fn required<'a>(form: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    form.get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| PaymentError::MalformedPayload(format!("missing field {key}")))
}

fn parse_event(raw: Option<&str>) -> Result<PaymentEvent> {
    match raw {
        None | Some("paid" | "success") => Ok(PaymentEvent::Paid),
        Some("closed" | "expired") => Ok(PaymentEvent::Closed),
        Some("refunded" | "refund") => Ok(PaymentEvent::Refunded),
        Some(other) => Err(PaymentError::MalformedPayload(format!("unknown event {other}"))),
    }
}

impl Notification {
    /// Parse the fixed field set. Any missing field rejects the delivery
    /// before anything is hashed.
    pub fn from_form(form: &HashMap<String, String>) -> Result<Self> {
        let gateway_order_id = required(form, "aoid")?.to_string();
        let order_no = required(form, "order_id")?.to_string();
        let pay_price = required(form, "pay_price")?.to_string();
        let pay_time = required(form, "pay_time")?.to_string();
        let sign = required(form, "sign")?.to_string();
        let event_field = form
            .get("event")
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty());
        let event = parse_event(event_field.as_deref())?;

        Ok(Self {
            order_no,
            gateway_order_id,
            pay_price,
            pay_time,
            event_field,
            event,
            sign,
        })
    }

    /// Fields covered by the signature, in gateway order
    pub fn signed_fields(&self) -> Vec<(&str, &str)> {
        let values = [
            self.order_no.as_str(),
            self.gateway_order_id.as_str(),
            self.pay_price.as_str(),
            self.pay_time.as_str(),
        ];
        let mut fields: Vec<(&str, &str)> = NOTIFY_FIELDS.iter().copied().zip(values).collect();
        if let Some(event) = &self.event_field {
            fields.push(("event", event.as_str()));
        }
        fields
    }

    pub fn verify(&self, signer: &Signer) -> bool {
        signer.verify(&self.signed_fields(), &self.sign)
    }

    /// Whether the paid amount equals the record's amount
    fn amount_matches(&self, record: &PaymentRecord) -> Result<bool> {
        let paid = Decimal::from_str(&self.pay_price)
            .map_err(|_| PaymentError::MalformedPayload(format!("bad pay_price {}", self.pay_price)))?;
        Ok(record.paid_in_full(paid))
    }
}

/// What a handled delivery did. Every variant is acknowledged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    Activated,
    Canceled,
    Refunded,
    Duplicate,
    Ignored,
    UnknownOrder,
    AmountMismatch,
}

impl WebhookOutcome {
    pub const fn ack(self) -> &'static str {
        WEBHOOK_ACK
    }
}

impl From<&SettleOutcome> for WebhookOutcome {
    fn from(outcome: &SettleOutcome) -> Self {
        match outcome {
            SettleOutcome::Activated(_) => Self::Activated,
            SettleOutcome::Canceled(_) => Self::Canceled,
            SettleOutcome::Refunded(_) => Self::Refunded,
            SettleOutcome::Duplicate(_) => Self::Duplicate,
            SettleOutcome::Ignored(_) => Self::Ignored,
            SettleOutcome::UnknownOrder => Self::UnknownOrder,
        }
    }
}

/// Lookup retry used to absorb a webhook racing the checkout commit
#[derive(Clone, Copy, Debug)]
pub struct LookupRetry {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for LookupRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(250),
        }
    }
}

/// Webhook reconciler
pub struct WebhookReconciler {
    signer: Signer,
    store: Arc<dyn PaymentStore>,
    settlement: Arc<Settlement>,
    retry: LookupRetry,
}

impl WebhookReconciler {
    pub fn new(signer: Signer, store: Arc<dyn PaymentStore>, settlement: Arc<Settlement>) -> Self {
        Self {
            signer,
            store,
            settlement,
            retry: LookupRetry::default(),
        }
    }

    #[must_use]
    pub const fn with_retry(mut self, retry: LookupRetry) -> Self {
        self.retry = retry;
        self
    }

    /// Handle one delivery
    ///
    /// `Err` only for malformed payloads, signature mismatches, and storage
    /// failures; everything else is an acknowledged outcome.
    pub async fn handle(&self, form: &HashMap<String, String>) -> Result<WebhookOutcome> {
        self.handle_at(form, Utc::now()).await
    }

    pub async fn handle_at(
        &self,
        form: &HashMap<String, String>,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome> {
        let notification = Notification::from_form(form).inspect_err(|e| {
            tracing::warn!(error = %e, "Rejected malformed payment webhook");
        })?;

        if !notification.verify(&self.signer) {
            tracing::warn!(
                aoid = %notification.gateway_order_id,
                order_no = %notification.order_no,
                event = %notification.event,
                "Webhook signature mismatch, possible spoofing attempt"
            );
            return Err(PaymentError::SignatureInvalid);
        }

        tracing::info!(
            aoid = %notification.gateway_order_id,
            event = %notification.event,
            "Processing payment webhook"
        );

        let Some(record) = self.lookup(&notification.gateway_order_id).await? else {
            tracing::warn!(
                aoid = %notification.gateway_order_id,
                order_no = %notification.order_no,
                "Webhook for unknown order acknowledged; left to reconciliation"
            );
            return Ok(WebhookOutcome::UnknownOrder);
        };

        if notification.event == PaymentEvent::Paid && !notification.amount_matches(&record)? {
            tracing::error!(
                aoid = %record.gateway_order_id,
                expected = record.amount,
                paid = %notification.pay_price,
                "Paid amount does not match order; not activating"
            );
            return Ok(WebhookOutcome::AmountMismatch);
        }

        let outcome = self
            .settlement
            .apply_to(&record, notification.event, now)
            .await?;
        Ok(WebhookOutcome::from(&outcome))
    }

    /// Read the record, retrying briefly in case the checkout commit has
    /// not landed yet
    async fn lookup(&self, gateway_order_id: &str) -> Result<Option<PaymentRecord>> {
        for attempt in 0..=self.retry.attempts {
            if attempt > 0 {
                tokio::time::sleep(self.retry.delay).await;
            }
            if let Some(record) = self.store.get_by_gateway_order(gateway_order_id).await? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::TracingNotifier;
    use crate::record::PaymentStatus;
    use crate::store::MemoryPaymentStore;
    use crate::store::tests::sample_record;
    use crate::notify::Notifier;
    use crate::testing::{FailingNotifier, TEST_SECRET, signed_notification};

    fn handler(store: Arc<MemoryPaymentStore>) -> WebhookReconciler {
        handler_with(store, Arc::new(TracingNotifier))
    }

    fn handler_with(store: Arc<MemoryPaymentStore>, notifier: Arc<dyn Notifier>) -> WebhookReconciler {
        let settlement = Arc::new(Settlement::new(store.clone(), notifier));
        WebhookReconciler::new(Signer::new(TEST_SECRET), store, settlement).with_retry(LookupRetry {
            attempts: 2,
            delay: Duration::from_millis(10),
        })
    }

    async fn store_with_order() -> Arc<MemoryPaymentStore> {
        let store = Arc::new(MemoryPaymentStore::new());
        store.insert(&sample_record("u1", "aoid_1", Utc::now())).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_valid_webhook_activates() {
        let store = store_with_order().await;
        let handler = handler(store.clone());

        let form = signed_notification("aoid_1", "no_aoid_1", "1.80", None);
        let outcome = handler.handle(&form).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Activated);
        assert_eq!(outcome.ack(), "success");

        let record = store.get_by_gateway_order("aoid_1").await.unwrap().unwrap();
        assert_eq!(record.status, PaymentStatus::Active);
    }

    #[tokio::test]
    async fn test_notifier_failure_does_not_change_ack() {
        let store = store_with_order().await;
        let handler = handler_with(store.clone(), Arc::new(FailingNotifier));
        let form = signed_notification("aoid_1", "no_aoid_1", "1.80", None);

        let outcome = handler.handle(&form).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Activated);
        assert_eq!(outcome.ack(), "success");

        // Let the spawned confirmation task run and fail
        tokio::time::sleep(Duration::from_millis(20)).await;

        let record = store.get_by_gateway_order("aoid_1").await.unwrap().unwrap();
        assert_eq!(record.status, PaymentStatus::Active);

        let again = handler.handle(&form).await.unwrap();
        assert_eq!(again, WebhookOutcome::Duplicate);
        assert_eq!(again.ack(), "success");
    }

    #[tokio::test]
    async fn test_repeated_delivery_is_idempotent() {
        let store = store_with_order().await;
        let handler = handler(store.clone());
        let form = signed_notification("aoid_1", "no_aoid_1", "1.80", None);

        assert_eq!(handler.handle(&form).await.unwrap(), WebhookOutcome::Activated);
        let after_first = store.get_by_gateway_order("aoid_1").await.unwrap();

        for _ in 0..5 {
            assert_eq!(handler.handle(&form).await.unwrap(), WebhookOutcome::Duplicate);
            assert_eq!(store.get_by_gateway_order("aoid_1").await.unwrap(), after_first);
        }
    }

    #[tokio::test]
    async fn test_missing_field_rejected_without_change() {
        let store = store_with_order().await;
        let handler = handler(store.clone());

        for key in ["aoid", "order_id", "pay_price", "pay_time", "sign"] {
            let mut form = signed_notification("aoid_1", "no_aoid_1", "1.80", None);
            form.remove(key);
            let err = handler.handle(&form).await.unwrap_err();
            assert!(matches!(err, PaymentError::MalformedPayload(_)), "{key}");
        }

        let record = store.get_by_gateway_order("aoid_1").await.unwrap().unwrap();
        assert_eq!(record.status, PaymentStatus::Processing);
    }

    #[tokio::test]
    async fn test_tampered_fields_rejected_without_change() {
        let store = store_with_order().await;
        let handler = handler(store.clone());

        for key in ["aoid", "order_id", "pay_price", "pay_time", "sign"] {
            let mut form = signed_notification("aoid_1", "no_aoid_1", "1.80", None);
            let value = form.get_mut(key).unwrap();
            let last = value.pop().unwrap();
            value.push(if last == '9' { '8' } else { '9' });

            let err = handler.handle(&form).await.unwrap_err();
            assert!(matches!(err, PaymentError::SignatureInvalid), "{key}");
        }

        let record = store.get_by_gateway_order("aoid_1").await.unwrap().unwrap();
        assert_eq!(record.status, PaymentStatus::Processing);
    }

    #[tokio::test]
    async fn test_unsigned_event_cannot_be_injected() {
        let store = store_with_order().await;
        let handler = handler(store.clone());

        let mut form = signed_notification("aoid_1", "no_aoid_1", "1.80", None);
        form.insert("event".into(), "refunded".into());
        assert!(matches!(
            handler.handle(&form).await,
            Err(PaymentError::SignatureInvalid)
        ));
    }

    #[tokio::test]
    async fn test_unknown_order_acknowledged() {
        let store = store_with_order().await;
        let handler = handler(store.clone());

        let form = signed_notification("aoid_other", "no_other", "1.80", None);
        assert_eq!(handler.handle(&form).await.unwrap(), WebhookOutcome::UnknownOrder);
    }

    #[tokio::test]
    async fn test_webhook_racing_checkout_commit_is_absorbed() {
        let store = Arc::new(MemoryPaymentStore::new());
        let handler = handler(store.clone());
        let form = signed_notification("aoid_1", "no_aoid_1", "1.80", None);

        let late_insert = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                store.insert(&sample_record("u1", "aoid_1", Utc::now())).await.unwrap();
            })
        };

        let outcome = handler.handle(&form).await.unwrap();
        late_insert.await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Activated);

        let record = store.get_by_gateway_order("aoid_1").await.unwrap().unwrap();
        assert_eq!(record.status, PaymentStatus::Active);
        assert_eq!(store.list_by_user("u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_amount_mismatch_not_activated() {
        let store = store_with_order().await;
        let handler = handler(store.clone());

        let form = signed_notification("aoid_1", "no_aoid_1", "0.01", None);
        assert_eq!(handler.handle(&form).await.unwrap(), WebhookOutcome::AmountMismatch);

        let record = store.get_by_gateway_order("aoid_1").await.unwrap().unwrap();
        assert_eq!(record.status, PaymentStatus::Processing);
    }

    #[tokio::test]
    async fn test_equivalent_decimal_amount_accepted() {
        let store = store_with_order().await;
        let handler = handler(store);

        let form = signed_notification("aoid_1", "no_aoid_1", "1.8", None);
        assert_eq!(handler.handle(&form).await.unwrap(), WebhookOutcome::Activated);
    }

    #[tokio::test]
    async fn test_signed_close_and_refund_events() {
        let store = store_with_order().await;
        let handler = handler(store.clone());

        let paid = signed_notification("aoid_1", "no_aoid_1", "1.80", None);
        handler.handle(&paid).await.unwrap();

        let refund = signed_notification("aoid_1", "no_aoid_1", "1.80", Some("refunded"));
        assert_eq!(handler.handle(&refund).await.unwrap(), WebhookOutcome::Refunded);

        let paid_again = handler.handle(&paid).await.unwrap();
        assert_eq!(paid_again, WebhookOutcome::Ignored);

        let record = store.get_by_gateway_order("aoid_1").await.unwrap().unwrap();
        assert_eq!(record.status, PaymentStatus::Canceled);
    }

    #[test]
    fn test_unknown_event_is_malformed() {
        let form = signed_notification("aoid_1", "no_aoid_1", "1.80", Some("teleported"));
        assert!(matches!(
            Notification::from_form(&form),
            Err(PaymentError::MalformedPayload(_))
        ));
    }
}
