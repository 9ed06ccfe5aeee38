//! Payment Notifications
//!
//! Success notices and confirmation emails are fire-and-forget: they run on
//! a spawned task after the webhook has been settled, and their failures are
//! only logged.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{PaymentError, Result};
use crate::record::PaymentRecord;

/// Delivery channel for payment side effects
#[async_trait]
pub trait Notifier: Send + Sync {
    /// In-app "payment succeeded" notice
    async fn payment_confirmed(&self, record: &PaymentRecord) -> Result<()>;

    /// Confirmation email to the customer
    async fn send_confirmation_email(&self, record: &PaymentRecord) -> Result<()>;
}

/// Logs notices instead of delivering them
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn payment_confirmed(&self, record: &PaymentRecord) -> Result<()> {
        tracing::info!(
            user_id = %record.user_id,
            aoid = %record.gateway_order_id,
            plan = %record.plan_id,
            "Payment confirmed"
        );
        Ok(())
    }

    async fn send_confirmation_email(&self, record: &PaymentRecord) -> Result<()> {
        tracing::info!(
            email = %record.customer_email,
            aoid = %record.gateway_order_id,
            "Confirmation email skipped (no email webhook configured)"
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct EmailPayload<'a> {
    to: &'a str,
    template: &'static str,
    order_no: &'a str,
    plan_id: &'a str,
    amount: i64,
    currency: &'a str,
    period_end: String,
}

/// Posts confirmation emails to a delivery webhook (`EMAIL_WEBHOOK_URL`)
pub struct WebhookEmailNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookEmailNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| PaymentError::Config(format!("http client: {e}")))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }

    /// `None` when `EMAIL_WEBHOOK_URL` is unset
    pub fn from_env() -> Result<Option<Self>> {
        match std::env::var("EMAIL_WEBHOOK_URL") {
            Ok(url) if !url.trim().is_empty() => Self::new(url).map(Some),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl Notifier for WebhookEmailNotifier {
    async fn payment_confirmed(&self, record: &PaymentRecord) -> Result<()> {
        TracingNotifier.payment_confirmed(record).await
    }

    async fn send_confirmation_email(&self, record: &PaymentRecord) -> Result<()> {
        let payload = EmailPayload {
            to: &record.customer_email,
            template: "payment_confirmed",
            order_no: &record.order_no,
            plan_id: &record.plan_id,
            amount: record.amount,
            currency: &record.currency,
            period_end: record.period_end.to_rfc3339(),
        };

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| PaymentError::Notification(format!("email webhook: {e}")))?;

        if !response.status().is_success() {
            return Err(PaymentError::Notification(format!(
                "email webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Run both side effects on a background task. Never blocks the caller.
pub fn spawn_confirmation(notifier: Arc<dyn Notifier>, record: PaymentRecord) {
    tokio::spawn(async move {
        if let Err(e) = notifier.payment_confirmed(&record).await {
            tracing::error!(aoid = %record.gateway_order_id, error = %e, "Success notice failed");
        }
        if let Err(e) = notifier.send_confirmation_email(&record).await {
            tracing::error!(aoid = %record.gateway_order_id, error = %e, "Confirmation email failed");
        }
    });
}
