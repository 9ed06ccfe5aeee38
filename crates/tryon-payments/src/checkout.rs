//! Checkout Sessions
//!
//! Creates a gateway order for a catalog price and persists the pending
//! payment record before handing the redirect target back to the caller.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::PriceCatalog;
use crate::error::{PaymentError, Result};
use crate::gateway::{GatewayOrder, PayRail, PaymentGateway};
use crate::record::{Interval, PaymentRecord, PaymentStatus};
use crate::store::PaymentStore;

/// Request to create a checkout session
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckoutRequest {
    /// Purchasing user
    pub user_id: String,

    /// Catalog price id
    pub price_id: String,

    /// Customer email
    pub customer_email: String,

    /// URL to redirect after successful payment
    pub success_url: String,

    /// URL to redirect if checkout is cancelled
    pub cancel_url: String,

    /// Free-form tags stored on the record
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, String>>,

    /// Payer identifier; selects the in-app rail when present
    #[serde(default)]
    pub openid: Option<String>,
}

/// What the client needs to render the payment step
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckoutSession {
    /// Gateway order id, used for polling
    pub gateway_order_id: String,

    /// Local order number
    pub order_no: String,

    pub rail: PayRail,

    /// Scannable code for the QR rail
    pub qr_code: Option<String>,

    /// Seconds until the gateway closes the order
    pub expires_in: u64,

    pub expires_at: DateTime<Utc>,

    pub amount: i64,

    pub currency: String,

    pub success_url: String,

    pub cancel_url: String,
}

/// Checkout session creator
pub struct CheckoutService {
    catalog: Arc<PriceCatalog>,
    gateway: Arc<dyn PaymentGateway>,
    store: Arc<dyn PaymentStore>,
}

impl CheckoutService {
    pub fn new(
        catalog: Arc<PriceCatalog>,
        gateway: Arc<dyn PaymentGateway>,
        store: Arc<dyn PaymentStore>,
    ) -> Self {
        Self {
            catalog,
            gateway,
            store,
        }
    }

    /// Create a checkout session
    pub async fn create_checkout(&self, request: CheckoutRequest) -> Result<CheckoutSession> {
        self.create_checkout_at(request, Utc::now()).await
    }

    /// Create a checkout session as of `now`
    pub async fn create_checkout_at(
        &self,
        request: CheckoutRequest,
        now: DateTime<Utc>,
    ) -> Result<CheckoutSession> {
        validate(&request)?;

        let price = self.catalog.get(&request.price_id)?;
        let customer_id = self.store.customer_id_for_email(&request.customer_email).await?;
        let order_no = generate_order_no(now);
        let openid = request.openid.filter(|o| !o.trim().is_empty());
        let rail = PayRail::for_openid(openid.as_deref());

        // Computed before the gateway call so a bad interval never leaves an
        // open order behind
        let period_end = price
            .interval
            .unwrap_or(Interval::Month)
            .add_to(now)
            .filter(|end| *end > now)
            .ok_or_else(|| PaymentError::Config(format!("bad interval on {}", price.price_id)))?;

        let order = GatewayOrder {
            name: price.name.clone(),
            rail,
            price: price.price_string(),
            order_no: order_no.clone(),
            openid,
        };
        let reply = self.gateway.create_order(&order).await?;
        let expires_at = i64::try_from(reply.expires_in)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|d| now.checked_add_signed(d))
            .ok_or_else(|| PaymentError::GatewayRequestFailed("expires_in out of range".into()))?;

        let record = PaymentRecord {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: request.user_id,
            customer_id,
            customer_email: request.customer_email,
            price_id: price.price_id.clone(),
            plan_id: price.plan_id.clone(),
            amount: price.amount,
            currency: price.currency.clone(),
            payment_type: price.payment_type,
            interval: price.interval,
            order_no: order_no.clone(),
            gateway_order_id: reply.gateway_order_id.clone(),
            status: PaymentStatus::Processing,
            period_start: now,
            period_end,
            metadata: request.metadata.unwrap_or_default(),
            created_at: now,
            updated_at: now,
        };
        self.store.insert(&record).await?;

        tracing::info!(
            user_id = %record.user_id,
            aoid = %record.gateway_order_id,
            order_no = %order_no,
            price_id = %record.price_id,
            rail = %rail,
            "Created checkout"
        );

        Ok(CheckoutSession {
            gateway_order_id: reply.gateway_order_id,
            order_no,
            rail,
            qr_code: reply.qr_code,
            expires_in: reply.expires_in,
            expires_at,
            amount: record.amount,
            currency: record.currency,
            success_url: request.success_url,
            cancel_url: request.cancel_url,
        })
    }
}

fn validate(request: &CheckoutRequest) -> Result<()> {
    if request.user_id.trim().is_empty() {
        return Err(PaymentError::MalformedPayload("user_id is required".into()));
    }
    let email = request.customer_email.trim();
    if email.is_empty() || !email.contains('@') {
        return Err(PaymentError::MalformedPayload("customer_email is invalid".into()));
    }
    Ok(())
}

/// Timestamp plus random suffix, e.g. `20261018120000ab12cd34`
fn generate_order_no(now: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}{}", now.format("%Y%m%d%H%M%S"), &suffix[..8])
}
