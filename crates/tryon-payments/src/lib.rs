//! # tryon-payments
//!
//! Payment reconciliation and subscription entitlement for the try-on app.
//!
//! ## Payment Flow
//!
//! A checkout creates a gateway order and persists a `processing` record.
//! The record only becomes `active` once the gateway confirms it, either by
//! its signed webhook (push) or by the reconciliation pass querying the
//! order (pull). Entitlement is derived from the records on every request.
//!
//! ```text
//! ┌──────────┐  create   ┌──────────┐   pay    ┌──────────┐
//! │ Checkout │──────────▶│ Gateway  │◀─────────│  Payer   │
//! └──────────┘           └──────────┘          └──────────┘
//!      │ processing           │ webhook / query
//!      ▼                      ▼
//! ┌──────────┐  settle   ┌──────────┐
//! │  Store   │◀──────────│Settlement│
//! └──────────┘           └──────────┘
//!      │
//!      ▼
//! ┌───────────┐
//! │Entitlement│
//! └───────────┘
//! ```
//!
//! ### Payment Rails
//!
//! - **Alipay** (QR): the default; the reply carries a scannable code.
//! - **WeChat Pay** (JSAPI): selected when the client sends an `openid`.
//!
//! A rejected order is reported with the alternate rail to try; the crate
//! never switches rails on its own.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tryon_payments::{
//!     CheckoutRequest, CheckoutService, EntitlementResolver, HttpGateway,
//!     MemoryPaymentStore, PriceCatalog,
//! };
//!
//! let gateway = Arc::new(HttpGateway::from_env()?);
//! let store = Arc::new(MemoryPaymentStore::new());
//! let checkout = CheckoutService::new(Arc::new(PriceCatalog::builtin()), gateway, store.clone());
//!
//! let session = checkout.create_checkout(CheckoutRequest {
//!     user_id: "user_1".into(),
//!     price_id: "price_tryon_monthly".into(),
//!     customer_email: "user@example.com".into(),
//!     success_url: "https://yoursite.com/success".into(),
//!     cancel_url: "https://yoursite.com/pricing".into(),
//!     metadata: None,
//!     openid: None,
//! }).await?;
//!
//! // Show session.qr_code, then poll session.gateway_order_id
//!
//! let entitlement = EntitlementResolver::new(store).has_access("user_1").await?;
//! ```

mod catalog;
mod checkout;
mod entitlement;
mod error;
mod gateway;
mod notify;
mod poller;
mod reconcile;
mod record;
mod settle;
mod sign;
mod store;
mod webhook;

#[cfg(test)]
mod testing;

pub use catalog::{PriceCatalog, PriceEntry};
pub use checkout::{CheckoutRequest, CheckoutService, CheckoutSession};
pub use entitlement::{Entitlement, EntitlementResolver, SubscriptionStatus, resolve};
pub use error::{PaymentError, Result};
pub use gateway::{
    GatewayConfig, GatewayOrder, GatewayOrderReply, GatewayOrderState, GatewayOrderStatus,
    HttpGateway, PayRail, PaymentGateway,
};
pub use notify::{Notifier, TracingNotifier, WebhookEmailNotifier};
pub use poller::{
    DEFAULT_POLL_INTERVAL, HttpStatusSource, StatusData, StatusService, StatusSource, StatusView,
    StatusWatcher, WatchHandle, WatchSnapshot,
};
pub use reconcile::{DEFAULT_GRACE, ReconcileReport, Reconciler};
pub use record::{Interval, PaymentRecord, PaymentStatus, PaymentType};
pub use settle::{PaymentEvent, SettleOutcome, Settlement};
pub use sign::{NOTIFY_FIELDS, ORDER_FIELDS, Signer};
pub use store::{MemoryPaymentStore, PaymentStore};
pub use webhook::{
    LookupRetry, Notification, WEBHOOK_ACK, WEBHOOK_REJECT, WebhookOutcome, WebhookReconciler,
};
