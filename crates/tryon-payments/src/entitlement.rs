//! Entitlement Resolution
//!
//! Derives whether a user currently has paid access from their payment
//! records and lifetime grant. Evaluated against the clock on every call.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PaymentError, Result};
use crate::record::{Interval, PaymentRecord, PaymentType};
use crate::store::PaymentStore;

const MILLIS_PER_DAY: i64 = 86_400_000;

/// Summary status reported alongside the access flag
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Lifetime,
    Active,
    /// Paid before, nothing current
    Expired,
    /// Never paid
    None,
}

/// A user's current access
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    pub has_access: bool,
    pub is_lifetime: bool,
    pub subscription_status: SubscriptionStatus,
    pub period_end: Option<DateTime<Utc>>,
    pub interval: Option<Interval>,
    /// Amount of the granting record in minor units
    pub amount: Option<i64>,
    /// Whole days left, rounded up
    pub days_remaining: Option<i64>,
    /// Gateway order id of the granting record
    pub active_record: Option<String>,
}

impl Entitlement {
    const fn lifetime() -> Self {
        Self {
            has_access: true,
            is_lifetime: true,
            subscription_status: SubscriptionStatus::Lifetime,
            period_end: None,
            interval: None,
            amount: None,
            days_remaining: None,
            active_record: None,
        }
    }

    const fn without_access(status: SubscriptionStatus) -> Self {
        Self {
            has_access: false,
            is_lifetime: false,
            subscription_status: status,
            period_end: None,
            interval: None,
            amount: None,
            days_remaining: None,
            active_record: None,
        }
    }

    fn from_record(record: &PaymentRecord, now: DateTime<Utc>) -> Self {
        Self {
            has_access: true,
            is_lifetime: false,
            subscription_status: SubscriptionStatus::Active,
            period_end: Some(record.period_end),
            interval: record.interval,
            amount: Some(record.amount),
            days_remaining: Some(days_remaining(record.period_end, now)),
            active_record: Some(record.gateway_order_id.clone()),
        }
    }
}

/// `ceil((end - now) / 1 day)`; only called with `end > now`, so at least 1
/// even when less than a millisecond is left
fn days_remaining(end: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let millis = (end - now).num_milliseconds();
    (millis + MILLIS_PER_DAY - 1).div_euclid(MILLIS_PER_DAY).max(1)
}

/// Pure resolution over a user's records
pub fn resolve(records: &[PaymentRecord], lifetime: bool, now: DateTime<Utc>) -> Entitlement {
    if lifetime {
        return Entitlement::lifetime();
    }

    let current = records
        .iter()
        .filter(|r| r.grants_access_at(now))
        .max_by_key(|r| r.period_end);

    if let Some(record) = current {
        return Entitlement::from_record(record, now);
    }

    let ever_paid = records
        .iter()
        .any(|r| r.payment_type == PaymentType::Subscription && r.status.is_paid());
    Entitlement::without_access(if ever_paid {
        SubscriptionStatus::Expired
    } else {
        SubscriptionStatus::None
    })
}

/// Entitlement resolver over the payment store
pub struct EntitlementResolver {
    store: Arc<dyn PaymentStore>,
}

impl EntitlementResolver {
    pub fn new(store: Arc<dyn PaymentStore>) -> Self {
        Self { store }
    }

    pub async fn has_access(&self, user_id: &str) -> Result<Entitlement> {
        self.has_access_at(user_id, Utc::now()).await
    }

    pub async fn has_access_at(&self, user_id: &str, now: DateTime<Utc>) -> Result<Entitlement> {
        if self.store.has_lifetime_grant(user_id).await? {
            return Ok(Entitlement::lifetime());
        }
        let records = self.store.list_by_user(user_id).await?;
        Ok(resolve(&records, false, now))
    }

    /// Gate for paid features; `AccessDenied` when the user has no access
    pub async fn require_access(&self, user_id: &str) -> Result<Entitlement> {
        let entitlement = self.has_access(user_id).await?;
        if entitlement.has_access {
            Ok(entitlement)
        } else {
            tracing::debug!(user_id = %user_id, status = ?entitlement.subscription_status, "Access denied");
            Err(PaymentError::AccessDenied(user_id.to_string()))
        }
    }
}
