//! Payment Records
//!
//! One record per checkout attempt. The gateway order id is the join key for
//! every callback and poll; the period is fixed when the record is created.

use std::collections::BTreeMap;

use chrono::{DateTime, Months, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Lifecycle status of a payment record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    /// Created, awaiting confirmation
    Processing,
    /// Confirmed paid
    Active,
    /// Confirmed paid (one-off settlement)
    Completed,
    /// Voided, expired before confirmation, or refunded
    Canceled,
}

impl PaymentStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Canceled => "canceled",
        }
    }

    /// Confirmed paid states
    pub const fn is_paid(self) -> bool {
        matches!(self, Self::Active | Self::Completed)
    }

    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Processing)
    }

    /// Whether `self -> next` is an allowed transition.
    ///
    /// `processing` moves to any other state; paid states may only be
    /// canceled (refund); `canceled` is final.
    pub const fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Processing, Self::Active | Self::Completed | Self::Canceled) => true,
            (Self::Active | Self::Completed, Self::Canceled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of purchase
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentType {
    #[default]
    Subscription,
}

/// Billing interval
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    Month,
    Year,
}

impl Interval {
    pub const fn months(self) -> u32 {
        match self {
            Self::Month => 1,
            Self::Year => 12,
        }
    }

    /// Add one interval in calendar months. Month-end dates clamp, so
    /// Jan 31 + 1 month is the last day of February.
    pub fn add_to(self, start: DateTime<Utc>) -> Option<DateTime<Utc>> {
        start.checked_add_months(Months::new(self.months()))
    }
}

/// A single checkout attempt
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    /// Local identifier
    pub id: String,

    /// Owning user
    pub user_id: String,

    /// Stable per-user identifier known to the gateway
    pub customer_id: String,

    /// Email the checkout was created for
    pub customer_email: String,

    /// Catalog price tier
    pub price_id: String,

    /// Plan the price belongs to
    pub plan_id: String,

    /// Amount in minor units (fen)
    pub amount: i64,

    /// ISO currency code
    pub currency: String,

    pub payment_type: PaymentType,

    pub interval: Option<Interval>,

    /// Local order number, for traceability only
    pub order_no: String,

    /// Gateway order id (`aoid`), the join key
    pub gateway_order_id: String,

    pub status: PaymentStatus,

    pub period_start: DateTime<Utc>,

    pub period_end: DateTime<Utc>,

    /// Caller-supplied tags from checkout
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl PaymentRecord {
    /// Whether this record grants access at `now`.
    ///
    /// `period_end` is exclusive: a record expiring exactly at `now` is not
    /// active.
    pub fn grants_access_at(&self, now: DateTime<Utc>) -> bool {
        self.payment_type == PaymentType::Subscription
            && self.status.is_paid()
            && self.period_end > now
    }

    /// Whether a reported paid amount (yuan) equals this record's amount.
    /// Compared as decimals, so `1.8` and `1.80` agree.
    pub fn paid_in_full(&self, paid: Decimal) -> bool {
        paid == Decimal::new(self.amount, 2)
    }
}
