//! Settlement
//!
//! The only writer of terminal payment states. Both the webhook and the
//! orphan reconciliation pass settle through here, and every write is a
//! compare-and-set on the status read just before, so concurrent duplicate
//! deliveries update at most once.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::notify::{Notifier, spawn_confirmation};
use crate::record::{PaymentRecord, PaymentStatus};
use crate::store::PaymentStore;

/// A verified gateway event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentEvent {
    Paid,
    Closed,
    Refunded,
}

impl PaymentEvent {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Paid => "paid",
            Self::Closed => "closed",
            Self::Refunded => "refunded",
        }
    }
}

impl std::fmt::Display for PaymentEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of applying an event
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SettleOutcome {
    /// `processing -> active`
    Activated(PaymentRecord),
    /// `processing -> canceled`
    Canceled(PaymentRecord),
    /// paid -> `canceled`
    Refunded(PaymentRecord),
    /// Already in the state this event leads to
    Duplicate(PaymentStatus),
    /// Event does not apply to the current state (out of order)
    Ignored(PaymentStatus),
    /// No record for the gateway order id
    UnknownOrder,
}

enum Step {
    Move(PaymentStatus, PaymentStatus),
    Duplicate,
    Ignored,
}

const fn plan(event: PaymentEvent, current: PaymentStatus) -> Step {
    use PaymentStatus::{Active, Canceled, Completed, Processing};

    match (event, current) {
        (PaymentEvent::Paid, Processing) => Step::Move(Processing, Active),
        (PaymentEvent::Paid, Active | Completed) => Step::Duplicate,
        (PaymentEvent::Paid, Canceled) => Step::Ignored,

        (PaymentEvent::Closed, Processing) => Step::Move(Processing, Canceled),
        (PaymentEvent::Closed, Canceled) => Step::Duplicate,
        (PaymentEvent::Closed, Active | Completed) => Step::Ignored,

        (PaymentEvent::Refunded, Active) => Step::Move(Active, Canceled),
        (PaymentEvent::Refunded, Completed) => Step::Move(Completed, Canceled),
        (PaymentEvent::Refunded, Canceled) => Step::Duplicate,
        (PaymentEvent::Refunded, Processing) => Step::Ignored,
    }
}

/// Terminal-state writer
pub struct Settlement {
    store: Arc<dyn PaymentStore>,
    notifier: Arc<dyn Notifier>,
}

impl Settlement {
    pub fn new(store: Arc<dyn PaymentStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    /// Apply an event to the record with this gateway order id
    pub async fn apply(
        &self,
        gateway_order_id: &str,
        event: PaymentEvent,
        now: DateTime<Utc>,
    ) -> Result<SettleOutcome> {
        match self.store.get_by_gateway_order(gateway_order_id).await? {
            Some(record) => self.apply_to(&record, event, now).await,
            None => Ok(SettleOutcome::UnknownOrder),
        }
    }

    /// Apply an event to a record that was just read
    pub async fn apply_to(
        &self,
        record: &PaymentRecord,
        event: PaymentEvent,
        now: DateTime<Utc>,
    ) -> Result<SettleOutcome> {
        let aoid = record.gateway_order_id.as_str();

        let (from, to) = match plan(event, record.status) {
            Step::Move(from, to) => (from, to),
            Step::Duplicate => {
                tracing::debug!(aoid = %aoid, event = %event, status = %record.status, "Duplicate payment event");
                return Ok(SettleOutcome::Duplicate(record.status));
            }
            Step::Ignored => {
                if event == PaymentEvent::Paid {
                    tracing::error!(
                        aoid = %aoid,
                        user_id = %record.user_id,
                        "Payment received for a canceled order; needs manual refund"
                    );
                } else {
                    tracing::warn!(aoid = %aoid, event = %event, status = %record.status, "Out-of-order payment event ignored");
                }
                return Ok(SettleOutcome::Ignored(record.status));
            }
        };

        let Some(updated) = self.store.update_status(aoid, from, to, now).await? else {
            // Lost the compare-and-set to a concurrent writer
            let current = self
                .store
                .get_by_gateway_order(aoid)
                .await?
                .map_or(to, |r| r.status);
            tracing::debug!(aoid = %aoid, status = %current, "Concurrent settlement, treating as duplicate");
            return Ok(SettleOutcome::Duplicate(current));
        };

        tracing::info!(
            aoid = %aoid,
            user_id = %updated.user_id,
            from = %from,
            to = %to,
            event = %event,
            "Payment settled"
        );

        Ok(match event {
            PaymentEvent::Paid => {
                spawn_confirmation(self.notifier.clone(), updated.clone());
                SettleOutcome::Activated(updated)
            }
            PaymentEvent::Closed => SettleOutcome::Canceled(updated),
            PaymentEvent::Refunded => SettleOutcome::Refunded(updated),
        })
    }
}
