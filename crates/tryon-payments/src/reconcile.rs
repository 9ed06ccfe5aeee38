//! Orphan Reconciliation
//!
//! Background pass that re-queries the gateway for records left in
//! `processing`, covering webhooks that were lost or arrived before the
//! checkout committed. Settles through the same [`Settlement`] writer as the
//! webhook.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{PaymentError, Result};
use crate::gateway::{GatewayOrderState, PaymentGateway};
use crate::settle::{PaymentEvent, SettleOutcome, Settlement};
use crate::store::PaymentStore;

/// Default age before a processing record is re-queried
pub const DEFAULT_GRACE: Duration = Duration::from_secs(10 * 60);

/// Counts from one pass. Every checked record lands in exactly one of the
/// other counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked: usize,
    pub settled: usize,
    /// Still open at the gateway
    pub pending: usize,
    pub failed: usize,
    /// Already settled by another writer, or paid with an amount that does
    /// not match the record
    pub skipped: usize,
}

const fn event_for(state: GatewayOrderState) -> Option<PaymentEvent> {
    match state {
        GatewayOrderState::Processing => None,
        GatewayOrderState::Success => Some(PaymentEvent::Paid),
        GatewayOrderState::Closed | GatewayOrderState::Expired => Some(PaymentEvent::Closed),
        GatewayOrderState::Refunded => Some(PaymentEvent::Refunded),
    }
}

pub struct Reconciler {
    store: Arc<dyn PaymentStore>,
    gateway: Arc<dyn PaymentGateway>,
    settlement: Arc<Settlement>,
    grace: Duration,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        gateway: Arc<dyn PaymentGateway>,
        settlement: Arc<Settlement>,
    ) -> Self {
        Self {
            store,
            gateway,
            settlement,
            grace: DEFAULT_GRACE,
        }
    }

    #[must_use]
    pub const fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// One pass over stale processing records. Per-order failures are
    /// logged and counted; only a failure to list the records is returned.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let grace = chrono::Duration::from_std(self.grace)
            .map_err(|e| PaymentError::Config(format!("reconcile grace: {e}")))?;
        let stale = self.store.list_stale_processing(now - grace).await?;

        let mut report = ReconcileReport {
            checked: stale.len(),
            ..ReconcileReport::default()
        };

        for record in &stale {
            let aoid = record.gateway_order_id.as_str();
            let status = match self.gateway.query_order(aoid).await {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!(aoid = %aoid, error = %e, "Reconcile query failed");
                    report.failed += 1;
                    continue;
                }
            };

            let Some(event) = event_for(status.state) else {
                report.pending += 1;
                continue;
            };

            if event == PaymentEvent::Paid {
                match status.paid_amount {
                    Some(paid) if record.paid_in_full(paid) => {}
                    Some(paid) => {
                        tracing::error!(
                            aoid = %aoid,
                            expected = record.amount,
                            paid = %paid,
                            "Gateway reports a different paid amount; left for manual review"
                        );
                        report.skipped += 1;
                        continue;
                    }
                    None => {
                        tracing::warn!(aoid = %aoid, "Gateway reports paid without an amount; not settling");
                        report.skipped += 1;
                        continue;
                    }
                }
            }

            match self.settlement.apply_to(record, event, now).await {
                Ok(SettleOutcome::Activated(_) | SettleOutcome::Canceled(_) | SettleOutcome::Refunded(_)) => {
                    tracing::info!(aoid = %aoid, event = %event, "Reconciled orphaned payment");
                    report.settled += 1;
                }
                Ok(outcome) => {
                    tracing::debug!(aoid = %aoid, ?outcome, "Order already settled elsewhere");
                    report.skipped += 1;
                }
                Err(e) => {
                    tracing::warn!(aoid = %aoid, error = %e, "Reconcile settlement failed");
                    report.failed += 1;
                }
            }
        }

        if report.checked > 0 {
            tracing::info!(
                checked = report.checked,
                settled = report.settled,
                pending = report.pending,
                failed = report.failed,
                skipped = report.skipped,
                "Reconciliation pass complete"
            );
        }
        Ok(report)
    }

    /// Run a pass every `interval` until `shutdown` flips to `true`
    pub fn spawn(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                if let Err(e) = self.run_once(Utc::now()).await {
                    tracing::warn!(error = %e, "Reconciliation pass failed");
                }
            }
            tracing::info!("Reconciliation task stopped");
        })
    }
}
