//! Application State

use std::sync::Arc;

use tryon_payments::{
    CheckoutService, EntitlementResolver, Notifier, PaymentGateway, PaymentStore, PriceCatalog,
    Reconciler, Settlement, StatusService, WebhookReconciler,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Price tiers offered at checkout
    pub catalog: Arc<PriceCatalog>,

    pub checkout: Arc<CheckoutService>,

    /// Signed gateway callbacks
    pub webhook: Arc<WebhookReconciler>,

    pub status: Arc<StatusService>,

    pub entitlement: Arc<EntitlementResolver>,

    /// Terminal-state writer, shared with the reconciliation task
    pub settlement: Arc<Settlement>,

    pub store: Arc<dyn PaymentStore>,

    pub gateway: Arc<dyn PaymentGateway>,
}

impl AppState {
    /// Wire every service over one store and one gateway client
    pub fn new(
        catalog: Arc<PriceCatalog>,
        gateway: Arc<dyn PaymentGateway>,
        store: Arc<dyn PaymentStore>,
        notifier: Arc<dyn Notifier>,
        status_live_lookup: bool,
    ) -> Self {
        let settlement = Arc::new(Settlement::new(store.clone(), notifier));
        let webhook = WebhookReconciler::new(gateway.signer().clone(), store.clone(), settlement.clone());

        let mut status = StatusService::new(store.clone());
        if status_live_lookup {
            status = status.with_live_lookup(gateway.clone());
        }

        Self {
            checkout: Arc::new(CheckoutService::new(catalog.clone(), gateway.clone(), store.clone())),
            webhook: Arc::new(webhook),
            status: Arc::new(status),
            entitlement: Arc::new(EntitlementResolver::new(store.clone())),
            settlement,
            catalog,
            store,
            gateway,
        }
    }

    /// Orphan reconciliation over the same store and settlement writer
    pub fn reconciler(&self, grace: std::time::Duration) -> Reconciler {
        Reconciler::new(self.store.clone(), self.gateway.clone(), self.settlement.clone()).with_grace(grace)
    }
}
