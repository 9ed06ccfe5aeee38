//! tryon-server
//!
//! Axum server for try-on subscriptions: checkout, gateway webhooks,
//! payment status polling and entitlement checks.

use std::sync::Arc;

use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tryon_payments::{
    HttpGateway, MemoryPaymentStore, Notifier, PaymentGateway, PriceCatalog, TracingNotifier,
    WebhookEmailNotifier,
};
use tryon_server::{AppState, ServerConfig, app};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    let config = ServerConfig::from_env()?;

    // Gateway is required; refuse to start without a secret
    let gateway = match HttpGateway::from_env() {
        Ok(gateway) => Arc::new(gateway),
        Err(e) => {
            tracing::error!("Gateway not configured: {}", e);
            tracing::error!("  Set GATEWAY_SECRET and GATEWAY_NOTIFY_URL in .env");
            return Err(e.into());
        }
    };
    tracing::info!("✓ Gateway configured (notify url: {})", gateway.notify_url());

    let catalog = Arc::new(PriceCatalog::from_env()?);
    for price in catalog.entries() {
        tracing::info!("  Price: {} ({} {})", price.price_id, price.price_string(), price.currency);
    }

    let notifier: Arc<dyn Notifier> = match WebhookEmailNotifier::from_env()? {
        Some(email) => {
            tracing::info!("✓ Confirmation emails enabled");
            Arc::new(email)
        }
        None => {
            tracing::warn!("⚠ EMAIL_WEBHOOK_URL not set - confirmation emails are only logged");
            Arc::new(TracingNotifier)
        }
    };

    let store = Arc::new(MemoryPaymentStore::new());
    let state = AppState::new(catalog, gateway, store, notifier, config.status_live_lookup);

    // Background reconciliation of orders whose webhook never arrived
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler = Arc::new(state.reconciler(config.reconcile_grace))
        .spawn(config.reconcile_interval, shutdown_rx);
    tracing::info!(
        "Reconciliation task started (every {}s, grace {}s)",
        config.reconcile_interval.as_secs(),
        config.reconcile_grace.as_secs()
    );

    let app = app(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;

    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("🚀 tryon-server running on http://{}", config.bind_addr);
    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("");
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /health               - Health check");
    tracing::info!("  POST /api/checkout         - Create gateway checkout");
    tracing::info!("  GET  /api/payments/status  - Poll payment status");
    tracing::info!("  GET  /api/entitlement      - Current entitlement");
    tracing::info!("  GET  /api/tryon/access     - Paid access check");
    tracing::info!("  POST /webhook/payment      - Gateway notifications");
    tracing::info!("");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown_tx.send(true).ok();
    reconciler.await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to install Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, stopping server...");
}
