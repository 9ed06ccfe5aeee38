//! tryon-server
//!
//! Axum router for checkout, gateway callbacks, status polling and
//! entitlement checks.

pub mod config;
pub mod handlers;
pub mod state;

use axum::{
    Router, middleware,
    routing::{get, post},
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::handlers::{
    create_checkout, get_entitlement, health_check, payment_status, payment_webhook,
    require_access, tryon_access,
};
pub use crate::config::ServerConfig;
pub use crate::state::AppState;

/// Build the application router
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Paid features
    let gated = Router::new()
        .route("/api/tryon/access", get(tryon_access))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_access));

    Router::new()
        .route("/health", get(health_check))
        // Payments
        .route("/api/checkout", post(create_checkout))
        .route("/api/payments/status", get(payment_status))
        .route("/api/entitlement", get(get_entitlement))
        .route("/webhook/payment", post(payment_webhook))
        .merge(gated)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
