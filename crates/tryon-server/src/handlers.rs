//! HTTP Handlers

use std::collections::HashMap;

use axum::{
    Extension, Form, Json,
    extract::{Query, Request, State, rejection::FormRejection},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use serde::{Deserialize, Serialize};

use tryon_payments::{
    CheckoutRequest, CheckoutSession, Entitlement, PaymentError, StatusView, WEBHOOK_ACK,
    WEBHOOK_REJECT,
};

use crate::state::AppState;

/// Header carrying the authenticated user id on gated routes
pub const USER_ID_HEADER: &str = "x-user-id";

// ============================================================================
// Response Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub prices: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub aoid: String,
}

#[derive(Debug, Deserialize)]
pub struct EntitlementQuery {
    pub user_id: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Map a payment error to its HTTP status and `{error, code}` body
pub fn error_response(e: &PaymentError) -> ApiError {
    let status = match e {
        PaymentError::PlanNotFound(_) | PaymentError::MalformedPayload(_) | PaymentError::SignatureInvalid => {
            StatusCode::BAD_REQUEST
        }
        PaymentError::RecordNotFound(_) => StatusCode::NOT_FOUND,
        PaymentError::AccessDenied(_) => StatusCode::PAYMENT_REQUIRED,
        PaymentError::GatewayRejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        PaymentError::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
        PaymentError::GatewayRequestFailed(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        tracing::error!(error = %e, code = e.code(), "Request failed");
    } else {
        tracing::debug!(error = %e, code = e.code(), "Request rejected");
    }

    (
        status,
        Json(ErrorResponse {
            error: e.user_message(),
            code: e.code().into(),
        }),
    )
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        prices: state.catalog.entries().len(),
    })
}

/// Create a gateway checkout
pub async fn create_checkout(
    State(state): State<AppState>,
    Json(payload): Json<CheckoutRequest>,
) -> Result<Json<CheckoutSession>, ApiError> {
    let session = state
        .checkout
        .create_checkout(payload)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(session))
}

/// Gateway payment notification
///
/// Answers `success` for every handled delivery so the gateway stops
/// retrying; `fail` for payloads that cannot be trusted. Storage failures
/// answer 500 so the gateway retries later.
pub async fn payment_webhook(
    State(state): State<AppState>,
    form: Result<Form<HashMap<String, String>>, FormRejection>,
) -> (StatusCode, &'static str) {
    let Form(fields) = match form {
        Ok(form) => form,
        Err(e) => {
            tracing::warn!(error = %e, "Unreadable payment webhook body");
            return (StatusCode::BAD_REQUEST, WEBHOOK_REJECT);
        }
    };

    match state.webhook.handle(&fields).await {
        Ok(outcome) => {
            tracing::debug!(?outcome, "Payment webhook handled");
            (StatusCode::OK, outcome.ack())
        }
        Err(PaymentError::MalformedPayload(_) | PaymentError::SignatureInvalid) => {
            (StatusCode::BAD_REQUEST, WEBHOOK_REJECT)
        }
        Err(e) => {
            tracing::error!(error = %e, "Payment webhook processing failed");
            (StatusCode::INTERNAL_SERVER_ERROR, WEBHOOK_REJECT)
        }
    }
}

/// Poll a payment's status
pub async fn payment_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusView>, ApiError> {
    let view = state
        .status
        .query_status(&query.aoid)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(view))
}

/// Current entitlement of a user
pub async fn get_entitlement(
    State(state): State<AppState>,
    Query(query): Query<EntitlementQuery>,
) -> Result<Json<Entitlement>, ApiError> {
    let entitlement = state
        .entitlement
        .has_access(&query.user_id)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(entitlement))
}

/// Paid-feature gate. Rejects with 402 unless the user in the
/// `x-user-id` header has access, and hands the entitlement to the route.
pub async fn require_access(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| error_response(&PaymentError::AccessDenied("anonymous".into())))?;

    let entitlement = state
        .entitlement
        .require_access(user_id)
        .await
        .map_err(|e| error_response(&e))?;

    request.extensions_mut().insert(entitlement);
    Ok(next.run(request).await)
}

/// Gated try-on access check
pub async fn tryon_access(Extension(entitlement): Extension<Entitlement>) -> Json<Entitlement> {
    Json(entitlement)
}
