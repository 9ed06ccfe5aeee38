//! Payment Error Types

use thiserror::Error;

use crate::gateway::PayRail;

/// Result type alias
pub type Result<T> = std::result::Result<T, PaymentError>;

/// Payment-related errors
#[derive(Error, Debug)]
pub enum PaymentError {
    /// Missing or invalid credentials/settings. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Price id is not in the catalog
    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    /// Non-2xx or unparseable reply from the gateway
    #[error("Gateway request failed: {0}")]
    GatewayRequestFailed(String),

    /// Outbound gateway call exceeded its timeout
    #[error("Gateway request timed out")]
    GatewayTimeout,

    /// Gateway answered but refused the order on this rail
    #[error("Gateway rejected {rail} order ({code})")]
    GatewayRejected { code: String, rail: PayRail },

    /// Webhook signature mismatch
    #[error("Signature invalid")]
    SignatureInvalid,

    /// Webhook or request payload missing required fields
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// No payment record for this gateway order id
    #[error("Payment record not found: {0}")]
    RecordNotFound(String),

    /// A record already exists for this gateway order id
    #[error("Duplicate payment record: {0}")]
    DuplicateRecord(String),

    /// User has no paid access
    #[error("Access denied for user {0}")]
    AccessDenied(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Notification or email delivery failed
    #[error("Notification error: {0}")]
    Notification(String),
}

impl PaymentError {
    /// Check if this error is retryable
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::GatewayRequestFailed(_) | Self::GatewayTimeout | Self::Storage(_)
        )
    }

    /// Stable machine-readable code for API responses
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::PlanNotFound(_) => "PLAN_NOT_FOUND",
            Self::GatewayRequestFailed(_) => "GATEWAY_ERROR",
            Self::GatewayTimeout => "GATEWAY_TIMEOUT",
            Self::GatewayRejected { .. } => "GATEWAY_REJECTED",
            Self::SignatureInvalid => "INVALID_SIGNATURE",
            Self::MalformedPayload(_) => "MALFORMED_PAYLOAD",
            Self::RecordNotFound(_) => "NOT_FOUND",
            Self::DuplicateRecord(_) => "DUPLICATE_RECORD",
            Self::AccessDenied(_) => "PAYMENT_REQUIRED",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Notification(_) => "NOTIFICATION_ERROR",
        }
    }

    /// Get user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            Self::PlanNotFound(_) => "The selected plan does not exist.".into(),
            Self::GatewayRequestFailed(_) => {
                "Payment service is unavailable. Please try again.".into()
            }
            Self::GatewayTimeout => "Payment service did not respond in time. Please try again.".into(),
            Self::GatewayRejected { rail, .. } => format!(
                "This payment method was refused. Please pay with {} instead.",
                rail.alternate().display_name()
            ),
            Self::RecordNotFound(_) => "Order not found.".into(),
            Self::AccessDenied(_) => "An active subscription is required.".into(),
            Self::MalformedPayload(msg) => format!("Invalid request: {msg}"),
            Self::Config(_) => "Service configuration error.".into(),
            _ => "An error occurred processing your request.".into(),
        }
    }
}
