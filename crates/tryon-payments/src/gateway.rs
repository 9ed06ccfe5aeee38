//! Payment Gateway Client
//!
//! The gateway takes form-encoded requests and answers with loosely typed
//! JSON. Replies are parsed into structs of optional fields and checked
//! field by field; nothing is read optimistically.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{PaymentError, Result};
use crate::sign::{ORDER_FIELDS, Signer};

/// Payment rail, chosen by whether the payer identifier (`openid`) is present
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayRail {
    /// QR-code payment
    Alipay,
    /// In-app payment, requires an `openid`
    Jsapi,
}

impl PayRail {
    /// Pure function of the payer identifier hint
    pub const fn for_openid(openid: Option<&str>) -> Self {
        match openid {
            Some(_) => Self::Jsapi,
            None => Self::Alipay,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Alipay => "alipay",
            Self::Jsapi => "jsapi",
        }
    }

    pub const fn display_name(self) -> &'static str {
        match self {
            Self::Alipay => "Alipay",
            Self::Jsapi => "WeChat Pay",
        }
    }

    pub const fn alternate(self) -> Self {
        match self {
            Self::Alipay => Self::Jsapi,
            Self::Jsapi => Self::Alipay,
        }
    }
}

impl std::fmt::Display for PayRail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gateway connection settings
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Order creation endpoint
    pub api_url: String,

    /// Order query endpoint
    pub query_url: String,

    /// Where the gateway posts notifications
    pub notify_url: String,

    /// Merchant secret
    pub secret: String,

    /// Timeout for every outbound call
    pub timeout_secs: u64,
}

impl GatewayConfig {
    pub const DEFAULT_API_URL: &'static str = "https://api.mianbaoduo.com/release/wx/prepay";
    pub const DEFAULT_QUERY_URL: &'static str = "https://api.mianbaoduo.com/release/main/search_order";

    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        let secret = std::env::var("GATEWAY_SECRET")
            .map_err(|_| PaymentError::Config("GATEWAY_SECRET not set".into()))?;
        let notify_url = std::env::var("GATEWAY_NOTIFY_URL")
            .map_err(|_| PaymentError::Config("GATEWAY_NOTIFY_URL not set".into()))?;
        let api_url =
            std::env::var("GATEWAY_API_URL").unwrap_or_else(|_| Self::DEFAULT_API_URL.into());
        let query_url =
            std::env::var("GATEWAY_QUERY_URL").unwrap_or_else(|_| Self::DEFAULT_QUERY_URL.into());
        let timeout_secs = std::env::var("GATEWAY_TIMEOUT_SECS")
            .ok()
            .and_then(|t| t.parse().ok())
            .unwrap_or(10);

        if secret.trim().is_empty() {
            return Err(PaymentError::Config("GATEWAY_SECRET is empty".into()));
        }

        Ok(Self {
            api_url,
            query_url,
            notify_url,
            secret,
            timeout_secs,
        })
    }
}

/// Order submitted to the gateway
#[derive(Clone, Debug)]
pub struct GatewayOrder {
    /// Product name
    pub name: String,
    pub rail: PayRail,
    /// Decimal yuan string
    pub price: String,
    /// Local order number
    pub order_no: String,
    /// Payer identifier, sent but not signed
    pub openid: Option<String>,
}

/// Accepted order
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewayOrderReply {
    /// Gateway order id (`aoid`)
    pub gateway_order_id: String,
    /// Scannable code payload (QR rail)
    pub qr_code: Option<String>,
    /// Seconds until the gateway closes the order
    pub expires_in: u64,
}

/// Gateway's live view of an order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayOrderState {
    Processing,
    Success,
    Closed,
    Expired,
    Refunded,
}

/// Answer to an order query
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GatewayOrderStatus {
    pub state: GatewayOrderState,
    /// Amount the payer actually paid (yuan), when the gateway reports it
    pub paid_amount: Option<Decimal>,
}

impl GatewayOrderStatus {
    pub const fn new(state: GatewayOrderState) -> Self {
        Self {
            state,
            paid_amount: None,
        }
    }

    pub const fn paid(amount: Decimal) -> Self {
        Self {
            state: GatewayOrderState::Success,
            paid_amount: Some(amount),
        }
    }
}

impl GatewayOrderState {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "processing" | "pending" | "unpaid" => Some(Self::Processing),
            "success" | "paid" => Some(Self::Success),
            "closed" => Some(Self::Closed),
            "expired" => Some(Self::Expired),
            "refunded" | "refund" => Some(Self::Refunded),
            _ => None,
        }
    }
}

/// Gateway client trait
///
/// Implemented over HTTP by [`HttpGateway`]; tests substitute fakes.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Submit a signed order
    async fn create_order(&self, order: &GatewayOrder) -> Result<GatewayOrderReply>;

    /// Ask the gateway for its live view of an order
    async fn query_order(&self, gateway_order_id: &str) -> Result<GatewayOrderStatus>;

    /// Merchant signer shared with webhook verification
    fn signer(&self) -> &Signer;

    fn notify_url(&self) -> &str;
}

#[derive(Debug, Deserialize)]
struct RawCreateReply {
    status: Option<serde_json::Value>,
    aoid: Option<String>,
    info: Option<RawInfo>,
    expires_in: Option<u64>,
    msg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawInfo {
    qr: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawQueryReply {
    status: Option<serde_json::Value>,
    state: Option<String>,
    pay_price: Option<serde_json::Value>,
}

/// The gateway reports `"ok"` on success, anything else is an error code.
/// A reply without any status is malformed rather than refused.
fn status_code(status: Option<&serde_json::Value>) -> Result<Option<String>> {
    match status {
        Some(serde_json::Value::String(s)) if s == "ok" => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Ok(Some(other.to_string())),
        None => Err(PaymentError::GatewayRequestFailed("reply missing status".into())),
    }
}

impl RawCreateReply {
    fn into_reply(self, rail: PayRail) -> Result<GatewayOrderReply> {
        if let Some(code) = status_code(self.status.as_ref())? {
            tracing::warn!(code = %code, msg = ?self.msg, rail = %rail, "Gateway rejected order");
            return Err(PaymentError::GatewayRejected { code, rail });
        }

        let gateway_order_id = self
            .aoid
            .filter(|a| !a.is_empty())
            .ok_or_else(|| PaymentError::GatewayRequestFailed("reply missing aoid".into()))?;
        let expires_in = self
            .expires_in
            .ok_or_else(|| PaymentError::GatewayRequestFailed("reply missing expires_in".into()))?;
        let qr_code = self.info.and_then(|i| i.qr);

        if rail == PayRail::Alipay && qr_code.is_none() {
            return Err(PaymentError::GatewayRequestFailed("reply missing qr code".into()));
        }

        Ok(GatewayOrderReply {
            gateway_order_id,
            qr_code,
            expires_in,
        })
    }
}

impl RawQueryReply {
    fn into_status(self) -> Result<GatewayOrderStatus> {
        if let Some(code) = status_code(self.status.as_ref())? {
            return Err(PaymentError::GatewayRequestFailed(format!("query refused: {code}")));
        }

        let raw = self
            .state
            .ok_or_else(|| PaymentError::GatewayRequestFailed("reply missing state".into()))?;
        let state = GatewayOrderState::parse(&raw)
            .ok_or_else(|| PaymentError::GatewayRequestFailed(format!("unknown order state {raw}")))?;

        // Sent either as a string or a bare number
        let paid_amount = match self.pay_price {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(s)) if s.is_empty() => None,
            Some(serde_json::Value::String(s)) => Some(parse_price(&s)?),
            Some(serde_json::Value::Number(n)) => Some(parse_price(&n.to_string())?),
            Some(other) => {
                return Err(PaymentError::GatewayRequestFailed(format!("bad pay_price {other}")));
            }
        };

        Ok(GatewayOrderStatus { state, paid_amount })
    }
}

fn parse_price(raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw)
        .map_err(|_| PaymentError::GatewayRequestFailed(format!("bad pay_price {raw}")))
}

pub(crate) fn transport_error(e: &reqwest::Error) -> PaymentError {
    if e.is_timeout() {
        PaymentError::GatewayTimeout
    } else {
        PaymentError::GatewayRequestFailed(e.to_string())
    }
}

/// HTTP gateway client
///
/// Constructed once per process and shared; carries only configuration.
pub struct HttpGateway {
    client: reqwest::Client,
    config: GatewayConfig,
    signer: Signer,
}

impl HttpGateway {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PaymentError::Config(format!("http client: {e}")))?;

        Ok(Self {
            client,
            signer: Signer::new(config.secret.clone()),
            config,
        })
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        Self::new(GatewayConfig::from_env()?)
    }

    /// Form fields for an order, signature included
    fn order_form(&self, order: &GatewayOrder) -> Vec<(&'static str, String)> {
        let signed = [
            order.name.as_str(),
            order.rail.as_str(),
            order.price.as_str(),
            order.order_no.as_str(),
            self.config.notify_url.as_str(),
        ];
        let pairs: Vec<(&str, &str)> = ORDER_FIELDS.iter().copied().zip(signed).collect();
        let sign = self.signer.sign(&pairs);

        let mut form: Vec<(&'static str, String)> = ORDER_FIELDS
            .iter()
            .copied()
            .zip(signed.iter().map(|v| (*v).to_string()))
            .collect();
        form.push(("sign", sign));
        if let Some(openid) = &order.openid {
            form.push(("openid", openid.clone()));
        }
        form
    }

    async fn post_form<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        form: &[(&'static str, String)],
    ) -> Result<T> {
        let response = self
            .client
            .post(url)
            .form(form)
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PaymentError::GatewayRequestFailed(format!("HTTP {status}")));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| PaymentError::GatewayRequestFailed(format!("malformed reply: {e}")))
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn create_order(&self, order: &GatewayOrder) -> Result<GatewayOrderReply> {
        let form = self.order_form(order);
        tracing::debug!(order_no = %order.order_no, rail = %order.rail, "Submitting gateway order");

        let raw: RawCreateReply = self.post_form(&self.config.api_url, &form).await?;
        raw.into_reply(order.rail)
    }

    async fn query_order(&self, gateway_order_id: &str) -> Result<GatewayOrderStatus> {
        let sign = self.signer.sign(&[("aoid", gateway_order_id)]);
        let form = [("aoid", gateway_order_id.to_string()), ("sign", sign)];

        let raw: RawQueryReply = self.post_form(&self.config.query_url, &form).await?;
        raw.into_status()
    }

    fn signer(&self) -> &Signer {
        &self.signer
    }

    fn notify_url(&self) -> &str {
        &self.config.notify_url
    }
}
