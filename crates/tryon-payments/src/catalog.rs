//! Price Catalog
//!
//! Static price tiers. Amounts are kept in minor units (fen); the gateway
//! wants a decimal yuan string, produced with `rust_decimal`.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{PaymentError, Result};
use crate::record::{Interval, PaymentType};

/// One purchasable price
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceEntry {
    pub price_id: String,
    pub plan_id: String,
    /// Product name shown by the gateway
    pub name: String,
    /// Minor units
    pub amount: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub interval: Option<Interval>,
    #[serde(default)]
    pub payment_type: PaymentType,
}

fn default_currency() -> String {
    "CNY".into()
}

impl PriceEntry {
    /// Price in yuan
    pub fn decimal_amount(&self) -> Decimal {
        Decimal::new(self.amount, 2)
    }

    /// Price as a decimal yuan string, e.g. `180` -> `"1.80"`.
    pub fn price_string(&self) -> String {
        self.decimal_amount().to_string()
    }
}

/// Lookup table of prices
#[derive(Clone, Debug)]
pub struct PriceCatalog {
    entries: Vec<PriceEntry>,
}

impl Default for PriceCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PriceCatalog {
    pub const fn new(entries: Vec<PriceEntry>) -> Self {
        Self { entries }
    }

    /// Prices shipped with the app
    pub fn builtin() -> Self {
        Self::new(vec![
            PriceEntry {
                price_id: "price_tryon_monthly".into(),
                plan_id: "tryon_pro".into(),
                name: "Try-On Pro (monthly)".into(),
                amount: 180,
                currency: default_currency(),
                interval: Some(Interval::Month),
                payment_type: PaymentType::Subscription,
            },
            PriceEntry {
                price_id: "price_tryon_yearly".into(),
                plan_id: "tryon_pro".into(),
                name: "Try-On Pro (yearly)".into(),
                amount: 1680,
                currency: default_currency(),
                interval: Some(Interval::Year),
                payment_type: PaymentType::Subscription,
            },
        ])
    }

    /// Parse a JSON array of entries
    pub fn from_json(json: &str) -> Result<Self> {
        let entries: Vec<PriceEntry> = serde_json::from_str(json)
            .map_err(|e| PaymentError::Config(format!("invalid price catalog: {e}")))?;

        if let Some(bad) = entries.iter().find(|e| e.amount <= 0) {
            return Err(PaymentError::Config(format!(
                "price {} has non-positive amount",
                bad.price_id
            )));
        }

        Ok(Self::new(entries))
    }

    /// Load from `PRICE_CATALOG_PATH` when set, otherwise the builtin table
    pub fn from_env() -> Result<Self> {
        match std::env::var("PRICE_CATALOG_PATH") {
            Ok(path) => {
                let json = std::fs::read_to_string(&path)
                    .map_err(|e| PaymentError::Config(format!("read {path}: {e}")))?;
                Self::from_json(&json)
            }
            Err(_) => Ok(Self::builtin()),
        }
    }

    pub fn get(&self, price_id: &str) -> Result<&PriceEntry> {
        self.entries
            .iter()
            .find(|e| e.price_id == price_id)
            .ok_or_else(|| PaymentError::PlanNotFound(price_id.to_string()))
    }

    pub fn entries(&self) -> &[PriceEntry] {
        &self.entries
    }
}
