//! Test doubles shared by the module tests

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::{PaymentError, Result};
use crate::gateway::{
    GatewayOrder, GatewayOrderReply, GatewayOrderState, GatewayOrderStatus, PayRail, PaymentGateway,
};
use crate::notify::Notifier;
use crate::record::PaymentRecord;
use crate::sign::{NOTIFY_FIELDS, Signer};

pub const TEST_SECRET: &str = "test_secret";

/// In-process gateway that records orders and serves scripted states
pub struct FakeGateway {
    signer: Signer,
    orders: Mutex<Vec<GatewayOrder>>,
    states: Mutex<HashMap<String, GatewayOrderStatus>>,
    reject_next: Mutex<Option<String>>,
    query_failures: Mutex<u32>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self {
            signer: Signer::new(TEST_SECRET),
            orders: Mutex::new(Vec::new()),
            states: Mutex::new(HashMap::new()),
            reject_next: Mutex::new(None),
            query_failures: Mutex::new(0),
        }
    }

    pub fn orders(&self) -> Vec<GatewayOrder> {
        self.orders.lock().unwrap().clone()
    }

    pub fn reject_next(&self, code: &str) {
        *self.reject_next.lock().unwrap() = Some(code.to_string());
    }

    /// Serve `state` with no paid amount reported
    pub fn set_state(&self, aoid: &str, state: GatewayOrderState) {
        self.states
            .lock()
            .unwrap()
            .insert(aoid.to_string(), GatewayOrderStatus::new(state));
    }

    /// Serve `success` with the amount the payer paid
    pub fn set_paid(&self, aoid: &str, amount: Decimal) {
        self.states
            .lock()
            .unwrap()
            .insert(aoid.to_string(), GatewayOrderStatus::paid(amount));
    }

    pub fn fail_queries(&self, count: u32) {
        *self.query_failures.lock().unwrap() = count;
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_order(&self, order: &GatewayOrder) -> Result<GatewayOrderReply> {
        let mut orders = self.orders.lock().unwrap();
        orders.push(order.clone());

        if let Some(code) = self.reject_next.lock().unwrap().take() {
            return Err(PaymentError::GatewayRejected {
                code,
                rail: order.rail,
            });
        }

        Ok(GatewayOrderReply {
            gateway_order_id: format!("aoid_{}", orders.len()),
            qr_code: (order.rail == PayRail::Alipay).then(|| format!("qr://{}", order.order_no)),
            expires_in: 300,
        })
    }

    async fn query_order(&self, gateway_order_id: &str) -> Result<GatewayOrderStatus> {
        {
            let mut failures = self.query_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(PaymentError::GatewayTimeout);
            }
        }
        Ok(self
            .states
            .lock()
            .unwrap()
            .get(gateway_order_id)
            .copied()
            .unwrap_or(GatewayOrderStatus::new(GatewayOrderState::Processing)))
    }

    fn signer(&self) -> &Signer {
        &self.signer
    }

    fn notify_url(&self) -> &str {
        "https://shop.example.com/webhook/payment"
    }
}

/// Notifier whose every delivery fails
pub struct FailingNotifier;

#[async_trait]
impl Notifier for FailingNotifier {
    async fn payment_confirmed(&self, record: &PaymentRecord) -> Result<()> {
        Err(PaymentError::Notification(format!(
            "confirmation hook down for {}",
            record.gateway_order_id
        )))
    }

    async fn send_confirmation_email(&self, record: &PaymentRecord) -> Result<()> {
        Err(PaymentError::Notification(format!(
            "mail relay refused {}",
            record.customer_email
        )))
    }
}

/// Form body of a correctly signed gateway notification
pub fn signed_notification(
    aoid: &str,
    order_no: &str,
    pay_price: &str,
    event: Option<&str>,
) -> HashMap<String, String> {
    let pay_time = "2026-10-18 12:00:05";
    let values = [order_no, aoid, pay_price, pay_time];
    let mut fields: Vec<(&str, &str)> = NOTIFY_FIELDS.iter().copied().zip(values).collect();
    if let Some(event) = event {
        fields.push(("event", event));
    }
    let sign = Signer::new(TEST_SECRET).sign(&fields);

    let mut form: HashMap<String, String> = fields
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    form.insert("sign".into(), sign);
    form
}
