//! Payment Status Polling
//!
//! Server side: a read-only view of one payment record, optionally with the
//! gateway's live view of the order. Client side: [`StatusWatcher`] polls
//! that view until the payment settles while counting down to expiry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{PaymentError, Result};
use crate::gateway::{GatewayOrderState, PaymentGateway, transport_error};
use crate::record::{Interval, PaymentStatus};
use crate::store::PaymentStore;

/// Default client poll interval
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

const COUNTDOWN_TICK: Duration = Duration::from_secs(1);

/// Order details echoed to the polling client
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusData {
    pub price_id: String,
    pub amount: i64,
    pub currency: String,
    pub plan_id: String,
    pub interval: Option<Interval>,
    pub created_at: DateTime<Utc>,
}

/// Status of one payment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusView {
    /// Persisted status; only settlement changes it
    pub status: PaymentStatus,
    pub aoid: String,
    pub data: StatusData,
    /// Gateway's live view, when looked up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_status: Option<GatewayOrderState>,
}

/// Server-side status query
pub struct StatusService {
    store: Arc<dyn PaymentStore>,
    live_lookup: Option<Arc<dyn PaymentGateway>>,
}

impl StatusService {
    pub fn new(store: Arc<dyn PaymentStore>) -> Self {
        Self {
            store,
            live_lookup: None,
        }
    }

    /// Also ask the gateway about orders that are still processing
    #[must_use]
    pub fn with_live_lookup(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.live_lookup = Some(gateway);
        self
    }

    pub async fn query_status(&self, gateway_order_id: &str) -> Result<StatusView> {
        let record = self
            .store
            .get_by_gateway_order(gateway_order_id)
            .await?
            .ok_or_else(|| PaymentError::RecordNotFound(gateway_order_id.to_string()))?;

        let gateway_status = match &self.live_lookup {
            Some(gateway) if record.status == PaymentStatus::Processing => {
                match gateway.query_order(gateway_order_id).await {
                    Ok(live) => Some(live.state),
                    Err(e) => {
                        tracing::warn!(aoid = %gateway_order_id, error = %e, "Live status lookup failed");
                        None
                    }
                }
            }
            _ => None,
        };

        Ok(StatusView {
            status: record.status,
            aoid: record.gateway_order_id,
            data: StatusData {
                price_id: record.price_id,
                amount: record.amount,
                currency: record.currency,
                plan_id: record.plan_id,
                interval: record.interval,
                created_at: record.created_at,
            },
            gateway_status,
        })
    }
}

/// Where the watcher reads status from
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch(&self, gateway_order_id: &str) -> Result<StatusView>;
}

#[async_trait]
impl StatusSource for StatusService {
    async fn fetch(&self, gateway_order_id: &str) -> Result<StatusView> {
        self.query_status(gateway_order_id).await
    }
}

/// Status source backed by the server's status endpoint
pub struct HttpStatusSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStatusSource {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| PaymentError::Config(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl StatusSource for HttpStatusSource {
    async fn fetch(&self, gateway_order_id: &str) -> Result<StatusView> {
        let response = self
            .client
            .get(format!("{}/api/payments/status", self.base_url))
            .query(&[("aoid", gateway_order_id)])
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(PaymentError::RecordNotFound(gateway_order_id.to_string()));
        }
        if !status.is_success() {
            return Err(PaymentError::GatewayRequestFailed(format!(
                "status endpoint returned {status}"
            )));
        }

        // A garbled body is treated like a dropped connection: retried
        response
            .json::<StatusView>()
            .await
            .map_err(|e| {
                PaymentError::GatewayRequestFailed(format!("unreadable status response: {e}"))
            })
    }
}

/// Latest state published by a watch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchSnapshot {
    pub status: PaymentStatus,
    /// Whole seconds until the order expires
    pub remaining_secs: u64,
    /// Countdown reached zero. Informational only.
    pub expired: bool,
    /// Polling has stopped
    pub done: bool,
    /// Set when polling stopped on a non-transient error
    pub error: Option<String>,
}

/// Client poll loop
pub struct StatusWatcher {
    source: Arc<dyn StatusSource>,
    poll_interval: Duration,
}

impl StatusWatcher {
    pub fn new(source: Arc<dyn StatusSource>) -> Self {
        Self {
            source,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Start watching an order that expires at `expires_at`
    pub fn watch(&self, gateway_order_id: impl Into<String>, expires_at: DateTime<Utc>) -> WatchHandle {
        let gateway_order_id = gateway_order_id.into();
        let remaining = (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let deadline = Instant::now() + remaining;

        let (tx, rx) = watch::channel(WatchSnapshot {
            status: PaymentStatus::Processing,
            remaining_secs: remaining.as_secs(),
            expired: remaining.is_zero(),
            done: false,
            error: None,
        });
        let tx = Arc::new(tx);

        let countdown = tokio::spawn(run_countdown(tx.clone(), deadline));
        let poll = tokio::spawn(run_poll(
            self.source.clone(),
            gateway_order_id,
            self.poll_interval,
            tx,
            countdown.abort_handle(),
        ));

        WatchHandle { rx, poll, countdown }
    }
}

async fn run_countdown(tx: Arc<watch::Sender<WatchSnapshot>>, deadline: Instant) {
    let mut ticker = tokio::time::interval(COUNTDOWN_TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let left = deadline.saturating_duration_since(Instant::now());
        tx.send_modify(|s| {
            s.remaining_secs = left.as_secs();
            s.expired = left.is_zero();
        });
        if left.is_zero() {
            break;
        }
    }
}

async fn run_poll(
    source: Arc<dyn StatusSource>,
    gateway_order_id: String,
    poll_interval: Duration,
    tx: Arc<watch::Sender<WatchSnapshot>>,
    countdown: tokio::task::AbortHandle,
) {
    // A slow fetch pushes the next poll back instead of bursting
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match source.fetch(&gateway_order_id).await {
            Ok(view) => {
                let terminal = view.status.is_terminal();
                tx.send_modify(|s| {
                    s.status = view.status;
                    s.done = terminal;
                });
                if terminal {
                    tracing::info!(aoid = %gateway_order_id, status = %view.status, "Payment settled");
                    break;
                }
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(aoid = %gateway_order_id, error = %e, "Status poll failed, retrying");
            }
            Err(e) => {
                tracing::error!(aoid = %gateway_order_id, error = %e, "Status polling stopped");
                tx.send_modify(|s| {
                    s.done = true;
                    s.error = Some(e.to_string());
                });
                break;
            }
        }
    }
    countdown.abort();
}

/// Running watch. Dropping it stops both timers.
pub struct WatchHandle {
    rx: watch::Receiver<WatchSnapshot>,
    poll: JoinHandle<()>,
    countdown: JoinHandle<()>,
}

impl WatchHandle {
    pub fn snapshot(&self) -> WatchSnapshot {
        self.rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<WatchSnapshot> {
        self.rx.clone()
    }

    /// Wait until polling stops. Returns the last snapshot if the watch
    /// was canceled first.
    pub async fn finished(&mut self) -> WatchSnapshot {
        if self.rx.wait_for(|s| s.done).await.is_err() {
            tracing::debug!("Status watch ended before settling");
        }
        self.rx.borrow().clone()
    }

    /// Stop polling and the countdown. The order itself is left alone.
    pub fn cancel(&self) {
        self.poll.abort();
        self.countdown.abort();
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}
