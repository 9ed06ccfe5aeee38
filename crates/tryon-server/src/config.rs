//! Server Configuration

use std::time::Duration;

use anyhow::Context;

/// Settings read from the environment at startup
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// How often the orphan reconciliation pass runs
    pub reconcile_interval: Duration,
    /// Age before a processing record is re-queried
    pub reconcile_grace: Duration,
    /// Report the gateway's live view from the status endpoint
    pub status_live_lookup: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".into(),
            reconcile_interval: Duration::from_secs(60),
            reconcile_grace: tryon_payments::DEFAULT_GRACE,
            status_live_lookup: true,
        }
    }
}

fn secs_var(name: &str, default: Duration) -> anyhow::Result<Duration> {
    match std::env::var(name) {
        Ok(raw) => {
            let secs: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("{name} must be a whole number of seconds"))?;
            anyhow::ensure!(secs > 0, "{name} must be positive");
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(default),
    }
}

fn bool_var(name: &str, default: bool) -> anyhow::Result<bool> {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => anyhow::bail!("{name} must be a boolean, got {other:?}"),
        },
        Err(_) => Ok(default),
    }
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            reconcile_interval: secs_var("RECONCILE_INTERVAL_SECS", defaults.reconcile_interval)?,
            reconcile_grace: secs_var("RECONCILE_GRACE_SECS", defaults.reconcile_grace)?,
            status_live_lookup: bool_var("STATUS_LIVE_LOOKUP", defaults.status_live_lookup)?,
        })
    }
}
