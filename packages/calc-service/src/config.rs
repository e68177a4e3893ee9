use std::env;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use switchyard::{BusSettings, RpcSettings, DEFAULT_HEARTBEAT, DEFAULT_RETRY_INTERVAL, DEFAULT_RPC_TIMEOUT};

/// Service configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub service_name: String,
    pub bus: String,
    pub nats_hosts: Vec<String>,
    pub nats_user: Option<String>,
    pub nats_password: Option<String>,
    pub heartbeat: Duration,
    pub retry_interval: Duration,
    pub rpc_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from any name lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let nats_hosts: Vec<String> = lookup("NATS_URL")
            .unwrap_or_else(|| "nats://localhost:4222".to_string())
            .split(',')
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .map(str::to_string)
            .collect();
        if nats_hosts.is_empty() {
            bail!("NATS_URL must name at least one host");
        }

        let nats_user = lookup("NATS_USER");
        let nats_password = lookup("NATS_PASSWORD");
        if nats_user.is_some() != nats_password.is_some() {
            bail!("NATS_USER and NATS_PASSWORD must be set together");
        }

        Ok(Self {
            service_name: lookup("SERVICE_NAME").unwrap_or_else(|| "calc-service".to_string()),
            bus: lookup("SWITCHYARD_BUS").unwrap_or_else(|| "main".to_string()),
            nats_hosts,
            nats_user,
            nats_password,
            heartbeat: match lookup("SWITCHYARD_HEARTBEAT_SECS") {
                Some(v) => Duration::from_secs(
                    v.parse()
                        .context("SWITCHYARD_HEARTBEAT_SECS must be a valid number")?,
                ),
                None => DEFAULT_HEARTBEAT,
            },
            retry_interval: match lookup("SWITCHYARD_RETRY_SECS") {
                Some(v) => Duration::from_secs(
                    v.parse()
                        .context("SWITCHYARD_RETRY_SECS must be a valid number")?,
                ),
                None => DEFAULT_RETRY_INTERVAL,
            },
            rpc_timeout: match lookup("SWITCHYARD_RPC_TIMEOUT_MS") {
                Some(v) => Duration::from_millis(
                    v.parse()
                        .context("SWITCHYARD_RPC_TIMEOUT_MS must be a valid number")?,
                ),
                None => DEFAULT_RPC_TIMEOUT,
            },
        })
    }

    pub fn bus_settings(&self) -> BusSettings {
        let settings = BusSettings::new(self.bus.clone(), self.nats_hosts.clone())
            .with_heartbeat(self.heartbeat)
            .with_retry_interval(self.retry_interval);
        match (&self.nats_user, &self.nats_password) {
            (Some(user), Some(password)) => settings.with_credentials(user.clone(), password.clone()),
            _ => settings,
        }
    }

    pub fn rpc_settings(&self) -> RpcSettings {
        RpcSettings {
            timeout: self.rpc_timeout,
        }
    }
}
