//! NATS connections and their state reporting.

use std::fmt;

use anyhow::Context as _;
use async_nats::{jetstream, Client, ConnectOptions, Event};
use async_trait::async_trait;
use dashmap::DashMap;
use switchyard::{BusSettings, ConnectionSignals, Connector};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Link state changes worth reporting to the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkChange {
    Up,
    Down,
}

/// Map a client event to a link change. Everything else is informational.
pub(crate) fn link_change(event: &Event) -> Option<LinkChange> {
    match event {
        Event::Connected => Some(LinkChange::Up),
        Event::Disconnected => Some(LinkChange::Down),
        _ => None,
    }
}

/// Connects buses to NATS servers.
///
/// The client reconnects on its own, waiting the bus retry interval between
/// attempts, and reports every transition through the bus signals.
pub struct NatsConnector {
    name: Option<String>,
}

impl NatsConnector {
    pub fn new() -> Self {
        Self { name: None }
    }

    /// Connection name shown in server monitoring.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
        }
    }

    fn options(&self, settings: &BusSettings, signals: ConnectionSignals) -> ConnectOptions {
        let mut options = match &settings.credentials {
            Some(creds) => ConnectOptions::with_user_and_password(creds.user.clone(), creds.password.clone()),
            None => ConnectOptions::new(),
        };
        if let Some(name) = &self.name {
            options = options.name(name.clone());
        }

        let retry = settings.retry_interval;
        options
            .ping_interval(settings.heartbeat)
            .reconnect_delay_callback(move |_attempts| retry)
            .event_callback(move |event| {
                let signals = signals.clone();
                async move {
                    match link_change(&event) {
                        Some(LinkChange::Up) => {
                            info!(bus = signals.bus(), "nats connected");
                            signals.connected();
                        }
                        Some(LinkChange::Down) => {
                            warn!(bus = signals.bus(), "nats disconnected");
                            signals.disconnected();
                        }
                        None => debug!(bus = signals.bus(), event = %event, "nats event"),
                    }
                }
            })
    }
}

impl Default for NatsConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for NatsConnector {
    type Transport = NatsLink;

    async fn connect(&self, settings: &BusSettings, signals: ConnectionSignals) -> anyhow::Result<NatsLink> {
        let servers = settings.hosts.join(",");
        info!(bus = %settings.bus, servers = %servers, "connecting to nats");

        let client = self
            .options(settings, signals)
            .connect(&servers)
            .await
            .with_context(|| format!("failed to connect bus {} to {servers}", settings.bus))?;

        Ok(NatsLink::new(client))
    }
}

/// One bus's NATS client plus the tasks pumping its subscriptions.
pub struct NatsLink {
    client: Client,
    jetstream: jetstream::Context,
    pumps: DashMap<String, JoinHandle<()>>,
}

impl NatsLink {
    pub fn new(client: Client) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self {
            client,
            jetstream,
            pumps: DashMap::new(),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn jetstream(&self) -> &jetstream::Context {
        &self.jetstream
    }

    /// Install the pump for `entity`, aborting the one it replaces.
    pub(crate) fn replace_pump(&self, entity: &str, pump: JoinHandle<()>) {
        if let Some(old) = self.pumps.insert(entity.to_owned(), pump) {
            old.abort();
        }
    }

    /// Stop the pump for `entity`. Returns whether one was running.
    pub(crate) fn stop_pump(&self, entity: &str) -> bool {
        match self.pumps.remove(entity) {
            Some((_, pump)) => {
                pump.abort();
                true
            }
            None => false,
        }
    }

    pub fn active_subscriptions(&self) -> usize {
        self.pumps.len()
    }
}

impl Drop for NatsLink {
    fn drop(&mut self) {
        for pump in self.pumps.iter() {
            pump.value().abort();
        }
    }
}

impl fmt::Debug for NatsLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NatsLink")
            .field("state", &self.client.connection_state())
            .field("subscriptions", &self.pumps.len())
            .finish()
    }
}
