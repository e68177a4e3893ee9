//! Broker connections and connection events.
//!
//! The [`ConnectionManager`] owns one connection per bus name. Transports
//! report state changes through [`ConnectionSignals`], which only push onto an
//! unbounded channel, so they are safe to call from any callback. A pump task
//! folds those signals into per-bus state and broadcasts [`ConnectionEvent`]s.
//!
//! ```text
//! transport callback ──▶ ConnectionSignals ──▶ pump ──▶ watch (state per bus)
//!                          (unbounded mpsc)        └──▶ broadcast (events) ──▶ bus drivers
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::EntityError;

/// Default heartbeat interval.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(10);

/// Default delay between reconnect attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Default RPC timeout (30 seconds).
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Capacity of the connection event channel.
const EVENT_CAPACITY: usize = 256;

// =============================================================================
// Settings
// =============================================================================

/// Username and password for a broker.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// How to reach one bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusSettings {
    /// Logical bus name, used in reply-to addresses and route metadata.
    pub bus: String,
    /// Broker hosts, tried in order.
    pub hosts: Vec<String>,
    pub credentials: Option<Credentials>,
    pub heartbeat: Duration,
    pub retry_interval: Duration,
}

impl BusSettings {
    pub fn new<I, S>(bus: impl Into<String>, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            bus: bus.into(),
            hosts: hosts.into_iter().map(Into::into).collect(),
            credentials: None,
            heartbeat: DEFAULT_HEARTBEAT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            user: user.into(),
            password: password.into(),
        });
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }
}

/// RPC client settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcSettings {
    pub timeout: Duration,
}

impl RpcSettings {
    pub fn from_millis(timeout_ms: u64) -> Self {
        Self {
            timeout: Duration::from_millis(timeout_ms),
        }
    }
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_RPC_TIMEOUT,
        }
    }
}

// =============================================================================
// State and Events
// =============================================================================

/// Last known state of a bus connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Never connected yet.
    #[default]
    Unknown,
    Connected,
    Disconnected,
}

/// A state transition on one bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// First successful connection.
    Connected { bus: String },
    /// The transport lost its broker.
    Disconnected { bus: String },
    /// The transport is back after a disconnect. Broker-side state may be gone.
    Reconnected { bus: String },
}

impl ConnectionEvent {
    pub fn bus(&self) -> &str {
        match self {
            ConnectionEvent::Connected { bus }
            | ConnectionEvent::Disconnected { bus }
            | ConnectionEvent::Reconnected { bus } => bus,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Up,
    Down,
}

/// Handle a transport uses to report its state. Never blocks.
#[derive(Clone)]
pub struct ConnectionSignals {
    bus: String,
    tx: mpsc::UnboundedSender<(String, Signal)>,
}

impl ConnectionSignals {
    pub fn bus(&self) -> &str {
        &self.bus
    }

    /// The transport is connected (first time or again).
    pub fn connected(&self) {
        self.signal(Signal::Up);
    }

    /// The transport lost its connection.
    pub fn disconnected(&self) {
        self.signal(Signal::Down);
    }

    fn signal(&self, signal: Signal) {
        // Closed only after the manager is gone; nobody is listening then.
        let _ = self.tx.send((self.bus.clone(), signal));
    }
}

impl fmt::Debug for ConnectionSignals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSignals")
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

/// Establishes a transport for one broker technology.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Transport: Send + Sync + 'static;

    /// Connect to the bus described by `settings`.
    ///
    /// The transport keeps `signals` and reports disconnects and recoveries
    /// through it. Reconnecting is the transport's job.
    async fn connect(
        &self,
        settings: &BusSettings,
        signals: ConnectionSignals,
    ) -> anyhow::Result<Self::Transport>;
}

// =============================================================================
// Connections
// =============================================================================

/// Snapshot of one bus connection.
pub struct Connection<T> {
    bus: String,
    transport: Option<Arc<T>>,
    state: ConnectionState,
}

impl<T> Connection<T> {
    pub fn bus(&self) -> &str {
        &self.bus
    }

    pub fn transport(&self) -> Option<&Arc<T>> {
        self.transport.as_ref()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

impl<T> Clone for Connection<T> {
    fn clone(&self) -> Self {
        Self {
            bus: self.bus.clone(),
            transport: self.transport.clone(),
            state: self.state,
        }
    }
}

impl<T> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("bus", &self.bus)
            .field("has_transport", &self.transport.is_some())
            .field("state", &self.state)
            .finish()
    }
}

struct Entry<T> {
    transport: Option<Arc<T>>,
    state: watch::Sender<ConnectionState>,
}

struct Shared<T> {
    entries: DashMap<String, Entry<T>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl<T> Shared<T> {
    /// Apply a signal under the entry lock so the pump and `connect` never
    /// emit the same transition twice.
    fn apply(&self, bus: &str, signal: Signal) {
        let event = {
            let Some(entry) = self.entries.get_mut(bus) else {
                debug!(bus, ?signal, "signal for unknown bus ignored");
                return;
            };
            let previous = *entry.state.borrow();
            let (next, event) = match (previous, signal) {
                (ConnectionState::Connected, Signal::Up)
                | (ConnectionState::Disconnected, Signal::Down)
                | (ConnectionState::Unknown, Signal::Down) => return,
                (ConnectionState::Unknown, Signal::Up) => (
                    ConnectionState::Connected,
                    ConnectionEvent::Connected { bus: bus.to_owned() },
                ),
                (ConnectionState::Disconnected, Signal::Up) => (
                    ConnectionState::Connected,
                    ConnectionEvent::Reconnected { bus: bus.to_owned() },
                ),
                (ConnectionState::Connected, Signal::Down) => (
                    ConnectionState::Disconnected,
                    ConnectionEvent::Disconnected { bus: bus.to_owned() },
                ),
            };
            entry.state.send_replace(next);
            event
        };

        match &event {
            ConnectionEvent::Disconnected { bus } => warn!(bus = %bus, "bus disconnected"),
            ConnectionEvent::Reconnected { bus } => info!(bus = %bus, "bus reconnected"),
            ConnectionEvent::Connected { bus } => info!(bus = %bus, "bus connected"),
        }
        // No receivers is fine: nobody cares about this bus yet.
        let _ = self.events.send(event);
    }
}

/// Owns one connection per bus and broadcasts their state changes.
///
/// Must be created inside a tokio runtime; the signal pump is spawned on it
/// and aborted when the manager is dropped.
pub struct ConnectionManager<T> {
    shared: Arc<Shared<T>>,
    signals: mpsc::UnboundedSender<(String, Signal)>,
    pump: JoinHandle<()>,
}

impl<T: Send + Sync + 'static> ConnectionManager<T> {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            entries: DashMap::new(),
            events,
        });
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, Signal)>();

        let pump_shared = shared.clone();
        let pump = tokio::spawn(async move {
            while let Some((bus, signal)) = rx.recv().await {
                pump_shared.apply(&bus, signal);
            }
        });

        Self {
            shared,
            signals: tx,
            pump,
        }
    }

    /// Connect a bus. Replaces any previous connection with the same name.
    ///
    /// # Errors
    ///
    /// [`EntityError::ConnectFailed`] when the connector fails.
    pub async fn connect<C>(&self, connector: &C, settings: &BusSettings) -> Result<Connection<T>, EntityError>
    where
        C: Connector<Transport = T>,
    {
        let bus = settings.bus.clone();
        self.shared.entries.insert(
            bus.clone(),
            Entry {
                transport: None,
                state: watch::channel(ConnectionState::Unknown).0,
            },
        );

        let signals = self.signals(&bus);
        match connector.connect(settings, signals).await {
            Ok(transport) => {
                if let Some(mut entry) = self.shared.entries.get_mut(&bus) {
                    entry.transport = Some(Arc::new(transport));
                }
                self.shared.apply(&bus, Signal::Up);
                self.connection(&bus)
                    .ok_or(EntityError::NotConnected { bus })
            }
            Err(source) => {
                self.shared.entries.remove(&bus);
                warn!(bus = %bus, error = %source, "connect failed");
                Err(EntityError::ConnectFailed { bus, source })
            }
        }
    }

    /// Signal handle for `bus`. Signals for buses never connected are ignored.
    pub fn signals(&self, bus: &str) -> ConnectionSignals {
        ConnectionSignals {
            bus: bus.to_owned(),
            tx: self.signals.clone(),
        }
    }

    pub fn connection(&self, bus: &str) -> Option<Connection<T>> {
        self.shared.entries.get(bus).map(|entry| Connection {
            bus: bus.to_owned(),
            transport: entry.transport.clone(),
            state: *entry.state.borrow(),
        })
    }

    pub fn transport(&self, bus: &str) -> Option<Arc<T>> {
        self.shared
            .entries
            .get(bus)
            .and_then(|entry| entry.transport.clone())
    }

    pub fn state(&self, bus: &str) -> ConnectionState {
        self.shared
            .entries
            .get(bus)
            .map(|entry| *entry.state.borrow())
            .unwrap_or_default()
    }

    /// Watch one bus's state.
    pub fn watch(&self, bus: &str) -> Option<watch::Receiver<ConnectionState>> {
        self.shared.entries.get(bus).map(|entry| entry.state.subscribe())
    }

    /// Every connection event from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    /// Forget a bus. Its transport is dropped once the last holder lets go.
    pub fn close(&self, bus: &str) -> bool {
        self.shared.entries.remove(bus).is_some()
    }

    pub fn buses(&self) -> Vec<String> {
        self.shared.entries.iter().map(|e| e.key().clone()).collect()
    }
}

impl<T: Send + Sync + 'static> Default for ConnectionManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for ConnectionManager<T> {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl<T> fmt::Debug for ConnectionManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("buses", &self.shared.entries.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Flaky {
        fail: bool,
    }

    #[async_trait]
    impl Connector for Flaky {
        type Transport = String;

        async fn connect(&self, settings: &BusSettings, signals: ConnectionSignals) -> anyhow::Result<String> {
            if self.fail {
                anyhow::bail!("connection refused");
            }
            signals.connected();
            Ok(settings.hosts.join(","))
        }
    }

    fn settings() -> BusSettings {
        BusSettings::new("main", ["nats://a:4222", "nats://b:4222"])
    }

    async fn next(rx: &mut broadcast::Receiver<ConnectionEvent>) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event")
            .expect("channel open")
    }

    #[test]
    fn test_settings_defaults() {
        let s = settings();
        assert_eq!(s.heartbeat, Duration::from_secs(10));
        assert_eq!(s.retry_interval, Duration::from_secs(2));
        assert_eq!(RpcSettings::default().timeout, Duration::from_secs(30));
        assert_eq!(RpcSettings::from_millis(250).timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_credentials_are_redacted() {
        let s = settings().with_credentials("svc", "hunter2");
        let text = format!("{s:?}");
        assert!(text.contains("svc"));
        assert!(!text.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_connect_emits_connected_once() {
        let manager = ConnectionManager::new();
        let mut events = manager.subscribe();

        let conn = manager.connect(&Flaky { fail: false }, &settings()).await.unwrap();
        assert!(conn.is_connected());
        assert_eq!(conn.transport().map(|t| t.as_str()), Some("nats://a:4222,nats://b:4222"));

        assert_eq!(
            next(&mut events).await,
            ConnectionEvent::Connected { bus: "main".into() }
        );
        // The connector's own signal arrives after connect and is deduplicated.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_no_entry() {
        let manager = ConnectionManager::<String>::new();
        let err = manager.connect(&Flaky { fail: true }, &settings()).await.unwrap_err();
        assert!(matches!(err, EntityError::ConnectFailed { .. }));
        assert!(manager.connection("main").is_none());
        assert_eq!(manager.state("main"), ConnectionState::Unknown);
    }

    #[tokio::test]
    async fn test_disconnect_then_recover_is_reconnected() {
        let manager = ConnectionManager::new();
        manager.connect(&Flaky { fail: false }, &settings()).await.unwrap();
        let mut events = manager.subscribe();
        let mut state = manager.watch("main").unwrap();

        let signals = manager.signals("main");
        signals.disconnected();
        assert_eq!(
            next(&mut events).await,
            ConnectionEvent::Disconnected { bus: "main".into() }
        );
        state.changed().await.unwrap();
        assert_eq!(*state.borrow(), ConnectionState::Disconnected);

        signals.connected();
        assert_eq!(
            next(&mut events).await,
            ConnectionEvent::Reconnected { bus: "main".into() }
        );
        assert_eq!(manager.state("main"), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_repeated_signals_are_collapsed() {
        let manager = ConnectionManager::new();
        manager.connect(&Flaky { fail: false }, &settings()).await.unwrap();
        let mut events = manager.subscribe();

        let signals = manager.signals("main");
        signals.disconnected();
        signals.disconnected();
        signals.connected();
        signals.connected();

        assert!(matches!(next(&mut events).await, ConnectionEvent::Disconnected { .. }));
        assert!(matches!(next(&mut events).await, ConnectionEvent::Reconnected { .. }));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_signals_for_unknown_bus_are_ignored() {
        let manager = ConnectionManager::<String>::new();
        let mut events = manager.subscribe();
        manager.signals("ghost").connected();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(events.try_recv().is_err());
        assert!(manager.buses().is_empty());
    }
}
