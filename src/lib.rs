mod client;
mod connection;
mod error;
pub mod packet;
pub mod protocol;
mod state;
pub mod transport;

pub use client::{ClientHook, ConnectionLostHook};
pub use connection::{Connection, ConnectionConfig, ConnectionState, Liveness, SharedConnection};
pub use error::MqttError;
pub use packet::{ConnAck, Connect, ConnectFlags, FixedHeader, Packet, Publish};
pub use protocol::{ConnectReturnCode, PacketType, QoS};
pub use transport::{Connector, TcpConnector, Transport, WsConnector};

use bytes::Bytes;
use client::Hooks;
use state::{ClientEntry, Registry};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Configuration for the client supervisor.
pub struct SupervisorConfig {
    tick_interval: Duration,
    connector: Arc<dyn Connector>,
    connection: ConnectionConfig,
    hooks: Hooks,
}

impl SupervisorConfig {
    /// Creates a configuration with a 1 second tick over plain TCP.
    pub fn new() -> Self {
        SupervisorConfig {
            tick_interval: Duration::from_secs(1),
            connector: Arc::new(TcpConnector::default()),
            connection: ConnectionConfig::default(),
            hooks: Hooks::default(),
        }
    }

    /// Sets how often registered clients are scanned for due liveness checks.
    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval.max(Duration::from_millis(1));
        self
    }

    /// Sets the connector used to open every client's transport.
    pub fn with_connector<C>(mut self, connector: C) -> Self
    where
        C: Connector + 'static,
    {
        self.connector = Arc::new(connector);
        self
    }

    /// Sets the per-connection settings applied to new clients.
    pub fn with_connection_config(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    /// Sets the hook fired after a client's CONNECT is accepted.
    pub fn with_connect_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) -> Result<(), String> + Send + Sync + 'static,
    {
        self.hooks.connect = Some(Arc::new(hook));
        self
    }

    /// Sets the hook fired after a client disconnects cleanly.
    pub fn with_disconnect_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) -> Result<(), String> + Send + Sync + 'static,
    {
        self.hooks.disconnect = Some(Arc::new(hook));
        self
    }

    /// Sets the hook fired when a client's connection is lost.
    pub fn with_connection_lost_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, &MqttError) -> Result<(), String> + Send + Sync + 'static,
    {
        self.hooks.connection_lost = Some(Arc::new(hook));
        self
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig::new()
    }
}

/// Result of `Supervisor::create_client`. The client is registered either way.
#[derive(Debug)]
pub struct ClientRegistration {
    /// Outcome of the initial connect.
    pub connect: Result<(), MqttError>,
    /// A connection previously registered under the same id. It is no longer
    /// supervised, and its transport stays open until the caller closes it.
    pub replaced: Option<SharedConnection>,
}

/// Runs many client connections and keeps each one alive at its own
/// keep-alive cadence.
pub struct Supervisor {
    registry: Arc<Mutex<Registry>>,
    config: SupervisorConfig,
    shutdown_tx: broadcast::Sender<()>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Supervisor {
    /// Creates a new supervisor with the given configuration.
    pub fn new(config: SupervisorConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Supervisor {
            registry: Arc::new(Mutex::new(Registry::new())),
            config,
            shutdown_tx,
            ticker: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    /// Starts the periodic tick that dispatches liveness checks.
    pub async fn start(&self) -> Result<(), MqttError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(MqttError::Stopped);
        }
        let mut ticker = self.ticker.lock().await;
        if ticker.is_some() {
            return Err(MqttError::AlreadyRunning);
        }

        let registry = self.registry.clone();
        let tick_interval = self.config.tick_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        *ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Supervisor tick loop stopping");
                        break;
                    }
                    now = interval.tick() => {
                        dispatch_due_checks(&registry, now).await;
                    }
                }
            }
        }));
        info!("Supervisor started with tick interval {:?}", tick_interval);
        Ok(())
    }

    /// Runs one scheduling pass: every client whose keep-alive period has
    /// elapsed since its last check gets a liveness check on its own worker.
    /// Returns the number of checks dispatched.
    pub async fn tick(&self, now: Instant) -> usize {
        dispatch_due_checks(&self.registry, now).await
    }

    /// Connects a new client and registers it whatever the connect outcome.
    ///
    /// Fails outright only for an invalid client id or a stopped supervisor.
    pub async fn create_client(
        &self,
        client_id: impl Into<String>,
        host: &str,
        port: u16,
        keep_alive: u16,
    ) -> Result<ClientRegistration, MqttError> {
        // Subscribe before checking the flag so a shutdown racing the
        // connect below is either seen here or delivered to the worker.
        let shutdown_rx = self.shutdown_tx.subscribe();
        if self.stopped.load(Ordering::SeqCst) {
            return Err(MqttError::Stopped);
        }
        let client_id = client_id.into();
        let mut connection = Connection::with_config(
            client_id.clone(),
            self.config.connector.clone(),
            self.config.connection.clone(),
        )?;

        let connect = connection.connect(host, port, keep_alive).await;
        match &connect {
            Ok(()) => self.config.hooks.connected(&client_id),
            Err(e) => warn!("Client {} registered without a connection: {}", client_id, e),
        }

        let mut registry = self.registry.lock().await;
        if self.stopped.load(Ordering::SeqCst) {
            drop(registry);
            warn!("Client {} connected after shutdown began, disconnecting", client_id);
            if connection.is_connected() {
                connection.disconnect().await?;
                self.config.hooks.disconnected(&client_id);
            }
            return Err(MqttError::Stopped);
        }

        let connection = Arc::new(Mutex::new(connection));
        let (checks_tx, checks_rx) = mpsc::channel(1);
        let worker = tokio::spawn(client::run_client_worker(
            client_id.clone(),
            connection.clone(),
            checks_rx,
            shutdown_rx,
            self.config.hooks.clone(),
        ));
        let entry = ClientEntry::new(connection, keep_alive, Instant::now(), checks_tx, Some(worker));
        let replaced = registry.register(client_id.clone(), entry).map(|previous| {
            warn!(
                "Client {} replaced an existing registration; the previous connection stays open",
                client_id
            );
            previous.into_connection()
        });
        info!("Client {} created ({} registered)", client_id, registry.len());
        drop(registry);

        Ok(ClientRegistration { connect, replaced })
    }

    /// Publishes on a registered client's connection.
    pub async fn publish(
        &self,
        client_id: &str,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
    ) -> Result<(), MqttError> {
        let connection = self.lookup(client_id).await?;
        let result = connection.lock().await.publish(topic, payload, qos).await;
        if let Err(e @ MqttError::ConnectionLost { .. }) = &result {
            self.config.hooks.connection_lost(client_id, e);
        }
        result
    }

    /// Disconnects a registered client. It stays registered in `Closed` state.
    pub async fn disconnect(&self, client_id: &str) -> Result<(), MqttError> {
        let connection = self.lookup(client_id).await?;
        connection.lock().await.disconnect().await?;
        self.config.hooks.disconnected(client_id);
        Ok(())
    }

    /// Unregisters a client and stops its worker. The connection is handed
    /// back as is; closing it is up to the caller.
    pub async fn remove_client(&self, client_id: &str) -> Option<SharedConnection> {
        let entry = self.registry.lock().await.unregister(client_id)?;
        debug!("Client {} removed", client_id);
        Some(entry.into_connection())
    }

    /// Shared handle to a registered client's connection.
    pub async fn connection(&self, client_id: &str) -> Option<SharedConnection> {
        self.registry.lock().await.lookup(client_id)
    }

    /// Current state of a registered client. Waits for any exchange in
    /// progress on that connection.
    pub async fn client_state(&self, client_id: &str) -> Option<ConnectionState> {
        let connection = self.connection(client_id).await?;
        let state = connection.lock().await.state();
        Some(state)
    }

    /// Ids of every registered client, in no particular order.
    pub async fn client_ids(&self) -> Vec<String> {
        self.registry.lock().await.client_ids()
    }

    /// Stops the tick, then signals every worker to disconnect its client
    /// and waits for them. The supervisor cannot be restarted.
    pub async fn shutdown(&self) -> Result<(), MqttError> {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());

        if let Some(ticker) = self.ticker.lock().await.take() {
            ticker.await?;
        }

        let entries = self.registry.lock().await.drain();
        for (client_id, entry) in entries {
            if let Err(e) = entry.join().await {
                error!("Client {} worker failed: {}", client_id, e);
            }
        }
        info!("Supervisor stopped");
        Ok(())
    }

    async fn lookup(&self, client_id: &str) -> Result<SharedConnection, MqttError> {
        self.connection(client_id)
            .await
            .ok_or_else(|| MqttError::UnknownClient(client_id.to_string()))
    }
}

async fn dispatch_due_checks(registry: &Mutex<Registry>, now: Instant) -> usize {
    let due = registry.lock().await.due_for_check(now);
    let mut dispatched = 0;
    for (client_id, checks) in due {
        match checks.try_send(now) {
            Ok(()) => dispatched += 1,
            Err(TrySendError::Full(_)) => {
                debug!("Client {} still has a liveness check pending", client_id);
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Client {} worker has exited", client_id);
            }
        }
    }
    dispatched
}
