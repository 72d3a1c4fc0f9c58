use crate::error::MqttError;
use crate::packet::{
    check_string_length, decode_connack, decode_pingresp, encode_connect, encode_disconnect,
    encode_pingreq, encode_publish, Connect, ConnectFlags, Publish,
};
use crate::protocol::QoS;
use crate::transport::{Connector, Transport};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, error, info, warn};

/// A connection shared between its worker and callers. The lock serializes
/// every exchange on the transport.
pub type SharedConnection = Arc<Mutex<Connection>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal: reached by `disconnect` or a failed liveness check.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Outcome of a successful `check_liveness`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// The connection was active recently enough, or keep-alive is disabled.
    NotDue,
    /// A PINGREQ went out and a valid PINGRESP came back in time.
    PingAcknowledged,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bound on opening the transport plus receiving CONNACK.
    pub connect_timeout: Duration,
    /// Largest inbound packet accepted, in bytes.
    pub receive_limit: usize,
    pub clean_session: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            connect_timeout: Duration::from_secs(30),
            receive_limit: 100,
            clean_session: true,
        }
    }
}

/// One client session to a broker.
pub struct Connection {
    client_id: String,
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    transport: Option<Box<dyn Transport>>,
    state: ConnectionState,
    keep_alive: u16,
    last_activity: Instant,
}

impl Connection {
    pub fn new(client_id: impl Into<String>, connector: Arc<dyn Connector>) -> Result<Self, MqttError> {
        Self::with_config(client_id, connector, ConnectionConfig::default())
    }

    /// Fails if `client_id` does not fit a length-prefixed string.
    pub fn with_config(
        client_id: impl Into<String>,
        connector: Arc<dyn Connector>,
        config: ConnectionConfig,
    ) -> Result<Self, MqttError> {
        let client_id = client_id.into();
        check_string_length("client ID", &client_id)?;
        Ok(Connection {
            client_id,
            connector,
            config,
            transport: None,
            state: ConnectionState::Disconnected,
            keep_alive: 0,
            last_activity: Instant::now(),
        })
    }

    /// The id sent in CONNECT.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// True only in `Connected`; `Connecting` does not count.
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Keep-alive in seconds from the last `connect` call, 0 before any.
    pub fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    /// When a packet was last sent or a PINGRESP last received.
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Opens the transport, sends CONNECT and waits for CONNACK.
    ///
    /// Only valid while `Disconnected`. Every failure leaves the connection
    /// `Disconnected` with the transport released, so the caller may retry.
    pub async fn connect(&mut self, host: &str, port: u16, keep_alive: u16) -> Result<(), MqttError> {
        if self.state != ConnectionState::Disconnected {
            return Err(MqttError::InvalidState {
                client_id: self.client_id.clone(),
                operation: "connect",
                state: self.state.to_string(),
            });
        }

        info!("Client {} connecting to {}:{}", self.client_id, host, port);
        self.keep_alive = keep_alive;
        self.state = ConnectionState::Connecting;

        let connect_timeout = self.config.connect_timeout;
        let handshake = timeout(connect_timeout, self.handshake(host, port)).await;
        let outcome = match handshake {
            Ok(result) => result,
            Err(_) => Err(MqttError::ConnectError {
                client_id: self.client_id.clone(),
                reason: format!("no CONNACK within {:?}", connect_timeout),
            }),
        };

        match outcome {
            Ok(()) => {
                self.state = ConnectionState::Connected;
                self.last_activity = Instant::now();
                info!("Client {} - Connection Accepted", self.client_id);
                Ok(())
            }
            Err(e) => {
                self.release_transport().await;
                self.state = ConnectionState::Disconnected;
                let e = match e {
                    reported @ (MqttError::ConnectRefused { .. } | MqttError::ConnectError { .. }) => {
                        reported
                    }
                    other => MqttError::ConnectError {
                        client_id: self.client_id.clone(),
                        reason: other.to_string(),
                    },
                };
                warn!("{}", e);
                Err(e)
            }
        }
    }

    async fn handshake(&mut self, host: &str, port: u16) -> Result<(), MqttError> {
        let transport = self.connector.open(host, port).await?;
        let transport = self.transport.insert(transport);

        let flags = ConnectFlags {
            clean_session: self.config.clean_session,
            ..ConnectFlags::default()
        };
        let connect = Connect::new(self.client_id.clone(), self.keep_alive)?.with_flags(flags);
        transport.send(&encode_connect(&connect)?).await?;

        let response = transport.receive(self.config.receive_limit).await?;
        let connack = decode_connack(&response)?;
        if !connack.is_accepted() {
            return Err(MqttError::ConnectRefused {
                client_id: self.client_id.clone(),
                code: connack.code(),
                reason: connack.reason(),
            });
        }
        Ok(())
    }

    /// Publishes at QoS 0. Higher levels are downgraded since their
    /// acknowledgement flows are not implemented.
    pub async fn publish(&mut self, topic: &str, payload: impl Into<Bytes>, qos: QoS) -> Result<(), MqttError> {
        let publish = Publish::new(topic, payload)?.with_qos(qos);
        self.publish_packet(publish).await
    }

    /// Sends an already built PUBLISH. A send failure closes the connection.
    pub async fn publish_packet(&mut self, publish: Publish) -> Result<(), MqttError> {
        if self.state != ConnectionState::Connected {
            warn!("Client {} not connected. Publishing not possible", self.client_id);
            return Err(MqttError::NotConnected {
                client_id: self.client_id.clone(),
            });
        }

        let publish = if publish.qos() != QoS::AtMostOnce {
            warn!(
                "Client {} downgrading publish on {} from {:?} to QoS 0",
                self.client_id,
                publish.topic(),
                publish.qos()
            );
            publish.with_qos(QoS::AtMostOnce)
        } else {
            publish
        };

        debug!(
            "Client {} publishing {} bytes to {}",
            self.client_id,
            publish.payload().len(),
            publish.topic()
        );
        self.send_packet(&encode_publish(&publish)?).await
    }

    /// Sends DISCONNECT on a best-effort basis and closes the connection.
    pub async fn disconnect(&mut self) -> Result<(), MqttError> {
        match self.state {
            ConnectionState::Connected | ConnectionState::Connecting => {}
            _ => {
                return Err(MqttError::NotConnected {
                    client_id: self.client_id.clone(),
                })
            }
        }

        if let Some(transport) = self.transport.as_mut() {
            if let Err(e) = transport.send(&encode_disconnect()).await {
                debug!("Client {} failed to send DISCONNECT: {}", self.client_id, e);
            }
        }
        self.release_transport().await;
        self.state = ConnectionState::Closed;
        info!("Client {} disconnected", self.client_id);
        Ok(())
    }

    /// Pings the broker once `keep_alive` seconds have passed since the last
    /// send, then waits up to `keep_alive` seconds for the PINGRESP.
    ///
    /// A missing or invalid PINGRESP, or any transport error, closes the
    /// connection and reports `ConnectionLost`.
    pub async fn check_liveness(&mut self, now: Instant) -> Result<Liveness, MqttError> {
        if self.state != ConnectionState::Connected {
            return Err(MqttError::NotConnected {
                client_id: self.client_id.clone(),
            });
        }
        if self.keep_alive == 0 {
            return Ok(Liveness::NotDue);
        }

        let keep_alive = Duration::from_secs(u64::from(self.keep_alive));
        if now.saturating_duration_since(self.last_activity) < keep_alive {
            return Ok(Liveness::NotDue);
        }

        info!("Client {} - Sending PINGREQ", self.client_id);
        self.send_packet(&encode_pingreq()).await?;

        let receive_limit = self.config.receive_limit;
        let transport = self.transport.as_mut().ok_or_else(|| MqttError::NotConnected {
            client_id: self.client_id.clone(),
        })?;
        let received = timeout(keep_alive, transport.receive(receive_limit)).await;
        let response = match received {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(self.lose(e.to_string()).await),
            Err(_) => {
                let reason = format!("no PINGRESP within {}s", self.keep_alive);
                return Err(self.lose(reason).await);
            }
        };

        if let Err(e) = decode_pingresp(&response) {
            return Err(self.lose(format!("invalid PINGRESP: {}", e)).await);
        }
        self.last_activity = Instant::now();
        info!("Client {} - PINGRESP received", self.client_id);
        Ok(Liveness::PingAcknowledged)
    }

    async fn send_packet(&mut self, data: &[u8]) -> Result<(), MqttError> {
        let transport = self.transport.as_mut().ok_or_else(|| MqttError::NotConnected {
            client_id: self.client_id.clone(),
        })?;
        let sent = transport.send(data).await;
        match sent {
            Ok(()) => {
                self.last_activity = Instant::now();
                Ok(())
            }
            Err(e) => Err(self.lose(e.to_string()).await),
        }
    }

    async fn lose(&mut self, reason: String) -> MqttError {
        error!("Client {} connection lost: {}", self.client_id, reason);
        self.release_transport().await;
        self.state = ConnectionState::Closed;
        MqttError::ConnectionLost {
            client_id: self.client_id.clone(),
            reason,
        }
    }

    async fn release_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                debug!("Client {} error closing transport: {}", self.client_id, e);
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("client_id", &self.client_id)
            .field("state", &self.state)
            .field("keep_alive", &self.keep_alive)
            .field("last_activity", &self.last_activity)
            .finish()
    }
}
