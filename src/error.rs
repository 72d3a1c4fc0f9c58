use crate::protocol::PacketType;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MqttError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Malformed remaining length")]
    MalformedLength,
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
    #[error("Unknown CONNACK return code: {0}")]
    UnknownReturnCode(u8),
    #[error("Unsupported packet type: {0:?}")]
    UnsupportedPacketType(PacketType),
    #[error("Invalid QoS: {0}")]
    InvalidQos(u8),
    #[error("Packet too large: {0}")]
    PacketTooLarge(String),
    #[error("{field} too long: {len} bytes")]
    StringTooLong { field: &'static str, len: usize },
    #[error("Client {client_id}: connect failed: {reason}")]
    ConnectError { client_id: String, reason: String },
    #[error("Client {client_id}: connection refused ({code}): {reason}")]
    ConnectRefused {
        client_id: String,
        code: u8,
        reason: &'static str,
    },
    #[error("Client {client_id}: not connected")]
    NotConnected { client_id: String },
    #[error("Client {client_id}: connection lost: {reason}")]
    ConnectionLost { client_id: String, reason: String },
    #[error("Client {client_id}: cannot {operation} while {state}")]
    InvalidState {
        client_id: String,
        operation: &'static str,
        state: String,
    },
    #[error("Unknown client: {0}")]
    UnknownClient(String),
    #[error("Supervisor already running")]
    AlreadyRunning,
    #[error("Supervisor stopped")]
    Stopped,
    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl MqttError {
    /// Returns true for errors that leave the connection usable by a retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MqttError::ConnectError { .. } | MqttError::ConnectRefused { .. } | MqttError::NotConnected { .. }
        )
    }
}
