use crate::error::MqttError;
use crate::packet::read_frame;
use bytes::Bytes;
use futures_util::sink::SinkExt;
use futures_util::stream::StreamExt;
use std::io;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// An established byte stream to a broker. Each call to `receive` yields
/// one packet frame of at most `max_bytes`.
#[async_trait::async_trait]
pub trait Transport: Send {
    async fn send(&mut self, data: &[u8]) -> Result<(), MqttError>;
    async fn receive(&mut self, max_bytes: usize) -> Result<Bytes, MqttError>;
    async fn close(&mut self) -> Result<(), MqttError>;
}

/// Opens transports. Name resolution and socket setup live behind this seam.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, host: &str, port: u16) -> Result<Box<dyn Transport>, MqttError>;
}

/// Plain TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        TcpConnector { connect_timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        TcpConnector::new(Duration::from_secs(30))
    }
}

#[async_trait::async_trait]
impl Connector for TcpConnector {
    async fn open(&self, host: &str, port: u16) -> Result<Box<dyn Transport>, MqttError> {
        let stream = timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connecting to {}:{} timed out", host, port),
                )
            })??;
        stream.set_nodelay(true)?;
        debug!("TCP stream open to {}:{}", host, port);
        Ok(Box::new(TcpTransport { stream }))
    }
}

pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        TcpTransport { stream }
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, data: &[u8]) -> Result<(), MqttError> {
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn receive(&mut self, max_bytes: usize) -> Result<Bytes, MqttError> {
        read_frame(&mut self.stream, max_bytes).await
    }

    async fn close(&mut self) -> Result<(), MqttError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// MQTT over WebSocket (`ws://host:port/path`, subprotocol `mqtt`).
#[derive(Debug, Clone)]
pub struct WsConnector {
    path: String,
}

impl WsConnector {
    /// `path` is the HTTP path of the upgrade request, e.g. `/mqtt`.
    pub fn new(path: impl Into<String>) -> Self {
        WsConnector { path: path.into() }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        WsConnector::new("/mqtt")
    }
}

#[async_trait::async_trait]
impl Connector for WsConnector {
    async fn open(&self, host: &str, port: u16) -> Result<Box<dyn Transport>, MqttError> {
        let url = format!("ws://{}:{}{}", host, port, self.path);
        let mut request = url.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("mqtt"));
        let (ws_stream, _) = connect_async(request).await?;
        debug!("WebSocket open to {}", url);
        Ok(Box::new(WsTransport { ws_stream }))
    }
}

pub struct WsTransport {
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait::async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, data: &[u8]) -> Result<(), MqttError> {
        self.ws_stream.send(Message::Binary(data.to_vec())).await?;
        Ok(())
    }

    async fn receive(&mut self, max_bytes: usize) -> Result<Bytes, MqttError> {
        loop {
            match self.ws_stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    if data.len() > max_bytes {
                        return Err(MqttError::PacketTooLarge(format!(
                            "{} byte packet exceeds receive limit of {}",
                            data.len(),
                            max_bytes
                        )));
                    }
                    return Ok(Bytes::from(data));
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(MqttError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "WebSocket closed",
                    )));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    async fn close(&mut self) -> Result<(), MqttError> {
        self.ws_stream.close(None).await?;
        Ok(())
    }
}
