#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};
use tokio::time::Duration;
use umqtt_client::{Connector, MqttError, Transport};

pub const CONNECT: u8 = 0x10;
pub const PUBLISH: u8 = 0x30;
pub const PINGREQ: u8 = 0xC0;
pub const DISCONNECT: u8 = 0xE0;

/// Scripted broker behind one host name. Clones share state, so a test can
/// keep a handle while the connection owns the transport.
#[derive(Clone)]
pub struct MockLink {
    sent: Arc<Mutex<Vec<Bytes>>>,
    sent_notify: Arc<Notify>,
    connack: Arc<Mutex<Option<Vec<u8>>>>,
    answer_pings: Arc<AtomicBool>,
    fail_sends: Arc<AtomicBool>,
    closes: Arc<AtomicUsize>,
    opens: Arc<AtomicUsize>,
    open_delay: Arc<Mutex<Option<Duration>>>,
}

impl MockLink {
    fn with_connack(connack: Option<Vec<u8>>) -> Self {
        MockLink {
            sent: Arc::new(Mutex::new(Vec::new())),
            sent_notify: Arc::new(Notify::new()),
            connack: Arc::new(Mutex::new(connack)),
            answer_pings: Arc::new(AtomicBool::new(true)),
            fail_sends: Arc::new(AtomicBool::new(false)),
            closes: Arc::new(AtomicUsize::new(0)),
            opens: Arc::new(AtomicUsize::new(0)),
            open_delay: Arc::new(Mutex::new(None)),
        }
    }

    /// Accepts every CONNECT and answers every PINGREQ.
    pub fn accepting() -> Self {
        Self::with_connack(Some(vec![0x20, 0x02, 0x00, 0x00]))
    }

    pub fn refusing(code: u8) -> Self {
        Self::with_connack(Some(vec![0x20, 0x02, 0x00, code]))
    }

    /// Never answers CONNECT.
    pub fn silent() -> Self {
        Self::with_connack(None)
    }

    /// Answers CONNECT with an arbitrary frame.
    pub fn with_connack_frame(frame: Vec<u8>) -> Self {
        Self::with_connack(Some(frame))
    }

    pub fn set_connack_code(&self, code: u8) {
        *self.connack.lock().unwrap() = Some(vec![0x20, 0x02, 0x00, code]);
    }

    /// Makes every later open take `delay` before the transport is ready.
    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_answer_pings(&self, answer: bool) {
        self.answer_pings.store(answer, Ordering::SeqCst);
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count_sent(&self, header: u8) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|frame| frame.first() == Some(&header))
            .count()
    }

    /// Waits until at least `count` frames starting with `header` were sent.
    pub async fn wait_for_sent(&self, header: u8, count: usize) {
        loop {
            let notified = self.sent_notify.notified();
            if self.count_sent(header) >= count {
                return;
            }
            notified.await;
        }
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

struct MockTransport {
    link: MockLink,
    inbound_tx: mpsc::UnboundedSender<Bytes>,
    inbound_rx: mpsc::UnboundedReceiver<Bytes>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, data: &[u8]) -> Result<(), MqttError> {
        if self.link.fail_sends.load(Ordering::SeqCst) {
            return Err(MqttError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe")));
        }
        self.link.sent.lock().unwrap().push(Bytes::copy_from_slice(data));

        let reply = match data.first() {
            Some(&CONNECT) => self.link.connack.lock().unwrap().clone(),
            Some(&PINGREQ) if self.link.answer_pings.load(Ordering::SeqCst) => Some(vec![0xD0, 0x00]),
            _ => None,
        };
        if let Some(reply) = reply {
            let _ = self.inbound_tx.send(Bytes::from(reply));
        }
        self.link.sent_notify.notify_waiters();
        Ok(())
    }

    async fn receive(&mut self, max_bytes: usize) -> Result<Bytes, MqttError> {
        match self.inbound_rx.recv().await {
            Some(frame) if frame.len() > max_bytes => Err(MqttError::PacketTooLarge(format!(
                "{} bytes",
                frame.len()
            ))),
            Some(frame) => Ok(frame),
            None => Err(MqttError::Io(io::ErrorKind::UnexpectedEof.into())),
        }
    }

    async fn close(&mut self) -> Result<(), MqttError> {
        self.link.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Host name to scripted broker. Unknown hosts fail to open.
#[derive(Clone, Default)]
pub struct MockNetwork {
    links: Arc<Mutex<HashMap<String, MockLink>>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        MockNetwork::default()
    }

    pub fn add(&self, host: &str, link: MockLink) -> MockLink {
        self.links.lock().unwrap().insert(host.to_string(), link.clone());
        link
    }
}

#[async_trait]
impl Connector for MockNetwork {
    async fn open(&self, host: &str, _port: u16) -> Result<Box<dyn Transport>, MqttError> {
        let link = self.links.lock().unwrap().get(host).cloned();
        let link = link.ok_or_else(|| {
            MqttError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("no route to {}", host),
            ))
        })?;
        link.opens.fetch_add(1, Ordering::SeqCst);
        let delay = *link.open_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Ok(Box::new(MockTransport {
            link,
            inbound_tx,
            inbound_rx,
        }))
    }
}

/// Records hook calls as `event:client` strings.
#[derive(Clone, Default)]
pub struct TestHooks {
    calls: Arc<Mutex<Vec<String>>>,
    notify: Arc<Notify>,
}

impl TestHooks {
    pub fn new() -> Self {
        TestHooks::default()
    }

    pub fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
        self.notify.notify_waiters();
    }

    pub fn get_calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub async fn wait_for(&self, call: &str) {
        loop {
            let notified = self.notify.notified();
            if self.get_calls().iter().any(|c| c == call) {
                return;
            }
            notified.await;
        }
    }
}
