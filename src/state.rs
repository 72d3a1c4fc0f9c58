use crate::connection::SharedConnection;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

/// A registered client: its connection, keep-alive cadence and the channel
/// feeding its worker.
pub(crate) struct ClientEntry {
    connection: SharedConnection,
    keep_alive: Duration,
    last_check: Instant,
    checks: mpsc::Sender<Instant>,
    worker: Option<JoinHandle<()>>,
}

impl ClientEntry {
    pub fn new(
        connection: SharedConnection,
        keep_alive_secs: u16,
        registered_at: Instant,
        checks: mpsc::Sender<Instant>,
        worker: Option<JoinHandle<()>>,
    ) -> Self {
        ClientEntry {
            connection,
            keep_alive: Duration::from_secs(u64::from(keep_alive_secs)),
            last_check: registered_at,
            checks,
            worker,
        }
    }

    /// Detaches the connection. Dropping the check sender stops the worker;
    /// the transport stays open.
    pub fn into_connection(self) -> SharedConnection {
        self.connection
    }

    /// Waits for the worker to finish after a shutdown signal.
    pub async fn join(self) -> Result<(), tokio::task::JoinError> {
        match self.worker {
            Some(worker) => worker.await,
            None => Ok(()),
        }
    }
}

/// The supervisor's client table, keyed by client id.
#[derive(Default)]
pub(crate) struct Registry {
    clients: HashMap<String, ClientEntry>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Inserts the entry, returning any entry it replaced.
    pub fn register(&mut self, client_id: String, entry: ClientEntry) -> Option<ClientEntry> {
        self.clients.insert(client_id, entry)
    }

    pub fn unregister(&mut self, client_id: &str) -> Option<ClientEntry> {
        self.clients.remove(client_id)
    }

    pub fn lookup(&self, client_id: &str) -> Option<SharedConnection> {
        self.clients.get(client_id).map(|entry| entry.connection.clone())
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.clients.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Collects every client whose keep-alive period has elapsed since its
    /// last check and restamps those clients with `now`. Clients with a
    /// keep-alive of 0 are never due.
    ///
    /// The period counts from the later of the last check and the
    /// connection's last activity, so a client that just published is not
    /// checked early and an idle one pings on the first due tick. A
    /// connection busy with another exchange is judged by its last check
    /// alone.
    pub fn due_for_check(&mut self, now: Instant) -> Vec<(String, mpsc::Sender<Instant>)> {
        let mut due = Vec::new();
        for (client_id, entry) in self.clients.iter_mut() {
            if entry.keep_alive.is_zero() {
                continue;
            }
            let since = match entry.connection.try_lock() {
                Ok(connection) => entry.last_check.max(connection.last_activity()),
                Err(_) => entry.last_check,
            };
            if now.saturating_duration_since(since) >= entry.keep_alive {
                entry.last_check = now;
                due.push((client_id.clone(), entry.checks.clone()));
            }
        }
        due
    }

    pub fn drain(&mut self) -> Vec<(String, ClientEntry)> {
        self.clients.drain().collect()
    }
}
