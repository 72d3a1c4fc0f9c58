use crate::connection::{ConnectionState, Liveness, SharedConnection};
use crate::error::MqttError;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub type ClientHook = Arc<dyn Fn(&str) -> Result<(), String> + Send + Sync>;
pub type ConnectionLostHook = Arc<dyn Fn(&str, &MqttError) -> Result<(), String> + Send + Sync>;

/// Callbacks fired on client lifecycle events. A failing hook is logged and
/// never aborts the operation that fired it.
#[derive(Clone, Default)]
pub(crate) struct Hooks {
    pub connect: Option<ClientHook>,
    pub disconnect: Option<ClientHook>,
    pub connection_lost: Option<ConnectionLostHook>,
}

impl Hooks {
    pub fn connected(&self, client_id: &str) {
        if let Some(hook) = self.connect.as_ref() {
            if let Err(e) = hook(client_id) {
                warn!("Connect hook failed for client {}: {}", client_id, e);
            }
        }
    }

    pub fn disconnected(&self, client_id: &str) {
        if let Some(hook) = self.disconnect.as_ref() {
            if let Err(e) = hook(client_id) {
                warn!("Disconnect hook failed for client {}: {}", client_id, e);
            }
        }
    }

    pub fn connection_lost(&self, client_id: &str, error: &MqttError) {
        if let Some(hook) = self.connection_lost.as_ref() {
            if let Err(e) = hook(client_id, error) {
                warn!("Connection lost hook failed for client {}: {}", client_id, e);
            }
        }
    }
}

/// Runs the liveness checks the supervisor dispatches to one connection.
///
/// Exits when the supervisor shuts down, closing the connection, or when
/// the client is unregistered, leaving the connection untouched.
pub(crate) async fn run_client_worker(
    client_id: String,
    connection: SharedConnection,
    mut checks: mpsc::Receiver<Instant>,
    mut shutdown: broadcast::Receiver<()>,
    hooks: Hooks,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                let mut connection = connection.lock().await;
                if matches!(connection.state(), ConnectionState::Connected | ConnectionState::Connecting) {
                    match connection.disconnect().await {
                        Ok(()) => hooks.disconnected(&client_id),
                        Err(e) => warn!("Client {} failed to disconnect on shutdown: {}", client_id, e),
                    }
                }
                info!("Client {} worker stopped", client_id);
                break;
            }
            check = checks.recv() => {
                match check {
                    Some(now) => check_client(&client_id, &connection, now, &hooks).await,
                    None => {
                        debug!("Client {} unregistered, worker exiting", client_id);
                        break;
                    }
                }
            }
        }
    }
}

async fn check_client(client_id: &str, connection: &SharedConnection, now: Instant, hooks: &Hooks) {
    let result = connection.lock().await.check_liveness(now).await;
    match result {
        Ok(Liveness::PingAcknowledged) => debug!("Client {} is alive", client_id),
        Ok(Liveness::NotDue) => {}
        Err(MqttError::NotConnected { .. }) => {
            debug!("Client {} is not connected, skipping liveness check", client_id);
        }
        Err(e) => {
            warn!("Client {} failed liveness check: {}", client_id, e);
            hooks.connection_lost(client_id, &e);
        }
    }
}
