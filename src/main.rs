use std::env;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};
use umqtt_client::{MqttError, QoS, Supervisor, SupervisorConfig};

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(value) => match value.parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!("Ignoring invalid {}={:?}", name, value);
                default
            }
        },
        Err(_) => default,
    }
}

#[tokio::main]
async fn main() -> Result<(), MqttError> {
    tracing_subscriber::fmt().init();

    let server = env_or("MQTT_SERVER", "iot.eclipse.org".to_string());
    let port: u16 = env_or("MQTT_PORT", 1883);
    let client_id = env_or("MQTT_CLIENT_ID", "umqtt-demo".to_string());
    let keep_alive: u16 = env_or("MQTT_KEEP_ALIVE", 10);
    let topic = env_or("MQTT_TOPIC", "testtopic/subtopic".to_string());
    let publish_every: u64 = env_or("MQTT_PUBLISH_INTERVAL", 20);

    let config = SupervisorConfig::new()
        .with_connect_hook(|client_id| {
            info!("Client {} connected", client_id);
            Ok(())
        })
        .with_disconnect_hook(|client_id| {
            info!("Client {} disconnected", client_id);
            Ok(())
        })
        .with_connection_lost_hook(|client_id, e| {
            error!("Client {} lost its connection: {}", client_id, e);
            Ok(())
        });
    let supervisor = Supervisor::new(config);
    supervisor.start().await?;

    let registration = supervisor
        .create_client(client_id.as_str(), &server, port, keep_alive)
        .await?;
    if let Err(e) = registration.connect {
        error!("Initial connect failed: {}", e);
        supervisor.shutdown().await?;
        return Err(e);
    }

    let mut publish_tick = interval(Duration::from_secs(publish_every.max(1)));
    publish_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            _ = publish_tick.tick() => {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|elapsed| elapsed.as_secs())
                    .unwrap_or_default();
                match supervisor.publish(&client_id, &topic, now.to_string(), QoS::AtMostOnce).await {
                    Ok(()) => info!("Published {} to {}", now, topic),
                    Err(e) => {
                        error!("Publish failed: {}", e);
                        break;
                    }
                }
            }
        }
    }

    supervisor.shutdown().await
}
