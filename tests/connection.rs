mod common;

use common::{MockLink, MockNetwork, DISCONNECT, PINGREQ, PUBLISH};
use std::sync::Arc;
use tokio::time::{advance, Duration, Instant};
use umqtt_client::{Connection, ConnectionConfig, ConnectionState, Liveness, MqttError, QoS};

fn connection(network: &MockNetwork, client_id: &str) -> Connection {
    Connection::new(client_id, Arc::new(network.clone())).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_pings_once_idle_for_keep_alive() {
    let network = MockNetwork::new();
    let link = network.add("broker", MockLink::accepting());
    let mut conn = connection(&network, "sensor-1");

    conn.connect("broker", 1883, 10).await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Connected);

    // A publish at t+5 resets the idle timer.
    advance(Duration::from_secs(5)).await;
    conn.publish("a/b", "hello", QoS::AtMostOnce).await.unwrap();

    advance(Duration::from_secs(5)).await;
    assert_eq!(conn.check_liveness(Instant::now()).await.unwrap(), Liveness::NotDue);
    assert_eq!(link.count_sent(PINGREQ), 0);

    // t+15 is exactly 10s after the publish.
    advance(Duration::from_secs(5)).await;
    assert_eq!(
        conn.check_liveness(Instant::now()).await.unwrap(),
        Liveness::PingAcknowledged
    );
    assert_eq!(link.count_sent(PINGREQ), 1);
    assert_eq!(link.sent().last().unwrap().as_ref(), &[0xC0, 0x00]);
    assert!(conn.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_missing_pingresp_closes_connection() {
    let network = MockNetwork::new();
    let link = network.add("broker", MockLink::accepting());
    let mut conn = connection(&network, "sensor-2");
    conn.connect("broker", 1883, 10).await.unwrap();

    link.set_answer_pings(false);
    advance(Duration::from_secs(5)).await;
    conn.publish("a/b", "hello", QoS::AtMostOnce).await.unwrap();
    advance(Duration::from_secs(10)).await;
    let err = conn.check_liveness(Instant::now()).await.unwrap_err();

    assert!(matches!(err, MqttError::ConnectionLost { ref client_id, .. } if client_id == "sensor-2"));
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert_eq!(link.count_sent(PINGREQ), 1);
    assert_eq!(link.closes(), 1);

    // Closed is terminal.
    assert!(matches!(
        conn.connect("broker", 1883, 10).await,
        Err(MqttError::InvalidState { operation: "connect", .. })
    ));
    assert!(matches!(
        conn.check_liveness(Instant::now()).await,
        Err(MqttError::NotConnected { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_zero_keep_alive_never_pings() {
    let network = MockNetwork::new();
    let link = network.add("broker", MockLink::accepting());
    let mut conn = connection(&network, "quiet");
    conn.connect("broker", 1883, 0).await.unwrap();

    advance(Duration::from_secs(3600)).await;
    assert_eq!(conn.check_liveness(Instant::now()).await.unwrap(), Liveness::NotDue);
    assert_eq!(link.count_sent(PINGREQ), 0);
}

#[tokio::test]
async fn test_publish_while_disconnected_sends_nothing() {
    let network = MockNetwork::new();
    let link = network.add("broker", MockLink::accepting());
    let mut conn = connection(&network, "idle");

    let err = conn.publish("a/b", "x", QoS::AtMostOnce).await.unwrap_err();
    assert!(matches!(err, MqttError::NotConnected { .. }));
    assert!(err.is_recoverable());
    assert!(link.sent().is_empty());
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_refused_connect_reports_reason_and_allows_retry() {
    let network = MockNetwork::new();
    let link = network.add("broker", MockLink::refusing(5));
    let mut conn = connection(&network, "intruder");

    match conn.connect("broker", 1883, 10).await {
        Err(MqttError::ConnectRefused { code, reason, .. }) => {
            assert_eq!(code, 5);
            assert_eq!(reason, "Connection Refused: not authorized");
        }
        other => panic!("expected refusal, got {:?}", other),
    }
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(link.closes(), 1);

    link.set_connack_code(0);
    conn.connect("broker", 1883, 10).await.unwrap();
    assert!(conn.is_connected());
    assert_eq!(link.opens(), 2);
}

#[tokio::test]
async fn test_unreachable_host_is_a_connect_error() {
    let network = MockNetwork::new();
    let mut conn = connection(&network, "lonely");

    let err = conn.connect("nowhere", 1883, 10).await.unwrap_err();
    assert!(matches!(err, MqttError::ConnectError { ref client_id, .. } if client_id == "lonely"));
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_malformed_connack_is_a_connect_error() {
    let network = MockNetwork::new();
    let link = network.add("broker", MockLink::with_connack_frame(vec![0x20, 0x03, 0x00, 0x00, 0x00]));
    let mut conn = connection(&network, "picky");

    let err = conn.connect("broker", 1883, 10).await.unwrap_err();
    match err {
        MqttError::ConnectError { reason, .. } => assert!(reason.contains("CONNACK must be 4 bytes")),
        other => panic!("expected connect error, got {:?}", other),
    }
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(link.closes(), 1);
}

#[tokio::test]
async fn test_unknown_return_code_is_a_connect_error() {
    let network = MockNetwork::new();
    network.add("broker", MockLink::refusing(9));
    let mut conn = connection(&network, "odd");

    let err = conn.connect("broker", 1883, 10).await.unwrap_err();
    assert!(matches!(err, MqttError::ConnectError { ref reason, .. } if reason.contains("9")));
}

#[tokio::test(start_paused = true)]
async fn test_silent_broker_times_out() {
    let network = MockNetwork::new();
    let link = network.add("broker", MockLink::silent());
    let config = ConnectionConfig {
        connect_timeout: Duration::from_secs(5),
        ..ConnectionConfig::default()
    };
    let mut conn = Connection::with_config("patient", Arc::new(network.clone()), config).unwrap();

    let started = Instant::now();
    let err = conn.connect("broker", 1883, 10).await.unwrap_err();
    assert!(matches!(err, MqttError::ConnectError { .. }));
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(link.closes(), 1);
}

#[tokio::test]
async fn test_connect_twice_is_rejected() {
    let network = MockNetwork::new();
    let link = network.add("broker", MockLink::accepting());
    let mut conn = connection(&network, "eager");
    conn.connect("broker", 1883, 10).await.unwrap();

    let err = conn.connect("broker", 1883, 10).await.unwrap_err();
    assert!(matches!(err, MqttError::InvalidState { .. }));
    assert!(conn.is_connected());
    assert_eq!(link.opens(), 1);
}

#[tokio::test]
async fn test_disconnect_sends_disconnect_and_closes() {
    let network = MockNetwork::new();
    let link = network.add("broker", MockLink::accepting());
    let mut conn = connection(&network, "polite");
    conn.connect("broker", 1883, 10).await.unwrap();

    conn.disconnect().await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert_eq!(link.sent().last().unwrap().as_ref(), &[DISCONNECT, 0x00]);
    assert_eq!(link.closes(), 1);

    assert!(matches!(conn.disconnect().await, Err(MqttError::NotConnected { .. })));
    assert!(matches!(
        conn.publish("a/b", "late", QoS::AtMostOnce).await,
        Err(MqttError::NotConnected { .. })
    ));
}

#[tokio::test]
async fn test_disconnect_ignores_send_failure() {
    let network = MockNetwork::new();
    let link = network.add("broker", MockLink::accepting());
    let mut conn = connection(&network, "abrupt");
    conn.connect("broker", 1883, 10).await.unwrap();

    link.set_fail_sends(true);
    conn.disconnect().await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert_eq!(link.count_sent(DISCONNECT), 0);
    assert_eq!(link.closes(), 1);
}

#[tokio::test]
async fn test_publish_send_failure_loses_connection() {
    let network = MockNetwork::new();
    let link = network.add("broker", MockLink::accepting());
    let mut conn = connection(&network, "fragile");
    conn.connect("broker", 1883, 10).await.unwrap();

    link.set_fail_sends(true);
    let err = conn.publish("a/b", "x", QoS::AtMostOnce).await.unwrap_err();
    assert!(matches!(err, MqttError::ConnectionLost { .. }));
    assert!(!err.is_recoverable());
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert_eq!(link.closes(), 1);
}

#[tokio::test]
async fn test_higher_qos_is_sent_as_qos_zero() {
    let network = MockNetwork::new();
    let link = network.add("broker", MockLink::accepting());
    let mut conn = connection(&network, "modest");
    conn.connect("broker", 1883, 10).await.unwrap();

    conn.publish("a/b", "x", QoS::ExactlyOnce).await.unwrap();
    let frame = link.sent().last().unwrap().clone();
    assert_eq!(frame[0], PUBLISH);
    assert_eq!(frame.as_ref(), &[0x30, 0x06, 0x00, 0x03, b'a', b'/', b'b', b'x']);
}

#[tokio::test]
async fn test_connect_frame_on_the_wire() {
    let network = MockNetwork::new();
    let link = network.add("broker", MockLink::accepting());
    let mut conn = connection(&network, "c1");
    conn.connect("broker", 1883, 10).await.unwrap();

    let expected: &[u8] = &[
        0x10, 0x10, 0x00, 0x06, b'M', b'Q', b'I', b's', b'd', b'p', 0x03, 0x02, 0x00, 0x0A, 0x00,
        0x02, b'c', b'1',
    ];
    assert_eq!(link.sent()[0].as_ref(), expected);
}

#[test]
fn test_overlong_client_id_is_rejected() {
    let network = MockNetwork::new();
    let client_id = "x".repeat(65536);
    assert!(matches!(
        Connection::new(client_id, Arc::new(network)),
        Err(MqttError::StringTooLong { len: 65536, .. })
    ));
}
