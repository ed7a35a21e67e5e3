#[path = "common.rs"]
mod common;

use std::collections::HashMap;
use std::time::Duration;

use blipmqtt::core::packet::QoS;
use blipmqtt::metrics::{spawn_reporter, topics};
use common::{attach, broker, test_config};
use tokio::sync::watch;

#[tokio::test]
async fn sys_topics_are_retained_and_exclude_synthetic_traffic() {
    let broker = broker(&test_config());
    let mut client = attach(&broker);
    client.connect("observer").await;
    client.ping().await;

    let received_before = broker.stats().snapshot().received;
    broker
        .stats()
        .report(broker.router(), Duration::from_secs(10));
    assert_eq!(broker.stats().snapshot().received, received_before);

    client.subscribe(&[("$SYS/#", QoS::AtLeastOnce)]).await;
    let mut values = HashMap::new();
    for _ in 0..5 {
        let publish = client.recv_publish().await;
        assert!(publish.retain);
        assert_eq!(publish.qos, QoS::AtLeastOnce);
        values.insert(
            publish.topic.clone(),
            String::from_utf8(publish.payload.to_vec()).unwrap(),
        );
    }
    client.recv_none().await;

    assert_eq!(values[topics::CLIENTS_ACTIVE], "1");
    assert_eq!(values[topics::CLIENTS_MAXIMUM], "1");
    // CONNECT and PINGREQ
    assert_eq!(values[topics::MESSAGES_RECEIVED], "2");
    // CONNACK and PINGRESP
    assert_eq!(values[topics::MESSAGES_SENT], "2");
    assert_eq!(values[topics::MESSAGES_PER_SEC], "0");
}

#[tokio::test]
async fn reporter_publishes_on_interval_until_shutdown() {
    let broker = broker(&test_config());
    let mut client = attach(&broker);
    client.connect("observer").await;
    client
        .subscribe(&[(topics::CLIENTS_ACTIVE, QoS::AtMostOnce)])
        .await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reporter = spawn_reporter(
        broker.stats().clone(),
        broker.router().clone(),
        Duration::from_millis(100),
        shutdown_rx,
    );

    let first = client.recv_publish().await;
    assert_eq!(first.topic, topics::CLIENTS_ACTIVE);
    assert_eq!(first.payload.as_ref(), b"1");
    // live fan-out copies carry retain=false
    assert!(!first.retain);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), reporter)
        .await
        .expect("reporter did not stop")
        .unwrap();
}
