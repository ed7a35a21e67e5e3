#[path = "common.rs"]
mod common;

use std::collections::HashSet;

use blipmqtt::core::packet::QoS;
use bytes::Bytes;
use common::{attach, broker, test_config};

#[tokio::test]
async fn retained_message_replays_once_before_live_traffic() {
    let broker = broker(&test_config());
    let mut publisher = attach(&broker);
    publisher.connect("pub").await;
    publisher.publish("t/1", "P1", QoS::AtLeastOnce, true).await;

    let mut subscriber = attach(&broker);
    subscriber.connect("sub").await;
    subscriber.subscribe(&[("t/+", QoS::AtLeastOnce)]).await;

    let replay = subscriber.recv_publish().await;
    assert_eq!(replay.topic, "t/1");
    assert_eq!(replay.payload, Bytes::from_static(b"P1"));
    assert!(replay.retain);
    assert_eq!(replay.qos, QoS::AtLeastOnce);
    subscriber.recv_none().await;

    publisher.publish("t/1", "P2", QoS::AtMostOnce, false).await;
    let live = subscriber.recv_publish().await;
    assert_eq!(live.payload, Bytes::from_static(b"P2"));
    assert!(!live.retain);
    subscriber.recv_none().await;

    // a non-retained publish leaves the stored message alone
    assert_eq!(
        broker.router().retained("t/1").unwrap().payload,
        Bytes::from_static(b"P1")
    );
}

#[tokio::test]
async fn newer_retained_message_replaces_older() {
    let broker = broker(&test_config());
    let mut publisher = attach(&broker);
    publisher.connect("pub").await;
    publisher.publish("status", "old", QoS::AtLeastOnce, true).await;
    publisher.publish("status", "new", QoS::AtLeastOnce, true).await;

    let mut subscriber = attach(&broker);
    subscriber.connect("sub").await;
    subscriber.subscribe(&[("status", QoS::AtMostOnce)]).await;

    assert_eq!(
        subscriber.recv_publish().await.payload,
        Bytes::from_static(b"new")
    );
    subscriber.recv_none().await;
}

#[tokio::test]
async fn empty_retained_payload_deletes_entry() {
    let broker = broker(&test_config());
    let mut publisher = attach(&broker);
    publisher.connect("pub").await;
    publisher.publish("t/1", "P1", QoS::AtLeastOnce, true).await;
    publisher.publish("t/1", "", QoS::AtLeastOnce, true).await;
    assert_eq!(broker.router().retained_count(), 0);

    let mut subscriber = attach(&broker);
    subscriber.connect("sub").await;
    subscriber.subscribe(&[("t/1", QoS::AtLeastOnce)]).await;
    subscriber.recv_none().await;
}

#[tokio::test]
async fn replay_covers_retained_topics_from_every_shard() {
    let mut config = test_config();
    config.router.shard_count = 8;
    let broker = broker(&config);

    let mut publisher = attach(&broker);
    publisher.connect("pub").await;
    let topics = ["s/a", "s/b", "s/c", "s/d", "s/e", "s/f", "s/g", "s/h", "s/i"];
    for topic in topics {
        publisher.publish(topic, "r", QoS::AtMostOnce, true).await;
    }
    publisher.ping().await;

    let mut subscriber = attach(&broker);
    subscriber.connect("sub").await;
    subscriber.subscribe(&[("#", QoS::AtMostOnce)]).await;

    let mut seen = Vec::new();
    for _ in 0..topics.len() {
        let publish = subscriber.recv_publish().await;
        assert!(publish.retain);
        seen.push(publish.topic);
    }
    seen.sort();
    assert_eq!(seen, topics);
    subscriber.recv_none().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn subscribe_after_publish_burst_gets_only_retained_copies() {
    const TOPICS: usize = 200;
    let mut config = test_config();
    config.session.send_queue_length = 1_024;
    let broker = broker(&config);

    let mut subscriber = attach(&broker);
    subscriber.connect("late").await;
    let mut publisher = attach(&broker);
    publisher.connect("pub").await;
    for i in 0..TOPICS {
        publisher.publish(&format!("burst/{i}"), "r", QoS::AtMostOnce, true).await;
    }
    // every submit has returned; shard workers may still be fanning out
    publisher.ping().await;

    subscriber.subscribe(&[("burst/#", QoS::AtMostOnce)]).await;
    let mut seen = HashSet::new();
    for _ in 0..TOPICS {
        let publish = subscriber.recv_publish().await;
        assert!(publish.retain, "live copy of {} reached a later subscriber", publish.topic);
        assert!(seen.insert(publish.topic));
    }
    subscriber.recv_none().await;
}
