#[path = "common.rs"]
mod common;

use std::sync::Arc;
use std::time::Duration;

use blipmqtt::core::packet::{Publish, QoS};
use blipmqtt::core::session::{Outbox, SessionHandle, SessionId};
use blipmqtt::core::topics::Router;
use tokio::time::{sleep, timeout};

#[tokio::test]
async fn shutdown_waits_for_queued_fan_out() {
    common::init_logging();
    let router = Router::new(4);
    let (outbox, rx) = Outbox::channel(1_000);
    let session = SessionHandle::new(SessionId(1), "sink", outbox);
    router.add("load/#", QoS::AtMostOnce, &session);

    for i in 0..500 {
        router.submit(None, Publish::new(format!("load/{i}"), "x", QoS::AtMostOnce));
    }
    router.shutdown().await;

    assert_eq!(rx.len(), 500);
    assert_eq!(router.delivered(), 500);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_under_concurrent_publishers_does_not_deadlock() {
    common::init_logging();
    let router = Arc::new(Router::new(4));
    let (outbox, _rx) = Outbox::channel(64);
    let session = SessionHandle::new(SessionId(1), "sink", outbox);
    router.add("#", QoS::AtMostOnce, &session);

    let publishers: Vec<_> = (0..8)
        .map(|p| {
            let router = Arc::clone(&router);
            tokio::spawn(async move {
                for i in 0..2_000 {
                    router.submit(
                        None,
                        Publish::new(format!("p{p}/{i}"), "x", QoS::AtMostOnce),
                    );
                    if i % 100 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        })
        .collect();

    sleep(Duration::from_millis(5)).await;
    timeout(Duration::from_secs(5), router.shutdown())
        .await
        .expect("router shutdown deadlocked");

    for publisher in publishers {
        publisher.await.unwrap();
    }

    // nothing is mid-flight once shutdown has returned
    let settled = router.delivered() + router.dropped();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(router.delivered() + router.dropped(), settled);
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let router = Router::new(2);
    router.shutdown().await;
    timeout(Duration::from_secs(1), router.shutdown())
        .await
        .expect("second shutdown hung");
}
