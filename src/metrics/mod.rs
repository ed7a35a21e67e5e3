//! Broker-level counters, reported as retained `$SYS` messages.
//!
//! Counters are plain relaxed atomics bumped from the hot path. A reporter
//! task periodically turns them into publishes routed through the
//! [`Router`], so any client subscribed to `$SYS/#` can observe the broker.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::debug;

use crate::core::packet::{Publish, QoS};
use crate::core::topics::Router;

/// Reserved telemetry topics.
pub mod topics {
    pub const CLIENTS_ACTIVE: &str = "$SYS/broker/clients/active";
    pub const CLIENTS_MAXIMUM: &str = "$SYS/broker/clients/maximum";
    pub const MESSAGES_RECEIVED: &str = "$SYS/broker/messages/received";
    pub const MESSAGES_SENT: &str = "$SYS/broker/messages/sent";
    pub const MESSAGES_PER_SEC: &str = "$SYS/broker/messages/per-sec";
}

#[derive(Debug, Default)]
pub struct Stats {
    received: AtomicU64,
    sent: AtomicU64,
    clients: AtomicI64,
    clients_max: AtomicI64,
    /// received + sent at the previous report
    last_messages: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub sent: u64,
    pub clients: i64,
    pub clients_max: i64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn message_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn message_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_connected(&self) {
        let now = self.clients.fetch_add(1, Ordering::Relaxed) + 1;
        self.clients_max.fetch_max(now, Ordering::Relaxed);
    }

    pub fn client_disconnected(&self) {
        self.clients.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            clients: self.clients.load(Ordering::Relaxed),
            clients_max: self.clients_max.load(Ordering::Relaxed),
        }
    }

    /// Publishes every counter as a retained QoS 1 message on its `$SYS`
    /// topic. These publishes do not count as received messages.
    ///
    /// The per-second rate is the received+sent delta since the previous
    /// report divided by `interval` (at least one second).
    pub fn report(&self, router: &Router, interval: Duration) {
        let snapshot = self.snapshot();
        let clients_max = self
            .clients_max
            .fetch_max(snapshot.clients, Ordering::Relaxed)
            .max(snapshot.clients);

        let total = snapshot.received + snapshot.sent;
        let previous = self.last_messages.swap(total, Ordering::Relaxed);
        let per_sec = total.saturating_sub(previous) / interval.as_secs().max(1);

        let values: [(&str, String); 5] = [
            (topics::CLIENTS_ACTIVE, snapshot.clients.to_string()),
            (topics::CLIENTS_MAXIMUM, clients_max.to_string()),
            (topics::MESSAGES_RECEIVED, snapshot.received.to_string()),
            (topics::MESSAGES_SENT, snapshot.sent.to_string()),
            (topics::MESSAGES_PER_SEC, per_sec.to_string()),
        ];

        for (topic, value) in values {
            let mut publish = Publish::new(topic, value, QoS::AtLeastOnce);
            publish.retain = true;
            router.submit(None, publish);
        }

        debug!(
            clients = snapshot.clients,
            clients_max,
            received = snapshot.received,
            sent = snapshot.sent,
            per_sec,
            "stats reported"
        );
    }
}

/// Spawns the periodic reporter. It stops when `shutdown` flips to true or
/// its sender is dropped.
pub fn spawn_reporter(
    stats: Arc<Stats>,
    router: Arc<Router>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => stats.report(&router, interval),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("stats reporter stopped");
                        return;
                    }
                }
            }
        }
    })
}
