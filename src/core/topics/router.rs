use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, info, trace};

use crate::core::packet::{Publish, QoS};
use crate::core::session::{SessionHandle, SessionId};
use crate::core::topics::filter;

/// Last retained publish on one literal topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedMessage {
    pub payload: Bytes,
    pub qos: QoS,
}

#[derive(Debug)]
struct Subscriber {
    qos: QoS,
    session: SessionHandle,
    /// First publish sequence number this subscription receives live.
    /// Anything older was already covered by the retained replay.
    since: u64,
}

#[derive(Debug, Default)]
struct ShardState {
    /// filter -> subscribing sessions
    subscriptions: HashMap<String, HashMap<SessionId, Subscriber>>,
    /// literal topic -> retained message
    retained: HashMap<String, RetainedMessage>,
}

#[derive(Debug)]
enum ShardCommand {
    Publish { seq: u64, publish: Arc<Publish> },
    Stop(oneshot::Sender<()>),
}

#[derive(Debug)]
struct Shard {
    state: Arc<Mutex<ShardState>>,
    commands: flume::Sender<ShardCommand>,
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Sharded subscription table, retained store and fan-out engine.
///
/// Every filter and retained topic lives in exactly one shard, chosen by a
/// hash of the string. A wildcard filter in one shard can match a topic that
/// hashes elsewhere, so fan-out runs in every shard: `submit` hands the
/// message to each shard's worker task, which matches it against that
/// shard's filters under the shard's own lock.
///
/// Each publish is stamped with a sequence number after its retained update.
/// A subscription only receives live copies of publishes numbered at or after
/// the point it was added, so a publish whose `submit` returned before the
/// subscribe reaches the new subscriber through the retained replay alone.
#[derive(Debug)]
pub struct Router {
    shards: Vec<Shard>,
    counters: Arc<Counters>,
    sequence: AtomicU64,
    closed: AtomicBool,
}

impl Router {
    /// Creates the router and spawns one worker per shard.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        let counters = Arc::new(Counters::default());

        let shards = (0..shard_count)
            .map(|index| {
                let state = Arc::new(Mutex::new(ShardState::default()));
                let (tx, rx) = flume::unbounded();
                tokio::spawn(run_shard(
                    index,
                    Arc::clone(&state),
                    rx,
                    Arc::clone(&counters),
                ));
                Shard {
                    state,
                    commands: tx,
                }
            })
            .collect();

        debug!(shards = shard_count, "router started");
        Self {
            shards,
            counters,
            sequence: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_for(&self, key: &str) -> &Shard {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[index]
    }

    /// Subscribes `session` to `filter` with granted `qos`.
    ///
    /// Re-adding the same pair replaces the granted QoS; it never creates a
    /// second delivery path.
    pub fn add(&self, filter: &str, qos: QoS, session: &SessionHandle) {
        let since = self.sequence.load(Ordering::SeqCst);
        let mut state = lock(&self.shard_for(filter).state);
        state
            .subscriptions
            .entry(filter.to_owned())
            .or_default()
            .entry(session.id())
            .and_modify(|subscriber| subscriber.qos = qos)
            .or_insert_with(|| Subscriber {
                qos,
                session: session.clone(),
                since,
            });
    }

    /// Removes one subscription. No-op if it does not exist.
    pub fn unsub(&self, filter: &str, session_id: SessionId) {
        let mut state = lock(&self.shard_for(filter).state);
        if let Some(subscribers) = state.subscriptions.get_mut(filter) {
            subscribers.remove(&session_id);
            if subscribers.is_empty() {
                state.subscriptions.remove(filter);
            }
        }
    }

    /// Removes every subscription held by `session_id`, shard by shard.
    pub fn unsub_all(&self, session_id: SessionId) {
        for shard in &self.shards {
            let mut state = lock(&shard.state);
            state.subscriptions.retain(|_, subscribers| {
                subscribers.remove(&session_id);
                !subscribers.is_empty()
            });
        }
    }

    /// Routes a publish to every matching subscriber.
    ///
    /// Retained state is updated before this returns; fan-out is carried out
    /// by the shard workers with non-blocking enqueues. `source` is `None`
    /// for broker-originated messages.
    pub fn submit(&self, source: Option<SessionId>, publish: Publish) {
        if self.closed.load(Ordering::Acquire) {
            debug!(topic = %publish.topic, "router shut down; dropping publish");
            return;
        }

        if publish.retain {
            self.store_retained(&publish);
        }
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);

        trace!(?source, seq, topic = %publish.topic, qos = ?publish.qos, "routing publish");
        let publish = Arc::new(publish);
        for shard in &self.shards {
            if shard
                .commands
                .send(ShardCommand::Publish {
                    seq,
                    publish: Arc::clone(&publish),
                })
                .is_err()
            {
                debug!(topic = %publish.topic, "shard worker gone; dropping publish");
                return;
            }
        }
    }

    fn store_retained(&self, publish: &Publish) {
        let mut state = lock(&self.shard_for(&publish.topic).state);
        if publish.payload.is_empty() {
            if state.retained.remove(&publish.topic).is_some() {
                debug!(topic = %publish.topic, "retained message cleared");
            }
        } else {
            state.retained.insert(
                publish.topic.clone(),
                RetainedMessage {
                    payload: publish.payload.clone(),
                    qos: publish.qos,
                },
            );
        }
    }

    /// Replays retained messages matching `filter` to `session` only, each
    /// with its stored QoS and the retain flag set.
    pub fn send_retain(&self, filter: &str, session: &SessionHandle) {
        for shard in &self.shards {
            let state = lock(&shard.state);
            for (topic, retained) in &state.retained {
                if filter::matches(filter, topic) {
                    let _ = session.deliver(topic, &retained.payload, retained.qos, true);
                }
            }
        }
    }

    pub fn retained(&self, topic: &str) -> Option<RetainedMessage> {
        lock(&self.shard_for(topic).state)
            .retained
            .get(topic)
            .cloned()
    }

    pub fn retained_count(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| lock(&shard.state).retained.len())
            .sum()
    }

    /// Number of (filter, session) pairs across all shards.
    pub fn subscription_count(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                lock(&shard.state)
                    .subscriptions
                    .values()
                    .map(HashMap::len)
                    .sum::<usize>()
            })
            .sum()
    }

    /// Per-recipient copies enqueued so far.
    pub fn delivered(&self) -> u64 {
        self.counters.delivered.load(Ordering::Relaxed)
    }

    /// Per-recipient copies dropped because a queue was full or closed.
    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    /// Stops every shard worker and waits until each has drained the
    /// publishes queued ahead of the stop request.
    ///
    /// Publishes submitted after this starts are dropped.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let acks: Vec<_> = self
            .shards
            .iter()
            .filter_map(|shard| {
                let (tx, rx) = oneshot::channel();
                shard.commands.send(ShardCommand::Stop(tx)).ok().map(|_| rx)
            })
            .collect();

        futures::future::join_all(acks).await;
        info!(
            delivered = self.delivered(),
            dropped = self.dropped(),
            "router drained"
        );
    }
}

fn lock(state: &Mutex<ShardState>) -> MutexGuard<'_, ShardState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn run_shard(
    index: usize,
    state: Arc<Mutex<ShardState>>,
    commands: flume::Receiver<ShardCommand>,
    counters: Arc<Counters>,
) {
    while let Ok(command) = commands.recv_async().await {
        match command {
            ShardCommand::Publish { seq, publish } => fan_out(&state, seq, &publish, &counters),
            ShardCommand::Stop(ack) => {
                trace!(shard = index, "shard worker stopping");
                let _ = ack.send(());
                return;
            }
        }
    }
}

fn fan_out(state: &Mutex<ShardState>, seq: u64, publish: &Publish, counters: &Counters) {
    let state = lock(state);
    for (filter, subscribers) in &state.subscriptions {
        if !filter::matches(filter, &publish.topic) {
            continue;
        }
        for subscriber in subscribers.values().filter(|s| s.since <= seq) {
            let qos = subscriber.qos.min(publish.qos);
            match subscriber
                .session
                .deliver(&publish.topic, &publish.payload, qos, false)
            {
                Ok(()) => counters.delivered.fetch_add(1, Ordering::Relaxed),
                Err(_) => counters.dropped.fetch_add(1, Ordering::Relaxed),
            };
        }
    }
}
