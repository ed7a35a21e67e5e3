//! Client sessions.
//!
//! - `job`: outbound jobs, receipts and the bounded [`Outbox`] queue.
//! - `registry`: client id -> live session map with takeover semantics.
//! - `connection`: the per-connection reader/writer protocol state machine.
//!
//! A [`SessionHandle`] is the cheap, cloneable view of a session that the
//! router and registry hold on to; the connection task owns everything else.

pub mod connection;
pub mod job;
pub mod registry;

use std::fmt;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::config::Config;
use crate::core::auth::Authenticator;
use crate::core::error::EnqueueError;
use crate::core::packet::{Packet, Publish, QoS};
use crate::core::topics::Router;
use crate::metrics::Stats;

pub use connection::run_session;
pub use job::{Job, Outbox, Receipt};
pub use registry::SessionRegistry;

/// Unique per accepted transport, never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for SessionId {
    fn from(v: u64) -> Self {
        SessionId(v)
    }
}

#[derive(Debug)]
struct HandleInner {
    id: SessionId,
    client_id: String,
    outbox: Outbox,
    next_packet_id: AtomicU16,
}

/// Shared reference to a connected session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    inner: Arc<HandleInner>,
}

impl SessionHandle {
    pub fn new(id: SessionId, client_id: impl Into<String>, outbox: Outbox) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                client_id: client_id.into(),
                outbox,
                next_packet_id: AtomicU16::new(1),
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    #[inline]
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    #[inline]
    pub fn outbox(&self) -> &Outbox {
        &self.inner.outbox
    }

    /// Next outbound packet id; wraps around and never yields 0.
    fn next_packet_id(&self) -> u16 {
        loop {
            let id = self.inner.next_packet_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Enqueues a per-recipient copy of a message without blocking.
    ///
    /// A full queue drops the message; the connection stays up.
    pub fn deliver(
        &self,
        topic: &str,
        payload: &Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), EnqueueError> {
        let packet_id = match qos {
            QoS::AtMostOnce => None,
            QoS::AtLeastOnce | QoS::ExactlyOnce => Some(self.next_packet_id()),
        };
        let publish = Publish {
            dup: false,
            qos,
            retain,
            topic: topic.to_owned(),
            packet_id,
            payload: payload.clone(),
        };

        let result = self.inner.outbox.submit(Packet::Publish(publish));
        match result {
            Err(EnqueueError::Full) => warn!(
                client_id = %self.inner.client_id,
                session_id = %self.inner.id,
                topic,
                "outbound queue full; dropping message"
            ),
            Err(EnqueueError::Closed) => debug!(
                client_id = %self.inner.client_id,
                session_id = %self.inner.id,
                topic,
                "session closed; dropping message"
            ),
            Ok(()) => {}
        }
        result
    }
}

/// Per-session tunables, resolved from [`Config`].
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub send_queue_length: usize,
    pub takeover_timeout: Duration,
    pub max_packet_size: usize,
    pub dump: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            send_queue_length: config.session.send_queue_length,
            takeover_timeout: config.takeover_timeout(),
            max_packet_size: config.server.max_packet_size,
            dump: config.session.dump,
        }
    }
}

/// Broker-wide collaborators every session talks to.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: Arc<SessionRegistry>,
    pub router: Arc<Router>,
    pub stats: Arc<Stats>,
    pub authenticator: Arc<dyn Authenticator>,
    pub settings: SessionSettings,
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("sessions", &self.registry.len())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
