//! # Broker Module
//!
//! Wires the registry, router and stats collector together and hands each
//! accepted transport its own session task.
//!
//! - `server`: TCP accept loop, signal handling and the stop sequence.

pub mod server;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tracing::{debug, info_span, Instrument};

use crate::config::Config;
use crate::core::auth::Authenticator;
use crate::core::error::SessionError;
use crate::core::session::{run_session, SessionContext, SessionId, SessionRegistry, SessionSettings};
use crate::core::topics::Router;
use crate::metrics::Stats;

pub use self::server::run;

pub struct Broker {
    registry: Arc<SessionRegistry>,
    router: Arc<Router>,
    stats: Arc<Stats>,
    authenticator: Arc<dyn Authenticator>,
    settings: SessionSettings,
    stats_interval: Duration,
    next_session_id: AtomicU64,
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("sessions", &self.registry.len())
            .field("shards", &self.router.shard_count())
            .field("settings", &self.settings)
            .field("stats_interval", &self.stats_interval)
            .finish_non_exhaustive()
    }
}

impl Broker {
    /// Builds the broker components. Spawns the router's shard workers, so
    /// this must run inside a Tokio runtime.
    pub fn new(config: &Config, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new()),
            router: Arc::new(Router::new(config.resolved_shard_count())),
            stats: Arc::new(Stats::new()),
            authenticator,
            settings: SessionSettings::from(config),
            stats_interval: config.stats_interval(),
            next_session_id: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn stats_interval(&self) -> Duration {
        self.stats_interval
    }

    fn context(&self) -> SessionContext {
        SessionContext {
            registry: Arc::clone(&self.registry),
            router: Arc::clone(&self.router),
            stats: Arc::clone(&self.stats),
            authenticator: Arc::clone(&self.authenticator),
            settings: self.settings.clone(),
        }
    }

    /// Spawns a session for an already-connected transport.
    pub fn serve_connection<S>(
        &self,
        stream: S,
        peer: impl Into<String>,
    ) -> JoinHandle<Result<(), SessionError>>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let id = SessionId(self.next_session_id.fetch_add(1, Ordering::Relaxed));
        let peer = peer.into();
        debug!(session_id = %id, %peer, "spawning session");

        let span = info_span!("session", session_id = %id, peer = %peer);
        tokio::spawn(run_session(stream, peer, id, self.context()).instrument(span))
    }

    /// Drains the router. Sessions already running keep going; their
    /// publishes are dropped from here on.
    pub async fn shutdown(&self) {
        self.router.shutdown().await;
    }
}
