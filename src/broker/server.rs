use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::config::Config;
use crate::core::auth::AllowAll;
use crate::metrics;
use crate::util::backoff::{is_transient_accept_error, Backoff};

impl Broker {
    /// Accepts connections on `listener` until `shutdown` changes or its
    /// sender is dropped, then drains the router and stops the stats
    /// reporter.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!("blipmqtt listening on {}", local_addr);

        let reporter = metrics::spawn_reporter(
            Arc::clone(self.stats()),
            Arc::clone(self.router()),
            self.stats_interval(),
            shutdown.clone(),
        );

        let mut backoff = Backoff::default();
        let result = loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            backoff.reset();
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!(error = %e, %addr, "failed to set TCP_NODELAY");
                            }
                            self.serve_connection(stream, addr.to_string());
                        }
                        Err(e) if is_transient_accept_error(&e) => {
                            warn!(error = %e, "accept failed; backing off");
                            backoff.snooze().await;
                        }
                        Err(e) => {
                            error!(error = %e, "accept failed; stopping listener");
                            break Err(anyhow::Error::new(e).context("accept failed"));
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("shutdown signal received; stopping accept loop");
                    break Ok(());
                }
            }
        };

        drop(listener);
        self.shutdown().await;
        reporter.abort();
        let _ = reporter.await;
        info!("broker stopped");
        result
    }
}

/// Binds the configured address and serves until Ctrl-C or SIGTERM.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind_addr))?;

    let broker = Arc::new(Broker::new(&config, Arc::new(AllowAll)));
    info!(
        shards = broker.router().shard_count(),
        send_queue_length = config.session.send_queue_length,
        "broker starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut server = tokio::spawn(Arc::clone(&broker).serve(listener, shutdown_rx));

    tokio::select! {
        joined = &mut server => return joined.context("server task panicked")?,
        _ = shutdown_signal() => {}
    }

    let _ = shutdown_tx.send(true);
    server.await.context("server task panicked")?
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
