//! The accept loop and pool-wide lifecycle tasks.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::admission::AdmissionController;
use crate::config::Config;
use crate::miner_conn::{ConnDeps, serve_connection};
use crate::registry::{ConnControl, ConnectionRegistry};
use crate::tracing::prelude::*;

/// Accept connections until cancelled, applying the admission gates to
/// each socket before it gets a task.
pub async fn run_acceptor(
    cfg: Arc<Config>,
    deps: ConnDeps,
    admission: Arc<AdmissionController>,
    tracker: TaskTracker,
) -> Result<()> {
    let listener = TcpListener::bind(&cfg.server.listen)
        .await
        .with_context(|| format!("binding {}", cfg.server.listen))?;
    info!(listen = %cfg.server.listen, "Stratum listener up");

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    match admission.check(peer.ip()) {
                        Ok(()) => {
                            let _ = socket.set_nodelay(true);
                            let deps = deps.clone();
                            tracker.spawn(async move {
                                if let Err(e) = serve_connection(socket, peer, deps).await {
                                    debug!(%peer, error = %e, "Connection ended with error");
                                }
                            });
                        }
                        Err(refusal) => {
                            debug!(%peer, ?refusal, "Accept refused");
                            drop(socket);
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            },
            _ = deps.cancel.cancelled() => break,
        }
    }

    // Dropping the listener refuses new connections; live miners are
    // dealt with by the shutdown sequence.
    trace!("Acceptor stopped.");
    Ok(())
}

/// Periodically shed connected miners while the template feed is stale.
/// Handing out unmineable work is worse than disconnecting; miners
/// failover to their backup pool and come back.
pub async fn enforce_freshness(
    admission: Arc<AdmissionController>,
    registry: Arc<ConnectionRegistry>,
    interval: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                if admission.feed_healthy(Instant::now()) {
                    continue;
                }
                let controls = registry.controls();
                if controls.is_empty() {
                    continue;
                }
                warn!(
                    connections = controls.len(),
                    "Template feed stale; disconnecting miners"
                );
                for (id, control) in controls {
                    let _ = control
                        .send(ConnControl::ShowMessage(
                            "Pool's node connection is unhealthy; please reconnect later.".into(),
                        ))
                        .await;
                    if control.send(ConnControl::Close).await.is_err() {
                        trace!(conn = %id, "Connection already gone");
                    }
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
    trace!("Freshness enforcement stopped.");
}

/// The shutdown courtesy pass: tell every miner to reconnect elsewhere,
/// then close. Runs after the acceptor has stopped taking connections.
pub async fn notify_shutdown(registry: &ConnectionRegistry) {
    for (id, control) in registry.controls() {
        let _ = control
            .send(ConnControl::ShowMessage(
                "Pool restarting; please reconnect.".into(),
            ))
            .await;
        if control.send(ConnControl::Close).await.is_err() {
            trace!(conn = %id, "Connection already gone");
        }
    }
}
