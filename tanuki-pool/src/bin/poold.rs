//! The pool daemon.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use tanuki_pool::admission::AdmissionController;
use tanuki_pool::config::Config;
use tanuki_pool::dispatch::{BlockDispatcher, NoopWorkerDirectory};
use tanuki_pool::job::JobManager;
use tanuki_pool::miner_conn::ConnDeps;
use tanuki_pool::node::BitcoindClient;
use tanuki_pool::registry::ConnectionRegistry;
use tanuki_pool::server;
use tanuki_pool::submit::{SubmitExecutor, SubmitPipeline};
use tanuki_pool::template::TemplateFeed;
use tanuki_pool::tracing::{self, prelude::*};

#[tokio::main]
async fn main() -> Result<()> {
    tracing::init_journald_or_stdout();

    let cfg = Arc::new(Config::from_env());
    let payouts = cfg.validate().context("configuration")?;
    let network = cfg.network();

    let node = Arc::new(BitcoindClient::new(
        cfg.node.url.clone(),
        cfg.node.user.clone(),
        cfg.node.password.clone(),
    ));

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    // Template intake. The ZMQ block-notification collaborator delivers
    // into notify_tx; without one, longpolling carries the feed alone.
    let (template_tx, template_rx) = mpsc::channel(4);
    let (_notify_tx, notify_rx) = mpsc::channel::<()>(16);
    let (feed, feed_status) = TemplateFeed::new(
        node.clone(),
        network,
        cfg.feed.poll_interval,
        template_tx,
        notify_rx,
    );

    let registry = ConnectionRegistry::new();
    let jobs = JobManager::new(cfg.clone(), payouts);
    let dispatcher = BlockDispatcher::new(
        node.clone(),
        cfg.dispatch.clone(),
        Arc::new(NoopWorkerDirectory),
    );
    let pipeline = SubmitPipeline::new(cfg.clone(), jobs.clone(), dispatcher.clone());
    let executor = SubmitExecutor::new(&cfg.submit, &tracker, cancel.clone());
    let admission = AdmissionController::new(
        cfg.admission.clone(),
        cfg.server.max_connections,
        registry.clone(),
        feed_status,
    );

    tracker.spawn(feed.run(cancel.clone()));
    tracker.spawn(jobs.clone().run(template_rx, cancel.clone()));
    tracker.spawn(dispatcher.clone().run_replay(cancel.clone()));
    tracker.spawn(server::enforce_freshness(
        admission.clone(),
        registry.clone(),
        cfg.admission.enforce_interval,
        cancel.clone(),
    ));

    let deps = ConnDeps {
        cfg: cfg.clone(),
        jobs,
        pipeline,
        executor,
        registry: registry.clone(),
        cancel: cancel.clone(),
    };
    {
        let cfg = cfg.clone();
        let tracker_for_conns = tracker.clone();
        let admission = admission.clone();
        tracker.spawn(async move {
            if let Err(e) = server::run_acceptor(cfg, deps, admission, tracker_for_conns).await {
                error!(error = %e, "Acceptor failed");
            }
        });
    }
    tracker.close();
    info!("Started.");

    let mut sigint = unix::signal(SignalKind::interrupt()).context("signal handler")?;
    let mut sigterm = unix::signal(SignalKind::terminate()).context("signal handler")?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }

    trace!("Shutting down.");
    // Listeners close first, then live miners get the courtesy message,
    // then we drain with a deadline.
    cancel.cancel();
    server::notify_shutdown(&registry).await;

    if tokio::time::timeout(cfg.server.shutdown_drain, tracker.wait())
        .await
        .is_err()
    {
        warn!("Drain deadline exceeded; abandoning remaining tasks.");
    }
    info!("Exiting.");
    Ok(())
}
