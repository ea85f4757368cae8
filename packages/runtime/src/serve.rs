//! Service Wiring
//!
//! Connects the store, builds the identity and engine services, spawns the
//! outbox worker, and serves the HTTP edge until a shutdown signal. On
//! shutdown the listener drains first, then the worker finishes its
//! current entry and exits.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{watch, Notify};

use payrail_edge::AppState;
use payrail_identity::{Hasher, Identity};
use payrail_ledger::{PgStore, TransferEngine};
use payrail_outbox::{HttpPushSink, LogSink, OutboxWorker, PushSink};

use crate::config::Config;

/// Run the service until shutdown.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let store = Arc::new(
        PgStore::connect(&config.database_url)
            .await
            .context("connecting to the store")?,
    );
    store
        .init_schema()
        .await
        .context("bootstrapping the schema")?;

    let sink: Arc<dyn PushSink> = match &config.push_sink_url {
        Some(url) => {
            let mut sink = HttpPushSink::new(url.clone());
            if let Some(secret) = &config.push_sink_secret {
                sink = sink.with_secret(secret.clone());
            }
            Arc::new(sink)
        }
        None => {
            tracing::warn!("no push sink configured, events will only be logged");
            Arc::new(LogSink)
        }
    };

    let wake = Arc::new(Notify::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = OutboxWorker::new(store.clone(), sink, shutdown_rx)
        .with_poll_interval(config.outbox_poll_interval)
        .with_wake(wake.clone());
    let worker_handle = tokio::spawn(worker.run());

    let identity = Identity::new(store.clone(), Hasher::new(config.password_hash_cost));
    let engine = TransferEngine::new(store.clone()).with_outbox_wake(wake.clone());
    let app = payrail_edge::router(AppState {
        store,
        identity,
        engine,
    });

    let addr = SocketAddr::new(config.bind_address, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "payrail listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    // In-flight requests are drained; let the worker finish its entry.
    shutdown_tx.send(true).ok();
    wake.notify_one();
    worker_handle.await.context("joining the outbox worker")?;

    tracing::info!("payrail stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
    tracing::info!("shutdown signal received");
}
