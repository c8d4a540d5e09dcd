//! hookline webhook receiver.
//!
//! Main entry point. Wires the store, delivery engine and HTTP server
//! together and coordinates startup and shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use hookline_api::{create_router, shutdown_signal, start_server, AppState, Config};
use hookline_core::{Clock, EventStore, RealClock, SqliteStore};
use hookline_delivery::{CommandHandler, DeliveryEngine, EventHandler, LogHandler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log);

    info!(
        database_url = %config.database_url,
        workers = config.worker_count,
        max_attempts = config.max_attempts,
        signing_scheme = ?config.signing_scheme,
        "Starting hookline"
    );

    let store = Arc::new(connect_store(&config).await?);
    info!("Event store ready");

    let handler = build_handler(&config)?;
    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());

    let mut engine = DeliveryEngine::new(
        store.clone() as Arc<dyn EventStore>,
        handler,
        config.to_delivery_config(),
        clock.clone(),
    )
    .context("failed to create delivery engine")?;

    let report = engine.start().await.context("failed to start delivery engine")?;
    info!(
        reclaimed = report.reclaimed.len(),
        rescheduled = report.rescheduled,
        buried = report.buried,
        "Delivery engine started"
    );

    let mut state =
        AppState::new(store.clone(), config.signature_verifier(), engine.queue(), clock);
    if let Some(token) = config.admin_token.as_deref() {
        state = state.with_admin_token(token);
    } else {
        info!("No admin_token configured, operator routes disabled");
    }
    let app = create_router(state, config.request_timeout());

    let addr = config.parse_server_addr()?;
    let shutdown = CancellationToken::new();
    let mut server = tokio::spawn(start_server(app, addr, shutdown.clone()));
    info!(%addr, "hookline is ready to receive webhooks");

    tokio::select! {
        () = shutdown_signal() => {},
        result = &mut server => {
            // The server only returns on its own when it fails.
            match result {
                Ok(Ok(())) => warn!("HTTP server exited unexpectedly"),
                Ok(Err(e)) => error!(error = %e, "HTTP server failed"),
                Err(e) => error!(error = %e, "HTTP server task panicked"),
            }
            shutdown.cancel();
            engine.shutdown().await.ok();
            store.close().await;
            anyhow::bail!("HTTP server stopped");
        },
    }

    // Stop intake first so no new work arrives while workers drain.
    shutdown.cancel();
    match server.await {
        Ok(Ok(())) => info!("HTTP server stopped"),
        Ok(Err(e)) => error!(error = %e, "HTTP server failed during shutdown"),
        Err(e) => error!(error = %e, "HTTP server task panicked"),
    }

    let stats = engine.stats().await;
    info!(
        processed = stats.events_processed,
        delivered = stats.delivered,
        retried = stats.retried,
        dead_lettered = stats.dead_lettered,
        "Stopping delivery engine"
    );
    if let Err(e) = engine.shutdown().await {
        warn!(error = %e, "Delivery engine did not shut down cleanly");
    }

    store.close().await;
    info!("hookline shutdown complete");
    Ok(())
}

/// Initializes tracing; `RUST_LOG` wins over the configured filter.
fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer().with_target(true).with_thread_ids(true).with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Opens the store, retrying while the database file is busy.
async fn connect_store(config: &Config) -> Result<SqliteStore> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    let mut retries = 0;
    loop {
        match SqliteStore::connect(&config.database_url, config.database_max_connections).await {
            Ok(store) => return Ok(store),
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "Database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to open event store after retries");
            },
        }
    }
}

fn build_handler(config: &Config) -> Result<Arc<dyn EventHandler>> {
    match config.handler_command.as_deref() {
        Some(command) => {
            let handler = CommandHandler::from_command_line(command)
                .context("invalid handler_command")?;
            info!(command, "Delivering events to command");
            Ok(Arc::new(handler))
        },
        None => {
            info!("No handler_command configured, events will be logged and acknowledged");
            Ok(Arc::new(LogHandler))
        },
    }
}
