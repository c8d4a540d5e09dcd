//! HTTP server configuration and request routing.
//!
//! Requests flow through middleware in order:
//! 1. Request ID generation
//! 2. Request/response tracing
//! 3. Timeout enforcement
//! 4. Body size limit
//! 5. Admin authentication (operator routes only)
//! 6. Handler execution
//!
//! # Graceful Shutdown
//!
//! The server stops accepting connections when its cancellation token
//! fires and waits for in-flight requests. [`shutdown_signal`] turns
//! CTRL+C or SIGTERM into that cancellation.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{DefaultBodyLimit, Request},
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use hookline_core::{Clock, DeadLetterSink, EventStore};
use hookline_delivery::DispatchQueue;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{limit::RequestBodyLimitLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

use crate::{
    crypto::SignatureVerifier, handlers, intake::IntakeService, middleware::auth::require_admin,
};

/// Largest accepted webhook body.
pub const MAX_PAYLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Response header carrying the request id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Webhook intake.
    pub intake: IntakeService,
    /// Event store, for inspection and health.
    pub store: Arc<dyn EventStore>,
    /// Dead-letter sink.
    pub dead_letters: Arc<dyn DeadLetterSink>,
    /// Queue to wake after a replay.
    pub queue: DispatchQueue,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Bearer token for operator routes; `None` leaves them unmounted.
    pub admin_token: Option<Arc<str>>,
}

impl AppState {
    /// Builds the state around one store that is both the event store and
    /// the dead-letter sink.
    pub fn new<S>(
        store: Arc<S>,
        verifier: SignatureVerifier,
        queue: DispatchQueue,
        clock: Arc<dyn Clock>,
    ) -> Self
    where
        S: EventStore + DeadLetterSink,
    {
        let events: Arc<dyn EventStore> = store.clone();
        let dead_letters: Arc<dyn DeadLetterSink> = store;
        Self {
            intake: IntakeService::new(verifier, events.clone(), queue.clone(), clock.clone()),
            store: events,
            dead_letters,
            queue,
            clock,
            admin_token: None,
        }
    }

    /// Enables the operator routes behind `token`.
    #[must_use]
    pub fn with_admin_token(mut self, token: impl Into<Arc<str>>) -> Self {
        self.admin_token = Some(token.into());
        self
    }
}

/// Creates the router with all routes and middleware.
pub fn create_router(state: AppState, request_timeout: Duration) -> Router {
    let intake_routes = Router::new()
        .route("/webhooks", post(handlers::ingest_webhook))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(MAX_PAYLOAD_BYTES));

    let mut app =
        Router::new().route("/health", get(handlers::health_check)).merge(intake_routes);

    if let Some(token) = state.admin_token.clone() {
        let operator_routes = Router::new()
            .route("/events/{key}", get(handlers::get_event))
            .route("/dead-letters", get(handlers::list_dead_letters))
            .route("/dead-letters/{key}", get(handlers::get_dead_letter))
            .route("/dead-letters/{key}/replay", post(handlers::replay_dead_letter))
            .layer(middleware::from_fn_with_state(token, require_admin));
        app = app.merge(operator_routes);
    }

    app.layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(inject_request_id))
        .with_state(state)
}

/// Tags each request with a fresh id and echoes it in the response.
async fn inject_request_id(mut req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    req.extensions_mut().insert(request_id.clone());

    let mut response = next.run(req).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    response
}

/// Binds `addr` and serves `app` until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns an I/O error if the address cannot be bound.
pub async fn start_server(
    app: Router,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(addr).await?;
    serve(listener, app, shutdown).await
}

/// Serves `app` on an already bound listener until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns an I/O error if the server fails.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    info!(addr = %listener.local_addr()?, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("HTTP server stopped gracefully");
    Ok(())
}

/// Waits for CTRL+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received CTRL+C, starting graceful shutdown");
        },
        () = terminate => {
            info!("received SIGTERM, starting graceful shutdown");
        },
    }
}
