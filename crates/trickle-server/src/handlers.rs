//! HTTP handlers for the Trickle server.
//!
//! One hub is shared by every transport: a message sent over any of them
//! reaches connections on all of them.

use crate::chat::ChatRenderer;
use crate::config::Config;
use crate::metrics;
use anyhow::{Context, Result};
use axum::{
    body::{Body, Bytes},
    extract::{ws::WebSocketUpgrade, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use trickle_core::{ControlOutcome, Hub};
use trickle_protocol::ControlMessage;
use trickle_transport::{
    AdapterContext, LongPollAdapter, StreamingAdapter, TransportAdapter, TransportError,
    WebSocketAdapter,
};

/// Headers on every streamed or polled body.
const STREAM_HEADERS: [(header::HeaderName, &str); 3] = [
    (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
    (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
    (header::CACHE_CONTROL, "no-cache"),
];

/// Shared server state.
pub struct AppState {
    /// The streaming core.
    pub hub: Arc<Hub>,
    /// HTTP streaming transport; also serves the control channel.
    pub streaming: StreamingAdapter,
    /// Long-poll transport.
    pub long_poll: Arc<LongPollAdapter>,
    /// WebSocket transport.
    pub websocket: WebSocketAdapter,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let hub = Arc::new(Hub::with_config(config.hub_config()));
        let context = AdapterContext::new(Arc::clone(&hub), Arc::new(ChatRenderer));

        Self {
            streaming: StreamingAdapter::new(context.clone()),
            long_poll: Arc::new(LongPollAdapter::new(
                context.clone(),
                Duration::from_millis(config.long_poll.wait_ms),
            )),
            websocket: WebSocketAdapter::new(context),
            hub,
            config,
        }
    }

    /// Start the long-poll sweeper, which also refreshes the active
    /// connection gauge.
    pub fn spawn_background_tasks(&self) -> JoinHandle<()> {
        let interval = Duration::from_millis(self.config.long_poll.sweep_interval_ms.max(1));
        let sweeper = self.long_poll.spawn_sweeper(interval);
        let hub = Arc::clone(&self.hub);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if sweeper.is_finished() || hub.is_shutting_down() {
                    break;
                }
                metrics::set_active_connections(hub.stats().connections);
            }
            sweeper.abort();
        })
    }
}

/// Build the router for `state`.
pub fn build_router(state: Arc<AppState>) -> Router {
    let transport = &state.config.transport;

    let mut app = Router::new()
        .route(
            &transport.stream_path,
            get(stream_handler).post(control_handler),
        )
        .route("/health", get(health_handler));

    if transport.long_poll {
        app = app.route(&transport.poll_path, get(poll_handler));
    }
    if transport.websocket {
        app = app.route(&transport.websocket_path, get(ws_handler));
    }

    app.with_state(state)
}

/// Run the HTTP/WebSocket server until Ctrl+C or SIGTERM.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {:#}", e);
        }
    }

    let addr = config.bind_addr()?;
    let state = Arc::new(AppState::new(config));
    let background = state.spawn_background_tasks();
    let app = build_router(Arc::clone(&state));

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    let transport = &state.config.transport;
    info!("Trickle server listening on {}", addr);
    info!("Streaming endpoint: http://{}{}", addr, transport.stream_path);
    if transport.long_poll {
        info!("Long-poll endpoint: http://{}{}", addr, transport.poll_path);
    }
    if transport.websocket {
        info!("WebSocket endpoint: ws://{}{}", addr, transport.websocket_path);
    }

    let hub = Arc::clone(&state.hub);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            hub.shutdown().await;
        })
        .await
        .context("Server error")?;

    background.abort();
    info!("Trickle server stopped");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received terminate signal, shutting down"),
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = if state.hub.is_shutting_down() {
        "shutting_down"
    } else {
        "ok"
    };

    Json(serde_json::json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.hub.stats().connections,
    }))
}

/// Open an HTTP streaming connection.
async fn stream_handler(State(state): State<Arc<AppState>>) -> Response {
    let stream = match state.streaming.open_stream().await {
        Ok(stream) => stream,
        Err(e) => return refused(state.streaming.name(), &e),
    };
    metrics::record_connection(state.streaming.name());
    metrics::set_active_connections(state.hub.stats().connections);

    let body = stream.map(|chunk| {
        metrics::record_message(chunk.len(), "outbound");
        Ok::<_, Infallible>(chunk)
    });

    (STREAM_HEADERS, Body::from_stream(body)).into_response()
}

/// Control channel: `metadata.id`, `metadata.type` and payload fields as a
/// form body. Always answers `200 OK` with an empty body.
async fn control_handler(State(state): State<Arc<AppState>>, body: Bytes) -> impl IntoResponse {
    let ok = (StatusCode::OK, [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")]);

    if body.len() > state.config.limits.max_message_size {
        warn!(
            size = body.len(),
            max = state.config.limits.max_message_size,
            "Control message too large"
        );
        metrics::record_error("message_too_large");
        return ok;
    }

    let parsed = std::str::from_utf8(&body)
        .map_err(|e| e.to_string())
        .and_then(|form| ControlMessage::from_form(form).map_err(|e| e.to_string()));
    let message = match parsed {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "Malformed control message");
            metrics::record_error("malformed_control");
            return ok;
        }
    };
    metrics::record_message(body.len(), "inbound");

    let started = Instant::now();
    match state.streaming.on_inbound_control(message).await {
        ControlOutcome::Published(report) => metrics::record_delivery(&report, started.elapsed()),
        ControlOutcome::Rejected(_) => metrics::record_error("malformed_control"),
        ControlOutcome::Closed | ControlOutcome::Ignored => {}
    }

    ok
}

/// Query of a long-poll request.
#[derive(Debug, Deserialize)]
struct PollParams {
    id: Option<String>,
}

/// Open a long-poll connection (no `id`) or wait for its frames.
async fn poll_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PollParams>,
) -> Response {
    let adapter = &state.long_poll;

    let Some(id) = params.id.filter(|id| !id.is_empty()) else {
        return match adapter.on_connect().await {
            Ok(preamble) => {
                metrics::record_connection(adapter.name());
                metrics::set_active_connections(state.hub.stats().connections);
                (STREAM_HEADERS, preamble).into_response()
            }
            Err(e) => refused(adapter.name(), &e),
        };
    };

    match adapter.poll(&id).await {
        Ok(frames) => {
            if !frames.is_empty() {
                metrics::record_message(frames.len(), "outbound");
            }
            (STREAM_HEADERS, frames).into_response()
        }
        Err(TransportError::UnknownConnection(_) | TransportError::ConnectionClosed) => {
            debug!(connection = %id, "Poll for unknown or closed connection");
            StatusCode::NOT_FOUND.into_response()
        }
        Err(e) => {
            warn!(connection = %id, error = %e, "Poll failed");
            metrics::record_error("poll_failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    if state.hub.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| async move {
            metrics::record_connection(state.websocket.name());
            state.websocket.serve(socket).await;
        })
}

/// Map a refused open to a response.
fn refused(transport: &'static str, error: &TransportError) -> Response {
    if let TransportError::Refused(_) = error {
        warn!(transport, error = %error, "Connection refused");
        metrics::record_error("connection_refused");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    error!(transport, error = %error, "Failed to open connection");
    metrics::record_error("open_failed");
    StatusCode::INTERNAL_SERVER_ERROR.into_response()
}
