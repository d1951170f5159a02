//! HTTP/WebSocket surface: router, CORS, request logging, and the
//! telemetry bootstrap.
//!
//! Grounded on `web::start_web_server`'s router/middleware/bootstrap shape.
//! Dropped relative to the teacher: embedded static asset serving (no
//! frontend bundle in scope), `sentry_error_middleware` (no `sentry`
//! dependency), and the Diesel `PgPool` app state (no database in scope —
//! this service's durable state lives in [`crate::store::Store`]).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::broadcast_hub::{telemetry_ws, telemetry_ws_filtered, BroadcastHub};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

async fn request_logging_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
    let start = Instant::now();

    info!("started {} {} [{}]", method, path, request_id);
    let response = next.run(request).await;
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

    info!(
        "completed {} {} [{}] {} in {elapsed_ms:.2}ms",
        method,
        path,
        request_id,
        response.status().as_u16()
    );
    response
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

fn app(hub: Arc<BroadcastHub>) -> Router {
    Router::new()
        .route("/telemetry", get(telemetry_ws))
        .route("/telemetry/{port}", get(telemetry_ws_filtered))
        .route("/health", get(health))
        .with_state(hub)
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(request_logging_middleware))
}

/// Bind `bind` and serve the telemetry router until the process exits.
pub async fn start_web_server(bind: &str, hub: Arc<BroadcastHub>) -> std::io::Result<()> {
    let router = app(hub);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(%bind, "starting telemetry web server");
    axum::serve(listener, router).await
}
