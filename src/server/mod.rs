//! HTTP server exposing the process and assistant control plane
//!
//! One axum router carries both the JSON control endpoints and the SSE
//! streaming endpoints; a browser dashboard is the expected client.

pub mod routes;
pub mod state;

pub use state::ServerAppState;

use axum::http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use axum::http::HeaderValue;
use axum::routing::get;
use axum::{Json, Router};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

/// Version information reported by the version endpoint
#[derive(serde::Serialize)]
struct VersionInfo {
    name: String,
    version: String,
}

/// Run the HTTP server until shutdown is requested
pub async fn run_server(
    port: u16,
    bind: &str,
    state: ServerAppState,
    cors_origins: Option<Vec<String>>,
) -> Result<(), String> {
    // CORS must be the outermost layer so preflight OPTIONS requests are
    // answered before anything else sees them
    let cors = match &cors_origins {
        Some(origins) if !origins.is_empty() => {
            let allowed_origins: Vec<HeaderValue> =
                origins.iter().filter_map(|o| o.parse().ok()).collect();
            CorsLayer::new()
                .allow_origin(allowed_origins)
                .allow_methods(Any)
                .allow_headers([AUTHORIZATION, CONTENT_TYPE, ACCEPT])
        }
        _ => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers([AUTHORIZATION, CONTENT_TYPE, ACCEPT]),
    };

    let app = Router::new()
        .merge(routes::api_router())
        .route("/health", get(health_handler))
        .route("/api/version", get(version_handler))
        .layer(cors)
        .with_state(state.clone());

    let addr: SocketAddr = format!("{}:{}", bind, port)
        .parse()
        .map_err(|e| format!("Invalid address: {}", e))?;

    let cors_display = match &cors_origins {
        Some(origins) if !origins.is_empty() => origins.join(", "),
        _ => "*".to_string(),
    };

    println!("\nDevdeck server");
    println!("  URL:          http://{}:{}", bind, port);
    println!("  CORS origins: {}", cors_display);
    println!("  Endpoints:");
    println!("    POST   /api/projects/:key/start");
    println!("    POST   /api/projects/:key/stop");
    println!("    GET    /api/projects/:key/status");
    println!("    GET    /api/projects/:key/logs");
    println!("    DELETE /api/projects/:key/logs");
    println!("    GET    /api/projects/:key/logs/stream  (SSE)");
    println!("    POST   /api/assistant/execute");
    println!("    GET    /api/assistant/sessions");
    println!("    GET    /api/assistant/:id/status");
    println!("    POST   /api/assistant/:id/terminate");
    println!("    GET    /api/assistant/:id/stream       (SSE)");
    println!("    GET    /health\n");

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| format!("Failed to bind to {}: {}", addr, e))?;

    log::info!("Server listening on http://{}", addr);

    // Shutdown signal polls the shared flag set by the signal handlers
    let shutdown_state = state.shutdown_state.clone();
    let shutdown_signal = async move {
        loop {
            if shutdown_state.is_shutdown_requested() {
                log::info!("Shutdown signal received, stopping server...");
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .map_err(|e| format!("Server error: {}", e))
}

/// Health check endpoint
async fn health_handler() -> &'static str {
    "OK"
}

/// Version endpoint
async fn version_handler() -> Json<VersionInfo> {
    Json(VersionInfo {
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
