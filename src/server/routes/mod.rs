//! REST and SSE route handlers
//!
//! Control-plane requests (start, stop, status, execute, terminate) are
//! plain JSON; output streaming uses SSE with named events.

pub mod assistant_routes;
pub mod process_routes;

use axum::response::sse::Event;
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;

use crate::events::{
    LaggedPayload, ProcessExitedPayload, SessionCompletePayload, SSE_EVENT_CHUNK,
    SSE_EVENT_COMPLETE, SSE_EVENT_EXITED, SSE_EVENT_LAGGED, SSE_EVENT_LOG,
};
use crate::models::{LogEntry, SessionState};
use crate::server::state::ServerAppState;

/// All API routes, to be merged into the top-level router
pub fn api_router() -> Router<ServerAppState> {
    Router::new()
        .route("/api/projects/:key/start", post(process_routes::start_process))
        .route("/api/projects/:key/stop", post(process_routes::stop_process))
        .route("/api/projects/:key/status", get(process_routes::process_status))
        .route(
            "/api/projects/:key/logs",
            get(process_routes::process_logs).delete(process_routes::clear_process_logs),
        )
        .route(
            "/api/projects/:key/logs/stream",
            get(process_routes::stream_process),
        )
        .route("/api/assistant/execute", post(assistant_routes::execute_assistant))
        .route("/api/assistant/sessions", get(assistant_routes::active_sessions))
        .route("/api/assistant/:id/status", get(assistant_routes::session_status))
        .route(
            "/api/assistant/:id/terminate",
            post(assistant_routes::terminate_session),
        )
        .route("/api/assistant/:id/stream", get(assistant_routes::stream_session))
}

fn sse_json(name: &'static str, payload: &impl Serialize) -> Event {
    Event::default()
        .event(name)
        .data(serde_json::to_string(payload).unwrap_or_default())
}

pub(crate) fn log_event(entry: &LogEntry) -> Event {
    sse_json(SSE_EVENT_LOG, entry)
}

pub(crate) fn chunk_event(entry: &LogEntry) -> Event {
    sse_json(SSE_EVENT_CHUNK, entry)
}

pub(crate) fn exited_event(key: &str, exit_code: Option<i32>, forced: bool) -> Event {
    sse_json(
        SSE_EVENT_EXITED,
        &ProcessExitedPayload {
            key: key.to_string(),
            exit_code,
            forced,
        },
    )
}

pub(crate) fn complete_event(
    session_id: &str,
    state: SessionState,
    result: Option<String>,
    error: Option<String>,
) -> Event {
    sse_json(
        SSE_EVENT_COMPLETE,
        &SessionCompletePayload {
            session_id: session_id.to_string(),
            state,
            success: state == SessionState::Completed,
            result,
            error,
        },
    )
}

pub(crate) fn lagged_event(skipped: u64) -> Event {
    sse_json(SSE_EVENT_LAGGED, &LaggedPayload { skipped })
}
