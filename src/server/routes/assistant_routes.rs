//! Assistant session endpoints
//!
//! Handles: execute, status, terminate, active-session listing, and the SSE
//! output stream

use std::convert::Infallible;
use std::path::PathBuf;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_util::stream::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use super::{chunk_event, complete_event, lagged_event, ServerAppState};
use crate::assistant::ExecuteReceipt;
use crate::error::DevdeckError;
use crate::hub::{StreamEvent, Topic};
use crate::models::AssistantSession;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub project_key: String,
    pub prompt: String,
    pub working_directory: Option<String>,
    pub conversation_id: Option<String>,
}

/// POST /api/assistant/execute
pub async fn execute_assistant(
    State(state): State<ServerAppState>,
    Json(body): Json<ExecuteRequest>,
) -> Result<Json<ExecuteReceipt>, DevdeckError> {
    if body.prompt.trim().is_empty() {
        return Err(DevdeckError::EmptyPrompt);
    }
    let working_dir = match body.working_directory {
        Some(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
        _ => std::env::current_dir()
            .map_err(|e| DevdeckError::Spawn(format!("cannot resolve working directory: {}", e)))?,
    };

    let receipt = state.assistant.execute(
        &body.project_key,
        working_dir,
        &body.prompt,
        body.conversation_id,
    );
    Ok(Json(receipt))
}

/// GET /api/assistant/sessions
pub async fn active_sessions(State(state): State<ServerAppState>) -> Json<Value> {
    Json(json!({ "sessions": state.assistant.active_sessions() }))
}

/// GET /api/assistant/:id/status
pub async fn session_status(
    State(state): State<ServerAppState>,
    Path(id): Path<String>,
) -> Result<Json<AssistantSession>, DevdeckError> {
    state
        .assistant
        .session(&id)
        .map(Json)
        .ok_or(DevdeckError::UnknownSession(id))
}

/// POST /api/assistant/:id/terminate
///
/// Succeeds whether or not the session is still running; a terminate racing
/// a natural completion is not an error.
pub async fn terminate_session(
    State(state): State<ServerAppState>,
    Path(id): Path<String>,
) -> Json<Value> {
    let terminated = state.assistant.terminate(&id);
    Json(json!({ "success": true, "terminated": terminated }))
}

/// GET /api/assistant/:id/stream
///
/// Replays buffered output chunks, then stays live until the session reaches
/// a terminal state. A client joining after completion still gets the full
/// backlog and exactly one terminal event.
pub async fn stream_session(
    State(state): State<ServerAppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, DevdeckError> {
    let topic = Topic::AssistantOutput(id.clone());
    // Subscribe before the record read so no event falls between them
    let sub = state.hub.subscribe(&topic);
    let session = state
        .assistant
        .session(&id)
        .ok_or(DevdeckError::UnknownSession(id))?;

    let stream = async_stream::stream! {
        let mut rx = sub.rx;
        for entry in sub.backlog {
            yield Ok(chunk_event(&entry));
        }

        if session.state.is_terminal() {
            loop {
                match rx.try_recv() {
                    Ok(StreamEvent::Log(entry)) => yield Ok(chunk_event(&entry)),
                    Ok(StreamEvent::SessionComplete { state, result, error }) => {
                        yield Ok(complete_event(&session.session_id, state, result, error));
                        return;
                    }
                    Ok(_) => {}
                    Err(TryRecvError::Lagged(skipped)) => yield Ok(lagged_event(skipped)),
                    Err(_) => break,
                }
            }
            yield Ok(synthesized_complete(&session));
            return;
        }

        loop {
            match rx.recv().await {
                Ok(StreamEvent::Log(entry)) => yield Ok(chunk_event(&entry)),
                Ok(StreamEvent::SessionComplete { state, result, error }) => {
                    yield Ok(complete_event(&session.session_id, state, result, error));
                    break;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => yield Ok(lagged_event(skipped)),
                Err(RecvError::Closed) => break,
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

/// Terminal event rebuilt from the session record when the live one was
/// published before this subscriber existed
fn synthesized_complete(session: &AssistantSession) -> Event {
    complete_event(
        &session.session_id,
        session.state,
        session.result.clone(),
        session.error.clone(),
    )
}
