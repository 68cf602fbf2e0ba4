//! Dev-server process endpoints
//!
//! Handles: start, stop, status, logs, clear-logs, and the SSE log stream

use std::convert::Infallible;
use std::path::PathBuf;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_util::stream::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use super::{exited_event, lagged_event, log_event, ServerAppState};
use crate::error::DevdeckError;
use crate::hub::{StreamEvent, Topic};
use crate::models::ProcessState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub command: Option<String>,
    pub working_directory: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<usize>,
}

/// POST /api/projects/:key/start
pub async fn start_process(
    State(state): State<ServerAppState>,
    Path(key): Path<String>,
    Json(body): Json<StartRequest>,
) -> Result<Json<Value>, DevdeckError> {
    let command = body
        .command
        .filter(|c| !c.trim().is_empty())
        .ok_or(DevdeckError::MissingCommand)?;
    let working_dir = resolve_working_dir(body.working_directory)?;

    let started = state.supervisor.start(&key, &command, &working_dir)?;
    Ok(Json(json!({
        "key": key,
        "pid": started.pid,
        "startedAt": started.started_at,
    })))
}

/// POST /api/projects/:key/stop
pub async fn stop_process(
    State(state): State<ServerAppState>,
    Path(key): Path<String>,
) -> Result<Json<Value>, DevdeckError> {
    state.supervisor.stop(&key).await?;
    Ok(Json(json!({ "key": key, "stopped": true })))
}

/// GET /api/projects/:key/status
pub async fn process_status(
    State(state): State<ServerAppState>,
    Path(key): Path<String>,
) -> Json<crate::models::ProcessStatus> {
    Json(state.supervisor.status(&key))
}

/// GET /api/projects/:key/logs
pub async fn process_logs(
    State(state): State<ServerAppState>,
    Path(key): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Json<Value> {
    let limit = query.limit.unwrap_or(usize::MAX);
    let logs = state.hub.replay(&Topic::ProcessLog(key), limit);
    Json(json!({ "logs": logs }))
}

/// DELETE /api/projects/:key/logs
pub async fn clear_process_logs(
    State(state): State<ServerAppState>,
    Path(key): Path<String>,
) -> Json<Value> {
    state.hub.clear(&Topic::ProcessLog(key.clone()));
    Json(json!({ "key": key, "cleared": true }))
}

/// GET /api/projects/:key/logs/stream
///
/// Replays buffered log lines, then stays live until the process exits. The
/// hub subscription is taken before the status read, so an exit landing
/// between the two shows up in the receiver instead of being lost.
pub async fn stream_process(
    State(state): State<ServerAppState>,
    Path(key): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let topic = Topic::ProcessLog(key.clone());
    let sub = state.hub.subscribe(&topic);
    let status = state.supervisor.status(&key);

    let stream = async_stream::stream! {
        let mut rx = sub.rx;
        for entry in sub.backlog {
            yield Ok(log_event(&entry));
        }

        if let Some(recorded) = status.state {
            if !recorded.is_live() {
                // Already terminal: deliver anything still queued, then make
                // sure the client gets an exit event exactly once
                loop {
                    match rx.try_recv() {
                        Ok(StreamEvent::Log(entry)) => yield Ok(log_event(&entry)),
                        Ok(StreamEvent::ProcessExited { exit_code, forced }) => {
                            yield Ok(exited_event(&key, exit_code, forced));
                            return;
                        }
                        Ok(_) => {}
                        Err(TryRecvError::Lagged(skipped)) => yield Ok(lagged_event(skipped)),
                        Err(_) => break,
                    }
                }
                yield Ok(exited_event(
                    &key,
                    status.exit_code,
                    recorded == ProcessState::StoppedForced,
                ));
                return;
            }
        }

        loop {
            match rx.recv().await {
                Ok(StreamEvent::Log(entry)) => yield Ok(log_event(&entry)),
                Ok(StreamEvent::ProcessExited { exit_code, forced }) => {
                    yield Ok(exited_event(&key, exit_code, forced));
                    break;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => yield Ok(lagged_event(skipped)),
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

fn resolve_working_dir(supplied: Option<String>) -> Result<PathBuf, DevdeckError> {
    match supplied {
        Some(dir) if !dir.trim().is_empty() => Ok(PathBuf::from(dir)),
        _ => std::env::current_dir()
            .map_err(|e| DevdeckError::Spawn(format!("cannot resolve working directory: {}", e))),
    }
}
