// Wire-level event types for the streaming endpoints
// These are serialized as SSE payloads to connected clients

use serde::{Deserialize, Serialize};

use crate::models::SessionState;

// SSE event name constants
pub const SSE_EVENT_LOG: &str = "log";
pub const SSE_EVENT_EXITED: &str = "exited";
pub const SSE_EVENT_CHUNK: &str = "chunk";
pub const SSE_EVENT_COMPLETE: &str = "complete";
pub const SSE_EVENT_LAGGED: &str = "lagged";

/// Payload for the terminal event of a process log stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessExitedPayload {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// True when the grace period elapsed and the process was killed
    pub forced: bool,
}

/// Payload for the terminal event of an assistant output stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCompletePayload {
    pub session_id: String,
    pub state: SessionState,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload emitted when a slow consumer missed events
///
/// The stream stays live; the client is told how many events were skipped
/// and can re-fetch history over the logs endpoint if it cares.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaggedPayload {
    pub skipped: u64,
}
