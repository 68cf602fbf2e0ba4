// Core data model: supervised processes, log entries, assistant sessions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which output stream a captured line came from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// One timestamped line of captured process or assistant output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub stream: StreamKind,
    pub text: String,
}

impl LogEntry {
    pub fn new(stream: StreamKind, text: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream,
            text: text.into(),
        }
    }

    pub fn stdout(text: impl Into<String>) -> Self {
        Self::new(StreamKind::Stdout, text)
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self::new(StreamKind::Stderr, text)
    }
}

/// Lifecycle state of a supervised process
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// Spawned and not yet known to have exited
    Running,
    /// Stopped on request, exited within the grace period
    Stopped,
    /// Stopped on request, killed after the grace period elapsed
    StoppedForced,
    /// Exited on its own (crash or normal termination)
    Exited,
}

impl ProcessState {
    /// Whether this state counts as a live process for the
    /// one-instance-per-key rule
    pub fn is_live(&self) -> bool {
        matches!(self, ProcessState::Running)
    }
}

/// Snapshot returned by the supervisor's status query
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStatus {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<ProcessState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
}

impl ProcessStatus {
    /// Status for a key that has no registered process
    pub fn not_running() -> Self {
        Self {
            running: false,
            state: None,
            pid: None,
            started_at: None,
            exit_code: None,
            command: None,
            working_directory: None,
        }
    }
}

/// Lifecycle state of an assistant session
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Running,
    Completed,
    Failed,
    Terminated,
}

impl SessionState {
    /// Terminal states are sinks; no transition leaves them
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionState::Running)
    }
}

/// One tracked invocation of the AI coding assistant
///
/// `session_id` identifies exactly one running task. `conversation_id` is
/// the durable cross-invocation key: continuing a conversation (or switching
/// engines mid-conversation) creates a new session sharing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantSession {
    pub session_id: String,
    pub conversation_id: String,
    pub project_key: String,
    pub prompt: String,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Result summary captured on normal completion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Error captured when the session failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
