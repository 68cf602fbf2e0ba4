// Assistant engine seam: runs one prompt against an AI coding CLI and
// streams its output back through a channel

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::error::DevdeckError;

/// Number of trailing stderr lines kept for the failure message
const STDERR_TAIL: usize = 5;

/// Everything an engine needs to run one assistant invocation
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub project_key: String,
    pub working_dir: PathBuf,
    pub prompt: String,
    /// Durable conversation key; engines use it to resume or seed context
    pub conversation_id: String,
    /// True when the conversation existed before this invocation
    pub resume: bool,
}

/// What the engine produced on normal completion
#[derive(Debug, Clone, Default)]
pub struct EngineOutcome {
    /// Final result text, when the engine reports one
    pub summary: Option<String>,
}

/// One runnable assistant backend
///
/// `run` drives the invocation to completion, sending output chunks through
/// `output` as they arrive. A dropped receiver means nobody is listening
/// anymore; engines keep running and ignore send failures.
#[async_trait]
pub trait AssistantEngine: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(
        &self,
        request: EngineRequest,
        output: mpsc::UnboundedSender<String>,
    ) -> Result<EngineOutcome>;
}

/// Engine backed by the `claude` CLI in streaming JSON mode
pub struct ClaudeCliEngine {
    binary: PathBuf,
}

impl ClaudeCliEngine {
    /// Locate the CLI on PATH, falling back to the common install locations
    /// that GUI-launched environments miss.
    pub fn resolve() -> Result<Self, DevdeckError> {
        if let Ok(path) = which::which("claude") {
            return Ok(Self { binary: path });
        }
        let home = std::env::var("HOME").unwrap_or_default();
        let fallbacks = [
            format!("{}/.local/bin/claude", home),
            format!("{}/.claude/local/claude", home),
            "/usr/local/bin/claude".to_string(),
            "/opt/homebrew/bin/claude".to_string(),
        ];
        for candidate in fallbacks {
            let path = PathBuf::from(&candidate);
            if path.is_file() {
                return Ok(Self { binary: path });
            }
        }
        Err(DevdeckError::EngineUnavailable(
            "claude CLI not found on PATH".to_string(),
        ))
    }

    /// Engine whose spawn fails at run time; lets the process control plane
    /// serve even when no CLI was found at startup
    pub fn unresolved() -> Self {
        Self {
            binary: PathBuf::from("claude"),
        }
    }

    #[cfg(test)]
    pub fn with_binary(binary: PathBuf) -> Self {
        Self { binary }
    }

    fn build_invocation(&self, request: &EngineRequest) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.current_dir(&request.working_dir)
            .arg("--print")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--dangerously-skip-permissions");
        if request.resume {
            cmd.arg("--resume").arg(&request.conversation_id);
        } else {
            cmd.arg("--session-id").arg(&request.conversation_id);
        }
        cmd.arg(&request.prompt);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Pull the final result text out of a stream-json line, if it is one
fn extract_summary(line: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    if value.get("type").and_then(|t| t.as_str()) == Some("result") {
        value
            .get("result")
            .and_then(|r| r.as_str())
            .map(|s| s.to_string())
    } else {
        None
    }
}

#[async_trait]
impl AssistantEngine for ClaudeCliEngine {
    fn name(&self) -> &'static str {
        "claude"
    }

    async fn run(
        &self,
        request: EngineRequest,
        output: mpsc::UnboundedSender<String>,
    ) -> Result<EngineOutcome> {
        let mut child = self
            .build_invocation(&request)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.binary.display()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("assistant stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("assistant stderr not captured"))?;

        // stderr drains in its own task so a chatty CLI cannot deadlock on a
        // full pipe while we read stdout
        let stderr_task = tokio::spawn(async move {
            let mut tail: VecDeque<String> = VecDeque::new();
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tail.len() >= STDERR_TAIL {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail
        });

        let mut summary = None;
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(text) = extract_summary(&line) {
                summary = Some(text);
            }
            let _ = output.send(line);
        }

        let status = child.wait().await.context("failed to await assistant CLI")?;
        let tail = stderr_task.await.unwrap_or_default();

        if status.success() {
            Ok(EngineOutcome { summary })
        } else {
            let detail = if tail.is_empty() {
                "no stderr output".to_string()
            } else {
                tail.into_iter().collect::<Vec<_>>().join(" | ")
            };
            Err(anyhow!(
                "assistant exited with status {:?}: {}",
                status.code(),
                detail
            ))
        }
    }
}
