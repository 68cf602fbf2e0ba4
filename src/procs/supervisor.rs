// Child-process spawning and lifecycle tracking for project dev servers
//
// One supervised process per project key. Output is wired line-by-line into
// the event hub; a per-instance watcher task detects exit (passive or
// requested) and publishes the terminal event after the output readers have
// drained, so subscribers always see the exited event last.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::DevdeckError;
use crate::hub::{EventHub, StreamEvent, Topic};
use crate::models::{LogEntry, ProcessState, ProcessStatus, StreamKind};
use crate::utils::lock_mutex_recover;

/// Grace period between SIGTERM and SIGKILL on stop
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(3);

/// Snapshot returned to the caller once a spawn has been initiated
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedProcess {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

struct StopRequest {
    ack: oneshot::Sender<()>,
}

/// Registry entry for one supervised process instance
///
/// `instance` is the identity carried by the watcher task; a late callback
/// from a superseded instance at the same key is recognized and discarded.
struct ProcessEntry {
    instance: Uuid,
    pid: u32,
    command: String,
    working_dir: PathBuf,
    started_at: DateTime<Utc>,
    state: ProcessState,
    exit_code: Option<i32>,
    stop_tx: mpsc::Sender<StopRequest>,
}

/// Starts, stops, and tracks exit of project dev-server processes
pub struct ProcessSupervisor {
    entries: Arc<Mutex<HashMap<String, ProcessEntry>>>,
    hub: Arc<EventHub>,
    stop_grace: Duration,
}

impl ProcessSupervisor {
    pub fn new(hub: Arc<EventHub>) -> Self {
        Self::with_grace(hub, DEFAULT_STOP_GRACE)
    }

    pub fn with_grace(hub: Arc<EventHub>, stop_grace: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            hub,
            stop_grace,
        }
    }

    /// Spawn a shell command as the dev server for `key`
    ///
    /// Fails with `AlreadyRunning` if a live handle exists. Returns once the
    /// spawn is initiated; readiness probing is not the supervisor's concern.
    pub fn start(
        &self,
        key: &str,
        command: &str,
        working_dir: &Path,
    ) -> Result<StartedProcess, DevdeckError> {
        if !working_dir.is_dir() {
            return Err(DevdeckError::Spawn(format!(
                "working directory does not exist: {}",
                working_dir.display()
            )));
        }

        // Hold the registry lock across the liveness check and the insert so
        // two concurrent starts for the same key cannot both spawn
        let mut entries = lock_mutex_recover(&self.entries);
        if let Some(entry) = entries.get(key) {
            if entry.state.is_live() {
                return Err(DevdeckError::AlreadyRunning(key.to_string()));
            }
        }

        let mut cmd = shell_command(command);
        cmd.current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| DevdeckError::Spawn(format!("'{}': {}", command, e)))?;
        let pid = child.id().unwrap_or_default();
        let started_at = Utc::now();
        let instance = Uuid::new_v4();

        log::info!(
            "[Supervisor] Started '{}' for key {} (pid {}, cwd {})",
            command,
            key,
            pid,
            working_dir.display()
        );

        let topic = Topic::ProcessLog(key.to_string());
        let readers = spawn_output_readers(&mut child, self.hub.clone(), topic.clone());

        let (stop_tx, stop_rx) = mpsc::channel(4);
        entries.insert(
            key.to_string(),
            ProcessEntry {
                instance,
                pid,
                command: command.to_string(),
                working_dir: working_dir.to_path_buf(),
                started_at,
                state: ProcessState::Running,
                exit_code: None,
                stop_tx,
            },
        );
        drop(entries);

        tokio::spawn(watch_process(
            child,
            readers,
            stop_rx,
            self.entries.clone(),
            self.hub.clone(),
            key.to_string(),
            topic,
            instance,
            self.stop_grace,
        ));

        Ok(StartedProcess { pid, started_at })
    }

    /// Request a stop for `key`'s process and wait for the exit confirmation
    ///
    /// Benign no-op when nothing is running. The watcher sends SIGTERM to the
    /// process group, escalating to SIGKILL once the grace period elapses.
    pub async fn stop(&self, key: &str) -> Result<(), DevdeckError> {
        let stop_tx = {
            let entries = lock_mutex_recover(&self.entries);
            match entries.get(key) {
                Some(entry) if entry.state.is_live() => entry.stop_tx.clone(),
                _ => {
                    log::debug!("[Supervisor] Stop for {}: nothing running", key);
                    return Ok(());
                }
            }
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if stop_tx.send(StopRequest { ack: ack_tx }).await.is_err() {
            // Watcher already finished; the exit raced the stop request
            return Ok(());
        }

        // The watcher confirms after at most grace + kill; cap our wait a bit
        // above that so a wedged wait() cannot hang the control plane
        let _ = tokio::time::timeout(self.stop_grace + Duration::from_secs(2), ack_rx).await;
        Ok(())
    }

    /// Pure read of the current state for `key`
    pub fn status(&self, key: &str) -> ProcessStatus {
        let entries = lock_mutex_recover(&self.entries);
        match entries.get(key) {
            Some(entry) => ProcessStatus {
                running: entry.state.is_live(),
                state: Some(entry.state),
                pid: Some(entry.pid),
                started_at: Some(entry.started_at),
                exit_code: entry.exit_code,
                command: Some(entry.command.clone()),
                working_directory: Some(entry.working_dir.display().to_string()),
            },
            None => ProcessStatus::not_running(),
        }
    }

    pub fn running_count(&self) -> usize {
        let entries = lock_mutex_recover(&self.entries);
        entries.values().filter(|e| e.state.is_live()).count()
    }

    /// Stop every live process; used on graceful shutdown
    pub async fn stop_all(&self) {
        let keys: Vec<String> = {
            let entries = lock_mutex_recover(&self.entries);
            entries
                .iter()
                .filter(|(_, e)| e.state.is_live())
                .map(|(k, _)| k.clone())
                .collect()
        };
        for key in keys {
            let _ = self.stop(&key).await;
        }
    }
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

/// Signal the whole process group so shell children die with the shell
#[cfg(unix)]
fn signal_group(pid: u32, signal: i32) {
    // The group id equals the leader pid because of process_group(0)
    unsafe {
        libc::kill(-(pid as i32), signal);
    }
}

fn spawn_output_readers(
    child: &mut Child,
    hub: Arc<EventHub>,
    topic: Topic,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        handles.push(tokio::spawn(read_lines(
            stdout,
            StreamKind::Stdout,
            hub.clone(),
            topic.clone(),
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        handles.push(tokio::spawn(read_lines(
            stderr,
            StreamKind::Stderr,
            hub,
            topic,
        )));
    }
    handles
}

async fn read_lines<R>(reader: R, kind: StreamKind, hub: Arc<EventHub>, topic: Topic)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => hub.append_log(&topic, LogEntry::new(kind, line)),
            Ok(None) => break,
            Err(e) => {
                // Mid-life read failures do not terminate supervision; only
                // actual process exit does
                hub.append_log(
                    &topic,
                    LogEntry::stderr(format!("[stream error] {}", e)),
                );
                break;
            }
        }
    }
}

/// Owns the child until it exits, either on its own or on a stop request
#[allow(clippy::too_many_arguments)]
async fn watch_process(
    mut child: Child,
    readers: Vec<JoinHandle<()>>,
    mut stop_rx: mpsc::Receiver<StopRequest>,
    entries: Arc<Mutex<HashMap<String, ProcessEntry>>>,
    hub: Arc<EventHub>,
    key: String,
    topic: Topic,
    instance: Uuid,
    grace: Duration,
) {
    let (state, exit_code, ack) = tokio::select! {
        status = child.wait() => {
            let code = status.ok().and_then(|s| s.code());
            log::info!("[Supervisor] Process for {} exited with code {:?}", key, code);
            (ProcessState::Exited, code, None)
        }
        Some(req) = stop_rx.recv() => {
            let (state, code) = terminate_child(&mut child, grace, &key).await;
            (state, code, Some(req.ack))
        }
    };

    // Let the pipe readers drain so the terminal event is delivered last
    for handle in readers {
        let _ = handle.await;
    }

    let current = {
        let mut guard = lock_mutex_recover(&entries);
        match guard.get_mut(&key) {
            Some(entry) if entry.instance == instance => {
                entry.state = state;
                entry.exit_code = exit_code;
                true
            }
            _ => {
                // A newer instance owns the key; this callback is stale
                log::debug!("[Supervisor] Discarding stale exit for {}", key);
                false
            }
        }
    };

    if current {
        hub.publish(
            &topic,
            StreamEvent::ProcessExited {
                exit_code,
                forced: state == ProcessState::StoppedForced,
            },
        );
    }

    if let Some(ack) = ack {
        let _ = ack.send(());
    }
    // Confirm any stop requests that raced the exit
    while let Ok(req) = stop_rx.try_recv() {
        let _ = req.ack.send(());
    }
}

#[cfg(unix)]
async fn terminate_child(child: &mut Child, grace: Duration, key: &str) -> (ProcessState, Option<i32>) {
    if let Some(pid) = child.id() {
        signal_group(pid, libc::SIGTERM);
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            log::info!("[Supervisor] Process for {} stopped gracefully", key);
            (ProcessState::Stopped, status.ok().and_then(|s| s.code()))
        }
        Err(_) => {
            log::warn!(
                "[Supervisor] Process for {} ignored SIGTERM for {:?}, killing",
                key,
                grace
            );
            if let Some(pid) = child.id() {
                signal_group(pid, libc::SIGKILL);
            }
            let code = child.wait().await.ok().and_then(|s| s.code());
            (ProcessState::StoppedForced, code)
        }
    }
}

#[cfg(windows)]
async fn terminate_child(child: &mut Child, _grace: Duration, key: &str) -> (ProcessState, Option<i32>) {
    let _ = child.start_kill();
    let code = child.wait().await.ok().and_then(|s| s.code());
    log::info!("[Supervisor] Process for {} stopped", key);
    (ProcessState::Stopped, code)
}
