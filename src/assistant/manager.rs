// Assistant session tracking: one record per invocation, exactly one
// terminal event, idempotent termination
//
// Every state flip and every publish happens under the sessions lock, which
// is what rules out a chunk or a second terminal sneaking in after
// termination. Lock order is sessions first, hub second.

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::pin;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::assistant::engine::{AssistantEngine, EngineRequest};
use crate::hub::{EventHub, StreamEvent, Topic};
use crate::models::{AssistantSession, LogEntry, SessionState};
use crate::utils::lock_mutex_recover;

/// What the caller gets back from a successful execute
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteReceipt {
    pub session_id: String,
    pub conversation_id: String,
}

struct SessionRecord {
    session: AssistantSession,
    task: Option<JoinHandle<()>>,
}

/// Tracks assistant invocations and routes their output into the hub
pub struct AssistantSessionManager {
    sessions: Arc<Mutex<HashMap<String, SessionRecord>>>,
    hub: Arc<EventHub>,
    engine: Arc<dyn AssistantEngine>,
}

impl AssistantSessionManager {
    pub fn new(hub: Arc<EventHub>, engine: Arc<dyn AssistantEngine>) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            hub,
            engine,
        }
    }

    /// Start a new assistant invocation; returns immediately with its ids.
    ///
    /// A supplied `conversation_id` continues that conversation; otherwise a
    /// fresh one is minted. The session id is always new.
    pub fn execute(
        &self,
        project_key: &str,
        working_dir: PathBuf,
        prompt: &str,
        conversation_id: Option<String>,
    ) -> ExecuteReceipt {
        let session_id = Uuid::new_v4().to_string();
        let (conversation_id, resume) = match conversation_id {
            Some(id) => (id, true),
            None => (Uuid::new_v4().to_string(), false),
        };

        let session = AssistantSession {
            session_id: session_id.clone(),
            conversation_id: conversation_id.clone(),
            project_key: project_key.to_string(),
            prompt: prompt.to_string(),
            state: SessionState::Running,
            started_at: Utc::now(),
            finished_at: None,
            result: None,
            error: None,
        };

        let request = EngineRequest {
            project_key: project_key.to_string(),
            working_dir,
            prompt: prompt.to_string(),
            conversation_id: conversation_id.clone(),
            resume,
        };

        log::info!(
            "starting assistant session {} (conversation {}, engine {})",
            session_id,
            conversation_id,
            self.engine.name()
        );

        {
            let mut sessions = lock_mutex_recover(&self.sessions);
            sessions.insert(
                session_id.clone(),
                SessionRecord {
                    session,
                    task: None,
                },
            );
        }

        let task = tokio::spawn(Self::run_session(
            self.sessions.clone(),
            self.hub.clone(),
            self.engine.clone(),
            request,
            session_id.clone(),
        ));

        {
            let mut sessions = lock_mutex_recover(&self.sessions);
            if let Some(record) = sessions.get_mut(&session_id) {
                // Terminated before we got here; the handle still needs
                // aborting since terminate() saw no task to take
                if record.session.state.is_terminal() {
                    task.abort();
                } else {
                    record.task = Some(task);
                }
            }
        }

        ExecuteReceipt {
            session_id,
            conversation_id,
        }
    }

    async fn run_session(
        sessions: Arc<Mutex<HashMap<String, SessionRecord>>>,
        hub: Arc<EventHub>,
        engine: Arc<dyn AssistantEngine>,
        request: EngineRequest,
        session_id: String,
    ) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = {
            let mut run = pin!(engine.run(request, tx));
            loop {
                tokio::select! {
                    res = &mut run => break res,
                    Some(chunk) = rx.recv() => {
                        Self::publish_chunk(&sessions, &hub, &session_id, chunk);
                    }
                }
            }
        };
        // Chunks the engine sent right before finishing
        while let Ok(chunk) = rx.try_recv() {
            Self::publish_chunk(&sessions, &hub, &session_id, chunk);
        }
        Self::finish(&sessions, &hub, &session_id, result);
    }

    fn publish_chunk(
        sessions: &Mutex<HashMap<String, SessionRecord>>,
        hub: &EventHub,
        session_id: &str,
        chunk: String,
    ) {
        let sessions = lock_mutex_recover(sessions);
        let live = sessions
            .get(session_id)
            .map(|r| r.session.state == SessionState::Running)
            .unwrap_or(false);
        if live {
            hub.append_log(
                &Topic::AssistantOutput(session_id.to_string()),
                LogEntry::stdout(chunk),
            );
        }
    }

    fn finish(
        sessions: &Mutex<HashMap<String, SessionRecord>>,
        hub: &EventHub,
        session_id: &str,
        result: anyhow::Result<crate::assistant::engine::EngineOutcome>,
    ) {
        let mut sessions = lock_mutex_recover(sessions);
        let Some(record) = sessions.get_mut(session_id) else {
            return;
        };
        // Terminated sessions already published their terminal event
        if record.session.state.is_terminal() {
            return;
        }
        record.session.finished_at = Some(Utc::now());
        match result {
            Ok(outcome) => {
                log::info!("assistant session {} completed", session_id);
                record.session.state = SessionState::Completed;
                record.session.result = outcome.summary;
            }
            Err(e) => {
                log::error!("assistant session {} failed: {}", session_id, e);
                record.session.state = SessionState::Failed;
                record.session.error = Some(e.to_string());
            }
        }
        hub.publish(
            &Topic::AssistantOutput(session_id.to_string()),
            StreamEvent::SessionComplete {
                state: record.session.state,
                result: record.session.result.clone(),
                error: record.session.error.clone(),
            },
        );
    }

    /// Cancel a running session. Unknown ids and already-finished sessions
    /// are a successful no-op, so racing a natural completion is harmless.
    pub fn terminate(&self, session_id: &str) -> bool {
        let task = {
            let mut sessions = lock_mutex_recover(&self.sessions);
            let Some(record) = sessions.get_mut(session_id) else {
                return false;
            };
            if record.session.state.is_terminal() {
                return false;
            }
            record.session.state = SessionState::Terminated;
            record.session.finished_at = Some(Utc::now());
            self.hub.publish(
                &Topic::AssistantOutput(session_id.to_string()),
                StreamEvent::SessionComplete {
                    state: SessionState::Terminated,
                    result: None,
                    error: None,
                },
            );
            record.task.take()
        };
        log::info!("terminated assistant session {}", session_id);
        // Abort outside the lock; the engine's child dies with the task
        if let Some(task) = task {
            task.abort();
        }
        true
    }

    /// Snapshot of one session's record
    pub fn session(&self, session_id: &str) -> Option<AssistantSession> {
        let sessions = lock_mutex_recover(&self.sessions);
        sessions.get(session_id).map(|r| r.session.clone())
    }

    /// All sessions still in the running state
    pub fn active_sessions(&self) -> Vec<AssistantSession> {
        let sessions = lock_mutex_recover(&self.sessions);
        sessions
            .values()
            .filter(|r| r.session.state == SessionState::Running)
            .map(|r| r.session.clone())
            .collect()
    }

    /// Terminate every running session; used on shutdown
    pub fn terminate_all(&self) -> usize {
        let ids: Vec<String> = {
            let sessions = lock_mutex_recover(&self.sessions);
            sessions
                .iter()
                .filter(|(_, r)| r.session.state == SessionState::Running)
                .map(|(id, _)| id.clone())
                .collect()
        };
        let mut count = 0;
        for id in ids {
            if self.terminate(&id) {
                count += 1;
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::engine::EngineOutcome;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Emits its chunks, then succeeds or fails
    struct ScriptedEngine {
        chunks: Vec<String>,
        fail: bool,
    }

    #[async_trait]
    impl AssistantEngine for ScriptedEngine {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn run(
            &self,
            _request: EngineRequest,
            output: mpsc::UnboundedSender<String>,
        ) -> anyhow::Result<EngineOutcome> {
            for chunk in &self.chunks {
                let _ = output.send(chunk.clone());
                tokio::task::yield_now().await;
            }
            if self.fail {
                Err(anyhow!("engine blew up"))
            } else {
                Ok(EngineOutcome {
                    summary: Some("done".to_string()),
                })
            }
        }
    }

    /// Never finishes on its own; only termination ends it
    struct BlockingEngine;

    #[async_trait]
    impl AssistantEngine for BlockingEngine {
        fn name(&self) -> &'static str {
            "blocking"
        }

        async fn run(
            &self,
            _request: EngineRequest,
            _output: mpsc::UnboundedSender<String>,
        ) -> anyhow::Result<EngineOutcome> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(EngineOutcome::default())
        }
    }

    /// Captures the request it was handed
    struct RecordingEngine {
        seen: Mutex<Option<EngineRequest>>,
    }

    #[async_trait]
    impl AssistantEngine for RecordingEngine {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn run(
            &self,
            request: EngineRequest,
            _output: mpsc::UnboundedSender<String>,
        ) -> anyhow::Result<EngineOutcome> {
            *self.seen.lock().unwrap() = Some(request);
            Ok(EngineOutcome::default())
        }
    }

    fn manager(engine: Arc<dyn AssistantEngine>) -> (AssistantSessionManager, Arc<EventHub>) {
        let hub = Arc::new(EventHub::default());
        (AssistantSessionManager::new(hub.clone(), engine), hub)
    }

    async fn wait_terminal(manager: &AssistantSessionManager, session_id: &str) -> AssistantSession {
        for _ in 0..200 {
            if let Some(session) = manager.session(session_id) {
                if session.state.is_terminal() {
                    return session;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session {} never reached a terminal state", session_id);
    }

    #[tokio::test]
    async fn test_execute_runs_to_completion() {
        let (manager, _hub) = manager(Arc::new(ScriptedEngine {
            chunks: vec!["chunk-1".to_string(), "chunk-2".to_string()],
            fail: false,
        }));
        let receipt = manager.execute("webapp", PathBuf::from("/tmp"), "add tests", None);
        let session = wait_terminal(&manager, &receipt.session_id).await;

        assert_eq!(session.state, SessionState::Completed);
        assert_eq!(session.result.as_deref(), Some("done"));
        assert!(session.finished_at.is_some());
        assert!(session.error.is_none());
    }

    #[tokio::test]
    async fn test_chunks_land_in_replay_buffer() {
        let (manager, hub) = manager(Arc::new(ScriptedEngine {
            chunks: vec!["alpha".to_string(), "beta".to_string()],
            fail: false,
        }));
        let receipt = manager.execute("webapp", PathBuf::from("/tmp"), "go", None);
        wait_terminal(&manager, &receipt.session_id).await;

        let texts: Vec<_> = hub
            .replay(&Topic::AssistantOutput(receipt.session_id), 100)
            .into_iter()
            .map(|e| e.text)
            .collect();
        assert_eq!(texts, vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn test_exactly_one_terminal_event() {
        let (manager, hub) = manager(Arc::new(ScriptedEngine {
            chunks: vec!["out".to_string()],
            fail: false,
        }));
        let receipt = manager.execute("webapp", PathBuf::from("/tmp"), "go", None);
        let mut sub = hub.subscribe(&Topic::AssistantOutput(receipt.session_id.clone()));
        wait_terminal(&manager, &receipt.session_id).await;

        let mut terminals = 0;
        while let Ok(event) = sub.rx.try_recv() {
            if let StreamEvent::SessionComplete { state, .. } = event {
                assert_eq!(state, SessionState::Completed);
                terminals += 1;
            }
        }
        assert_eq!(terminals, 1);
    }

    #[tokio::test]
    async fn test_engine_failure_marks_session_failed() {
        let (manager, _hub) = manager(Arc::new(ScriptedEngine {
            chunks: vec![],
            fail: true,
        }));
        let receipt = manager.execute("webapp", PathBuf::from("/tmp"), "go", None);
        let session = wait_terminal(&manager, &receipt.session_id).await;

        assert_eq!(session.state, SessionState::Failed);
        assert!(session.error.as_deref().unwrap().contains("engine blew up"));
        assert!(session.result.is_none());
    }

    #[tokio::test]
    async fn test_terminate_running_session() {
        let (manager, _hub) = manager(Arc::new(BlockingEngine));
        let receipt = manager.execute("webapp", PathBuf::from("/tmp"), "go", None);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(manager.terminate(&receipt.session_id));
        let session = manager.session(&receipt.session_id).unwrap();
        assert_eq!(session.state, SessionState::Terminated);
        assert!(session.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let (manager, hub) = manager(Arc::new(BlockingEngine));
        let receipt = manager.execute("webapp", PathBuf::from("/tmp"), "go", None);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut sub = hub.subscribe(&Topic::AssistantOutput(receipt.session_id.clone()));

        assert!(manager.terminate(&receipt.session_id));
        assert!(!manager.terminate(&receipt.session_id));
        assert!(!manager.terminate("no-such-session"));

        let mut terminals = 0;
        while let Ok(event) = sub.rx.try_recv() {
            if matches!(event, StreamEvent::SessionComplete { .. }) {
                terminals += 1;
            }
        }
        assert_eq!(terminals, 1);
    }

    #[tokio::test]
    async fn test_terminate_after_completion_is_noop() {
        let (manager, _hub) = manager(Arc::new(ScriptedEngine {
            chunks: vec![],
            fail: false,
        }));
        let receipt = manager.execute("webapp", PathBuf::from("/tmp"), "go", None);
        wait_terminal(&manager, &receipt.session_id).await;

        assert!(!manager.terminate(&receipt.session_id));
        let session = manager.session(&receipt.session_id).unwrap();
        assert_eq!(session.state, SessionState::Completed);
    }

    #[tokio::test]
    async fn test_supplied_conversation_id_resumes() {
        let engine = Arc::new(RecordingEngine {
            seen: Mutex::new(None),
        });
        let (manager, _hub) = manager(engine.clone());
        let receipt = manager.execute(
            "webapp",
            PathBuf::from("/tmp"),
            "continue please",
            Some("c-42".to_string()),
        );
        wait_terminal(&manager, &receipt.session_id).await;

        assert_eq!(receipt.conversation_id, "c-42");
        let seen = engine.seen.lock().unwrap().clone().unwrap();
        assert_eq!(seen.conversation_id, "c-42");
        assert!(seen.resume);
    }

    #[tokio::test]
    async fn test_fresh_conversation_id_when_none_supplied() {
        let engine = Arc::new(RecordingEngine {
            seen: Mutex::new(None),
        });
        let (manager, _hub) = manager(engine.clone());
        let receipt = manager.execute("webapp", PathBuf::from("/tmp"), "go", None);
        wait_terminal(&manager, &receipt.session_id).await;

        assert_ne!(receipt.conversation_id, receipt.session_id);
        let seen = engine.seen.lock().unwrap().clone().unwrap();
        assert!(!seen.resume);
    }

    #[tokio::test]
    async fn test_active_sessions_and_terminate_all() {
        let (manager, _hub) = manager(Arc::new(BlockingEngine));
        let r1 = manager.execute("one", PathBuf::from("/tmp"), "go", None);
        let r2 = manager.execute("two", PathBuf::from("/tmp"), "go", None);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(manager.active_sessions().len(), 2);
        assert_eq!(manager.terminate_all(), 2);
        assert!(manager.active_sessions().is_empty());
        for id in [r1.session_id, r2.session_id] {
            assert_eq!(
                manager.session(&id).unwrap().state,
                SessionState::Terminated
            );
        }
    }

    #[tokio::test]
    async fn test_no_output_after_terminate() {
        // Engine that keeps emitting after a delay
        struct SlowDrip;

        #[async_trait]
        impl AssistantEngine for SlowDrip {
            fn name(&self) -> &'static str {
                "slow-drip"
            }

            async fn run(
                &self,
                _request: EngineRequest,
                output: mpsc::UnboundedSender<String>,
            ) -> anyhow::Result<EngineOutcome> {
                loop {
                    let _ = output.send("drip".to_string());
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
        }

        let (manager, hub) = manager(Arc::new(SlowDrip));
        let receipt = manager.execute("webapp", PathBuf::from("/tmp"), "go", None);
        tokio::time::sleep(Duration::from_millis(30)).await;

        manager.terminate(&receipt.session_id);
        let topic = Topic::AssistantOutput(receipt.session_id.clone());
        let count_at_terminate = hub.replay(&topic, 1000).len();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hub.replay(&topic, 1000).len(), count_at_terminate);
    }
}
