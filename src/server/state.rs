//! Server application state shared across handlers

use std::sync::Arc;

use crate::assistant::AssistantSessionManager;
use crate::hub::EventHub;
use crate::procs::ProcessSupervisor;
use crate::shutdown::ShutdownState;

/// Shared state for the server, handed to every route handler
#[derive(Clone)]
pub struct ServerAppState {
    /// Per-topic log buffers and live event fan-out
    pub hub: Arc<EventHub>,

    /// Dev-server process supervisor
    pub supervisor: Arc<ProcessSupervisor>,

    /// Assistant session manager
    pub assistant: Arc<AssistantSessionManager>,

    /// Shutdown state
    pub shutdown_state: ShutdownState,
}

impl ServerAppState {
    pub fn new(
        hub: Arc<EventHub>,
        supervisor: Arc<ProcessSupervisor>,
        assistant: Arc<AssistantSessionManager>,
        shutdown_state: ShutdownState,
    ) -> Self {
        Self {
            hub,
            supervisor,
            assistant,
            shutdown_state,
        }
    }
}
