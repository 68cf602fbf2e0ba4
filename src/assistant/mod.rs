//! AI assistant invocations: engine seam and session tracking

mod engine;
mod manager;

pub use engine::{AssistantEngine, ClaudeCliEngine, EngineOutcome, EngineRequest};
pub use manager::{AssistantSessionManager, ExecuteReceipt};
