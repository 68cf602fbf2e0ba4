// Clippy allows for reasonable defaults
#![allow(clippy::too_many_arguments)] // Watcher tasks carry their full context
#![allow(clippy::new_without_default)] // Default not always appropriate for stateful types

// Module declarations
pub mod assistant;
pub mod error;
pub mod events;
pub mod hub;
pub mod models;
pub mod procs;
pub mod shutdown;
mod utils;

// Server module (HTTP API)
pub mod server;

// Re-export the core types handlers and callers work with
pub use error::DevdeckError;
pub use hub::{EventHub, StreamEvent, Subscription, Topic};
pub use models::*;
